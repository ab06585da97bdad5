//! Service configuration.
//!
//! Settings come from an optional TOML file and are then overridden by
//! environment variables. Every section is optional; with no file and no
//! environment the service uses relative paths under the working directory.
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `MD5_MAP_PATH` | `paths.map` | `data/md5_map.json` |
//! | `RESULT_DIR` | `paths.results` | `results` |
//! | `TMP_DIR` | `paths.tmp` | `tmp` |
//! | `DEFECTGEN_BIND` | `server.bind` | `0.0.0.0:8000` |
//! | `SYNTH_PROVIDER` | `synth.provider` | `disabled` |
//! | `SYNTH_URL` | `synth.url` | unset |
//! | `SYNTH_MODEL` | `synth.model` | unset |

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::catalog::DefectCatalog;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub synth: SynthConfig,
    #[serde(default)]
    pub defects: DefectCatalog,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Fingerprint map produced by `defectgen map`.
    #[serde(default = "default_map_path")]
    pub map: PathBuf,
    /// Generated images, one `<fingerprint>.png` per input.
    #[serde(default = "default_results_dir")]
    pub results: PathBuf,
    /// Raw uploads, stored under their original file name.
    #[serde(default = "default_tmp_dir")]
    pub tmp: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            map: default_map_path(),
            results: default_results_dir(),
            tmp: default_tmp_dir(),
        }
    }
}

fn default_map_path() -> PathBuf {
    PathBuf::from("data/md5_map.json")
}
fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}
fn default_tmp_dir() -> PathBuf {
    PathBuf::from("tmp")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthConfig {
    /// `disabled` or `sdapi`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Base URL of the image-to-image backend (e.g. `http://127.0.0.1:7860`).
    #[serde(default)]
    pub url: Option<String>,
    /// Checkpoint the backend should load before generating.
    #[serde(default)]
    pub model: Option<String>,
    /// Request timeout. Unset means wait indefinitely.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default)]
    pub denoising_strength: Option<f32>,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            model: None,
            timeout_secs: None,
            steps: None,
            denoising_strength: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}

impl SynthConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl Config {
    /// Apply environment overrides using `lookup` to read variables.
    ///
    /// Takes a lookup function so tests can supply variables without touching
    /// the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MD5_MAP_PATH") {
            self.paths.map = PathBuf::from(v);
        }
        if let Some(v) = get("RESULT_DIR") {
            self.paths.results = PathBuf::from(v);
        }
        if let Some(v) = get("TMP_DIR") {
            self.paths.tmp = PathBuf::from(v);
        }
        if let Some(v) = get("DEFECTGEN_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = get("SYNTH_MODEL") {
            self.synth.model = Some(v);
        }
        if let Some(v) = get("SYNTH_URL") {
            self.synth.url = Some(v);
            if !self.synth.is_enabled() {
                self.synth.provider = "sdapi".to_string();
            }
        }
        if let Some(v) = get("SYNTH_PROVIDER") {
            self.synth.provider = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            bail!("server.bind must not be empty");
        }

        if self.defects.is_empty() {
            bail!("[defects] must define at least one defect type");
        }
        for (code, prompt) in self.defects.prompts() {
            if prompt.trim().is_empty() {
                bail!("defect type {} has an empty prompt", code);
            }
        }

        match self.synth.provider.as_str() {
            "disabled" => {}
            "sdapi" => {
                if self.synth.url.is_none() {
                    bail!("synth.url must be specified when provider is 'sdapi'");
                }
            }
            other => bail!(
                "Unknown synth provider: '{}'. Must be disabled or sdapi.",
                other
            ),
        }

        if let Some(strength) = self.synth.denoising_strength {
            if !(0.0..=1.0).contains(&strength) {
                bail!("synth.denoising_strength must be in [0.0, 1.0]");
            }
        }

        Ok(())
    }
}

/// Parse a TOML config string without applying the environment.
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

/// Load configuration from `path` (if given) plus the process environment.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            parse_config(&content)?
        }
        None => Config::default(),
    };

    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}
