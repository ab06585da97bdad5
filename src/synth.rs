//! Generative collaborator abstraction and implementations.
//!
//! The service treats image synthesis as an opaque call from
//! `(prompt, source image)` to a new image. [`Synthesizer`] is that seam; the
//! server holds an `Arc<dyn Synthesizer>` so tests can substitute a fake.
//!
//! - **[`DisabledSynthesizer`]** — always errors; used when no backend is configured.
//! - **[`SdApiSynthesizer`]** — calls a Stable Diffusion web-UI compatible
//!   `POST /sdapi/v1/img2img` endpoint.
//!
//! Use [`create_synthesizer`] to pick the implementation from configuration.
//! Failures are returned unchanged; there is no retry.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SynthConfig;

/// Opaque image-to-image generator.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Short identifier for logs (e.g. `"sdapi"`).
    fn name(&self) -> &str;

    /// Produce a new image from `prompt` and `source`.
    async fn synthesize(&self, prompt: &str, source: &DynamicImage) -> Result<DynamicImage>;
}

/// Build the synthesizer selected by `config.provider`.
pub fn create_synthesizer(config: &SynthConfig) -> Result<Arc<dyn Synthesizer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledSynthesizer)),
        "sdapi" => Ok(Arc::new(SdApiSynthesizer::new(config)?)),
        other => bail!("Unknown synth provider: {}", other),
    }
}

// ============ Disabled ============

/// Rejects every request. Cache hits still work with this provider.
pub struct DisabledSynthesizer;

#[async_trait]
impl Synthesizer for DisabledSynthesizer {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn synthesize(&self, _prompt: &str, _source: &DynamicImage) -> Result<DynamicImage> {
        bail!("Image synthesis is disabled (set synth.provider or SYNTH_URL)")
    }
}

// ============ Stable Diffusion web API ============

/// Client for the `/sdapi/v1/img2img` endpoint.
pub struct SdApiSynthesizer {
    client: reqwest::Client,
    endpoint: String,
    model: Option<String>,
    steps: Option<u32>,
    denoising_strength: Option<f32>,
}

impl SdApiSynthesizer {
    pub fn new(config: &SynthConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("synth.url required for sdapi provider"))?;

        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        Ok(Self {
            client: builder.build()?,
            endpoint: format!("{}/sdapi/v1/img2img", url.trim_end_matches('/')),
            model: config.model.clone(),
            steps: config.steps,
            denoising_strength: config.denoising_strength,
        })
    }

    fn request_body(&self, prompt: &str, init_image: String) -> serde_json::Value {
        let mut body = serde_json::json!({
            "prompt": prompt,
            "init_images": [init_image],
        });
        if let Some(model) = &self.model {
            body["override_settings"] = serde_json::json!({ "sd_model_checkpoint": model });
        }
        if let Some(steps) = self.steps {
            body["steps"] = steps.into();
        }
        if let Some(strength) = self.denoising_strength {
            body["denoising_strength"] = strength.into();
        }
        body
    }
}

#[async_trait]
impl Synthesizer for SdApiSynthesizer {
    fn name(&self) -> &str {
        "sdapi"
    }

    async fn synthesize(&self, prompt: &str, source: &DynamicImage) -> Result<DynamicImage> {
        let init_image = BASE64.encode(encode_png(source)?);
        let body = self.request_body(prompt, init_image);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("img2img request to {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("img2img API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_img2img_response(&json)
    }
}

/// Decode the first image of an img2img response.
fn parse_img2img_response(json: &serde_json::Value) -> Result<DynamicImage> {
    let first = json
        .get("images")
        .and_then(|i| i.as_array())
        .and_then(|a| a.first())
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid img2img response: missing images array"))?;

    // Some front-ends return data URLs.
    let payload = first
        .split_once("base64,")
        .map(|(_, data)| data)
        .unwrap_or(first);

    let bytes = BASE64
        .decode(payload.trim())
        .context("Invalid img2img response: image is not base64")?;
    image::load_from_memory(&bytes).context("Invalid img2img response: undecodable image")
}

/// Encode an image as PNG bytes.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}
