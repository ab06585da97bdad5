//! # defectgen CLI
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `defectgen map <OUTPUT> --pairs REF DEF ...` | Build the fingerprint → defect image table |
//! | `defectgen serve [--config PATH]` | Start the lookup-and-generate HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Two dataset splits; later pairs win on fingerprint collisions
//! defectgen map data/md5_map.json \
//!     --pairs datasets/train/ref datasets/train/defect \
//!     --pairs datasets/val/ref datasets/val/defect
//!
//! # Serve with an img2img backend
//! SYNTH_URL=http://127.0.0.1:7860 defectgen serve
//! ```

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use defectgen::config;
use defectgen::logging;
use defectgen::mapping::{self, DirPair};
use defectgen::server;

/// defectgen — fingerprint-keyed defect image lookup and synthesis.
#[derive(Parser)]
#[command(name = "defectgen", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the MD5 mapping of reference images to defect images.
    ///
    /// For every file in each reference directory, the defect directory is
    /// searched for the same base name with a `.jpg` or `.png` extension.
    /// Reference files without a match are left out.
    Map {
        /// Path to the output JSON mapping file.
        output: PathBuf,

        /// Reference and defect directory pair. Repeatable.
        #[arg(
            long = "pairs",
            num_args = 2,
            value_names = ["REF_DIR", "DEF_DIR"],
            action = ArgAction::Append,
            required = true
        )]
        pairs: Vec<PathBuf>,
    },

    /// Start the HTTP server.
    ///
    /// Paths default to `data/md5_map.json`, `results/` and `tmp/`, and can be
    /// overridden with `MD5_MAP_PATH`, `RESULT_DIR` and `TMP_DIR`.
    Serve {
        /// Optional TOML configuration file. Environment variables override it.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = logging::init_tracing() {
        eprintln!("Warning: could not initialize logging: {}", e);
    }

    match cli.command {
        Commands::Map { output, pairs } => {
            let pairs: Vec<DirPair> = pairs
                .chunks_exact(2)
                .map(|p| DirPair::new(&p[0], &p[1]))
                .collect();
            mapping::run_build(&output, &pairs)?;
        }
        Commands::Serve { config } => {
            let cfg = config::load_config(config.as_deref())?;
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
