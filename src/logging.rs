//! Structured logging setup.
//!
//! Events go to stderr so the builder's summary on stdout stays parseable.
//! The filter is taken from `DEFECTGEN_LOG`, then `RUST_LOG`, and otherwise
//! defaults to `defectgen=info,tower_http=info`.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "defectgen=info,tower_http=info";

pub fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("DEFECTGEN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()?;

    Ok(())
}
