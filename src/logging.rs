//! `tracing-subscriber` init, lifted straight from `haysel::core::log`:
//! route `log` records through `tracing` (`LogTracer`), install an
//! `EnvFilter`-driven `FmtSubscriber` as the global default.

use anyhow::Result;
use tracing::metadata::LevelFilter;
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub fn init_logging() -> Result<()> {
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .finish(),
    )?;
    LogTracer::init()?;
    Ok(())
}
