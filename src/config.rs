//! Tunables named in spec.md §6, with a `Default` giving sane values and a
//! TOML loader built on the `config` crate, in the shape of
//! `haysel::core::config` — a plain `Deserialize` struct plus a thin loader
//! function, smoke-tested against a checked-in example file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_connections_per_session: u32,
    pub max_active_connections_per_session: u32,
    pub max_offline_pack: usize,
    pub max_data_size: usize,
    pub heart_beat_delay_ms: u64,
    pub reading_timeout_ms: u64,
    pub writing_timeout_ms: u64,
    pub busy_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections_per_session: 16,
            max_active_connections_per_session: 8,
            max_offline_pack: 256,
            max_data_size: 1 << 20,
            heart_beat_delay_ms: 10_000,
            reading_timeout_ms: 60_000,
            writing_timeout_ms: 15_000,
            busy_timeout_ms: 5_000,
            idle_timeout_ms: 30_000,
        }
    }
}

impl Config {
    pub fn heart_beat_delay(&self) -> Duration {
        Duration::from_millis(self.heart_beat_delay_ms)
    }

    pub fn reading_timeout(&self) -> Duration {
        Duration::from_millis(self.reading_timeout_ms)
    }

    pub fn writing_timeout(&self) -> Duration {
        Duration::from_millis(self.writing_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&raw)
    }
}
