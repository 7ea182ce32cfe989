use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MAX_PARALLELISM: usize = 5;
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Engine settings. Every field has a default, so a TOML file only needs the
/// keys it wants to override.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Upper bound on concurrently downloaded segments.
    pub max_parallelism: usize,
    /// Minimum spacing between two forwarded progress events.
    pub throttle_interval_ms: u64,
    /// Largest slice written to a part file per iteration.
    pub chunk_size: usize,
    /// Capacity of the segment progress channel; the oldest update is dropped on overflow.
    pub progress_buffer: usize,
    /// Capacity of the caller-facing event channel.
    pub event_buffer: usize,
    pub http: HttpConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub request_timeout_secs: u64,
    pub socket_idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub user_agent: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            throttle_interval_ms: DEFAULT_THROTTLE_INTERVAL_MS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_buffer: 100,
            event_buffer: 64,
            http: HttpConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 600,
            socket_idle_timeout_secs: 30,
            connect_timeout_secs: 30,
            max_retries: 1,
            retry_base_delay_ms: 1000,
            user_agent: concat!("rangedl/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DownloaderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: DownloaderConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallelism == 0 {
            bail!("max_parallelism must be at least 1");
        }
        if self.chunk_size == 0 {
            bail!("chunk_size must be at least 1");
        }
        if self.http.socket_idle_timeout_secs == 0 {
            bail!("http.socket_idle_timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_interval_ms)
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn socket_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }
}
