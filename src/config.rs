use crate::models::MetricKind;
use crate::store::StoreConfig;
use serde::Deserialize;

/// Env var that overrides `collector.target_pid`.
pub const TARGET_PID_ENV: &str = "MONITOR_PID";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub collector: CollectorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub session: SessionConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Process to monitor; `MONITOR_PID` wins when set.
    #[serde(default)]
    pub target_pid: Option<u32>,
    pub interval_ms: u64,
    /// Upper bound for one source poll. Defaults to `interval_ms`.
    #[serde(default)]
    pub source_timeout_ms: Option<u64>,
    pub metrics: Vec<MetricKind>,
    /// Also account for descendants of the target (CPU, memory, threads).
    #[serde(default = "default_include_children")]
    pub include_children: bool,
}

fn default_include_children() -> bool {
    true
}

impl CollectorConfig {
    pub fn source_timeout_ms(&self) -> u64 {
        self.source_timeout_ms.unwrap_or(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// SQLite file holding recorded sessions.
    pub path: String,
    pub flush_rate: u64,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

fn default_flush_interval_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// How often to log sampler stats (ticks, skipped ticks, samples, gaps) at INFO level.
    pub stats_log_interval_secs: u64,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Target pid: `MONITOR_PID` if set, else `collector.target_pid`.
    pub fn target_pid(&self) -> anyhow::Result<u32> {
        match std::env::var(TARGET_PID_ENV) {
            Ok(raw) => raw.trim().parse::<u32>().map_err(|e| {
                anyhow::anyhow!("{} must be a process id, got {:?}: {}", TARGET_PID_ENV, raw, e)
            }),
            Err(_) => self.collector.target_pid.ok_or_else(|| {
                anyhow::anyhow!(
                    "no target process: set {} or collector.target_pid",
                    TARGET_PID_ENV
                )
            }),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.collector.interval_ms > 0,
            "collector.interval_ms must be > 0, got {}",
            self.collector.interval_ms
        );
        let timeout = self.collector.source_timeout_ms();
        anyhow::ensure!(
            timeout > 0 && timeout <= self.collector.interval_ms,
            "collector.source_timeout_ms must be between 1 and interval_ms ({}), got {}",
            self.collector.interval_ms,
            timeout
        );
        anyhow::ensure!(
            !self.collector.metrics.is_empty(),
            "collector.metrics must list at least one metric"
        );
        anyhow::ensure!(
            self.store.base_bucket_ms > 0,
            "store.base_bucket_ms must be > 0, got {}",
            self.store.base_bucket_ms
        );
        anyhow::ensure!(
            self.store.branching_factor >= 2,
            "store.branching_factor must be >= 2, got {}",
            self.store.branching_factor
        );
        anyhow::ensure!(
            !self.session.path.is_empty(),
            "session.path must be non-empty"
        );
        anyhow::ensure!(
            self.session.flush_rate > 0,
            "session.flush_rate must be > 0, got {}",
            self.session.flush_rate
        );
        anyhow::ensure!(
            self.session.flush_interval_secs > 0,
            "session.flush_interval_secs must be > 0, got {}",
            self.session.flush_interval_secs
        );
        anyhow::ensure!(
            self.monitoring.stats_log_interval_secs > 0,
            "monitoring.stats_log_interval_secs must be > 0, got {}",
            self.monitoring.stats_log_interval_secs
        );
        Ok(())
    }
}
