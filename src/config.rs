//! Configuration management for streamlog

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

/// Stream engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Coordinator root path under which streams live
    pub root: String,
    /// Opaque region identifier stamped into segment metadata
    pub region_id: u32,
    /// Write-path settings
    pub writer: WriterConfig,
    /// Segment rolling policy
    pub rolling: RollingConfig,
    /// Read-path settings
    pub reader: ReaderConfig,
    /// Stream lock settings
    pub lock: LockConfig,
    /// Segment store interaction settings
    pub store: StoreConfig,
}

/// Write-path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Transmit the active buffer once it reaches this many bytes
    pub output_buffer_size: usize,
    /// Flush period in milliseconds; the flusher fires every half period.
    /// Zero disables periodic flushing.
    pub periodic_flush_ms: u64,
    /// Upper bound on a flush-and-sync cycle in milliseconds
    pub flush_timeout_ms: u64,
    /// Fail incoming writes with a not-ready error while a roll is in
    /// flight, instead of queueing them
    pub fail_fast_on_roll: bool,
}

/// Segment rolling policy. A threshold of zero disables that trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingConfig {
    pub enabled: bool,
    /// Roll once a segment holds this many bytes of records
    pub max_segment_bytes: u64,
    /// Roll once a segment holds this many records
    pub max_segment_records: u64,
}

/// Read-path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Enable the read-ahead worker
    pub readahead_enabled: bool,
    /// Initial read-ahead batch, in entries
    pub readahead_batch_size: usize,
    /// Batch growth cap, in entries
    pub readahead_max_batch_size: usize,
    /// Entry cache capacity, in entries
    pub readahead_cache_entries: usize,
    /// Tail poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Warn after this many milliseconds without a delivered record.
    /// Zero disables the warning.
    pub warn_idle_ms: u64,
    /// Fail the reader after this many milliseconds without a delivered
    /// record. Zero disables the check.
    pub error_idle_ms: u64,
}

/// Stream lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock acquisition timeout in milliseconds
    pub acquire_timeout_ms: u64,
}

/// Segment store interaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Attempts at closing a segment handle before giving up
    pub close_retry_budget: u32,
    /// Initial backoff between close retries, doubling per attempt
    pub close_retry_backoff_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            root: "/streamlog".to_string(),
            region_id: 0,
            writer: WriterConfig::default(),
            rolling: RollingConfig::default(),
            reader: ReaderConfig::default(),
            lock: LockConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            output_buffer_size: 16 * 1024, // 16KB
            periodic_flush_ms: 1000,       // 1 second
            flush_timeout_ms: 30_000,      // 30 seconds
            fail_fast_on_roll: false,
        }
    }
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_segment_bytes: 256 * 1024 * 1024, // 256MB
            max_segment_records: 0,
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            readahead_enabled: true,
            readahead_batch_size: 2,
            readahead_max_batch_size: 64,
            readahead_cache_entries: 256,
            poll_interval_ms: 100,
            warn_idle_ms: 120_000, // 2 minutes
            error_idle_ms: 0,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000, // 30 seconds
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            close_retry_budget: 3,
            close_retry_backoff_ms: 100,
        }
    }
}

impl WriterConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl ReaderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl StreamConfig {
    /// Load configuration from the default file location or use defaults
    pub async fn load() -> anyhow::Result<Self> {
        if Path::new("config/streamlog.toml").exists() {
            Self::load_from("config/streamlog.toml").await
        } else {
            let mut config = StreamConfig::default();
            config.apply_env_overrides();
            config.validate_or_default();
            Ok(config)
        }
    }

    /// Load configuration from a specific TOML file
    pub async fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: StreamConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.apply_env_overrides();
        config.validate_or_default();
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub async fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), content).await?;
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok()?.parse().ok()
        }

        if let Some(size) = parse_env("STREAMLOG_OUTPUT_BUFFER_SIZE") {
            self.writer.output_buffer_size = size;
        }
        if let Some(ms) = parse_env("STREAMLOG_PERIODIC_FLUSH_MS") {
            self.writer.periodic_flush_ms = ms;
        }
        if let Some(ms) = parse_env("STREAMLOG_FLUSH_TIMEOUT_MS") {
            self.writer.flush_timeout_ms = ms;
        }
        if let Some(enabled) = parse_env("STREAMLOG_ROLLING_ENABLED") {
            self.rolling.enabled = enabled;
        }
        if let Some(records) = parse_env("STREAMLOG_MAX_SEGMENT_RECORDS") {
            self.rolling.max_segment_records = records;
        }
        if let Some(bytes) = parse_env("STREAMLOG_MAX_SEGMENT_BYTES") {
            self.rolling.max_segment_bytes = bytes;
        }
        if let Some(enabled) = parse_env("STREAMLOG_READAHEAD_ENABLED") {
            self.reader.readahead_enabled = enabled;
        }
        if let Some(ms) = parse_env("STREAMLOG_WARN_IDLE_MS") {
            self.reader.warn_idle_ms = ms;
        }
        if let Some(ms) = parse_env("STREAMLOG_ERROR_IDLE_MS") {
            self.reader.error_idle_ms = ms;
        }
        if let Some(ms) = parse_env("STREAMLOG_LOCK_TIMEOUT_MS") {
            self.lock.acquire_timeout_ms = ms;
        }
        if let Ok(root) = std::env::var("STREAMLOG_ROOT") {
            self.root = root;
        }
    }

    /// Validate each section, falling back to its defaults on bad values
    fn validate_or_default(&mut self) {
        if let Err(e) = self.validate_writer() {
            warn!("invalid writer configuration, using defaults: {e}");
            self.writer = WriterConfig::default();
        }
        if let Err(e) = self.validate_rolling() {
            warn!("invalid rolling configuration, using defaults: {e}");
            self.rolling = RollingConfig::default();
        }
        if let Err(e) = self.validate_reader() {
            warn!("invalid reader configuration, using defaults: {e}");
            self.reader = ReaderConfig::default();
        }
        if let Err(e) = self.validate_lock() {
            warn!("invalid lock configuration, using defaults: {e}");
            self.lock = LockConfig::default();
        }
        if let Err(e) = self.validate_store() {
            warn!("invalid store configuration, using defaults: {e}");
            self.store = StoreConfig::default();
        }
    }

    fn validate_writer(&self) -> Result<(), String> {
        if self.writer.output_buffer_size > crate::record::MAX_TRANSMISSION_SIZE {
            return Err(format!(
                "output buffer of {} bytes exceeds the transmission limit",
                self.writer.output_buffer_size
            ));
        }
        if self.writer.flush_timeout_ms == 0 {
            return Err("flush timeout must be greater than 0".to_string());
        }
        Ok(())
    }

    fn validate_reader(&self) -> Result<(), String> {
        if self.reader.readahead_enabled {
            if self.reader.readahead_batch_size == 0 {
                return Err("read-ahead batch size must be greater than 0".to_string());
            }
            if self.reader.readahead_max_batch_size < self.reader.readahead_batch_size {
                return Err("read-ahead max batch must not be below the initial batch".to_string());
            }
            if self.reader.readahead_cache_entries == 0 {
                return Err("read-ahead cache capacity must be greater than 0".to_string());
            }
        }
        if self.reader.poll_interval_ms == 0 {
            return Err("poll interval must be greater than 0".to_string());
        }
        if self.reader.error_idle_ms > 0
            && self.reader.warn_idle_ms > 0
            && self.reader.error_idle_ms <= self.reader.warn_idle_ms
        {
            return Err("error idle threshold must exceed the warn threshold".to_string());
        }
        Ok(())
    }

    fn validate_rolling(&self) -> Result<(), String> {
        if self.rolling.enabled
            && self.rolling.max_segment_bytes > 0
            && self.rolling.max_segment_bytes < 1024 * 1024
        {
            return Err("segment byte threshold must be at least 1MB".to_string());
        }
        Ok(())
    }

    fn validate_lock(&self) -> Result<(), String> {
        if self.lock.acquire_timeout_ms == 0 {
            return Err("lock acquire timeout must be greater than 0".to_string());
        }
        Ok(())
    }

    fn validate_store(&self) -> Result<(), String> {
        if self.store.close_retry_budget > 10 {
            return Err("close retry budget must not exceed 10".to_string());
        }
        if self.store.close_retry_budget > 0 && self.store.close_retry_backoff_ms == 0 {
            return Err("close retry backoff must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_toml_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("streamlog.toml");
        let mut config = StreamConfig::default();
        config.rolling.max_segment_records = 1000;
        config.save(&path).await.unwrap();

        let loaded = StreamConfig::load_from(&path).await.unwrap();
        assert_eq!(loaded.rolling.max_segment_records, 1000);
        assert_eq!(loaded.writer.output_buffer_size, 16 * 1024);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("streamlog.toml");
        tokio::fs::write(&path, "[writer]\noutput_buffer_size = 4096\n")
            .await
            .unwrap();
        let loaded = StreamConfig::load_from(&path).await.unwrap();
        assert_eq!(loaded.writer.output_buffer_size, 4096);
        assert_eq!(loaded.reader.poll_interval_ms, 100);
    }

    #[test]
    fn test_invalid_sections_fall_back() {
        let mut config = StreamConfig::default();
        config.writer.flush_timeout_ms = 0;
        config.reader.poll_interval_ms = 0;
        config.rolling.max_segment_bytes = 4096;
        config.store.close_retry_backoff_ms = 0;
        config.validate_or_default();
        assert_eq!(config.writer.flush_timeout_ms, 30_000);
        assert_eq!(config.reader.poll_interval_ms, 100);
        assert_eq!(config.rolling.max_segment_bytes, 256 * 1024 * 1024);
        assert_eq!(config.store.close_retry_backoff_ms, 100);
    }

    #[test]
    fn test_valid_sections_pass_unchanged() {
        let mut config = StreamConfig::default();
        config.rolling.max_segment_records = 500;
        config.store.close_retry_budget = 5;
        config.validate_or_default();
        assert_eq!(config.rolling.max_segment_records, 500);
        assert_eq!(config.store.close_retry_budget, 5);
    }
}
