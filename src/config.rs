//! `DeltaConfig` — every tunable named in `spec.md` §6, loaded the way
//! `akidb_core::config::AkidbConfig` is: a layered `config::Config`
//! builder (defaults, optional file, `DELTAWAL_`-prefixed environment
//! overrides).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DeltaError, Result};

/// Engine tunables. All fields have defaults matching `spec.md` §6.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeltaConfig {
    /// Total bytes the `LogCache` may hold across active + archived
    /// blocks before admission starts backing off new appends.
    pub wal_cache_size_bytes: u64,
    /// Active-block size at which it is archived and handed to the
    /// upload pipeline.
    pub wal_upload_threshold_bytes: u64,
    /// Maximum distinct streams a single block may hold before it is
    /// archived regardless of byte size.
    pub max_streams_per_block: usize,
    /// Concurrent upload tasks the pipeline's upload stage may run.
    pub upload_pool_size: usize,
    /// Number of stripes in the per-stream callback lock array.
    pub stripe_count: usize,
    /// Debounce window `forceUpload` waits out before triggering an
    /// upload, in milliseconds.
    pub force_upload_debounce_millis: u64,
    /// Period of the confirm-offset recompute tick, in milliseconds.
    pub confirm_offset_tick_millis: u64,
    /// Period of the backoff-queue drain tick, in milliseconds.
    pub backoff_drain_tick_millis: u64,
    /// Soft watchdog timeout for block-cache reads, in seconds (logs
    /// only; does not cancel the read).
    pub read_timeout_secs: u64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            wal_cache_size_bytes: 256 * 1024 * 1024,
            wal_upload_threshold_bytes: 16 * 1024 * 1024,
            max_streams_per_block: 1024,
            upload_pool_size: 4,
            stripe_count: 128,
            force_upload_debounce_millis: 500,
            confirm_offset_tick_millis: 100,
            backoff_drain_tick_millis: 100,
            read_timeout_secs: 60,
        }
    }
}

impl DeltaConfig {
    /// Loads configuration by layering, in order: built-in defaults, an
    /// optional config file at `path` (TOML/YAML/JSON by extension), and
    /// `DELTAWAL_`-prefixed environment variables (e.g.
    /// `DELTAWAL_UPLOAD_POOL_SIZE=8`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("DELTAWAL").separator("_"));
        let loaded = builder.build().map_err(|e| DeltaError::Internal(e.to_string()))?;
        loaded.try_deserialize().map_err(|e| DeltaError::Internal(e.to_string()))
    }

    /// `force_upload_debounce_millis` as a `Duration`.
    #[must_use]
    pub fn force_upload_debounce(&self) -> Duration {
        Duration::from_millis(self.force_upload_debounce_millis)
    }

    /// `confirm_offset_tick_millis` as a `Duration`.
    #[must_use]
    pub fn confirm_offset_tick(&self) -> Duration {
        Duration::from_millis(self.confirm_offset_tick_millis)
    }

    /// `backoff_drain_tick_millis` as a `Duration`.
    #[must_use]
    pub fn backoff_drain_tick(&self) -> Duration {
        Duration::from_millis(self.backoff_drain_tick_millis)
    }

    /// `read_timeout_secs` as a `Duration`.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl From<config::ConfigError> for DeltaError {
    fn from(err: config::ConfigError) -> Self {
        DeltaError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_tunables() {
        let cfg = DeltaConfig::default();
        assert_eq!(cfg.upload_pool_size, 4);
        assert_eq!(cfg.stripe_count, 128);
        assert_eq!(cfg.force_upload_debounce_millis, 500);
        assert_eq!(cfg.confirm_offset_tick_millis, 100);
        assert_eq!(cfg.backoff_drain_tick_millis, 100);
        assert_eq!(cfg.read_timeout_secs, 60);
    }

    #[test]
    fn load_with_no_file_falls_back_to_defaults() {
        let cfg = DeltaConfig::load(None).unwrap();
        assert_eq!(cfg, DeltaConfig::default());
    }

    #[test]
    fn environment_override_is_applied() {
        std::env::set_var("DELTAWAL_UPLOAD_POOL_SIZE", "8");
        let cfg = DeltaConfig::load(None).unwrap();
        std::env::remove_var("DELTAWAL_UPLOAD_POOL_SIZE");
        assert_eq!(cfg.upload_pool_size, 8);
    }
}
