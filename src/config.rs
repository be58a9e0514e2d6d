//! Engine Configuration
//!
//! Tunables for the resource engine. Loaded from YAML or built in code; every
//! field has a default so partial files are accepted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::resources::tile::MAX_ZOOM_LEVEL;

// =============================================================================
// Constants
// =============================================================================

/// Default number of coarser zoom levels searched for fallback imagery
pub const DEFAULT_MAX_MISSING_DATA_ZOOM_SHIFT: u8 = 3;

/// Default maximum distance (in zoom levels) an entry may sit from the active zoom
pub const DEFAULT_MAX_ZOOM_SHIFT: u8 = 3;

/// Default sleep between teardown passes
pub const DEFAULT_TEARDOWN_POLL_INTERVAL_MS: u64 = 1;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the resource engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of fetch worker threads
    pub worker_threads: usize,

    /// Force a single fetch worker regardless of `worker_threads`
    pub single_worker: bool,

    /// How many coarser zoom levels the fallback walk may climb
    pub max_missing_data_zoom_shift: u8,

    /// Entries farther than this from the active zoom are junk
    pub max_zoom_shift: u8,

    /// Default per-call upload budget (`None` = unlimited)
    pub upload_limit_per_sync: Option<usize>,

    /// Call `wait_until_upload_completed()` after each upload batch
    pub sync_uploads_with_gpu_worker: bool,

    /// Sleep between teardown passes, in milliseconds
    pub teardown_poll_interval_ms: u64,

    /// Density factor used to select stub imagery
    pub stub_density_factor: f32,

    /// Spawn the low-priority background worker
    pub background_worker: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            single_worker: false,
            max_missing_data_zoom_shift: DEFAULT_MAX_MISSING_DATA_ZOOM_SHIFT,
            max_zoom_shift: DEFAULT_MAX_ZOOM_SHIFT,
            upload_limit_per_sync: None,
            sync_uploads_with_gpu_worker: false,
            teardown_poll_interval_ms: DEFAULT_TEARDOWN_POLL_INTERVAL_MS,
            stub_density_factor: 1.0,
            background_worker: true,
        }
    }
}

impl EngineConfig {
    /// Config suited to deterministic tests: one worker, no background thread.
    pub fn deterministic() -> Self {
        Self {
            worker_threads: 1,
            single_worker: true,
            background_worker: false,
            ..Default::default()
        }
    }

    /// Load a config from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Effective fetch pool size
    pub fn effective_worker_threads(&self) -> usize {
        if self.single_worker {
            1
        } else {
            self.worker_threads
        }
    }

    /// Teardown poll interval as a `Duration`
    pub fn teardown_poll_interval(&self) -> Duration {
        Duration::from_millis(self.teardown_poll_interval_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(Error::Config("worker_threads must be > 0".into()));
        }
        if self.max_missing_data_zoom_shift > MAX_ZOOM_LEVEL {
            return Err(Error::Config(format!(
                "max_missing_data_zoom_shift must be <= {}",
                MAX_ZOOM_LEVEL
            )));
        }
        if self.max_zoom_shift > MAX_ZOOM_LEVEL {
            return Err(Error::Config(format!(
                "max_zoom_shift must be <= {}",
                MAX_ZOOM_LEVEL
            )));
        }
        if self.upload_limit_per_sync == Some(0) {
            return Err(Error::Config(
                "upload_limit_per_sync must be > 0 when set".into(),
            ));
        }
        if !(self.stub_density_factor > 0.0) {
            return Err(Error::Config("stub_density_factor must be positive".into()));
        }
        Ok(())
    }
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.worker_threads > 0);
        assert_eq!(config.max_zoom_shift, DEFAULT_MAX_ZOOM_SHIFT);
        assert!(config.background_worker);
    }

    #[test]
    fn test_single_worker_overrides_pool_size() {
        let config = EngineConfig {
            worker_threads: 8,
            single_worker: true,
            ..Default::default()
        };
        assert_eq!(config.effective_worker_threads(), 1);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = EngineConfig::from_yaml_str("worker_threads: 2\nmax_zoom_shift: 5\n").unwrap();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.max_zoom_shift, 5);
        assert_eq!(
            config.max_missing_data_zoom_shift,
            DEFAULT_MAX_MISSING_DATA_ZOOM_SHIFT
        );
        assert_eq!(config.upload_limit_per_sync, None);
    }

    #[test]
    fn test_yaml_upload_limit() {
        let config = EngineConfig::from_yaml_str("upload_limit_per_sync: 16").unwrap();
        assert_eq!(config.upload_limit_per_sync, Some(16));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let zero_workers = EngineConfig {
            worker_threads: 0,
            ..Default::default()
        };
        assert!(zero_workers.validate().is_err());

        let huge_shift = EngineConfig {
            max_zoom_shift: 40,
            ..Default::default()
        };
        assert!(huge_shift.validate().is_err());

        let zero_limit = EngineConfig {
            upload_limit_per_sync: Some(0),
            ..Default::default()
        };
        assert!(zero_limit.validate().is_err());

        let bad_density = EngineConfig {
            stub_density_factor: 0.0,
            ..Default::default()
        };
        assert!(bad_density.validate().is_err());
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(EngineConfig::from_yaml_str("worker_threads: [").is_err());
        assert!(EngineConfig::from_yaml_str("worker_threads: 0").is_err());
    }

    #[test]
    fn test_deterministic_config() {
        let config = EngineConfig::deterministic();
        assert_eq!(config.effective_worker_threads(), 1);
        assert!(!config.background_worker);
    }
}
