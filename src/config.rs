//! Configuration management for rvv-runtime.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`RVV_LAZY_SAVE`, `RVV_MEMOP_TIMEOUT_MS`, etc.)
//! 2. Project-local config file (`./rvv-runtime.toml`)
//! 3. User config file (`~/.config/rvv-runtime/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # rvv-runtime.toml
//!
//! # Skip the full save when the outgoing context was used recently
//! lazy_save = true
//! save_threshold_ms = 10
//!
//! # Memory operation completion polling
//! memop_timeout_ms = 1000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::state::SwitchPolicy;
use crate::vmem::PollConfig;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Default number of pre-allocated scratch buffers.
pub const DEFAULT_SCRATCH_POOL_SIZE: usize = 16;

/// Default idle threshold below which a switch may skip the full save.
pub const DEFAULT_SAVE_THRESHOLD_MS: u64 = 10;

/// Default corruption count that activates error recovery.
pub const DEFAULT_CORRUPTION_THRESHOLD: u32 = 3;

/// Default memory-operation completion timeout.
pub const DEFAULT_MEMOP_TIMEOUT_MS: u64 = 1000;

/// rvv-runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Allow a switch to skip saving a recently-used outgoing context.
    pub lazy_save: Option<bool>,

    /// Allow fast register-window rebinds on lazy switches.
    pub fast_switch: Option<bool>,

    /// Idle time (ms) after which a lazy switch falls back to a full save.
    pub save_threshold_ms: Option<u64>,

    /// Number of scratch buffers pre-allocated by the context manager.
    pub scratch_pool_size: Option<usize>,

    /// Corruption detections before new switches are refused.
    pub corruption_threshold: Option<u32>,

    /// Memory-operation completion timeout (ms).
    pub memop_timeout_ms: Option<u64>,

    /// Sleep between status polls (µs); 0 means yield only.
    pub memop_poll_interval_us: Option<u64>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `rvv-runtime.toml`
    /// 3. User config `~/.config/rvv-runtime/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it. The cached value is
    /// never mutated afterwards.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    pub fn lazy_save(&self) -> bool {
        self.lazy_save.unwrap_or(true)
    }

    pub fn fast_switch(&self) -> bool {
        self.fast_switch.unwrap_or(true)
    }

    pub fn save_threshold_ms(&self) -> u64 {
        self.save_threshold_ms.unwrap_or(DEFAULT_SAVE_THRESHOLD_MS)
    }

    /// Scratch pool size, never less than one slot.
    pub fn scratch_pool_size(&self) -> usize {
        self.scratch_pool_size.unwrap_or(DEFAULT_SCRATCH_POOL_SIZE).max(1)
    }

    pub fn corruption_threshold(&self) -> u32 {
        self.corruption_threshold.unwrap_or(DEFAULT_CORRUPTION_THRESHOLD).max(1)
    }

    pub fn memop_timeout_ms(&self) -> u64 {
        self.memop_timeout_ms.unwrap_or(DEFAULT_MEMOP_TIMEOUT_MS)
    }

    pub fn memop_poll_interval_us(&self) -> u64 {
        self.memop_poll_interval_us.unwrap_or(0)
    }

    /// Context-switch policy for the context manager.
    pub fn policy(&self) -> SwitchPolicy {
        SwitchPolicy {
            lazy_save: self.lazy_save(),
            fast_switch: self.fast_switch(),
            save_threshold: Duration::from_millis(self.save_threshold_ms()),
            scratch_pool_size: self.scratch_pool_size(),
            corruption_threshold: self.corruption_threshold(),
        }
    }

    /// Completion-polling parameters for vector memory operations.
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            timeout: Duration::from_millis(self.memop_timeout_ms()),
            poll_interval: Duration::from_micros(self.memop_poll_interval_us()),
        }
    }

    /// Load user configuration from ~/.config/rvv-runtime/config.toml
    fn load_user_config() -> Option<Self> {
        let path = Self::user_config_path()?;
        Self::load_from_file(&path)
    }

    /// Load project-local configuration from ./rvv-runtime.toml
    fn load_local_config() -> Option<Self> {
        let local_path = Path::new("rvv-runtime.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("rvv-runtime.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.lazy_save.is_some() {
            self.lazy_save = other.lazy_save;
        }
        if other.fast_switch.is_some() {
            self.fast_switch = other.fast_switch;
        }
        if other.save_threshold_ms.is_some() {
            self.save_threshold_ms = other.save_threshold_ms;
        }
        if other.scratch_pool_size.is_some() {
            self.scratch_pool_size = other.scratch_pool_size;
        }
        if other.corruption_threshold.is_some() {
            self.corruption_threshold = other.corruption_threshold;
        }
        if other.memop_timeout_ms.is_some() {
            self.memop_timeout_ms = other.memop_timeout_ms;
        }
        if other.memop_poll_interval_us.is_some() {
            self.memop_poll_interval_us = other.memop_poll_interval_us;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from a variable lookup. Unparseable values are logged
    /// and ignored.
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(value) => {
                    log::info!("Using {} from environment: {}", name, raw);
                    Some(value)
                }
                Err(_) => {
                    log::warn!("Ignoring unparseable {}={}", name, raw);
                    None
                }
            }
        }

        if let Some(v) = parsed("RVV_LAZY_SAVE", lookup("RVV_LAZY_SAVE")) {
            self.lazy_save = Some(v);
        }
        if let Some(v) = parsed("RVV_FAST_SWITCH", lookup("RVV_FAST_SWITCH")) {
            self.fast_switch = Some(v);
        }
        if let Some(v) = parsed("RVV_SAVE_THRESHOLD_MS", lookup("RVV_SAVE_THRESHOLD_MS")) {
            self.save_threshold_ms = Some(v);
        }
        if let Some(v) = parsed("RVV_SCRATCH_POOL_SIZE", lookup("RVV_SCRATCH_POOL_SIZE")) {
            self.scratch_pool_size = Some(v);
        }
        if let Some(v) = parsed("RVV_CORRUPTION_THRESHOLD", lookup("RVV_CORRUPTION_THRESHOLD")) {
            self.corruption_threshold = Some(v);
        }
        if let Some(v) = parsed("RVV_MEMOP_TIMEOUT_MS", lookup("RVV_MEMOP_TIMEOUT_MS")) {
            self.memop_timeout_ms = Some(v);
        }
        if let Some(v) = parsed("RVV_MEMOP_POLL_INTERVAL_US", lookup("RVV_MEMOP_POLL_INTERVAL_US")) {
            self.memop_poll_interval_us = Some(v);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("rvv-runtime").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# rvv-runtime configuration
# Place this file at ~/.config/rvv-runtime/config.toml or ./rvv-runtime.toml

# Skip the full register save when the outgoing context was used within
# save_threshold_ms (a fast register-window rebind is done instead)
lazy_save = true
fast_switch = true
save_threshold_ms = 10

# Scratch buffers pre-allocated for staged register-file saves
scratch_pool_size = 16

# Corruption detections before context switches are refused
corruption_threshold = 3

# Vector memory operation completion polling
memop_timeout_ms = 1000
# memop_poll_interval_us = 0
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.lazy_save());
        assert!(config.fast_switch());
        assert_eq!(config.save_threshold_ms(), 10);
        assert_eq!(config.scratch_pool_size(), 16);
        assert_eq!(config.corruption_threshold(), 3);
        assert_eq!(config.memop_timeout_ms(), 1000);
        assert_eq!(config.memop_poll_interval_us(), 0);
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config {
            lazy_save: Some(true),
            save_threshold_ms: Some(5),
            memop_timeout_ms: Some(200),
            ..Default::default()
        };

        let overlay = Config {
            lazy_save: Some(false),
            scratch_pool_size: Some(4),
            ..Default::default()
        };

        base.merge(overlay);

        // Overridden by overlay
        assert_eq!(base.lazy_save, Some(false));
        assert_eq!(base.scratch_pool_size, Some(4));
        // Unchanged (overlay was None)
        assert_eq!(base.save_threshold_ms, Some(5));
        assert_eq!(base.memop_timeout_ms, Some(200));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RVV_LAZY_SAVE", "false"),
            ("RVV_MEMOP_TIMEOUT_MS", "250"),
            ("RVV_SCRATCH_POOL_SIZE", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.lazy_save, Some(false));
        assert_eq!(config.memop_timeout_ms, Some(250));
        // Garbage is ignored, default remains
        assert_eq!(config.scratch_pool_size, None);
        assert_eq!(config.scratch_pool_size(), DEFAULT_SCRATCH_POOL_SIZE);
    }

    #[test]
    fn test_policy_and_poll_config() {
        let config = Config {
            save_threshold_ms: Some(25),
            scratch_pool_size: Some(0),
            memop_timeout_ms: Some(50),
            memop_poll_interval_us: Some(100),
            ..Default::default()
        };

        let policy = config.policy();
        assert_eq!(policy.save_threshold, Duration::from_millis(25));
        // Zero slots is clamped up
        assert_eq!(policy.scratch_pool_size, 1);

        let poll = config.poll_config();
        assert_eq!(poll.timeout, Duration::from_millis(50));
        assert_eq!(poll.poll_interval, Duration::from_micros(100));
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = Config::sample_config();
        let parsed: Config = toml::from_str(&sample).expect("Sample config should parse");
        assert_eq!(parsed.memop_timeout_ms, Some(1000));
        assert_eq!(parsed.memop_poll_interval_us, None);
    }
}
