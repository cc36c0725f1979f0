//! Configuration schema for the bundle service
//!
//! Configuration is stored at `~/.config/bundle-service/config.toml`

use crate::bundle::BundleTtl;
use crate::coordinator::CoordinatorSettings;
use crate::install::InstallationTtl;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Installation cache settings
    pub installation: InstallationConfig,

    /// Bundle cache settings
    pub bundle: BundleConfig,

    /// Request coordination settings
    pub coordinator: CoordinatorConfig,
}

impl Config {
    /// Check value ranges serde cannot express
    pub fn validate(&self) -> Result<(), String> {
        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            return Err(format!(
                "general.log_format must be \"text\" or \"json\", got \"{}\"",
                self.general.log_format
            ));
        }
        if self.installation.capacity == 0 {
            return Err("installation.capacity must be at least 1".to_string());
        }
        if self.bundle.capacity == 0 {
            return Err("bundle.capacity must be at least 1".to_string());
        }
        if self.coordinator.wait_budget_secs == 0 {
            return Err("coordinator.wait_budget_secs must be at least 1".to_string());
        }
        if self.coordinator.ceiling_secs < self.coordinator.wait_budget_secs {
            return Err("coordinator.ceiling_secs must not be below wait_budget_secs".to_string());
        }
        Ok(())
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Installation cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallationConfig {
    /// Directory that holds one subdirectory per installation
    pub work_dir: PathBuf,

    /// Local package registry laid out as `<name>/<version>/`
    pub registry: PathBuf,

    /// Maximum number of cached installations
    pub capacity: usize,

    /// Lifetime when every dependency is an exact version (default: 7 days)
    pub pinned_ttl_secs: u64,

    /// Lifetime when any dependency is a range (default: 1 hour)
    pub range_ttl_secs: u64,

    /// Random amount up to this many seconds is subtracted from each TTL
    pub jitter_secs: u64,

    /// How long a failed installation is remembered
    pub error_ttl_secs: u64,
}

impl Default for InstallationConfig {
    fn default() -> Self {
        let data = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("bundle-service");
        Self {
            work_dir: data.join("installations"),
            registry: data.join("registry"),
            capacity: 50,
            pinned_ttl_secs: 7 * 24 * 60 * 60,
            range_ttl_secs: 60 * 60,
            jitter_secs: 5 * 60,
            error_ttl_secs: 5,
        }
    }
}

impl InstallationConfig {
    pub fn capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn ttl(&self) -> InstallationTtl {
        InstallationTtl {
            pinned: Duration::from_secs(self.pinned_ttl_secs),
            range: Duration::from_secs(self.range_ttl_secs),
            jitter: Duration::from_secs(self.jitter_secs),
            error: Duration::from_secs(self.error_ttl_secs),
        }
    }
}

/// Bundle cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Maximum number of cached bundles
    pub capacity: usize,

    /// Upper bound on bundle lifetime (default: 1 day)
    pub ttl_secs: u64,

    /// Bundles expire this long before their installation
    pub safety_margin_secs: u64,

    /// How long a failed compilation is remembered
    pub error_ttl_secs: u64,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            ttl_secs: 24 * 60 * 60,
            safety_margin_secs: 60,
            error_ttl_secs: 5,
        }
    }
}

impl BundleConfig {
    pub fn capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn ttl(&self) -> BundleTtl {
        BundleTtl {
            max: Duration::from_secs(self.ttl_secs),
            safety_margin: Duration::from_secs(self.safety_margin_secs),
            error: Duration::from_secs(self.error_ttl_secs),
        }
    }
}

/// Request coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long a single request waits before being redirected
    pub wait_budget_secs: u64,

    /// Total wait across redirects before a build timeout is reported
    pub ceiling_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            wait_budget_secs: 20,
            ceiling_secs: 60,
        }
    }
}

impl CoordinatorConfig {
    pub fn settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            wait_budget: Duration::from_secs(self.wait_budget_secs),
            ceiling: Duration::from_secs(self.ceiling_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[installation]"));
        assert!(toml.contains("[coordinator]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.installation.capacity, 50);
        assert_eq!(config.bundle.capacity, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [coordinator]
            wait_budget_secs = 5
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.coordinator.settings().wait_budget, Duration::from_secs(5));
        assert_eq!(config.coordinator.ceiling_secs, 60); // default preserved
    }

    #[test]
    fn sections_convert_to_runtime_settings() {
        let config = Config::default();
        assert_eq!(config.installation.ttl(), InstallationTtl::default());
        assert_eq!(config.bundle.ttl(), BundleTtl::default());
        assert_eq!(config.coordinator.settings(), CoordinatorSettings::default());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config::default();
        config.bundle.capacity = 0;
        assert!(config.validate().unwrap_err().contains("bundle.capacity"));

        let mut config = Config::default();
        config.coordinator.ceiling_secs = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.general.log_format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
