// ABOUTME: Replicator configuration with defaults and optional TOML file loading
// ABOUTME: Covers API location, system identifier, pacing, retries and the debug profile

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, Result};
use crate::query::{validate_system_identifier, DEFAULT_EXPAND};

pub const DEFAULT_API_BASE_URL: &str = "https://api.mlsgrid.com/v2";
pub const DEFAULT_SYSTEM: &str = "mred";

/// Small pages and a bounded page count for test runs against the live API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugProfile {
    pub page_size: u32,
    pub max_iterations: u32,
}

impl Default for DebugProfile {
    fn default() -> Self {
        Self {
            page_size: 2,
            max_iterations: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    pub api_base_url: String,
    /// OriginatingSystemName to replicate, e.g. "mred"
    pub system: String,
    /// Where cursors and outputs live. Defaults to `.mls-replicator/<system>`.
    pub state_dir: Option<PathBuf>,
    /// Related sub-resources to expand where the resource supports it
    pub expand: Vec<String>,
    /// Page-size hint outside the debug profile. `None` lets the API decide.
    pub page_size: Option<u32>,
    /// Page cap outside the debug profile. `None` follows links to the end.
    pub max_iterations: Option<u32>,
    pub request_interval_ms: u64,
    /// Total attempts per page, including the first one
    pub max_attempts: u32,
    pub request_timeout_secs: u64,
    pub debug: bool,
    pub debug_profile: DebugProfile,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            system: DEFAULT_SYSTEM.to_string(),
            state_dir: None,
            expand: DEFAULT_EXPAND.iter().map(|s| s.to_string()).collect(),
            page_size: None,
            max_iterations: None,
            request_interval_ms: 2_000,
            max_attempts: 3,
            request_timeout_secs: 60,
            debug: false,
            debug_profile: DebugProfile::default(),
        }
    }
}

impl ReplicatorConfig {
    /// Parse a TOML config file. Missing keys keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ReplicationError::persistence(path, e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ReplicationError::Configuration(msg) => {
                ReplicationError::Configuration(format!("{:?}: {}", path, msg))
            }
            other => other,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ReplicatorConfig = toml::from_str(contents)
            .map_err(|e| ReplicationError::Configuration(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_system_identifier(&self.system)?;
        if self.max_attempts == 0 {
            return Err(ReplicationError::Configuration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.page_size == Some(0) || self.debug_profile.page_size == 0 {
            return Err(ReplicationError::Configuration(
                "page size must be positive".to_string(),
            ));
        }
        if self.expand.iter().any(|e| e.trim().is_empty() || e.contains(',')) {
            return Err(ReplicationError::Configuration(
                "expand entries must be single, non-empty relation names".to_string(),
            ));
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".mls-replicator").join(&self.system))
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// `$top` hint for this run.
    pub fn effective_page_size(&self) -> Option<u32> {
        if self.debug {
            Some(self.debug_profile.page_size)
        } else {
            self.page_size
        }
    }

    /// Page cap for this run.
    pub fn effective_max_iterations(&self) -> Option<u32> {
        if self.debug {
            Some(self.debug_profile.max_iterations)
        } else {
            self.max_iterations
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicatorConfig::default();
        assert_eq!(config.api_base_url, "https://api.mlsgrid.com/v2");
        assert_eq!(config.system, "mred");
        assert_eq!(config.expand, vec!["Media", "Rooms", "UnitTypes"]);
        assert_eq!(config.request_interval(), Duration::from_secs(2));
        assert_eq!(config.state_dir(), PathBuf::from(".mls-replicator/mred"));
        assert_eq!(config.effective_page_size(), None);
        assert_eq!(config.effective_max_iterations(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_profile_overrides_paging() {
        let config = ReplicatorConfig {
            debug: true,
            page_size: Some(1000),
            ..ReplicatorConfig::default()
        };
        assert_eq!(config.effective_page_size(), Some(2));
        assert_eq!(config.effective_max_iterations(), Some(2));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ReplicatorConfig::from_toml_str(
            r#"
            system = "actris"
            request_interval_ms = 500
            expand = ["Media"]

            [debug_profile]
            max_iterations = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.system, "actris");
        assert_eq!(config.request_interval(), Duration::from_millis(500));
        assert_eq!(config.expand, vec!["Media"]);
        assert_eq!(config.debug_profile.max_iterations, 5);
        assert_eq!(config.debug_profile.page_size, 2);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_invalid_toml_values() {
        assert!(ReplicatorConfig::from_toml_str("system = \"bad name\"").is_err());
        assert!(ReplicatorConfig::from_toml_str("max_attempts = 0").is_err());
        assert!(ReplicatorConfig::from_toml_str("page_size = 0").is_err());
        assert!(ReplicatorConfig::from_toml_str("expand = [\"Media,Rooms\"]").is_err());
        assert!(ReplicatorConfig::from_toml_str("system = [").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replicator.toml");
        std::fs::write(&path, "system = \"mred\"\ndebug = true\n").unwrap();
        let config = ReplicatorConfig::from_toml_file(&path).unwrap();
        assert!(config.debug);

        assert!(ReplicatorConfig::from_toml_file(&dir.path().join("missing.toml")).is_err());
    }
}
