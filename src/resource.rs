// ABOUTME: Resource kinds served by the MLS Grid API and their wiring registry
// ABOUTME: Maps each kind to its endpoint, expansion support and storage names

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ReplicationError, Result};

/// Category of listing entity that can be replicated.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize, Deserialize,
)]
pub enum ResourceKind {
    Property,
    Member,
    Office,
    #[value(alias = "openhouse")]
    OpenHouse,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Property,
        ResourceKind::Member,
        ResourceKind::Office,
        ResourceKind::OpenHouse,
    ];

    /// Canonical name, used as the URL path segment and the cursor key.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Property => "Property",
            ResourceKind::Member => "Member",
            ResourceKind::Office => "Office",
            ResourceKind::OpenHouse => "OpenHouse",
        }
    }

    /// OpenHouse has no expandable sub-resources upstream.
    pub fn supports_expand(&self) -> bool {
        !matches!(self, ResourceKind::OpenHouse)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ReplicationError;

    fn from_str(value: &str) -> Result<Self> {
        let normalized: String = value
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "property" => Ok(ResourceKind::Property),
            "member" => Ok(ResourceKind::Member),
            "office" => Ok(ResourceKind::Office),
            "openhouse" => Ok(ResourceKind::OpenHouse),
            _ => Err(ReplicationError::Configuration(format!(
                "unknown resource kind '{}'",
                value
            ))),
        }
    }
}

/// Per-kind wiring resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    /// Fully qualified endpoint, without query string.
    pub endpoint: String,
    pub supports_expand: bool,
    pub lock_file: String,
}

#[derive(Debug, Clone)]
pub struct ResourceRegistry {
    specs: BTreeMap<ResourceKind, ResourceSpec>,
}

impl ResourceRegistry {
    /// Build the registry for every known kind against an API base URL.
    pub fn new(api_base_url: &str) -> Result<Self> {
        let base = normalize_base(api_base_url)?;

        let mut specs = BTreeMap::new();
        for kind in ResourceKind::ALL {
            let endpoint = base.join(kind.as_str()).map_err(|e| {
                ReplicationError::Configuration(format!(
                    "cannot derive {} endpoint from '{}': {}",
                    kind, api_base_url, e
                ))
            })?;
            specs.insert(
                kind,
                ResourceSpec {
                    kind,
                    endpoint: endpoint.to_string(),
                    supports_expand: kind.supports_expand(),
                    lock_file: format!("{}.lock", kind.as_str()),
                },
            );
        }

        Ok(Self { specs })
    }

    pub fn get(&self, kind: ResourceKind) -> &ResourceSpec {
        // Every kind is inserted by `new`
        &self.specs[&kind]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.specs.values()
    }
}

/// Parse the base URL and make sure it ends with a slash so `join` appends.
fn normalize_base(api_base_url: &str) -> Result<Url> {
    let trimmed = api_base_url.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };
    let url = Url::parse(&with_slash).map_err(|e| {
        ReplicationError::Configuration(format!("invalid API base URL '{}': {}", api_base_url, e))
    })?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(ReplicationError::Configuration(format!(
            "API base URL '{}' must be an http(s) URL",
            api_base_url
        )));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_accepts_variants() {
        assert_eq!(
            "property".parse::<ResourceKind>().unwrap(),
            ResourceKind::Property
        );
        assert_eq!(
            "OpenHouse".parse::<ResourceKind>().unwrap(),
            ResourceKind::OpenHouse
        );
        assert_eq!(
            "open-house".parse::<ResourceKind>().unwrap(),
            ResourceKind::OpenHouse
        );
        assert!("listing".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_registry_endpoints() {
        let registry = ResourceRegistry::new("https://api.mlsgrid.com/v2").unwrap();
        assert_eq!(
            registry.get(ResourceKind::Property).endpoint,
            "https://api.mlsgrid.com/v2/Property"
        );
        assert_eq!(
            registry.get(ResourceKind::OpenHouse).endpoint,
            "https://api.mlsgrid.com/v2/OpenHouse"
        );
        assert!(!registry.get(ResourceKind::OpenHouse).supports_expand);
        assert!(registry.get(ResourceKind::Member).supports_expand);
        assert_eq!(registry.get(ResourceKind::Office).lock_file, "Office.lock");
        assert_eq!(registry.iter().count(), 4);
    }

    #[test]
    fn test_registry_trailing_slash_is_equivalent() {
        let a = ResourceRegistry::new("https://api.mlsgrid.com/v2").unwrap();
        let b = ResourceRegistry::new("https://api.mlsgrid.com/v2/").unwrap();
        assert_eq!(a.get(ResourceKind::Member), b.get(ResourceKind::Member));
    }

    #[test]
    fn test_registry_rejects_bad_base() {
        assert!(ResourceRegistry::new("not a url").is_err());
        assert!(ResourceRegistry::new("ftp://example.com").is_err());
    }
}
