//! Server configuration file support
//!
//! An optional YAML file describes the CA profiles served under
//! `/acme/profiles/{id}` and the challenge validation settings. Values are
//! handed to constructors; nothing reads configuration globally.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration file format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// CA profiles; a `default` profile is used when none are listed
    #[serde(default = "default_profiles")]
    pub profiles: Vec<ProfileConfig>,

    #[serde(default)]
    pub validation: ValidationConfig,

    /// Lifetime of an issued nonce in seconds
    #[serde(default = "default_nonce_ttl")]
    pub nonce_ttl_seconds: u64,

    /// How often expired nonces are deleted, in seconds
    #[serde(default = "default_nonce_sweep_interval")]
    pub nonce_sweep_interval_seconds: u64,
}

fn default_profiles() -> Vec<ProfileConfig> {
    vec![ProfileConfig::new("default")]
}

fn default_nonce_ttl() -> u64 {
    300
}

fn default_nonce_sweep_interval() -> u64 {
    60
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            profiles: default_profiles(),
            validation: ValidationConfig::default(),
            nonce_ttl_seconds: default_nonce_ttl(),
            nonce_sweep_interval_seconds: default_nonce_sweep_interval(),
        }
    }
}

impl AcmeConfig {
    /// Load and validate a YAML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AcmeConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.profiles.is_empty() {
            return Err(ConfigError::Invalid("at least one profile is required".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for profile in &self.profiles {
            if profile.id.is_empty() || profile.id.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "invalid profile id '{}'",
                    profile.id
                )));
            }
            if !seen.insert(profile.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate profile id '{}'",
                    profile.id
                )));
            }
        }

        if self.validation.max_attempts == 0 {
            return Err(ConfigError::Invalid("validation.max_attempts must be >= 1".into()));
        }
        if self.validation.workers == 0 {
            return Err(ConfigError::Invalid("validation.workers must be >= 1".into()));
        }
        self.validation.resolver_addrs()?;

        Ok(())
    }

    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_seconds)
    }

    pub fn nonce_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.nonce_sweep_interval_seconds)
    }
}

/// One CA profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub id: String,

    /// Create authorizations already valid, with no challenges
    #[serde(default)]
    pub skip_dns_ownership_verification: bool,

    /// Link an existing unexpired valid authorization instead of creating one
    #[serde(default)]
    pub reuse_valid_authorizations: bool,

    #[serde(default = "default_lifetime_hours")]
    pub order_lifetime_hours: u64,

    #[serde(default = "default_lifetime_hours")]
    pub authorization_lifetime_hours: u64,

    /// Certificate validity when the order does not request one
    #[serde(default = "default_certificate_lifetime_days")]
    pub certificate_lifetime_days: u64,

    #[serde(default)]
    pub terms_of_service: Option<String>,

    #[serde(default)]
    pub website: Option<String>,
}

fn default_lifetime_hours() -> u64 {
    24
}

fn default_certificate_lifetime_days() -> u64 {
    47
}

impl ProfileConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            skip_dns_ownership_verification: false,
            reuse_valid_authorizations: false,
            order_lifetime_hours: default_lifetime_hours(),
            authorization_lifetime_hours: default_lifetime_hours(),
            certificate_lifetime_days: default_certificate_lifetime_days(),
            terms_of_service: None,
            website: None,
        }
    }
}

/// Challenge validation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Number of concurrent validation workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Attempts per challenge before it is marked invalid
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before retry `n` is `backoff_base_ms * 2^n`
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Timeout for each HTTP-01 request and DNS lookup
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// DNS servers for DNS-01 lookups (`ip` or `ip:port`); system config if empty
    #[serde(default)]
    pub dns_resolvers: Vec<String>,

    /// Development only: send HTTP-01 requests for an identifier to `host:port`
    #[serde(default)]
    pub dev_host_overrides: HashMap<String, String>,
}

fn default_workers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    2000
}

fn default_timeout_seconds() -> u64 {
    10
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_seconds: default_timeout_seconds(),
            dns_resolvers: Vec::new(),
            dev_host_overrides: HashMap::new(),
        }
    }
}

impl ValidationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Parsed `dns_resolvers`, port 53 when none is given
    pub fn resolver_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.dns_resolvers
            .iter()
            .map(|entry| {
                if let Ok(addr) = entry.parse::<SocketAddr>() {
                    return Ok(addr);
                }
                entry
                    .parse::<IpAddr>()
                    .map(|ip| SocketAddr::new(ip, 53))
                    .map_err(|_| ConfigError::Invalid(format!("invalid DNS resolver '{}'", entry)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AcmeConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.profiles.len(), 1);
        assert_eq!(config.profiles[0].id, "default");
        assert_eq!(config.nonce_ttl(), Duration::from_secs(300));
        assert_eq!(config.validation.workers, 4);
        assert_eq!(config.validation.max_attempts, 3);
        assert_eq!(config.validation.backoff_base(), Duration::from_secs(2));
        assert_eq!(config.validation.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
profiles:
  - id: web
    skip_dns_ownership_verification: true
    certificate_lifetime_days: 30
    terms_of_service: https://example.com/tos
  - id: internal
    reuse_valid_authorizations: true
validation:
  workers: 2
  max_attempts: 5
  dns_resolvers: ["1.1.1.1", "9.9.9.9:5353"]
  dev_host_overrides:
    example.com: 127.0.0.1:8080
nonce_ttl_seconds: 120
"#;
        let config = AcmeConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.profiles.len(), 2);
        assert!(config.profiles[0].skip_dns_ownership_verification);
        assert_eq!(config.profiles[0].certificate_lifetime_days, 30);
        assert_eq!(config.profiles[0].order_lifetime_hours, 24);
        assert!(config.profiles[1].reuse_valid_authorizations);
        assert_eq!(config.validation.max_attempts, 5);
        assert_eq!(config.nonce_ttl_seconds, 120);

        let resolvers = config.validation.resolver_addrs().unwrap();
        assert_eq!(resolvers[0], "1.1.1.1:53".parse().unwrap());
        assert_eq!(resolvers[1], "9.9.9.9:5353".parse().unwrap());
        assert_eq!(
            config.validation.dev_host_overrides.get("example.com").unwrap(),
            "127.0.0.1:8080"
        );
    }

    #[test]
    fn test_rejects_duplicate_profiles() {
        let yaml = "profiles:\n  - id: a\n  - id: a\n";
        assert!(matches!(
            AcmeConfig::from_yaml_str(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_bad_resolver() {
        let yaml = "validation:\n  dns_resolvers: [\"not-an-ip\"]\n";
        assert!(AcmeConfig::from_yaml_str(yaml).is_err());
    }
}
