//! CA profile lookup
//!
//! Profiles are owned by the surrounding platform; the engine only needs to
//! resolve an id to the options that shape order creation and issuance.

use async_trait::async_trait;
use chrono::Duration;
use std::collections::HashMap;

use crate::config::ProfileConfig;

/// Resolved CA profile
#[derive(Debug, Clone)]
pub struct AcmeProfile {
    pub id: String,
    pub skip_dns_ownership_verification: bool,
    pub reuse_valid_authorizations: bool,
    pub order_lifetime: Duration,
    pub authorization_lifetime: Duration,
    pub certificate_lifetime: Duration,
    pub terms_of_service: Option<String>,
    pub website: Option<String>,
}

impl From<&ProfileConfig> for AcmeProfile {
    fn from(config: &ProfileConfig) -> Self {
        Self {
            id: config.id.clone(),
            skip_dns_ownership_verification: config.skip_dns_ownership_verification,
            reuse_valid_authorizations: config.reuse_valid_authorizations,
            order_lifetime: Duration::hours(config.order_lifetime_hours as i64),
            authorization_lifetime: Duration::hours(config.authorization_lifetime_hours as i64),
            certificate_lifetime: Duration::days(config.certificate_lifetime_days as i64),
            terms_of_service: config.terms_of_service.clone(),
            website: config.website.clone(),
        }
    }
}

/// Source of CA profiles
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, profile_id: &str) -> Option<AcmeProfile>;
}

/// Profiles fixed at startup (from the config file)
pub struct StaticProfileStore {
    profiles: HashMap<String, AcmeProfile>,
}

impl StaticProfileStore {
    pub fn new(profiles: impl IntoIterator<Item = AcmeProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|profile| (profile.id.clone(), profile))
                .collect(),
        }
    }

    pub fn from_config(configs: &[ProfileConfig]) -> Self {
        Self::new(configs.iter().map(AcmeProfile::from))
    }
}

#[async_trait]
impl ProfileStore for StaticProfileStore {
    async fn get_profile(&self, profile_id: &str) -> Option<AcmeProfile> {
        self.profiles.get(profile_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_store_lookup() {
        let mut web = ProfileConfig::new("web");
        web.certificate_lifetime_days = 30;
        let store = StaticProfileStore::from_config(&[web, ProfileConfig::new("internal")]);

        let profile = store.get_profile("web").await.unwrap();
        assert_eq!(profile.certificate_lifetime, Duration::days(30));
        assert_eq!(profile.order_lifetime, Duration::hours(24));
        assert!(store.get_profile("internal").await.is_some());
        assert!(store.get_profile("missing").await.is_none());
    }
}
