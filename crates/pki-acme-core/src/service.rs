//! The ACME service facade
//!
//! Holds the collaborators (store, profiles, nonces, validation queue, CA
//! bridge, audit log) and exposes the protocol operations. The operations are
//! implemented in `account`, `order` and `authorization`.

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::audit::AuditLog;
use crate::error::{AcmeError, AcmeResult};
use crate::issuer::CertificateIssuer;
use crate::nonce::NonceStore;
use crate::profile::{AcmeProfile, ProfileStore};
use crate::urls::UrlBuilder;
use crate::verifier::{JwsVerifier, KeySource, VerifiedRequest};
use crate::worker::ValidationQueue;

/// Everything the service needs from its environment
pub struct AcmeServiceParts {
    pub db: DatabaseConnection,
    pub profiles: Arc<dyn ProfileStore>,
    pub nonces: Arc<dyn NonceStore>,
    pub queue: Arc<dyn ValidationQueue>,
    pub issuer: Arc<dyn CertificateIssuer>,
    pub audit: Arc<dyn AuditLog>,
    pub urls: UrlBuilder,
    /// Accept `localhost` identifiers
    pub dev_mode: bool,
}

pub struct AcmeService {
    pub(crate) db: DatabaseConnection,
    pub(crate) profiles: Arc<dyn ProfileStore>,
    pub(crate) nonces: Arc<dyn NonceStore>,
    pub(crate) queue: Arc<dyn ValidationQueue>,
    pub(crate) issuer: Arc<dyn CertificateIssuer>,
    pub(crate) audit: Arc<dyn AuditLog>,
    pub(crate) urls: UrlBuilder,
    pub(crate) dev_mode: bool,
    verifier: JwsVerifier,
}

impl AcmeService {
    pub fn new(parts: AcmeServiceParts) -> Self {
        let verifier = JwsVerifier::new(parts.db.clone(), parts.nonces.clone(), parts.urls.clone());
        Self {
            db: parts.db,
            profiles: parts.profiles,
            nonces: parts.nonces,
            queue: parts.queue,
            issuer: parts.issuer,
            audit: parts.audit,
            urls: parts.urls,
            dev_mode: parts.dev_mode,
            verifier,
        }
    }

    pub fn urls(&self) -> &UrlBuilder {
        &self.urls
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Resolve a profile id; unknown profiles are 404
    pub async fn profile(&self, profile_id: &str) -> AcmeResult<AcmeProfile> {
        self.profiles
            .get_profile(profile_id)
            .await
            .ok_or_else(|| AcmeError::not_found(format!("Profile {} not found", profile_id)))
    }

    pub async fn new_nonce(&self) -> AcmeResult<String> {
        self.nonces.issue().await
    }

    /// Verify a signed request sent to `request_url`
    pub async fn verify(
        &self,
        profile_id: &str,
        request_url: &str,
        body: &[u8],
        source: KeySource,
    ) -> AcmeResult<VerifiedRequest> {
        self.verifier.verify(profile_id, request_url, body, source).await
    }
}
