//! JWS request verification
//!
//! Checks run in a fixed order: parse, consume the nonce, then the header
//! constraints, key resolution and signature. The nonce is burned as soon as
//! the header parses, so even a rejected request cannot be replayed.

use pki_acme_db::entities::account;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::sync::Arc;
use tracing::debug;

use crate::error::{AcmeError, AcmeResult};
use crate::jose::{FlattenedJws, Jwk, JwsAlgorithm, ProtectedHeader, SUPPORTED_ALGORITHMS};
use crate::nonce::NonceStore;
use crate::urls::UrlBuilder;

/// How the signing key is located
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Embedded `jwk` (new-account)
    Jwk,
    /// `kid` naming an existing account
    Kid,
}

/// A request whose signature, nonce and URL have been checked
#[derive(Debug, Clone)]
pub struct VerifiedRequest {
    pub header: ProtectedHeader,
    pub alg: JwsAlgorithm,
    pub jwk: Jwk,
    /// Decoded payload; `None` for POST-as-GET
    pub payload: Option<serde_json::Value>,
    /// Authenticated account for `kid` requests
    pub account: Option<account::Model>,
}

impl VerifiedRequest {
    /// Authenticated account, or `unauthorized` for a `jwk` request
    pub fn require_account(&self) -> AcmeResult<&account::Model> {
        self.account
            .as_ref()
            .ok_or_else(|| AcmeError::unauthorized("Request is not bound to an account"))
    }

    /// Deserialize the payload; the empty POST-as-GET payload reads as `{}`
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> AcmeResult<T> {
        let value = self
            .payload
            .clone()
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
        serde_json::from_value(value)
            .map_err(|e| AcmeError::malformed(format!("Invalid request payload: {}", e)))
    }

    pub fn is_post_as_get(&self) -> bool {
        self.payload.is_none()
    }
}

pub struct JwsVerifier {
    db: DatabaseConnection,
    nonces: Arc<dyn NonceStore>,
    urls: UrlBuilder,
}

impl JwsVerifier {
    pub fn new(db: DatabaseConnection, nonces: Arc<dyn NonceStore>, urls: UrlBuilder) -> Self {
        Self { db, nonces, urls }
    }

    /// Verify a flattened JWS sent to `request_url` under `profile_id`
    pub async fn verify(
        &self,
        profile_id: &str,
        request_url: &str,
        body: &[u8],
        source: KeySource,
    ) -> AcmeResult<VerifiedRequest> {
        let jws = FlattenedJws::parse(body)?;
        let header = jws.protected_header()?;

        let nonce = header
            .nonce
            .as_deref()
            .ok_or_else(|| AcmeError::bad_nonce("Missing nonce in protected header"))?;
        if !self.nonces.consume(nonce).await? {
            return Err(AcmeError::bad_nonce("Nonce is invalid, expired or already used"));
        }

        match header.url.as_deref() {
            None => return Err(AcmeError::malformed("Missing url in protected header")),
            Some(url) if url != request_url => {
                return Err(AcmeError::malformed(format!(
                    "Header url {} does not match request url {}",
                    url, request_url
                )))
            }
            Some(_) => {}
        }

        let alg = JwsAlgorithm::from_name(&header.alg).ok_or_else(|| {
            AcmeError::bad_signature_algorithm(
                format!("Unsupported signature algorithm {}", header.alg),
                SUPPORTED_ALGORITHMS,
            )
        })?;

        let (jwk, account) = match (&header.jwk, &header.kid) {
            (Some(_), Some(_)) => {
                return Err(AcmeError::malformed(
                    "Protected header must contain only one of jwk and kid",
                ))
            }
            (None, None) => {
                return Err(AcmeError::malformed(
                    "Protected header must contain one of jwk and kid",
                ))
            }
            (Some(jwk), None) => {
                if source != KeySource::Jwk {
                    return Err(AcmeError::malformed("This request must be signed with kid"));
                }
                (jwk.clone(), None)
            }
            (None, Some(kid)) => {
                if source != KeySource::Kid {
                    return Err(AcmeError::malformed("This request must be signed with jwk"));
                }
                let account = self.resolve_kid(profile_id, kid).await?;
                if account.alg != header.alg {
                    return Err(AcmeError::malformed(format!(
                        "Algorithm {} does not match account algorithm {}",
                        header.alg, account.alg
                    )));
                }
                (Jwk::from_json(&account.public_key)?, Some(account))
            }
        };

        jwk.verify(alg, &jws.signing_input(), &jws.signature_bytes()?)?;
        let payload = jws.payload_json()?;

        debug!(
            url = request_url,
            alg = alg.as_str(),
            account_id = account.as_ref().map(|a| a.id.as_str()),
            "JWS verified"
        );

        Ok(VerifiedRequest {
            header,
            alg,
            jwk,
            payload,
            account,
        })
    }

    async fn resolve_kid(&self, profile_id: &str, kid: &str) -> AcmeResult<account::Model> {
        let account_id = self
            .urls
            .parse_account_url(profile_id, kid)
            .ok_or_else(|| AcmeError::account_does_not_exist("kid is not an account of this profile"))?;

        let account = account::Entity::find_by_id(account_id)
            .filter(account::Column::ProfileId.eq(profile_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| AcmeError::account_does_not_exist("Account does not exist"))?;

        if !account.is_active() {
            return Err(AcmeError::unauthorized("Account has been deactivated"));
        }

        Ok(account)
    }
}
