//! Challenge validation
//!
//! One call to [`ChallengeValidator::validate`] is one attempt. Success and
//! final failure are written back under the authorization's row lock; a
//! non-final failure is reported as [`ValidationOutcome::Retry`] and the
//! worker pool schedules the next attempt.

use async_trait::async_trait;
use chrono::Utc;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use pki_acme_db::entities::{
    account,
    authorization::{self, AuthorizationStatus},
    challenge::{self, ChallengeStatus, ChallengeType},
};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use sea_orm::{DatabaseConnection, EntityTrait, TransactionTrait};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::audit::{AttemptOutcome, AuditEvent, AuditLog};
use crate::error::{AcmeError, AcmeResult};
use crate::identifier::is_private_address;
use crate::jose::{dns01_txt_value, key_authorization, Jwk};
use crate::state;

/// Largest HTTP-01 response body read before giving up
const MAX_HTTP01_BODY: usize = 8 * 1024;

/// A queued validation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationJob {
    pub challenge_id: String,
    /// Zero-based attempt number
    pub attempt: u32,
}

#[derive(Debug)]
pub enum ValidationOutcome {
    Valid,
    /// Attempt failed, another one is allowed
    Retry(AcmeError),
    /// Final attempt failed
    Invalid(AcmeError),
    /// Nothing to do: the challenge is gone or no longer processing
    Skipped,
}

/// HTTP-01 client
///
/// Redirects are not followed; anything but a 200 with the exact key
/// authorization is an incorrect response. Names are resolved through a
/// [`HostResolver`] and refused before dialing when any address is
/// private, unless `allow_private` is set.
pub struct Http01Client {
    client: reqwest::Client,
    overrides: HashMap<String, String>,
}

impl Http01Client {
    pub fn new(
        timeout: Duration,
        hosts: Arc<dyn HostResolver>,
        allow_private: bool,
    ) -> Result<Self, reqwest::Error> {
        Self::with_overrides(timeout, hosts, allow_private, HashMap::new())
    }

    /// `overrides` maps an identifier to the `host:port` actually dialed,
    /// with the identifier still sent as `Host`. Development only; an
    /// override given as an IP literal is dialed without the private
    /// address check.
    pub fn with_overrides(
        timeout: Duration,
        hosts: Arc<dyn HostResolver>,
        allow_private: bool,
        overrides: HashMap<String, String>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .user_agent(concat!("pki-acme/", env!("CARGO_PKG_VERSION")))
            .dns_resolver(Arc::new(GuardedResolve {
                hosts,
                allow_private,
            }))
            .build()?;
        Ok(Self { client, overrides })
    }

    pub async fn check(&self, domain: &str, token: &str, expected: &str) -> AcmeResult<()> {
        let path = format!("/.well-known/acme-challenge/{}", token);
        let request = match self.overrides.get(domain) {
            Some(target) => self
                .client
                .get(format!("http://{}{}", target, path))
                .header(reqwest::header::HOST, domain),
            None => self.client.get(format!("http://{}{}", domain, path)),
        };

        let mut response = request
            .send()
            .await
            .map_err(|e| classify_http_error(domain, &e))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(AcmeError::incorrect_response(format!(
                "HTTP-01 request to {} returned status {}",
                domain,
                status.as_u16()
            )));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify_http_error(domain, &e))?
        {
            body.extend_from_slice(&chunk);
            if body.len() > MAX_HTTP01_BODY {
                return Err(AcmeError::incorrect_response(format!(
                    "HTTP-01 response from {} is too large",
                    domain
                )));
            }
        }

        let body = String::from_utf8_lossy(&body);
        if body.trim_end() != expected {
            return Err(AcmeError::incorrect_response(format!(
                "HTTP-01 response from {} does not match the key authorization",
                domain
            )));
        }

        Ok(())
    }
}

/// A resolved HTTP-01 target that must not be dialed
#[derive(Debug, Error)]
#[error("{host} resolves to private address {addr}")]
pub struct PrivateTargetRefused {
    pub host: String,
    pub addr: IpAddr,
}

/// reqwest resolver that applies the private address check to every
/// name the client dials
struct GuardedResolve {
    hosts: Arc<dyn HostResolver>,
    allow_private: bool,
}

impl Resolve for GuardedResolve {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(guarded_lookup(
            self.hosts.clone(),
            self.allow_private,
            name.as_str().to_string(),
        ))
    }
}

async fn guarded_lookup(
    hosts: Arc<dyn HostResolver>,
    allow_private: bool,
    host: String,
) -> Result<Addrs, Box<dyn std::error::Error + Send + Sync>> {
    let addrs = hosts.lookup_ip(&host).await?;
    if addrs.is_empty() {
        return Err(AcmeError::dns(format!("No addresses found for {}", host)).into());
    }
    if !allow_private {
        if let Some(addr) = addrs.iter().find(|addr| is_private_address(addr)) {
            let addr = *addr;
            return Err(PrivateTargetRefused { host, addr }.into());
        }
    }
    // Port 0 is replaced by the port of the URL
    Ok(Box::new(addrs.into_iter().map(|ip| SocketAddr::new(ip, 0))))
}

fn classify_http_error(domain: &str, err: &reqwest::Error) -> AcmeError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(refused) = e.downcast_ref::<PrivateTargetRefused>() {
            return AcmeError::connection(format!("Refusing to connect: {}", refused));
        }
        source = e.source();
    }

    if err.is_timeout() {
        return AcmeError::connection(format!("Timeout fetching HTTP-01 resource from {}", domain));
    }

    if err.is_connect() {
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(e) = source {
            let message = e.to_string();
            if message.contains("dns error") || message.contains("failed to lookup address") {
                return AcmeError::dns(format!("Could not resolve {}", domain));
            }
            source = e.source();
        }
        return AcmeError::connection(format!("Could not connect to {}", domain));
    }

    if err.is_request() || err.is_body() {
        return AcmeError::connection(format!("Connection to {} failed: {}", domain, err));
    }

    AcmeError::server_internal(format!("HTTP-01 request to {} failed", domain))
}

/// Address lookups for HTTP-01 targets
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup_ip(&self, host: &str) -> AcmeResult<Vec<IpAddr>>;
}

/// TXT record lookups for DNS-01
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// TXT strings at `name`; an empty list when the name has none
    async fn lookup_txt(&self, name: &str) -> AcmeResult<Vec<String>>;
}

pub struct HickoryDnsResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryDnsResolver {
    /// Resolver using `servers`, or the system configuration when empty
    pub fn new(
        servers: &[SocketAddr],
        timeout: Duration,
    ) -> Result<Self, hickory_resolver::error::ResolveError> {
        let (config, mut opts) = if servers.is_empty() {
            hickory_resolver::system_conf::read_system_conf()?
        } else {
            let mut config = ResolverConfig::new();
            for addr in servers {
                config.add_name_server(NameServerConfig::new(*addr, Protocol::Udp));
                config.add_name_server(NameServerConfig::new(*addr, Protocol::Tcp));
            }
            (config, ResolverOpts::default())
        };
        opts.timeout = timeout;
        opts.attempts = 1;
        // A retry must see a freshly published record
        opts.negative_max_ttl = Some(Duration::from_secs(1));
        opts.positive_max_ttl = Some(Duration::from_secs(1));

        Ok(Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        })
    }
}

#[async_trait]
impl TxtResolver for HickoryDnsResolver {
    async fn lookup_txt(&self, name: &str) -> AcmeResult<Vec<String>> {
        let fqdn = format!("{}.", name.trim_end_matches('.'));
        match self.resolver.txt_lookup(fqdn).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part))
                        .collect::<String>()
                })
                .collect()),
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(AcmeError::dns(format!("TXT lookup for {} failed: {}", name, err))),
            },
        }
    }
}

#[async_trait]
impl HostResolver for HickoryDnsResolver {
    async fn lookup_ip(&self, host: &str) -> AcmeResult<Vec<IpAddr>> {
        let fqdn = format!("{}.", host.trim_end_matches('.'));
        match self.resolver.lookup_ip(fqdn).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(AcmeError::dns(format!("Address lookup for {} failed: {}", host, err))),
            },
        }
    }
}

/// In-memory TXT and address records, for tests and local development
#[derive(Default)]
pub struct StaticDnsResolver {
    records: Mutex<HashMap<String, Vec<String>>>,
    hosts: Mutex<HashMap<String, Vec<IpAddr>>>,
}

fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

impl StaticDnsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, values: Vec<String>) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(normalize_name(name), values);
        }
    }

    pub fn set_addrs(&self, host: &str, addrs: Vec<IpAddr>) {
        if let Ok(mut hosts) = self.hosts.lock() {
            hosts.insert(normalize_name(host), addrs);
        }
    }
}

#[async_trait]
impl TxtResolver for StaticDnsResolver {
    async fn lookup_txt(&self, name: &str) -> AcmeResult<Vec<String>> {
        let records = self
            .records
            .lock()
            .map_err(|_| AcmeError::server_internal("TXT record table poisoned"))?;
        Ok(records.get(&normalize_name(name)).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl HostResolver for StaticDnsResolver {
    async fn lookup_ip(&self, host: &str) -> AcmeResult<Vec<IpAddr>> {
        let hosts = self
            .hosts
            .lock()
            .map_err(|_| AcmeError::server_internal("Address table poisoned"))?;
        Ok(hosts.get(&normalize_name(host)).cloned().unwrap_or_default())
    }
}

pub struct ChallengeValidator {
    db: DatabaseConnection,
    audit: Arc<dyn AuditLog>,
    http: Http01Client,
    resolver: Arc<dyn TxtResolver>,
    max_attempts: u32,
}

impl ChallengeValidator {
    pub fn new(
        db: DatabaseConnection,
        audit: Arc<dyn AuditLog>,
        http: Http01Client,
        resolver: Arc<dyn TxtResolver>,
        max_attempts: u32,
    ) -> Self {
        Self {
            db,
            audit,
            http,
            resolver,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run attempt number `retry_count` (zero-based) for a challenge
    pub async fn validate(&self, challenge_id: &str, retry_count: u32) -> AcmeResult<ValidationOutcome> {
        let Some(challenge) = challenge::Entity::find_by_id(challenge_id).one(&self.db).await? else {
            warn!(challenge_id, "Validation job for unknown challenge");
            return Ok(ValidationOutcome::Skipped);
        };
        if challenge.status != ChallengeStatus::Processing {
            debug!(challenge_id, status = challenge.status.as_str(), "Challenge not processing, skipping");
            return Ok(ValidationOutcome::Skipped);
        }

        let authz = authorization::Entity::find_by_id(challenge.authorization_id.as_str())
            .one(&self.db)
            .await?
            .ok_or_else(|| AcmeError::server_internal("Challenge has no authorization"))?;

        if authz.status != AuthorizationStatus::Pending {
            debug!(
                challenge_id,
                authorization_status = authz.status.as_str(),
                "Authorization already settled, skipping"
            );
            return Ok(ValidationOutcome::Skipped);
        }

        let now = Utc::now();
        let expired = authz.is_expired_at(now);
        let attempt = if expired {
            Err(AcmeError::malformed("Authorization has expired"))
        } else {
            self.attempt(&challenge, &authz).await
        };

        match attempt {
            Ok(()) => {
                let txn = self.db.begin().await?;
                let Some((challenge, authz)) = self.reload_processing(&txn, &challenge.id, &authz.id).await? else {
                    txn.commit().await?;
                    return Ok(ValidationOutcome::Skipped);
                };
                let challenge = state::complete_challenge_valid(&txn, challenge, authz, Utc::now()).await?;
                txn.commit().await?;

                info!(challenge_id, challenge_type = challenge.challenge_type.as_str(), "Challenge valid");
                self.record(&challenge, retry_count, AttemptOutcome::Valid, None).await;
                Ok(ValidationOutcome::Valid)
            }
            Err(err) if !expired && retry_count + 1 < self.max_attempts => {
                debug!(challenge_id, retry_count, error = %err, "Challenge attempt failed, will retry");
                self.record(&challenge, retry_count, AttemptOutcome::Retrying, Some(&err)).await;
                Ok(ValidationOutcome::Retry(err))
            }
            Err(err) => {
                let now = Utc::now();
                let txn = self.db.begin().await?;
                let Some((challenge, authz)) = self.reload_processing(&txn, &challenge.id, &authz.id).await? else {
                    txn.commit().await?;
                    return Ok(ValidationOutcome::Skipped);
                };
                let authz = state::expire_authorization_if_due(&txn, authz, now).await?;
                let challenge =
                    state::complete_challenge_invalid(&txn, challenge, authz, err.to_json(), now).await?;
                txn.commit().await?;

                info!(challenge_id, retry_count, error = %err, "Challenge invalid");
                self.record(&challenge, retry_count, AttemptOutcome::Invalid, Some(&err)).await;
                Ok(ValidationOutcome::Invalid(err))
            }
        }
    }

    /// Settle an attempt whose validation or write-back hit a store error
    ///
    /// The attempt is audited either way. On the final attempt the
    /// challenge is failed with `err` so it cannot stay processing.
    pub async fn settle_errored_attempt(
        &self,
        challenge_id: &str,
        retry_count: u32,
        err: AcmeError,
    ) -> ValidationOutcome {
        let challenge_type = match challenge::Entity::find_by_id(challenge_id).one(&self.db).await {
            Ok(Some(challenge)) => challenge.challenge_type.as_str().to_string(),
            _ => "unknown".to_string(),
        };

        if retry_count + 1 < self.max_attempts {
            self.record_for(challenge_id, &challenge_type, retry_count, AttemptOutcome::Retrying, Some(&err))
                .await;
            return ValidationOutcome::Retry(err);
        }

        match self.fail_challenge(challenge_id, &err).await {
            Ok(true) => info!(challenge_id, retry_count, error = %err, "Challenge invalid after store error"),
            Ok(false) => debug!(challenge_id, "Challenge already settled"),
            Err(fail_err) => {
                error!(challenge_id, error = %fail_err, "Failed to mark challenge invalid")
            }
        }
        self.record_for(challenge_id, &challenge_type, retry_count, AttemptOutcome::Invalid, Some(&err))
            .await;
        ValidationOutcome::Invalid(err)
    }

    /// Mark a processing challenge invalid with the authorization cascade;
    /// false when there was nothing left to fail
    async fn fail_challenge(&self, challenge_id: &str, err: &AcmeError) -> AcmeResult<bool> {
        let Some(challenge) = challenge::Entity::find_by_id(challenge_id).one(&self.db).await? else {
            return Ok(false);
        };

        let now = Utc::now();
        let txn = self.db.begin().await?;
        let Some((challenge, authz)) = self
            .reload_processing(&txn, &challenge.id, &challenge.authorization_id)
            .await?
        else {
            txn.commit().await?;
            return Ok(false);
        };
        let authz = state::expire_authorization_if_due(&txn, authz, now).await?;
        state::complete_challenge_invalid(&txn, challenge, authz, err.to_json(), now).await?;
        txn.commit().await?;
        Ok(true)
    }

    /// Lock the authorization and re-read the challenge; `None` if another
    /// writer already settled either of them
    async fn reload_processing(
        &self,
        txn: &sea_orm::DatabaseTransaction,
        challenge_id: &str,
        authz_id: &str,
    ) -> AcmeResult<Option<(challenge::Model, authorization::Model)>> {
        let Some(authz) = state::lock_authorization(txn, authz_id).await? else {
            return Ok(None);
        };
        if authz.status != AuthorizationStatus::Pending {
            return Ok(None);
        }
        let challenge = challenge::Entity::find_by_id(challenge_id).one(txn).await?;
        Ok(challenge
            .filter(|c| c.status == ChallengeStatus::Processing)
            .map(|c| (c, authz)))
    }

    async fn attempt(&self, challenge: &challenge::Model, authz: &authorization::Model) -> AcmeResult<()> {
        let account = account::Entity::find_by_id(authz.account_id.as_str())
            .one(&self.db)
            .await?
            .ok_or_else(|| AcmeError::server_internal("Authorization has no account"))?;
        let jwk = Jwk::from_json(&account.public_key)?;
        let key_auth = key_authorization(&authz.token, &jwk);

        match challenge.challenge_type {
            ChallengeType::Http01 => {
                self.http
                    .check(&authz.identifier_value, &authz.token, &key_auth)
                    .await
            }
            ChallengeType::Dns01 => {
                let name = format!("_acme-challenge.{}", authz.identifier_value);
                let expected = dns01_txt_value(&key_auth);
                let records = self.resolver.lookup_txt(&name).await?;
                if records.iter().any(|record| *record == expected) {
                    Ok(())
                } else if records.is_empty() {
                    Err(AcmeError::incorrect_response(format!("No TXT records found for {}", name)))
                } else {
                    Err(AcmeError::incorrect_response(format!(
                        "No TXT record for {} matches the expected value",
                        name
                    )))
                }
            }
            ChallengeType::TlsAlpn01 => Err(AcmeError::malformed("tls-alpn-01 is not supported")),
        }
    }

    async fn record(
        &self,
        challenge: &challenge::Model,
        retry_count: u32,
        outcome: AttemptOutcome,
        error: Option<&AcmeError>,
    ) {
        self.record_for(&challenge.id, challenge.challenge_type.as_str(), retry_count, outcome, error)
            .await;
    }

    async fn record_for(
        &self,
        challenge_id: &str,
        challenge_type: &str,
        retry_count: u32,
        outcome: AttemptOutcome,
        error: Option<&AcmeError>,
    ) {
        self.audit
            .record(AuditEvent::ChallengeValidation {
                challenge_id: challenge_id.to_string(),
                challenge_type: challenge_type.to_string(),
                retry_count,
                outcome,
                error: error.map(|e| e.to_string()),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProblemKind;

    #[tokio::test]
    async fn test_static_resolver_normalizes_names() {
        let resolver = StaticDnsResolver::new();
        resolver.set("_acme-challenge.Example.com.", vec!["abc".into()]);

        assert_eq!(
            resolver.lookup_txt("_acme-challenge.example.com").await.unwrap(),
            vec!["abc".to_string()]
        );
        assert!(resolver.lookup_txt("other.example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_static_resolver_addresses() {
        let resolver = StaticDnsResolver::new();
        resolver.set_addrs("Internal.Example.com.", vec!["10.1.2.3".parse().unwrap()]);

        assert_eq!(
            resolver.lookup_ip("internal.example.com").await.unwrap(),
            vec!["10.1.2.3".parse::<IpAddr>().unwrap()]
        );
        assert!(resolver.lookup_ip("other.example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_http01_connection_refused() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut overrides = HashMap::new();
        overrides.insert("example.com".to_string(), addr.to_string());
        let client = Http01Client::with_overrides(
            Duration::from_secs(2),
            Arc::new(StaticDnsResolver::new()),
            false,
            overrides,
        )
        .unwrap();

        let err = client.check("example.com", "tok", "tok.thumb").await.unwrap_err();
        assert_eq!(err.kind, ProblemKind::Connection);
        assert!(err.detail.contains("Could not connect"));
    }

    #[tokio::test]
    async fn test_http01_refuses_name_resolving_to_loopback() {
        let hosts = Arc::new(StaticDnsResolver::new());
        hosts.set_addrs("internal.example.com", vec!["127.0.0.1".parse().unwrap()]);
        let client = Http01Client::new(Duration::from_secs(2), hosts, false).unwrap();

        let err = client
            .check("internal.example.com", "tok", "tok.thumb")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProblemKind::Connection);
        assert!(err.detail.contains("private address 127.0.0.1"), "{}", err.detail);
    }

    #[tokio::test]
    async fn test_http01_refuses_mixed_public_and_private_answers() {
        let hosts = Arc::new(StaticDnsResolver::new());
        hosts.set_addrs(
            "mixed.example.com",
            vec!["93.184.216.34".parse().unwrap(), "192.168.1.10".parse().unwrap()],
        );
        let client = Http01Client::new(Duration::from_secs(2), hosts, false).unwrap();

        let err = client.check("mixed.example.com", "tok", "tok.thumb").await.unwrap_err();
        assert_eq!(err.kind, ProblemKind::Connection);
        assert!(err.detail.contains("private address 192.168.1.10"), "{}", err.detail);
    }

    #[tokio::test]
    async fn test_http01_allows_private_answers_when_permitted() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let hosts = Arc::new(StaticDnsResolver::new());
        hosts.set_addrs("internal.example.com", vec!["127.0.0.1".parse().unwrap()]);
        let client = Http01Client::new(Duration::from_secs(2), hosts, true).unwrap();

        // host:port so the dial lands on the closed port
        let err = client
            .check(&format!("internal.example.com:{}", port), "tok", "tok.thumb")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProblemKind::Connection);
        assert!(!err.detail.contains("private address"), "{}", err.detail);
    }

    #[tokio::test]
    async fn test_http01_unknown_name_is_dns_error() {
        let client =
            Http01Client::new(Duration::from_secs(2), Arc::new(StaticDnsResolver::new()), false).unwrap();

        let err = client.check("missing.example.com", "tok", "tok.thumb").await.unwrap_err();
        assert_eq!(err.kind, ProblemKind::Dns);
    }
}
