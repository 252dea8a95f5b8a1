#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use pki_acme_core::config::ProfileConfig;
use pki_acme_core::jose::Jwk;
use pki_acme_core::{
    AcmeProfile, AcmeService, AcmeServiceParts, CertificateIssuer, ChallengeValidator, DbNonceStore,
    Http01Client,
    LocalCaIssuer, MemoryAuditLog, StaticProfileStore, StaticDnsResolver, UrlBuilder, WorkerPool,
    WorkerPoolConfig,
};
use pki_acme_db::sea_orm::DatabaseConnection;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_FIXED_SIGNING};

pub const BASE_URL: &str = "https://acme.test";

/// ES256 account key
pub struct TestKey {
    pair: EcdsaKeyPair,
    rng: SystemRandom,
}

impl TestKey {
    pub fn generate() -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng).unwrap();
        Self { pair, rng }
    }

    pub fn jwk(&self) -> Jwk {
        let point = self.pair.public_key().as_ref();
        Jwk::Ec {
            crv: "P-256".into(),
            x: URL_SAFE_NO_PAD.encode(&point[1..33]),
            y: URL_SAFE_NO_PAD.encode(&point[33..65]),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.pair.sign(&self.rng, message).unwrap().as_ref().to_vec()
    }
}

pub struct Harness {
    pub service: Arc<AcmeService>,
    pub db: DatabaseConnection,
    pub audit: Arc<MemoryAuditLog>,
    pub txt: Arc<StaticDnsResolver>,
    pub profile: AcmeProfile,
    pub pool: WorkerPool,
}

pub struct HarnessOptions {
    pub profile: ProfileConfig,
    pub http_overrides: HashMap<String, String>,
    pub dev_mode: bool,
    pub max_attempts: u32,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            profile: ProfileConfig::new("default"),
            http_overrides: HashMap::new(),
            dev_mode: false,
            max_attempts: 3,
        }
    }
}

pub async fn harness(options: HarnessOptions) -> Harness {
    harness_with_issuer(options, |_| -> Arc<dyn CertificateIssuer> {
        Arc::new(LocalCaIssuer::generate("Test ACME CA").unwrap())
    })
    .await
}

/// Harness whose CA bridge is built from the test database
pub async fn harness_with_issuer<F>(options: HarnessOptions, make_issuer: F) -> Harness
where
    F: FnOnce(DatabaseConnection) -> Arc<dyn CertificateIssuer>,
{
    let db = pki_acme_db::connect("sqlite::memory:").await.unwrap();
    pki_acme_db::migrate(&db).await.unwrap();

    let audit = Arc::new(MemoryAuditLog::new());
    let txt = Arc::new(StaticDnsResolver::new());
    let http = Http01Client::with_overrides(
        Duration::from_secs(2),
        txt.clone(),
        options.dev_mode,
        options.http_overrides,
    )
    .unwrap();
    let validator = Arc::new(ChallengeValidator::new(
        db.clone(),
        audit.clone(),
        http,
        txt.clone(),
        options.max_attempts,
    ));
    let (queue, pool) = WorkerPool::spawn(
        validator,
        WorkerPoolConfig {
            workers: 2,
            backoff_base: Duration::from_millis(20),
            queue_capacity: 64,
        },
    );

    let profile = AcmeProfile::from(&options.profile);
    let service = Arc::new(AcmeService::new(AcmeServiceParts {
        db: db.clone(),
        profiles: Arc::new(StaticProfileStore::from_config(&[options.profile])),
        nonces: Arc::new(DbNonceStore::new(db.clone(), Duration::from_secs(300))),
        queue: Arc::new(queue),
        issuer: make_issuer(db.clone()),
        audit: audit.clone(),
        urls: UrlBuilder::new(BASE_URL),
        dev_mode: options.dev_mode,
    }));

    Harness {
        service,
        db,
        audit,
        txt,
        profile,
        pool,
    }
}

/// A validator outside the worker pool, sharing the harness store and audit log
pub fn direct_validator(
    h: &Harness,
    http_overrides: HashMap<String, String>,
    max_attempts: u32,
) -> ChallengeValidator {
    let http =
        Http01Client::with_overrides(Duration::from_secs(2), h.txt.clone(), false, http_overrides)
            .unwrap();
    ChallengeValidator::new(h.db.clone(), h.audit.clone(), http, h.txt.clone(), max_attempts)
}

/// base64url DER CSR for `names`, CN set to the first
pub fn csr_for(names: &[&str]) -> String {
    let mut params =
        CertificateParams::new(names.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, names[0]);
    params.distinguished_name = dn;
    let key = KeyPair::generate().unwrap();
    URL_SAFE_NO_PAD.encode(params.serialize_request(&key).unwrap().der())
}

/// Poll `check` until it returns true or five seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
