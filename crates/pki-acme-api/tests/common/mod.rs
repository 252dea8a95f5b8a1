#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode},
    Router,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use pki_acme_api::{ApiServer, ApiServerConfig};
use pki_acme_core::config::ProfileConfig;
use pki_acme_core::{
    AcmeService, AcmeServiceParts, ChallengeValidator, DbNonceStore, Http01Client, LocalCaIssuer,
    MemoryAuditLog, StaticProfileStore, StaticDnsResolver, UrlBuilder, WorkerPool, WorkerPoolConfig,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde_json::{json, Value};
use tower::ServiceExt;

pub const BASE_URL: &str = "https://acme.test";

pub struct TestServer {
    pub app: Router,
    pub service: Arc<AcmeService>,
    pub audit: Arc<MemoryAuditLog>,
    pub pool: WorkerPool,
}

/// Server with a `default` profile and a `fast` profile that skips DNS checks
pub async fn test_server() -> TestServer {
    let db = pki_acme_db::connect("sqlite::memory:").await.unwrap();
    pki_acme_db::migrate(&db).await.unwrap();

    let mut default = ProfileConfig::new("default");
    default.terms_of_service = Some("https://acme.test/terms".into());
    let mut fast = ProfileConfig::new("fast");
    fast.skip_dns_ownership_verification = true;

    let audit = Arc::new(MemoryAuditLog::new());
    let dns = Arc::new(StaticDnsResolver::new());
    let validator = Arc::new(ChallengeValidator::new(
        db.clone(),
        audit.clone(),
        Http01Client::new(Duration::from_secs(2), dns.clone(), false).unwrap(),
        dns,
        3,
    ));
    let (queue, pool) = WorkerPool::spawn(
        validator,
        WorkerPoolConfig {
            workers: 1,
            backoff_base: Duration::from_millis(20),
            queue_capacity: 16,
        },
    );

    let service = Arc::new(AcmeService::new(AcmeServiceParts {
        db: db.clone(),
        profiles: Arc::new(StaticProfileStore::from_config(&[default, fast])),
        nonces: Arc::new(DbNonceStore::new(db.clone(), Duration::from_secs(300))),
        queue: Arc::new(queue),
        issuer: Arc::new(LocalCaIssuer::generate("Test ACME CA").unwrap()),
        audit: audit.clone(),
        urls: UrlBuilder::new(BASE_URL),
        dev_mode: false,
    }));

    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            enable_cors: false,
        },
        service.clone(),
    );

    TestServer {
        app: server.build_router(),
        service,
        audit,
        pool,
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn location(&self) -> String {
        self.header("location").unwrap()
    }

    pub fn content_type(&self) -> String {
        self.header("content-type").unwrap_or_default()
    }
}

fn path_of(url: &str) -> &str {
    url.strip_prefix(BASE_URL).unwrap_or(url)
}

pub async fn send(app: &Router, method: Method, url: &str, body: Option<Vec<u8>>) -> TestResponse {
    let mut builder = Request::builder().method(method).uri(path_of(url));
    if body.is_some() {
        builder = builder.header("content-type", "application/jose+json");
    }
    let request = builder
        .body(body.map(Body::from).unwrap_or_else(Body::empty))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    TestResponse {
        status,
        headers,
        body,
    }
}

pub async fn fresh_nonce(app: &Router, profile: &str) -> String {
    let url = format!("{}/acme/profiles/{}/new-nonce", BASE_URL, profile);
    send(app, Method::HEAD, &url, None)
        .await
        .header("replay-nonce")
        .unwrap()
}

/// ES256 ACME client key
pub struct TestClient {
    pair: EcdsaKeyPair,
    rng: SystemRandom,
    pub profile: String,
    pub kid: Option<String>,
}

impl TestClient {
    pub fn new(profile: &str) -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng).unwrap();
        Self {
            pair,
            rng,
            profile: profile.to_string(),
            kid: None,
        }
    }

    pub fn profile_url(&self, suffix: &str) -> String {
        format!("{}/acme/profiles/{}/{}", BASE_URL, self.profile, suffix)
    }

    pub fn jwk(&self) -> Value {
        let point = self.pair.public_key().as_ref();
        json!({
            "kty": "EC",
            "crv": "P-256",
            "x": URL_SAFE_NO_PAD.encode(&point[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&point[33..65]),
        })
    }

    /// Flattened JWS; `payload` None is POST-as-GET
    pub fn sign(&self, url: &str, nonce: &str, payload: Option<&Value>) -> Vec<u8> {
        let mut protected = json!({"alg": "ES256", "nonce": nonce, "url": url});
        match &self.kid {
            Some(kid) => protected["kid"] = json!(kid),
            None => protected["jwk"] = self.jwk(),
        }
        let protected = URL_SAFE_NO_PAD.encode(protected.to_string());
        let payload = payload
            .map(|p| URL_SAFE_NO_PAD.encode(p.to_string()))
            .unwrap_or_default();
        let signing_input = format!("{}.{}", protected, payload);
        let signature = self.pair.sign(&self.rng, signing_input.as_bytes()).unwrap();

        serde_json::to_vec(&json!({
            "protected": protected,
            "payload": payload,
            "signature": URL_SAFE_NO_PAD.encode(signature.as_ref()),
        }))
        .unwrap()
    }

    /// Sign with a fresh nonce and POST to `url`
    pub async fn post(&self, app: &Router, url: &str, payload: Option<&Value>) -> TestResponse {
        let nonce = fresh_nonce(app, &self.profile).await;
        send(app, Method::POST, url, Some(self.sign(url, &nonce, payload))).await
    }

    /// Register and remember the account URL as `kid`
    pub async fn register(&mut self, app: &Router) -> TestResponse {
        let url = self.profile_url("new-account");
        let response = self
            .post(
                app,
                &url,
                Some(&json!({"contact": ["mailto:a@example.com"], "termsOfServiceAgreed": true})),
            )
            .await;
        self.kid = response.header("location");
        response
    }
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
