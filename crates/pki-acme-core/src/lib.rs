//! ACME (RFC 8555) server engine
//!
//! Protocol logic for a multi-profile ACME server: JWS verification, nonces,
//! accounts, orders, authorizations, asynchronous challenge validation and
//! finalize through a pluggable CA bridge. HTTP framing lives in
//! `pki-acme-api`; persistence in `pki-acme-db`.

pub mod account;
pub mod audit;
pub mod authorization;
pub mod config;
pub mod csr;
pub mod error;
pub mod identifier;
pub mod issuer;
pub mod jose;
pub mod nonce;
pub mod order;
pub mod profile;
pub mod service;
pub mod state;
pub mod urls;
pub mod validator;
pub mod verifier;
pub mod worker;

pub use audit::{AuditEvent, AuditLog, MemoryAuditLog, TracingAuditLog};
pub use config::{AcmeConfig, ConfigError, ProfileConfig, ValidationConfig};
pub use error::{AcmeError, AcmeResult, Problem, ProblemKind, Subproblem};
pub use identifier::Identifier;
pub use issuer::{CertificateIssuer, IssuanceError, IssuanceRequest, IssuedCertificate, LocalCaIssuer};
pub use nonce::{spawn_nonce_sweeper, DbNonceStore, NonceStore};
pub use profile::{AcmeProfile, ProfileStore, StaticProfileStore};
pub use service::{AcmeService, AcmeServiceParts};
pub use urls::UrlBuilder;
pub use validator::{
    ChallengeValidator, HickoryDnsResolver, HostResolver, Http01Client, StaticDnsResolver, TxtResolver,
};
pub use verifier::{KeySource, VerifiedRequest};
pub use worker::{ChannelQueue, ValidationQueue, WorkerPool, WorkerPoolConfig};
