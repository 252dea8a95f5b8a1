//! ACME problem model (RFC 8555 section 6.7)
//!
//! Every failure the engine reports to a client is an [`AcmeError`]: a problem
//! kind with a fixed type URN and HTTP status, a human readable detail, and the
//! optional extras some kinds carry (subproblems, `instance`, `algorithms`).

use std::fmt;

use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::identifier::Identifier;

const URN_PREFIX: &str = "urn:ietf:params:acme:error:";

/// Canonical ACME error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProblemKind {
    Malformed,
    Unauthorized,
    AccountDoesNotExist,
    BadNonce,
    BadSignatureAlgorithm,
    BadPublicKey,
    BadCsr,
    BadRevocationReason,
    RateLimited,
    RejectedIdentifier,
    ServerInternal,
    UnsupportedContact,
    UnsupportedIdentifier,
    UserActionRequired,
    IncorrectResponse,
    Connection,
    Dns,
    OrderNotReady,
    ExternalAccountRequired,
}

impl ProblemKind {
    const ALL: [ProblemKind; 19] = [
        ProblemKind::Malformed,
        ProblemKind::Unauthorized,
        ProblemKind::AccountDoesNotExist,
        ProblemKind::BadNonce,
        ProblemKind::BadSignatureAlgorithm,
        ProblemKind::BadPublicKey,
        ProblemKind::BadCsr,
        ProblemKind::BadRevocationReason,
        ProblemKind::RateLimited,
        ProblemKind::RejectedIdentifier,
        ProblemKind::ServerInternal,
        ProblemKind::UnsupportedContact,
        ProblemKind::UnsupportedIdentifier,
        ProblemKind::UserActionRequired,
        ProblemKind::IncorrectResponse,
        ProblemKind::Connection,
        ProblemKind::Dns,
        ProblemKind::OrderNotReady,
        ProblemKind::ExternalAccountRequired,
    ];

    /// Short type name, the part after `urn:ietf:params:acme:error:`
    pub fn type_name(&self) -> &'static str {
        match self {
            ProblemKind::Malformed => "malformed",
            ProblemKind::Unauthorized => "unauthorized",
            ProblemKind::AccountDoesNotExist => "accountDoesNotExist",
            ProblemKind::BadNonce => "badNonce",
            ProblemKind::BadSignatureAlgorithm => "badSignatureAlgorithm",
            ProblemKind::BadPublicKey => "badPublicKey",
            ProblemKind::BadCsr => "badCSR",
            ProblemKind::BadRevocationReason => "badRevocationReason",
            ProblemKind::RateLimited => "rateLimited",
            ProblemKind::RejectedIdentifier => "rejectedIdentifier",
            ProblemKind::ServerInternal => "serverInternal",
            ProblemKind::UnsupportedContact => "unsupportedContact",
            ProblemKind::UnsupportedIdentifier => "unsupportedIdentifier",
            ProblemKind::UserActionRequired => "userActionRequired",
            ProblemKind::IncorrectResponse => "incorrectResponse",
            ProblemKind::Connection => "connection",
            ProblemKind::Dns => "dns",
            ProblemKind::OrderNotReady => "orderNotReady",
            ProblemKind::ExternalAccountRequired => "externalAccountRequired",
        }
    }

    /// Full problem type URN
    pub fn urn(&self) -> String {
        format!("{}{}", URN_PREFIX, self.type_name())
    }

    /// Default HTTP status for this kind
    pub fn http_status(&self) -> u16 {
        match self {
            ProblemKind::Unauthorized | ProblemKind::UserActionRequired => 403,
            ProblemKind::AccountDoesNotExist => 404,
            ProblemKind::BadSignatureAlgorithm => 401,
            ProblemKind::RateLimited => 429,
            ProblemKind::ServerInternal => 500,
            _ => 400,
        }
    }

    pub fn from_urn(urn: &str) -> Option<Self> {
        let name = urn.strip_prefix(URN_PREFIX)?;
        Self::ALL.into_iter().find(|kind| kind.type_name() == name)
    }
}

impl fmt::Display for ProblemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Per-identifier detail attached to an aggregate problem
#[derive(Debug, Clone, PartialEq)]
pub struct Subproblem {
    pub kind: ProblemKind,
    pub detail: String,
    pub identifier: Option<Identifier>,
}

impl Subproblem {
    pub fn new(kind: ProblemKind, detail: impl Into<String>, identifier: Identifier) -> Self {
        Self {
            kind,
            detail: detail.into(),
            identifier: Some(identifier),
        }
    }
}

/// An ACME error as surfaced to clients
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {detail}")]
pub struct AcmeError {
    pub kind: ProblemKind,
    pub detail: String,
    /// HTTP status; usually `kind.http_status()`, 404 for absent resources
    pub status: u16,
    pub subproblems: Vec<Subproblem>,
    pub instance: Option<String>,
    /// Supported algorithms, only set for `badSignatureAlgorithm`
    pub algorithms: Vec<String>,
}

pub type AcmeResult<T> = Result<T, AcmeError>;

impl AcmeError {
    pub fn new(kind: ProblemKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            status: kind.http_status(),
            subproblems: Vec::new(),
            instance: None,
            algorithms: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_subproblems(mut self, subproblems: Vec<Subproblem>) -> Self {
        self.subproblems = subproblems;
        self
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::Malformed, detail)
    }

    /// Resource does not exist: `malformed` with HTTP 404
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::malformed(detail).with_status(404)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::Unauthorized, detail)
    }

    pub fn account_does_not_exist(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::AccountDoesNotExist, detail)
    }

    pub fn bad_nonce(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::BadNonce, detail)
    }

    pub fn bad_signature_algorithm(detail: impl Into<String>, supported: &[&str]) -> Self {
        let mut err = Self::new(ProblemKind::BadSignatureAlgorithm, detail);
        err.algorithms = supported.iter().map(|alg| alg.to_string()).collect();
        err
    }

    pub fn bad_public_key(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::BadPublicKey, detail)
    }

    pub fn bad_csr(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::BadCsr, detail)
    }

    pub fn bad_revocation_reason(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::BadRevocationReason, detail)
    }

    pub fn rate_limited(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::RateLimited, detail)
    }

    pub fn rejected_identifier(detail: impl Into<String>, subproblems: Vec<Subproblem>) -> Self {
        Self::new(ProblemKind::RejectedIdentifier, detail).with_subproblems(subproblems)
    }

    pub fn server_internal(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::ServerInternal, detail)
    }

    pub fn unsupported_contact(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::UnsupportedContact, detail)
    }

    pub fn unsupported_identifier(detail: impl Into<String>, subproblems: Vec<Subproblem>) -> Self {
        Self::new(ProblemKind::UnsupportedIdentifier, detail).with_subproblems(subproblems)
    }

    pub fn user_action_required(detail: impl Into<String>, instance: impl Into<String>) -> Self {
        let mut err = Self::new(ProblemKind::UserActionRequired, detail);
        err.instance = Some(instance.into());
        err
    }

    pub fn incorrect_response(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::IncorrectResponse, detail)
    }

    pub fn connection(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::Connection, detail)
    }

    pub fn dns(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::Dns, detail)
    }

    pub fn order_not_ready(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::OrderNotReady, detail)
    }

    pub fn external_account_required(detail: impl Into<String>) -> Self {
        Self::new(ProblemKind::ExternalAccountRequired, detail)
    }

    /// Problem document for this error
    pub fn to_problem(&self) -> Problem {
        Problem {
            problem_type: self.kind.urn(),
            detail: self.detail.clone(),
            status: self.status,
            subproblems: self
                .subproblems
                .iter()
                .map(|sub| SubproblemDocument {
                    problem_type: sub.kind.urn(),
                    detail: sub.detail.clone(),
                    identifier: sub.identifier.clone(),
                })
                .collect(),
            instance: self.instance.clone(),
            algorithms: self.algorithms.clone(),
        }
    }

    /// Problem document as JSON, the form stored on challenges and orders
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.to_problem()).unwrap_or(serde_json::Value::Null)
    }
}

impl From<DbErr> for AcmeError {
    fn from(err: DbErr) -> Self {
        error!(error = %err, "Database error");
        AcmeError::server_internal("Internal server error")
    }
}

/// Wire form of a problem document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub detail: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subproblems: Vec<SubproblemDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub algorithms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubproblemDocument {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urn_round_trip() {
        for kind in ProblemKind::ALL {
            assert_eq!(ProblemKind::from_urn(&kind.urn()), Some(kind));
        }
        assert_eq!(ProblemKind::from_urn("urn:example:other"), None);
    }

    #[test]
    fn test_status_table() {
        assert_eq!(AcmeError::malformed("x").status, 400);
        assert_eq!(AcmeError::unauthorized("x").status, 403);
        assert_eq!(AcmeError::account_does_not_exist("x").status, 404);
        assert_eq!(AcmeError::bad_signature_algorithm("x", &[]).status, 401);
        assert_eq!(AcmeError::rate_limited("x").status, 429);
        assert_eq!(AcmeError::server_internal("x").status, 500);
        assert_eq!(AcmeError::user_action_required("x", "https://tos").status, 403);
        assert_eq!(AcmeError::order_not_ready("x").status, 400);
    }

    #[test]
    fn test_not_found_is_malformed_404() {
        let err = AcmeError::not_found("Order not found");
        assert_eq!(err.kind, ProblemKind::Malformed);
        assert_eq!(err.status, 404);
    }

    #[test]
    fn test_problem_document_shape() {
        let err = AcmeError::rejected_identifier(
            "Invalid identifiers",
            vec![Subproblem::new(
                ProblemKind::RejectedIdentifier,
                "Wildcards are not supported",
                Identifier::dns("*.example.com"),
            )],
        );

        let json = err.to_json();
        assert_eq!(json["type"], "urn:ietf:params:acme:error:rejectedIdentifier");
        assert_eq!(json["status"], 400);
        assert_eq!(json["subproblems"][0]["identifier"]["value"], "*.example.com");
        assert!(json.get("algorithms").is_none());
        assert!(json.get("instance").is_none());
    }

    #[test]
    fn test_bad_signature_algorithm_lists_algorithms() {
        let err = AcmeError::bad_signature_algorithm("HS256 is not supported", &["ES256", "RS256"]);
        let problem = err.to_problem();
        assert_eq!(problem.algorithms, vec!["ES256", "RS256"]);
    }
}
