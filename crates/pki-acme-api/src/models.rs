//! ACME resource representations (RFC 8555 section 7.1)

use chrono::{DateTime, Utc};
use pki_acme_core::authorization::AuthorizationView;
use pki_acme_core::order::OrderView;
use pki_acme_core::{AcmeError, AcmeProfile, Identifier, UrlBuilder};
use pki_acme_db::entities::{account, challenge};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Directory object
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    pub meta: DirectoryMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    pub external_account_required: bool,
}

impl Directory {
    pub fn new(urls: &UrlBuilder, profile: &AcmeProfile) -> Self {
        Self {
            new_nonce: urls.new_nonce(&profile.id),
            new_account: urls.new_account(&profile.id),
            new_order: urls.new_order(&profile.id),
            meta: DirectoryMeta {
                terms_of_service: profile.terms_of_service.clone(),
                website: profile.website.clone(),
                external_account_required: false,
            },
        }
    }
}

/// Flattened JWS request body
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JwsRequest {
    /// base64url protected header
    pub protected: String,
    /// base64url payload; empty for POST-as-GET
    pub payload: String,
    /// base64url signature
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct IdentifierResource {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl From<Identifier> for IdentifierResource {
    fn from(identifier: Identifier) -> Self {
        Self {
            kind: identifier.kind,
            value: identifier.value,
        }
    }
}

/// Account object
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AccountResource {
    /// valid | deactivated
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    /// URL of the account's order list
    pub orders: String,
}

impl AccountResource {
    pub fn new(account: &account::Model, urls: &UrlBuilder) -> Self {
        Self {
            status: match account.status {
                account::AccountStatus::Valid => "valid",
                account::AccountStatus::Deactivated => "deactivated",
            }
            .to_string(),
            contact: account.contact_list(),
            orders: urls.account_orders(&account.profile_id, &account.id),
        }
    }
}

/// Orders list object
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderList {
    pub orders: Vec<String>,
}

/// Order object
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderResource {
    pub status: String,
    pub expires: DateTime<Utc>,
    pub identifiers: Vec<IdentifierResource>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub error: Option<serde_json::Value>,
}

impl OrderResource {
    pub fn new(view: &OrderView, urls: &UrlBuilder) -> Self {
        let order = &view.order;
        let profile_id = order.profile_id.as_str();
        Self {
            status: order.status.as_str().to_string(),
            expires: order.expires_at,
            identifiers: view.identifiers().into_iter().map(Into::into).collect(),
            authorizations: view
                .authorization_ids
                .iter()
                .map(|id| urls.authorization(profile_id, id))
                .collect(),
            finalize: urls.order_finalize(profile_id, &order.id),
            not_before: order.not_before,
            not_after: order.not_after,
            certificate: order
                .certificate_id
                .as_ref()
                .map(|_| urls.order_certificate(profile_id, &order.id)),
            error: order.error.clone(),
        }
    }
}

/// Challenge object
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChallengeResource {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub status: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub error: Option<serde_json::Value>,
}

impl ChallengeResource {
    pub fn new(
        challenge: &challenge::Model,
        token: &str,
        profile_id: &str,
        urls: &UrlBuilder,
    ) -> Self {
        Self {
            kind: challenge.challenge_type.as_str().to_string(),
            url: urls.challenge(profile_id, &challenge.authorization_id, &challenge.id),
            status: challenge.status.as_str().to_string(),
            token: token.to_string(),
            validated: challenge.validated_at,
            error: challenge.error.clone(),
        }
    }
}

/// Authorization object
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthorizationResource {
    pub status: String,
    pub expires: DateTime<Utc>,
    pub identifier: IdentifierResource,
    pub challenges: Vec<ChallengeResource>,
}

impl AuthorizationResource {
    pub fn new(view: &AuthorizationView, profile_id: &str, urls: &UrlBuilder) -> Self {
        let authz = &view.authorization;
        Self {
            status: authz.status.as_str().to_string(),
            expires: authz.expires_at,
            identifier: IdentifierResource {
                kind: authz.identifier_type.clone(),
                value: authz.identifier_value.clone(),
            },
            challenges: view
                .challenges
                .iter()
                .map(|c| ChallengeResource::new(c, &authz.token, profile_id, urls))
                .collect(),
        }
    }
}

/// RFC 7807 problem document with ACME extensions
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDocument {
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

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubproblemDocument {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<IdentifierResource>,
}

impl From<&AcmeError> for ProblemDocument {
    fn from(err: &AcmeError) -> Self {
        let problem = err.to_problem();
        Self {
            problem_type: problem.problem_type,
            detail: problem.detail,
            status: problem.status,
            subproblems: problem
                .subproblems
                .into_iter()
                .map(|sub| SubproblemDocument {
                    problem_type: sub.problem_type,
                    detail: sub.detail,
                    identifier: sub.identifier.map(Into::into),
                })
                .collect(),
            instance: problem.instance,
            algorithms: problem.algorithms,
        }
    }
}
