//! ACME endpoint handlers
//!
//! Every handler resolves the profile, verifies the JWS against the URL the
//! resource lives at, calls into the service and renders the result. All
//! responses, problems included, leave through [`respond`], which attaches a
//! fresh `Replay-Nonce` and the directory `Link`.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use pki_acme_core::account::{AccountUpdatePayload, NewAccountPayload};
use pki_acme_core::authorization::{AuthorizationUpdatePayload, AuthorizationView};
use pki_acme_core::order::{FinalizePayload, NewOrderPayload};
use pki_acme_core::verifier::VerifiedRequest;
use pki_acme_core::{AcmeError, AcmeResult, KeySource};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};
use utoipa::OpenApi;

use crate::models::*;
use crate::{ApiDoc, AppState};

pub const JOSE_CONTENT_TYPE: &str = "application/jose+json";
pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";
pub const PEM_CHAIN_CONTENT_TYPE: &str = "application/pem-certificate-chain";
const REPLAY_NONCE: &str = "replay-nonce";

enum ReplyBody {
    Json(serde_json::Value),
    Pem(String),
    Empty,
}

/// A successful ACME response before the common headers are added
pub struct AcmeReply {
    status: StatusCode,
    body: ReplyBody,
    location: Option<String>,
    up: Option<String>,
}

impl AcmeReply {
    fn json<T: Serialize>(status: StatusCode, body: &T) -> AcmeResult<Self> {
        let value = serde_json::to_value(body)
            .map_err(|e| AcmeError::server_internal(format!("Failed to encode response: {}", e)))?;
        Ok(Self {
            status,
            body: ReplyBody::Json(value),
            location: None,
            up: None,
        })
    }

    fn empty(status: StatusCode) -> Self {
        Self {
            status,
            body: ReplyBody::Empty,
            location: None,
            up: None,
        }
    }

    fn pem(chain: String) -> Self {
        Self {
            status: StatusCode::OK,
            body: ReplyBody::Pem(chain),
            location: None,
            up: None,
        }
    }

    fn with_location(mut self, location: String) -> Self {
        self.location = Some(location);
        self
    }

    fn with_up(mut self, up: String) -> Self {
        self.up = Some(up);
        self
    }

    fn into_response(self) -> Response {
        let mut response = match self.body {
            ReplyBody::Json(value) => (self.status, Json(value)).into_response(),
            ReplyBody::Pem(chain) => (
                self.status,
                [(header::CONTENT_TYPE, PEM_CHAIN_CONTENT_TYPE)],
                chain,
            )
                .into_response(),
            ReplyBody::Empty => self.status.into_response(),
        };

        let headers = response.headers_mut();
        if let Some(location) = self.location.and_then(|l| HeaderValue::from_str(&l).ok()) {
            headers.insert(header::LOCATION, location);
        }
        if let Some(up) = self
            .up
            .and_then(|u| HeaderValue::from_str(&format!("<{}>;rel=\"up\"", u)).ok())
        {
            headers.append(header::LINK, up);
        }
        response
    }
}

fn problem_response(err: &AcmeError) -> Response {
    if err.status >= 500 {
        error!(kind = %err.kind, detail = %err.detail, "ACME request failed");
    } else {
        debug!(kind = %err.kind, detail = %err.detail, "ACME request rejected");
    }

    let status = StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, PROBLEM_CONTENT_TYPE)],
        Json(ProblemDocument::from(err)),
    )
        .into_response()
}

/// Render a handler result with `Replay-Nonce`, `Link: rel="index"` and
/// `Cache-Control: no-store`
async fn respond(state: &AppState, profile_id: &str, result: AcmeResult<AcmeReply>) -> Response {
    let mut response = match result {
        Ok(reply) => reply.into_response(),
        Err(err) => problem_response(&err),
    };

    let headers = response.headers_mut();
    match state.service.new_nonce().await {
        Ok(nonce) => {
            if let Ok(value) = HeaderValue::from_str(&nonce) {
                headers.insert(REPLAY_NONCE, value);
            }
        }
        Err(err) => warn!(error = %err, "Failed to issue nonce for response"),
    }

    let index = format!("<{}>;rel=\"index\"", state.service.urls().directory(profile_id));
    if let Ok(value) = HeaderValue::from_str(&index) {
        headers.append(header::LINK, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    response
}

fn check_content_type(headers: &HeaderMap) -> AcmeResult<()> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    if !media_type.eq_ignore_ascii_case(JOSE_CONTENT_TYPE) {
        return Err(AcmeError::malformed(format!(
            "Content-Type must be {}",
            JOSE_CONTENT_TYPE
        )));
    }
    Ok(())
}

/// Resolve the profile and verify a signed request sent to `url`
async fn verified(
    state: &AppState,
    profile_id: &str,
    url: String,
    headers: &HeaderMap,
    body: &Bytes,
    source: KeySource,
) -> AcmeResult<VerifiedRequest> {
    check_content_type(headers)?;
    state.service.verify(profile_id, &url, body, source).await
}

fn authorization_reply(state: &AppState, profile_id: &str, view: &AuthorizationView) -> AcmeResult<AcmeReply> {
    AcmeReply::json(
        StatusCode::OK,
        &AuthorizationResource::new(view, profile_id, state.service.urls()),
    )
}

/// Get the directory of a CA profile
#[utoipa::path(
    get,
    path = "/acme/profiles/{profile_id}/directory",
    params(("profile_id" = String, Path, description = "CA profile id")),
    responses(
        (status = 200, description = "ACME directory", body = Directory),
        (status = 404, description = "Unknown profile", body = ProblemDocument)
    ),
    tag = "directory"
)]
pub async fn directory(State(state): State<Arc<AppState>>, Path(profile_id): Path<String>) -> Response {
    let result: AcmeResult<AcmeReply> = async {
        let profile = state.service.profile(&profile_id).await?;
        AcmeReply::json(StatusCode::OK, &Directory::new(state.service.urls(), &profile))
    }
    .await;
    respond(&state, &profile_id, result).await
}

/// Fetch a fresh nonce (HEAD)
#[utoipa::path(
    head,
    path = "/acme/profiles/{profile_id}/new-nonce",
    params(("profile_id" = String, Path, description = "CA profile id")),
    responses((status = 200, description = "Nonce in the Replay-Nonce header")),
    tag = "directory"
)]
pub async fn new_nonce_head(State(state): State<Arc<AppState>>, Path(profile_id): Path<String>) -> Response {
    let result = state
        .service
        .profile(&profile_id)
        .await
        .map(|_| AcmeReply::empty(StatusCode::OK));
    respond(&state, &profile_id, result).await
}

/// Fetch a fresh nonce (GET)
#[utoipa::path(
    get,
    path = "/acme/profiles/{profile_id}/new-nonce",
    params(("profile_id" = String, Path, description = "CA profile id")),
    responses((status = 204, description = "Nonce in the Replay-Nonce header")),
    tag = "directory"
)]
pub async fn new_nonce_get(State(state): State<Arc<AppState>>, Path(profile_id): Path<String>) -> Response {
    let result = state
        .service
        .profile(&profile_id)
        .await
        .map(|_| AcmeReply::empty(StatusCode::NO_CONTENT));
    respond(&state, &profile_id, result).await
}

/// Register an account, or look up the account for this key
#[utoipa::path(
    post,
    path = "/acme/profiles/{profile_id}/new-account",
    params(("profile_id" = String, Path, description = "CA profile id")),
    request_body(content = JwsRequest, content_type = "application/jose+json"),
    responses(
        (status = 201, description = "Account created", body = AccountResource),
        (status = 200, description = "Existing account", body = AccountResource),
        (status = 400, description = "Rejected request", body = ProblemDocument)
    ),
    tag = "accounts"
)]
pub async fn new_account(
    State(state): State<Arc<AppState>>,
    Path(profile_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result: AcmeResult<AcmeReply> = async {
        let profile = state.service.profile(&profile_id).await?;
        let urls = state.service.urls();
        let request = verified(
            &state,
            &profile.id,
            urls.new_account(&profile.id),
            &headers,
            &body,
            KeySource::Jwk,
        )
        .await?;
        let payload: NewAccountPayload = request.payload_as()?;

        let lookup = state
            .service
            .create_or_fetch_account(&profile.id, &request.jwk, request.alg, payload)
            .await?;
        let status = if lookup.created {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        };
        Ok(AcmeReply::json(status, &AccountResource::new(&lookup.account, urls))?
            .with_location(urls.account(&profile.id, &lookup.account.id)))
    }
    .await;
    respond(&state, &profile_id, result).await
}

/// The account in `request` must be the one named by the URL
fn require_same_account<'a>(
    request: &'a VerifiedRequest,
    account_id: &str,
) -> AcmeResult<&'a pki_acme_db::entities::account::Model> {
    let account = request.require_account()?;
    if account.id != account_id {
        return Err(AcmeError::unauthorized("Request signed by a different account"));
    }
    Ok(account)
}

/// Read, update or deactivate an account
#[utoipa::path(
    post,
    path = "/acme/profiles/{profile_id}/accounts/{account_id}",
    params(
        ("profile_id" = String, Path, description = "CA profile id"),
        ("account_id" = String, Path, description = "Account id")
    ),
    request_body(content = JwsRequest, content_type = "application/jose+json"),
    responses(
        (status = 200, description = "Account", body = AccountResource),
        (status = 403, description = "Not this account", body = ProblemDocument)
    ),
    tag = "accounts"
)]
pub async fn account(
    State(state): State<Arc<AppState>>,
    Path((profile_id, account_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result: AcmeResult<AcmeReply> = async {
        let profile = state.service.profile(&profile_id).await?;
        let urls = state.service.urls();
        let url = urls.account(&profile.id, &account_id);
        let request = verified(&state, &profile.id, url.clone(), &headers, &body, KeySource::Kid).await?;
        let account = require_same_account(&request, &account_id)?;
        let payload: AccountUpdatePayload = request.payload_as()?;

        let updated = state.service.update_account(account, payload).await?;
        Ok(AcmeReply::json(StatusCode::OK, &AccountResource::new(&updated, urls))?.with_location(url))
    }
    .await;
    respond(&state, &profile_id, result).await
}

/// List the account's orders
#[utoipa::path(
    post,
    path = "/acme/profiles/{profile_id}/accounts/{account_id}/orders",
    params(
        ("profile_id" = String, Path, description = "CA profile id"),
        ("account_id" = String, Path, description = "Account id")
    ),
    request_body(content = JwsRequest, content_type = "application/jose+json"),
    responses((status = 200, description = "Order URLs", body = OrderList)),
    tag = "accounts"
)]
pub async fn account_orders(
    State(state): State<Arc<AppState>>,
    Path((profile_id, account_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result: AcmeResult<AcmeReply> = async {
        let profile = state.service.profile(&profile_id).await?;
        let urls = state.service.urls();
        let request = verified(
            &state,
            &profile.id,
            urls.account_orders(&profile.id, &account_id),
            &headers,
            &body,
            KeySource::Kid,
        )
        .await?;
        let account = require_same_account(&request, &account_id)?;

        let orders = state
            .service
            .list_order_ids(account)
            .await?
            .iter()
            .map(|id| urls.order(&profile.id, id))
            .collect();
        AcmeReply::json(StatusCode::OK, &OrderList { orders })
    }
    .await;
    respond(&state, &profile_id, result).await
}

/// Create an order
#[utoipa::path(
    post,
    path = "/acme/profiles/{profile_id}/new-order",
    params(("profile_id" = String, Path, description = "CA profile id")),
    request_body(content = JwsRequest, content_type = "application/jose+json"),
    responses(
        (status = 201, description = "Order created", body = OrderResource),
        (status = 400, description = "Rejected identifiers", body = ProblemDocument)
    ),
    tag = "orders"
)]
pub async fn new_order(
    State(state): State<Arc<AppState>>,
    Path(profile_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result: AcmeResult<AcmeReply> = async {
        let profile = state.service.profile(&profile_id).await?;
        let urls = state.service.urls();
        let request = verified(
            &state,
            &profile.id,
            urls.new_order(&profile.id),
            &headers,
            &body,
            KeySource::Kid,
        )
        .await?;
        let account = request.require_account()?;
        let payload: NewOrderPayload = request.payload_as()?;

        let view = state.service.create_order(&profile, account, payload).await?;
        Ok(AcmeReply::json(StatusCode::CREATED, &OrderResource::new(&view, urls))?
            .with_location(urls.order(&profile.id, &view.order.id)))
    }
    .await;
    respond(&state, &profile_id, result).await
}

/// Read an order
#[utoipa::path(
    post,
    path = "/acme/profiles/{profile_id}/orders/{order_id}",
    params(
        ("profile_id" = String, Path, description = "CA profile id"),
        ("order_id" = String, Path, description = "Order id")
    ),
    request_body(content = JwsRequest, content_type = "application/jose+json"),
    responses(
        (status = 200, description = "Order", body = OrderResource),
        (status = 404, description = "Order not found", body = ProblemDocument)
    ),
    tag = "orders"
)]
pub async fn order(
    State(state): State<Arc<AppState>>,
    Path((profile_id, order_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result: AcmeResult<AcmeReply> = async {
        let profile = state.service.profile(&profile_id).await?;
        let urls = state.service.urls();
        let request = verified(
            &state,
            &profile.id,
            urls.order(&profile.id, &order_id),
            &headers,
            &body,
            KeySource::Kid,
        )
        .await?;
        let account = request.require_account()?;

        let view = state.service.get_order(account, &order_id).await?;
        AcmeReply::json(StatusCode::OK, &OrderResource::new(&view, urls))
    }
    .await;
    respond(&state, &profile_id, result).await
}

/// Finalize a ready order with a CSR
#[utoipa::path(
    post,
    path = "/acme/profiles/{profile_id}/orders/{order_id}/finalize",
    params(
        ("profile_id" = String, Path, description = "CA profile id"),
        ("order_id" = String, Path, description = "Order id")
    ),
    request_body(content = JwsRequest, content_type = "application/jose+json"),
    responses(
        (status = 200, description = "Order after finalize", body = OrderResource),
        (status = 400, description = "Order not ready or bad CSR", body = ProblemDocument)
    ),
    tag = "orders"
)]
pub async fn finalize_order(
    State(state): State<Arc<AppState>>,
    Path((profile_id, order_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result: AcmeResult<AcmeReply> = async {
        let profile = state.service.profile(&profile_id).await?;
        let urls = state.service.urls();
        let request = verified(
            &state,
            &profile.id,
            urls.order_finalize(&profile.id, &order_id),
            &headers,
            &body,
            KeySource::Kid,
        )
        .await?;
        let account = request.require_account()?;
        let payload: FinalizePayload = request.payload_as()?;

        let view = state
            .service
            .finalize_order(&profile, account, &order_id, payload)
            .await?;
        Ok(AcmeReply::json(StatusCode::OK, &OrderResource::new(&view, urls))?
            .with_location(urls.order(&profile.id, &order_id)))
    }
    .await;
    respond(&state, &profile_id, result).await
}

/// Download the certificate chain of a valid order
#[utoipa::path(
    post,
    path = "/acme/profiles/{profile_id}/orders/{order_id}/certificate",
    params(
        ("profile_id" = String, Path, description = "CA profile id"),
        ("order_id" = String, Path, description = "Order id")
    ),
    request_body(content = JwsRequest, content_type = "application/jose+json"),
    responses(
        (status = 200, description = "PEM chain, leaf first", content_type = "application/pem-certificate-chain", body = String),
        (status = 400, description = "No certificate yet", body = ProblemDocument)
    ),
    tag = "orders"
)]
pub async fn certificate(
    State(state): State<Arc<AppState>>,
    Path((profile_id, order_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result: AcmeResult<AcmeReply> = async {
        let profile = state.service.profile(&profile_id).await?;
        let urls = state.service.urls();
        let request = verified(
            &state,
            &profile.id,
            urls.order_certificate(&profile.id, &order_id),
            &headers,
            &body,
            KeySource::Kid,
        )
        .await?;
        let account = request.require_account()?;

        let chain = state.service.download_certificate(account, &order_id).await?;
        Ok(AcmeReply::pem(chain))
    }
    .await;
    respond(&state, &profile_id, result).await
}

/// Read or deactivate an authorization
#[utoipa::path(
    post,
    path = "/acme/profiles/{profile_id}/authorizations/{authz_id}",
    params(
        ("profile_id" = String, Path, description = "CA profile id"),
        ("authz_id" = String, Path, description = "Authorization id")
    ),
    request_body(content = JwsRequest, content_type = "application/jose+json"),
    responses(
        (status = 200, description = "Authorization", body = AuthorizationResource),
        (status = 404, description = "Authorization not found", body = ProblemDocument)
    ),
    tag = "authorizations"
)]
pub async fn authorization(
    State(state): State<Arc<AppState>>,
    Path((profile_id, authz_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result: AcmeResult<AcmeReply> = async {
        let profile = state.service.profile(&profile_id).await?;
        let request = verified(
            &state,
            &profile.id,
            state.service.urls().authorization(&profile.id, &authz_id),
            &headers,
            &body,
            KeySource::Kid,
        )
        .await?;
        let account = request.require_account()?;
        let payload: AuthorizationUpdatePayload = request.payload_as()?;

        let view = state
            .service
            .update_authorization(account, &authz_id, payload)
            .await?;
        authorization_reply(&state, &profile.id, &view)
    }
    .await;
    respond(&state, &profile_id, result).await
}

/// Read a challenge (POST-as-GET) or signal that it is ready (`{}`)
#[utoipa::path(
    post,
    path = "/acme/profiles/{profile_id}/authorizations/{authz_id}/challenges/{challenge_id}",
    params(
        ("profile_id" = String, Path, description = "CA profile id"),
        ("authz_id" = String, Path, description = "Authorization id"),
        ("challenge_id" = String, Path, description = "Challenge id")
    ),
    request_body(content = JwsRequest, content_type = "application/jose+json"),
    responses(
        (status = 200, description = "Challenge", body = ChallengeResource),
        (status = 400, description = "Challenge cannot be validated", body = ProblemDocument)
    ),
    tag = "authorizations"
)]
pub async fn challenge(
    State(state): State<Arc<AppState>>,
    Path((profile_id, authz_id, challenge_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result: AcmeResult<AcmeReply> = async {
        let profile = state.service.profile(&profile_id).await?;
        let urls = state.service.urls();
        let request = verified(
            &state,
            &profile.id,
            urls.challenge(&profile.id, &authz_id, &challenge_id),
            &headers,
            &body,
            KeySource::Kid,
        )
        .await?;
        let account = request.require_account()?;

        let (authz, challenge) = match &request.payload {
            None => {
                state
                    .service
                    .get_challenge(account, &authz_id, &challenge_id)
                    .await?
            }
            Some(serde_json::Value::Object(_)) => {
                state
                    .service
                    .respond_to_challenge(account, &authz_id, &challenge_id)
                    .await?
            }
            Some(_) => return Err(AcmeError::malformed("Challenge payload must be an object")),
        };

        Ok(AcmeReply::json(
            StatusCode::OK,
            &ChallengeResource::new(&challenge, &authz.token, &profile.id, urls),
        )?
        .with_up(urls.authorization(&profile.id, &authz.id)))
    }
    .await;
    respond(&state, &profile_id, result).await
}

/// OpenAPI document
pub async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}
