//! HTTP surface of the ACME server

pub mod handlers;
pub mod models;

use axum::{
    http::{header, HeaderName, Method},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use utoipa::OpenApi;

use pki_acme_core::AcmeService;

/// Application state shared across handlers
pub struct AppState {
    pub service: Arc<AcmeService>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "PKI ACME API",
        version = "0.1.0",
        description = "RFC 8555 ACME endpoints, scoped by CA profile"
    ),
    paths(
        handlers::directory,
        handlers::new_nonce_head,
        handlers::new_nonce_get,
        handlers::new_account,
        handlers::account,
        handlers::account_orders,
        handlers::new_order,
        handlers::order,
        handlers::finalize_order,
        handlers::certificate,
        handlers::authorization,
        handlers::challenge,
    ),
    components(
        schemas(
            models::Directory,
            models::DirectoryMeta,
            models::JwsRequest,
            models::IdentifierResource,
            models::AccountResource,
            models::OrderList,
            models::OrderResource,
            models::ChallengeResource,
            models::AuthorizationResource,
            models::ProblemDocument,
            models::SubproblemDocument,
        )
    ),
    tags(
        (name = "directory", description = "Directory and nonces"),
        (name = "accounts", description = "Account management"),
        (name = "orders", description = "Orders, finalize and certificate download"),
        (name = "authorizations", description = "Authorizations and challenges")
    )
)]
pub struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Answer CORS preflights (browser-based clients)
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: false,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, service: Arc<AcmeService>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { service }),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let acme = Router::new()
            .route("/acme/profiles/{profile_id}", get(handlers::directory))
            .route("/acme/profiles/{profile_id}/directory", get(handlers::directory))
            .route(
                "/acme/profiles/{profile_id}/new-nonce",
                get(handlers::new_nonce_get).head(handlers::new_nonce_head),
            )
            .route("/acme/profiles/{profile_id}/new-account", post(handlers::new_account))
            .route(
                "/acme/profiles/{profile_id}/accounts/{account_id}",
                post(handlers::account),
            )
            .route(
                "/acme/profiles/{profile_id}/accounts/{account_id}/orders",
                post(handlers::account_orders),
            )
            .route("/acme/profiles/{profile_id}/new-order", post(handlers::new_order))
            .route("/acme/profiles/{profile_id}/orders/{order_id}", post(handlers::order))
            .route(
                "/acme/profiles/{profile_id}/orders/{order_id}/finalize",
                post(handlers::finalize_order),
            )
            .route(
                "/acme/profiles/{profile_id}/orders/{order_id}/certificate",
                post(handlers::certificate),
            )
            .route(
                "/acme/profiles/{profile_id}/authorizations/{authz_id}",
                post(handlers::authorization),
            )
            .route(
                "/acme/profiles/{profile_id}/authorizations/{authz_id}/challenges/{challenge_id}",
                post(handlers::challenge),
            )
            .with_state(self.state.clone());

        let mut router = Router::new()
            .route("/acme/openapi.json", get(handlers::openapi_json))
            .merge(acme)
            .layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_methods([Method::GET, Method::HEAD, Method::POST])
                    .allow_headers([header::CONTENT_TYPE])
                    .expose_headers([
                        HeaderName::from_static("replay-nonce"),
                        header::LOCATION,
                        header::LINK,
                    ])
                    .allow_origin(Any),
            );
        }

        router
    }

    /// Serve until `shutdown` resolves
    pub async fn start(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        info!("Starting ACME API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/acme/openapi.json",
            self.config.bind_addr
        );

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}
