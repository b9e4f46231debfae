//! Router setup with all API routes and middleware.
//!
//! Configures the axum Router with CORS, tracing, the upload size limit,
//! and all endpoint handlers.

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use docent_core::config::DocentConfig;
use docent_core::error::DocentError;

use crate::handlers;
use crate::state::AppState;

/// Room for the prompt and form framing on top of the document itself.
const MULTIPART_OVERHEAD_BYTES: usize = 256 * 1024;

/// Body limit for JSON endpoints.
const JSON_BODY_LIMIT: usize = 64 * 1024;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([HeaderName::from_static(handlers::SESSION_HEADER)])
}

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);
    let upload_limit = state
        .config
        .chat
        .max_document_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    let chat_routes = Router::new()
        .route("/api/chat", post(handlers::chat))
        .layer(DefaultBodyLimit::max(upload_limit));

    let session_routes = Router::new()
        .route(
            "/api/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/api/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/api/sessions/{id}/reset", post(handlers::reset_session))
        .layer(DefaultBodyLimit::max(JSON_BODY_LIMIT));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(chat_routes)
        .merge(session_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on the configured port.
///
/// Binds to 127.0.0.1 (localhost only).
pub async fn start_server(config: &DocentConfig, state: AppState) -> Result<(), DocentError> {
    let addr = format!("127.0.0.1:{}", config.general.port);
    let router = create_router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
