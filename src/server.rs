use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::routes;
use crate::signature::constant_time_eq;
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    // Public routes: health probes and read-only stats.
    let public_routes = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/stats", get(routes::search::stats));

    // Webhooks authenticate via HMAC signature inside the handler, so
    // they stay outside the bearer middleware (and outside any rate
    // limiting an operator puts in front of /api).
    let webhook_routes = Router::new()
        .route("/api/webhook/firecrawl", post(routes::webhooks::firecrawl_webhook))
        .route(
            "/api/webhook/changedetection",
            post(routes::webhooks::changedetection_webhook),
        );

    // Bearer-token routes.
    let protected_routes = Router::new()
        .route("/api/search", post(routes::search::search))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            bearer_auth_middleware,
        ));

    public_routes
        .merge(webhook_routes)
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        warn!("CORS configured with a wildcard origin");
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<axum::http::HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Validates `Authorization: Bearer <token>` against `API_SECRET` with a
/// constant-time comparison.
async fn bearer_auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, (StatusCode, axum::Json<serde_json::Value>)> {
    let unauthorized = || {
        (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401})),
        )
    };

    let expected = state.config.api_secret.as_bytes();
    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    match auth_header {
        Some(header) if header.len() > 7 && header[..7].eq_ignore_ascii_case("bearer ") => {
            let token = &header[7..];
            if constant_time_eq(token.as_bytes(), expected) {
                Ok(next.run(req).await)
            } else {
                warn!("bearer token mismatch, rejecting request");
                Err(unauthorized())
            }
        }
        _ => {
            warn!("missing or malformed Authorization header, rejecting request");
            Err(unauthorized())
        }
    }
}
