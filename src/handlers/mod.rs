// handlers/mod.rs - Two-tier handler architecture:
// Public (no auth) -> Protected (bearer token required)

pub mod protected;
pub mod public;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::{jwt_auth_middleware, rate_limit_middleware};
use crate::state::AppState;

/// Assemble the full HTTP surface over the application state.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/auth/login", post(public::auth::login_post))
        .route("/auth/mfa/challenge", post(public::auth::mfa_challenge_post))
        .route("/auth/mfa/verify", post(public::auth::mfa_verify_post))
        .route("/auth/mfa/enroll", post(public::auth::mfa_enroll_post))
        .route("/auth/token/refresh", post(public::auth::token_refresh_post))
        .route("/.well-known/jwks.json", get(public::jwks::jwks_get))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    let protected = Router::new()
        .route("/auth/whoami", get(protected::session::whoami_get))
        .route("/auth/logout", post(protected::session::logout_post))
        .route("/auth/token/revoke", post(protected::session::token_revoke_post))
        .route(
            "/auth/token/introspect",
            post(protected::session::introspect_post),
        )
        .route(
            "/capabilities/:key",
            get(protected::capabilities::evaluate_get),
        )
        .route(
            "/capabilities/:key/enroll",
            post(protected::capabilities::enroll_post),
        )
        .route("/features/:key", put(protected::capabilities::feature_put))
        .route(
            "/system/capabilities/:key",
            put(protected::system::system_capability_put),
        )
        .route(
            "/system/tenants/:tenant_id/capabilities/:key",
            put(protected::system::tenant_capability_put),
        )
        .route(
            "/system/impersonate",
            post(protected::system::impersonate_post),
        )
        .route("/audit/events", get(protected::audit::events_get))
        // Rate limiting runs after authentication here so the bucket is the
        // principal, not the client address.
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            jwt_auth_middleware,
        ));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .merge(public)
        .merge(protected)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> axum::Json<Value> {
    axum::Json(json!({
        "name": "tessera-iam",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Multi-tenant identity and access management service"
    }))
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<Value> {
    // The cache round-trip covers Redis; storage is exercised lazily by the
    // first real request, so report what we can observe cheaply.
    let cache_ok = state
        .cache
        .set("health:ping", "1", std::time::Duration::from_secs(5))
        .await
        .is_ok();
    axum::Json(json!({
        "status": if cache_ok { "ok" } else { "degraded" },
        "cache": cache_ok,
        "timestamp": chrono::Utc::now()
    }))
}
