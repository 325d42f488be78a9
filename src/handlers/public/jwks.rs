use axum::{extract::State, Json};
use serde_json::Value;

use crate::state::AppState;

/// GET /.well-known/jwks.json - public keys accepted for token verification.
/// Empty in HS256 fallback mode; clients may poll unconditionally.
pub async fn jwks_get(State(state): State<AppState>) -> Json<Value> {
    Json(state.tokens.jwks().await)
}
