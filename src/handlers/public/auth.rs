use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{LoginOutcome, LoginRequest};
use crate::database::models::{AuditEvent, AuditResult};
use crate::error::ApiError;
use crate::middleware::auth::extract_bearer;
use crate::state::AppState;
use crate::token::{IssuedTokens, TokenError};

fn client_meta(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    let agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (ip, agent)
}

fn token_body(tokens: &IssuedTokens) -> Value {
    json!({
        "access_token": tokens.access_token,
        "refresh_token": tokens.refresh_token,
        "id_token": tokens.id_token,
        "token_type": "Bearer",
        "expires_in": tokens.expires_in,
    })
}

/// POST /auth/login - authenticate with username and password.
///
/// Body: `{username, password, tenant_id?, remember_me?}`. Without
/// `tenant_id` the SYSTEM namespace is tried first, then the tenant resolved
/// from the `X-Tenant-Domain` header.
///
/// Success is either a full token set or an MFA hand-off:
/// `{mfa_required: true, user_id, session_id, mfa_enrollment_required?}`.
pub async fn login_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.username.is_empty() || request.password.is_empty() {
        return Err(ApiError::bad_request("username and password are required"));
    }

    request.domain = headers
        .get("x-tenant-domain")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let (ip, agent) = client_meta(&headers);
    request.source_ip = ip;
    request.user_agent = agent;

    let budget = Duration::from_secs(state.config.server.login_timeout_secs);
    let outcome = tokio::time::timeout(budget, state.login.login(&request))
        .await
        .map_err(|_| ApiError::from(crate::error::AuthError::Cancelled))??;

    match outcome {
        LoginOutcome::Tokens(tokens) => Ok(Json(token_body(&tokens))),
        LoginOutcome::MfaRequired {
            user_id,
            session_id,
            enrollment_required,
        } => Ok(Json(json!({
            "mfa_required": true,
            "user_id": user_id,
            "session_id": session_id,
            "mfa_enrollment_required": enrollment_required,
        }))),
    }
}

#[derive(Debug, Deserialize)]
pub struct ChallengeRequest {
    pub user_id: Uuid,
    pub tenant_id: Option<Uuid>,
}

/// POST /auth/mfa/challenge - open an MFA challenge session for an enrolled
/// principal.
pub async fn mfa_challenge_post(
    State(state): State<AppState>,
    Json(request): Json<ChallengeRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = state
        .storage
        .users
        .get(request.user_id)
        .await
        .map_err(ApiError::from)?
        .filter(|u| u.is_active() && request.tenant_id.map_or(true, |t| u.tenant_id == Some(t)))
        .ok_or_else(|| ApiError::not_found("Unknown principal"))?;

    let session_id = state.mfa.begin_challenge(&user).await.map_err(ApiError::from)?;
    Ok(Json(json!({ "session_id": session_id })))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub session_id: Uuid,
    pub code: String,
    #[serde(default)]
    pub remember_me: bool,
}

/// POST /auth/mfa/verify - verify a TOTP or recovery code against a session
/// and receive the full token set.
pub async fn mfa_verify_post(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.code.trim().is_empty() {
        return Err(ApiError::bad_request("code is required"));
    }
    let (_, tokens) = state
        .login
        .complete_mfa(request.session_id, &request.code, request.remember_me)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(token_body(&tokens)))
}

#[derive(Debug, Default, Deserialize)]
pub struct EnrollRequest {
    pub session_id: Option<Uuid>,
}

/// POST /auth/mfa/enroll - begin TOTP enrollment.
///
/// Authenticates either by bearer token or by the enrollment session handed
/// out at login when the tenant's policy demanded MFA from an unenrolled
/// user. Returns the secret, otpauth URI, QR code and recovery codes; none
/// of this material is persisted until the challenge verifies.
pub async fn mfa_enroll_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<EnrollRequest>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();

    let user_id = match extract_bearer(&headers) {
        Ok(token) => {
            let claims = state.tokens.validate_access(&token).await.map_err(ApiError::from)?;
            claims
                .user_id()
                .ok_or_else(|| ApiError::unauthorized("Invalid token subject"))?
        }
        Err(_) => {
            let session_id = request
                .session_id
                .ok_or_else(|| ApiError::unauthorized("Bearer token or session_id required"))?;
            state
                .mfa
                .session_user(session_id)
                .await
                .map_err(ApiError::from)?
        }
    };

    let user = state
        .storage
        .users
        .get(user_id)
        .await
        .map_err(ApiError::from)?
        .filter(|u| u.is_active())
        .ok_or_else(|| ApiError::unauthorized("Unknown principal"))?;

    let start = state
        .mfa
        .begin_enrollment(&user, request.session_id)
        .await
        .map_err(ApiError::from)?;

    state.audit.emit(
        AuditEvent::new("mfa.enrollment_started", AuditResult::Success)
            .with_actor(user.id, &user.username, user.principal_type)
            .with_tenant(user.tenant_id),
    );

    Ok((
        StatusCode::OK,
        Json(json!({
            "session_id": start.session_id,
            "secret": start.secret_b32,
            "otpauth_uri": start.otpauth_uri,
            "qr_code": start.qr_png_base64,
            "recovery_codes": start.recovery_codes,
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
    pub client_id: Option<String>,
}

/// POST /auth/token/refresh - rotate a refresh token. Presenting a revoked
/// token revokes the principal's entire refresh-token set.
pub async fn token_refresh_post(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.refresh_token.is_empty() {
        return Err(ApiError::bad_request("refresh_token is required"));
    }

    let budget = Duration::from_secs(state.config.server.refresh_timeout_secs);
    let result = tokio::time::timeout(
        budget,
        state
            .tokens
            .refresh(&request.refresh_token, request.client_id.as_deref()),
    )
    .await
    .map_err(|_| ApiError::from(crate::error::AuthError::Cancelled))?;

    match result {
        Ok(tokens) => {
            state.audit.emit(AuditEvent::new("token.refreshed", AuditResult::Success));
            Ok(Json(token_body(&tokens)))
        }
        Err(TokenError::ReuseDetected) => {
            state
                .audit
                .emit(AuditEvent::new("token.reuse_detected", AuditResult::Denied));
            Err(TokenError::ReuseDetected.into())
        }
        Err(e) => {
            state.audit.emit(
                AuditEvent::new("token.refresh_failed", AuditResult::Failure)
                    .with_error(&e.to_string()),
            );
            Err(e.into())
        }
    }
}
