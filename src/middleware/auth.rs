use std::collections::BTreeMap;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::database::models::PrincipalType;
use crate::error::ApiError;
use crate::state::AppState;
use crate::token::{Acr, Claims};

/// Authenticated principal context extracted from the access token and
/// attached to the request.
#[derive(Clone, Debug)]
pub struct PrincipalContext {
    pub user_id: Uuid,
    pub principal_type: PrincipalType,
    pub tenant_id: Option<Uuid>,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub system_permissions: Vec<String>,
    pub capabilities: BTreeMap<String, bool>,
    pub acr: Acr,
    pub scope: Option<String>,
    /// The token audience; the client id for OAuth-issued tokens.
    pub audience: String,
}

impl PrincipalContext {
    pub fn from_claims(claims: &Claims) -> Result<Self, ApiError> {
        let user_id = claims
            .user_id()
            .ok_or_else(|| ApiError::unauthorized("Invalid token subject"))?;
        Ok(Self {
            user_id,
            principal_type: claims.principal_type,
            tenant_id: claims.tenant_uuid(),
            username: claims.username.clone(),
            email: claims.email.clone(),
            roles: claims.roles.clone().unwrap_or_default(),
            permissions: claims.permissions.clone().unwrap_or_default(),
            system_permissions: claims.system_permissions.clone().unwrap_or_default(),
            capabilities: claims.capabilities.clone().unwrap_or_default(),
            acr: claims.acr,
            scope: claims.scope.clone(),
            audience: claims.aud.clone(),
        })
    }

    pub fn is_system(&self) -> bool {
        self.principal_type == PrincipalType::System
    }
}

/// JWT authentication middleware: validates the bearer token and injects the
/// principal context.
pub async fn jwt_auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer(&headers)?;
    let claims = state
        .tokens
        .validate_access(&token)
        .await
        .map_err(ApiError::from)?;

    let principal = PrincipalContext::from_claims(&claims)?;
    request.extensions_mut().insert(principal);

    Ok(next.run(request).await)
}

/// Extract the bearer token from the Authorization header.
pub fn extract_bearer(headers: &HeaderMap) -> Result<String, ApiError> {
    let auth_header = headers
        .get("authorization")
        .ok_or_else(|| ApiError::unauthorized("Missing Authorization header"))?;

    let auth_str = auth_header
        .to_str()
        .map_err(|_| ApiError::unauthorized("Invalid Authorization header format"))?;

    match auth_str.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
        _ => Err(ApiError::unauthorized(
            "Authorization header must use Bearer token format",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(extract_bearer(&headers).is_err());

        headers.insert("authorization", "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(extract_bearer(&headers).unwrap(), "abc.def.ghi");

        headers.insert("authorization", "Basic dXNlcg==".parse().unwrap());
        assert!(extract_bearer(&headers).is_err());

        headers.insert("authorization", "Bearer    ".parse().unwrap());
        assert!(extract_bearer(&headers).is_err());
    }
}
