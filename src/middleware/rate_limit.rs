//! Sliding-window rate limiting over cache sorted sets. Three tiers, checked
//! in order: endpoint category, then the principal/client/IP bucket. The
//! health-check path is exempt.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::cache::Cache;
use crate::config::RateLimitConfig;
use crate::database::models::{AuditEvent, AuditResult};
use crate::error::{ApiError, AuthError};
use crate::state::AppState;

use super::auth::PrincipalContext;

const WINDOW_SECS: u64 = 60;

/// One tier's verdict.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    cache: Arc<dyn Cache>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn Cache>, config: RateLimitConfig) -> Self {
        Self { cache, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Count requests in the trailing window; admit and record if under the
    /// cap. The set member is unique per request, scored by milliseconds.
    pub async fn check(&self, key: &str, max: u32) -> Result<RateDecision, AuthError> {
        let now_ms = Utc::now().timestamp_millis();
        let window_start = (now_ms - (WINDOW_SECS as i64) * 1000) as f64;
        let cache_key = format!("rl:{}", key);

        self.cache
            .zrem_range_by_score(&cache_key, 0.0, window_start)
            .await?;
        let count = self.cache.zcard(&cache_key).await?;

        if count >= max as i64 {
            return Ok(RateDecision {
                allowed: false,
                limit: max,
                remaining: 0,
                retry_after_secs: WINDOW_SECS,
            });
        }

        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());
        self.cache
            .zadd(
                &cache_key,
                &member,
                now_ms as f64,
                Duration::from_secs(WINDOW_SECS * 2),
            )
            .await?;

        Ok(RateDecision {
            allowed: true,
            limit: max,
            remaining: max.saturating_sub(count as u32 + 1),
            retry_after_secs: 0,
        })
    }

    pub fn bucket_limit(&self, bucket: &Bucket) -> u32 {
        match bucket {
            Bucket::User(_) => self.config.user_rpm,
            Bucket::Client(_) => self.config.client_rpm,
            Bucket::AdminIp(_) => self.config.admin_ip_rpm,
            Bucket::Ip(_) => self.config.user_rpm,
        }
    }
}

/// The per-caller bucket of tier 2.
#[derive(Debug, Clone)]
pub enum Bucket {
    User(Uuid),
    Client(String),
    AdminIp(String),
    Ip(String),
}

impl Bucket {
    fn key(&self) -> String {
        match self {
            Bucket::User(id) => format!("user:{}", id),
            Bucket::Client(id) => format!("client:{}", id),
            Bucket::AdminIp(ip) => format!("admin-ip:{}", ip),
            Bucket::Ip(ip) => format!("ip:{}", ip),
        }
    }
}

/// Endpoint categories of tier 1, hardcoded. `(limit + burst)` per minute.
fn endpoint_category(path: &str) -> Option<(&'static str, u32)> {
    const AUTH_LIMIT: u32 = 20 + 3;
    const SENSITIVE_LIMIT: u32 = 10 + 2;
    if path.starts_with("/auth/mfa/enroll")
        || path.contains("/password/reset")
        || path.contains("/suspend")
    {
        Some(("sensitive", SENSITIVE_LIMIT))
    } else if path.starts_with("/auth/") {
        Some(("auth", AUTH_LIMIT))
    } else {
        None
    }
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    if !state.rate_limiter.enabled() {
        return Ok(next.run(request).await);
    }

    let path = request.uri().path().to_string();
    if path == "/health" {
        return Ok(next.run(request).await);
    }

    let headers = request.headers().clone();
    let principal = request.extensions().get::<PrincipalContext>().cloned();

    // Tier 1: endpoint category.
    if let Some((category, limit)) = endpoint_category(&path) {
        let key = format!("cat:{}:{}", category, client_ip(&headers));
        match state.rate_limiter.check(&key, limit).await {
            Ok(decision) if !decision.allowed => {
                return Err(exceeded_response(&state, &decision, &path, &principal));
            }
            Ok(_) => {}
            Err(e) => return Err(ApiError::from(e).into_response()),
        }
    }

    // Tier 2: principal, client, or IP bucket. The same limiter applies to
    // SYSTEM and tenant principals alike.
    let bucket = match &principal {
        // OAuth-issued tokens carry a scope; their bucket is the client.
        Some(ctx) if ctx.scope.is_some() => Bucket::Client(ctx.audience.clone()),
        Some(ctx) => Bucket::User(ctx.user_id),
        None if path.starts_with("/system") => Bucket::AdminIp(client_ip(&headers)),
        None => Bucket::Ip(client_ip(&headers)),
    };
    let limit = state.rate_limiter.bucket_limit(&bucket);
    match state.rate_limiter.check(&bucket.key(), limit).await {
        Ok(decision) if !decision.allowed => {
            Err(exceeded_response(&state, &decision, &path, &principal))
        }
        Ok(_) => Ok(next.run(request).await),
        Err(e) => Err(ApiError::from(e).into_response()),
    }
}

fn exceeded_response(
    state: &AppState,
    decision: &RateDecision,
    path: &str,
    principal: &Option<PrincipalContext>,
) -> Response {
    let mut event = AuditEvent::new("rate_limit.exceeded", AuditResult::Denied)
        .with_metadata(json!({ "path": path, "limit": decision.limit }));
    if let Some(ctx) = principal {
        event = event
            .with_actor(ctx.user_id, &ctx.username, ctx.principal_type)
            .with_tenant(ctx.tenant_id);
    }
    state.audit.emit(event);

    let api_error = ApiError::too_many_requests("Rate limit exceeded");
    let mut response = api_error.into_response();
    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", decision.limit.into());
    headers.insert("X-RateLimit-Remaining", decision.remaining.into());
    headers.insert("Retry-After", decision.retry_after_secs.into());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::AppConfig;

    fn limiter(user_rpm: u32) -> RateLimiter {
        let config = RateLimitConfig {
            enabled: true,
            user_rpm,
            ..AppConfig::development().rate_limits
        };
        RateLimiter::new(Arc::new(MemoryCache::new()), config)
    }

    #[tokio::test]
    async fn admits_until_the_cap_then_refuses() {
        let limiter = limiter(3);
        for _ in 0..3 {
            let decision = limiter.check("user:abc", 3).await.unwrap();
            assert!(decision.allowed);
        }
        let decision = limiter.check("user:abc", 3).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after_secs, WINDOW_SECS);
    }

    #[tokio::test]
    async fn buckets_are_independent() {
        let limiter = limiter(2);
        for _ in 0..2 {
            assert!(limiter.check("user:a", 2).await.unwrap().allowed);
        }
        assert!(!limiter.check("user:a", 2).await.unwrap().allowed);
        assert!(limiter.check("user:b", 2).await.unwrap().allowed);
    }

    #[test]
    fn categories_cover_auth_and_sensitive_paths() {
        assert_eq!(endpoint_category("/auth/login").unwrap().0, "auth");
        assert_eq!(endpoint_category("/auth/token/refresh").unwrap().0, "auth");
        assert_eq!(
            endpoint_category("/auth/mfa/enroll").unwrap().0,
            "sensitive"
        );
        assert!(endpoint_category("/capabilities/mfa").is_none());
        assert!(endpoint_category("/health").is_none());
    }
}
