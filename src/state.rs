use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditPipeline, AuditReader, AuditRecorder};
use crate::auth::{CredentialVerifier, LoginService};
use crate::cache::{Cache, MemoryCache, RedisCache};
use crate::capability::CapabilityEngine;
use crate::config::AppConfig;
use crate::error::AuthError;
use crate::middleware::rate_limit::RateLimiter;
use crate::mfa::MfaService;
use crate::storage::Storage;
use crate::token::{ClaimsBuilder, KeyRing, LifetimeResolver, TokenService};

/// Everything the handlers need, assembled once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub storage: Storage,
    pub cache: Arc<dyn Cache>,
    pub tokens: Arc<TokenService>,
    pub login: LoginService,
    pub mfa: MfaService,
    pub capabilities: CapabilityEngine,
    pub credentials: CredentialVerifier,
    pub rate_limiter: RateLimiter,
    pub audit: AuditRecorder,
    pub audit_reader: AuditReader,
}

impl AppState {
    /// Wire the service graph over the given storage and cache backends.
    /// Returns the state plus the audit pipeline handle for shutdown.
    pub fn build(
        config: AppConfig,
        storage: Storage,
        cache: Arc<dyn Cache>,
    ) -> Result<(Self, AuditPipeline), AuthError> {
        config
            .validate()
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        let keys = KeyRing::from_config(&config.security)?;
        let claims = ClaimsBuilder::new(
            &config.security.jwt_issuer,
            &config.security.jwt_default_audience,
        );
        let lifetimes = LifetimeResolver::new(config.tokens.clone());
        let tokens = Arc::new(TokenService::new(
            keys,
            storage.clone(),
            claims.clone(),
            lifetimes.clone(),
        ));

        let capabilities = CapabilityEngine::new(storage.clone());
        let credentials = CredentialVerifier::new(
            storage.clone(),
            config.security.max_failed_logins,
            config.security.lockout_minutes,
        );
        let mfa = MfaService::new(
            cache.clone(),
            storage.clone(),
            capabilities.clone(),
            config.encryption_key_bytes(),
            &config.security.totp_issuer,
            Duration::from_secs(config.cache.mfa_session_ttl_secs),
        );

        let pipeline = AuditPipeline::start(storage.audit_events.clone(), &config.audit);
        let audit = pipeline.recorder();
        let audit_reader = pipeline.reader();

        let login = LoginService::new(
            storage.clone(),
            credentials.clone(),
            capabilities.clone(),
            mfa.clone(),
            tokens.clone(),
            claims,
            lifetimes,
            audit.clone(),
        );

        let rate_limiter = RateLimiter::new(cache.clone(), config.rate_limits.clone());

        Ok((
            Self {
                config: Arc::new(config),
                storage,
                cache,
                tokens,
                login,
                mfa,
                capabilities,
                credentials,
                rate_limiter,
                audit,
                audit_reader,
            },
            pipeline,
        ))
    }

    /// Connect the configured backends: Postgres + Redis in production,
    /// in-process fallbacks in development when URLs are absent.
    pub async fn connect(config: AppConfig) -> Result<(Self, AuditPipeline), AuthError> {
        let storage = match &config.database.url {
            Some(_) => {
                let pool = crate::database::DatabaseManager::connect(&config.database)
                    .await
                    .map_err(|e| AuthError::StorageFailure(e.to_string()))?;
                crate::storage::postgres::build_storage(pool)
            }
            None => {
                tracing::warn!("DATABASE_URL not set; using in-memory storage");
                crate::storage::memory::build_storage()
            }
        };

        let cache: Arc<dyn Cache> = match &config.cache.redis_url {
            Some(url) => Arc::new(RedisCache::connect(url).await?),
            None => {
                tracing::warn!("REDIS_URL not set; using in-process cache");
                Arc::new(MemoryCache::new())
            }
        };

        Self::build(config, storage, cache)
    }
}
