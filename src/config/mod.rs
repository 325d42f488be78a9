use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub security: SecurityConfig,
    pub tokens: TokenConfig,
    pub rate_limits: RateLimitConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub request_timeout_secs: u64,
    pub login_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub tls_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
    pub mfa_session_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub jwt_signing_key: String,
    pub jwt_rsa_private_key_path: Option<String>,
    pub jwt_issuer: String,
    pub jwt_default_audience: String,
    pub encryption_key: String,
    pub totp_issuer: String,
    pub max_failed_logins: i32,
    pub lockout_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub id_ttl_secs: i64,
    pub remember_me_access_ttl_secs: i64,
    pub remember_me_refresh_ttl_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub user_rpm: u32,
    pub client_rpm: u32,
    pub admin_ip_rpm: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub buffer_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub shutdown_grace_ms: u64,
}

/// Configuration problems that must abort startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("ENVIRONMENT").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            _ => Environment::Development,
        };

        // Environment picks the defaults, specific env vars override them
        match environment {
            Environment::Production => Self::production(),
            Environment::Development => Self::development(),
        }
        .with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = env::var("SERVER_ADDR") {
            self.server.bind_addr = v;
        }
        if let Ok(v) = env::var("DATABASE_URL") {
            self.database.url = Some(v);
        }
        if let Ok(v) = env::var("REDIS_URL") {
            self.cache.redis_url = Some(v);
        }
        if let Ok(v) = env::var("JWT_SIGNING_KEY") {
            self.security.jwt_signing_key = v;
        }
        if let Ok(v) = env::var("JWT_RSA_PRIVATE_KEY_PATH") {
            self.security.jwt_rsa_private_key_path = Some(v);
        }
        if let Ok(v) = env::var("JWT_ISSUER") {
            self.security.jwt_issuer = v;
        }
        if let Ok(v) = env::var("JWT_AUDIENCE") {
            self.security.jwt_default_audience = v;
        }
        if let Ok(v) = env::var("ENCRYPTION_KEY") {
            self.security.encryption_key = v;
        }
        if let Ok(v) = env::var("TOTP_ISSUER") {
            self.security.totp_issuer = v;
        }
        if let Ok(v) = env::var("ACCESS_TOKEN_TTL") {
            self.tokens.access_ttl_secs = v.parse().unwrap_or(self.tokens.access_ttl_secs);
        }
        if let Ok(v) = env::var("REFRESH_TOKEN_TTL") {
            self.tokens.refresh_ttl_secs = v.parse().unwrap_or(self.tokens.refresh_ttl_secs);
        }
        if let Ok(v) = env::var("ID_TOKEN_TTL") {
            self.tokens.id_ttl_secs = v.parse().unwrap_or(self.tokens.id_ttl_secs);
        }
        if let Ok(v) = env::var("RATE_LIMIT_USER_RPM") {
            self.rate_limits.user_rpm = v.parse().unwrap_or(self.rate_limits.user_rpm);
        }
        if let Ok(v) = env::var("RATE_LIMIT_CLIENT_RPM") {
            self.rate_limits.client_rpm = v.parse().unwrap_or(self.rate_limits.client_rpm);
        }
        if let Ok(v) = env::var("RATE_LIMIT_ADMIN_IP_RPM") {
            self.rate_limits.admin_ip_rpm = v.parse().unwrap_or(self.rate_limits.admin_ip_rpm);
        }
        if let Ok(v) = env::var("MFA_SESSION_TTL_SECS") {
            self.cache.mfa_session_ttl_secs = v.parse().unwrap_or(self.cache.mfa_session_ttl_secs);
        }
        if let Ok(v) = env::var("AUDIT_BUFFER_CAPACITY") {
            self.audit.buffer_capacity = v.parse().unwrap_or(self.audit.buffer_capacity);
        }

        self
    }

    pub fn development() -> Self {
        Self {
            environment: Environment::Development,
            server: ServerConfig {
                bind_addr: "0.0.0.0:3000".to_string(),
                request_timeout_secs: 30,
                login_timeout_secs: 10,
                refresh_timeout_secs: 5,
                tls_enabled: false,
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 25,
                min_connections: 5,
                max_lifetime_secs: 300,
            },
            cache: CacheConfig {
                redis_url: None,
                mfa_session_ttl_secs: 300,
            },
            security: SecurityConfig {
                jwt_signing_key: "development-only-signing-key-32b!".to_string(),
                jwt_rsa_private_key_path: None,
                jwt_issuer: "tessera-iam".to_string(),
                jwt_default_audience: "tessera-iam".to_string(),
                encryption_key: "development-only-encrypt-32bytes".to_string(),
                totp_issuer: "Tessera".to_string(),
                max_failed_logins: 5,
                lockout_minutes: 15,
            },
            tokens: TokenConfig {
                access_ttl_secs: 900,
                refresh_ttl_secs: 30 * 86400,
                id_ttl_secs: 3600,
                remember_me_access_ttl_secs: 3600,
                remember_me_refresh_ttl_secs: 90 * 86400,
            },
            rate_limits: RateLimitConfig {
                enabled: false,
                user_rpm: 60,
                client_rpm: 100,
                admin_ip_rpm: 30,
            },
            audit: AuditConfig {
                buffer_capacity: 1024,
                batch_size: 100,
                flush_interval_ms: 1000,
                shutdown_grace_ms: 5000,
            },
        }
    }

    pub fn production() -> Self {
        let mut config = Self::development();
        config.environment = Environment::Production;
        config.server.tls_enabled = true;
        config.rate_limits.enabled = true;
        // Secrets must come from the environment.
        config.security.jwt_signing_key = String::new();
        config.security.encryption_key = String::new();
        config
    }

    /// Startup validation. Production is fail-fast: Redis configured, RSA key
    /// present, encryption key exactly 32 bytes, signing key at least 32
    /// bytes, TLS on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.security.encryption_key.len() != 32 {
            return Err(ConfigError::Invalid {
                key: "ENCRYPTION_KEY",
                reason: format!(
                    "must be exactly 32 bytes, got {}",
                    self.security.encryption_key.len()
                ),
            });
        }

        if let Some(database_url) = &self.database.url {
            url::Url::parse(database_url).map_err(|e| ConfigError::Invalid {
                key: "DATABASE_URL",
                reason: e.to_string(),
            })?;
        }
        if let Some(redis_url) = &self.cache.redis_url {
            url::Url::parse(redis_url).map_err(|e| ConfigError::Invalid {
                key: "REDIS_URL",
                reason: e.to_string(),
            })?;
        }

        if self.environment == Environment::Production {
            if self.database.url.is_none() {
                return Err(ConfigError::Missing("DATABASE_URL"));
            }
            if self.cache.redis_url.is_none() {
                return Err(ConfigError::Missing("REDIS_URL"));
            }
            if self.security.jwt_rsa_private_key_path.is_none() {
                return Err(ConfigError::Missing("JWT_RSA_PRIVATE_KEY_PATH"));
            }
            if self.security.jwt_signing_key.len() < 32 {
                return Err(ConfigError::Invalid {
                    key: "JWT_SIGNING_KEY",
                    reason: "must be at least 32 bytes in production".to_string(),
                });
            }
            if !self.server.tls_enabled {
                return Err(ConfigError::Invalid {
                    key: "SERVER_TLS",
                    reason: "TLS must be enabled in production".to_string(),
                });
            }
        }

        Ok(())
    }

    /// The AES-256 key. Call after `validate()`.
    pub fn encryption_key_bytes(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        let bytes = self.security.encryption_key.as_bytes();
        let n = bytes.len().min(32);
        key[..n].copy_from_slice(&bytes[..n]);
        key
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}
