use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::config::TokenConfig;

// Hard caps. Requests outside these bounds are clamped and logged.
const ACCESS_MIN_SECS: i64 = 5 * 60;
const ACCESS_MAX_SECS: i64 = 24 * 3600;
const REFRESH_MIN_SECS: i64 = 86400;
const REFRESH_MAX_SECS: i64 = 365 * 86400;

/// Per-tenant TTL overrides, stored as a settings row. Absent fields fall
/// through to the configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantTokenSettings {
    pub access_ttl_secs: Option<i64>,
    pub refresh_ttl_secs: Option<i64>,
    pub id_ttl_secs: Option<i64>,
    pub remember_me_access_ttl_secs: Option<i64>,
    pub remember_me_refresh_ttl_secs: Option<i64>,
    pub token_rotation_enabled: Option<bool>,
    pub require_mfa_for_extended_sessions: Option<bool>,
}

/// Resolved lifetimes for one principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLifetimes {
    pub access: Duration,
    pub refresh: Duration,
    pub id: Duration,
    pub remember_me_access: Duration,
    pub remember_me_refresh: Duration,
    pub token_rotation_enabled: bool,
    pub require_mfa_for_extended_sessions: bool,
}

impl TokenLifetimes {
    /// The access/refresh pair for a session, honouring `remember_me`.
    pub fn session_pair(&self, remember_me: bool) -> (Duration, Duration) {
        if remember_me {
            (self.remember_me_access, self.remember_me_refresh)
        } else {
            (self.access, self.refresh)
        }
    }
}

/// Resolves TTLs by precedence: tenant setting row, then the configured
/// (env-derived) defaults, then the built-ins baked into `TokenConfig`.
#[derive(Clone)]
pub struct LifetimeResolver {
    defaults: TokenConfig,
}

impl LifetimeResolver {
    pub fn new(defaults: TokenConfig) -> Self {
        Self { defaults }
    }

    pub fn resolve(&self, tenant_settings: Option<&TenantTokenSettings>) -> TokenLifetimes {
        let settings = tenant_settings.cloned().unwrap_or_default();

        let access = clamp_access(
            settings.access_ttl_secs.unwrap_or(self.defaults.access_ttl_secs),
            "access",
        );
        let refresh = clamp_refresh(
            settings
                .refresh_ttl_secs
                .unwrap_or(self.defaults.refresh_ttl_secs),
            "refresh",
        );
        let remember_me_access = clamp_access(
            settings
                .remember_me_access_ttl_secs
                .unwrap_or(self.defaults.remember_me_access_ttl_secs),
            "remember_me_access",
        );
        let remember_me_refresh = clamp_refresh(
            settings
                .remember_me_refresh_ttl_secs
                .unwrap_or(self.defaults.remember_me_refresh_ttl_secs),
            "remember_me_refresh",
        );

        TokenLifetimes {
            access: Duration::seconds(access),
            refresh: Duration::seconds(refresh),
            id: Duration::seconds(settings.id_ttl_secs.unwrap_or(self.defaults.id_ttl_secs)),
            remember_me_access: Duration::seconds(remember_me_access),
            remember_me_refresh: Duration::seconds(remember_me_refresh),
            token_rotation_enabled: settings.token_rotation_enabled.unwrap_or(true),
            require_mfa_for_extended_sessions: settings
                .require_mfa_for_extended_sessions
                .unwrap_or(false),
        }
    }
}

fn clamp_access(secs: i64, which: &str) -> i64 {
    clamp(secs, ACCESS_MIN_SECS, ACCESS_MAX_SECS, which)
}

fn clamp_refresh(secs: i64, which: &str) -> i64 {
    clamp(secs, REFRESH_MIN_SECS, REFRESH_MAX_SECS, which)
}

fn clamp(secs: i64, min: i64, max: i64, which: &str) -> i64 {
    let clamped = secs.clamp(min, max);
    if clamped != secs {
        tracing::warn!(
            requested = secs,
            applied = clamped,
            lifetime = which,
            "Token lifetime outside hard caps; clamped"
        );
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn resolver() -> LifetimeResolver {
        LifetimeResolver::new(AppConfig::development().tokens)
    }

    #[test]
    fn defaults_apply_without_tenant_settings() {
        let lifetimes = resolver().resolve(None);
        assert_eq!(lifetimes.access, Duration::seconds(900));
        assert_eq!(lifetimes.refresh, Duration::days(30));
        assert_eq!(lifetimes.id, Duration::seconds(3600));
        assert!(lifetimes.token_rotation_enabled);
    }

    #[test]
    fn tenant_settings_take_precedence() {
        let settings = TenantTokenSettings {
            access_ttl_secs: Some(600),
            refresh_ttl_secs: Some(7 * 86400),
            ..Default::default()
        };
        let lifetimes = resolver().resolve(Some(&settings));
        assert_eq!(lifetimes.access, Duration::seconds(600));
        assert_eq!(lifetimes.refresh, Duration::days(7));
        // Unset fields still fall through to defaults
        assert_eq!(lifetimes.id, Duration::seconds(3600));
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let settings = TenantTokenSettings {
            access_ttl_secs: Some(10),             // below 5 min
            refresh_ttl_secs: Some(1000 * 86400),  // above 365 d
            remember_me_access_ttl_secs: Some(48 * 3600), // above 24 h
            ..Default::default()
        };
        let lifetimes = resolver().resolve(Some(&settings));
        assert_eq!(lifetimes.access, Duration::seconds(300));
        assert_eq!(lifetimes.refresh, Duration::days(365));
        assert_eq!(lifetimes.remember_me_access, Duration::hours(24));
    }

    #[test]
    fn remember_me_selects_extended_pair() {
        let lifetimes = resolver().resolve(None);
        let (access, refresh) = lifetimes.session_pair(true);
        assert_eq!(access, Duration::seconds(3600));
        assert_eq!(refresh, Duration::days(90));
        let (access, refresh) = lifetimes.session_pair(false);
        assert_eq!(access, Duration::seconds(900));
        assert_eq!(refresh, Duration::days(30));
    }
}
