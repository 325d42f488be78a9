//! Four-layer capability governance: System -> Tenant-assignment ->
//! Tenant-enablement -> User-enrollment. Evaluation folds the layers with
//! short-circuit reasons; mutations go through the repository, which checks
//! the inter-layer invariants inside the same transaction as the write.

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::database::models::{
    capability::requires_enrollment, CapabilityEvaluation, PrincipalType, SystemCapability,
    TenantCapability, TenantFeatureEnablement, User, UserCapabilityState,
};
use crate::error::AuthError;
use crate::storage::Storage;

#[derive(Clone)]
pub struct CapabilityEngine {
    storage: Storage,
}

impl CapabilityEngine {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Evaluate a capability for a principal. SYSTEM principals bypass the
    /// tenant layers: only the system switch applies to them.
    pub async fn evaluate(&self, user: &User, key: &str) -> Result<CapabilityEvaluation, AuthError> {
        match user.principal_type {
            PrincipalType::System => self.evaluate_system_plane(key).await,
            PrincipalType::Tenant => {
                let tenant_id = user.tenant_id.ok_or_else(|| {
                    AuthError::Internal("tenant principal without tenant".to_string())
                })?;
                self.evaluate_tenant_plane(tenant_id, user.id, key).await
            }
        }
    }

    async fn evaluate_system_plane(&self, key: &str) -> Result<CapabilityEvaluation, AuthError> {
        let supported = self.system_supported(key).await?;
        Ok(CapabilityEvaluation {
            capability_key: key.to_string(),
            system_supported: supported,
            tenant_allowed: supported,
            tenant_enabled: supported,
            user_enrolled: supported,
            can_use: supported,
            reason: (!supported).then(|| "not supported".to_string()),
        })
    }

    /// The four gates, each short-circuiting with its reason.
    pub async fn evaluate_tenant_plane(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        key: &str,
    ) -> Result<CapabilityEvaluation, AuthError> {
        let mut evaluation = CapabilityEvaluation::denied(key, "not supported");

        evaluation.system_supported = self.system_supported(key).await?;
        if !evaluation.system_supported {
            return Ok(evaluation);
        }

        evaluation.tenant_allowed = self
            .storage
            .capabilities
            .get_tenant(tenant_id, key)
            .await?
            .is_some_and(|c| c.enabled);
        if !evaluation.tenant_allowed {
            evaluation.reason = Some("not allowed for tenant".to_string());
            return Ok(evaluation);
        }

        evaluation.tenant_enabled = self
            .storage
            .capabilities
            .get_feature(tenant_id, key)
            .await?
            .is_some_and(|f| f.enabled);
        if !evaluation.tenant_enabled {
            evaluation.reason = Some("not enabled by tenant".to_string());
            return Ok(evaluation);
        }

        evaluation.user_enrolled = if requires_enrollment(key) {
            self.storage
                .capabilities
                .get_user_state(user_id, key)
                .await?
                .is_some_and(|s| s.enrolled)
        } else {
            true
        };
        if !evaluation.user_enrolled {
            evaluation.reason = Some("user not enrolled".to_string());
            return Ok(evaluation);
        }

        evaluation.can_use = true;
        evaluation.reason = None;
        Ok(evaluation)
    }

    async fn system_supported(&self, key: &str) -> Result<bool, AuthError> {
        Ok(self
            .storage
            .capabilities
            .get_system(key)
            .await?
            .is_some_and(|c| c.enabled))
    }

    // -- Mutators -----------------------------------------------------------

    /// System admin: flip the platform-wide switch for a key.
    pub async fn set_system_capability(
        &self,
        key: &str,
        enabled: bool,
        default_value: Option<Value>,
    ) -> Result<SystemCapability, AuthError> {
        let capability = SystemCapability {
            capability_key: key.to_string(),
            enabled,
            default_value,
        };
        self.storage.capabilities.upsert_system(&capability).await?;
        Ok(capability)
    }

    /// System admin: assign (or unassign) a capability to a tenant.
    pub async fn set_tenant_capability(
        &self,
        tenant_id: Uuid,
        key: &str,
        enabled: bool,
        value: Option<Value>,
    ) -> Result<TenantCapability, AuthError> {
        let capability = TenantCapability {
            tenant_id,
            capability_key: key.to_string(),
            enabled,
            value,
        };
        self.storage.capabilities.upsert_tenant(&capability).await?;
        Ok(capability)
    }

    /// Tenant admin: turn an assigned capability on for the tenant's users.
    pub async fn set_feature_enablement(
        &self,
        tenant_id: Uuid,
        key: &str,
        enabled: bool,
        configuration: Option<Value>,
    ) -> Result<TenantFeatureEnablement, AuthError> {
        let feature = TenantFeatureEnablement {
            tenant_id,
            feature_key: key.to_string(),
            enabled,
            configuration,
        };
        self.storage.capabilities.upsert_feature(&feature).await?;
        Ok(feature)
    }

    /// User self-service: enroll into an enrollment-gated capability.
    pub async fn enroll_user(
        &self,
        user: &User,
        key: &str,
        state_data: Option<Value>,
    ) -> Result<UserCapabilityState, AuthError> {
        let state = UserCapabilityState {
            user_id: user.id,
            capability_key: key.to_string(),
            enrolled: true,
            state_data,
            enrolled_at: Some(Utc::now()),
        };
        self.storage
            .capabilities
            .upsert_user_state(user, &state)
            .await?;
        Ok(state)
    }

    pub async fn withdraw_user(&self, user: &User, key: &str) -> Result<(), AuthError> {
        let state = UserCapabilityState {
            user_id: user.id,
            capability_key: key.to_string(),
            enrolled: false,
            state_data: None,
            enrolled_at: None,
        };
        self.storage
            .capabilities
            .upsert_user_state(user, &state)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::UserStatus;
    use crate::storage::memory;

    fn engine() -> CapabilityEngine {
        CapabilityEngine::new(memory::build_storage())
    }

    fn tenant_user(tenant_id: Uuid) -> User {
        User {
            id: Uuid::new_v4(),
            principal_type: PrincipalType::Tenant,
            tenant_id: Some(tenant_id),
            username: "alice".to_string(),
            email: "alice@t1.example".to_string(),
            status: UserStatus::Active,
            mfa_enabled: false,
            totp_secret_enc: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn system_user() -> User {
        let mut user = tenant_user(Uuid::new_v4());
        user.principal_type = PrincipalType::System;
        user.tenant_id = None;
        user
    }

    async fn enable_through_feature(engine: &CapabilityEngine, tenant_id: Uuid, key: &str) {
        engine.set_system_capability(key, true, None).await.unwrap();
        engine
            .set_tenant_capability(tenant_id, key, true, None)
            .await
            .unwrap();
        engine
            .set_feature_enablement(tenant_id, key, true, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn layers_gate_in_order() {
        let engine = engine();
        let tenant_id = Uuid::new_v4();
        let user = tenant_user(tenant_id);

        // Nothing seeded: not supported.
        let eval = engine.evaluate(&user, "saml").await.unwrap();
        assert!(!eval.can_use);
        assert_eq!(eval.reason.as_deref(), Some("not supported"));

        // Supported, but not assigned to the tenant.
        engine.set_system_capability("saml", true, None).await.unwrap();
        let eval = engine.evaluate(&user, "saml").await.unwrap();
        assert!(eval.system_supported && !eval.tenant_allowed);
        assert_eq!(eval.reason.as_deref(), Some("not allowed for tenant"));

        // Assigned, but the tenant admin has not enabled it.
        engine
            .set_tenant_capability(tenant_id, "saml", true, None)
            .await
            .unwrap();
        let eval = engine.evaluate(&user, "saml").await.unwrap();
        assert!(eval.tenant_allowed && !eval.tenant_enabled);
        assert_eq!(eval.reason.as_deref(), Some("not enabled by tenant"));

        // Enabled; saml has no enrollment gate, so it is usable.
        engine
            .set_feature_enablement(tenant_id, "saml", true, None)
            .await
            .unwrap();
        let eval = engine.evaluate(&user, "saml").await.unwrap();
        assert!(eval.can_use);
        assert!(eval.reason.is_none());
    }

    #[tokio::test]
    async fn enrollment_gated_keys_need_user_enrollment() {
        let engine = engine();
        let tenant_id = Uuid::new_v4();
        let user = tenant_user(tenant_id);
        enable_through_feature(&engine, tenant_id, "mfa").await;

        let eval = engine.evaluate(&user, "mfa").await.unwrap();
        assert!(!eval.can_use);
        assert_eq!(eval.reason.as_deref(), Some("user not enrolled"));

        engine.enroll_user(&user, "mfa", None).await.unwrap();
        let eval = engine.evaluate(&user, "mfa").await.unwrap();
        assert!(eval.can_use);
    }

    #[tokio::test]
    async fn system_principals_bypass_tenant_layers() {
        let engine = engine();
        let user = system_user();
        engine.set_system_capability("mfa", true, None).await.unwrap();

        let eval = engine.evaluate(&user, "mfa").await.unwrap();
        assert!(eval.can_use);
    }

    #[tokio::test]
    async fn tenant_assignment_requires_system_support() {
        let engine = engine();
        let tenant_id = Uuid::new_v4();

        // Key unknown at the system layer.
        let err = engine
            .set_tenant_capability(tenant_id, "saml", true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));

        // Disabled at the system layer is the same.
        engine.set_system_capability("saml", false, None).await.unwrap();
        let err = engine
            .set_tenant_capability(tenant_id, "saml", true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));

        // Disabled assignments may always be written.
        engine
            .set_tenant_capability(tenant_id, "saml", false, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn feature_enable_fails_when_system_disabled() {
        // The literal gating scenario: system kills "saml", the tenant admin
        // tries to enable the feature, nothing is written.
        let engine = engine();
        let tenant_id = Uuid::new_v4();
        engine.set_system_capability("saml", true, None).await.unwrap();
        engine
            .set_tenant_capability(tenant_id, "saml", true, None)
            .await
            .unwrap();
        engine.set_system_capability("saml", false, None).await.unwrap();

        let err = engine
            .set_feature_enablement(tenant_id, "saml", true, None)
            .await
            .unwrap_err();
        match err {
            AuthError::Conflict(reason) => assert_eq!(reason, "not allowed for tenant"),
            other => panic!("expected Conflict, got {:?}", other),
        }
        assert!(engine
            .storage
            .capabilities
            .get_feature(tenant_id, "saml")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn enrollment_fails_without_tenant_enablement() {
        let engine = engine();
        let tenant_id = Uuid::new_v4();
        let user = tenant_user(tenant_id);
        engine.set_system_capability("mfa", true, None).await.unwrap();

        let err = engine.enroll_user(&user, "mfa", None).await.unwrap_err();
        match err {
            AuthError::Conflict(reason) => assert_eq!(reason, "not enabled by tenant"),
            other => panic!("expected Conflict, got {:?}", other),
        }

        // SYSTEM principals bypass the tenant layers on write too.
        let root = system_user();
        engine.enroll_user(&root, "mfa", None).await.unwrap();
    }
}
