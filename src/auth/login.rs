use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::audit::AuditRecorder;
use crate::capability::CapabilityEngine;
use crate::database::models::{AuditEvent, AuditResult, PrincipalType, Role, User};
use crate::error::AuthError;
use crate::mfa::{MfaError, MfaService, MfaVerified};
use crate::storage::Storage;
use crate::token::{Acr, ClaimsBuilder, IssuedTokens, LifetimeResolver, TokenService};

/// Login input. `tenant_id` pins the lookup to one tenant; without it the
/// SYSTEM namespace is tried first and then the tenant resolved from the
/// request's domain header.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub tenant_id: Option<Uuid>,
    #[serde(default)]
    pub remember_me: bool,
    #[serde(skip)]
    pub domain: Option<String>,
    #[serde(skip)]
    pub source_ip: Option<String>,
    #[serde(skip)]
    pub user_agent: Option<String>,
}

/// The verified output of an external federation flow.
#[derive(Debug, Clone, Deserialize)]
pub struct FederationResult {
    pub provider_id: Uuid,
    pub external_id: String,
    pub attributes: Option<Value>,
}

impl FederationResult {
    fn attribute(&self, key: &str) -> Option<String> {
        self.attributes
            .as_ref()
            .and_then(|a| a.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// What a login attempt produces when the credentials are right.
pub enum LoginOutcome {
    Tokens(Box<IssuedTokens>),
    MfaRequired {
        user_id: Uuid,
        session_id: Uuid,
        enrollment_required: bool,
    },
}

/// Orchestrates LOOKUP -> VERIFY_PWD -> MFA decision -> ISSUE. The sole
/// caller that mints tokens for end-user authentication.
#[derive(Clone)]
pub struct LoginService {
    storage: Storage,
    credentials: super::CredentialVerifier,
    capabilities: CapabilityEngine,
    mfa: MfaService,
    tokens: Arc<TokenService>,
    claims: ClaimsBuilder,
    lifetimes: LifetimeResolver,
    audit: AuditRecorder,
}

impl LoginService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Storage,
        credentials: super::CredentialVerifier,
        capabilities: CapabilityEngine,
        mfa: MfaService,
        tokens: Arc<TokenService>,
        claims: ClaimsBuilder,
        lifetimes: LifetimeResolver,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            storage,
            credentials,
            capabilities,
            mfa,
            tokens,
            claims,
            lifetimes,
            audit,
        }
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<LoginOutcome, AuthError> {
        let user = match self.lookup(request).await {
            Ok(user) => user,
            Err(e) => {
                self.record_failure(request, None, failure_reason(&e));
                return Err(e);
            }
        };

        if let Err(e) = self.credentials.verify(user.id, &request.password).await {
            self.record_failure(request, Some(&user), failure_reason(&e));
            return Err(e);
        }

        if self.mfa_required(&user).await? {
            let enrolled = user.mfa_enabled;
            let session_id = if enrolled {
                self.mfa.begin_challenge(&user).await
            } else {
                self.mfa.begin_pending_enrollment(&user).await
            }
            .map_err(mfa_to_auth)?;

            self.audit.emit(
                AuditEvent::new("login.mfa_required", AuditResult::Success)
                    .with_actor(user.id, &user.username, user.principal_type)
                    .with_tenant(user.tenant_id)
                    .with_metadata(json!({ "enrollment_required": !enrolled }))
                    .with_source(request.source_ip.clone(), request.user_agent.clone()),
            );

            return Ok(LoginOutcome::MfaRequired {
                user_id: user.id,
                session_id,
                enrollment_required: !enrolled,
            });
        }

        let tokens = self
            .issue(&user, Acr::Pwd, request.remember_me, None, None)
            .await?;
        self.record_success(request, &user);
        Ok(LoginOutcome::Tokens(Box::new(tokens)))
    }

    /// Complete a login after the MFA challenge or enrollment verified.
    pub async fn complete_mfa(
        &self,
        session_id: Uuid,
        code: &str,
        remember_me: bool,
    ) -> Result<(User, IssuedTokens), MfaError> {
        let verified = self.mfa.verify(session_id, code).await?;
        let user = match verified {
            MfaVerified::Enrolled { user } | MfaVerified::Challenged { user } => user,
        };
        let tokens = self
            .issue(&user, Acr::Mfa, remember_me, None, None)
            .await
            .map_err(MfaError::Auth)?;

        self.audit.emit(
            AuditEvent::new("login.success", AuditResult::Success)
                .with_actor(user.id, &user.username, user.principal_type)
                .with_tenant(user.tenant_id)
                .with_metadata(json!({ "acr": "mfa" })),
        );
        Ok((user, tokens))
    }

    /// Build claims and mint a token set for an authenticated principal.
    /// Used by the password path, the MFA path, and impersonation.
    pub async fn issue(
        &self,
        user: &User,
        acr: Acr,
        remember_me: bool,
        client: Option<(&str, &str)>,
        impersonator: Option<&User>,
    ) -> Result<IssuedTokens, AuthError> {
        let settings = match user.tenant_id {
            Some(tenant_id) => self.storage.tenants.get_token_settings(tenant_id).await?,
            None => None,
        };
        let lifetimes = self.lifetimes.resolve(settings.as_ref());
        let (access_ttl, refresh_ttl) = lifetimes.session_pair(remember_me);

        let roles = self.storage.roles.roles_for_user(user.id).await?;
        let permissions = self.storage.roles.permissions_for_user(user.id).await?;
        let capabilities = match user.tenant_id {
            Some(tenant_id) => {
                self.storage
                    .capabilities
                    .snapshot_for_tenant(tenant_id)
                    .await?
            }
            None => HashMap::new(),
        };

        let (audience, scope) = match client {
            Some((client_id, scope)) => (Some(client_id), Some(scope)),
            None => (None, None),
        };
        let claims = self.claims.access_claims(
            user,
            &roles,
            &permissions,
            &capabilities,
            acr,
            access_ttl,
            audience,
            scope,
            impersonator,
        );
        let id_claims = self.claims.id_claims(user, lifetimes.id, audience);

        self.tokens
            .issue(
                claims,
                Some(id_claims),
                refresh_ttl,
                remember_me,
                audience.map(str::to_string),
            )
            .await
            .map_err(|e| match e {
                crate::token::TokenError::Storage(inner) => inner,
                other => AuthError::Internal(other.to_string()),
            })
    }

    /// Consume a verified external identity: link to an existing principal
    /// or create one, then issue tokens. The federation protocol (SAML,
    /// OIDC) is handled outside the core; only its result lands here.
    pub async fn login_federated(
        &self,
        tenant_id: Uuid,
        result: &FederationResult,
    ) -> Result<(User, IssuedTokens), AuthError> {
        let user = match self
            .storage
            .federated_identities
            .find(result.provider_id, &result.external_id)
            .await?
        {
            Some(identity) => self
                .storage
                .users
                .get(identity.user_id)
                .await?
                .filter(|u| u.is_active())
                .ok_or(AuthError::Unauthenticated)?,
            None => {
                let username = result
                    .attribute("username")
                    .or_else(|| result.attribute("email"))
                    .ok_or_else(|| {
                        AuthError::InputInvalid("federated identity carries no username".to_string())
                    })?;
                let email = result.attribute("email").unwrap_or_else(|| username.clone());

                let user = match self
                    .storage
                    .users
                    .find_by_username(Some(tenant_id), &username)
                    .await?
                {
                    Some(existing) => existing,
                    None => {
                        let now = chrono::Utc::now();
                        let user = User {
                            id: Uuid::new_v4(),
                            principal_type: PrincipalType::Tenant,
                            tenant_id: Some(tenant_id),
                            username,
                            email,
                            status: crate::database::models::UserStatus::Active,
                            mfa_enabled: false,
                            totp_secret_enc: None,
                            created_at: now,
                            updated_at: now,
                            deleted_at: None,
                        };
                        self.storage.users.create(&user).await?;
                        user
                    }
                };

                self.storage
                    .federated_identities
                    .link(&crate::database::models::FederatedIdentity {
                        id: Uuid::new_v4(),
                        user_id: user.id,
                        provider_id: result.provider_id,
                        external_id: result.external_id.clone(),
                        attributes: result.attributes.clone(),
                        linked_at: chrono::Utc::now(),
                    })
                    .await?;
                user
            }
        };

        let tokens = self.issue(&user, Acr::Pwd, false, None, None).await?;
        self.audit.emit(
            AuditEvent::new("login.federated", AuditResult::Success)
                .with_actor(user.id, &user.username, user.principal_type)
                .with_tenant(user.tenant_id)
                .with_metadata(json!({ "provider_id": result.provider_id })),
        );
        Ok((user, tokens))
    }

    /// LOOKUP: plane-aware principal resolution. Misses are uniformly
    /// `Unauthenticated` so usernames cannot be enumerated.
    async fn lookup(&self, request: &LoginRequest) -> Result<User, AuthError> {
        let user = match request.tenant_id {
            Some(tenant_id) => {
                self.storage
                    .users
                    .find_by_username(Some(tenant_id), &request.username)
                    .await?
            }
            None => {
                // SYSTEM plane first, then the tenant resolved from the
                // request's domain.
                match self
                    .storage
                    .users
                    .find_by_username(None, &request.username)
                    .await?
                {
                    Some(user) => Some(user),
                    None => match &request.domain {
                        Some(domain) => {
                            match self.storage.tenants.find_by_domain(domain).await? {
                                Some(tenant) => {
                                    self.storage
                                        .users
                                        .find_by_username(Some(tenant.id), &request.username)
                                        .await?
                                }
                                None => None,
                            }
                        }
                        None => None,
                    },
                }
            }
        };

        let user = user.ok_or(AuthError::Unauthenticated)?;
        if !user.is_active() {
            return Err(AuthError::Unauthenticated);
        }
        if let Some(tenant_id) = user.tenant_id {
            let tenant = self
                .storage
                .tenants
                .get(tenant_id)
                .await?
                .ok_or(AuthError::Unauthenticated)?;
            if !tenant.is_active() {
                return Err(AuthError::Unauthenticated);
            }
        }
        Ok(user)
    }

    /// MFA is demanded when the tenant has the capability enabled and the
    /// policy covers this principal's roles. SYSTEM principals follow the
    /// platform switch alone.
    async fn mfa_required(&self, user: &User) -> Result<bool, AuthError> {
        let evaluation = self.capabilities.evaluate(user, "mfa").await?;
        if !evaluation.tenant_enabled {
            return Ok(false);
        }
        if user.principal_type == PrincipalType::System {
            return Ok(true);
        }
        let Some(tenant_id) = user.tenant_id else {
            return Ok(false);
        };
        let configuration = self
            .storage
            .capabilities
            .get_feature(tenant_id, "mfa")
            .await?
            .and_then(|f| f.configuration);
        let roles = self.storage.roles.roles_for_user(user.id).await?;
        Ok(mfa_policy_applies(configuration.as_ref(), &roles))
    }

    fn record_success(&self, request: &LoginRequest, user: &User) {
        self.audit.emit(
            AuditEvent::new("login.success", AuditResult::Success)
                .with_actor(user.id, &user.username, user.principal_type)
                .with_tenant(user.tenant_id)
                .with_metadata(json!({ "acr": "pwd", "remember_me": request.remember_me }))
                .with_source(request.source_ip.clone(), request.user_agent.clone()),
        );
    }

    fn record_failure(&self, request: &LoginRequest, user: Option<&User>, reason: &str) {
        let mut event = AuditEvent::new("login.failure", AuditResult::Failure)
            .with_metadata(json!({ "reason": reason, "username": request.username }))
            .with_source(request.source_ip.clone(), request.user_agent.clone());
        if let Some(user) = user {
            event = event
                .with_actor(user.id, &user.username, user.principal_type)
                .with_tenant(user.tenant_id);
        } else {
            event = event.with_tenant(request.tenant_id);
        }
        self.audit.emit(event);
    }
}

/// Whether the tenant's MFA policy covers a principal with these roles.
/// `required_roles` narrows the policy; absent, it applies to everyone.
fn mfa_policy_applies(configuration: Option<&Value>, roles: &[Role]) -> bool {
    let Some(required) = configuration
        .and_then(|c| c.get("required_roles"))
        .and_then(|v| v.as_array())
    else {
        return true;
    };
    roles.iter().any(|role| {
        required
            .iter()
            .any(|name| name.as_str() == Some(role.name.as_str()))
    })
}

/// Reason code recorded in the audit trail; never sent to the client.
fn failure_reason(err: &AuthError) -> &'static str {
    match err {
        AuthError::Unauthenticated => "bad_credentials",
        AuthError::Locked => "account_locked",
        AuthError::StorageFailure(_) => "storage",
        AuthError::Cancelled => "cancelled",
        _ => "other",
    }
}

fn mfa_to_auth(err: MfaError) -> AuthError {
    match err {
        MfaError::Auth(inner) => inner,
        other => AuthError::Internal(other.to_string()),
    }
}
