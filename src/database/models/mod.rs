pub mod audit_event;
pub mod capability;
pub mod credential;
pub mod federated_identity;
pub mod oauth_client;
pub mod refresh_token;
pub mod role;
pub mod tenant;
pub mod user;

pub use audit_event::{AuditActor, AuditEvent, AuditQuery, AuditResult, AuditTarget};
pub use capability::{
    CapabilityEvaluation, SystemCapability, TenantCapability, TenantFeatureEnablement,
    UserCapabilityState,
};
pub use credential::Credential;
pub use federated_identity::FederatedIdentity;
pub use oauth_client::OAuthClient;
pub use refresh_token::RefreshToken;
pub use role::{Permission, Role, RolePlane};
pub use tenant::{Tenant, TenantStatus};
pub use user::{PrincipalType, User, UserStatus};
