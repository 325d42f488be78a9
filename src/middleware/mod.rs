pub mod auth;
pub mod permission;
pub mod rate_limit;
pub mod tenant;

pub use auth::{jwt_auth_middleware, PrincipalContext};
pub use permission::{require_permission, require_scope, require_system_principal};
pub use rate_limit::{rate_limit_middleware, RateLimiter};
pub use tenant::resolve_tenant;
