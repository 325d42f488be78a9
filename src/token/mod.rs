pub mod claims;
pub mod keys;
pub mod lifetimes;
pub mod service;

pub use claims::{Acr, ActClaim, Claims, ClaimsBuilder, IdClaims};
pub use keys::{KeyRing, SigningKey};
pub use lifetimes::{LifetimeResolver, TenantTokenSettings, TokenLifetimes};
pub use service::{IssuedTokens, TokenError, TokenService};
