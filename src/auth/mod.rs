pub mod credentials;
pub mod login;

pub use credentials::CredentialVerifier;
pub use login::{FederationResult, LoginOutcome, LoginRequest, LoginService};
