//! Authorization handshake helpers.
//!
//! Starting a flow stores a one-time [`AuthorizationState`] carrying the PKCE
//! verifier; the callback consumes it, exchanges the code and hands the
//! resulting credential to [`crate::credentials::CredentialStore::store`].
//! Routing and UI are left to the embedding service.

mod exchange;
mod pkce;
mod provider;
mod state;

pub use exchange::{exchange_code, TokenGrant, DEFAULT_GRANT_LIFETIME_SECS};
pub use pkce::{generate_code_challenge, generate_code_verifier, generate_state};
pub use provider::ProviderConfig;
pub use state::{AuthorizationState, AuthorizationStateStore, STATE_TTL};
