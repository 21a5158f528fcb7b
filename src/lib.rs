//! credgate: credential lifecycle and execution gating.
//!
//! Stores per-actor OAuth credentials encrypted at rest, keeps them fresh
//! without refresh stampedes across workers, and gates side-effecting
//! actions behind preview/execute with idempotency and rate limiting.
//!
//! # Components
//!
//! - [`credentials`] - encrypted durable store plus a fast credential cache
//! - [`refresh`] - refresh coordinator with a distributed lock
//! - [`rate_limit`] - distributed fixed window / local token bucket, fails open
//! - [`gateway`] - preview/execute with idempotency records
//! - [`oauth`] - PKCE authorization handshake helpers
//! - [`kv`] - the distributed cache every worker shares
//! - [`bootstrap`] - wires all of the above from [`config::GateConfig`]

pub mod bootstrap;
pub mod config;
pub mod credentials;
pub mod degraded;
pub mod error;
pub mod gateway;
pub mod kv;
pub mod metrics;
pub mod oauth;
pub mod rate_limit;
pub mod refresh;

pub use bootstrap::Gate;
pub use error::{ErrorReason, GateError};
