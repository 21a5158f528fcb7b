//! Downstream adapters for the credgate execution gateway.
//!
//! An adapter performs the side effect of a confirmed action using the
//! credential the gateway hands it. The gateway owns validation, idempotency,
//! rate limiting and credential freshness; adapters only translate an action
//! into a provider request and classify the response.
//!
//! - [`HttpActionAdapter`] - generic JSON-over-HTTP adapter driven by
//!   [`HttpAdapterConfig`]
//! - [`github`] - GitHub issue actions built on it

mod http;
pub mod github;

pub use http::{EndpointConfig, HttpActionAdapter, HttpAdapterConfig};
