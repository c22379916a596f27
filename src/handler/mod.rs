//! Handler module - service dispatch contracts and the method registry.
//!
//! Provides:
//! - [`ServiceHost`] - the dispatch contract the connection engine invokes
//! - [`MethodRegistry`] - a name-keyed registry of typed handlers
//! - [`ReceiveContext`] / [`SendContext`] - per-message context records
//!
//! # Example
//!
//! ```ignore
//! use epoxy_core::handler::MethodRegistry;
//!
//! let registry = MethodRegistry::new()
//!     .on_request("Echo", |text: String, _ctx| async move { Ok(text) })
//!     .on_event("Ping", |_: (), _ctx| async move {});
//! ```

mod context;
mod registry;

pub use context::{ReceiveContext, SendContext};
pub use registry::{BoxFuture, MethodRegistry, ServiceHost};
