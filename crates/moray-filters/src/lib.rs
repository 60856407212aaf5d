//! # Moray Filters
//!
//! Built-in filter kinds:
//! - `Validator`: authenticates requests with header rules, JWT, OAuth2,
//!   HMAC signatures, and Basic-Auth backed by a credential store
//! - `RequestAdaptor`: declarative request path rewriting

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod adaptor;
pub mod validator;

pub use adaptor::RequestAdaptor;
pub use validator::ValidatorFilter;

use moray_core::{FilterRegistry, Result};

/// A registry populated with every built-in filter kind
pub fn builtin_registry() -> Result<FilterRegistry> {
    let mut registry = FilterRegistry::new();
    registry.register(validator::record())?;
    registry.register(adaptor::record())?;
    Ok(registry)
}
