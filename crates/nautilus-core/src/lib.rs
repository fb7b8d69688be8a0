//! # Nautilus Core
//!
//! Core types and error handling shared by every Nautilus crate.
//!
//! This crate provides the foundational abstractions used throughout the host:
//! - Error types and their HTTP status mapping
//! - Response body type and response builder
//! - Typed value bindings shared between the global store and the compilers

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod response;
pub mod types;

pub use error::{Error, Result};
pub use response::{empty_body, full_body, Body, ResponseBuilder};
pub use types::*;

// Re-export commonly used HTTP types
pub use bytes::Bytes;
pub use http::{Method, Request, Response, StatusCode};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::response::{Body, ResponseBuilder};
    pub use crate::types::*;
}
