//! # Nautilus Shared State
//!
//! Process-wide key/value registry whose entries are handed to script handlers
//! as typed bindings.
//!
//! Handlers never see the live store: every execution context receives a
//! [`GlobalSnapshot`] taken when the context is built, so a write that lands
//! mid-request cannot change what an in-flight handler observes.
//!
//! ## Example
//!
//! ```rust
//! use nautilus_state::GlobalStore;
//! use serde_json::json;
//!
//! let store = GlobalStore::new();
//! store.define("region", json!("eu-west"), true).unwrap();
//!
//! let snapshot = store.snapshot();
//! assert!(store.update_value("region", json!("us-east")).is_err());
//! assert_eq!(snapshot.get("region"), Some(&json!("eu-west")));
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod error;
mod store;

pub use error::{Result, StateError};
pub use store::{GlobalEntry, GlobalSnapshot, GlobalStore};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Result, StateError};
    pub use crate::store::{GlobalEntry, GlobalSnapshot, GlobalStore};
}
