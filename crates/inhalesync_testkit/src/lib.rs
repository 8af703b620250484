//! # Inhalesync Testkit
//!
//! Test utilities for the inhalesync engine.
//!
//! This crate provides:
//! - Fixed timestamps and record builders
//! - A harness wiring the engine to in-memory stores and recording hooks
//! - A simulated service of record with paging and failure injection
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use inhalesync_testkit::prelude::*;
//!
//! #[test]
//! fn uploads_dirty_device() {
//!     let harness = Harness::simulated();
//!     harness.stores.devices.put(dirty_device("SN-1", at(0)));
//!     harness.sync();
//!     assert_eq!(harness.gateway.cloud().devices.len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod service;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::service::*;
}

pub use fixtures::*;
pub use generators::*;
pub use service::*;
