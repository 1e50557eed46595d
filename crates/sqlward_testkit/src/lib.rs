//! # SQLWard Testkit
//!
//! Test utilities for SQLWard.
//!
//! This crate provides:
//! - Test fixtures and database helpers
//! - Corruption helpers and a fault-injecting file system
//! - Property-based test generators using proptest
//! - Concurrent stress harnesses
//!
//! ## Usage
//!
//! ```rust
//! use sqlward_testkit::prelude::*;
//!
//! let db = TestDatabase::new();
//! populate(&db, "items", 10).unwrap();
//! assert_eq!(row_count(&db, "items").unwrap(), 10);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
