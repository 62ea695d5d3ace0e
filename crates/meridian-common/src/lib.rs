//! Meridian Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration, checksums and
//! identity types used by every Meridian component.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::ChecksumCalculator;
pub use config::Config;
pub use error::{ConsistencyKind, Error, Result};
pub use types::*;
