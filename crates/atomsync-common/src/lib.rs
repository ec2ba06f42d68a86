//! atomsync Common - Shared types and utilities
//!
//! This crate provides the identifiers, the closed set of atom kinds, the
//! error taxonomy and the configuration structures used across the atomsync
//! components.

pub mod config;
pub mod error;
pub mod kind;
pub mod types;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use kind::{AtomKind, UnknownKind};
pub use types::*;
