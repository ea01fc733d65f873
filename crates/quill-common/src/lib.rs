//! Quill Common - Shared types and utilities
//!
//! This crate provides the record model, error definitions and
//! configuration shared by all Quill components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CacheConfig, EngineConfig};
pub use error::{Error, ErrorAggregator, Result};
pub use types::*;
