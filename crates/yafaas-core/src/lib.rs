//! yafaas Core Library
//!
//! Shared functionality for the yafaas host:
//! - Configuration resolution and layering
//! - Common error types
//! - Tracing subscriber setup

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, CrashPolicy, ServerSettings, WorkerSettings};
pub use error::{Error, Result};
