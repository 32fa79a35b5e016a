//! nvctl Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, transport and path identity
//! value types, qualified-name validation and configuration structures
//! used across all nvctl components.

pub mod config;
pub mod error;
pub mod nqn;
pub mod types;

pub use config::{DaemonConfig, GlobalOptions, HotplugConfig, TargetConfig};
pub use error::{Error, Result};
pub use nqn::Nqn;
pub use types::*;
