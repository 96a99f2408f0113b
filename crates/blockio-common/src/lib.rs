//! Blockio Common - Shared types and utilities
//!
//! This crate provides the types, error definitions, and configuration
//! structures shared by the blockio image-management components.

pub mod config;
pub mod error;
pub mod features;
pub mod types;

pub use config::CreateDefaults;
pub use error::{Error, Result};
pub use features::FeatureSet;
pub use types::*;
