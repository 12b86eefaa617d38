//! lettermill Common - Shared configuration and error types
//!
//! This crate provides the configuration and error types shared across
//! all lettermill components.

pub mod config;
pub mod error;

pub use config::Config;
pub use error::{Error, Result};
