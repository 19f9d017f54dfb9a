//! Configuration module for stopmo-xcode
//!
//! Handles loading configuration from TOML files, resolving relative paths and
//! applying environment variable overrides.

pub mod config;

pub use config::*;
