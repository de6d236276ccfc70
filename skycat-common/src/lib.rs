//! # SkyCat Common Library
//!
//! Shared code for the SkyCat crates:
//! - Error taxonomy with stable reason codes
//! - TOML configuration loading and validation
//! - Catalog database schema and migrations

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;

pub use error::{Error, Result};
