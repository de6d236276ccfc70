//! Catalog database schema and initialization

pub mod init;
pub mod migrations;

pub use init::*;
pub use migrations::*;
