//! skycat-assoc library interface
//!
//! Source association and reference cross-matching for a catalog of
//! repeatedly observed point sources. Each image batch is associated as one
//! atomic session against a [`store::CatalogStore`].

pub mod geometry;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;
pub mod workflow;

pub use store::{
    CatalogStore, CatalogTransaction, MemoryCatalogStore, MemoryReferenceCatalog,
    ReferenceCatalog, SqliteCatalogStore, SqliteReferenceCatalog,
};
pub use workflow::{AssociationRunner, SessionOrchestrator};
