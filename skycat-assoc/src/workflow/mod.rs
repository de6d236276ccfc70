//! Association workflow
//!
//! - [`SessionOrchestrator`]: one image, one transaction, one state machine
//! - [`AssociationRunner`]: many images concurrently with conflict retry

pub mod runner;
pub mod session_orchestrator;

pub use runner::AssociationRunner;
pub use session_orchestrator::SessionOrchestrator;
