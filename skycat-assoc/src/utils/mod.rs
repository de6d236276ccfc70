//! Utility modules for skycat-assoc

pub mod conflict_retry;
pub mod session_tx;

pub use conflict_retry::{retry_on_conflict, RetryOutcome};
pub use session_tx::SessionTransaction;
