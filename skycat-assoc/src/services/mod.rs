//! Association services
//!
//! Pure (or store-agnostic) building blocks driven by the session
//! orchestrator: cone search → positional matching → merge / null tracking →
//! reference cross-matching.

pub mod catalog_maintenance;
pub mod cone_search;
pub mod crossmatch_engine;
pub mod merge_policy;
pub mod null_tracker;
pub mod positional_matcher;

pub use catalog_maintenance::{
    unmatched_sources, withdraw_catalog, withdraw_catalog_from, CatalogWithdrawal,
};
pub use cone_search::{search_catalog, search_reference, within_cone, ConeQuery};
pub use crossmatch_engine::{CrossMatchEngine, CrossMatchOutcome};
pub use merge_policy::{create, merge, weighted_merge};
pub use null_tracker::record_nulls;
pub use positional_matcher::{
    assign, de_ruiter_radius, validate_detection, Assignment, MatchCandidate, MeasuredPosition,
};
