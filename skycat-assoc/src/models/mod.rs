//! Data models for the association engine

pub mod associated_source;
pub mod detection;
pub mod reference;
pub mod session;

pub use associated_source::{AssociatedSource, CatalogMatch, SourceId};
pub use detection::{
    ConfigClass, Detection, DetectionId, FluxDensity, ImageBatch, ImageInfo, SourceShape,
};
pub use reference::ReferenceSource;
pub use session::{
    AssociationSession, ImageReport, RejectedDetection, RejectionReason, SessionOutcome,
    SessionState, StateTransition,
};
