//! Association session state machine
//!
//! One session associates one image batch:
//! OPENED → SEARCHED → MATCHED → MERGED → (CROSS_MATCHED) → COMMITTED,
//! with ABORTED reachable from any non-terminal state.

use crate::models::{DetectionId, SourceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skycat_common::{Error, Result};
use uuid::Uuid;

/// Association session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Transaction open, nothing read yet
    Opened,
    /// Region cone search done
    Searched,
    /// Detections assigned to candidates
    Matched,
    /// Merges, creations and null increments staged
    Merged,
    /// Reference catalog annotations staged
    CrossMatched,
    /// Transaction committed
    Committed,
    /// Transaction dropped, store unchanged
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Committed | SessionState::Aborted)
    }

    /// Legal successor states
    fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        if next == Aborted {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Opened, Searched)
                | (Searched, Matched)
                | (Matched, Merged)
                | (Merged, CrossMatched)
                | (Merged, Committed)
                | (CrossMatched, Committed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Opened => "OPENED",
            SessionState::Searched => "SEARCHED",
            SessionState::Matched => "MATCHED",
            SessionState::Merged => "MERGED",
            SessionState::CrossMatched => "CROSS_MATCHED",
            SessionState::Committed => "COMMITTED",
            SessionState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// State transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub session_id: Uuid,
    pub old_state: SessionState,
    pub new_state: SessionState,
    pub transitioned_at: DateTime<Utc>,
}

/// Association session (in-memory state)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationSession {
    pub session_id: Uuid,
    pub image_id: String,
    pub state: SessionState,
    /// 1-based attempt number (retries after write conflicts)
    pub attempt: u32,
    pub transitions: Vec<StateTransition>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl AssociationSession {
    pub fn new(image_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            image_id: image_id.into(),
            state: SessionState::Opened,
            attempt,
            transitions: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Transition to a new state, rejecting illegal moves
    pub fn transition_to(&mut self, new_state: SessionState) -> Result<StateTransition> {
        if !self.state.can_transition_to(new_state) {
            return Err(Error::Internal(format!(
                "illegal session transition {} -> {}",
                self.state, new_state
            )));
        }

        let transition = StateTransition {
            session_id: self.session_id,
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        self.state = new_state;

        if new_state.is_terminal() {
            self.ended_at = Some(transition.transitioned_at);
        }

        self.transitions.push(transition.clone());
        Ok(transition)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Why a detection took no part in association
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RejectionReason {
    InvalidMeasurement(String),
    /// Outside the region searched for known sources
    OutsideSearchRegion,
    /// Already merged into a catalog record by an earlier session
    AlreadyAssociated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedDetection {
    pub detection_id: DetectionId,
    pub reason: RejectionReason,
}

/// Result of a committed session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub image_id: String,
    pub attempts: u32,
    /// Records created from unmatched detections
    pub created: Vec<SourceId>,
    /// (detection, record) merges in assignment order
    pub merged: Vec<(DetectionId, SourceId)>,
    /// Records whose null count was incremented
    pub null_incremented: Vec<SourceId>,
    /// Records whose reference catalog annotation changed
    pub cross_matched: Vec<SourceId>,
    pub rejected: Vec<RejectedDetection>,
    pub transitions: Vec<StateTransition>,
}

/// Per-image result reported by the runner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageReport {
    Committed(SessionOutcome),
    /// Image was already associated; nothing written
    Skipped { image_id: String, reason: String },
    Failed {
        image_id: String,
        reason_code: String,
        message: String,
        attempts: u32,
    },
}

impl ImageReport {
    pub fn image_id(&self) -> &str {
        match self {
            ImageReport::Committed(outcome) => &outcome.image_id,
            ImageReport::Skipped { image_id, .. } => image_id,
            ImageReport::Failed { image_id, .. } => image_id,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, ImageReport::Committed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_path_with_crossmatch() {
        let mut session = AssociationSession::new("img1", 1);
        for state in [
            SessionState::Searched,
            SessionState::Matched,
            SessionState::Merged,
            SessionState::CrossMatched,
            SessionState::Committed,
        ] {
            session.transition_to(state).unwrap();
        }
        assert!(session.is_terminal());
        assert!(session.ended_at.is_some());
        assert_eq!(session.transitions.len(), 5);
        assert_eq!(session.transitions[0].old_state, SessionState::Opened);
    }

    #[test]
    fn test_crossmatch_is_optional() {
        let mut session = AssociationSession::new("img1", 1);
        session.transition_to(SessionState::Searched).unwrap();
        session.transition_to(SessionState::Matched).unwrap();
        session.transition_to(SessionState::Merged).unwrap();
        assert!(session.transition_to(SessionState::Committed).is_ok());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut session = AssociationSession::new("img1", 1);
        let err = session.transition_to(SessionState::Merged).unwrap_err();
        assert_eq!(err.reason_code(), "INTERNAL_ERROR");
        assert_eq!(session.state, SessionState::Opened);
        assert!(session.transitions.is_empty());
    }

    #[test]
    fn test_abort_from_any_non_terminal_state() {
        let mut session = AssociationSession::new("img1", 1);
        session.transition_to(SessionState::Searched).unwrap();
        session.transition_to(SessionState::Aborted).unwrap();
        assert!(session.is_terminal());

        // No way out of a terminal state
        assert!(session.transition_to(SessionState::Aborted).is_err());
        assert!(session.transition_to(SessionState::Searched).is_err());
    }

    #[test]
    fn test_report_serializes_with_status_tag() {
        let report = ImageReport::Failed {
            image_id: "img9".to_string(),
            reason_code: "WRITE_CONFLICT".to_string(),
            message: "row changed".to_string(),
            attempts: 4,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["reason_code"], "WRITE_CONFLICT");
        assert_eq!(report.image_id(), "img9");
    }
}
