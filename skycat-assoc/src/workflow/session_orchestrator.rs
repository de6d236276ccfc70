//! Per-image association session orchestration
//!
//! Drives one [`AssociationSession`] through its states inside a single
//! catalog transaction:
//! 1. Open the transaction, refuse already-processed images
//! 2. Validate detections
//! 3. Region cone search around the image center (SEARCHED)
//! 4. Per-detection candidate cones and greedy assignment (MATCHED); cones
//!    that extend past the region are read through the transaction
//! 5. Merge, create and null-increment records (MERGED)
//! 6. Optional reference cross-match (CROSS_MATCHED)
//! 7. Commit (COMMITTED)
//!
//! Any error aborts the session and drops the transaction, leaving the store
//! unchanged.

use crate::geometry::{angular_separation, candidate_radius, search_radius};
use crate::models::{
    AssociatedSource, AssociationSession, Detection, ImageBatch, RejectedDetection,
    RejectionReason, SessionOutcome, SessionState, SourceId,
};
use crate::services::{
    assign, create, merge, record_nulls, search_catalog, validate_detection, within_cone,
    ConeQuery, CrossMatchEngine,
};
use crate::store::{CatalogStore, CatalogTransaction, ReferenceCatalog};
use skycat_common::config::{AssociationConfig, InvalidMeasurementPolicy, MatchScope};
use skycat_common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Records written by a session, before commit
#[derive(Default)]
struct StagedChanges {
    created: Vec<SourceId>,
    merged: Vec<(String, SourceId)>,
    null_incremented: Vec<SourceId>,
    cross_matched: Vec<SourceId>,
    rejected: Vec<RejectedDetection>,
}

/// Session-level association orchestrator
///
/// Shared by all concurrent workers; holds only immutable configuration and
/// store handles.
pub struct SessionOrchestrator {
    store: Arc<dyn CatalogStore>,
    reference: Option<Arc<dyn ReferenceCatalog>>,
    config: AssociationConfig,
    crossmatch: Option<CrossMatchEngine>,
}

impl SessionOrchestrator {
    /// Create an orchestrator, validating the configuration up front
    pub fn new(
        store: Arc<dyn CatalogStore>,
        reference: Option<Arc<dyn ReferenceCatalog>>,
        config: AssociationConfig,
    ) -> Result<Self> {
        config.validate()?;

        let crossmatch = if config.crossmatch_enabled {
            if reference.is_none() {
                return Err(Error::Config(
                    "cross-matching enabled but no reference catalog store provided".to_string(),
                ));
            }
            Some(CrossMatchEngine::from_config(&config))
        } else {
            None
        };

        Ok(Self {
            store,
            reference,
            config,
            crossmatch,
        })
    }

    pub fn config(&self) -> &AssociationConfig {
        &self.config
    }

    /// Associate one image batch as a single atomic session
    ///
    /// # Arguments
    /// * `batch` - Image pointing plus its detections
    /// * `attempt` - 1-based attempt number (for logging and the outcome)
    /// * `cancel_token` - Checked before every state transition
    pub async fn associate(
        &self,
        batch: &ImageBatch,
        attempt: u32,
        cancel_token: &CancellationToken,
    ) -> Result<SessionOutcome> {
        let mut session = AssociationSession::new(batch.image_id(), attempt);

        tracing::info!(
            session_id = %session.session_id,
            image_id = %session.image_id,
            attempt,
            detections = batch.detections.len(),
            "Starting association session"
        );

        let mut tx = self.store.begin().await?;

        let staged = match self
            .stage(&mut session, tx.as_mut(), batch, cancel_token)
            .await
        {
            Ok(staged) => staged,
            Err(err) => return Err(abort(&mut session, tx, err).await),
        };

        if cancel_token.is_cancelled() {
            let err = Error::Cancelled(format!("image {} cancelled before commit", batch.image_id()));
            return Err(abort(&mut session, tx, err).await);
        }

        if let Err(err) = tx.commit().await {
            if let Err(e) = session.transition_to(SessionState::Aborted) {
                tracing::warn!(session_id = %session.session_id, error = %e, "Abort transition rejected");
            }
            log_abort(&session, &err);
            return Err(err);
        }
        transition(&mut session, SessionState::Committed)?;

        tracing::info!(
            session_id = %session.session_id,
            image_id = %session.image_id,
            attempt,
            created = staged.created.len(),
            merged = staged.merged.len(),
            nulls = staged.null_incremented.len(),
            cross_matched = staged.cross_matched.len(),
            rejected = staged.rejected.len(),
            "Association session committed"
        );

        Ok(SessionOutcome {
            session_id: session.session_id,
            image_id: session.image_id.clone(),
            attempts: attempt,
            created: staged.created,
            merged: staged.merged,
            null_incremented: staged.null_incremented,
            cross_matched: staged.cross_matched,
            rejected: staged.rejected,
            transitions: session.transitions,
        })
    }

    /// Everything up to (not including) the commit
    async fn stage(
        &self,
        session: &mut AssociationSession,
        tx: &mut dyn CatalogTransaction,
        batch: &ImageBatch,
        cancel_token: &CancellationToken,
    ) -> Result<StagedChanges> {
        let image = &batch.image;
        let mut staged = StagedChanges::default();

        if tx.is_image_processed(&image.image_id).await? {
            return Err(Error::AlreadyProcessed(image.image_id.clone()));
        }

        let accepted = self.screen_detections(tx, batch, &mut staged).await?;

        // ====================================================================
        // Region search
        // ====================================================================
        let region_radius = search_radius(image.fov_radius_deg, image.config.beam_deg, &self.config)?;
        checkpoint(session, cancel_token)?;
        let query = ConeQuery::new(image.center, region_radius)
            .with_class(image.config.clone(), self.config.compatibility);
        let region = search_catalog(tx, &query).await?;
        transition(session, SessionState::Searched)?;

        tracing::debug!(
            session_id = %session.session_id,
            region_radius_deg = region_radius,
            known_sources = region.len(),
            "Region search complete"
        );

        let mut to_match: Vec<Detection> = Vec::with_capacity(accepted.len());
        for det in accepted {
            if self.config.restrict_to_search_region
                && angular_separation(image.center, det.position()) > region_radius
            {
                staged.rejected.push(RejectedDetection {
                    detection_id: det.id.clone(),
                    reason: RejectionReason::OutsideSearchRegion,
                });
            } else {
                to_match.push(det);
            }
        }

        // ====================================================================
        // Matching
        // ====================================================================
        let rule = self.config.compatibility;
        let mut known: HashMap<SourceId, AssociatedSource> =
            region.iter().map(|r| (r.id, r.clone())).collect();
        let mut candidate_ids: Vec<Vec<SourceId>> = Vec::with_capacity(to_match.len());
        let mut edge_cones = 0usize;

        for det in &to_match {
            let radius = candidate_radius(det.config.beam_deg, &self.config)?;
            let ids = if angular_separation(image.center, det.position()) + radius <= region_radius {
                within_cone(&region, det.position(), radius)
                    .into_iter()
                    .filter(|r| {
                        rule.accepts(
                            &det.config.key,
                            det.config.beam_deg,
                            &r.config.key,
                            r.config.beam_deg,
                        )
                    })
                    .map(|r| r.id)
                    .collect()
            } else {
                // Candidate cone reaches past the region: read it through the transaction
                edge_cones += 1;
                let query = ConeQuery::new(det.position(), radius)
                    .with_class(det.config.clone(), rule);
                let found = search_catalog(tx, &query).await?;
                let ids: Vec<SourceId> = found.iter().map(|r| r.id).collect();
                for record in found {
                    known.entry(record.id).or_insert(record);
                }
                ids
            };
            candidate_ids.push(ids);
        }

        let candidates: Vec<Vec<&AssociatedSource>> = candidate_ids
            .iter()
            .map(|ids| ids.iter().filter_map(|id| known.get(id)).collect())
            .collect();
        let assignment = assign(&to_match, &candidates, self.config.de_ruiter_threshold);

        tracing::debug!(
            session_id = %session.session_id,
            detections = to_match.len(),
            edge_cones,
            pairs = assignment.pairs.len(),
            "Assignment complete"
        );

        checkpoint(session, cancel_token)?;
        transition(session, SessionState::Matched)?;

        // ====================================================================
        // Merge / create / nulls
        // ====================================================================
        let mut written: Vec<AssociatedSource> = Vec::new();

        for pair in &assignment.pairs {
            let det = &to_match[pair.detection_index];
            let record = known.get(&pair.record_id).ok_or_else(|| {
                Error::Internal(format!("assigned record {} was never retrieved", pair.record_id))
            })?;
            let merged = merge(record, det);
            staged.merged.push((det.id.clone(), merged.id));
            written.push(merged);
        }

        for &index in &assignment.unmatched_detections {
            let created = create(&to_match[index]);
            staged.created.push(created.id);
            written.push(created);
        }

        for updated in record_nulls(&assignment.unassigned_records(&region)) {
            staged.null_incremented.push(updated.id);
            written.push(updated);
        }

        checkpoint(session, cancel_token)?;
        for source in &written {
            tx.upsert(source.clone()).await?;
        }
        transition(session, SessionState::Merged)?;

        // ====================================================================
        // Cross-match
        // ====================================================================
        if let (Some(engine), Some(reference)) = (&self.crossmatch, &self.reference) {
            let created: HashSet<SourceId> = staged.created.iter().copied().collect();
            for source in &written {
                if self.config.match_scope == MatchScope::NewOnly && !created.contains(&source.id) {
                    continue;
                }
                if cancel_token.is_cancelled() {
                    return Err(Error::Cancelled(format!(
                        "image {} cancelled during cross-match",
                        image.image_id
                    )));
                }
                let outcome = engine.cross_match(source, &**reference).await?;
                if outcome.changed {
                    staged.cross_matched.push(outcome.source.id);
                    tx.upsert(outcome.source).await?;
                }
            }
            checkpoint(session, cancel_token)?;
            transition(session, SessionState::CrossMatched)?;
        }

        tx.mark_image_processed(&image.image_id, batch.detections.len())
            .await?;

        Ok(staged)
    }

    /// Validate detections and drop those that cannot take part
    async fn screen_detections(
        &self,
        tx: &mut dyn CatalogTransaction,
        batch: &ImageBatch,
        staged: &mut StagedChanges,
    ) -> Result<Vec<Detection>> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut accepted = Vec::with_capacity(batch.detections.len());

        for det in &batch.detections {
            let check = if !seen.insert(det.id.as_str()) {
                Err(Error::InvalidMeasurement {
                    detection_id: det.id.clone(),
                    reason: "duplicate detection id within batch".to_string(),
                })
            } else {
                validate_detection(det)
            };

            match check {
                Ok(()) => {}
                Err(err) if self.config.invalid_measurement_policy == InvalidMeasurementPolicy::FailFast => {
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        image_id = %batch.image_id(),
                        detection_id = %det.id,
                        error = %err,
                        "Skipping invalid detection"
                    );
                    let reason = match err {
                        Error::InvalidMeasurement { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    staged.rejected.push(RejectedDetection {
                        detection_id: det.id.clone(),
                        reason: RejectionReason::InvalidMeasurement(reason),
                    });
                    continue;
                }
            }

            if tx.contains_detection(&det.id).await? {
                tracing::warn!(
                    image_id = %batch.image_id(),
                    detection_id = %det.id,
                    "Detection already associated, skipping"
                );
                staged.rejected.push(RejectedDetection {
                    detection_id: det.id.clone(),
                    reason: RejectionReason::AlreadyAssociated,
                });
                continue;
            }

            accepted.push(det.clone());
        }

        Ok(accepted)
    }
}

fn checkpoint(session: &AssociationSession, cancel_token: &CancellationToken) -> Result<()> {
    if cancel_token.is_cancelled() {
        return Err(Error::Cancelled(format!(
            "image {} cancelled in state {}",
            session.image_id, session.state
        )));
    }
    Ok(())
}

fn transition(session: &mut AssociationSession, state: SessionState) -> Result<()> {
    let t = session.transition_to(state)?;
    tracing::debug!(
        session_id = %t.session_id,
        image_id = %session.image_id,
        from = %t.old_state,
        to = %t.new_state,
        "Session transition"
    );
    Ok(())
}

async fn abort(
    session: &mut AssociationSession,
    tx: Box<dyn CatalogTransaction>,
    err: Error,
) -> Error {
    if let Err(e) = session.transition_to(SessionState::Aborted) {
        tracing::warn!(session_id = %session.session_id, error = %e, "Abort transition rejected");
    }
    if let Err(e) = tx.abort().await {
        tracing::warn!(
            session_id = %session.session_id,
            error = %e,
            "Rollback failed; transaction released on drop"
        );
    }
    log_abort(session, &err);
    err
}

fn log_abort(session: &AssociationSession, err: &Error) {
    match err {
        Error::AlreadyProcessed(_) | Error::Cancelled(_) => tracing::info!(
            session_id = %session.session_id,
            image_id = %session.image_id,
            reason_code = err.reason_code(),
            "Association session aborted: {}", err
        ),
        _ => tracing::warn!(
            session_id = %session.session_id,
            image_id = %session.image_id,
            attempt = session.attempt,
            reason_code = err.reason_code(),
            "Association session aborted: {}", err
        ),
    }
}
