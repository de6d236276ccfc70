//! Non-detection bookkeeping
//!
//! A known record inside the searched region of an image that receives no
//! detection from that image gets one null. Counts only grow.

use crate::models::{AssociatedSource, SourceId};
use std::collections::HashSet;
use tracing::trace;

/// Increment `num_nulls` once for each distinct unassigned record
pub fn record_nulls(unassigned: &[&AssociatedSource]) -> Vec<AssociatedSource> {
    let mut seen: HashSet<SourceId> = HashSet::new();
    unassigned
        .iter()
        .filter(|s| seen.insert(s.id))
        .map(|s| {
            let mut updated = (*s).clone();
            updated.num_nulls = updated.num_nulls.saturating_add(1);
            trace!(source_id = %updated.id, num_nulls = updated.num_nulls, "Null detection");
            updated
        })
        .collect()
}
