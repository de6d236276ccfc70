//! Reference catalog cross-matching
//!
//! Links catalog records to their best counterpart across an ordered list of
//! external reference catalogs. Each record remembers which catalogs were
//! already queried so `Update` mode only consults new ones.

use crate::geometry::candidate_radius;
use crate::models::{AssociatedSource, CatalogMatch};
use crate::services::cone_search::{search_reference, ConeQuery};
use crate::services::positional_matcher::{de_ruiter_radius, MeasuredPosition};
use crate::store::ReferenceCatalog;
use skycat_common::config::{AssociationConfig, CrossMatchMode};
use skycat_common::Result;
use std::cmp::Ordering;
use tracing::debug;

/// Result of cross-matching one record
#[derive(Debug, Clone)]
pub struct CrossMatchOutcome {
    pub source: AssociatedSource,
    /// False when the annotation and checked set are unchanged
    pub changed: bool,
    /// Catalogs queried in this call, in configured order
    pub queried: Vec<String>,
}

/// Cross-match engine configured once per session
#[derive(Debug, Clone)]
pub struct CrossMatchEngine {
    catalogs: Vec<String>,
    mode: CrossMatchMode,
    threshold: f64,
    config: AssociationConfig,
}

/// Best candidate so far: (statistic, catalog rank, source id)
struct Best {
    statistic: f64,
    rank: usize,
    catalog_match: CatalogMatch,
}

impl Best {
    fn beats(&self, other: &Best) -> bool {
        self.statistic
            .total_cmp(&other.statistic)
            .then(self.rank.cmp(&other.rank))
            .then_with(|| {
                self.catalog_match
                    .match_id
                    .cmp(&other.catalog_match.match_id)
            })
            == Ordering::Less
    }
}

impl CrossMatchEngine {
    pub fn from_config(config: &AssociationConfig) -> Self {
        let mut catalogs: Vec<String> = Vec::new();
        for catalog in &config.catalogs {
            if !catalogs.contains(catalog) {
                catalogs.push(catalog.clone());
            }
        }
        Self {
            catalogs,
            mode: config.crossmatch_mode,
            threshold: config.de_ruiter_threshold,
            config: config.clone(),
        }
    }

    pub fn catalogs(&self) -> &[String] {
        &self.catalogs
    }

    /// Cross-match one record against the configured catalogs
    pub async fn cross_match(
        &self,
        source: &AssociatedSource,
        reference: &dyn ReferenceCatalog,
    ) -> Result<CrossMatchOutcome> {
        let mut updated = source.clone();
        if self.mode == CrossMatchMode::Redo {
            updated.catalog_match = None;
            updated.catalogs_checked.clear();
            updated.matched_catalogs.clear();
        }

        let radius = candidate_radius(source.config.beam_deg, &self.config)?;
        let query = ConeQuery::new(source.position(), radius);
        let source_pos = MeasuredPosition::from(source);

        let mut best: Option<Best> = None;
        let mut queried = Vec::new();
        for (rank, catalog) in self.catalogs.iter().enumerate() {
            if updated.catalogs_checked.contains(catalog) {
                continue;
            }

            let candidates = search_reference(reference, &query, catalog).await?;
            for candidate in &candidates {
                let statistic = de_ruiter_radius(&source_pos, &MeasuredPosition::from(candidate));
                if statistic >= self.threshold {
                    continue;
                }
                updated.matched_catalogs.insert(catalog.clone());
                let contender = Best {
                    statistic,
                    rank,
                    catalog_match: CatalogMatch {
                        catalog_id: catalog.clone(),
                        match_id: candidate.source_id.clone(),
                        min_separation_statistic: statistic,
                    },
                };
                if best.as_ref().map_or(true, |b| contender.beats(b)) {
                    best = Some(contender);
                }
            }

            queried.push(catalog.clone());
        }

        if let Some(best) = best {
            let improves = updated
                .catalog_match
                .as_ref()
                .map_or(true, |m| best.statistic < m.min_separation_statistic);
            if improves {
                updated.catalog_match = Some(best.catalog_match);
            }
        }
        for catalog in &queried {
            updated.catalogs_checked.insert(catalog.clone());
        }

        let changed = updated.catalog_match != source.catalog_match
            || updated.catalogs_checked != source.catalogs_checked
            || updated.matched_catalogs != source.matched_catalogs;

        debug!(
            source_id = %source.id,
            queried = queried.len(),
            changed,
            "Cross-matched source"
        );

        Ok(CrossMatchOutcome {
            source: updated,
            changed,
            queried,
        })
    }
}
