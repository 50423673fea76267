use std::cmp::Reverse;
use std::sync::Arc;

use serde::Serialize;

use crate::sync::index::{DuplicateGroup, DuplicateStats, IndexError, MirrorStore};

/// Duplicate groups together with their totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DuplicateReport {
    pub stats: DuplicateStats,
    /// Largest reclaimable size first.
    pub groups: Vec<DuplicateGroup>,
}

/// Read-only view over the mirror's duplicate queries.
pub struct DuplicateAnalyzer {
    store: Arc<MirrorStore>,
}

impl DuplicateAnalyzer {
    pub fn new(store: Arc<MirrorStore>) -> Self {
        Self { store }
    }

    pub async fn groups(&self) -> Result<Vec<DuplicateGroup>, IndexError> {
        self.store.get_duplicate_groups().await
    }

    pub async fn stats(&self) -> Result<DuplicateStats, IndexError> {
        self.store.get_stats().await
    }

    /// Totals are derived from the same snapshot as the groups.
    pub async fn report(&self) -> Result<DuplicateReport, IndexError> {
        let mut groups = self.store.get_duplicate_groups().await?;
        groups.sort_by(|a, b| {
            Reverse(a.wasted_bytes())
                .cmp(&Reverse(b.wasted_bytes()))
                .then_with(|| a.content_hash.cmp(&b.content_hash))
        });
        let stats = summarize(&groups);
        Ok(DuplicateReport { stats, groups })
    }
}

fn summarize(groups: &[DuplicateGroup]) -> DuplicateStats {
    groups
        .iter()
        .fold(DuplicateStats::default(), |mut stats, group| {
            stats.group_count += 1;
            stats.wasted_bytes = stats.wasted_bytes.saturating_add(group.wasted_bytes());
            if group.size_mismatch {
                stats.mismatched_groups += 1;
            }
            stats
        })
}
