use std::collections::HashSet;

use fcn_core::{CandidateRecord, FuzzyKey};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Run the cross-source title + agency pass after the exact URL pass.
    pub fuzzy_pass: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { fuzzy_pass: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupStats {
    pub input: usize,
    pub exact_dropped: usize,
    pub fuzzy_dropped: usize,
    pub kept: usize,
}

/// First-occurrence-wins deduplication. Scans are sequential so the kept record is always the
/// earliest one in aggregate order.
pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn apply(&self, records: Vec<CandidateRecord>) -> (Vec<CandidateRecord>, DedupStats) {
        let input = records.len();
        let (records, exact_dropped) = dedup_exact(records);
        let (records, fuzzy_dropped) = if self.config.fuzzy_pass {
            dedup_fuzzy(records)
        } else {
            (records, 0)
        };
        let stats = DedupStats {
            input,
            exact_dropped,
            fuzzy_dropped,
            kept: records.len(),
        };
        debug!(?stats, "deduplicated candidates");
        (records, stats)
    }
}

/// Drop records whose source URL was already seen earlier in this list.
pub fn dedup_exact(records: Vec<CandidateRecord>) -> (Vec<CandidateRecord>, usize) {
    let mut seen: HashSet<String> = HashSet::with_capacity(records.len());
    let before = records.len();
    let kept: Vec<_> = records
        .into_iter()
        .filter(|record| {
            let fresh = seen.insert(record.exact_key().to_string());
            if !fresh {
                debug!(source_url = %record.source_url, "dropping exact duplicate");
            }
            fresh
        })
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

/// Drop records whose case-insensitive title + agency matches one already kept.
pub fn dedup_fuzzy(records: Vec<CandidateRecord>) -> (Vec<CandidateRecord>, usize) {
    let mut seen: HashSet<String> = HashSet::with_capacity(records.len());
    let before = records.len();
    let kept: Vec<_> = records
        .into_iter()
        .filter(|record| match record.fuzzy_key() {
            FuzzyKey::Composite(key) => {
                let fresh = seen.insert(key);
                if !fresh {
                    debug!(source_url = %record.source_url, "dropping cross-source duplicate");
                }
                fresh
            }
            FuzzyKey::Isolated => true,
        })
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}
