use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use fcn_core::{CandidateRecord, DiffField, DiffResult, OpportunityPatch, PersistedOpportunity};
use fcn_storage::{GatewayError, PersistenceGateway};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("batched lookup of {keys} keys failed: {source}")]
    Lookup {
        keys: usize,
        #[source]
        source: GatewayError,
    },
}

/// Compare the whitelisted fields of `incoming` against the stored row.
pub fn diff_candidate(incoming: &CandidateRecord, existing: &PersistedOpportunity) -> DiffResult {
    let stored = &existing.record;
    let changed = DiffField::WHITELIST.into_iter().filter(|field| match field {
        DiffField::Title => incoming.title != stored.title,
        DiffField::Description => incoming.description != stored.description,
        DiffField::Agency => incoming.agency != stored.agency,
        DiffField::Budget => incoming.budget != stored.budget,
        DiffField::Status => incoming.status != stored.status,
        DiffField::PostedDate => incoming.posted_date != stored.posted_date,
        DiffField::DueDate => incoming.due_date != stored.due_date,
        DiffField::NaicsCodes => incoming.naics_codes != stored.naics_codes,
        DiffField::SetAside => incoming.set_aside != stored.set_aside,
    });
    DiffResult::from_fields(changed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Failed(String),
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFailure {
    pub source_url: String,
    pub action: WriteAction,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub candidate: CandidateRecord,
    /// Row returned by the gateway; `None` when the create failed.
    pub persisted: Option<PersistedOpportunity>,
    pub write: WriteOutcome,
}

#[derive(Debug, Clone)]
pub struct UpdatedItem {
    /// Row after the update, or the pre-update row when the write failed.
    pub entity: PersistedOpportunity,
    pub diff: DiffResult,
    pub write: WriteOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    New,
    Updated,
    Unchanged,
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub new: Vec<NewItem>,
    pub updated: Vec<UpdatedItem>,
    pub unchanged: usize,
    pub failures: Vec<WriteFailure>,
}

impl ReconcileOutcome {
    pub fn written_new(&self) -> usize {
        self.new.iter().filter(|item| item.write.is_written()).count()
    }

    pub fn written_updated(&self) -> usize {
        self.updated.iter().filter(|item| item.write.is_written()).count()
    }

    fn record_failure(&mut self, source_url: &str, action: WriteAction, err: &GatewayError) {
        error!(source_url, ?action, error = %err, "persistence write failed");
        self.failures.push(WriteFailure {
            source_url: source_url.to_string(),
            action,
            error: err.to_string(),
        });
    }
}

/// Classifies deduplicated candidates against the store and applies the resulting writes.
pub struct ReconciliationEngine {
    gateway: Arc<dyn PersistenceGateway>,
}

impl ReconciliationEngine {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    /// One batched lookup, then sequential per-record writes. Only the lookup can fail the call.
    pub async fn reconcile(
        &self,
        candidates: Vec<CandidateRecord>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let keys: BTreeSet<String> = candidates
            .iter()
            .map(|c| c.exact_key().to_string())
            .collect();
        let existing: HashMap<String, PersistedOpportunity> = self
            .gateway
            .find_by_keys(&keys)
            .await
            .map_err(|source| ReconcileError::Lookup {
                keys: keys.len(),
                source,
            })?
            .into_iter()
            .map(|row| (row.exact_key().to_string(), row))
            .collect();
        debug!(keys = keys.len(), found = existing.len(), "looked up persisted opportunities");

        let mut outcome = ReconcileOutcome::default();
        for candidate in candidates {
            let class = match existing.get(candidate.exact_key()) {
                Some(row) => self.apply_existing(candidate, row, &mut outcome).await,
                None => self.apply_new(candidate, &mut outcome).await,
            };
            debug!(?class, "classified candidate");
        }

        info!(
            new = outcome.new.len(),
            updated = outcome.updated.len(),
            unchanged = outcome.unchanged,
            failed_writes = outcome.failures.len(),
            "reconciliation finished"
        );
        Ok(outcome)
    }

    async fn apply_new(
        &self,
        candidate: CandidateRecord,
        outcome: &mut ReconcileOutcome,
    ) -> Classification {
        match self.gateway.create(&candidate).await {
            Ok(row) => {
                outcome.new.push(NewItem {
                    candidate,
                    persisted: Some(row),
                    write: WriteOutcome::Written,
                });
                Classification::New
            }
            Err(GatewayError::AlreadyExists(key)) => {
                warn!(source_url = %key, "create raced an existing row; re-reading");
                self.apply_raced(candidate, outcome).await
            }
            Err(err) => {
                outcome.record_failure(candidate.exact_key(), WriteAction::Create, &err);
                outcome.new.push(NewItem {
                    candidate,
                    persisted: None,
                    write: WriteOutcome::Failed(err.to_string()),
                });
                Classification::New
            }
        }
    }

    async fn apply_raced(
        &self,
        candidate: CandidateRecord,
        outcome: &mut ReconcileOutcome,
    ) -> Classification {
        let key = BTreeSet::from([candidate.exact_key().to_string()]);
        let err = match self.gateway.find_by_keys(&key).await {
            Ok(rows) => match rows.into_iter().next() {
                Some(row) => return self.apply_existing(candidate, &row, outcome).await,
                None => GatewayError::NotFound(candidate.exact_key().to_string()),
            },
            Err(err) => err,
        };
        // The row could not be resolved, so the candidate stays a failed create.
        outcome.record_failure(candidate.exact_key(), WriteAction::Create, &err);
        outcome.new.push(NewItem {
            candidate,
            persisted: None,
            write: WriteOutcome::Failed(err.to_string()),
        });
        Classification::New
    }

    async fn apply_existing(
        &self,
        candidate: CandidateRecord,
        row: &PersistedOpportunity,
        outcome: &mut ReconcileOutcome,
    ) -> Classification {
        let diff = diff_candidate(&candidate, row);
        if diff.is_empty() {
            outcome.unchanged += 1;
            return Classification::Unchanged;
        }
        debug!(source_url = row.exact_key(), changed = diff.len(), "updating changed row");
        let patch = OpportunityPatch::from_diff(&candidate, &diff);
        let item = match self.gateway.update(row.exact_key(), &patch).await {
            Ok(entity) => UpdatedItem {
                entity,
                diff,
                write: WriteOutcome::Written,
            },
            Err(err) => {
                outcome.record_failure(row.exact_key(), WriteAction::Update, &err);
                UpdatedItem {
                    entity: row.clone(),
                    diff,
                    write: WriteOutcome::Failed(err.to_string()),
                }
            }
        };
        outcome.updated.push(item);
        Classification::Updated
    }
}
