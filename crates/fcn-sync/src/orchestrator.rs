use fcn_adapters::SourceAdapter;
use fcn_core::{CandidateRecord, ValidationError};
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug)]
pub enum CollectionResult {
    Collected(Vec<CandidateRecord>),
    Failed(String),
}

/// What one adapter produced during a run.
#[derive(Debug)]
pub struct CollectionOutcome {
    pub source_id: String,
    pub result: CollectionResult,
}

/// Per-source line of the delta report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    pub source_id: String,
    pub collected: bool,
    pub records: usize,
    pub error: Option<String>,
}

impl CollectionOutcome {
    pub fn status(&self) -> SourceStatus {
        match &self.result {
            CollectionResult::Collected(records) => SourceStatus {
                source_id: self.source_id.clone(),
                collected: true,
                records: records.len(),
                error: None,
            },
            CollectionResult::Failed(cause) => SourceStatus {
                source_id: self.source_id.clone(),
                collected: false,
                records: 0,
                error: Some(cause.clone()),
            },
        }
    }
}

/// Fans out to every registered adapter and gathers all outcomes.
pub struct CollectionOrchestrator {
    adapters: Vec<Box<dyn SourceAdapter>>,
}

impl CollectionOrchestrator {
    pub fn new(adapters: Vec<Box<dyn SourceAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn register(&mut self, adapter: Box<dyn SourceAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Run all adapters concurrently. One adapter failing never cancels the others, and the
    /// returned outcomes are in registration order whatever order they completed in.
    pub async fn collect_all(&self) -> Vec<CollectionOutcome> {
        let calls = self.adapters.iter().map(|adapter| async move {
            let source_id = adapter.source_id().to_string();
            let result = match adapter.collect().await {
                Ok(records) => {
                    info!(source_id = %source_id, records = records.len(), "collected from source");
                    CollectionResult::Collected(records)
                }
                Err(err) => {
                    error!(source_id = %source_id, error = %err, "source collection failed");
                    CollectionResult::Failed(err.to_string())
                }
            };
            CollectionOutcome { source_id, result }
        });
        join_all(calls).await
    }
}

/// Concatenate successful outcomes, adapter order first, then emission order.
pub fn aggregate(outcomes: Vec<CollectionOutcome>) -> Vec<CandidateRecord> {
    outcomes
        .into_iter()
        .filter_map(|outcome| match outcome.result {
            CollectionResult::Collected(records) => Some(records),
            CollectionResult::Failed(_) => None,
        })
        .flatten()
        .collect()
}

/// Drop candidates that fail validation, preserving order of the rest.
pub fn validate_all(records: Vec<CandidateRecord>) -> (Vec<CandidateRecord>, Vec<ValidationError>) {
    let mut valid = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();
    for record in records {
        match record.validate() {
            Ok(()) => valid.push(record),
            Err(err) => {
                warn!(error = %err, "rejecting invalid candidate");
                rejected.push(err);
            }
        }
    }
    (valid, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::candidate;
    use fcn_adapters::testing::{DelayedAdapter, FailingAdapter, StaticAdapter};
    use std::time::Duration;

    fn urls(records: &[CandidateRecord]) -> Vec<&str> {
        records.iter().map(|r| r.source_url.as_str()).collect()
    }

    #[tokio::test]
    async fn aggregate_follows_registration_order_not_completion_order() {
        let slow = DelayedAdapter::new(
            Box::new(StaticAdapter::new(
                "slow",
                vec![candidate("A1", "DOD", "a1"), candidate("A2", "DOD", "a2")],
            )),
            Duration::from_millis(50),
        );
        let fast = StaticAdapter::new("fast", vec![candidate("B1", "GSA", "b1")]);
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![Box::new(slow), Box::new(fast)];
        let orchestrator = CollectionOrchestrator::new(adapters);

        let outcomes = orchestrator.collect_all().await;
        let ids: Vec<_> = outcomes.iter().map(|o| o.source_id.as_str()).collect();
        assert_eq!(ids, vec!["slow", "fast"]);
        assert_eq!(urls(&aggregate(outcomes)), vec!["a1", "a2", "b1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sources_are_collected_concurrently() {
        let delay = Duration::from_millis(100);
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![
            Box::new(DelayedAdapter::new(
                Box::new(FailingAdapter::new("slow-broken", "gateway timeout")),
                delay,
            )),
            Box::new(DelayedAdapter::new(
                Box::new(StaticAdapter::new("slow-a", vec![candidate("A1", "DOD", "a1")])),
                delay,
            )),
            Box::new(DelayedAdapter::new(
                Box::new(StaticAdapter::new("slow-b", vec![candidate("B1", "GSA", "b1")])),
                delay,
            )),
        ];
        let orchestrator = CollectionOrchestrator::new(adapters);

        let started = tokio::time::Instant::now();
        let outcomes = orchestrator.collect_all().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= delay);
        assert!(elapsed < delay * 3 / 2, "collection took {elapsed:?}");
        assert_eq!(urls(&aggregate(outcomes)), vec!["a1", "b1"]);
    }

    #[tokio::test]
    async fn failing_adapter_does_not_affect_others() {
        let mut orchestrator = CollectionOrchestrator::new(Vec::new());
        orchestrator.register(Box::new(FailingAdapter::new("broken", "source unreachable")));
        orchestrator.register(Box::new(StaticAdapter::new(
            "healthy",
            vec![candidate("B1", "GSA", "b1"), candidate("B2", "GSA", "b2")],
        )));
        assert_eq!(orchestrator.len(), 2);

        let outcomes = orchestrator.collect_all().await;
        let statuses: Vec<_> = outcomes.iter().map(CollectionOutcome::status).collect();
        assert!(!statuses[0].collected);
        assert_eq!(statuses[0].error.as_deref(), Some("source unreachable"));
        assert_eq!(statuses[1].records, 2);
        assert_eq!(urls(&aggregate(outcomes)), vec!["b1", "b2"]);
    }

    #[tokio::test]
    async fn every_adapter_is_invoked_once() {
        let failing = std::sync::Arc::new(FailingAdapter::new("broken", "boom"));
        struct Shared(std::sync::Arc<FailingAdapter>);
        #[async_trait::async_trait]
        impl SourceAdapter for Shared {
            fn source_id(&self) -> &str {
                self.0.source_id()
            }
            fn kind(&self) -> fcn_adapters::SourceKind {
                self.0.kind()
            }
            async fn collect(&self) -> Result<Vec<CandidateRecord>, fcn_adapters::AdapterError> {
                self.0.collect().await
            }
        }
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![
            Box::new(Shared(failing.clone())),
            Box::new(StaticAdapter::new("ok", vec![])),
        ];
        let orchestrator = CollectionOrchestrator::new(adapters);
        let outcomes = orchestrator.collect_all().await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(failing.calls(), 1);
    }

    #[test]
    fn validation_drops_only_invalid_records() {
        let mut missing_agency = candidate("T", "", "u2");
        missing_agency.agency = "   ".to_string();
        let (valid, rejected) = validate_all(vec![
            candidate("T1", "DOD", "u1"),
            missing_agency,
            candidate("T3", "DOD", "u3"),
        ]);
        assert_eq!(urls(&valid), vec!["u1", "u3"]);
        assert_eq!(rejected.len(), 1);
    }
}
