//! Reconciliation pipeline: collect from every source, validate, deduplicate, reconcile against
//! the store, and publish the run's delta report.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fcn_adapters::SourceAdapter;
use fcn_storage::{HttpFetcher, JsonFileGateway, PersistenceGateway};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub mod config;
pub mod dedup;
pub mod orchestrator;
pub mod reconcile;
pub mod report;

pub use config::{adapter_for_source, SourceConfig, SourceRegistry, SyncConfig};
pub use dedup::{dedup_exact, dedup_fuzzy, DedupConfig, DedupEngine, DedupStats};
pub use orchestrator::{
    aggregate, validate_all, CollectionOrchestrator, CollectionOutcome, CollectionResult,
    SourceStatus,
};
pub use reconcile::{
    diff_candidate, Classification, NewItem, ReconcileError, ReconcileOutcome,
    ReconciliationEngine, UpdatedItem, WriteAction, WriteFailure, WriteOutcome,
};
pub use report::{
    history_markdown, DeltaKind, DeltaRow, NewEntry, ReconciliationReport, ReportArtifacts,
    ReportSummary, RunCounts, UpdatedEntry,
};

pub const CRATE_NAME: &str = "fcn-sync";

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: usize,
    pub failed_sources: usize,
    pub collected: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed_writes: usize,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    orchestrator: CollectionOrchestrator,
    dedup: DedupEngine,
    reconciler: ReconciliationEngine,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        adapters: Vec<Box<dyn SourceAdapter>>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        let dedup = DedupEngine::new(DedupConfig {
            fuzzy_pass: config.fuzzy_dedup,
        });
        Self {
            config,
            orchestrator: CollectionOrchestrator::new(adapters),
            dedup,
            reconciler: ReconciliationEngine::new(gateway),
        }
    }

    /// Run every stage up to the in-memory report; nothing is written to the reports dir.
    pub async fn reconcile_run(&self) -> Result<ReconciliationReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", run_id = %run_id);
        async move {
            let outcomes = self.orchestrator.collect_all().await;
            let sources: Vec<SourceStatus> = outcomes.iter().map(CollectionOutcome::status).collect();

            let aggregated = aggregate(outcomes);
            let collected = aggregated.len();
            let (valid, rejected) = validate_all(aggregated);
            let valid_count = valid.len();
            let (deduped, stats) = self.dedup.apply(valid);
            info!(
                collected,
                valid = valid_count,
                rejected = rejected.len(),
                exact_dropped = stats.exact_dropped,
                fuzzy_dropped = stats.fuzzy_dropped,
                kept = stats.kept,
                "prepared candidates"
            );

            let outcome = self
                .reconciler
                .reconcile(deduped)
                .await
                .context("reconciling candidates against the store")?;

            Ok::<_, anyhow::Error>(ReconciliationReport::build(
                run_id,
                Utc::now(),
                RunCounts {
                    collected,
                    valid: valid_count,
                    rejected: rejected.len(),
                    deduplicated: stats.kept,
                },
                sources,
                &outcome,
            ))
        }
        .instrument(span)
        .await
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let report = self.reconcile_run().await?;
        let artifacts = report.write_to(&self.config.reports_dir).await?;
        let finished_at = Utc::now();

        Ok(SyncRunSummary {
            run_id: report.run_id,
            started_at,
            finished_at,
            sources: report.sources.len(),
            failed_sources: report.sources.iter().filter(|s| !s.collected).count(),
            collected: report.summary.collected,
            new: report.summary.new,
            updated: report.summary.updated,
            unchanged: report.summary.unchanged,
            failed_writes: report.summary.failed_writes,
            reports_dir: artifacts.dir.display().to_string(),
            parquet_manifest: artifacts.manifest_path.display().to_string(),
        })
    }
}

/// Build adapters from the enabled registry entries, in registry order.
pub fn adapters_from_registry(
    registry: &SourceRegistry,
    config: &SyncConfig,
) -> Result<Vec<Box<dyn SourceAdapter>>> {
    let fetcher = HttpFetcher::new(config.http_client_config())?;
    registry
        .enabled()
        .map(|source| {
            info!(
                source_id = %source.source_id,
                display_name = %source.display_name,
                "configuring source"
            );
            adapter_for_source(source, &config.workspace_root, &fetcher)
                .with_context(|| format!("configuring source {}", source.source_id))
        })
        .collect()
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let registry = SourceRegistry::load(&config.registry_path()).await?;
    let adapters = adapters_from_registry(&registry, &config)?;
    let gateway = JsonFileGateway::open(config.store_path.clone())
        .await
        .with_context(|| format!("opening store {}", config.store_path.display()))?;
    info!(store = %gateway.path().display(), "opened opportunity store");
    let pipeline = SyncPipeline::new(config, adapters, Arc::new(gateway));
    pipeline.run_once().await
}

pub fn report_daily_markdown(runs: usize, reports_dir: Option<PathBuf>) -> Result<String> {
    let reports_dir = reports_dir.unwrap_or_else(|| SyncConfig::from_env().reports_dir);
    history_markdown(runs, &reports_dir)
}
