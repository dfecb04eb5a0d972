use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use fcn_adapters::testing::{FailingAdapter, StaticAdapter};
use fcn_adapters::SourceAdapter;
use fcn_core::CandidateRecord;
use fcn_storage::{InMemoryGateway, JsonFileGateway, PersistenceGateway};
use fcn_sync::{adapters_from_registry, SourceRegistry, SyncConfig, SyncPipeline};

fn record(title: &str, agency: &str, url: &str) -> CandidateRecord {
    CandidateRecord {
        title: title.to_string(),
        description: format!("{title} for {agency}"),
        agency: agency.to_string(),
        budget: Some(50_000.0),
        posted_date: Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap(),
        due_date: None,
        status: Default::default(),
        naics_codes: vec!["541511".to_string()],
        set_aside: None,
        point_of_contact: None,
        source_url: url.to_string(),
        source_type: String::new(),
    }
}

fn config(root: &Path) -> SyncConfig {
    SyncConfig::from_lookup(|key| match key {
        "FCN_WORKSPACE_ROOT" => Some(root.display().to_string()),
        _ => None,
    })
}

fn two_sources() -> Vec<Box<dyn SourceAdapter>> {
    vec![
        Box::new(StaticAdapter::new(
            "sam-csv",
            vec![record("Network Refresh", "GSA", "https://sam.gov/opp/1/view")],
        )),
        Box::new(StaticAdapter::new(
            "fbo-listing",
            vec![record("Runway Repair", "DOT", "https://www.fbo.gov/x/2")],
        )),
    ]
}

#[tokio::test]
async fn first_run_creates_and_rerun_is_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(InMemoryGateway::new());

    let first = SyncPipeline::new(config(dir.path()), two_sources(), gateway.clone())
        .reconcile_run()
        .await
        .unwrap();
    assert_eq!(first.summary.new, 2);
    assert_eq!(first.summary.updated, 0);
    assert_eq!(first.summary.written_new, 2);
    assert_eq!(first.new_opportunities[0].source_type, "Unknown");

    let second = SyncPipeline::new(config(dir.path()), two_sources(), gateway)
        .reconcile_run()
        .await
        .unwrap();
    assert_eq!(second.summary.new, 0);
    assert_eq!(second.summary.updated, 0);
    assert_eq!(second.summary.unchanged, 2);
    assert_eq!(second.to_csv().unwrap(), b"type,id,title,sourceUrl,changedFields\n");
}

#[tokio::test]
async fn failing_source_leaves_others_intact() {
    let dir = tempfile::tempdir().unwrap();
    let adapters: Vec<Box<dyn SourceAdapter>> = vec![
        Box::new(FailingAdapter::new("sam-api", "503 from upstream")),
        Box::new(StaticAdapter::new(
            "sam-csv",
            vec![
                record("A", "DOD", "u-a"),
                record("B", "DOD", "u-b"),
            ],
        )),
    ];
    let report = SyncPipeline::new(config(dir.path()), adapters, Arc::new(InMemoryGateway::new()))
        .reconcile_run()
        .await
        .unwrap();

    let urls: Vec<_> = report
        .new_opportunities
        .iter()
        .map(|e| e.source_url.as_str())
        .collect();
    assert_eq!(urls, vec!["u-a", "u-b"]);
    assert!(!report.sources[0].collected);
}

#[tokio::test]
async fn changed_budget_is_reported_on_the_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("data").join("opportunities.json");

    let gateway = Arc::new(JsonFileGateway::open(&store).await.unwrap());
    let run = SyncPipeline::new(config(dir.path()), two_sources(), gateway)
        .run_once()
        .await
        .unwrap();
    assert_eq!(run.new, 2);
    assert!(Path::new(&run.reports_dir).join("opportunities_delta.json").is_file());
    assert!(Path::new(&run.reports_dir).join("opportunities_delta.csv").is_file());
    assert!(Path::new(&run.parquet_manifest).is_file());

    let mut changed = record("Network Refresh", "GSA", "https://sam.gov/opp/1/view");
    changed.budget = Some(75_000.0);
    let reopened = Arc::new(JsonFileGateway::open(&store).await.unwrap());
    let adapters: Vec<Box<dyn SourceAdapter>> =
        vec![Box::new(StaticAdapter::new("sam-csv", vec![changed]))];
    let report = SyncPipeline::new(config(dir.path()), adapters, reopened)
        .reconcile_run()
        .await
        .unwrap();

    assert_eq!(report.summary.new, 0);
    assert_eq!(report.summary.updated, 1);
    assert_eq!(report.updated_opportunities[0].changed_fields.names(), vec!["budget"]);
    let rows = report.rows();
    assert_eq!(rows[0].changed_fields, "budget");
}

#[tokio::test]
async fn long_budget_stays_unchanged_across_store_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("opportunities.json");
    let mut listing = record("Hangar Lighting", "USAF", "https://sam.gov/opp/9/view");
    listing.budget = Some(2119048949.6962857);
    let sources = || -> Vec<Box<dyn SourceAdapter>> {
        vec![Box::new(StaticAdapter::new("sam-csv", vec![listing.clone()]))]
    };

    let gateway = Arc::new(JsonFileGateway::open(&store).await.unwrap());
    let first = SyncPipeline::new(config(dir.path()), sources(), gateway)
        .reconcile_run()
        .await
        .unwrap();
    assert_eq!(first.summary.written_new, 1);

    let reopened = Arc::new(JsonFileGateway::open(&store).await.unwrap());
    let second = SyncPipeline::new(config(dir.path()), sources(), reopened)
        .reconcile_run()
        .await
        .unwrap();
    assert_eq!(second.summary.updated, 0);
    assert_eq!(second.summary.unchanged, 1);
}

#[tokio::test]
async fn checked_in_registry_runs_against_fixtures() {
    let workspace = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let scratch = tempfile::tempdir().unwrap();
    let mut config = config(&workspace);
    config.reports_dir = scratch.path().join("reports");

    let registry = SourceRegistry::load(&config.registry_path()).await.unwrap();
    assert_eq!(registry.sources[0].display_name, "SAM.gov Contract Opportunities export");
    let adapters = adapters_from_registry(&registry, &config).unwrap();
    assert_eq!(adapters.len(), 2);

    let gateway = Arc::new(JsonFileGateway::open(scratch.path().join("store.json")).await.unwrap());
    let report = SyncPipeline::new(config, adapters, gateway)
        .reconcile_run()
        .await
        .unwrap();

    assert_eq!(report.sources.len(), 2);
    assert!(report.sources.iter().all(|s| s.collected));
    assert_eq!(report.summary.collected, 5);
    assert_eq!(report.summary.rejected, 0);
    assert_eq!(report.summary.new, 5);
    assert_eq!(report.summary.written_new, 5);
    assert_eq!(report.new_opportunities[0].source_url, "https://sam.gov/opp/a1b2c3/view");
}
