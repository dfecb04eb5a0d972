//! Persistence gateway contracts + file-backed storage and HTTP fetch utilities for FCN.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use fcn_core::{CandidateRecord, OpportunityPatch, PersistedOpportunity};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fcn-storage";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("opportunity with source url {0} already exists")]
    AlreadyExists(String),
    #[error("no opportunity with source url {0}")]
    NotFound(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Key-based create/update/lookup over persisted opportunities.
///
/// Implementations must enforce uniqueness on the source URL: a second `create` for the same
/// key fails with [`GatewayError::AlreadyExists`].
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn find_by_keys(
        &self,
        keys: &BTreeSet<String>,
    ) -> Result<Vec<PersistedOpportunity>, GatewayError>;

    async fn create(&self, candidate: &CandidateRecord) -> Result<PersistedOpportunity, GatewayError>;

    async fn update(
        &self,
        source_url: &str,
        patch: &OpportunityPatch,
    ) -> Result<PersistedOpportunity, GatewayError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OpportunityTable {
    rows: BTreeMap<String, PersistedOpportunity>,
}

impl OpportunityTable {
    fn find_by_keys(&self, keys: &BTreeSet<String>) -> Vec<PersistedOpportunity> {
        keys.iter().filter_map(|k| self.rows.get(k).cloned()).collect()
    }

    fn create(&mut self, candidate: &CandidateRecord) -> Result<PersistedOpportunity, GatewayError> {
        let key = candidate.exact_key().to_string();
        if self.rows.contains_key(&key) {
            return Err(GatewayError::AlreadyExists(key));
        }
        let row = PersistedOpportunity::from_candidate(candidate, Utc::now());
        self.rows.insert(key, row.clone());
        Ok(row)
    }

    fn update(
        &mut self,
        source_url: &str,
        patch: &OpportunityPatch,
    ) -> Result<PersistedOpportunity, GatewayError> {
        let row = self
            .rows
            .get_mut(source_url)
            .ok_or_else(|| GatewayError::NotFound(source_url.to_string()))?;
        patch.apply_to(&mut row.record);
        row.updated_at = Utc::now();
        Ok(row.clone())
    }
}

/// Process-local gateway; state lives as long as the value.
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    table: Mutex<OpportunityTable>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = PersistedOpportunity>) -> Self {
        let rows = rows
            .into_iter()
            .map(|row| (row.exact_key().to_string(), row))
            .collect();
        Self {
            table: Mutex::new(OpportunityTable { rows }),
        }
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.rows.len()
    }

    pub async fn get(&self, source_url: &str) -> Option<PersistedOpportunity> {
        self.table.lock().await.rows.get(source_url).cloned()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn find_by_keys(
        &self,
        keys: &BTreeSet<String>,
    ) -> Result<Vec<PersistedOpportunity>, GatewayError> {
        Ok(self.table.lock().await.find_by_keys(keys))
    }

    async fn create(&self, candidate: &CandidateRecord) -> Result<PersistedOpportunity, GatewayError> {
        self.table.lock().await.create(candidate)
    }

    async fn update(
        &self,
        source_url: &str,
        patch: &OpportunityPatch,
    ) -> Result<PersistedOpportunity, GatewayError> {
        self.table.lock().await.update(source_url, patch)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreSnapshot {
    schema_version: u32,
    opportunities: Vec<PersistedOpportunity>,
}

/// Gateway backed by a single JSON snapshot file, rewritten atomically after every write.
#[derive(Debug)]
pub struct JsonFileGateway {
    path: PathBuf,
    table: Mutex<OpportunityTable>,
}

impl JsonFileGateway {
    /// Loads the snapshot at `path`, starting empty when the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let rows = if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking store path {}", path.display()))?
        {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let snapshot: StoreSnapshot = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            snapshot
                .opportunities
                .into_iter()
                .map(|row| (row.exact_key().to_string(), row))
                .collect()
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), rows = rows.len(), "opened json store");
        Ok(Self {
            path,
            table: Mutex::new(OpportunityTable { rows }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, table: &OpportunityTable) -> Result<(), GatewayError> {
        let snapshot = StoreSnapshot {
            schema_version: 1,
            opportunities: table.rows.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot).context("serializing store snapshot")?;
        write_atomic(&self.path, &bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for JsonFileGateway {
    async fn find_by_keys(
        &self,
        keys: &BTreeSet<String>,
    ) -> Result<Vec<PersistedOpportunity>, GatewayError> {
        Ok(self.table.lock().await.find_by_keys(keys))
    }

    async fn create(&self, candidate: &CandidateRecord) -> Result<PersistedOpportunity, GatewayError> {
        let mut table = self.table.lock().await;
        let row = table.create(candidate)?;
        if let Err(err) = self.flush(&table).await {
            table.rows.remove(candidate.exact_key());
            return Err(err);
        }
        Ok(row)
    }

    async fn update(
        &self,
        source_url: &str,
        patch: &OpportunityPatch,
    ) -> Result<PersistedOpportunity, GatewayError> {
        let mut table = self.table.lock().await;
        let previous = table.rows.get(source_url).cloned();
        let row = table.update(source_url, patch)?;
        if let Err(err) = self.flush(&table).await {
            if let Some(previous) = previous {
                table.rows.insert(source_url.to_string(), previous);
            }
            return Err(err);
        }
        Ok(row)
    }
}

/// Write bytes via a sibling temp file and rename, so readers never observe a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shut down")]
    Closed,
}

/// Shared HTTP client for network-backed adapters; owns retry/backoff so the pipeline does not.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying transport errors and retryable statuses with capped backoff.
    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url, bearer_token).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.get(url);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            let retryable = match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    status.to_string()
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                    err.to_string()
                }
            };

            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(attempt, ?delay, cause = %retryable, "retrying fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fcn_core::{DiffField, DiffResult, OpportunityStatus};
    use tempfile::tempdir;

    fn candidate(source_url: &str, budget: f64) -> CandidateRecord {
        CandidateRecord {
            title: "Network Modernization".to_string(),
            description: "Replace core switching".to_string(),
            agency: "GSA".to_string(),
            budget: Some(budget),
            posted_date: Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).single().unwrap(),
            due_date: None,
            status: OpportunityStatus::New,
            naics_codes: vec![],
            set_aside: None,
            point_of_contact: None,
            source_url: source_url.to_string(),
            source_type: "SAM.gov CSV".to_string(),
        }
    }

    fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn in_memory_create_enforces_unique_source_url() {
        let gateway = InMemoryGateway::new();
        gateway.create(&candidate("u1", 10.0)).await.unwrap();
        let err = gateway.create(&candidate("u1", 20.0)).await.unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyExists(key) if key == "u1"));
        assert_eq!(gateway.len().await, 1);
    }

    #[tokio::test]
    async fn find_by_keys_returns_only_matches() {
        let gateway = InMemoryGateway::new();
        gateway.create(&candidate("u1", 10.0)).await.unwrap();
        gateway.create(&candidate("u2", 10.0)).await.unwrap();
        let found = gateway.find_by_keys(&keys(&["u2", "u3"])).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].exact_key(), "u2");
    }

    #[tokio::test]
    async fn update_applies_patch_and_keeps_identity() {
        let gateway = InMemoryGateway::new();
        let created = gateway.create(&candidate("u1", 10.0)).await.unwrap();
        let patch = OpportunityPatch::from_diff(
            &candidate("u1", 99.0),
            &DiffResult::from_fields([DiffField::Budget]),
        );
        let updated = gateway.update("u1", &patch).await.unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.record.budget, Some(99.0));
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);

        let missing = gateway.update("nope", &patch).await.unwrap_err();
        assert!(matches!(missing, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn json_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data").join("opportunities.json");

        let gateway = JsonFileGateway::open(&path).await.expect("open empty");
        let created = gateway.create(&candidate("u1", 10.0)).await.unwrap();
        drop(gateway);

        let reopened = JsonFileGateway::open(&path).await.expect("reopen");
        let found = reopened.find_by_keys(&keys(&["u1"])).await.unwrap();
        assert_eq!(found, vec![created]);
    }

    #[tokio::test]
    async fn json_store_reloads_budgets_bit_for_bit() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("opportunities.json");
        let budget = 2119048949.6962857_f64;

        let gateway = JsonFileGateway::open(&path).await.expect("open empty");
        gateway.create(&candidate("u1", budget)).await.unwrap();
        drop(gateway);

        let reopened = JsonFileGateway::open(&path).await.expect("reopen");
        let found = reopened.find_by_keys(&keys(&["u1"])).await.unwrap();
        assert_eq!(found[0].record.budget.map(f64::to_bits), Some(budget.to_bits()));
    }

    #[tokio::test]
    async fn failed_flush_leaves_table_untouched() {
        let dir = tempdir().expect("tempdir");
        let data_dir = dir.path().join("data");
        let gateway = JsonFileGateway::open(data_dir.join("opportunities.json"))
            .await
            .expect("open empty");
        gateway.create(&candidate("u1", 10.0)).await.unwrap();
        assert!(gateway.path().is_file());

        // A plain file where the store directory used to be makes every flush fail.
        std::fs::remove_dir_all(&data_dir).unwrap();
        std::fs::write(&data_dir, b"not a directory").unwrap();

        let err = gateway.create(&candidate("u2", 20.0)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Io(_)));
        assert!(gateway.find_by_keys(&keys(&["u2"])).await.unwrap().is_empty());

        let patch = OpportunityPatch::from_diff(
            &candidate("u1", 99.0),
            &DiffResult::from_fields([DiffField::Budget]),
        );
        let err = gateway.update("u1", &patch).await.unwrap_err();
        assert!(matches!(err, GatewayError::Io(_)));
        let found = gateway.find_by_keys(&keys(&["u1"])).await.unwrap();
        assert_eq!(found[0].record.budget, Some(10.0));
    }

    #[tokio::test]
    async fn atomic_write_replaces_contents_without_leftovers() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retryable_statuses_are_server_errors_and_throttling() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }
}
