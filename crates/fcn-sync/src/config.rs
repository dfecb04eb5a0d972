use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fcn_adapters::{CsvExportAdapter, HtmlListingAdapter, JsonFeedAdapter, SourceAdapter, SourceKind};
use fcn_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub reports_dir: PathBuf,
    pub store_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub fuzzy_dedup: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workspace_root = lookup("FCN_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            reports_dir: lookup("FCN_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("reports")),
            store_path: lookup("FCN_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("data").join("opportunities.json")),
            user_agent: lookup("FCN_USER_AGENT").unwrap_or_else(|| "fcn-bot/0.1".to_string()),
            http_timeout_secs: lookup("FCN_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_retries: lookup("FCN_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            fuzzy_dedup: lookup("FCN_FUZZY_DEDUP")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            workspace_root,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub max_records: Option<usize>,
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        let mut seen = std::collections::HashSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id {} in registry", source.source_id);
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Enabled sources in registry order; this order is the aggregation order of a run.
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Build the adapter for one registry entry. Relative paths resolve against `workspace_root`.
pub fn adapter_for_source(
    source: &SourceConfig,
    workspace_root: &Path,
    fetcher: &HttpFetcher,
) -> Result<Box<dyn SourceAdapter>> {
    let resolve = |p: &PathBuf| {
        if p.is_absolute() {
            p.clone()
        } else {
            workspace_root.join(p)
        }
    };
    match source.kind {
        SourceKind::File => {
            let Some(path) = &source.path else {
                bail!("file source {} needs a path", source.source_id);
            };
            Ok(Box::new(
                CsvExportAdapter::new(&source.source_id, resolve(path))
                    .with_max_records(source.max_records),
            ))
        }
        SourceKind::Scrape => match (&source.path, &source.url) {
            (Some(path), _) => Ok(Box::new(HtmlListingAdapter::from_file(
                &source.source_id,
                resolve(path),
            ))),
            (None, Some(url)) => Ok(Box::new(HtmlListingAdapter::from_url(
                &source.source_id,
                url,
                fetcher.clone(),
            ))),
            (None, None) => bail!("scrape source {} needs a path or url", source.source_id),
        },
        SourceKind::Api => {
            let Some(url) = &source.url else {
                bail!("api source {} needs a url", source.source_id);
            };
            let api_key = source.api_key_env.as_deref().and_then(|var| {
                let key = std::env::var(var).ok().filter(|v| !v.is_empty());
                if key.is_none() {
                    warn!(source_id = %source.source_id, env = var, "api key variable is unset; requesting without credentials");
                }
                key
            });
            Ok(Box::new(JsonFeedAdapter::new(
                &source.source_id,
                url,
                api_key,
                fetcher.clone(),
            )))
        }
    }
}
