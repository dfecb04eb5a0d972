use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use fcn_core::DiffResult;
use fcn_storage::write_atomic;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::orchestrator::SourceStatus;
use crate::reconcile::{ReconcileOutcome, WriteFailure};

pub const DELTA_JSON: &str = "opportunities_delta.json";
pub const DELTA_CSV: &str = "opportunities_delta.csv";
pub const DAILY_BRIEF: &str = "daily_brief.md";
pub const DELTA_CSV_HEADER: [&str; 5] = ["type", "id", "title", "sourceUrl", "changedFields"];

/// Pre-reconciliation counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub collected: usize,
    pub valid: usize,
    pub rejected: usize,
    pub deduplicated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub collected: usize,
    pub valid: usize,
    pub rejected: usize,
    pub deduplicated: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub written_new: usize,
    pub written_updated: usize,
    pub failed_writes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEntry {
    pub id: Option<Uuid>,
    pub title: String,
    pub agency: String,
    pub source_url: String,
    pub source_type: String,
    pub written: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedEntry {
    pub id: Uuid,
    pub title: String,
    pub source_url: String,
    pub changed_fields: DiffResult,
    pub written: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    New,
    Updated,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Updated => "updated",
        }
    }
}

/// One line of the flat delta export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRow {
    pub kind: DeltaKind,
    /// Empty when a create failed and no identity was assigned.
    pub id: String,
    pub title: String,
    pub source_url: String,
    pub changed_fields: String,
}

/// Delta of one run, as consumed by notification and audit tooling.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub run_id: Uuid,
    pub date: DateTime<Utc>,
    pub summary: ReportSummary,
    pub sources: Vec<SourceStatus>,
    pub new_opportunities: Vec<NewEntry>,
    pub updated_opportunities: Vec<UpdatedEntry>,
    pub failures: Vec<WriteFailure>,
}

impl ReconciliationReport {
    pub fn build(
        run_id: Uuid,
        date: DateTime<Utc>,
        counts: RunCounts,
        sources: Vec<SourceStatus>,
        outcome: &ReconcileOutcome,
    ) -> Self {
        let new_opportunities = outcome
            .new
            .iter()
            .map(|item| {
                let record = item
                    .persisted
                    .as_ref()
                    .map(|row| &row.record)
                    .unwrap_or(&item.candidate);
                NewEntry {
                    id: item.persisted.as_ref().map(|row| row.id),
                    title: record.title.clone(),
                    agency: record.agency.clone(),
                    source_url: record.source_url.clone(),
                    source_type: record.source_type.clone(),
                    written: item.write.is_written(),
                }
            })
            .collect();
        let updated_opportunities = outcome
            .updated
            .iter()
            .map(|item| UpdatedEntry {
                id: item.entity.id,
                title: item.entity.record.title.clone(),
                source_url: item.entity.record.source_url.clone(),
                changed_fields: item.diff.clone(),
                written: item.write.is_written(),
            })
            .collect();

        Self {
            run_id,
            date,
            summary: ReportSummary {
                collected: counts.collected,
                valid: counts.valid,
                rejected: counts.rejected,
                deduplicated: counts.deduplicated,
                new: outcome.new.len(),
                updated: outcome.updated.len(),
                unchanged: outcome.unchanged,
                written_new: outcome.written_new(),
                written_updated: outcome.written_updated(),
                failed_writes: outcome.failures.len(),
            },
            sources,
            new_opportunities,
            updated_opportunities,
            failures: outcome.failures.clone(),
        }
    }

    /// New rows first, then updated rows, each in classification order.
    pub fn rows(&self) -> Vec<DeltaRow> {
        let new = self.new_opportunities.iter().map(|entry| DeltaRow {
            kind: DeltaKind::New,
            id: entry.id.map(|id| id.to_string()).unwrap_or_default(),
            title: entry.title.clone(),
            source_url: entry.source_url.clone(),
            changed_fields: String::new(),
        });
        let updated = self.updated_opportunities.iter().map(|entry| DeltaRow {
            kind: DeltaKind::Updated,
            id: entry.id.to_string(),
            title: entry.title.clone(),
            source_url: entry.source_url.clone(),
            changed_fields: entry.changed_fields.names().join(";"),
        });
        new.chain(updated).collect()
    }

    pub fn to_json_pretty(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("serializing delta report")
    }

    /// Flat rows as CSV. The header is written even when there are no rows.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(DELTA_CSV_HEADER)
            .context("writing delta csv header")?;
        for row in self.rows() {
            writer
                .write_record([
                    row.kind.as_str(),
                    row.id.as_str(),
                    row.title.as_str(),
                    row.source_url.as_str(),
                    row.changed_fields.as_str(),
                ])
                .with_context(|| format!("writing delta row for {}", row.source_url))?;
        }
        writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("flushing delta csv: {}", err.error()))
    }

    pub fn daily_brief(&self) -> String {
        let s = &self.summary;
        let mut lines = vec![
            "# FCN Daily Brief".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Date: {}", self.date.to_rfc3339()),
            format!(
                "- Collected: {} (valid {}, rejected {}, after dedup {})",
                s.collected, s.valid, s.rejected, s.deduplicated
            ),
            format!(
                "- New: {} ({} written) / Updated: {} ({} written) / Unchanged: {}",
                s.new, s.written_new, s.updated, s.written_updated, s.unchanged
            ),
            String::new(),
            "## Sources".to_string(),
        ];
        for source in &self.sources {
            lines.push(match &source.error {
                None => format!("- {}: {} records", source.source_id, source.records),
                Some(err) => format!("- {}: failed ({err})", source.source_id),
            });
        }
        if !self.updated_opportunities.is_empty() {
            lines.push(String::new());
            lines.push("## Updated".to_string());
            for entry in &self.updated_opportunities {
                lines.push(format!(
                    "- {} [{}]",
                    entry.title,
                    entry.changed_fields.names().join(", ")
                ));
            }
        }
        if !self.failures.is_empty() {
            lines.push(String::new());
            lines.push("## Write failures".to_string());
            for failure in &self.failures {
                lines.push(format!(
                    "- {:?} {}: {}",
                    failure.action, failure.source_url, failure.error
                ));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }

    /// Write every artifact of this report under `<reports_root>/<run_id>/`.
    pub async fn write_to(&self, reports_root: &Path) -> Result<ReportArtifacts> {
        let dir = reports_root.join(self.run_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let json_path = dir.join(DELTA_JSON);
        write_atomic(&json_path, &self.to_json_pretty()?).await?;
        let csv_path = dir.join(DELTA_CSV);
        write_atomic(&csv_path, &self.to_csv()?).await?;
        write_atomic(&dir.join(DAILY_BRIEF), self.daily_brief().as_bytes()).await?;

        let manifest_path = self.export_parquet_snapshots(&dir).await?;
        info!(run_id = %self.run_id, dir = %dir.display(), "wrote delta report");
        Ok(ReportArtifacts {
            dir,
            json_path,
            csv_path,
            manifest_path,
        })
    }

    async fn export_parquet_snapshots(&self, run_dir: &Path) -> Result<PathBuf> {
        let snapshot_dir = run_dir.join("snapshots");
        tokio::fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let rows_path = snapshot_dir.join("delta_rows.parquet");
        let sources_path = snapshot_dir.join("sources.parquet");
        write_delta_rows_parquet(&rows_path, &self.rows())?;
        write_sources_parquet(&sources_path, &self.sources)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("delta_rows", run_dir, &rows_path)?,
                manifest_entry("sources", run_dir, &sources_path)?,
            ],
        };
        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        write_atomic(&manifest_path, &bytes).await?;
        Ok(manifest_path)
    }
}

#[derive(Debug, Clone)]
pub struct ReportArtifacts {
    pub dir: PathBuf,
    pub json_path: PathBuf,
    pub csv_path: PathBuf,
    pub manifest_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_delta_rows_parquet(path: &Path, rows: &[DeltaRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("type", DataType::Utf8, false),
        ArrowField::new("id", DataType::Utf8, true),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("source_url", DataType::Utf8, false),
        ArrowField::new("changed_fields", DataType::Utf8, false),
    ]));
    let kinds = StringArray::from(rows.iter().map(|r| Some(r.kind.as_str())).collect::<Vec<_>>());
    let ids = StringArray::from(
        rows.iter()
            .map(|r| (!r.id.is_empty()).then_some(r.id.as_str()))
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(rows.iter().map(|r| Some(r.title.as_str())).collect::<Vec<_>>());
    let urls = StringArray::from(
        rows.iter()
            .map(|r| Some(r.source_url.as_str()))
            .collect::<Vec<_>>(),
    );
    let changed = StringArray::from(
        rows.iter()
            .map(|r| Some(r.changed_fields.as_str()))
            .collect::<Vec<_>>(),
    );
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(kinds),
            Arc::new(ids),
            Arc::new(titles),
            Arc::new(urls),
            Arc::new(changed),
        ],
    )
    .context("building delta rows record batch")?;
    write_parquet(path, batch)
}

fn write_sources_parquet(path: &Path, sources: &[SourceStatus]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("collected", DataType::Boolean, false),
        ArrowField::new("records", DataType::UInt64, false),
        ArrowField::new("error", DataType::Utf8, true),
    ]));
    let ids = StringArray::from(
        sources
            .iter()
            .map(|s| Some(s.source_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let collected = BooleanArray::from(sources.iter().map(|s| s.collected).collect::<Vec<_>>());
    let records = UInt64Array::from(sources.iter().map(|s| s.records as u64).collect::<Vec<_>>());
    let errors = StringArray::from(sources.iter().map(|s| s.error.as_deref()).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(collected),
            Arc::new(records),
            Arc::new(errors),
        ],
    )
    .context("building sources record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Markdown digest of the most recent `runs` delta reports under `reports_root`, newest first.
pub fn history_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut reports = Vec::new();
    for entry in std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let entry = entry.with_context(|| format!("listing {}", reports_root.display()))?;
        let delta_path = entry.path().join(DELTA_JSON);
        if !delta_path.is_file() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&delta_path)
                .with_context(|| format!("reading {}", delta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", delta_path.display()))?;
        reports.push((entry.path(), value));
    }
    reports.sort_by(|(_, a), (_, b)| {
        let date = |v: &serde_json::Value| v.get("date").and_then(|d| d.as_str()).map(str::to_owned);
        date(b).cmp(&date(a))
    });

    let count = |v: &serde_json::Value, key: &str| {
        v.get("summary")
            .and_then(|s| s.get(key))
            .and_then(|n| n.as_u64())
            .unwrap_or(0)
    };
    let mut lines = vec!["# FCN Report History".to_string(), String::new()];
    for (dir, value) in reports.into_iter().take(runs) {
        let run_id = value
            .get("runId")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| dir.file_name().unwrap_or_default().to_string_lossy().into_owned());
        lines.push(format!("## Run `{run_id}`"));
        if let Some(date) = value.get("date").and_then(|v| v.as_str()) {
            lines.push(format!("- date: {date}"));
        }
        lines.push(format!("- new: {}", count(&value, "new")));
        lines.push(format!("- updated: {}", count(&value, "updated")));
        lines.push(format!("- unchanged: {}", count(&value, "unchanged")));
        lines.push(format!("- failed writes: {}", count(&value, "failedWrites")));
        lines.push(format!("- delta: `{}`", dir.join(DELTA_JSON).display()));
        let manifest = dir.join("snapshots").join("manifest.json");
        if manifest.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
