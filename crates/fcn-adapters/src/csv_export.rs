use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use fcn_core::{CandidateRecord, OpportunityStatus, PointOfContact};
use serde::Deserialize;
use tokio::fs;
use tracing::{info, warn};

use crate::{parse_budget, parse_listing_date, text_or_none, AdapterError, SourceAdapter, SourceKind};

const SOURCE_TYPE: &str = "SAM.gov CSV";

/// Reads the SAM.gov "Contract Opportunities" full CSV export from disk.
#[derive(Debug, Clone)]
pub struct CsvExportAdapter {
    source_id: String,
    path: PathBuf,
    max_records: Option<usize>,
}

impl CsvExportAdapter {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
            max_records: None,
        }
    }

    pub fn with_max_records(mut self, max_records: Option<usize>) -> Self {
        self.max_records = max_records;
        self
    }

    /// Parse export bytes; rows that fail to decode or lack required columns are skipped.
    pub fn parse(&self, bytes: &[u8]) -> Result<Vec<CandidateRecord>, AdapterError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(bytes);
        reader.headers()?;

        let limit = self.max_records.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        let mut skipped = 0usize;
        for (index, row) in reader.deserialize::<SamCsvRow>().enumerate() {
            if out.len() >= limit {
                break;
            }
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    warn!(source_id = %self.source_id, row = index + 1, error = %err, "skipping undecodable csv row");
                    skipped += 1;
                    continue;
                }
            };
            match row.into_candidate() {
                Some(candidate) => out.push(candidate),
                None => {
                    warn!(source_id = %self.source_id, row = index + 1, "skipping csv row without notice id, title, or posted date");
                    skipped += 1;
                }
            }
        }
        info!(source_id = %self.source_id, records = out.len(), skipped, "parsed csv export");
        Ok(out)
    }
}

#[async_trait]
impl SourceAdapter for CsvExportAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    async fn collect(&self) -> Result<Vec<CandidateRecord>, AdapterError> {
        let exists = fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking {}", self.path.display()))?;
        if !exists {
            return Err(AdapterError::NotFound(format!(
                "csv export {}",
                self.path.display()
            )));
        }
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        self.parse(&bytes)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SamCsvRow {
    #[serde(rename = "NoticeId")]
    notice_id: Option<String>,
    #[serde(rename = "Title")]
    title: Option<String>,
    #[serde(rename = "Description")]
    description: Option<String>,
    #[serde(rename = "DepartmentIndAgency")]
    department_ind_agency: Option<String>,
    #[serde(rename = "Department")]
    department: Option<String>,
    #[serde(rename = "PostedDate")]
    posted_date: Option<String>,
    #[serde(rename = "ResponseDeadLine")]
    response_deadline: Option<String>,
    #[serde(rename = "Award$")]
    award_amount: Option<String>,
    #[serde(rename = "EstimatedValue")]
    estimated_value: Option<String>,
    #[serde(rename = "Type")]
    notice_type: Option<String>,
    #[serde(rename = "Active")]
    active: Option<String>,
    #[serde(rename = "Link")]
    link: Option<String>,
    #[serde(rename = "NaicsCode")]
    naics_code: Option<String>,
    #[serde(rename = "SetAside")]
    set_aside: Option<String>,
    #[serde(rename = "PrimaryContactFullname")]
    primary_contact_name: Option<String>,
    #[serde(rename = "PrimaryContactEmail")]
    primary_contact_email: Option<String>,
    #[serde(rename = "PrimaryContactPhone")]
    primary_contact_phone: Option<String>,
    #[serde(rename = "SecondaryContactFullname")]
    secondary_contact_name: Option<String>,
    #[serde(rename = "SecondaryContactEmail")]
    secondary_contact_email: Option<String>,
    #[serde(rename = "SecondaryContactPhone")]
    secondary_contact_phone: Option<String>,
}

fn present(value: &Option<String>) -> Option<String> {
    value.as_deref().and_then(text_or_none)
}

impl SamCsvRow {
    fn into_candidate(self) -> Option<CandidateRecord> {
        let notice_id = present(&self.notice_id)?;
        let title = present(&self.title)?;
        let posted_date = present(&self.posted_date).and_then(|d| parse_listing_date(&d))?;

        let budget = present(&self.award_amount)
            .or_else(|| present(&self.estimated_value))
            .and_then(|v| parse_budget(&v))
            .unwrap_or(0.0);

        Some(CandidateRecord {
            title,
            description: present(&self.description)
                .unwrap_or_else(|| "No description available".to_string()),
            agency: present(&self.department_ind_agency)
                .or_else(|| present(&self.department))
                .unwrap_or_else(|| "Unknown Agency".to_string()),
            budget: Some(budget),
            posted_date,
            due_date: present(&self.response_deadline).and_then(|d| parse_listing_date(&d)),
            status: self.status(),
            naics_codes: present(&self.naics_code).into_iter().collect(),
            set_aside: present(&self.set_aside),
            point_of_contact: self.contact(),
            source_url: present(&self.link)
                .unwrap_or_else(|| format!("https://sam.gov/opp/{notice_id}/view")),
            source_type: SOURCE_TYPE.to_string(),
        })
    }

    fn status(&self) -> OpportunityStatus {
        if self.active.as_deref().map(str::trim) == Some("No") {
            return OpportunityStatus::Closed;
        }
        let is_award = self
            .notice_type
            .as_deref()
            .is_some_and(|t| t.to_ascii_lowercase().contains("award"));
        if is_award {
            OpportunityStatus::Awarded
        } else {
            OpportunityStatus::New
        }
    }

    fn contact(&self) -> Option<PointOfContact> {
        let (name, email, phone) = if let Some(name) = present(&self.primary_contact_name) {
            (name, &self.primary_contact_email, &self.primary_contact_phone)
        } else if let Some(name) = present(&self.secondary_contact_name) {
            (name, &self.secondary_contact_email, &self.secondary_contact_phone)
        } else {
            return None;
        };
        Some(PointOfContact {
            name,
            email: present(email).unwrap_or_default(),
            phone: present(phone).unwrap_or_default(),
        })
    }
}
