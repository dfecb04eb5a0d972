//! Core domain model for FCN: candidate records, persisted opportunities, reconciliation keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fcn-core";

/// Source type recorded when an adapter leaves `source_type` blank.
pub const UNKNOWN_SOURCE_TYPE: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityStatus {
    #[default]
    New,
    Updated,
    Closed,
    Awarded,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Updated => "updated",
            Self::Closed => "closed",
            Self::Awarded => "awarded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointOfContact {
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
}

/// Normalized, not-yet-persisted opportunity handed from adapters into the sync pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub title: String,
    pub description: String,
    pub agency: String,
    pub budget: Option<f64>,
    pub posted_date: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: OpportunityStatus,
    #[serde(default)]
    pub naics_codes: Vec<String>,
    pub set_aside: Option<String>,
    pub point_of_contact: Option<PointOfContact>,
    pub source_url: String,
    #[serde(default)]
    pub source_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("candidate {source_url:?} is missing required field `{field}`")]
    MissingField {
        field: &'static str,
        source_url: String,
    },
}

impl CandidateRecord {
    /// Exact reconciliation key: the source URL, verbatim.
    pub fn exact_key(&self) -> &str {
        &self.source_url
    }

    pub fn fuzzy_key(&self) -> FuzzyKey {
        FuzzyKey::from_parts(&self.title, &self.agency)
    }

    /// Rejects records whose identifying text fields are blank.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let required = [
            ("sourceUrl", &self.source_url),
            ("title", &self.title),
            ("description", &self.description),
            ("agency", &self.agency),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field,
                    source_url: self.source_url.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Case-insensitive title + agency composite used to merge mirrored listings across sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FuzzyKey {
    Composite(String),
    /// Title or agency was empty; never equal to any other key, including another `Isolated`.
    Isolated,
}

impl FuzzyKey {
    pub fn from_parts(title: &str, agency: &str) -> Self {
        if title.is_empty() || agency.is_empty() {
            return Self::Isolated;
        }
        Self::Composite(format!("{}-{}", title.to_lowercase(), agency.to_lowercase()))
    }

    pub fn as_composite(&self) -> Option<&str> {
        match self {
            Self::Composite(key) => Some(key),
            Self::Isolated => None,
        }
    }
}

/// Canonical persisted opportunity: candidate fields plus identity, timestamps, and relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedOpportunity {
    pub id: Uuid,
    #[serde(flatten)]
    pub record: CandidateRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub category_ids: Vec<Uuid>,
    #[serde(default)]
    pub notified_rep_ids: Vec<Uuid>,
}

impl PersistedOpportunity {
    /// First persistence of a candidate: fresh identity, empty category and notification state.
    pub fn from_candidate(candidate: &CandidateRecord, now: DateTime<Utc>) -> Self {
        let mut record = candidate.clone();
        if record.source_type.trim().is_empty() {
            record.source_type = UNKNOWN_SOURCE_TYPE.to_string();
        }
        Self {
            id: Uuid::new_v4(),
            record,
            created_at: now,
            updated_at: now,
            category_ids: Vec::new(),
            notified_rep_ids: Vec::new(),
        }
    }

    pub fn exact_key(&self) -> &str {
        &self.record.source_url
    }
}

/// Flat, comparable fields that participate in change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiffField {
    Title,
    Description,
    Agency,
    Budget,
    Status,
    PostedDate,
    DueDate,
    NaicsCodes,
    SetAside,
}

impl DiffField {
    pub const WHITELIST: [DiffField; 9] = [
        DiffField::Title,
        DiffField::Description,
        DiffField::Agency,
        DiffField::Budget,
        DiffField::Status,
        DiffField::PostedDate,
        DiffField::DueDate,
        DiffField::NaicsCodes,
        DiffField::SetAside,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::Agency => "agency",
            Self::Budget => "budget",
            Self::Status => "status",
            Self::PostedDate => "postedDate",
            Self::DueDate => "dueDate",
            Self::NaicsCodes => "naicsCodes",
            Self::SetAside => "setAside",
        }
    }
}

/// Changed whitelisted fields, kept in whitelist order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiffResult {
    fields: Vec<DiffField>,
}

impl DiffResult {
    pub fn from_fields(fields: impl IntoIterator<Item = DiffField>) -> Self {
        let mut fields: Vec<DiffField> = fields.into_iter().collect();
        fields.sort();
        fields.dedup();
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[DiffField] {
        &self.fields
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.fields.iter().map(DiffField::as_str).collect()
    }
}

/// Field-level update payload: `Some` only for fields that changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpportunityPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub agency: Option<String>,
    pub budget: Option<Option<f64>>,
    pub status: Option<OpportunityStatus>,
    pub posted_date: Option<DateTime<Utc>>,
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub naics_codes: Option<Vec<String>>,
    pub set_aside: Option<Option<String>>,
}

impl OpportunityPatch {
    pub fn from_diff(incoming: &CandidateRecord, diff: &DiffResult) -> Self {
        let mut patch = Self::default();
        for field in diff.fields() {
            match field {
                DiffField::Title => patch.title = Some(incoming.title.clone()),
                DiffField::Description => patch.description = Some(incoming.description.clone()),
                DiffField::Agency => patch.agency = Some(incoming.agency.clone()),
                DiffField::Budget => patch.budget = Some(incoming.budget),
                DiffField::Status => patch.status = Some(incoming.status),
                DiffField::PostedDate => patch.posted_date = Some(incoming.posted_date),
                DiffField::DueDate => patch.due_date = Some(incoming.due_date),
                DiffField::NaicsCodes => patch.naics_codes = Some(incoming.naics_codes.clone()),
                DiffField::SetAside => patch.set_aside = Some(incoming.set_aside.clone()),
            }
        }
        patch
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, record: &mut CandidateRecord) {
        if let Some(v) = &self.title {
            record.title = v.clone();
        }
        if let Some(v) = &self.description {
            record.description = v.clone();
        }
        if let Some(v) = &self.agency {
            record.agency = v.clone();
        }
        if let Some(v) = self.budget {
            record.budget = v;
        }
        if let Some(v) = self.status {
            record.status = v;
        }
        if let Some(v) = self.posted_date {
            record.posted_date = v;
        }
        if let Some(v) = self.due_date {
            record.due_date = v;
        }
        if let Some(v) = &self.naics_codes {
            record.naics_codes = v.clone();
        }
        if let Some(v) = &self.set_aside {
            record.set_aside = v.clone();
        }
    }
}
