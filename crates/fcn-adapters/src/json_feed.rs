use async_trait::async_trait;
use fcn_core::{CandidateRecord, OpportunityStatus, PointOfContact};
use fcn_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{
    parse_budget, parse_listing_date, status_from_text, text_or_none, AdapterError, SourceAdapter,
    SourceKind,
};

const SOURCE_TYPE: &str = "SAM.gov API";

/// Authenticated opportunities search API returning `{"opportunitiesData": [...]}`.
#[derive(Debug, Clone)]
pub struct JsonFeedAdapter {
    source_id: String,
    url: String,
    api_key: Option<String>,
    fetcher: HttpFetcher,
}

impl JsonFeedAdapter {
    pub fn new(
        source_id: impl Into<String>,
        url: impl Into<String>,
        api_key: Option<String>,
        fetcher: HttpFetcher,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            api_key,
            fetcher,
        }
    }
}

#[async_trait]
impl SourceAdapter for JsonFeedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn collect(&self) -> Result<Vec<CandidateRecord>, AdapterError> {
        let response = self
            .fetcher
            .fetch_bytes(&self.source_id, &self.url, self.api_key.as_deref())
            .await?;
        parse_feed_json(&self.source_id, &response.body)
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_text(value: &JsonValue, paths: &[&[&str]]) -> Option<String> {
    paths
        .iter()
        .find_map(|path| json_str(value, path).and_then(text_or_none))
}

fn json_amount(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    match cur {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_budget(s),
        _ => None,
    }
}

fn contact_from(value: &JsonValue) -> Option<PointOfContact> {
    let raw = match value.get("pointOfContact")? {
        JsonValue::Array(items) => items.first()?,
        other => other,
    };
    let name = json_text(raw, &[&["fullName"], &["name"]]);
    let email = json_text(raw, &[&["email"]]);
    let phone = json_text(raw, &[&["phone"]]);
    if name.is_none() && email.is_none() && phone.is_none() {
        return None;
    }
    Some(PointOfContact {
        name: name.unwrap_or_default(),
        email: email.unwrap_or_default(),
        phone: phone.unwrap_or_default(),
    })
}

fn record_from_json(raw: &JsonValue) -> Option<CandidateRecord> {
    let notice_id = json_text(raw, &[&["noticeId"]])?;
    let posted_date = json_text(raw, &[&["postedDate"]]).and_then(|d| parse_listing_date(&d))?;

    let status = if raw.get("active").and_then(JsonValue::as_str) == Some("No") {
        OpportunityStatus::Closed
    } else {
        json_text(raw, &[&["type"]])
            .map(|t| status_from_text(&t))
            .unwrap_or_default()
    };

    Some(CandidateRecord {
        title: json_text(raw, &[&["title"]]).unwrap_or_default(),
        description: json_text(raw, &[&["description"]]).unwrap_or_default(),
        agency: json_text(raw, &[&["agency"], &["fullParentPathName"], &["department"]])
            .unwrap_or_default(),
        budget: json_amount(raw, &["estimatedValue"]).or_else(|| json_amount(raw, &["award", "amount"])),
        posted_date,
        due_date: json_text(raw, &[&["responseDeadLine"]]).and_then(|d| parse_listing_date(&d)),
        status,
        naics_codes: json_text(raw, &[&["naicsCode"]]).into_iter().collect(),
        set_aside: json_text(raw, &[&["typeOfSetAsideDescription"], &["setAside"]]),
        point_of_contact: contact_from(raw),
        source_url: json_text(raw, &[&["uiLink"]])
            .unwrap_or_else(|| format!("https://sam.gov/opp/{notice_id}/view")),
        source_type: SOURCE_TYPE.to_string(),
    })
}

/// Decode a feed page. An unreadable body fails the call; individual bad entries are skipped.
pub fn parse_feed_json(source_id: &str, body: &[u8]) -> Result<Vec<CandidateRecord>, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| AdapterError::Message(format!("invalid feed JSON from {source_id}: {e}")))?;
    let items = value
        .get("opportunitiesData")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| {
            AdapterError::Message(format!("feed from {source_id} has no opportunitiesData array"))
        })?;

    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match record_from_json(item) {
            Some(record) => out.push(record),
            None => warn!(source_id, entry = index, "skipping feed entry without notice id or posted date"),
        }
    }
    info!(source_id, records = out.len(), "parsed feed page");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"{
      "totalRecords": 3,
      "opportunitiesData": [
        {
          "noticeId": "abc",
          "title": "Zero Trust Architecture",
          "description": "ZTA rollout",
          "fullParentPathName": "DEPT OF HOMELAND SECURITY",
          "postedDate": "2025-05-01",
          "responseDeadLine": "2025-06-01T17:00:00-04:00",
          "type": "Solicitation",
          "active": "Yes",
          "naicsCode": "541512",
          "typeOfSetAsideDescription": "Total Small Business",
          "uiLink": "https://sam.gov/opp/abc/view",
          "estimatedValue": "$75,000",
          "pointOfContact": [{"fullName": "Ana Diaz", "email": "ana@dhs.gov"}]
        },
        {
          "noticeId": "def",
          "title": "Past Award",
          "description": "done",
          "agency": "NASA",
          "postedDate": "2025-05-02",
          "type": "Award Notice",
          "award": {"amount": 1200.5}
        },
        {"title": "No id"}
      ]
    }"#;

    #[test]
    fn parses_feed_entries_and_skips_bad_ones() {
        let records = parse_feed_json("sam-api", FEED.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.agency, "DEPT OF HOMELAND SECURITY");
        assert_eq!(first.budget, Some(75_000.0));
        assert_eq!(first.set_aside.as_deref(), Some("Total Small Business"));
        assert_eq!(first.point_of_contact.as_ref().unwrap().name, "Ana Diaz");
        assert!(first.due_date.is_some());

        let second = &records[1];
        assert_eq!(second.source_url, "https://sam.gov/opp/def/view");
        assert_eq!(second.status, OpportunityStatus::Awarded);
        assert_eq!(second.budget, Some(1200.5));
    }

    #[test]
    fn inactive_entries_are_closed() {
        let body = br#"{"opportunitiesData":[{"noticeId":"x","postedDate":"2025-01-01","active":"No","type":"Solicitation"}]}"#;
        let records = parse_feed_json("sam-api", body).unwrap();
        assert_eq!(records[0].status, OpportunityStatus::Closed);
    }

    #[test]
    fn unreadable_body_fails_whole_call() {
        assert!(parse_feed_json("sam-api", b"<html>").is_err());
        assert!(parse_feed_json("sam-api", br#"{"data": []}"#).is_err());
    }
}
