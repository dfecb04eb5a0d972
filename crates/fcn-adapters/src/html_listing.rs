use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use fcn_core::{CandidateRecord, PointOfContact};
use fcn_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use tracing::{info, warn};

use crate::{
    parse_budget, parse_listing_date, status_from_text, text_or_none, AdapterError, SourceAdapter,
    SourceKind,
};

const SOURCE_TYPE: &str = "FBO.gov";
const NOTICE_URL_PREFIX: &str = "https://www.fbo.gov/index.php?s=opportunity&mode=form&id=";

#[derive(Debug, Clone)]
pub enum ListingLocation {
    File(PathBuf),
    Url(String),
}

/// Scrapes an opportunity listing page laid out as one `.solnbr` block per notice.
#[derive(Debug, Clone)]
pub struct HtmlListingAdapter {
    source_id: String,
    location: ListingLocation,
    fetcher: Option<HttpFetcher>,
}

impl HtmlListingAdapter {
    pub fn from_file(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            location: ListingLocation::File(path.into()),
            fetcher: None,
        }
    }

    pub fn from_url(source_id: impl Into<String>, url: impl Into<String>, fetcher: HttpFetcher) -> Self {
        Self {
            source_id: source_id.into(),
            location: ListingLocation::Url(url.into()),
            fetcher: Some(fetcher),
        }
    }

    async fn load_html(&self) -> Result<(String, Option<&str>), AdapterError> {
        match &self.location {
            ListingLocation::File(path) => {
                let html = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading listing {}", path.display()))?;
                Ok((html, None))
            }
            ListingLocation::Url(url) => {
                let fetcher = self.fetcher.as_ref().ok_or_else(|| {
                    AdapterError::Message(format!("no http fetcher configured for {url}"))
                })?;
                let response = fetcher.fetch_bytes(&self.source_id, url, None).await?;
                Ok((String::from_utf8_lossy(&response.body).into_owned(), Some(url.as_str())))
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlListingAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Scrape
    }

    async fn collect(&self) -> Result<Vec<CandidateRecord>, AdapterError> {
        let (html, base_url) = self.load_html().await?;
        parse_listing_html(&self.source_id, &html, base_url)
    }
}

struct ListingSelectors {
    block: Selector,
    title: Selector,
    description: Selector,
    agency: Selector,
    budget: Selector,
    posted: Selector,
    due: Selector,
    status: Selector,
    notice_id: Selector,
    naics: Selector,
    set_aside: Selector,
    detail_link: Selector,
    contact_name: Selector,
    contact_email: Selector,
    contact_phone: Selector,
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

impl ListingSelectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            block: selector(".solnbr")?,
            title: selector(".title")?,
            description: selector(".description")?,
            agency: selector(".agency")?,
            budget: selector(".budget")?,
            posted: selector(".publish-date")?,
            due: selector(".due-date")?,
            status: selector(".status")?,
            notice_id: selector(".notice-id")?,
            naics: selector(".naics li")?,
            set_aside: selector(".set-aside")?,
            detail_link: selector("a.detail-link[href]")?,
            contact_name: selector(".contact-name")?,
            contact_email: selector(".contact-email")?,
            contact_phone: selector(".contact-phone")?,
        })
    }
}

fn first_text(block: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    block
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn all_texts(block: &ElementRef<'_>, sel: &Selector) -> Vec<String> {
    block
        .select(sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect()
}

fn resolve_href(href: &str, base_url: Option<&str>) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    let Some(base) = base_url else {
        return href.to_string();
    };
    let origin_end = base
        .find("://")
        .and_then(|scheme_end| {
            base[scheme_end + 3..]
                .find('/')
                .map(|path_start| scheme_end + 3 + path_start)
        })
        .unwrap_or(base.len());
    format!("{}/{}", &base[..origin_end], href.trim_start_matches('/'))
}

/// Parse every listing block; blocks without a usable URL or posted date are skipped.
pub fn parse_listing_html(
    source_id: &str,
    html: &str,
    base_url: Option<&str>,
) -> Result<Vec<CandidateRecord>, AdapterError> {
    let sel = ListingSelectors::new()?;
    let document = Html::parse_document(html);

    let mut out = Vec::new();
    for (index, block) in document.select(&sel.block).enumerate() {
        let detail_href = block
            .select(&sel.detail_link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(text_or_none);
        let source_url = match (detail_href, first_text(&block, &sel.notice_id)) {
            (Some(href), _) => resolve_href(&href, base_url),
            (None, Some(notice_id)) => format!("{NOTICE_URL_PREFIX}{notice_id}"),
            (None, None) => {
                warn!(source_id, block = index, "skipping listing block without notice id or link");
                continue;
            }
        };
        let Some(posted_date) = first_text(&block, &sel.posted).and_then(|d| parse_listing_date(&d)) else {
            warn!(source_id, source_url = %source_url, "skipping listing block without parseable publish date");
            continue;
        };

        let name = first_text(&block, &sel.contact_name);
        let email = first_text(&block, &sel.contact_email);
        let phone = first_text(&block, &sel.contact_phone);
        let point_of_contact = if name.is_some() || email.is_some() || phone.is_some() {
            Some(PointOfContact {
                name: name.unwrap_or_default(),
                email: email.unwrap_or_default(),
                phone: phone.unwrap_or_default(),
            })
        } else {
            None
        };

        out.push(CandidateRecord {
            title: first_text(&block, &sel.title).unwrap_or_default(),
            description: first_text(&block, &sel.description).unwrap_or_default(),
            agency: first_text(&block, &sel.agency).unwrap_or_default(),
            budget: first_text(&block, &sel.budget).and_then(|b| parse_budget(&b)),
            posted_date,
            due_date: first_text(&block, &sel.due).and_then(|d| parse_listing_date(&d)),
            status: first_text(&block, &sel.status)
                .map(|s| status_from_text(&s))
                .unwrap_or_default(),
            naics_codes: all_texts(&block, &sel.naics),
            set_aside: first_text(&block, &sel.set_aside),
            point_of_contact,
            source_url,
            source_type: SOURCE_TYPE.to_string(),
        });
    }
    info!(source_id, records = out.len(), "parsed listing page");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcn_core::OpportunityStatus;
    use std::path::Path;

    const LISTING: &str = r#"
<html><body>
  <div class="solnbr">
    <span class="notice-id">W912-25-R-0001</span>
    <h2 class="title">Data Center Consolidation</h2>
    <p class="description">Consolidate regional data centers.</p>
    <span class="agency">Department of the Army</span>
    <span class="budget">$2,000,000</span>
    <span class="publish-date">2025-02-10</span>
    <span class="due-date">03/15/2025</span>
    <span class="status">Active</span>
    <ul class="naics"><li>518210</li><li>541519</li></ul>
    <span class="contact-name">Pat Lee</span>
    <span class="contact-email">pat.lee@army.mil</span>
  </div>
  <div class="solnbr">
    <a class="detail-link" href="/notices/42">details</a>
    <h2 class="title">Help Desk Services</h2>
    <p class="description">Tier 1 support.</p>
    <span class="agency">VA</span>
    <span class="publish-date">2025-02-11</span>
    <span class="status">Closed</span>
  </div>
  <div class="solnbr">
    <h2 class="title">Orphan block</h2>
    <span class="publish-date">2025-02-12</span>
  </div>
  <div class="solnbr">
    <span class="notice-id">NO-DATE</span>
    <h2 class="title">Undated</h2>
  </div>
</body></html>
"#;

    #[test]
    fn parses_listing_blocks_and_skips_malformed_ones() {
        let records =
            parse_listing_html("fbo", LISTING, Some("https://notices.example.gov/search?q=it")).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(
            first.source_url,
            "https://www.fbo.gov/index.php?s=opportunity&mode=form&id=W912-25-R-0001"
        );
        assert_eq!(first.title, "Data Center Consolidation");
        assert_eq!(first.budget, Some(2_000_000.0));
        assert!(first.due_date.is_some());
        assert_eq!(first.naics_codes, vec!["518210".to_string(), "541519".to_string()]);
        let contact = first.point_of_contact.as_ref().unwrap();
        assert_eq!(contact.name, "Pat Lee");
        assert_eq!(contact.phone, "");

        let second = &records[1];
        assert_eq!(second.source_url, "https://notices.example.gov/notices/42");
        assert_eq!(second.status, OpportunityStatus::Closed);
        assert_eq!(second.budget, None);
        assert!(second.point_of_contact.is_none());
    }

    #[test]
    fn relative_links_without_base_are_kept_verbatim() {
        assert_eq!(resolve_href("/notices/1", None), "/notices/1");
        assert_eq!(
            resolve_href("notices/1", Some("https://example.gov")),
            "https://example.gov/notices/1"
        );
        assert_eq!(
            resolve_href("https://other.gov/x", Some("https://example.gov/a")),
            "https://other.gov/x"
        );
    }

    #[tokio::test]
    async fn fixture_listing_collects_from_file() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("fixtures/fbo-listing/listing.html");
        let adapter = HtmlListingAdapter::from_file("fbo-listing", path);
        assert_eq!(adapter.kind(), SourceKind::Scrape);
        let records = adapter.collect().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.validate().is_ok()));
    }
}
