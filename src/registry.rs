//! Patent search and PDF download.
//!
//! The pipeline only needs "enough PDFs exist locally" before text
//! extraction. [`PatentRegistry`] is that seam: `search` finds patent ids,
//! `fetch` stores one patent's PDF in a directory.
//!
//! [`PatentsViewRegistry`] searches the PatentsView API and downloads from
//! two sources, in order:
//!
//! 1. the USPTO image server (accepted only when it answers `application/pdf`)
//! 2. the Google Patents page, whose `patentimages.storage.googleapis.com`
//!    link is followed
//!
//! Network failures are logged and reported as "not fetched"; only local
//! I/O failures are errors.

use crate::error::ExtractError;
use crate::pipeline::export::write_atomic;
use async_trait::async_trait;
use chrono::Datelike;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PATENTSVIEW_ENDPOINT: &str = "https://search.patentsview.org/api/v1/patent/";
const USPTO_PDF_URL: &str = "https://image-ppubs.uspto.gov/dirsearch-public/print/downloadPdf/";
const GOOGLE_PATENTS_URL: &str = "https://patents.google.com/patent/";
const BROWSER_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// First year of the search date range.
pub const SEARCH_FROM_YEAR: i32 = 2000;

static PDF_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:https?:)?//patentimages\.storage\.googleapis\.com/[^"'\s<>]+?\.pdf"#).unwrap()
});

/// Finds patents and stores their PDFs locally.
#[async_trait]
pub trait PatentRegistry: Send + Sync {
    /// Up to `limit` patent ids matching `query`.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, ExtractError>;

    /// Store the PDF of `patent_id` in `destination` (a directory).
    /// Returns `false` when no source could provide it.
    async fn fetch(&self, patent_id: &str, destination: &Path) -> Result<bool, ExtractError>;
}

/// USPTO form of a patent id: `US` prefix, no separators.
pub fn normalize_patent_id(id: &str) -> String {
    let compact: String = id
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase();
    if compact.starts_with("US") {
        compact
    } else {
        format!("US{compact}")
    }
}

/// Where [`PatentRegistry::fetch`] stores `patent_id` inside `dir`.
pub fn pdf_path(dir: &Path, patent_id: &str) -> PathBuf {
    dir.join(format!("{}.pdf", normalize_patent_id(patent_id)))
}

/// PatentsView search body: phrase match on title/abstract within
/// `SEARCH_FROM_YEAR..=to_year`, oldest ids first.
pub fn search_body(query: &str, limit: usize, to_year: i32) -> Value {
    json!({
        "f": ["patent_id", "patent_title", "patent_abstract", "patent_date"],
        "o": {"size": limit, "pad_patent_id": false, "exclude_withdrawn": true},
        "q": {"_and": [
            {"_text_phrase": {"patent_title": query, "patent_abstract": query}},
            {
                "_gte": {"patent_date": format!("{SEARCH_FROM_YEAR}-01-01")},
                "_lte": {"patent_date": format!("{to_year}-12-31")}
            }
        ]},
        "s": [{"patent_id": "asc"}]
    })
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    patents: Vec<PatentHit>,
}

#[derive(Debug, Deserialize)]
struct PatentHit {
    patent_id: String,
    #[serde(default)]
    patent_title: Option<String>,
}

/// Patent ids of a PatentsView search response.
pub fn parse_search_response(body: &str) -> Result<Vec<String>, ExtractError> {
    let response: SearchResponse = serde_json::from_str(body)
        .map_err(|e| ExtractError::Registry(format!("unexpected search response: {e}")))?;
    Ok(response
        .patents
        .into_iter()
        .map(|p| {
            debug!("Found {}: {}", p.patent_id, p.patent_title.as_deref().unwrap_or(""));
            p.patent_id
        })
        .collect())
}

/// First PDF link to the Google patent image store in `html`.
pub fn find_pdf_link(html: &str) -> Option<String> {
    PDF_LINK_RE.find(html).map(|m| {
        let link = m.as_str();
        if link.starts_with("//") {
            format!("https:{link}")
        } else {
            link.to_string()
        }
    })
}

/// [`PatentRegistry`] over PatentsView, USPTO, and Google Patents.
pub struct PatentsViewRegistry {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl std::fmt::Debug for PatentsViewRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatentsViewRegistry")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"***")
            .finish()
    }
}

impl PatentsViewRegistry {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ExtractError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(ExtractError::RegistryKeyMissing);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ExtractError::Registry(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            endpoint: PATENTSVIEW_ENDPOINT.to_string(),
        })
    }

    /// Search against a different PatentsView-compatible endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn fetch_from_uspto(&self, patent_id: &str, out: &Path) -> Result<bool, ExtractError> {
        let url = format!("{USPTO_PDF_URL}{patent_id}");
        info!("Downloading {} from USPTO", patent_id);

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("USPTO download of {} failed: {}", patent_id, e);
                return Ok(false);
            }
        };

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !response.status().is_success() || !content_type.starts_with("application/pdf") {
            warn!(
                "USPTO has no PDF for {} (status={}, content-type={})",
                patent_id,
                response.status(),
                content_type
            );
            return Ok(false);
        }

        match response.bytes().await {
            Ok(bytes) => {
                write_atomic(out, &bytes).await?;
                info!("Saved {} (USPTO)", out.display());
                Ok(true)
            }
            Err(e) => {
                warn!("USPTO download of {} failed: {}", patent_id, e);
                Ok(false)
            }
        }
    }

    async fn fetch_from_google(&self, patent_id: &str, out: &Path) -> Result<bool, ExtractError> {
        let page_url = format!("{GOOGLE_PATENTS_URL}{}/en", normalize_patent_id(patent_id));
        info!("Looking up {} on Google Patents", patent_id);

        let html = match self.get_text(&page_url).await {
            Ok(html) => html,
            Err(e) => {
                warn!("Google Patents page for {} unavailable: {}", patent_id, e);
                return Ok(false);
            }
        };
        let Some(link) = find_pdf_link(&html) else {
            warn!("No PDF link on the Google Patents page of {}", patent_id);
            return Ok(false);
        };
        debug!("PDF link for {}: {}", patent_id, link);

        let response = match self
            .client
            .get(&link)
            .header(USER_AGENT, BROWSER_UA)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Google PDF download of {} failed: {}", patent_id, e);
                return Ok(false);
            }
        };
        match response.bytes().await {
            Ok(bytes) => {
                write_atomic(out, &bytes).await?;
                info!("Saved {} (Google Patents)", out.display());
                Ok(true)
            }
            Err(e) => {
                warn!("Google PDF download of {} failed: {}", patent_id, e);
                Ok(false)
            }
        }
    }

    async fn get_text(&self, url: &str) -> Result<String, reqwest::Error> {
        self.client
            .get(url)
            .header(USER_AGENT, BROWSER_UA)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl PatentRegistry for PatentsViewRegistry {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, ExtractError> {
        let year = chrono::Utc::now().year();
        let body = serde_json::to_vec(&search_body(query, limit, year))?;
        info!("Searching patents: '{}' (limit {})", query, limit);

        let response = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .header("X-Api-Key", &self.api_key)
            .timeout(Duration::from_secs(15))
            .body(body)
            .send()
            .await
            .map_err(|e| ExtractError::Registry(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExtractError::Registry(e.to_string()))?;
        if !status.is_success() {
            warn!("Patent search returned HTTP {}: {}", status, text);
            return Ok(Vec::new());
        }

        let ids = parse_search_response(&text)?;
        info!("Patent search found {} patents", ids.len());
        Ok(ids)
    }

    async fn fetch(&self, patent_id: &str, destination: &Path) -> Result<bool, ExtractError> {
        let out = pdf_path(destination, patent_id);
        if out.exists() {
            info!("{} already exists, skipping download", out.display());
            return Ok(true);
        }
        if self.fetch_from_uspto(patent_id, &out).await? {
            return Ok(true);
        }
        self.fetch_from_google(patent_id, &out).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_normalized_to_uspto_form() {
        assert_eq!(normalize_patent_id("11234567"), "US11234567");
        assert_eq!(normalize_patent_id("us 11,234,567"), "US11234567");
        assert_eq!(normalize_patent_id("US11234567B2"), "US11234567B2");
    }

    #[test]
    fn search_body_shape() {
        let body = search_body("protein binding", 7, 2026);
        assert_eq!(body["o"]["size"], 7);
        assert_eq!(body["o"]["exclude_withdrawn"], true);
        let and = body["q"]["_and"].as_array().unwrap();
        assert_eq!(and[0]["_text_phrase"]["patent_abstract"], "protein binding");
        assert_eq!(and[1]["_gte"]["patent_date"], "2000-01-01");
        assert_eq!(and[1]["_lte"]["patent_date"], "2026-12-31");
    }

    #[test]
    fn parses_search_response() {
        let body = r#"{"error": false, "count": 2, "patents": [
            {"patent_id": "11000001", "patent_title": "Kinase inhibitors"},
            {"patent_id": "11000002"}
        ]}"#;
        assert_eq!(parse_search_response(body).unwrap(), vec!["11000001", "11000002"]);
        assert!(parse_search_response(r#"{"count": 0}"#).unwrap().is_empty());
        assert!(parse_search_response("<html>").is_err());
    }

    #[test]
    fn finds_google_pdf_link() {
        let html = r#"<meta name="citation_pdf_url" content="https://patentimages.storage.googleapis.com/ab/cd/US11234567.pdf">
            <a href="//patentimages.storage.googleapis.com/x/US2.pdf">Download PDF</a>"#;
        assert_eq!(
            find_pdf_link(html).as_deref(),
            Some("https://patentimages.storage.googleapis.com/ab/cd/US11234567.pdf")
        );
        let relative = r#"<a href="//patentimages.storage.googleapis.com/x/US2.pdf">"#;
        assert_eq!(
            find_pdf_link(relative).as_deref(),
            Some("https://patentimages.storage.googleapis.com/x/US2.pdf")
        );
        assert!(find_pdf_link("<a href=\"/other.pdf\">").is_none());
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(matches!(
            PatentsViewRegistry::new(""),
            Err(ExtractError::RegistryKeyMissing)
        ));
    }

    #[tokio::test]
    async fn existing_pdf_counts_as_fetched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("US7.pdf"), b"%PDF").unwrap();
        let registry = PatentsViewRegistry::new("key").unwrap();
        assert!(registry.fetch("7", dir.path()).await.unwrap());
    }
}
