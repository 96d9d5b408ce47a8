//! Scrape source contracts and the fixture, JSON feed and HTML portal sources.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use seva_core::{Eligibility, RawSchemeData};
use seva_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "seva-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Fixture,
    JsonFeed,
    HtmlPortal,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait ScrapeSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    /// Latest raw scheme records published by the source.
    async fn fetch_latest(&self) -> Result<Vec<RawSchemeData>, AdapterError>;
}

/// CSS selectors locating scheme cards on a portal listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingSelectors {
    pub item: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub eligibility: String,
    pub deadline: String,
    pub link: String,
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            item: ".scheme-card".into(),
            name: ".scheme-name".into(),
            description: ".scheme-description".into(),
            category: ".scheme-category".into(),
            eligibility: ".scheme-eligibility".into(),
            deadline: ".scheme-deadline".into(),
            link: "a[href]".into(),
        }
    }
}

struct CompiledSelectors {
    item: Selector,
    name: Selector,
    description: Selector,
    category: Selector,
    eligibility: Selector,
    eligibility_items: Selector,
    deadline: Selector,
    link: Selector,
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector)
        .map_err(|e| AdapterError::Message(format!("invalid selector {selector:?}: {e}")))
}

impl CompiledSelectors {
    fn new(selectors: &ListingSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            item: compile(&selectors.item)?,
            name: compile(&selectors.name)?,
            description: compile(&selectors.description)?,
            category: compile(&selectors.category)?,
            eligibility: compile(&selectors.eligibility)?,
            eligibility_items: compile("li")?,
            deadline: compile(&selectors.deadline)?,
            link: compile(&selectors.link)?,
        })
    }
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(item: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    item.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

const DEADLINE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d %B %Y", "%d %b %Y", "%B %d, %Y", "%b %d, %Y"];

/// Rewrites a portal's human date into ISO `YYYY-MM-DD`. Unrecognized text is
/// passed through untouched so ingestion can reject it with a reason.
pub fn normalize_deadline_text(raw: &str) -> Option<String> {
    let trimmed = raw
        .trim()
        .trim_start_matches("Last date:")
        .trim_start_matches("Deadline:")
        .trim();
    if trimmed.is_empty() {
        return None;
    }
    DEADLINE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
        .or_else(|| Some(trimmed.to_string()))
}

fn eligibility_of(item: &ElementRef<'_>, sel: &CompiledSelectors) -> Option<Eligibility> {
    let node = item.select(&sel.eligibility).next()?;
    let criteria = node
        .select(&sel.eligibility_items)
        .filter_map(|li| text_or_none(li.text().collect::<String>()))
        .collect::<Vec<_>>();
    if criteria.is_empty() {
        text_or_none(node.text().collect::<String>()).map(Eligibility::Text)
    } else {
        Some(Eligibility::Structured(json!({ "criteria": criteria })))
    }
}

/// Extracts one raw record per scheme card. Links are resolved against
/// `base_url`; a card without a link is attributed to the listing page itself.
pub fn parse_scheme_listing(
    html: &str,
    base_url: &str,
    selectors: &ListingSelectors,
) -> Result<Vec<RawSchemeData>, AdapterError> {
    let sel = CompiledSelectors::new(selectors)?;
    let base = Url::parse(base_url).ok();
    let document = Html::parse_document(html);

    let mut out = Vec::new();
    for item in document.select(&sel.item) {
        let deadline = item.select(&sel.deadline).next().and_then(|node| {
            node.value()
                .attr("datetime")
                .and_then(normalize_deadline_text)
                .or_else(|| normalize_deadline_text(&node.text().collect::<String>()))
        });
        let source_url = item
            .select(&sel.link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|href| match &base {
                Some(base) => base
                    .join(href.trim())
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| href.trim().to_string()),
                None => href.trim().to_string(),
            })
            .unwrap_or_else(|| base_url.to_string());

        out.push(RawSchemeData {
            name: first_text(&item, &sel.name).unwrap_or_default(),
            description: first_text(&item, &sel.description),
            category: first_text(&item, &sel.category),
            eligibility_criteria: eligibility_of(&item, &sel),
            deadline,
            source_url,
        });
    }
    Ok(out)
}

/// Captured scrape output checked into the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub records: Vec<RawSchemeData>,
    /// Listing HTML, relative to the bundle file, parsed instead of `records`.
    #[serde(default)]
    pub raw_html_path: Option<String>,
    #[serde(default)]
    pub selectors: Option<ListingSelectors>,
    #[serde(skip)]
    pub raw_html: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let mut bundle: FixtureBundle = read_json_file(path)?;
    hydrate_raw_html(path, &mut bundle)?;
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_raw_html(bundle_path: &Path, bundle: &mut FixtureBundle) -> Result<()> {
    let Some(rel_path) = &bundle.raw_html_path else {
        return Ok(());
    };
    let raw_path = bundle_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(rel_path);
    let raw = fs::read_to_string(&raw_path)
        .with_context(|| format!("reading fixture listing {}", raw_path.display()))?;
    bundle.raw_html = Some(raw);
    Ok(())
}

impl FixtureBundle {
    pub fn to_raw_records(&self) -> Result<Vec<RawSchemeData>, AdapterError> {
        match &self.raw_html {
            Some(html) => parse_scheme_listing(
                html,
                &self.captured_from_url,
                &self.selectors.clone().unwrap_or_default(),
            ),
            None => Ok(self.records.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixtureSource {
    source_id: String,
    path: PathBuf,
}

impl FixtureSource {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl ScrapeSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Fixture
    }

    async fn fetch_latest(&self) -> Result<Vec<RawSchemeData>, AdapterError> {
        let bundle = load_fixture_bundle(&self.path)?;
        if bundle.source_id != self.source_id {
            return Err(AdapterError::Message(format!(
                "bundle source_id={} does not match source_id={}",
                bundle.source_id, self.source_id
            )));
        }
        bundle.to_raw_records()
    }
}

/// A feed is either a bare array or an object wrapping one.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedPayload {
    Bare(Vec<RawSchemeData>),
    Wrapped { schemes: Vec<RawSchemeData> },
}

pub fn parse_feed(bytes: &[u8]) -> Result<Vec<RawSchemeData>, AdapterError> {
    let payload: FeedPayload = serde_json::from_slice(bytes)
        .map_err(|e| AdapterError::Message(format!("invalid scheme feed: {e}")))?;
    Ok(match payload {
        FeedPayload::Bare(records) => records,
        FeedPayload::Wrapped { schemes } => schemes,
    })
}

#[derive(Debug, Clone)]
pub struct JsonFeedSource {
    source_id: String,
    url: String,
    http: Arc<HttpFetcher>,
}

impl JsonFeedSource {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl ScrapeSource for JsonFeedSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::JsonFeed
    }

    async fn fetch_latest(&self) -> Result<Vec<RawSchemeData>, AdapterError> {
        let resp = self.http.fetch_bytes(&self.source_id, &self.url).await?;
        parse_feed(&resp.body)
    }
}

#[derive(Debug, Clone)]
pub struct HtmlPortalSource {
    source_id: String,
    url: String,
    selectors: ListingSelectors,
    http: Arc<HttpFetcher>,
}

impl HtmlPortalSource {
    pub fn new(
        source_id: impl Into<String>,
        url: impl Into<String>,
        selectors: ListingSelectors,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            selectors,
            http,
        }
    }
}

#[async_trait]
impl ScrapeSource for HtmlPortalSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::HtmlPortal
    }

    async fn fetch_latest(&self) -> Result<Vec<RawSchemeData>, AdapterError> {
        let resp = self.http.fetch_bytes(&self.source_id, &self.url).await?;
        let html = String::from_utf8_lossy(&resp.body);
        let records = parse_scheme_listing(&html, &resp.final_url, &self.selectors)?;
        tracing::debug!(source_id = %self.source_id, records = records.len(), "parsed portal listing");
        Ok(records)
    }
}
