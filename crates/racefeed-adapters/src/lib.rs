//! Source adapter contracts, lazy page traversal and the per-source adapters.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use racefeed_core::{RawSourceRecord, SourceName};
use racefeed_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod html_calendar;
pub mod race_api;
pub mod spreadsheet;

pub use html_calendar::{HtmlCalendarAdapter, HtmlCalendarConfig};
pub use race_api::{RaceApiAdapter, RaceApiConfig};
pub use spreadsheet::{SpreadsheetAdapter, SpreadsheetConfig};

pub const CRATE_NAME: &str = "racefeed-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crawlability {
    Api,
    PublicHtml,
    FileExport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

/// Date window a traversal is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFilter {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl FetchFilter {
    pub fn upcoming(today: NaiveDate, lookahead_days: u64) -> Self {
        Self {
            start_date: today,
            end_date: today
                .checked_add_days(Days::new(lookahead_days))
                .unwrap_or(NaiveDate::MAX),
        }
    }
}

/// Position of the next page: `segment` indexes sub-queries (e.g. event types).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub segment: usize,
    pub page: u32,
}

impl Default for PageCursor {
    fn default() -> Self {
        Self {
            segment: 0,
            page: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourcePage {
    pub records: Vec<RawSourceRecord>,
    /// Items dropped for missing identifier or title.
    pub skipped: usize,
    pub next: Option<PageCursor>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("authentication rejected by {source_id}: {detail}")]
    Auth { source_id: String, detail: String },
    #[error("transport failure: {0}")]
    Transport(FetchError),
    #[error("malformed source payload: {0}")]
    Parse(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn from_fetch(source_id: &str, err: FetchError) -> Self {
        if err.is_auth() {
            AdapterError::Auth {
                source_id: source_id.to_string(),
                detail: err.to_string(),
            }
        } else {
            AdapterError::Transport(err)
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, AdapterError::Auth { .. })
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn source(&self) -> SourceName;
    fn crawlability(&self) -> Crawlability;

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        filter: &FetchFilter,
        cursor: PageCursor,
    ) -> Result<SourcePage, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TraversalOutcome {
    InProgress,
    Exhausted,
    /// A page failed; records from earlier pages were still delivered.
    Truncated { error: String },
    AuthRejected { error: String },
}

/// Pull-based, single-use walk over every page of one adapter.
pub struct Traversal<'a> {
    adapter: &'a dyn SourceAdapter,
    http: &'a HttpFetcher,
    ctx: AdapterContext,
    filter: FetchFilter,
    page_delay: Duration,
    buffer: VecDeque<RawSourceRecord>,
    next_cursor: Option<PageCursor>,
    pages_fetched: usize,
    skipped: usize,
    outcome: TraversalOutcome,
}

/// Starts a fresh traversal; `page_delay` is slept between consecutive page fetches.
pub fn fetch_all<'a>(
    adapter: &'a dyn SourceAdapter,
    http: &'a HttpFetcher,
    ctx: AdapterContext,
    filter: FetchFilter,
    page_delay: Duration,
) -> Traversal<'a> {
    Traversal {
        adapter,
        http,
        ctx,
        filter,
        page_delay,
        buffer: VecDeque::new(),
        next_cursor: Some(PageCursor::default()),
        pages_fetched: 0,
        skipped: 0,
        outcome: TraversalOutcome::InProgress,
    }
}

impl<'a> Traversal<'a> {
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn outcome(&self) -> &TraversalOutcome {
        &self.outcome
    }

    /// Next record, `Ok(None)` once the source is exhausted or a page failed.
    ///
    /// Only authentication failures surface as `Err`; they end the traversal.
    pub async fn next(&mut self) -> Result<Option<RawSourceRecord>, AdapterError> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
            }
            let Some(cursor) = self.next_cursor.take() else {
                if self.outcome == TraversalOutcome::InProgress {
                    self.outcome = TraversalOutcome::Exhausted;
                }
                return Ok(None);
            };

            if self.pages_fetched > 0 && !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }

            let source_id = self.adapter.source_id();
            match self
                .adapter
                .fetch_page(self.http, &self.ctx, &self.filter, cursor)
                .await
            {
                Ok(page) => {
                    self.pages_fetched += 1;
                    self.skipped += page.skipped;
                    debug!(
                        source_id,
                        segment = cursor.segment,
                        page = cursor.page,
                        records = page.records.len(),
                        skipped = page.skipped,
                        "fetched source page"
                    );
                    self.buffer.extend(page.records);
                    self.next_cursor = page.next;
                }
                Err(err) if err.is_auth() => {
                    warn!(source_id, error = %err, "source rejected credentials");
                    self.outcome = TraversalOutcome::AuthRejected {
                        error: err.to_string(),
                    };
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        source_id,
                        segment = cursor.segment,
                        page = cursor.page,
                        error = %err,
                        "page fetch failed; ending traversal early"
                    );
                    self.outcome = TraversalOutcome::Truncated {
                        error: err.to_string(),
                    };
                    return Ok(None);
                }
            }
        }
    }
}

fn default_race_api_url() -> String {
    "https://runsignup.com/rest/races".to_string()
}

fn default_event_types() -> Vec<String> {
    vec!["running_race".to_string(), "triathlon".to_string()]
}

fn default_results_per_page() -> u32 {
    25
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_state() -> String {
    "CA".to_string()
}

/// Kind-specific adapter settings as they appear in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSettings {
    RaceApi {
        #[serde(default = "default_race_api_url")]
        base_url: String,
        #[serde(default = "default_event_types")]
        event_types: Vec<String>,
        #[serde(default)]
        zipcode: Option<String>,
        #[serde(default)]
        radius: Option<u32>,
        #[serde(default)]
        state: Option<String>,
        #[serde(default = "default_results_per_page")]
        results_per_page: u32,
        #[serde(default)]
        lookahead_days: Option<u64>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    Spreadsheet {
        path: PathBuf,
    },
    HtmlCalendar {
        url: String,
        season_year: i32,
        #[serde(default = "default_state")]
        default_state: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

/// Builds the adapter for one configured source. Relative file paths resolve against `workspace_root`.
pub fn adapter_from_settings(
    source_id: &str,
    display_name: &str,
    settings: &AdapterSettings,
    workspace_root: &Path,
) -> Box<dyn SourceAdapter> {
    match settings {
        AdapterSettings::RaceApi {
            base_url,
            event_types,
            zipcode,
            radius,
            state,
            results_per_page,
            lookahead_days,
            timeout_secs,
        } => Box::new(RaceApiAdapter::new(RaceApiConfig {
            source_id: source_id.to_string(),
            provenance: display_name.to_string(),
            base_url: base_url.clone(),
            event_types: event_types.clone(),
            zipcode: zipcode.clone(),
            radius: *radius,
            state: state.clone(),
            results_per_page: (*results_per_page).max(1),
            lookahead_days: *lookahead_days,
            timeout: Duration::from_secs(*timeout_secs),
        })),
        AdapterSettings::Spreadsheet { path } => {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                workspace_root.join(path)
            };
            Box::new(SpreadsheetAdapter::new(SpreadsheetConfig {
                source_id: source_id.to_string(),
                provenance: display_name.to_string(),
                path,
            }))
        }
        AdapterSettings::HtmlCalendar {
            url,
            season_year,
            default_state,
            timeout_secs,
        } => Box::new(HtmlCalendarAdapter::new(HtmlCalendarConfig {
            source_id: source_id.to_string(),
            provenance: display_name.to_string(),
            url: url.clone(),
            season_year: *season_year,
            default_state: default_state.clone(),
            timeout: Duration::from_secs(*timeout_secs),
        })),
    }
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
