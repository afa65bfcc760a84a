use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use racefeed_core::{RawSourceRecord, SourceName};
use racefeed_storage::HttpFetcher;
use scraper::{Html, Selector};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    text_or_none, AdapterContext, AdapterError, Crawlability, FetchFilter, PageCursor,
    SourceAdapter, SourcePage,
};

/// Registration marker separating title/date from the rest of a calendar row.
const OPEN_MARKER: &str = "OPEN";
const NOTE_MARKERS: &[&str] = &["cost is usually", "how to use"];

static DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{2}/\d{2}/\d{4}").expect("valid regex"));
static PARENS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\([^)]*\)").expect("valid regex"));
static PROMO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\d+% Off|Points\s+Rewards).*$|\(Draft Legal\)").expect("valid regex")
});
static MEASURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\d+\s*(?:yd|yard|m|mi|mile|k|km)s?\b").expect("valid regex")
});
static LEG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:swim|run|bike|pool)\b[,\s]*").expect("valid regex"));
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));
static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static STATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2}$").expect("valid regex"));

/// Keyword to distance name; longer keywords first so they are consumed before their prefixes.
static DISTANCE_RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        ("Super Sprint", "Super Sprint"),
        ("Sprint", "Sprint"),
        ("International", "Olympic"),
        ("Olympic", "Olympic"),
        ("70.3", "70.3"),
        ("Half", "Half"),
        ("Full", "Full"),
        ("Ironman", "Ironman"),
        ("Iron", "Ironman"),
    ]
    .into_iter()
    .map(|(keyword, name)| {
        let pattern = format!(r"(?i)\b{}\b", regex::escape(keyword));
        (Regex::new(&pattern).expect("valid regex"), name)
    })
    .collect()
});

#[derive(Debug, Clone)]
pub struct HtmlCalendarConfig {
    pub source_id: String,
    pub provenance: String,
    pub url: String,
    pub season_year: i32,
    pub default_state: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HtmlCalendarAdapter {
    config: HtmlCalendarConfig,
}

/// One calendar row split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEntry {
    pub title: String,
    pub date: Option<String>,
    pub address: String,
    pub state: Option<String>,
    pub distances: Vec<String>,
}

/// Splits a row's flattened text at the registration marker; `None` when there is no marker.
pub fn parse_entry_text(text: &str) -> Option<CalendarEntry> {
    let (head, tail) = text.split_once(OPEN_MARKER)?;

    let date = DATE_RE.find(head).map(|m| m.as_str().to_string());
    let title = match &date {
        Some(date) => head.replacen(date.as_str(), "", 1),
        None => head.to_string(),
    };
    let title = PARENS_RE.replace_all(&title, "");
    let title = SPACES_RE.replace_all(title.trim(), " ").into_owned();

    let mut rest = PROMO_RE.replace_all(tail, "").into_owned();
    let mut distances: Vec<String> = Vec::new();
    for (re, name) in DISTANCE_RULES.iter() {
        if re.is_match(&rest) {
            if !distances.iter().any(|d| d == name) {
                distances.push((*name).to_string());
            }
            rest = re.replace_all(&rest, "").into_owned();
        }
    }
    let rest = MEASURE_RE.replace_all(&rest, "");
    let rest = LEG_RE.replace_all(&rest, "");
    let rest = NUMBER_RE.replace_all(&rest, "");

    let mut parts: Vec<String> = rest
        .split(',')
        .map(|p| SPACES_RE.replace_all(p.trim(), " ").trim_matches(['.', '+', ' ']).to_string())
        .filter(|p| !p.is_empty())
        .collect();
    let state = if parts.last().is_some_and(|last| STATE_RE.is_match(last)) {
        parts.pop()
    } else {
        None
    };
    parts.retain(|p| p.chars().count() > 2);

    Some(CalendarEntry {
        title,
        date,
        address: parts.join(", "),
        state,
        distances,
    })
}

/// Stable identifier for a calendar entry, derived from its title.
pub fn title_identifier(title: &str) -> String {
    let digest = Sha256::digest(title.trim().to_lowercase().as_bytes());
    hex::encode(digest)[..16].to_string()
}

impl HtmlCalendarAdapter {
    pub fn new(config: HtmlCalendarConfig) -> Self {
        Self { config }
    }

    fn is_candidate_row(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        let season = self.config.season_year.to_string();
        let previous = (self.config.season_year - 1).to_string();
        !text.is_empty()
            && text.contains(&season)
            && !text.contains(&previous)
            && text.matches(OPEN_MARKER).count() == 1
            && !NOTE_MARKERS.iter().any(|note| lower.contains(note))
    }

    pub fn parse_document(
        &self,
        html: &str,
        ctx: &AdapterContext,
    ) -> Result<(Vec<RawSourceRecord>, usize), AdapterError> {
        let document = Html::parse_document(html);
        let selector =
            Selector::parse("tr, li, div").map_err(|e| AdapterError::Message(e.to_string()))?;

        let mut seen_titles = HashSet::new();
        let mut records = Vec::new();
        let mut skipped = 0usize;

        for element in document.select(&selector) {
            let text = element.text().collect::<Vec<_>>().join(" ");
            let text = SPACES_RE.replace_all(text.trim(), " ");
            if !self.is_candidate_row(&text) {
                continue;
            }
            let Some(entry) = parse_entry_text(&text) else {
                continue;
            };
            let Some(title) = text_or_none(&entry.title) else {
                skipped += 1;
                warn!(source_id = %self.config.source_id, row = %text, "calendar row without title skipped");
                continue;
            };
            if !seen_titles.insert(title.to_lowercase()) {
                debug!(source_id = %self.config.source_id, title = %title, "duplicate calendar row ignored");
                continue;
            }

            let mut fields = JsonMap::new();
            fields.insert("title".into(), JsonValue::String(title.clone()));
            if let Some(date) = entry.date {
                fields.insert("date".into(), JsonValue::String(date));
            }
            fields.insert("address".into(), JsonValue::String(entry.address));
            fields.insert(
                "state".into(),
                JsonValue::String(entry.state.unwrap_or_else(|| self.config.default_state.clone())),
            );
            fields.insert("country".into(), json!("USA"));
            fields.insert("distances".into(), json!(entry.distances));
            fields.insert("type_hint".into(), json!("triathlon"));
            fields.insert("source_url".into(), JsonValue::String(self.config.url.clone()));

            records.push(RawSourceRecord::new(
                SourceName::HtmlScrape,
                title_identifier(&title),
                self.config.provenance.clone(),
                ctx.fetched_at,
                fields,
            ));
        }
        Ok((records, skipped))
    }
}

#[async_trait]
impl SourceAdapter for HtmlCalendarAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn source(&self) -> SourceName {
        SourceName::HtmlScrape
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::PublicHtml
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        _filter: &FetchFilter,
        _cursor: PageCursor,
    ) -> Result<SourcePage, AdapterError> {
        let response = http
            .fetch_bytes(
                ctx.run_id,
                &self.config.source_id,
                &self.config.url,
                &[],
                Some(self.config.timeout),
            )
            .await
            .map_err(|e| AdapterError::from_fetch(&self.config.source_id, e))?;
        let (records, skipped) = self.parse_document(&response.text(), ctx)?;
        Ok(SourcePage {
            records,
            skipped,
            next: None,
        })
    }
}
