use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use racefeed_core::{RawSourceRecord, SourceName};
use racefeed_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::warn;

use crate::{
    text_or_none, AdapterContext, AdapterError, Crawlability, FetchFilter, PageCursor,
    SourceAdapter, SourcePage,
};

#[derive(Debug, Clone)]
pub struct RaceApiConfig {
    pub source_id: String,
    pub provenance: String,
    pub base_url: String,
    /// Each event type is traversed as its own paginated segment.
    pub event_types: Vec<String>,
    pub zipcode: Option<String>,
    pub radius: Option<u32>,
    pub state: Option<String>,
    pub results_per_page: u32,
    pub lookahead_days: Option<u64>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RaceApiAdapter {
    config: RaceApiConfig,
}

#[derive(Debug, Deserialize)]
struct RacesEnvelope {
    #[serde(default)]
    races: Vec<RaceWrapper>,
}

#[derive(Debug, Deserialize)]
struct RaceWrapper {
    #[serde(default)]
    race: Option<JsonMap<String, JsonValue>>,
}

impl RaceApiAdapter {
    pub fn new(config: RaceApiConfig) -> Self {
        Self { config }
    }

    fn end_date(&self, filter: &FetchFilter) -> NaiveDate {
        match self.config.lookahead_days {
            Some(days) => filter
                .start_date
                .checked_add_days(Days::new(days))
                .unwrap_or(filter.end_date),
            None => filter.end_date,
        }
    }

    fn query_for(&self, filter: &FetchFilter, event_type: &str, page: u32) -> Vec<(String, String)> {
        let mut query = vec![
            ("format".to_string(), "json".to_string()),
            ("event_type".to_string(), event_type.to_string()),
            (
                "start_date".to_string(),
                filter.start_date.format("%Y-%m-%d").to_string(),
            ),
            (
                "end_date".to_string(),
                self.end_date(filter).format("%Y-%m-%d").to_string(),
            ),
        ];
        if let Some(zipcode) = &self.config.zipcode {
            query.push(("zipcode".to_string(), zipcode.clone()));
        }
        if let Some(radius) = self.config.radius {
            query.push(("radius".to_string(), radius.to_string()));
        }
        if let Some(state) = &self.config.state {
            query.push(("state".to_string(), state.clone()));
        }
        query.push(("page".to_string(), page.to_string()));
        query.push((
            "results_per_page".to_string(),
            self.config.results_per_page.to_string(),
        ));
        query
    }

    fn next_cursor(&self, cursor: PageCursor, item_count: usize) -> Option<PageCursor> {
        let short_page = item_count < self.config.results_per_page as usize;
        if !short_page {
            return Some(PageCursor {
                segment: cursor.segment,
                page: cursor.page + 1,
            });
        }
        let segment = cursor.segment + 1;
        (segment < self.config.event_types.len()).then_some(PageCursor { segment, page: 1 })
    }

    /// Converts one page body into records; items without `race_id` or `name` are counted as skipped.
    pub fn parse_page(
        &self,
        body: &str,
        ctx: &AdapterContext,
        event_type: &str,
    ) -> Result<(Vec<RawSourceRecord>, usize, usize), AdapterError> {
        let envelope: RacesEnvelope = serde_json::from_str(body)
            .map_err(|e| AdapterError::Parse(format!("race listing: {e}")))?;
        let item_count = envelope.races.len();
        let mut records = Vec::with_capacity(item_count);
        let mut skipped = 0usize;

        for wrapper in envelope.races {
            let Some(mut race) = wrapper.race else {
                skipped += 1;
                warn!(source_id = %self.config.source_id, "race item without payload skipped");
                continue;
            };
            let race_id = race.get("race_id").and_then(identifier_text);
            let has_name = race
                .get("name")
                .and_then(JsonValue::as_str)
                .and_then(text_or_none)
                .is_some();
            let Some(race_id) = race_id.filter(|_| has_name) else {
                skipped += 1;
                warn!(
                    source_id = %self.config.source_id,
                    race_id = ?race.get("race_id"),
                    "race missing identifier or name skipped"
                );
                continue;
            };

            let missing_hint = race
                .get("event_type")
                .and_then(JsonValue::as_str)
                .and_then(text_or_none)
                .is_none();
            if missing_hint {
                race.insert(
                    "event_type".to_string(),
                    JsonValue::String(event_type.to_string()),
                );
            }

            records.push(RawSourceRecord::new(
                SourceName::RaceApi,
                race_id,
                self.config.provenance.clone(),
                ctx.fetched_at,
                race,
            ));
        }

        Ok((records, skipped, item_count))
    }
}

fn identifier_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl SourceAdapter for RaceApiAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn source(&self) -> SourceName {
        SourceName::RaceApi
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Api
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        filter: &FetchFilter,
        cursor: PageCursor,
    ) -> Result<SourcePage, AdapterError> {
        let Some(event_type) = self.config.event_types.get(cursor.segment) else {
            return Ok(SourcePage::default());
        };
        let query = self.query_for(filter, event_type, cursor.page);
        let response = http
            .fetch_bytes(
                ctx.run_id,
                &self.config.source_id,
                &self.config.base_url,
                &query,
                Some(self.config.timeout),
            )
            .await
            .map_err(|e| AdapterError::from_fetch(&self.config.source_id, e))?;

        let (records, skipped, item_count) = self.parse_page(&response.text(), ctx, event_type)?;
        Ok(SourcePage {
            records,
            skipped,
            next: self.next_cursor(cursor, item_count),
        })
    }
}
