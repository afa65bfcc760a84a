use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use racefeed_core::{RawSourceRecord, SourceName};
use racefeed_storage::HttpFetcher;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::warn;

use crate::{
    text_or_none, AdapterContext, AdapterError, Crawlability, FetchFilter, PageCursor,
    SourceAdapter, SourcePage,
};

pub const TITLE_COLUMN: &str = "Event Name";

/// Columns tried in order for the row's primary identifier.
pub const ID_COLUMNS: &[&str] = &["Event ID", "id", "sourceUrl"];

#[derive(Debug, Clone)]
pub struct SpreadsheetConfig {
    pub source_id: String,
    pub provenance: String,
    pub path: PathBuf,
}

/// CSV export read as a single page.
#[derive(Debug, Clone)]
pub struct SpreadsheetAdapter {
    config: SpreadsheetConfig,
}

impl SpreadsheetAdapter {
    pub fn new(config: SpreadsheetConfig) -> Self {
        Self { config }
    }

    pub fn parse_rows(
        &self,
        bytes: &[u8],
        ctx: &AdapterContext,
    ) -> Result<(Vec<RawSourceRecord>, usize), AdapterError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);
        let headers = reader
            .headers()
            .map_err(|e| AdapterError::Parse(format!("spreadsheet header: {e}")))?
            .clone();

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for (line, row) in reader.records().enumerate() {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    skipped += 1;
                    warn!(source_id = %self.config.source_id, line, error = %err, "unreadable spreadsheet row skipped");
                    continue;
                }
            };

            let mut fields = JsonMap::new();
            for (header, value) in headers.iter().zip(row.iter()) {
                if let Some(value) = text_or_none(value) {
                    fields.insert(header.to_string(), JsonValue::String(value));
                }
            }

            let external_id = ID_COLUMNS
                .iter()
                .find_map(|column| fields.get(*column).and_then(JsonValue::as_str))
                .map(str::to_string);
            let has_title = fields.contains_key(TITLE_COLUMN);
            let Some(external_id) = external_id.filter(|_| has_title) else {
                skipped += 1;
                warn!(source_id = %self.config.source_id, line, "spreadsheet row missing identifier or event name skipped");
                continue;
            };

            records.push(RawSourceRecord::new(
                SourceName::SpreadsheetImport,
                external_id,
                self.config.provenance.clone(),
                ctx.fetched_at,
                fields,
            ));
        }
        Ok((records, skipped))
    }
}

#[async_trait]
impl SourceAdapter for SpreadsheetAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn source(&self) -> SourceName {
        SourceName::SpreadsheetImport
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::FileExport
    }

    async fn fetch_page(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
        _filter: &FetchFilter,
        _cursor: PageCursor,
    ) -> Result<SourcePage, AdapterError> {
        let bytes = tokio::fs::read(&self.config.path)
            .await
            .with_context(|| format!("reading spreadsheet export {}", self.config.path.display()))?;
        let (records, skipped) = self.parse_rows(&bytes, ctx)?;
        Ok(SourcePage {
            records,
            skipped,
            next: None,
        })
    }
}
