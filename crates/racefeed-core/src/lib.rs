//! Core domain model for race event ingestion.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "racefeed-core";

/// External source a raw record came from. Each source owns its own id namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceName {
    RaceApi,
    SpreadsheetImport,
    HtmlScrape,
}

impl SourceName {
    /// Prefix used when deriving canonical document ids.
    pub fn id_namespace(self) -> &'static str {
        match self {
            SourceName::RaceApi => "runsignup",
            SourceName::SpreadsheetImport => "ultrasignup",
            SourceName::HtmlScrape => "tricoach",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceName::RaceApi => "race_api",
            SourceName::SpreadsheetImport => "spreadsheet_import",
            SourceName::HtmlScrape => "html_scrape",
        }
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source-native payload handed from an adapter to the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSourceRecord {
    pub source: SourceName,
    pub external_id: String,
    /// Human-facing provenance label persisted as `source` on the canonical event.
    pub provenance: String,
    pub fetched_at: DateTime<Utc>,
    pub fields: JsonMap<String, JsonValue>,
}

impl RawSourceRecord {
    pub fn new(
        source: SourceName,
        external_id: impl Into<String>,
        provenance: impl Into<String>,
        fetched_at: DateTime<Utc>,
        fields: JsonMap<String, JsonValue>,
    ) -> Self {
        Self {
            source,
            external_id: external_id.into(),
            provenance: provenance.into(),
            fetched_at,
            fields,
        }
    }

    /// Canonical id for this record, `None` when the external id is blank.
    pub fn canonical_id(&self) -> Option<String> {
        canonical_event_id(self.source, &self.external_id)
    }
}

/// Deterministic document id: `<namespace>_<external id>`.
///
/// Path separators and whitespace are not valid in document ids. They are percent-encoded
/// (along with `%` itself), so distinct external ids never share a document id.
pub fn canonical_event_id(source: SourceName, external_id: &str) -> Option<String> {
    let trimmed = external_id.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut encoded = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        if matches!(c, '/' | '\\' | '%') || c.is_whitespace() {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                encoded.push_str(&format!("%{byte:02X}"));
            }
        } else {
            encoded.push(c);
        }
    }
    Some(format!("{}_{}", source.id_namespace(), encoded))
}

/// Free-text location pieces used for coordinate resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationQuery {
    pub free_text_address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl LocationQuery {
    pub fn is_empty(&self) -> bool {
        self.parts().is_empty()
    }

    fn parts(&self) -> Vec<&str> {
        [
            &self.free_text_address,
            &self.city,
            &self.state,
            &self.country,
        ]
        .into_iter()
        .filter_map(non_empty)
        .collect()
    }

    /// All non-empty fields joined with `", "`.
    pub fn full_text(&self) -> String {
        self.parts().join(", ")
    }

    /// Reduced `city, state` query, `None` when both are empty.
    pub fn city_state(&self) -> Option<String> {
        let parts = [&self.city, &self.state]
            .into_iter()
            .filter_map(non_empty)
            .collect::<Vec<_>>();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// `(0, 0)` and non-finite pairs mean "no coordinates".
    pub fn is_unset(&self) -> bool {
        !self.latitude.is_finite()
            || !self.longitude.is_finite()
            || (self.latitude == 0.0 && self.longitude == 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Road,
    Trail,
    Ultra,
    Track,
    Triathlon,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Road => "road",
            EventType::Trail => "trail",
            EventType::Ultra => "ultra",
            EventType::Track => "track",
            EventType::Triathlon => "triathlon",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub event_type: EventType,
    pub distance_tags: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLocation {
    pub address: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub coordinates: Coordinates,
}

/// Persisted event document. Field names are the wire contract for listing clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalEvent {
    pub id: String,
    pub title: String,
    /// ISO-8601 calendar date (`YYYY-MM-DD`).
    pub date: String,
    pub description: String,
    pub location: EventLocation,
    pub event_type: EventType,
    pub distance_tags: BTreeSet<String>,
    pub source_url: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// Why a raw record never became a canonical event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Error)]
pub enum RejectReason {
    #[error("record has no usable external identifier")]
    MissingIdentity,
    #[error("record has no title")]
    MissingTitle,
    #[error("record has no parseable date")]
    MissingDate,
    #[error("record location could not be resolved to coordinates")]
    UnresolvableLocation,
}

impl RejectReason {
    pub const ALL: [RejectReason; 4] = [
        RejectReason::MissingIdentity,
        RejectReason::MissingTitle,
        RejectReason::MissingDate,
        RejectReason::UnresolvableLocation,
    ];
}
