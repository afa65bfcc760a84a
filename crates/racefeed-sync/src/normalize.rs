//! Raw record to canonical event mapping, with per-source extractor rule tables.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use racefeed_core::{
    CanonicalEvent, Coordinates, EventLocation, LocationQuery, RawSourceRecord, RejectReason,
    SourceName,
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use crate::classify::TextClassifier;
use crate::resolver::{CoordinateResolver, GeocodeError};

type Fields = JsonMap<String, JsonValue>;

/// One way of reading a field: a path into the raw payload plus a normalizer.
pub struct ExtractorRule<T> {
    pub path: &'static [&'static str],
    pub normalize: fn(&JsonValue) -> Option<T>,
}

impl<T> ExtractorRule<T> {
    pub fn apply(&self, fields: &Fields) -> Option<T> {
        let (first, rest) = self.path.split_first()?;
        let mut value = fields.get(*first)?;
        for segment in rest {
            value = value.get(*segment)?;
        }
        (self.normalize)(value)
    }
}

/// First rule that yields a value wins.
pub fn extract_first<T>(fields: &Fields, rules: &[ExtractorRule<T>]) -> Option<T> {
    rules.iter().find_map(|rule| rule.apply(fields))
}

pub fn text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn coordinate(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Arrays of strings/numbers, or a single comma-separated string.
pub fn string_list(value: &JsonValue) -> Option<Vec<String>> {
    let items: Vec<String> = match value {
        JsonValue::Array(items) => items.iter().filter_map(text).collect(),
        JsonValue::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        JsonValue::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    };
    Some(items).filter(|items| !items.is_empty())
}

/// `events: [{ "distance": ... }]` as listed by the race API.
pub fn event_distances(value: &JsonValue) -> Option<Vec<String>> {
    let items: Vec<String> = value
        .as_array()?
        .iter()
        .filter_map(|event| event.get("distance").and_then(text))
        .collect();
    Some(items).filter(|items| !items.is_empty())
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%B %d, %Y", "%b %d, %Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

pub fn parse_event_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    if let Some(dt) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    {
        return Some(dt.date());
    }
    // `%Y` accepts two-digit years, so short slash dates are read as `%y` first.
    let short_year = raw
        .rsplit('/')
        .next()
        .is_some_and(|year| year.len() == 2 && raw.contains('/'));
    if short_year {
        return NaiveDate::parse_from_str(raw, "%m/%d/%y").ok();
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

pub fn event_date(value: &JsonValue) -> Option<NaiveDate> {
    value.as_str().and_then(parse_event_date)
}

/// Where each canonical field lives in one source's raw payload.
pub struct SourceFieldMap {
    pub title: &'static [ExtractorRule<String>],
    pub date: &'static [ExtractorRule<NaiveDate>],
    pub description: &'static [ExtractorRule<String>],
    pub source_url: &'static [ExtractorRule<String>],
    pub type_hint: &'static [ExtractorRule<String>],
    pub distances: &'static [ExtractorRule<Vec<String>>],
    pub latitude: &'static [ExtractorRule<f64>],
    pub longitude: &'static [ExtractorRule<f64>],
    pub location: fn(&Fields) -> LocationQuery,
}

static RACE_API_FIELDS: SourceFieldMap = SourceFieldMap {
    title: &[ExtractorRule { path: &["name"], normalize: text }],
    date: &[
        ExtractorRule { path: &["next_date"], normalize: event_date },
        ExtractorRule { path: &["start_date"], normalize: event_date },
        ExtractorRule { path: &["last_date"], normalize: event_date },
    ],
    description: &[ExtractorRule { path: &["description"], normalize: text }],
    source_url: &[ExtractorRule { path: &["url"], normalize: text }],
    type_hint: &[ExtractorRule { path: &["event_type"], normalize: text }],
    distances: &[
        ExtractorRule { path: &["distances"], normalize: string_list },
        ExtractorRule { path: &["events"], normalize: event_distances },
    ],
    latitude: &[ExtractorRule { path: &["address", "latitude"], normalize: coordinate }],
    longitude: &[ExtractorRule { path: &["address", "longitude"], normalize: coordinate }],
    location: race_api_location,
};

static SPREADSHEET_FIELDS: SourceFieldMap = SourceFieldMap {
    title: &[ExtractorRule { path: &["Event Name"], normalize: text }],
    date: &[ExtractorRule { path: &["Date"], normalize: event_date }],
    description: &[ExtractorRule { path: &["Description"], normalize: text }],
    source_url: &[ExtractorRule { path: &["sourceUrl"], normalize: text }],
    type_hint: &[],
    distances: &[ExtractorRule { path: &["Distances"], normalize: string_list }],
    latitude: &[],
    longitude: &[],
    location: spreadsheet_location,
};

static HTML_CALENDAR_FIELDS: SourceFieldMap = SourceFieldMap {
    title: &[ExtractorRule { path: &["title"], normalize: text }],
    date: &[ExtractorRule { path: &["date"], normalize: event_date }],
    description: &[],
    source_url: &[ExtractorRule { path: &["source_url"], normalize: text }],
    type_hint: &[ExtractorRule { path: &["type_hint"], normalize: text }],
    distances: &[ExtractorRule { path: &["distances"], normalize: string_list }],
    latitude: &[],
    longitude: &[],
    location: html_calendar_location,
};

pub fn field_map_for(source: SourceName) -> &'static SourceFieldMap {
    match source {
        SourceName::RaceApi => &RACE_API_FIELDS,
        SourceName::SpreadsheetImport => &SPREADSHEET_FIELDS,
        SourceName::HtmlScrape => &HTML_CALENDAR_FIELDS,
    }
}

fn field_text(fields: &Fields, path: &[&str]) -> Option<String> {
    let (first, rest) = path.split_first()?;
    let mut value = fields.get(*first)?;
    for segment in rest {
        value = value.get(*segment)?;
    }
    text(value)
}

/// Sources without a country field are US listings; the default is only added next to real location data.
fn with_default_country(mut query: LocationQuery) -> LocationQuery {
    if query.country.is_none() && !query.is_empty() {
        query.country = Some("USA".to_string());
    }
    query
}

/// `address_text` of the form `street\nCity, ST zip` wins over the structured address.
fn race_api_location(fields: &Fields) -> LocationQuery {
    with_default_country(race_api_address(fields))
}

fn race_api_address(fields: &Fields) -> LocationQuery {
    let city = field_text(fields, &["address", "city"]);
    let state = field_text(fields, &["address", "state"]);
    let country = None;

    let Some(address_text) = field_text(fields, &["address_text"]) else {
        return LocationQuery {
            free_text_address: field_text(fields, &["address", "street"]),
            city,
            state,
            country,
        };
    };

    let lines: Vec<&str> = address_text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if let (Some(street), Some(last), true) = (lines.first(), lines.last(), lines.len() >= 2) {
        let parts: Vec<&str> = last.split(',').map(str::trim).collect();
        if parts.len() >= 2 {
            return LocationQuery {
                free_text_address: Some(street.to_string()),
                city: Some(parts[0].to_string()).filter(|c| !c.is_empty()),
                state: parts[1].split_whitespace().next().map(str::to_string),
                country,
            };
        }
    }

    LocationQuery {
        free_text_address: Some(address_text),
        city,
        state,
        country,
    }
}

fn spreadsheet_location(fields: &Fields) -> LocationQuery {
    with_default_country(LocationQuery {
        free_text_address: None,
        city: field_text(fields, &["City"]),
        state: field_text(fields, &["State"]),
        country: None,
    })
}

fn html_calendar_location(fields: &Fields) -> LocationQuery {
    LocationQuery {
        free_text_address: field_text(fields, &["address"]),
        city: field_text(fields, &["city"]),
        state: field_text(fields, &["state"]),
        country: field_text(fields, &["country"]),
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error(transparent)]
    Rejected(#[from] RejectReason),
    /// The record itself may be fine; the geocoder would not serve us.
    #[error("geocoder rejected credentials: {0}")]
    GeocoderAuth(String),
}

impl From<GeocodeError> for NormalizeError {
    fn from(err: GeocodeError) -> Self {
        match err {
            GeocodeError::Auth(detail) => NormalizeError::GeocoderAuth(detail),
            GeocodeError::Transient(_) | GeocodeError::Fatal(_) => {
                NormalizeError::Rejected(RejectReason::UnresolvableLocation)
            }
        }
    }
}

pub struct EventNormalizer {
    resolver: Arc<CoordinateResolver>,
    classifier: TextClassifier,
}

impl EventNormalizer {
    pub fn new(resolver: Arc<CoordinateResolver>, classifier: TextClassifier) -> Self {
        Self {
            resolver,
            classifier,
        }
    }

    pub fn resolver(&self) -> &CoordinateResolver {
        &self.resolver
    }

    /// Validation runs identity, title, date, then location, so earlier rejections never geocode.
    pub async fn normalize(
        &self,
        record: &RawSourceRecord,
    ) -> Result<CanonicalEvent, NormalizeError> {
        let map = field_map_for(record.source);
        let fields = &record.fields;

        let id = record.canonical_id().ok_or(RejectReason::MissingIdentity)?;
        let title = extract_first(fields, map.title).ok_or(RejectReason::MissingTitle)?;
        let date = extract_first(fields, map.date).ok_or(RejectReason::MissingDate)?;

        let query = (map.location)(fields);
        let source_coordinates = extract_first(fields, map.latitude)
            .zip(extract_first(fields, map.longitude))
            .map(|(lat, lon)| Coordinates::new(lat, lon))
            .filter(|c| !c.is_unset());
        let coordinates = match source_coordinates {
            Some(coordinates) => coordinates,
            None => {
                self.resolver
                    .resolve_with_hint(&query, Some(title.as_str()))
                    .await?
                    .ok_or(RejectReason::UnresolvableLocation)?
                    .coordinates
            }
        };

        let description = extract_first(fields, map.description).unwrap_or_default();
        let distances = extract_first(fields, map.distances).unwrap_or_default();
        let type_hint = extract_first(fields, map.type_hint);
        let classification =
            self.classifier
                .classify(&title, &description, &distances, type_hint.as_deref());

        debug!(%id, event_type = %classification.event_type, "normalized record");
        Ok(CanonicalEvent {
            id,
            title,
            date: date.format("%Y-%m-%d").to_string(),
            description,
            location: EventLocation {
                address: query.free_text_address.unwrap_or_default(),
                city: query.city.unwrap_or_default(),
                state: query.state.unwrap_or_default(),
                country: query.country.unwrap_or_default(),
                coordinates,
            },
            event_type: classification.event_type,
            distance_tags: classification.distance_tags,
            source_url: extract_first(fields, map.source_url).unwrap_or_default(),
            source: record.provenance.clone(),
            last_updated: None,
            created: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{GeocodeError, Gazetteer, Geocoder};
    use async_trait::async_trait;
    use chrono::Utc;
    use racefeed_core::EventType;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingGeocoder {
        calls: AtomicUsize,
        answer: Option<Coordinates>,
    }

    #[async_trait]
    impl Geocoder for CountingGeocoder {
        fn name(&self) -> &str {
            "counting"
        }

        async fn geocode(&self, _address: &str) -> Result<Option<Coordinates>, GeocodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    fn normalizer(geocoder: Arc<CountingGeocoder>) -> EventNormalizer {
        let resolver = CoordinateResolver::new(Gazetteer::northern_california(), Some(geocoder));
        EventNormalizer::new(Arc::new(resolver), TextClassifier::default())
    }

    fn record(source: SourceName, id: &str, fields: JsonValue) -> RawSourceRecord {
        let JsonValue::Object(fields) = fields else {
            panic!("fields must be an object");
        };
        RawSourceRecord::new(source, id, "Test", Utc::now(), fields)
    }

    #[test]
    fn extractor_rules_fall_through_in_order() {
        let fields = json!({ "start_date": "05/01/2026", "last_date": "2026-06-01" });
        let JsonValue::Object(fields) = fields else { unreachable!() };
        assert_eq!(
            extract_first(&fields, RACE_API_FIELDS.date),
            NaiveDate::from_ymd_opt(2026, 5, 1)
        );
        let distances = json!({ "events": [{ "distance": "5K" }, { "distance": "Half Marathon" }] });
        let JsonValue::Object(distances) = distances else { unreachable!() };
        assert_eq!(
            extract_first(&distances, RACE_API_FIELDS.distances),
            Some(vec!["5K".to_string(), "Half Marathon".to_string()])
        );
    }

    #[test]
    fn date_formats() {
        let d = NaiveDate::from_ymd_opt(2026, 4, 12);
        assert_eq!(parse_event_date("2026-04-12"), d);
        assert_eq!(parse_event_date("04/12/2026"), d);
        assert_eq!(parse_event_date("4/12/26"), d);
        assert_eq!(parse_event_date("April 12, 2026"), d);
        assert_eq!(parse_event_date("2026-04-12 07:30:00"), d);
        assert_eq!(parse_event_date("TBD"), None);
    }

    #[test]
    fn address_text_is_split_into_street_city_state() {
        let fields = json!({
            "address_text": "17600 Lake Chabot Rd\nCastro Valley, CA 94546",
            "address": { "city": "Ignored", "state": "NV" }
        });
        let JsonValue::Object(fields) = fields else { unreachable!() };
        let query = race_api_location(&fields);
        assert_eq!(query.free_text_address.as_deref(), Some("17600 Lake Chabot Rd"));
        assert_eq!(query.city.as_deref(), Some("Castro Valley"));
        assert_eq!(query.state.as_deref(), Some("CA"));
        assert_eq!(query.country.as_deref(), Some("USA"));
    }

    #[tokio::test(start_paused = true)]
    async fn lake_chabot_resolves_from_gazetteer_without_geocoding() {
        let geocoder = Arc::new(CountingGeocoder::default());
        let normalizer = normalizer(geocoder.clone());
        let raw = record(
            SourceName::RaceApi,
            "123",
            json!({
                "race_id": 123,
                "name": "Lake Chabot 10K",
                "next_date": "11/01/2026",
                "address": { "state": "CA" },
                "distances": ["10k"],
                "event_type": "running_race"
            }),
        );

        let event = normalizer.normalize(&raw).await.unwrap();
        assert_eq!(event.id, "runsignup_123");
        assert_eq!(event.event_type, EventType::Road);
        assert_eq!(event.distance_tags.len(), 1);
        assert!(event.distance_tags.contains("10k"));
        assert_eq!(event.location.coordinates, Coordinates::new(37.7275, -122.1142));
        assert_eq!(event.date, "2026-11-01");
        assert_eq!(event.location.state, "CA");
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn city_named_in_title_does_not_override_street_address() {
        let los_angeles = Coordinates::new(34.0537, -118.2428);
        let geocoder = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            answer: Some(los_angeles),
        });
        let raw = record(
            SourceName::RaceApi,
            "77",
            json!({
                "name": "Run for the Sacramento Food Bank",
                "next_date": "2026-05-02",
                "address": { "street": "200 N Spring St", "city": "Los Angeles", "state": "CA" }
            }),
        );
        let event = normalizer(geocoder.clone()).normalize(&raw).await.unwrap();
        assert_eq!(event.location.coordinates, los_angeles);
        assert_eq!(event.location.city, "Los Angeles");
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn geocoder_auth_is_not_a_record_rejection() {
        struct Locked;

        #[async_trait]
        impl Geocoder for Locked {
            fn name(&self) -> &str {
                "locked"
            }

            async fn geocode(&self, _address: &str) -> Result<Option<Coordinates>, GeocodeError> {
                Err(GeocodeError::Auth("HTTP 401".into()))
            }
        }

        let resolver =
            CoordinateResolver::new(Gazetteer::northern_california(), Some(Arc::new(Locked)));
        let normalizer = EventNormalizer::new(Arc::new(resolver), TextClassifier::default());
        let raw = record(
            SourceName::SpreadsheetImport,
            "1",
            json!({ "Event Name": "Fresno Half", "Date": "2026-02-01", "City": "Fresno", "State": "CA" }),
        );
        assert_eq!(
            normalizer.normalize(&raw).await,
            Err(NormalizeError::GeocoderAuth("HTTP 401".into()))
        );
        assert!(normalizer.resolver().auth_rejected());
    }

    #[tokio::test(start_paused = true)]
    async fn source_coordinates_skip_the_resolver() {
        let geocoder = Arc::new(CountingGeocoder::default());
        let raw = record(
            SourceName::RaceApi,
            "9",
            json!({
                "name": "Fresno Half",
                "next_date": "2026-02-01",
                "address": { "city": "Fresno", "state": "CA", "latitude": "36.7", "longitude": -119.8 }
            }),
        );
        let event = normalizer(geocoder.clone()).normalize(&raw).await.unwrap();
        assert_eq!(event.location.coordinates, Coordinates::new(36.7, -119.8));
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejections_follow_validation_order() {
        let geocoder = Arc::new(CountingGeocoder::default());
        let normalizer = normalizer(geocoder.clone());

        let no_id = record(SourceName::RaceApi, "  ", json!({ "name": "X" }));
        assert_eq!(normalizer.normalize(&no_id).await, Err(RejectReason::MissingIdentity.into()));

        let no_title = record(SourceName::RaceApi, "1", json!({ "next_date": "2026-01-01" }));
        assert_eq!(normalizer.normalize(&no_title).await, Err(RejectReason::MissingTitle.into()));

        let no_date = record(
            SourceName::RaceApi,
            "2",
            json!({ "name": "Dateless", "address": { "city": "Fresno", "state": "CA" } }),
        );
        assert_eq!(normalizer.normalize(&no_date).await, Err(RejectReason::MissingDate.into()));
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_coordinates_with_empty_location_are_unresolvable() {
        let geocoder = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            answer: Some(Coordinates::new(1.0, 1.0)),
        });
        let raw = record(
            SourceName::RaceApi,
            "55",
            json!({
                "name": "Mystery Run",
                "next_date": "2026-03-03",
                "address": { "latitude": 0, "longitude": 0 }
            }),
        );
        assert_eq!(
            normalizer(geocoder.clone()).normalize(&raw).await,
            Err(NormalizeError::Rejected(RejectReason::UnresolvableLocation))
        );
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn calendar_records_are_triathlons_with_source_distances() {
        let geocoder = Arc::new(CountingGeocoder::default());
        let raw = record(
            SourceName::HtmlScrape,
            "0123456789abcdef",
            json!({
                "title": "Folsom Lake Triathlon",
                "date": "06/14/2025",
                "address": "Granite Beach, Folsom Lake",
                "state": "CA",
                "country": "USA",
                "distances": ["Sprint", "Olympic"],
                "type_hint": "triathlon",
                "source_url": "https://calendar.example/nor-cal"
            }),
        );
        let event = normalizer(geocoder).normalize(&raw).await.unwrap();
        assert_eq!(event.id, "tricoach_0123456789abcdef");
        assert_eq!(event.event_type, EventType::Triathlon);
        assert_eq!(event.location.coordinates, Coordinates::new(38.7520, -121.1401));
        assert!(event.distance_tags.contains("Sprint"));
        assert_eq!(event.source_url, "https://calendar.example/nor-cal");
    }
}
