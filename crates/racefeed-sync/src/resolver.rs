//! Coordinate resolution: static gazetteer first, then a paced, retried external geocoder.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use racefeed_core::{Coordinates, LocationQuery};
use racefeed_storage::{
    classify_reqwest_error, BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher,
    RequestPacer, RetryDisposition,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Fixed venue coordinates for Bay Area parks and Northern California race venues.
const KNOWN_PLACES: &[(&str, f64, f64)] = &[
    ("lake chabot", 37.7275, -122.1142),
    ("golden gate park", 37.7694, -122.4862),
    ("lake merced", 37.7280, -122.4939),
    ("crissy field", 37.8039, -122.4697),
    ("presidio", 37.7989, -122.4662),
    ("angel island", 37.8609, -122.4326),
    ("tilden park", 37.8981, -122.2435),
    ("mt tamalpais", 37.9235, -122.5965),
    ("muir woods", 37.8970, -122.5811),
    ("fort funston", 37.7182, -122.5044),
    ("lands end", 37.7827, -122.5110),
    ("marin headlands", 37.8270, -122.4994),
    ("berkeley marina", 37.8644, -122.3108),
    ("lake tahoe", 39.0968, -120.0324),
    ("santa cruz", 36.9741, -122.0308),
    ("sacramento", 38.5816, -121.4944),
    ("san francisco", 37.7749, -122.4194),
    ("oakland", 37.8044, -122.2712),
    ("berkeley", 37.8715, -122.2730),
    ("santa rosa", 38.4404, -122.7141),
    ("morgan hill", 37.1305, -121.6544),
    ("granite beach", 38.7520, -121.1401),
    ("folsom lake", 38.7242, -121.1482),
    ("uvas", 37.0679, -121.6919),
    ("pleasanton", 37.6624, -121.8747),
    ("rancho seco", 38.3442, -121.1195),
    ("shadow cliffs", 37.6745, -121.8774),
    ("bass lake", 37.3229, -119.5669),
    ("omaha", 41.2565, -95.9345),
    ("lake san antonio", 35.9074, -121.0858),
    ("arroyo grande", 35.1186, -120.5908),
];

/// Place-name substring to fixed coordinates. Longer names are tried first.
#[derive(Debug, Clone)]
pub struct Gazetteer {
    entries: Vec<(String, Coordinates)>,
}

impl Gazetteer {
    pub fn new(entries: impl IntoIterator<Item = (String, Coordinates)>) -> Self {
        let mut entries: Vec<_> = entries
            .into_iter()
            .map(|(name, coords)| (name.trim().to_lowercase(), coords))
            .filter(|(name, _)| !name.is_empty())
            .collect();
        entries.sort_by(|a, b| {
            (Reverse(a.0.len()), a.0.as_str()).cmp(&(Reverse(b.0.len()), b.0.as_str()))
        });
        entries.dedup_by(|a, b| a.0 == b.0);
        Self { entries }
    }

    pub fn northern_california() -> Self {
        Self::new(
            KNOWN_PLACES
                .iter()
                .map(|(name, lat, lon)| (name.to_string(), Coordinates::new(*lat, *lon))),
        )
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, text: &str) -> Option<(&str, Coordinates)> {
        let haystack = text.to_lowercase();
        self.entries
            .iter()
            .find(|(name, _)| haystack.contains(name.as_str()))
            .map(|(name, coords)| (name.as_str(), *coords))
    }
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("transient geocoder failure: {0}")]
    Transient(String),
    #[error("geocoder rejected credentials: {0}")]
    Auth(String),
    #[error("geocoder failure: {0}")]
    Fatal(String),
}

impl GeocodeError {
    pub fn from_fetch(err: FetchError) -> Self {
        match &err {
            FetchError::HttpStatus { status, .. } => {
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
                if err.is_auth() {
                    GeocodeError::Auth(err.to_string())
                } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    GeocodeError::Transient(err.to_string())
                } else {
                    GeocodeError::Fatal(err.to_string())
                }
            }
            FetchError::Request(inner) => match classify_reqwest_error(inner) {
                RetryDisposition::Retryable => GeocodeError::Transient(err.to_string()),
                RetryDisposition::NonRetryable => GeocodeError::Fatal(err.to_string()),
            },
            FetchError::InvalidUrl { .. } => GeocodeError::Fatal(err.to_string()),
        }
    }
}

/// External address lookup. `Ok(None)` means the provider found no match.
#[async_trait]
pub trait Geocoder: Send + Sync {
    fn name(&self) -> &str;
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

/// West, south, east, north in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub const CALIFORNIA: BoundingBox = BoundingBox {
        west: -124.482003,
        south: 32.528832,
        east: -114.131211,
        north: 42.009517,
    };

    fn as_param(&self) -> String {
        format!("{},{},{},{}", self.west, self.south, self.east, self.north)
    }
}

fn geocoder_fetcher(user_agent: &str, timeout: Duration) -> anyhow::Result<HttpFetcher> {
    // Retries are owned by the resolver.
    HttpFetcher::new(HttpClientConfig {
        timeout,
        user_agent: Some(user_agent.to_string()),
        backoff: BackoffPolicy {
            max_retries: 0,
            ..BackoffPolicy::default()
        },
        min_interval: None,
    })
}

fn coordinate_value(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub struct NominatimGeocoder {
    http: HttpFetcher,
    base_url: String,
    region: BoundingBox,
    session: Uuid,
}

impl NominatimGeocoder {
    pub const DEFAULT_URL: &'static str = "https://nominatim.openstreetmap.org/search";

    pub fn new(
        base_url: impl Into<String>,
        region: BoundingBox,
        user_agent: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: geocoder_fetcher(user_agent, timeout)?,
            base_url: base_url.into(),
            region,
            session: Uuid::new_v4(),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    fn name(&self) -> &str {
        "nominatim"
    }

    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let query = vec![
            ("q".to_string(), address.to_string()),
            ("format".to_string(), "json".to_string()),
            ("limit".to_string(), "1".to_string()),
            ("viewbox".to_string(), self.region.as_param()),
            ("bounded".to_string(), "1".to_string()),
        ];
        let response = self
            .http
            .fetch_bytes(self.session, "nominatim", &self.base_url, &query, None)
            .await
            .map_err(GeocodeError::from_fetch)?;
        let body: JsonValue = serde_json::from_slice(&response.body)
            .map_err(|e| GeocodeError::Fatal(format!("nominatim response: {e}")))?;

        let Some(first) = body.as_array().and_then(|hits| hits.first()) else {
            return Ok(None);
        };
        let lat = first.get("lat").and_then(coordinate_value);
        let lon = first.get("lon").and_then(coordinate_value);
        Ok(lat.zip(lon).map(|(lat, lon)| Coordinates::new(lat, lon)))
    }
}

pub struct MapboxGeocoder {
    http: HttpFetcher,
    base_url: String,
    token: String,
    region: BoundingBox,
    session: Uuid,
}

impl MapboxGeocoder {
    pub const DEFAULT_URL: &'static str = "https://api.mapbox.com";

    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        region: BoundingBox,
        user_agent: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: geocoder_fetcher(user_agent, timeout)?,
            base_url: base_url.into(),
            token: token.into(),
            region,
            session: Uuid::new_v4(),
        })
    }

    fn places_url(&self, address: &str) -> Result<String, GeocodeError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| GeocodeError::Fatal(format!("mapbox base url: {e}")))?;
        let file = format!("{address}.json");
        url.path_segments_mut()
            .map_err(|_| GeocodeError::Fatal("mapbox base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(["geocoding", "v5", "mapbox.places", file.as_str()]);
        Ok(url.to_string())
    }
}

#[async_trait]
impl Geocoder for MapboxGeocoder {
    fn name(&self) -> &str {
        "mapbox"
    }

    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let url = self.places_url(address)?;
        let query = vec![
            ("access_token".to_string(), self.token.clone()),
            ("country".to_string(), "US".to_string()),
            ("types".to_string(), "place,address".to_string()),
            ("limit".to_string(), "1".to_string()),
            ("bbox".to_string(), self.region.as_param()),
        ];
        let response = self
            .http
            .fetch_bytes(self.session, "mapbox", &url, &query, None)
            .await
            .map_err(GeocodeError::from_fetch)?;
        let body: JsonValue = serde_json::from_slice(&response.body)
            .map_err(|e| GeocodeError::Fatal(format!("mapbox response: {e}")))?;

        // `center` is [longitude, latitude].
        let center = body
            .get("features")
            .and_then(JsonValue::as_array)
            .and_then(|features| features.first())
            .and_then(|feature| feature.get("center"))
            .and_then(JsonValue::as_array);
        Ok(center.and_then(|c| {
            let lon = c.first().and_then(coordinate_value)?;
            let lat = c.get(1).and_then(coordinate_value)?;
            Some(Coordinates::new(lat, lon))
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedVia {
    Gazetteer(String),
    FullAddress,
    CityState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved {
    pub coordinates: Coordinates,
    pub via: ResolvedVia,
}

enum GeocodeAttempt {
    Found(Coordinates),
    Miss,
}

pub struct CoordinateResolver {
    gazetteer: Gazetteer,
    geocoder: Option<Arc<dyn Geocoder>>,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
    geocode_calls: AtomicUsize,
    auth_rejected: AtomicBool,
}

impl CoordinateResolver {
    pub fn new(gazetteer: Gazetteer, geocoder: Option<Arc<dyn Geocoder>>) -> Self {
        Self::with_pacing(
            gazetteer,
            geocoder,
            Duration::from_secs(1),
            BackoffPolicy::geocoding(),
        )
    }

    pub fn with_pacing(
        gazetteer: Gazetteer,
        geocoder: Option<Arc<dyn Geocoder>>,
        min_interval: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            gazetteer,
            geocoder,
            pacer: RequestPacer::new(min_interval),
            backoff,
            geocode_calls: AtomicUsize::new(0),
            auth_rejected: AtomicBool::new(false),
        }
    }

    pub fn gazetteer(&self) -> &Gazetteer {
        &self.gazetteer
    }

    /// External geocoder calls issued so far, retries included.
    pub fn geocode_calls(&self) -> usize {
        self.geocode_calls.load(Ordering::Relaxed)
    }

    /// Set once the geocoder rejects our credentials; the geocoder is not called again.
    pub fn auth_rejected(&self) -> bool {
        self.auth_rejected.load(Ordering::Relaxed)
    }

    /// `Ok(None)` is NotFound. `Err` is always [`GeocodeError::Auth`].
    pub async fn resolve(&self, query: &LocationQuery) -> Result<Option<Resolved>, GeocodeError> {
        self.resolve_with_hint(query, None).await
    }

    /// Like [`resolve`](Self::resolve), but when the query carries neither an address nor a
    /// city, `venue_hint` (usually the event title) is also checked against the gazetteer.
    /// The hint is never sent to the external geocoder.
    pub async fn resolve_with_hint(
        &self,
        query: &LocationQuery,
        venue_hint: Option<&str>,
    ) -> Result<Option<Resolved>, GeocodeError> {
        let full_text = query.full_text();
        let venue_hint =
            venue_hint.filter(|_| !has_text(&query.free_text_address) && !has_text(&query.city));
        let known = self
            .gazetteer
            .lookup(&full_text)
            .or_else(|| venue_hint.and_then(|hint| self.gazetteer.lookup(hint)));
        if let Some((name, coordinates)) = known {
            debug!(place = name, "resolved from gazetteer");
            return Ok(Some(Resolved {
                coordinates,
                via: ResolvedVia::Gazetteer(name.to_string()),
            }));
        }

        if full_text.trim().is_empty() {
            return Ok(None);
        }
        let Some(geocoder) = self.geocoder.as_deref() else {
            return Ok(None);
        };

        if let GeocodeAttempt::Found(coordinates) =
            self.geocode_with_retries(geocoder, &full_text).await?
        {
            return Ok(Some(Resolved {
                coordinates,
                via: ResolvedVia::FullAddress,
            }));
        }

        let Some(city_state) = query.city_state().filter(|cs| *cs != full_text) else {
            return Ok(None);
        };
        debug!(query = %city_state, "falling back to city and state");
        match self.geocode_with_retries(geocoder, &city_state).await? {
            GeocodeAttempt::Found(coordinates) => Ok(Some(Resolved {
                coordinates,
                via: ResolvedVia::CityState,
            })),
            GeocodeAttempt::Miss => Ok(None),
        }
    }

    async fn geocode_with_retries(
        &self,
        geocoder: &dyn Geocoder,
        address: &str,
    ) -> Result<GeocodeAttempt, GeocodeError> {
        if self.auth_rejected() {
            return Err(GeocodeError::Auth(format!(
                "{} credentials were rejected earlier",
                geocoder.name()
            )));
        }
        let attempts = self.backoff.max_attempts();
        for attempt in 0..attempts {
            self.pacer.wait().await;
            self.geocode_calls.fetch_add(1, Ordering::Relaxed);

            match geocoder.geocode(address).await {
                Ok(Some(coordinates)) if !coordinates.is_unset() => {
                    return Ok(GeocodeAttempt::Found(coordinates))
                }
                Ok(_) => return Ok(GeocodeAttempt::Miss),
                Err(GeocodeError::Transient(detail)) => {
                    warn!(geocoder = geocoder.name(), address, attempt, detail = %detail, "transient geocoding failure");
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    }
                }
                Err(GeocodeError::Auth(detail)) => {
                    error!(geocoder = geocoder.name(), detail = %detail, "geocoder rejected credentials");
                    self.auth_rejected.store(true, Ordering::Relaxed);
                    return Err(GeocodeError::Auth(detail));
                }
                Err(GeocodeError::Fatal(detail)) => {
                    warn!(geocoder = geocoder.name(), address, detail = %detail, "geocoding failed");
                    return Ok(GeocodeAttempt::Miss);
                }
            }
        }
        warn!(geocoder = geocoder.name(), address, attempts, "geocoding retries exhausted");
        Ok(GeocodeAttempt::Miss)
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}
