use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use racefeed_adapters::{
    AdapterContext, AdapterError, Crawlability, FetchFilter, PageCursor, SourceAdapter, SourcePage,
};
use racefeed_core::{CanonicalEvent, Coordinates, EventType, RawSourceRecord, RejectReason, SourceName};
use racefeed_storage::{
    Document, DocumentStore, HttpFetcher, InMemoryDocumentStore, StoreError, StoredDocument,
    WriteOp,
};
use racefeed_sync::{
    GeocodeError, Geocoder, RegionPredicate, RunStatus, SourceStatus, SyncConfig, SyncPipeline,
};
use serde_json::{json, Value as JsonValue};

type ScriptedPage = Result<Vec<RawSourceRecord>, &'static str>;

struct ScriptedAdapter {
    id: &'static str,
    source: SourceName,
    pages: Vec<ScriptedPage>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    fn boxed(id: &'static str, source: SourceName, pages: Vec<ScriptedPage>) -> Box<dyn SourceAdapter> {
        Box::new(Self {
            id,
            source,
            pages,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn source_id(&self) -> &str {
        self.id
    }

    fn source(&self) -> SourceName {
        self.source
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Api
    }

    async fn fetch_page(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
        _filter: &FetchFilter,
        cursor: PageCursor,
    ) -> Result<SourcePage, AdapterError> {
        let idx = self.calls.fetch_add(1, Ordering::SeqCst);
        let next = (idx + 1 < self.pages.len()).then(|| PageCursor {
            segment: cursor.segment,
            page: cursor.page + 1,
        });
        match &self.pages[idx] {
            Ok(records) => Ok(SourcePage {
                records: records.clone(),
                skipped: 0,
                next,
            }),
            Err("auth") => Err(AdapterError::Auth {
                source_id: self.id.into(),
                detail: "HTTP 401".into(),
            }),
            Err(msg) => Err(AdapterError::Message(msg.to_string())),
        }
    }
}

/// Rejects every call the way a geocoder with a revoked key does.
#[derive(Default)]
struct LockedGeocoder {
    calls: AtomicUsize,
}

#[async_trait]
impl Geocoder for LockedGeocoder {
    fn name(&self) -> &str {
        "locked"
    }

    async fn geocode(&self, _address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(GeocodeError::Auth("HTTP 403 invalid key".into()))
    }
}

#[derive(Default)]
struct CountingGeocoder {
    calls: AtomicUsize,
}

#[async_trait]
impl Geocoder for CountingGeocoder {
    fn name(&self) -> &str {
        "counting"
    }

    async fn geocode(&self, _address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Coordinates::new(1.0, 1.0)))
    }
}

/// Wraps the in-memory store, counting reads and optionally refusing every call.
#[derive(Default)]
struct CountingStore {
    inner: InMemoryDocumentStore,
    gets: AtomicUsize,
    commits: Mutex<Vec<usize>>,
    offline: bool,
}

#[async_trait]
impl DocumentStore for CountingStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.offline {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        self.inner.get(collection, id).await
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        document: Document,
        merge: bool,
    ) -> Result<(), StoreError> {
        self.inner.set(collection, id, document, merge).await
    }

    async fn batch_commit(&self, collection: &str, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        self.commits.lock().unwrap().push(ops.len());
        self.inner.batch_commit(collection, ops).await
    }

    fn stream_all<'a>(
        &'a self,
        collection: &'a str,
    ) -> BoxStream<'a, Result<StoredDocument, StoreError>> {
        self.inner.stream_all(collection)
    }
}

fn config(root: &std::path::Path) -> SyncConfig {
    config_with_pause(root, 0)
}

fn config_with_pause(root: &std::path::Path, source_pause_ms: u64) -> SyncConfig {
    let vars: HashMap<&str, String> = HashMap::from([
        ("RACEFEED_WORKSPACE_ROOT", root.display().to_string()),
        ("RACEFEED_PAGE_DELAY_MS", "0".to_string()),
        ("RACEFEED_SOURCE_PAUSE_MS", source_pause_ms.to_string()),
        ("RACEFEED_GEOCODE_INTERVAL_MS", "0".to_string()),
        ("RACEFEED_GEOCODER", "none".to_string()),
    ]);
    SyncConfig::from_lookup(|key| vars.get(key).cloned())
}

fn race(id: &str, fields: JsonValue) -> RawSourceRecord {
    let JsonValue::Object(fields) = fields else {
        panic!("fields must be an object");
    };
    RawSourceRecord::new(SourceName::RaceApi, id, "RunSignUp", Utc::now(), fields)
}

fn lake_chabot() -> RawSourceRecord {
    race(
        "123",
        json!({
            "race_id": 123,
            "name": "Lake Chabot 10K",
            "next_date": "11/01/2026",
            "address": { "state": "CA" },
            "distances": ["10k"]
        }),
    )
}

fn pipeline(
    root: &std::path::Path,
    store: Arc<CountingStore>,
    geocoder: Option<Arc<dyn Geocoder>>,
) -> SyncPipeline {
    SyncPipeline::from_parts(config(root), store, geocoder).unwrap()
}

async fn stored_event(store: &CountingStore, id: &str) -> CanonicalEvent {
    let doc = store.inner.get("events", id).await.unwrap().expect("stored event");
    serde_json::from_value(JsonValue::Object(doc)).unwrap()
}

#[tokio::test]
async fn lake_chabot_runs_end_to_end_without_geocoding() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(CountingStore::default());
    let geocoder = Arc::new(CountingGeocoder::default());
    let pipeline = pipeline(tmp.path(), store.clone(), Some(geocoder.clone()));

    let adapters = vec![ScriptedAdapter::boxed(
        "runsignup",
        SourceName::RaceApi,
        vec![Ok(vec![lake_chabot()])],
    )];
    let summary = pipeline.run_adapters(&adapters).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.totals.processed, 1);
    assert_eq!(summary.totals.created, 1);
    let event = stored_event(&store, "runsignup_123").await;
    assert_eq!(event.event_type, EventType::Road);
    assert_eq!(event.distance_tags.iter().collect::<Vec<_>>(), vec!["10k"]);
    assert_eq!(event.location.coordinates, Coordinates::new(37.7275, -122.1142));
    assert_eq!(event.source, "RunSignUp");
    assert!(event.created.is_some());
    assert_eq!(geocoder.calls.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.geocode_calls(), 0);
}

#[tokio::test]
async fn rerun_updates_instead_of_creating() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(CountingStore::default());
    let pipeline = pipeline(tmp.path(), store.clone(), None);

    let first = pipeline
        .run_adapters(&[ScriptedAdapter::boxed("runsignup", SourceName::RaceApi, vec![Ok(vec![lake_chabot()])])])
        .await;
    let second = pipeline
        .run_adapters(&[ScriptedAdapter::boxed("runsignup", SourceName::RaceApi, vec![Ok(vec![lake_chabot()])])])
        .await;

    assert_eq!((first.totals.created, first.totals.updated), (1, 0));
    assert_eq!((second.totals.created, second.totals.updated), (0, 1));
    assert_eq!(store.inner.len("events").await, 1);
}

#[tokio::test]
async fn rejected_records_never_reach_the_store() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(CountingStore::default());
    let pipeline = pipeline(tmp.path(), store.clone(), None);

    let undated = race("9", json!({ "name": "Mystery Run", "address": { "state": "CA" } }));
    let nowhere = race(
        "10",
        json!({
            "name": "Unmapped Dash",
            "next_date": "2026-05-05",
            "address": { "latitude": 0, "longitude": 0 }
        }),
    );
    let summary = pipeline
        .run_adapters(&[ScriptedAdapter::boxed("runsignup", SourceName::RaceApi, vec![Ok(vec![undated, nowhere])])])
        .await;

    let stats = summary.source("runsignup").unwrap();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.rejected, 2);
    assert_eq!(stats.rejected_by_reason[&RejectReason::MissingDate], 1);
    assert_eq!(stats.rejected_by_reason[&RejectReason::UnresolvableLocation], 1);
    assert_eq!(store.gets.load(Ordering::SeqCst), 0);
    assert!(store.commits.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_source_is_reported_and_the_run_continues() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(CountingStore::default());
    let pipeline = pipeline(tmp.path(), store.clone(), None);

    let summary = pipeline
        .run_adapters(&[
            ScriptedAdapter::boxed("quiet", SourceName::RaceApi, vec![Ok(vec![])]),
            ScriptedAdapter::boxed("runsignup", SourceName::RaceApi, vec![Ok(vec![lake_chabot()])]),
        ])
        .await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.source("quiet").unwrap().status, SourceStatus::Empty);
    assert_eq!(summary.source("runsignup").unwrap().created, 1);
}

#[tokio::test]
async fn auth_failure_keeps_earlier_events_and_spares_siblings() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(CountingStore::default());
    let pipeline = pipeline(tmp.path(), store.clone(), None);

    let tahoe = race(
        "77",
        json!({
            "name": "Lake Tahoe Marathon",
            "next_date": "2026-09-27",
            "address": { "city": "South Lake Tahoe", "state": "CA" }
        }),
    );
    let summary = pipeline
        .run_adapters(&[
            ScriptedAdapter::boxed("locked", SourceName::RaceApi, vec![Ok(vec![tahoe]), Err("auth")]),
            ScriptedAdapter::boxed("flaky", SourceName::RaceApi, vec![Ok(vec![lake_chabot()]), Err("HTTP 503")]),
        ])
        .await;

    assert_eq!(summary.status, RunStatus::Completed);
    let locked = summary.source("locked").unwrap();
    assert_eq!(locked.status, SourceStatus::AuthFailed);
    assert_eq!(locked.created, 1);
    assert!(locked.error.as_deref().unwrap().contains("HTTP 401"));

    let flaky = summary.source("flaky").unwrap();
    assert_eq!(flaky.status, SourceStatus::Truncated);
    assert_eq!(flaky.created, 1);
    assert_eq!(store.inner.len("events").await, 2);
}

fn fresno(id: &str) -> RawSourceRecord {
    race(
        id,
        json!({
            "name": format!("Fresno Half {id}"),
            "next_date": "2026-02-01",
            "address": { "street": format!("{id} Main St"), "city": "Fresno", "state": "CA" }
        }),
    )
}

#[tokio::test]
async fn geocoder_auth_failure_stops_the_source_after_writing_resolved_events() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(CountingStore::default());
    let geocoder = Arc::new(LockedGeocoder::default());
    let pipeline = pipeline(tmp.path(), store.clone(), Some(geocoder.clone()));

    let summary = pipeline
        .run_adapters(&[
            ScriptedAdapter::boxed(
                "runsignup",
                SourceName::RaceApi,
                vec![Ok(vec![lake_chabot(), fresno("201"), fresno("202"), fresno("203")])],
            ),
            ScriptedAdapter::boxed("central", SourceName::RaceApi, vec![Ok(vec![fresno("301")])]),
        ])
        .await;

    assert_eq!(summary.status, RunStatus::Completed);
    let stats = summary.source("runsignup").unwrap();
    assert_eq!(stats.status, SourceStatus::AuthFailed);
    assert!(stats.error.as_deref().unwrap().contains("invalid key"));
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.rejected, 0);
    assert_eq!(stats.created, 1);
    assert!(store.inner.get("events", "runsignup_123").await.unwrap().is_some());

    // The rejected key is not retried for the next source.
    assert_eq!(summary.source("central").unwrap().status, SourceStatus::AuthFailed);
    assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.geocode_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn sources_are_separated_by_the_configured_pause() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(CountingStore::default());
    let pipeline =
        SyncPipeline::from_parts(config_with_pause(tmp.path(), 1000), store.clone(), None).unwrap();
    let start = tokio::time::Instant::now();

    let summary = pipeline
        .run_adapters(&[
            ScriptedAdapter::boxed("quiet", SourceName::RaceApi, vec![Ok(vec![])]),
            ScriptedAdapter::boxed("runsignup", SourceName::RaceApi, vec![Ok(vec![lake_chabot()])]),
        ])
        .await;

    assert_eq!(summary.sources.len(), 2);
    assert!(start.elapsed() >= std::time::Duration::from_secs(1));
    assert!(start.elapsed() < std::time::Duration::from_secs(2));
}

#[tokio::test]
async fn unavailable_store_aborts_with_partial_summary() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(CountingStore {
        offline: true,
        ..CountingStore::default()
    });
    let pipeline = pipeline(tmp.path(), store.clone(), None);

    let summary = pipeline
        .run_adapters(&[
            ScriptedAdapter::boxed("first", SourceName::RaceApi, vec![Ok(vec![lake_chabot()])]),
            ScriptedAdapter::boxed("never", SourceName::RaceApi, vec![Ok(vec![lake_chabot()])]),
        ])
        .await;

    assert_eq!(summary.status, RunStatus::Aborted);
    assert!(summary.abort_reason.is_some());
    assert_eq!(summary.sources.len(), 1);
    assert_eq!(summary.sources[0].status, SourceStatus::Aborted);
    assert_eq!(summary.totals.processed, 1);
}

#[tokio::test]
async fn run_once_reads_the_registry_and_writes_reports() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("sources.yaml"),
        "sources:\n  - source_id: ultrasignup\n    display_name: UltraSignup\n    kind: spreadsheet\n    path: events.csv\n",
    )
    .unwrap();
    std::fs::write(
        tmp.path().join("events.csv"),
        "Event ID,Event Name,Date,City,State,Distances\n\
         501,Sacramento Ultra,2026-04-11,Sacramento,CA,50K\n\
         502,Western States 100,06/27/2026,Olympic Valley,CA,100M\n",
    )
    .unwrap();

    let store = Arc::new(CountingStore::default());
    let summary = pipeline(tmp.path(), store.clone(), None).run_once().await.unwrap();

    let stats = summary.source("ultrasignup").unwrap();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.rejected_by_reason[&RejectReason::UnresolvableLocation], 1);

    let event = stored_event(&store, "ultrasignup_501").await;
    assert_eq!(event.event_type, EventType::Ultra);
    assert_eq!(event.source, "UltraSignup");

    let reports = std::path::PathBuf::from(summary.reports_dir.unwrap());
    let written: JsonValue =
        serde_json::from_slice(&std::fs::read(reports.join("run_summary.json")).unwrap()).unwrap();
    assert_eq!(written["totals"]["created"], json!(1));
    let brief = std::fs::read_to_string(reports.join("run_brief.md")).unwrap();
    assert!(brief.contains("ultrasignup (spreadsheet_import)"));
}

#[tokio::test]
async fn prune_and_purge_delete_matching_records() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(CountingStore::default());
    let pipeline = pipeline(tmp.path(), store.clone(), None);
    pipeline
        .run_adapters(&[ScriptedAdapter::boxed("runsignup", SourceName::RaceApi, vec![Ok(vec![lake_chabot()])])])
        .await;
    for (id, doc) in [
        ("legacy_nv", json!({ "location": { "state": "NV" }, "source": "TriCoach" })),
        ("legacy_ca", json!({ "address_text": "Auburn, California", "source": "TriCoach" })),
    ] {
        let JsonValue::Object(doc) = doc else { unreachable!() };
        store.inner.set("events", id, doc, false).await.unwrap();
    }

    let pruned = pipeline.prune_region(&RegionPredicate::california()).await.unwrap();
    assert_eq!(pruned.deleted, 1);
    assert!(store.inner.get("events", "legacy_nv").await.unwrap().is_none());

    let purged = pipeline.purge_source("TriCoach").await.unwrap();
    assert_eq!(purged.deleted, 1);
    assert_eq!(store.inner.len("events").await, 1);
}
