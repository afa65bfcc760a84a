//! Pipeline orchestration: adapters → normalizer → batch upsert writer, plus maintenance deletes.

pub mod classify;
pub mod normalize;
pub mod resolver;
pub mod writer;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use racefeed_adapters::{
    adapter_from_settings, fetch_all, AdapterContext, AdapterSettings, FetchFilter,
    SourceAdapter, TraversalOutcome,
};
use racefeed_core::RejectReason;
use racefeed_storage::{
    BackoffPolicy, DocumentStore, FsDocumentStore, HttpClientConfig, HttpFetcher,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use classify::TextClassifier;
pub use normalize::{EventNormalizer, NormalizeError};
pub use resolver::{
    BoundingBox, CoordinateResolver, Gazetteer, GeocodeError, Geocoder, MapboxGeocoder,
    NominatimGeocoder,
};
pub use writer::{
    BatchUpsertWriter, DeleteCounts, RecordPredicate, RegionPredicate, SourcePredicate,
    UpsertCounts, WriterError,
};

pub const CRATE_NAME: &str = "racefeed-sync";

/// Window passed to adapters that do not set their own lookahead.
pub const DEFAULT_LOOKAHEAD_DAYS: u64 = 365;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(flatten)]
    pub settings: AdapterSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeocoderKind {
    Nominatim,
    Mapbox,
    None,
}

impl GeocoderKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "nominatim" => Some(Self::Nominatim),
            "mapbox" => Some(Self::Mapbox),
            "none" | "off" | "" => Some(Self::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub store_dir: PathBuf,
    pub collection: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub page_delay: Duration,
    pub source_pause: Duration,
    pub upsert_batch_size: usize,
    pub delete_batch_size: usize,
    pub geocoder: GeocoderKind,
    pub geocoder_url: Option<String>,
    pub mapbox_token: Option<String>,
    pub geocode_interval: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: u64| Duration::from_millis(parsed(key).unwrap_or(default));
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let geocoder = match non_empty("RACEFEED_GEOCODER") {
            Some(raw) => GeocoderKind::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown RACEFEED_GEOCODER; using nominatim");
                GeocoderKind::Nominatim
            }),
            None => GeocoderKind::Nominatim,
        };

        Self {
            workspace_root: non_empty("RACEFEED_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            store_dir: non_empty("RACEFEED_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./store")),
            collection: non_empty("RACEFEED_COLLECTION").unwrap_or_else(|| "events".to_string()),
            user_agent: non_empty("RACEFEED_USER_AGENT")
                .unwrap_or_else(|| "racefeed-bot/0.1".to_string()),
            http_timeout_secs: parsed("RACEFEED_HTTP_TIMEOUT_SECS").unwrap_or(30),
            page_delay: millis("RACEFEED_PAGE_DELAY_MS", 1000),
            source_pause: millis("RACEFEED_SOURCE_PAUSE_MS", 1000),
            upsert_batch_size: parsed("RACEFEED_UPSERT_BATCH_SIZE")
                .map(|v| v as usize)
                .unwrap_or(writer::DEFAULT_UPSERT_BATCH_SIZE),
            delete_batch_size: parsed("RACEFEED_DELETE_BATCH_SIZE")
                .map(|v| v as usize)
                .unwrap_or(writer::DEFAULT_DELETE_BATCH_SIZE),
            geocoder,
            geocoder_url: non_empty("RACEFEED_GEOCODER_URL"),
            mapbox_token: non_empty("MAPBOX_TOKEN"),
            geocode_interval: millis("RACEFEED_GEOCODE_INTERVAL_MS", 1000),
            scheduler_enabled: lookup("RACEFEED_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: non_empty("RACEFEED_SYNC_CRON").unwrap_or_else(|| "0 0 * * *".to_string()),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Completed,
    /// The source delivered no records; reported, not an error.
    Empty,
    /// A page failed mid-traversal; earlier records were still written.
    Truncated,
    /// The adapter's or the geocoder's credentials were rejected.
    AuthFailed,
    /// The store became unreachable while this source was running.
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunStats {
    pub source_id: String,
    pub source: String,
    pub status: SourceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub pages_fetched: usize,
    pub processed: usize,
    /// Items the adapter dropped before normalization.
    pub skipped: usize,
    pub rejected: usize,
    pub rejected_by_reason: BTreeMap<RejectReason, usize>,
    pub created: usize,
    pub updated: usize,
    pub write_failed: usize,
    pub groups_failed: usize,
}

impl SourceRunStats {
    fn new(adapter: &dyn SourceAdapter) -> Self {
        Self {
            source_id: adapter.source_id().to_string(),
            source: adapter.source().as_str().to_string(),
            status: SourceStatus::Completed,
            error: None,
            pages_fetched: 0,
            processed: 0,
            skipped: 0,
            rejected: 0,
            rejected_by_reason: BTreeMap::new(),
            created: 0,
            updated: 0,
            write_failed: 0,
            groups_failed: 0,
        }
    }

    fn reject(&mut self, reason: RejectReason) {
        self.rejected += 1;
        *self.rejected_by_reason.entry(reason).or_default() += 1;
    }

    fn absorb(&mut self, counts: &UpsertCounts) {
        self.created += counts.created;
        self.updated += counts.updated;
        self.write_failed += counts.write_failed;
        self.groups_failed += counts.groups_failed;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub write_failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub enabled_sources: usize,
    pub totals: RunTotals,
    pub sources: Vec<SourceRunStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reports_dir: Option<String>,
}

impl SyncRunSummary {
    pub fn source(&self, source_id: &str) -> Option<&SourceRunStats> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    fn recompute_totals(&mut self) {
        self.totals = self.sources.iter().fold(RunTotals::default(), |mut t, s| {
            t.processed += s.processed;
            t.created += s.created;
            t.updated += s.updated;
            t.rejected += s.rejected;
            t.skipped += s.skipped;
            t.write_failed += s.write_failed;
            t
        });
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    store: Arc<dyn DocumentStore>,
    normalizer: EventNormalizer,
    writer: BatchUpsertWriter,
}

impl SyncPipeline {
    /// Opens the filesystem store and the configured geocoder.
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let store = FsDocumentStore::open(&config.store_dir)
            .await
            .with_context(|| format!("opening document store {}", config.store_dir.display()))?;
        let geocoder = build_geocoder(&config)?;
        Self::from_parts(config, Arc::new(store), geocoder)
    }

    pub fn from_parts(
        config: SyncConfig,
        store: Arc<dyn DocumentStore>,
        geocoder: Option<Arc<dyn Geocoder>>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let normalizer = build_normalizer(&config, geocoder);
        let writer = build_writer(&config, store.clone());
        Ok(Self {
            config,
            http,
            store,
            normalizer,
            writer,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.writer = build_writer(&self.config, store.clone());
        self.store = store;
        self
    }

    pub fn with_geocoder(mut self, geocoder: Option<Arc<dyn Geocoder>>) -> Self {
        self.normalizer = build_normalizer(&self.config, geocoder);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn geocode_calls(&self) -> usize {
        self.normalizer.resolver().geocode_calls()
    }

    /// Runs every enabled source in `sources.yaml` and writes the run reports.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let registry = SourceRegistry::load(&self.config.registry_path()).await?;
        let adapters: Vec<Box<dyn SourceAdapter>> = registry
            .enabled()
            .map(|source| {
                adapter_from_settings(
                    &source.source_id,
                    &source.display_name,
                    &source.settings,
                    &self.config.workspace_root,
                )
            })
            .collect();

        let mut summary = self.run_adapters(&adapters).await;
        let reports_dir = self.write_reports(&summary).await?;
        summary.reports_dir = Some(reports_dir.display().to_string());
        Ok(summary)
    }

    /// Runs the given adapters in order. Never fails: a store outage ends the run
    /// early with `RunStatus::Aborted` and the statistics gathered so far.
    pub async fn run_adapters(&self, adapters: &[Box<dyn SourceAdapter>]) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            status: RunStatus::Completed,
            abort_reason: None,
            enabled_sources: adapters.len(),
            totals: RunTotals::default(),
            sources: Vec::with_capacity(adapters.len()),
            reports_dir: None,
        };
        info!(%run_id, sources = adapters.len(), "sync run started");

        for (index, adapter) in adapters.iter().enumerate() {
            if index > 0 && !self.config.source_pause.is_zero() {
                tokio::time::sleep(self.config.source_pause).await;
            }
            let ctx = AdapterContext::new(run_id);
            let filter = FetchFilter::upcoming(ctx.fetched_at.date_naive(), DEFAULT_LOOKAHEAD_DAYS);
            let mut stats = SourceRunStats::new(adapter.as_ref());

            let result = self.run_source(adapter.as_ref(), ctx, filter, &mut stats).await;
            info!(
                source_id = %stats.source_id,
                status = ?stats.status,
                processed = stats.processed,
                created = stats.created,
                updated = stats.updated,
                rejected = stats.rejected,
                "source finished"
            );
            summary.sources.push(stats);

            if let Err(err) = result {
                error!(%run_id, error = %err, "store unavailable; aborting run");
                summary.status = RunStatus::Aborted;
                summary.abort_reason = Some(err.to_string());
                break;
            }
        }

        summary.finished_at = Utc::now();
        summary.recompute_totals();
        info!(
            %run_id,
            status = ?summary.status,
            processed = summary.totals.processed,
            created = summary.totals.created,
            updated = summary.totals.updated,
            rejected = summary.totals.rejected,
            "sync run finished"
        );
        summary
    }

    async fn run_source(
        &self,
        adapter: &dyn SourceAdapter,
        ctx: AdapterContext,
        filter: FetchFilter,
        stats: &mut SourceRunStats,
    ) -> Result<(), WriterError> {
        let mut traversal = fetch_all(adapter, &self.http, ctx, filter, self.config.page_delay);
        let mut pending = Vec::with_capacity(self.writer.batch_size());
        let mut auth_error: Option<String> = None;

        let written = loop {
            let record = match traversal.next().await {
                Ok(Some(record)) => record,
                Ok(None) => break Ok(()),
                Err(err) => {
                    auth_error = Some(err.to_string());
                    break Ok(());
                }
            };
            stats.processed += 1;
            match self.normalizer.normalize(&record).await {
                Ok(event) => pending.push(event),
                Err(NormalizeError::Rejected(reason)) => {
                    debug!(source_id = %stats.source_id, external_id = %record.external_id, %reason, "record rejected");
                    stats.reject(reason);
                }
                Err(err @ NormalizeError::GeocoderAuth(_)) => {
                    warn!(source_id = %stats.source_id, error = %err, "stopping source");
                    auth_error = Some(err.to_string());
                    break Ok(());
                }
            }
            if pending.len() >= self.writer.batch_size() {
                match self.writer.upsert(std::mem::take(&mut pending)).await {
                    Ok(counts) => stats.absorb(&counts),
                    Err(err) => break Err(err),
                }
            }
        };

        // Events normalized before an auth rejection (adapter or geocoder) are still written.
        let written = match written {
            Ok(()) if !pending.is_empty() => self
                .writer
                .upsert(std::mem::take(&mut pending))
                .await
                .map(|counts| stats.absorb(&counts)),
            other => other,
        };

        stats.pages_fetched = traversal.pages_fetched();
        stats.skipped = traversal.skipped();
        if let Err(err) = written {
            stats.status = SourceStatus::Aborted;
            stats.error = Some(err.to_string());
            return Err(err);
        }

        match (auth_error, traversal.outcome()) {
            (Some(err), _) => {
                stats.status = SourceStatus::AuthFailed;
                stats.error = Some(err);
            }
            (None, TraversalOutcome::Truncated { error }) => {
                stats.status = SourceStatus::Truncated;
                stats.error = Some(error.clone());
            }
            (None, _) if stats.processed == 0 => {
                info!(source_id = %stats.source_id, "source returned no records");
                stats.status = SourceStatus::Empty;
            }
            (None, _) => stats.status = SourceStatus::Completed,
        }
        Ok(())
    }

    /// Deletes stored events that fall outside the region.
    pub async fn prune_region(&self, region: &RegionPredicate) -> Result<DeleteCounts> {
        self.writer
            .delete_where(region)
            .await
            .context("pruning out-of-region events")
    }

    /// Deletes every stored event whose `source` equals `provenance`.
    pub async fn purge_source(&self, provenance: &str) -> Result<DeleteCounts> {
        self.writer
            .delete_where(&SourcePredicate::new(provenance))
            .await
            .with_context(|| format!("purging events from {provenance}"))
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let config = self.config.clone();
        let cron = &self.config.sync_cron;
        let job = Job::new_async(cron, move |_uuid, _l| {
            let config = config.clone();
            Box::pin(async move {
                match run_sync_once(config).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        status = ?summary.status,
                        created = summary.totals.created,
                        updated = summary.totals.updated,
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    pub async fn write_reports(&self, summary: &SyncRunSummary) -> Result<PathBuf> {
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), json)
            .await
            .context("writing run_summary.json")?;
        fs::write(reports_dir.join("run_brief.md"), render_brief(summary))
            .await
            .context("writing run_brief.md")?;

        Ok(reports_dir)
    }
}

fn build_normalizer(config: &SyncConfig, geocoder: Option<Arc<dyn Geocoder>>) -> EventNormalizer {
    let resolver = CoordinateResolver::with_pacing(
        Gazetteer::northern_california(),
        geocoder,
        config.geocode_interval,
        BackoffPolicy::geocoding(),
    );
    EventNormalizer::new(Arc::new(resolver), TextClassifier::default())
}

fn build_writer(config: &SyncConfig, store: Arc<dyn DocumentStore>) -> BatchUpsertWriter {
    BatchUpsertWriter::new(store, config.collection.clone())
        .with_batch_sizes(config.upsert_batch_size, config.delete_batch_size)
}

pub fn build_geocoder(config: &SyncConfig) -> Result<Option<Arc<dyn Geocoder>>> {
    let timeout = config.http_timeout();
    let geocoder: Arc<dyn Geocoder> = match config.geocoder {
        GeocoderKind::None => return Ok(None),
        GeocoderKind::Nominatim => Arc::new(NominatimGeocoder::new(
            config
                .geocoder_url
                .clone()
                .unwrap_or_else(|| NominatimGeocoder::DEFAULT_URL.to_string()),
            BoundingBox::CALIFORNIA,
            &config.user_agent,
            timeout,
        )?),
        GeocoderKind::Mapbox => {
            let token = config
                .mapbox_token
                .clone()
                .context("MAPBOX_TOKEN must be set when RACEFEED_GEOCODER=mapbox")?;
            Arc::new(MapboxGeocoder::new(
                config
                    .geocoder_url
                    .clone()
                    .unwrap_or_else(|| MapboxGeocoder::DEFAULT_URL.to_string()),
                token,
                BoundingBox::CALIFORNIA,
                &config.user_agent,
                timeout,
            )?)
        }
    };
    Ok(Some(geocoder))
}

pub fn render_brief(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# Race Event Sync".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Status: {:?}", summary.status),
        format!("- Enabled sources: {}", summary.enabled_sources),
        format!(
            "- Totals: processed {}, created {}, updated {}, rejected {}, skipped {}, write failures {}",
            summary.totals.processed,
            summary.totals.created,
            summary.totals.updated,
            summary.totals.rejected,
            summary.totals.skipped,
            summary.totals.write_failed
        ),
    ];
    if let Some(reason) = &summary.abort_reason {
        lines.push(format!("- Aborted: {reason}"));
    }
    lines.push(String::new());
    lines.push("## Sources".to_string());
    for source in &summary.sources {
        lines.push(format!(
            "- {} ({}): {:?}, processed {}, created {}, updated {}, rejected {}",
            source.source_id,
            source.source,
            source.status,
            source.processed,
            source.created,
            source.updated,
            source.rejected
        ));
        for (reason, count) in &source.rejected_by_reason {
            lines.push(format!("  - {reason}: {count}"));
        }
        if let Some(err) = &source.error {
            lines.push(format!("  - error: {err}"));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(config).await?;
    pipeline.run_once().await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    run_sync_once(SyncConfig::from_env()).await
}
