//! Aggregation batches, the refresh controller, auto-refresh scheduling and snapshot export.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use cpstats_adapters::{default_adapters, AdapterSet, PlatformEndpoints};
use cpstats_core::{
    AggregateSnapshot, ErrorNotice, FetchError, Platform, PlatformConfig, PlatformRecord,
    RefreshState,
};
use cpstats_storage::{
    ConfigError, ConfigStore, HttpClientConfig, HttpFetcher, JsonFileConfigStore,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpstats-sync";

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub config_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub refresh_interval_secs: u64,
    pub auto_refresh: bool,
    pub web_port: u16,
    pub endpoints: PlatformEndpoints,
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = PlatformEndpoints::default();
        let base_url = |var: &str, fallback: String| std::env::var(var).unwrap_or(fallback);
        Self {
            config_path: std::env::var("CPSTATS_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./cpstats-config.json")),
            user_agent: std::env::var("CPSTATS_USER_AGENT")
                .unwrap_or_else(|_| "cpstats/0.1".to_string()),
            http_timeout_secs: std::env::var("CPSTATS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            refresh_interval_secs: std::env::var("CPSTATS_REFRESH_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_REFRESH_INTERVAL.as_secs()),
            auto_refresh: std::env::var("CPSTATS_AUTO_REFRESH")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            web_port: std::env::var("CPSTATS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            endpoints: PlatformEndpoints {
                leetcode: base_url("CPSTATS_LEETCODE_BASE_URL", defaults.leetcode),
                codechef: base_url("CPSTATS_CODECHEF_BASE_URL", defaults.codechef),
                hackerrank: base_url("CPSTATS_HACKERRANK_BASE_URL", defaults.hackerrank),
                codeforces: base_url("CPSTATS_CODEFORCES_BASE_URL", defaults.codeforces),
            },
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn config_store(&self) -> JsonFileConfigStore {
        JsonFileConfigStore::new(self.config_path.clone())
    }

    pub fn adapters(&self) -> Result<AdapterSet> {
        let http = HttpFetcher::new(self.http_client_config()).context("building http fetcher")?;
        Ok(default_adapters(Arc::new(http), &self.endpoints))
    }

    pub async fn start_controller(&self, adapters: AdapterSet) -> Result<RefreshController> {
        let scheduler = CronTickScheduler::new()
            .await
            .context("creating auto-refresh scheduler")?;
        let controller = RefreshController::start(ControllerParts {
            store: Arc::new(self.config_store()),
            adapters,
            scheduler: Arc::new(scheduler),
            refresh_interval: self.refresh_interval(),
        })
        .await
        .with_context(|| format!("starting controller with {}", self.config_path.display()))?;
        if self.auto_refresh {
            controller
                .set_auto_refresh(true)
                .await
                .context("enabling auto refresh")?;
        }
        Ok(controller)
    }
}

pub async fn run_once_from_env() -> Result<AggregateSnapshot> {
    let config = EngineConfig::from_env();
    let platforms = config
        .config_store()
        .get()
        .await
        .with_context(|| format!("loading configuration {}", config.config_path.display()))?;
    let adapters = config.adapters()?;
    Ok(aggregate(&platforms, &adapters).await?)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("no adapter registered for {0}")]
    MissingAdapter(Platform),
}

pub async fn aggregate(
    config: &PlatformConfig,
    adapters: &AdapterSet,
) -> Result<AggregateSnapshot, AggregateError> {
    let batch_id = Uuid::new_v4();
    let configured = config.configured();
    if configured.is_empty() {
        debug!(%batch_id, "no usernames configured; empty batch");
        return Ok(AggregateSnapshot::empty(batch_id, Utc::now()));
    }

    let mut jobs = Vec::with_capacity(configured.len());
    for (platform, username) in configured {
        let adapter = adapters
            .get(&platform)
            .cloned()
            .ok_or(AggregateError::MissingAdapter(platform))?;
        jobs.push((platform, username, adapter));
    }

    info!(%batch_id, platforms = jobs.len(), "aggregation batch started");
    let handles: Vec<_> = jobs
        .into_iter()
        .map(|(platform, username, adapter)| {
            let handle = tokio::spawn(async move { adapter.fetch(&username).await });
            (platform, handle)
        })
        .collect();

    let mut records = BTreeMap::new();
    let mut errors = Vec::new();
    for (platform, handle) in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(FetchError::transport(
                platform,
                format!("fetch task aborted: {join_err}"),
            )),
        };
        match outcome {
            Ok(record) if record.platform() == platform => {
                records.insert(platform, record);
            }
            Ok(record) => errors.push(FetchError::schema(
                platform,
                format!("adapter returned a {} record", record.platform()),
            )),
            Err(err) => {
                warn!(%batch_id, %platform, kind = ?err.kind, error = %err.message, "platform fetch failed");
                errors.push(err);
            }
        }
    }

    let snapshot = AggregateSnapshot::new(batch_id, records, errors, Utc::now());
    info!(
        %batch_id,
        succeeded = snapshot.records().len(),
        failed = snapshot.errors().len(),
        "aggregation batch finished"
    );
    Ok(snapshot)
}

pub type TickFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type TickFn = Arc<dyn Fn() -> TickFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickHandle(Uuid);

#[async_trait]
pub trait TickScheduler: Send + Sync {
    async fn every(&self, period: Duration, tick: TickFn) -> Result<TickHandle, EngineError>;
    async fn cancel(&self, handle: TickHandle) -> Result<(), EngineError>;
}

pub struct CronTickScheduler {
    sched: JobScheduler,
    started: Mutex<bool>,
}

impl CronTickScheduler {
    pub async fn new() -> Result<Self, EngineError> {
        let sched = JobScheduler::new()
            .await
            .map_err(|e| EngineError::Scheduler(format!("creating scheduler: {e}")))?;
        Ok(Self {
            sched,
            started: Mutex::new(false),
        })
    }
}

#[async_trait]
impl TickScheduler for CronTickScheduler {
    async fn every(&self, period: Duration, tick: TickFn) -> Result<TickHandle, EngineError> {
        let job = Job::new_repeated_async(period, move |_uuid, _l| tick())
            .map_err(|e| EngineError::Scheduler(format!("creating repeated job: {e}")))?;
        let id = self
            .sched
            .add(job)
            .await
            .map_err(|e| EngineError::Scheduler(format!("adding job: {e}")))?;

        let mut started = self.started.lock().await;
        if !*started {
            self.sched
                .start()
                .await
                .map_err(|e| EngineError::Scheduler(format!("starting scheduler: {e}")))?;
            *started = true;
        }
        debug!(job = %id, period_secs = period.as_secs(), "auto refresh job registered");
        Ok(TickHandle(id))
    }

    async fn cancel(&self, handle: TickHandle) -> Result<(), EngineError> {
        self.sched
            .remove(&handle.0)
            .await
            .map_err(|e| EngineError::Scheduler(format!("removing job: {e}")))
    }
}

/// Ticks only when told to.
#[derive(Default)]
pub struct ManualTickScheduler {
    ticks: Mutex<Vec<(TickHandle, Duration, TickFn)>>,
}

impl ManualTickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn registered(&self) -> usize {
        self.ticks.lock().await.len()
    }

    pub async fn fire_all(&self) -> Vec<JoinHandle<()>> {
        let ticks: Vec<TickFn> = self
            .ticks
            .lock()
            .await
            .iter()
            .map(|(_, _, tick)| tick.clone())
            .collect();
        ticks.into_iter().map(|tick| tokio::spawn(tick())).collect()
    }
}

#[async_trait]
impl TickScheduler for ManualTickScheduler {
    async fn every(&self, period: Duration, tick: TickFn) -> Result<TickHandle, EngineError> {
        let handle = TickHandle(Uuid::new_v4());
        self.ticks.lock().await.push((handle, period, tick));
        Ok(handle)
    }

    async fn cancel(&self, handle: TickHandle) -> Result<(), EngineError> {
        self.ticks.lock().await.retain(|(h, _, _)| *h != handle);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration store failed: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("scheduler error: {0}")]
    Scheduler(String),
    #[error("refresh task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Completed(Arc<AggregateSnapshot>),
    /// A batch was already in flight.
    Skipped,
    /// The configuration changed while this batch ran; its result was dropped.
    Superseded,
}

impl RefreshOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshOutcome::Completed(_) => "completed",
            RefreshOutcome::Skipped => "skipped",
            RefreshOutcome::Superseded => "superseded",
        }
    }

    pub fn snapshot(&self) -> Option<&Arc<AggregateSnapshot>> {
        match self {
            RefreshOutcome::Completed(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

pub struct ControllerParts {
    pub store: Arc<dyn ConfigStore>,
    pub adapters: AdapterSet,
    pub scheduler: Arc<dyn TickScheduler>,
    pub refresh_interval: Duration,
}

#[derive(Debug, Default)]
struct BatchLedger {
    next_batch: u64,
    active_batch: Option<u64>,
}

struct Inner {
    store: Arc<dyn ConfigStore>,
    adapters: AdapterSet,
    scheduler: Arc<dyn TickScheduler>,
    refresh_interval: Duration,
    ledger: Mutex<BatchLedger>,
    config_writes: Mutex<()>,
    config: watch::Sender<PlatformConfig>,
    state: watch::Sender<RefreshState>,
    snapshot: watch::Sender<Option<Arc<AggregateSnapshot>>>,
    notice: watch::Sender<Option<ErrorNotice>>,
    auto_refresh: Mutex<Option<TickHandle>>,
    auto_enabled: AtomicBool,
}

/// A batch superseded by a configuration change finishes quietly and its snapshot is dropped.
#[derive(Clone)]
pub struct RefreshController {
    inner: Arc<Inner>,
}

impl RefreshController {
    pub async fn start(parts: ControllerParts) -> Result<Self, EngineError> {
        if let Some(missing) = Platform::ALL
            .into_iter()
            .find(|p| !parts.adapters.contains_key(p))
        {
            return Err(AggregateError::MissingAdapter(missing).into());
        }
        let config = parts.store.get().await?;

        let (config_tx, _) = watch::channel(config.clone());
        let (state_tx, _) = watch::channel(RefreshState::Idle);
        let (snapshot_tx, _) = watch::channel(None);
        let (notice_tx, _) = watch::channel(None);
        let controller = Self {
            inner: Arc::new(Inner {
                store: parts.store,
                adapters: parts.adapters,
                scheduler: parts.scheduler,
                refresh_interval: parts.refresh_interval,
                ledger: Mutex::new(BatchLedger::default()),
                config_writes: Mutex::new(()),
                config: config_tx,
                state: state_tx,
                snapshot: snapshot_tx,
                notice: notice_tx,
                auto_refresh: Mutex::new(None),
                auto_enabled: AtomicBool::new(false),
            }),
        };

        if config.is_empty() {
            info!("no usernames configured; waiting for configuration");
        } else {
            controller.refresh_now().await?;
        }
        Ok(controller)
    }

    pub async fn refresh_now(&self) -> Result<RefreshOutcome, EngineError> {
        let (batch, config) = {
            let mut ledger = self.inner.ledger.lock().await;
            if let Some(active) = ledger.active_batch {
                debug!(active, "refresh already in flight; skipping");
                return Ok(RefreshOutcome::Skipped);
            }
            self.begin_batch(&mut ledger)
        };
        self.run_batch(batch, config).await
    }

    /// Persists `config`, swaps it in and runs a fresh batch, superseding any in-flight one.
    /// Nothing changes when persistence fails.
    pub async fn update_configuration(
        &self,
        config: PlatformConfig,
    ) -> Result<RefreshOutcome, EngineError> {
        let (batch, config) = {
            let _writes = self.inner.config_writes.lock().await;
            self.inner.store.set(&config).await?;
            let mut ledger = self.inner.ledger.lock().await;
            if let Some(active) = ledger.active_batch {
                info!(superseded = active, "configuration changed mid-batch");
            }
            self.inner.config.send_replace(config);
            self.begin_batch(&mut ledger)
        };
        self.run_batch(batch, config).await
    }

    pub async fn set_auto_refresh(&self, enabled: bool) -> Result<(), EngineError> {
        let mut auto = self.inner.auto_refresh.lock().await;
        match (enabled, auto.take()) {
            (true, None) => {
                let handle = self
                    .inner
                    .scheduler
                    .every(self.inner.refresh_interval, self.tick_fn())
                    .await?;
                *auto = Some(handle);
                info!(
                    interval_secs = self.inner.refresh_interval.as_secs(),
                    "auto refresh enabled"
                );
            }
            (false, Some(handle)) => {
                if let Err(err) = self.inner.scheduler.cancel(handle).await {
                    *auto = Some(handle);
                    return Err(err);
                }
                info!("auto refresh disabled");
            }
            (_, current) => *auto = current,
        }
        self.inner.auto_enabled.store(auto.is_some(), Ordering::SeqCst);
        Ok(())
    }

    pub fn current_snapshot(&self) -> Option<Arc<AggregateSnapshot>> {
        self.inner.snapshot.borrow().clone()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.inner
            .snapshot
            .borrow()
            .as_ref()
            .map(|s| s.completed_at())
    }

    pub fn state(&self) -> RefreshState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RefreshState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<Option<Arc<AggregateSnapshot>>> {
        self.inner.snapshot.subscribe()
    }

    pub fn error_notice(&self) -> Option<ErrorNotice> {
        self.inner.notice.borrow().clone()
    }

    pub fn dismiss_error(&self) {
        self.inner.notice.send_replace(None);
    }

    pub fn configuration(&self) -> PlatformConfig {
        self.inner.config.borrow().clone()
    }

    pub fn auto_refresh_enabled(&self) -> bool {
        self.inner.auto_enabled.load(Ordering::SeqCst)
    }

    pub fn refresh_interval(&self) -> Duration {
        self.inner.refresh_interval
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.inner.adapters
    }

    fn begin_batch(&self, ledger: &mut BatchLedger) -> (u64, PlatformConfig) {
        ledger.next_batch += 1;
        let batch = ledger.next_batch;
        ledger.active_batch = Some(batch);
        self.inner.notice.send_replace(None);
        self.inner.state.send_replace(RefreshState::Refreshing);
        (batch, self.inner.config.borrow().clone())
    }

    // The batch runs on its own task so a dropped caller cannot leave the ledger stuck mid-batch.
    async fn run_batch(
        &self,
        batch: u64,
        config: PlatformConfig,
    ) -> Result<RefreshOutcome, EngineError> {
        let this = self.clone();
        tokio::spawn(async move { this.execute_batch(batch, config).await })
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?
    }

    async fn execute_batch(
        &self,
        batch: u64,
        config: PlatformConfig,
    ) -> Result<RefreshOutcome, EngineError> {
        let result = aggregate(&config, &self.inner.adapters).await;

        let mut ledger = self.inner.ledger.lock().await;
        if ledger.active_batch != Some(batch) {
            info!(batch, "discarding result of superseded batch");
            return Ok(RefreshOutcome::Superseded);
        }
        ledger.active_batch = None;

        let snapshot = match result {
            Ok(snapshot) => Arc::new(snapshot),
            Err(err) => {
                self.inner.state.send_replace(RefreshState::Idle);
                return Err(err.into());
            }
        };
        if let Some(notice) = ErrorNotice::from_snapshot(&snapshot) {
            warn!(batch_id = %notice.batch_id, message = %notice.message, "refresh finished with failures");
            self.inner.notice.send_replace(Some(notice));
        }
        self.inner.snapshot.send_replace(Some(snapshot.clone()));
        self.inner.state.send_replace(RefreshState::Idle);
        Ok(RefreshOutcome::Completed(snapshot))
    }

    fn tick_fn(&self) -> TickFn {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let controller = RefreshController { inner };
                match controller.refresh_now().await {
                    Ok(RefreshOutcome::Skipped) => debug!("auto refresh tick skipped"),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "auto refresh tick failed"),
                }
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown export format: {0} (expected json or csv)")]
pub struct UnknownExportFormat(pub String);

impl FromStr for ExportFormat {
    type Err = UnknownExportFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(UnknownExportFormat(s.to_string())),
        }
    }
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv",
        }
    }
}

pub fn export_file_name(format: ExportFormat, date: NaiveDate) -> String {
    format!("coding-stats-{}.{}", date.format("%Y-%m-%d"), format.extension())
}

pub fn snapshot_to_json(snapshot: &AggregateSnapshot) -> serde_json::Result<String> {
    serde_json::to_string_pretty(snapshot.records())
}

fn or_dash<T: Display + PartialEq + Default>(value: Option<T>) -> String {
    match value {
        Some(v) if v != T::default() => v.to_string(),
        _ => "-".to_string(),
    }
}

/// One row per platform, always all four; absent numbers render as `0` or `-`.
pub fn snapshot_to_csv(snapshot: &AggregateSnapshot) -> String {
    let mut lines = vec!["Platform,Problems Solved,Rating,Rank".to_string()];
    for platform in Platform::ALL {
        let record = snapshot.record(platform);
        let solved = record.map(|r| r.problems_solved().value()).unwrap_or(0);
        let rating = or_dash(record.and_then(PlatformRecord::rating));
        let rank = or_dash(record.and_then(PlatformRecord::numeric_rank));
        lines.push(format!(
            "{},{},{},{}",
            platform.display_name(),
            solved,
            rating,
            rank
        ));
    }
    lines.join("\n")
}

pub fn render_export(snapshot: &AggregateSnapshot, format: ExportFormat) -> serde_json::Result<String> {
    match format {
        ExportFormat::Json => snapshot_to_json(snapshot),
        ExportFormat::Csv => Ok(snapshot_to_csv(snapshot)),
    }
}

pub fn share_text(snapshot: &AggregateSnapshot) -> String {
    let summary = snapshot.summary();
    let solved = |p: Platform| {
        snapshot
            .record(p)
            .map(|r| r.problems_solved().value())
            .unwrap_or(0)
    };
    let rating = |p: Platform| snapshot.record(p).and_then(PlatformRecord::rating).unwrap_or(0);
    let estimate_note = if summary.includes_estimate {
        " (includes HackerRank estimate)"
    } else {
        ""
    };
    format!(
        "My Coding Stats:\n\n\
         Total Problems: {}{}\n\
         LeetCode: {} problems\n\
         CodeChef: {} rating\n\
         Codeforces: {} rating\n\n\
         Track your progress too!",
        summary.total_problems,
        estimate_note,
        solved(Platform::LeetCode),
        rating(Platform::CodeChef),
        rating(Platform::Codeforces),
    )
}
