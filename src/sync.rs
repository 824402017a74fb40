//! The sync orchestrator: runs the channel, video and playlist phases,
//! records every run in the history table and answers status queries.
//!
//! External calls are blocking and run on tokio's blocking pool. Only one
//! run may be active at a time; a second trigger is rejected rather than
//! queued.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime, SubsecRound};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{ReconcileError, SyncError};
use crate::models::{EntityKind, SyncKind, SyncRun, SyncStatus};
use crate::normalize::{normalize_channel, normalize_playlist, normalize_video};
use crate::reconcile::{ReconcileReport, reconcile};
use crate::source::{
    ChannelSource, fetch_all_playlist_bundles, fetch_all_videos, fetch_channel,
};
use crate::store::{SiteStore, format_timestamp};

pub const DEFAULT_HIGHLIGHT_COUNT: usize = 8;
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// How many videos get the latest/popular flags after a video sync.
    pub highlight_count: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            highlight_count: DEFAULT_HIGHLIGHT_COUNT,
        }
    }
}

/// Snapshot of the mirror's health, for the status endpoint and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusReport {
    pub source_reachable: bool,
    pub has_channel: bool,
    pub video_count: i64,
    pub playlist_count: i64,
    pub last_full_sync: Option<SyncRun>,
    pub running: bool,
    pub checked_at: NaiveDateTime,
}

impl SyncStatusReport {
    pub fn summary_line(&self) -> String {
        let mark = |ok: bool| if ok { "✓" } else { "✗" };
        let last_sync = self
            .last_full_sync
            .as_ref()
            .map(|run| format_timestamp(&run.started_at))
            .unwrap_or_else(|| "never".to_string());
        format!(
            "API Connected: {} | Channel Data: {} | Videos: {} | Playlists: {} | Last Sync: {} | Last Check: {}",
            mark(self.source_reachable),
            mark(self.has_channel),
            self.video_count,
            self.playlist_count,
            last_sync,
            format_timestamp(&self.checked_at),
        )
    }
}

enum PhaseOutcome {
    Completed(ReconcileReport),
    /// The upstream listing was empty and nothing was reconciled.
    Skipped(EntityKind),
}

/// What a run did before reaching its terminal status.
#[derive(Debug, Default)]
struct RunSummary {
    touched: i64,
    problems: Vec<String>,
}

impl RunSummary {
    fn absorb(&mut self, outcome: PhaseOutcome) {
        match outcome {
            PhaseOutcome::Completed(report) => {
                self.touched += report.touched() as i64;
                if report.has_failures() {
                    self.problems.push(format!(
                        "{} {} record(s) failed",
                        report.failures.len(),
                        report.kind
                    ));
                }
            }
            PhaseOutcome::Skipped(kind) => {
                self.problems
                    .push(format!("{kind} sync skipped: upstream returned no records"));
            }
        }
    }

    fn status(&self) -> SyncStatus {
        if self.problems.is_empty() {
            SyncStatus::Success
        } else {
            SyncStatus::Partial
        }
    }

    fn message(&self) -> Option<String> {
        if self.problems.is_empty() {
            None
        } else {
            Some(self.problems.join("; "))
        }
    }
}

/// Runs `op`, and once more after a short pause if it fails. The second
/// error is returned.
async fn retry_once<T, F, Fut>(what: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(error = format!("{err:#}"), "{what} failed; retrying once");
            tokio::time::sleep(FINISH_RETRY_DELAY).await;
            op().await
        }
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(0)
}

pub struct SyncService {
    store: SiteStore,
    source: Arc<dyn ChannelSource>,
    options: SyncOptions,
    run_guard: Mutex<()>,
}

impl SyncService {
    pub fn new(store: SiteStore, source: Arc<dyn ChannelSource>, options: SyncOptions) -> Self {
        Self {
            store,
            source,
            options,
            run_guard: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &SiteStore {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.run_guard.try_lock().is_err()
    }

    /// Runs `work` against the source on the blocking pool.
    async fn with_source<T, F>(&self, work: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ChannelSource) -> T + Send + 'static,
    {
        let source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || work(source.as_ref()))
            .await
            .map_err(|err| SyncError::Worker(err.to_string()))
    }

    /// Executes one recorded run of `kind`.
    ///
    /// The history row is written before any work starts and finished exactly
    /// once afterwards. Errors inside the run end up in the row as `FAILED`;
    /// only a busy guard or a history write failure is returned as `Err`.
    pub async fn run(&self, kind: SyncKind) -> Result<SyncRun, SyncError> {
        let _guard = self
            .run_guard
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;

        let clock = Instant::now();
        let run = self.store.begin_run(kind, now()).await?;
        info!(run_id = run.id, %kind, "sync run started");

        let (status, touched, message) = match self.execute(kind).await {
            Ok(summary) => (summary.status(), summary.touched, summary.message()),
            Err(err) => (SyncStatus::Failed, 0, Some(err.to_string())),
        };
        let elapsed = clock.elapsed().as_secs() as i64;
        retry_once("finishing sync run", || {
            self.store
                .finish_run(run.id, status, touched, elapsed, message.as_deref())
        })
        .await?;

        match status {
            SyncStatus::Failed => error!(
                run_id = run.id,
                %kind,
                elapsed,
                error = message.as_deref().unwrap_or_default(),
                "sync run failed"
            ),
            SyncStatus::Partial => warn!(
                run_id = run.id,
                %kind,
                touched,
                elapsed,
                problems = message.as_deref().unwrap_or_default(),
                "sync run finished partially"
            ),
            _ => info!(run_id = run.id, %kind, touched, elapsed, "sync run finished"),
        }

        Ok(SyncRun {
            status,
            records_touched: touched,
            elapsed_seconds: elapsed,
            error_message: message,
            ..run
        })
    }

    async fn execute(&self, kind: SyncKind) -> Result<RunSummary, SyncError> {
        let mut summary = RunSummary::default();
        match kind {
            SyncKind::ChannelStats => {
                if self.refresh_channel_stats().await? {
                    summary.touched = 1;
                } else {
                    summary.problems.push("channel data unavailable".into());
                }
            }
            SyncKind::Videos => summary.absorb(self.video_phase().await?),
            SyncKind::Playlists => summary.absorb(self.playlist_phase().await?),
            SyncKind::All => {
                // A channel failure is logged and never stops the content
                // phases.
                if let Err(err) = self.refresh_channel_stats().await {
                    warn!(error = %err, "channel stats sync failed; continuing");
                }
                summary.touched += 1;
                summary.absorb(self.video_phase().await?);
                summary.absorb(self.playlist_phase().await?);
            }
        }
        Ok(summary)
    }

    /// Fetches and stores the channel snapshot. `Ok(false)` when the platform
    /// did not return a usable channel.
    pub async fn refresh_channel_stats(&self) -> Result<bool, SyncError> {
        let Some(raw) = self.with_source(fetch_channel).await? else {
            return Ok(false);
        };
        let Some(normalized) = normalize_channel(&raw, now()) else {
            warn!("channel payload carried no id");
            return Ok(false);
        };
        for warning in &normalized.warnings {
            warn!(channel_id = %normalized.record.channel_id, %warning, "channel normalization");
        }
        self.store.replace_channel(&normalized.record).await?;
        info!(
            channel_id = %normalized.record.channel_id,
            subscribers = normalized.record.subscriber_count,
            "channel snapshot stored"
        );
        Ok(true)
    }

    async fn video_phase(&self) -> Result<PhaseOutcome, SyncError> {
        let raw = self.with_source(fetch_all_videos).await?;
        let refreshed_at = now();
        let fetched = raw.len();
        let records: Vec<_> = raw
            .iter()
            .filter_map(|video| normalize_video(video, refreshed_at))
            .map(|normalized| {
                for warning in &normalized.warnings {
                    warn!(video_id = %normalized.record.video_id, %warning, "video normalization");
                }
                normalized.record
            })
            .collect();
        if records.len() < fetched {
            warn!(
                dropped = fetched - records.len(),
                "dropped video items without a usable id"
            );
        }

        let report = match reconcile(EntityKind::Video, &self.store, records).await {
            Ok(report) => report,
            Err(ReconcileError::EmptyUpstream(kind)) => return Ok(PhaseOutcome::Skipped(kind)),
            Err(err) => return Err(err.into()),
        };

        if let Err(err) = self.store.refresh_highlights(self.options.highlight_count).await {
            warn!(error = format!("{err:#}"), "could not refresh highlight flags");
        }
        Ok(PhaseOutcome::Completed(report))
    }

    async fn playlist_phase(&self) -> Result<PhaseOutcome, SyncError> {
        let bundles = self.with_source(fetch_all_playlist_bundles).await?;
        let refreshed_at = now();
        let fetched = bundles.len();
        let records: Vec<_> = bundles
            .iter()
            .filter_map(|bundle| normalize_playlist(bundle, refreshed_at))
            .map(|normalized| {
                for warning in &normalized.warnings {
                    warn!(playlist_id = %normalized.record.playlist_id, %warning, "playlist normalization");
                }
                normalized.record
            })
            .collect();
        if records.len() < fetched {
            warn!(
                dropped = fetched - records.len(),
                "dropped playlist items without a usable id"
            );
        }

        match reconcile(EntityKind::Playlist, &self.store, records).await {
            Ok(report) => Ok(PhaseOutcome::Completed(report)),
            Err(ReconcileError::EmptyUpstream(kind)) => Ok(PhaseOutcome::Skipped(kind)),
            Err(err) => Err(err.into()),
        }
    }

    /// Full sync for timers and startup hooks. Never fails; the outcome is in
    /// the history table and the returned run, if one was started.
    pub async fn sync_all(&self) -> Option<SyncRun> {
        match self.run(SyncKind::All).await {
            Ok(run) => Some(run),
            Err(SyncError::AlreadyRunning) => {
                warn!("full sync skipped: another run is in progress");
                None
            }
            Err(err) => {
                error!(error = %err, "full sync could not be recorded");
                None
            }
        }
    }

    /// Manually requested full sync. Unlike [`SyncService::sync_all`] a busy
    /// guard or a failed run is reported to the caller.
    pub async fn trigger_full_sync(&self) -> Result<SyncRun, SyncError> {
        info!("manual full sync requested");
        let run = self.run(SyncKind::All).await?;
        if run.status == SyncStatus::Failed {
            let message = run.error_message.clone().unwrap_or_default();
            error!(run_id = run.id, %message, "manual full sync failed");
            return Err(SyncError::RunFailed(message));
        }
        Ok(run)
    }

    /// Recorded channel-stats run. Never fails; `true` when a snapshot was
    /// stored.
    pub async fn sync_channel_stats(&self) -> bool {
        match self.run(SyncKind::ChannelStats).await {
            Ok(run) => run.status == SyncStatus::Success,
            Err(err) => {
                warn!(error = %err, "channel stats sync did not run");
                false
            }
        }
    }

    /// Recorded video run; returns the number of records touched.
    pub async fn sync_videos(&self) -> Result<usize, SyncError> {
        Self::touched_or_failure(self.run(SyncKind::Videos).await?)
    }

    /// Recorded playlist run; returns the number of records touched.
    pub async fn sync_playlists(&self) -> Result<usize, SyncError> {
        Self::touched_or_failure(self.run(SyncKind::Playlists).await?)
    }

    fn touched_or_failure(run: SyncRun) -> Result<usize, SyncError> {
        if run.status == SyncStatus::Failed {
            return Err(SyncError::RunFailed(
                run.error_message.unwrap_or_default(),
            ));
        }
        Ok(run.records_touched.max(0) as usize)
    }

    /// Lightweight channel lookup. Does not touch stored state.
    pub async fn is_source_reachable(&self) -> bool {
        match self.with_source(|source| source.channel()).await {
            Ok(Ok(Some(_))) => true,
            Ok(Ok(None)) => {
                debug!("source reachable but channel not found");
                false
            }
            Ok(Err(err)) => {
                debug!(error = %err, "source unreachable");
                false
            }
            Err(err) => {
                debug!(error = %err, "reachability probe did not complete");
                false
            }
        }
    }

    pub async fn has_channel_data(&self) -> Result<bool, SyncError> {
        Ok(self.store.has_channel().await?)
    }

    pub async fn status_report(&self) -> Result<SyncStatusReport, SyncError> {
        let source_reachable = self.is_source_reachable().await;
        Ok(SyncStatusReport {
            source_reachable,
            has_channel: self.store.has_channel().await?,
            video_count: self.store.count_videos().await?,
            playlist_count: self.store.count_playlists().await?,
            last_full_sync: self.store.last_successful_run(SyncKind::All).await?,
            running: self.is_running(),
            checked_at: now(),
        })
    }

    /// Human-readable one-line status.
    pub async fn status_line(&self) -> String {
        match self.status_report().await {
            Ok(report) => report.summary_line(),
            Err(err) => format!("Error checking sync status: {err}"),
        }
    }
}
