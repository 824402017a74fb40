//! Timer-driven trigger for the sync service: a startup sync, full syncs at
//! fixed local hours and a periodic reachability probe.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::sync::SyncService;

pub const DEFAULT_SYNC_HOURS: [u32; 2] = [6, 18];

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Local hours (0-23) at which a full sync starts.
    pub sync_hours: Vec<u32>,
    pub initial_delay: Duration,
    pub health_check_interval: Duration,
}

/// First top of one of `hours` strictly after `now`. Hours that do not exist
/// on a given day (DST gaps) are skipped; `None` when `hours` holds no valid
/// hour.
pub fn next_run_after<Tz: TimeZone>(now: &DateTime<Tz>, hours: &[u32]) -> Option<DateTime<Tz>> {
    let mut hours: Vec<u32> = hours.iter().copied().filter(|hour| *hour < 24).collect();
    hours.sort_unstable();
    hours.dedup();

    let timezone = now.timezone();
    let today = now.date_naive();
    // Two days always contain the next slot unless a DST gap swallows it.
    for offset in 0..3 {
        let day = today.checked_add_days(Days::new(offset))?;
        for hour in &hours {
            let Some(time) = NaiveTime::from_hms_opt(*hour, 0, 0) else {
                continue;
            };
            let Some(candidate) = timezone
                .from_local_datetime(&day.and_time(time))
                .earliest()
            else {
                continue;
            };
            if candidate > *now {
                return Some(candidate);
            }
        }
    }
    None
}

pub struct SyncScheduler {
    service: Arc<SyncService>,
    config: ScheduleConfig,
}

impl SyncScheduler {
    pub fn new(service: Arc<SyncService>, config: ScheduleConfig) -> Self {
        Self { service, config }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Drives the timers until `shutdown` changes or its sender is dropped.
    /// Triggers are handled one at a time.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            hours = ?self.config.sync_hours,
            initial_delay_secs = self.config.initial_delay.as_secs(),
            health_check_secs = self.config.health_check_interval.as_secs(),
            "scheduler started"
        );

        let startup = tokio::time::sleep(self.config.initial_delay);
        tokio::pin!(startup);
        let mut startup_done = false;

        let interval = self.config.health_check_interval.max(Duration::from_secs(1));
        let mut health = tokio::time::interval_at(Instant::now() + interval, interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let now = Local::now();
            let next_sync = next_run_after(&now, &self.config.sync_hours);
            let wait = next_sync
                .as_ref()
                .map(|at| (at.clone() - now).to_std().unwrap_or_default());
            if let Some(at) = &next_sync {
                debug!(next_sync = %at, "waiting for next scheduled sync");
            }
            let scheduled = async {
                match wait {
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut startup, if !startup_done => {
                    startup_done = true;
                    self.startup_sync().await;
                }
                _ = scheduled => {
                    info!("scheduled full sync");
                    self.service.sync_all().await;
                }
                _ = health.tick() => {
                    self.health_check().await;
                }
                _ = shutdown.changed() => {
                    info!("scheduler stopping");
                    break;
                }
            }
        }
    }

    /// Full sync on an empty mirror, channel statistics otherwise.
    async fn startup_sync(&self) {
        match self.service.has_channel_data().await {
            Ok(true) => {
                info!("startup: channel data present, refreshing channel statistics");
                self.service.sync_channel_stats().await;
            }
            Ok(false) => {
                info!("startup: no channel data, running full sync");
                self.service.sync_all().await;
            }
            Err(err) => {
                warn!(error = %err, "startup: could not inspect stored data, running full sync");
                self.service.sync_all().await;
            }
        }
    }

    async fn health_check(&self) {
        if self.service.is_source_reachable().await {
            debug!("health check: source reachable");
        } else {
            warn!("health check: source unreachable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncKind;
    use crate::source::testing::{FakeSource, channel};
    use crate::store::SiteStore;
    use crate::sync::SyncOptions;
    use anyhow::Result;
    use chrono::{FixedOffset, Utc};
    use tempfile::tempdir;

    fn utc(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0).unwrap()
    }

    #[test]
    fn next_run_is_the_next_configured_hour_today() {
        assert_eq!(next_run_after(&utc(9, 5, 30), &[6, 18]), Some(utc(9, 6, 0)));
        assert_eq!(next_run_after(&utc(9, 7, 0), &[6, 18]), Some(utc(9, 18, 0)));
    }

    #[test]
    fn next_run_is_strictly_after_now() {
        assert_eq!(next_run_after(&utc(9, 6, 0), &[6, 18]), Some(utc(9, 18, 0)));
    }

    #[test]
    fn next_run_rolls_over_to_tomorrow() {
        assert_eq!(next_run_after(&utc(9, 19, 0), &[6, 18]), Some(utc(10, 6, 0)));
        assert_eq!(next_run_after(&utc(31, 23, 0), &[0]), Some(utc(1, 0, 0) + chrono::Months::new(1)));
    }

    #[test]
    fn hours_are_sorted_deduplicated_and_validated() {
        assert_eq!(next_run_after(&utc(9, 7, 0), &[18, 6, 6, 99]), Some(utc(9, 18, 0)));
        assert_eq!(next_run_after(&utc(9, 7, 0), &[]), None);
        assert_eq!(next_run_after(&utc(9, 7, 0), &[24]), None);
    }

    #[test]
    fn next_run_uses_the_local_offset() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = offset.with_ymd_and_hms(2024, 3, 9, 5, 0, 0).unwrap();
        let next = next_run_after(&now, &[6]).unwrap();
        assert_eq!(next.naive_local().to_string(), "2024-03-09 06:00:00");
        assert_eq!(next.with_timezone(&Utc), utc(9, 4, 0));
    }

    async fn wait_for_run(store: &SiteStore) -> Result<SyncKind> {
        for _ in 0..200 {
            if let Some(run) = store.recent_runs(1).await?.into_iter().next()
                && run.status.is_terminal()
            {
                return Ok(run.kind);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        anyhow::bail!("scheduler never completed a run")
    }

    fn quick_config() -> ScheduleConfig {
        ScheduleConfig {
            sync_hours: Vec::new(),
            initial_delay: Duration::from_millis(10),
            health_check_interval: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn startup_runs_full_sync_on_empty_mirror_then_stops() -> Result<()> {
        let dir = tempdir()?;
        let store = SiteStore::open(&dir.path().join("s.db")).await?;
        let mut source = FakeSource::with_videos(&["v1"]);
        source.channel = Some(channel("UC1"));
        let service = Arc::new(SyncService::new(
            store.clone(),
            Arc::new(source),
            SyncOptions::default(),
        ));

        let (stop, shutdown) = watch::channel(false);
        let handle = SyncScheduler::new(service, quick_config()).spawn(shutdown);

        assert_eq!(wait_for_run(&store).await?, SyncKind::All);
        stop.send(true)?;
        handle.await?;
        assert_eq!(store.count_videos().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn startup_refreshes_channel_only_when_data_exists() -> Result<()> {
        let dir = tempdir()?;
        let store = SiteStore::open(&dir.path().join("s.db")).await?;
        let mut source = FakeSource::with_videos(&["v1"]);
        source.channel = Some(channel("UC1"));
        let service = Arc::new(SyncService::new(
            store.clone(),
            Arc::new(source),
            SyncOptions::default(),
        ));
        assert!(service.sync_channel_stats().await);
        let seeded = store.recent_runs(1).await?[0].id;

        let (stop, shutdown) = watch::channel(false);
        let handle = SyncScheduler::new(service, quick_config()).spawn(shutdown);

        for _ in 0..200 {
            if store.recent_runs(1).await?[0].id != seeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(wait_for_run(&store).await?, SyncKind::ChannelStats);
        drop(stop);
        handle.await?;
        assert_eq!(store.count_videos().await?, 0, "no content sync at startup");
        Ok(())
    }
}
