#![forbid(unsafe_code)]

//! One-shot sync for cron-style use. Runs a single recorded sync run, or
//! prints the status line with `--status`, then exits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use channelsite::config::{SettingsOverrides, resolve_settings};
use channelsite::logging::{LogFormat, init_tracing};
use channelsite::models::{SyncKind, SyncStatus};
use channelsite::store::SiteStore;
use channelsite::sync::SyncService;
use channelsite::youtube::YouTubeClient;
use clap::{Parser, ValueEnum};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    All,
    Channel,
    Videos,
    Playlists,
}

impl From<KindArg> for SyncKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::All => SyncKind::All,
            KindArg::Channel => SyncKind::ChannelStats,
            KindArg::Videos => SyncKind::Videos,
            KindArg::Playlists => SyncKind::Playlists,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "routine_sync")]
#[command(about = "Run one channel sync and exit", version)]
struct RoutineArgs {
    #[arg(long, value_enum, default_value_t = KindArg::All)]
    kind: KindArg,
    /// Print the status line instead of syncing.
    #[arg(long, conflicts_with = "kind")]
    status: bool,
    #[arg(long)]
    env_file: Option<PathBuf>,
    #[arg(long)]
    database: Option<PathBuf>,
    #[arg(long)]
    channel_id: Option<String>,
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl RoutineArgs {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            env_path: self.env_file.clone(),
            database_path: self.database.clone(),
            channel_id: self.channel_id.clone(),
            log_format: self.log_format,
            ..SettingsOverrides::default()
        }
    }
}

/// `FAILED`, or a run that never left `IN_PROGRESS`, fails the command.
fn is_failure(status: SyncStatus) -> bool {
    matches!(status, SyncStatus::Failed | SyncStatus::InProgress)
}

async fn run(args: RoutineArgs) -> Result<ExitCode> {
    let settings = resolve_settings(args.overrides())?;
    init_tracing(settings.log_format);

    let store = SiteStore::open(&settings.database_path)
        .await
        .context("opening site database")?;
    let source = Arc::new(YouTubeClient::new(settings.youtube()));
    let service = SyncService::new(store, source, settings.sync_options());

    if args.status {
        println!("{}", service.status_line().await);
        return Ok(ExitCode::SUCCESS);
    }

    let run = service
        .run(args.kind.into())
        .await
        .context("starting sync run")?;
    println!(
        "{} run {}: {} ({} records, {}s)",
        run.kind, run.id, run.status, run.records_touched, run.elapsed_seconds
    );
    if let Some(message) = &run.error_message {
        println!("  {message}");
    }
    if is_failure(run.status) {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(RoutineArgs::parse()).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = format!("{err:#}"), "routine sync failed");
            eprintln!("routine_sync: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_defaults_to_full_sync() {
        let args = RoutineArgs::try_parse_from(["routine_sync"]).unwrap();
        assert_eq!(args.kind, KindArg::All);
        assert!(!args.status);
    }

    #[test]
    fn kind_names_map_to_sync_kinds() {
        let args = RoutineArgs::try_parse_from(["routine_sync", "--kind", "channel"]).unwrap();
        assert_eq!(SyncKind::from(args.kind), SyncKind::ChannelStats);
        let args = RoutineArgs::try_parse_from(["routine_sync", "--kind", "playlists"]).unwrap();
        assert_eq!(SyncKind::from(args.kind), SyncKind::Playlists);
        assert!(RoutineArgs::try_parse_from(["routine_sync", "--kind", "shorts"]).is_err());
    }

    #[test]
    fn status_cannot_be_combined_with_kind() {
        assert!(
            RoutineArgs::try_parse_from(["routine_sync", "--status", "--kind", "videos"]).is_err()
        );
        let args = RoutineArgs::try_parse_from(["routine_sync", "--status"]).unwrap();
        assert!(args.status);
    }

    #[test]
    fn overrides_leave_bind_settings_alone() {
        let args = RoutineArgs::try_parse_from([
            "routine_sync",
            "--database",
            "/tmp/site.db",
            "--channel-id",
            "UC9",
        ])
        .unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.database_path, Some(PathBuf::from("/tmp/site.db")));
        assert_eq!(overrides.channel_id.as_deref(), Some("UC9"));
        assert!(overrides.host.is_none());
        assert!(overrides.port.is_none());
    }

    #[test]
    fn only_failed_or_unfinished_runs_fail_the_command() {
        assert!(!is_failure(SyncStatus::Success));
        assert!(!is_failure(SyncStatus::Partial));
        assert!(is_failure(SyncStatus::Failed));
        assert!(is_failure(SyncStatus::InProgress));
    }
}
