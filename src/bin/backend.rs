#![forbid(unsafe_code)]

//! Long-running process: keeps the local mirror in sync on a schedule and
//! serves the stored channel data as a small JSON API.
//!
//! Read endpoints only touch the database. The platform is contacted by the
//! scheduler, by `POST /api/sync` and by the reachability probe behind
//! `/api/status`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use channelsite::config::{SettingsOverrides, resolve_settings};
use channelsite::error::SyncError;
use channelsite::logging::{LogFormat, init_tracing};
use channelsite::models::{ChannelSnapshot, PlaylistRecord, SyncRun, VideoRecord};
use channelsite::scheduler::SyncScheduler;
use channelsite::store::{DEFAULT_PAGE_SIZE, Page, SiteStore, VideoQuery, VideoSort};
use channelsite::sync::{SyncService, SyncStatusReport};
use channelsite::youtube::YouTubeClient;
use clap::Parser;
use serde::Deserialize;
use tokio::{signal, sync::watch};
use tracing::{error, info, warn};

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Parser)]
#[command(name = "backend")]
#[command(about = "Channel mirror: scheduled sync plus JSON API", version)]
struct BackendArgs {
    /// `.env` file to read settings from.
    #[arg(long)]
    env_file: Option<PathBuf>,
    #[arg(long)]
    database: Option<PathBuf>,
    #[arg(long)]
    channel_id: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// `text` or `json`.
    #[arg(long)]
    log_format: Option<LogFormat>,
    /// Serve the API without the timer-driven sync.
    #[arg(long)]
    no_scheduler: bool,
}

impl BackendArgs {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            env_path: self.env_file.clone(),
            database_path: self.database.clone(),
            channel_id: self.channel_id.clone(),
            host: self.host.clone(),
            port: self.port,
            log_format: self.log_format,
        }
    }
}

#[derive(Clone)]
struct AppState {
    service: Arc<SyncService>,
}

impl AppState {
    fn store(&self) -> &SiteStore {
        self.service.store()
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::AlreadyRunning => Self {
                status: StatusCode::CONFLICT,
                message: err.to_string(),
            },
            other => Self::internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Logs the database error and hides its details from the client.
fn storage_error(context: &str, err: anyhow::Error) -> ApiError {
    error!(error = format!("{err:#}"), "{context}");
    ApiError::internal(context.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    let settings = resolve_settings(args.overrides())?;
    init_tracing(settings.log_format);
    info!(?settings, "starting backend");

    let store = SiteStore::open(&settings.database_path)
        .await
        .context("opening site database")?;
    let source = Arc::new(YouTubeClient::new(settings.youtube()));
    info!(channel_id = source.channel_id(), "mirroring channel");
    let service = Arc::new(SyncService::new(store, source, settings.sync_options()));

    let (stop, shutdown) = watch::channel(false);
    let scheduler = if args.no_scheduler {
        warn!("scheduler disabled; syncs only run through POST /api/sync");
        None
    } else {
        Some(SyncScheduler::new(service.clone(), settings.schedule()).spawn(shutdown))
    };

    let app = router(AppState { service });

    let addr = settings.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    // A run in progress finishes before the scheduler task returns.
    let _ = stop.send(true);
    if let Some(handle) = scheduler
        && let Err(err) = handle.await
    {
        warn!(error = %err, "scheduler task ended abnormally");
    }
    info!("backend stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/status/text", get(status_text))
        .route("/api/sync", post(trigger_sync))
        .route("/api/sync/history", get(sync_history))
        .route("/api/channel", get(channel))
        .route("/api/videos", get(list_videos))
        .route("/api/videos/{id}", get(get_video))
        .route("/api/playlists", get(list_playlists))
        .route("/api/playlists/{id}", get(get_playlist))
        .fallback(|| async { ApiError::not_found("endpoint not found") })
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutdown requested");
}

async fn status(State(state): State<AppState>) -> ApiResult<Json<SyncStatusReport>> {
    Ok(Json(state.service.status_report().await?))
}

async fn status_text(State(state): State<AppState>) -> String {
    state.service.status_line().await
}

async fn trigger_sync(State(state): State<AppState>) -> ApiResult<Json<SyncRun>> {
    let run = state.service.trigger_full_sync().await?;
    Ok(Json(run))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

async fn sync_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Vec<SyncRun>>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let runs = state
        .store()
        .recent_runs(limit)
        .await
        .map_err(|err| storage_error("failed to load sync history", err))?;
    Ok(Json(runs))
}

async fn channel(State(state): State<AppState>) -> ApiResult<Json<ChannelSnapshot>> {
    state
        .store()
        .channel()
        .await
        .map_err(|err| storage_error("failed to load channel", err))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("channel has not been synced yet"))
}

/// Query string of `GET /api/videos`. `page` is zero-based, `dir` is `asc`
/// or `desc`, `q` searches titles.
#[derive(Debug, Default, Deserialize)]
struct VideoListParams {
    page: Option<usize>,
    size: Option<usize>,
    sort: Option<String>,
    dir: Option<String>,
    q: Option<String>,
}

impl VideoListParams {
    fn into_query(self) -> ApiResult<VideoQuery> {
        let sort = match self.sort.as_deref() {
            Some(raw) => raw
                .parse::<VideoSort>()
                .map_err(|err| ApiError::bad_request(err.to_string()))?,
            None => VideoSort::default(),
        };
        let descending = match self.dir.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("desc") => true,
            Some("asc") => false,
            Some(other) => {
                return Err(ApiError::bad_request(format!(
                    "unsupported sort direction: {other}"
                )));
            }
        };
        Ok(VideoQuery {
            page: self.page.unwrap_or(0),
            size: self.size.unwrap_or(DEFAULT_PAGE_SIZE),
            sort,
            descending,
            search: self.q,
        })
    }
}

async fn list_videos(
    State(state): State<AppState>,
    Query(params): Query<VideoListParams>,
) -> ApiResult<Json<Page<VideoRecord>>> {
    let query = params.into_query()?;
    let page = state
        .store()
        .list_videos(&query)
        .await
        .map_err(|err| storage_error("failed to list videos", err))?;
    Ok(Json(page))
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<VideoRecord>> {
    state
        .store()
        .get_video(&id)
        .await
        .map_err(|err| storage_error("failed to load video", err))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("video {id} not found")))
}

async fn list_playlists(State(state): State<AppState>) -> ApiResult<Json<Vec<PlaylistRecord>>> {
    let playlists = state
        .store()
        .list_playlists()
        .await
        .map_err(|err| storage_error("failed to list playlists", err))?;
    Ok(Json(playlists))
}

async fn get_playlist(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<PlaylistRecord>> {
    state
        .store()
        .get_playlist(&id)
        .await
        .map_err(|err| storage_error("failed to load playlist", err))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("playlist {id} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use channelsite::error::SourceError;
    use channelsite::models::SyncStatus;
    use channelsite::payload::{ListResponse, RawChannel, RawPlaylist, RawPlaylistItem, RawVideo};
    use channelsite::source::ChannelSource;
    use channelsite::sync::SyncOptions;
    use tempfile::TempDir;

    /// A platform that cannot be reached.
    struct OfflineSource;

    fn offline<T>() -> Result<T, SourceError> {
        Err(SourceError::Transport("connection refused".into()))
    }

    impl ChannelSource for OfflineSource {
        fn channel(&self) -> Result<Option<RawChannel>, SourceError> {
            offline()
        }

        fn video_page(&self, _: Option<&str>) -> Result<ListResponse<RawVideo>, SourceError> {
            offline()
        }

        fn playlist_page(&self, _: Option<&str>) -> Result<ListResponse<RawPlaylist>, SourceError> {
            offline()
        }

        fn playlist_items_page(
            &self,
            _: &str,
            _: Option<&str>,
        ) -> Result<ListResponse<RawPlaylistItem>, SourceError> {
            offline()
        }

        fn video_details(&self, _: &[&str]) -> Result<Vec<RawVideo>, SourceError> {
            offline()
        }
    }

    async fn create_state() -> Result<(TempDir, AppState)> {
        let dir = tempfile::tempdir()?;
        let store = SiteStore::open(&dir.path().join("api.db")).await?;
        let service = SyncService::new(store, Arc::new(OfflineSource), SyncOptions::default());
        Ok((
            dir,
            AppState {
                service: Arc::new(service),
            },
        ))
    }

    fn sample_video(id: &str, title: &str) -> VideoRecord {
        VideoRecord {
            video_id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            published_at: None,
            duration: "0:00".to_string(),
            view_count: Some(1),
            like_count: None,
            comment_count: None,
            thumbnail_url: None,
            channel_id: Some("UC1".to_string()),
            category_id: None,
            tags: None,
            is_latest: false,
            is_popular: false,
            refreshed_at: chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
                .and_then(|day| day.and_hms_opt(0, 0, 0))
                .unwrap(),
        }
    }

    #[test]
    fn args_map_onto_overrides() {
        let args = BackendArgs::try_parse_from([
            "backend",
            "--database",
            "/tmp/site.db",
            "--port",
            "9000",
            "--log-format",
            "json",
        ])
        .unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.database_path, Some(PathBuf::from("/tmp/site.db")));
        assert_eq!(overrides.port, Some(9000));
        assert_eq!(overrides.log_format, Some(LogFormat::Json));
        assert!(!args.no_scheduler);
    }

    #[test]
    fn args_reject_bad_values() {
        assert!(BackendArgs::try_parse_from(["backend", "--port", "http"]).is_err());
        assert!(BackendArgs::try_parse_from(["backend", "--log-format", "xml"]).is_err());
    }

    #[test]
    fn video_params_default_to_newest_first() {
        let query = VideoListParams::default().into_query().unwrap();
        assert_eq!(query, VideoQuery::default());
    }

    #[test]
    fn video_params_validate_sort_and_direction() {
        let query = VideoListParams {
            sort: Some("views".into()),
            dir: Some("ASC".into()),
            page: Some(2),
            ..VideoListParams::default()
        }
        .into_query()
        .unwrap();
        assert_eq!(query.sort, VideoSort::ViewCount);
        assert!(!query.descending);
        assert_eq!(query.page, 2);

        let err = VideoListParams {
            sort: Some("colour".into()),
            ..VideoListParams::default()
        }
        .into_query()
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = VideoListParams {
            dir: Some("sideways".into()),
            ..VideoListParams::default()
        }
        .into_query()
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn busy_guard_maps_to_conflict() {
        assert_eq!(ApiError::from(SyncError::AlreadyRunning).status, StatusCode::CONFLICT);
        assert_eq!(
            ApiError::from(SyncError::RunFailed("boom".into())).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn lookups_return_not_found_for_missing_rows() -> Result<()> {
        let (_dir, state) = create_state().await?;
        let err = get_video(State(state.clone()), AxumPath("ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = get_playlist(State(state.clone()), AxumPath("ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = channel(State(state)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn video_listing_reads_the_store() -> Result<()> {
        let (_dir, state) = create_state().await?;
        state.store().insert_video(&sample_video("v1", "Rust Tutorial")).await?;
        state.store().insert_video(&sample_video("v2", "Vlog")).await?;

        let Json(page) = list_videos(
            State(state.clone()),
            Query(VideoListParams {
                q: Some("rust".into()),
                ..VideoListParams::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(page.total_items, 1);
        assert_eq!(page.items[0].video_id, "v1");

        let Json(video) = get_video(State(state), AxumPath("v2".into())).await.unwrap();
        assert_eq!(video.title, "Vlog");
        Ok(())
    }

    #[tokio::test]
    async fn status_reports_an_unreachable_source() -> Result<()> {
        let (_dir, state) = create_state().await?;
        let Json(report) = status(State(state.clone())).await.unwrap();
        assert!(!report.source_reachable);
        assert!(!report.has_channel);
        assert_eq!(report.video_count, 0);

        let line = status_text(State(state)).await;
        assert!(line.starts_with("API Connected: ✗ | Channel Data: ✗"), "{line}");
        Ok(())
    }

    #[tokio::test]
    async fn manual_sync_is_recorded_in_history() -> Result<()> {
        let (_dir, state) = create_state().await?;
        // Every fetch fails, so both content phases hit the empty guard.
        let Json(run) = trigger_sync(State(state.clone())).await.unwrap();
        assert_eq!(run.status, SyncStatus::Partial);

        let Json(history) = sync_history(
            State(state),
            Query(HistoryParams { limit: Some(5) }),
        )
        .await
        .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, run.id);
        Ok(())
    }
}
