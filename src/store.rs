//! Persistence layer: the channel snapshot, videos, playlists with their
//! ordered members, and the append-only sync history, all in one embedded
//! SQLite-compatible database.
//!
//! Timestamps are stored as `YYYY-MM-DDTHH:MM:SS` text so they sort
//! lexicographically in SQL.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDateTime;
use libsql::{Builder, Connection, Row, params};
use serde::Serialize;
use tracing::debug;

use crate::models::{ChannelSnapshot, PlaylistRecord, SyncKind, SyncRun, SyncStatus, VideoRecord};
use crate::reconcile::EntityStore;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
pub const DEFAULT_PAGE_SIZE: usize = 12;
pub const MAX_PAGE_SIZE: usize = 100;

const VIDEO_COLUMNS: &str = "video_id, title, description, published_at, duration, view_count, \
    like_count, comment_count, thumbnail_url, channel_id, category_id, tags, is_latest, \
    is_popular, refreshed_at";

const PLAYLIST_COLUMNS: &str = "playlist_id, title, description, published_at, channel_id, \
    thumbnail_url, item_count, privacy_status, refreshed_at";

const RUN_COLUMNS: &str =
    "id, kind, started_at, status, records_touched, elapsed_seconds, error_message";

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS channel_snapshot (
            channel_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT DEFAULT '',
            subscriber_count INTEGER,
            video_count INTEGER,
            view_count INTEGER,
            published_at TEXT,
            country TEXT,
            custom_url TEXT,
            thumbnail_url TEXT,
            refreshed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS videos (
            video_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT DEFAULT '',
            published_at TEXT,
            duration TEXT NOT NULL DEFAULT '0:00',
            view_count INTEGER,
            like_count INTEGER,
            comment_count INTEGER,
            thumbnail_url TEXT,
            channel_id TEXT,
            category_id TEXT,
            tags TEXT,
            is_latest INTEGER NOT NULL DEFAULT 0,
            is_popular INTEGER NOT NULL DEFAULT 0,
            refreshed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS playlists (
            playlist_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT DEFAULT '',
            published_at TEXT,
            channel_id TEXT,
            thumbnail_url TEXT,
            item_count INTEGER,
            privacy_status TEXT,
            refreshed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS playlist_videos (
            playlist_id TEXT NOT NULL REFERENCES playlists(playlist_id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            video_id TEXT NOT NULL,
            PRIMARY KEY (playlist_id, position)
        );

        CREATE TABLE IF NOT EXISTS sync_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            started_at TEXT NOT NULL,
            status TEXT NOT NULL,
            records_touched INTEGER NOT NULL DEFAULT 0,
            elapsed_seconds INTEGER NOT NULL DEFAULT 0,
            error_message TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_videos_published ON videos(published_at);
        CREATE INDEX IF NOT EXISTS idx_sync_runs_kind_status ON sync_runs(kind, status);
        "#,
    )
    .await?;
    Ok(())
}

pub fn format_timestamp(value: &NaiveDateTime) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_stored_timestamp(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .with_context(|| format!("parsing stored timestamp {value:?}"))
}

fn parse_optional_timestamp(value: Option<String>) -> Result<Option<NaiveDateTime>> {
    value.as_deref().map(parse_stored_timestamp).transpose()
}

/// Columns the video listing can be ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoSort {
    #[default]
    PublishedAt,
    ViewCount,
    LikeCount,
    Title,
}

impl VideoSort {
    fn column(self) -> &'static str {
        match self {
            VideoSort::PublishedAt => "published_at",
            VideoSort::ViewCount => "view_count",
            VideoSort::LikeCount => "like_count",
            VideoSort::Title => "title",
        }
    }

    fn collation(self) -> &'static str {
        match self {
            VideoSort::Title => " COLLATE NOCASE",
            _ => "",
        }
    }
}

impl FromStr for VideoSort {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "published" | "published_at" | "publishedat" | "date" => Ok(VideoSort::PublishedAt),
            "views" | "view_count" | "viewcount" => Ok(VideoSort::ViewCount),
            "likes" | "like_count" | "likecount" => Ok(VideoSort::LikeCount),
            "title" => Ok(VideoSort::Title),
            other => bail!("unsupported sort field: {other}"),
        }
    }
}

/// Paging, ordering and search for [`SiteStore::list_videos`]. Pages are
/// zero-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoQuery {
    pub page: usize,
    pub size: usize,
    pub sort: VideoSort,
    pub descending: bool,
    pub search: Option<String>,
}

impl Default for VideoQuery {
    fn default() -> Self {
        Self {
            page: 0,
            size: DEFAULT_PAGE_SIZE,
            sort: VideoSort::PublishedAt,
            descending: true,
            search: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub size: usize,
    pub total_items: i64,
    pub total_pages: i64,
}

/// `%term%` with LIKE wildcards in the term escaped.
fn like_pattern(term: &str) -> Option<String> {
    let term = term.trim();
    if term.is_empty() {
        return None;
    }
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for ch in term.to_lowercase().chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    Some(pattern)
}

/// Wrapper around the SQLite-compatible connection used by the sync pipeline
/// and the API.
#[derive(Clone)]
pub struct SiteStore {
    conn: Connection,
}

impl std::fmt::Debug for SiteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteStore").finish_non_exhaustive()
    }
}

impl SiteStore {
    /// Opens (and if necessary creates) the database and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening database {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    async fn count(&self, sql: &str) -> Result<i64> {
        let mut rows = self.conn.query(sql, params![]).await?;
        let row = rows.next().await?.context("missing count row")?;
        Ok(row.get::<i64>(0)?)
    }

    // --- channel -------------------------------------------------------

    /// Replaces the stored snapshot. Only the latest snapshot is kept.
    pub async fn replace_channel(&self, snapshot: &ChannelSnapshot) -> Result<()> {
        let tx = self.conn.transaction().await?;
        tx.execute("DELETE FROM channel_snapshot", params![]).await?;
        tx.execute(
            r#"
            INSERT INTO channel_snapshot (
                channel_id, title, description, subscriber_count, video_count,
                view_count, published_at, country, custom_url, thumbnail_url,
                refreshed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                snapshot.channel_id.as_str(),
                snapshot.title.as_str(),
                snapshot.description.as_str(),
                snapshot.subscriber_count,
                snapshot.video_count,
                snapshot.view_count,
                snapshot.published_at.as_ref().map(format_timestamp),
                snapshot.country.as_deref(),
                snapshot.custom_url.as_deref(),
                snapshot.thumbnail_url.as_deref(),
                format_timestamp(&snapshot.refreshed_at),
            ],
        )
        .await
        .with_context(|| format!("storing channel {}", snapshot.channel_id))?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn channel(&self) -> Result<Option<ChannelSnapshot>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT channel_id, title, description, subscriber_count, video_count,
                       view_count, published_at, country, custom_url, thumbnail_url,
                       refreshed_at
                FROM channel_snapshot
                ORDER BY refreshed_at DESC
                LIMIT 1
                "#,
                params![],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let refreshed_at: String = row.get(10)?;
        Ok(Some(ChannelSnapshot {
            channel_id: row.get(0)?,
            title: row.get(1)?,
            description: row.get::<Option<String>>(2)?.unwrap_or_default(),
            subscriber_count: row.get(3)?,
            video_count: row.get(4)?,
            view_count: row.get(5)?,
            published_at: parse_optional_timestamp(row.get(6)?)?,
            country: row.get(7)?,
            custom_url: row.get(8)?,
            thumbnail_url: row.get(9)?,
            refreshed_at: parse_stored_timestamp(&refreshed_at)?,
        }))
    }

    pub async fn has_channel(&self) -> Result<bool> {
        Ok(self.count("SELECT COUNT(*) FROM channel_snapshot").await? > 0)
    }

    // --- videos --------------------------------------------------------

    pub async fn video_ids(&self) -> Result<BTreeSet<String>> {
        let mut rows = self
            .conn
            .query("SELECT video_id FROM videos", params![])
            .await?;
        let mut ids = BTreeSet::new();
        while let Some(row) = rows.next().await? {
            ids.insert(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    /// Fails when the id is already stored.
    pub async fn insert_video(&self, record: &VideoRecord) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO videos ({VIDEO_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    record.video_id.as_str(),
                    record.title.as_str(),
                    record.description.as_str(),
                    record.published_at.as_ref().map(format_timestamp),
                    record.duration.as_str(),
                    record.view_count,
                    record.like_count,
                    record.comment_count,
                    record.thumbnail_url.as_deref(),
                    record.channel_id.as_deref(),
                    record.category_id.as_deref(),
                    record.tags.as_deref(),
                    record.is_latest as i64,
                    record.is_popular as i64,
                    format_timestamp(&record.refreshed_at),
                ],
            )
            .await
            .with_context(|| format!("inserting video {}", record.video_id))?;
        Ok(())
    }

    /// Overwrites the platform-owned columns of an existing video. The
    /// highlight flags belong to [`SiteStore::refresh_highlights`] and are
    /// left alone.
    pub async fn update_video(&self, record: &VideoRecord) -> Result<()> {
        let changed = self
            .conn
            .execute(
                r#"
                UPDATE videos SET
                    title = ?2,
                    description = ?3,
                    published_at = ?4,
                    duration = ?5,
                    view_count = ?6,
                    like_count = ?7,
                    comment_count = ?8,
                    thumbnail_url = ?9,
                    channel_id = ?10,
                    category_id = ?11,
                    tags = ?12,
                    refreshed_at = ?13
                WHERE video_id = ?1
                "#,
                params![
                    record.video_id.as_str(),
                    record.title.as_str(),
                    record.description.as_str(),
                    record.published_at.as_ref().map(format_timestamp),
                    record.duration.as_str(),
                    record.view_count,
                    record.like_count,
                    record.comment_count,
                    record.thumbnail_url.as_deref(),
                    record.channel_id.as_deref(),
                    record.category_id.as_deref(),
                    record.tags.as_deref(),
                    format_timestamp(&record.refreshed_at),
                ],
            )
            .await
            .with_context(|| format!("updating video {}", record.video_id))?;
        if changed == 0 {
            bail!("no stored video {}", record.video_id);
        }
        Ok(())
    }

    pub async fn delete_video(&self, video_id: &str) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM videos WHERE video_id = ?1", params![video_id])
            .await
            .with_context(|| format!("deleting video {video_id}"))?;
        if removed == 0 {
            bail!("no stored video {video_id}");
        }
        Ok(())
    }

    pub async fn get_video(&self, video_id: &str) -> Result<Option<VideoRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE video_id = ?1"),
                params![video_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn count_videos(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM videos").await
    }

    /// One page of videos. Rows without a value in the sort column come last
    /// in either direction; ties fall back to the video id.
    pub async fn list_videos(&self, query: &VideoQuery) -> Result<Page<VideoRecord>> {
        let size = query.size.clamp(1, MAX_PAGE_SIZE);
        let pattern = query.search.as_deref().and_then(like_pattern);
        let direction = if query.descending { "DESC" } else { "ASC" };
        let column = query.sort.column();
        let collation = query.sort.collation();
        let filter = "(?1 IS NULL OR lower(title) LIKE ?1 ESCAPE '\\')";

        let mut rows = self
            .conn
            .query(
                &format!("SELECT COUNT(*) FROM videos WHERE {filter}"),
                params![pattern.as_deref()],
            )
            .await?;
        let total_items: i64 = rows
            .next()
            .await?
            .context("missing count row")?
            .get(0)?;

        let offset = query.page.saturating_mul(size);
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {VIDEO_COLUMNS} FROM videos WHERE {filter} \
                     ORDER BY {column} IS NULL, {column}{collation} {direction}, video_id ASC \
                     LIMIT ?2 OFFSET ?3"
                ),
                params![pattern.as_deref(), size as i64, offset as i64],
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_video(&row)?);
        }

        let size_i64 = size as i64;
        Ok(Page {
            items,
            page: query.page,
            size,
            total_items,
            total_pages: (total_items + size_i64 - 1) / size_i64,
        })
    }

    /// Recomputes the derived highlight flags: the `count` newest videos are
    /// marked latest, the `count` most viewed are marked popular, and every
    /// other video has both flags cleared.
    pub async fn refresh_highlights(&self, count: usize) -> Result<()> {
        let limit = count as i64;
        let tx = self.conn.transaction().await?;
        tx.execute("UPDATE videos SET is_latest = 0, is_popular = 0", params![])
            .await?;
        tx.execute(
            r#"
            UPDATE videos SET is_latest = 1
            WHERE video_id IN (
                SELECT video_id FROM videos
                ORDER BY published_at IS NULL, published_at DESC, video_id ASC
                LIMIT ?1
            )
            "#,
            params![limit],
        )
        .await?;
        tx.execute(
            r#"
            UPDATE videos SET is_popular = 1
            WHERE video_id IN (
                SELECT video_id FROM videos
                ORDER BY view_count IS NULL, view_count DESC, video_id ASC
                LIMIT ?1
            )
            "#,
            params![limit],
        )
        .await?;
        tx.commit().await.context("committing highlight flags")?;
        debug!(count, "highlight flags refreshed");
        Ok(())
    }

    // --- playlists -----------------------------------------------------

    pub async fn playlist_ids(&self) -> Result<BTreeSet<String>> {
        let mut rows = self
            .conn
            .query("SELECT playlist_id FROM playlists", params![])
            .await?;
        let mut ids = BTreeSet::new();
        while let Some(row) = rows.next().await? {
            ids.insert(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    /// Inserts the playlist row and its members in one transaction.
    pub async fn insert_playlist(&self, record: &PlaylistRecord) -> Result<()> {
        let tx = self.conn.transaction().await?;
        tx.execute(
            &format!(
                "INSERT INTO playlists ({PLAYLIST_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                record.playlist_id.as_str(),
                record.title.as_str(),
                record.description.as_str(),
                record.published_at.as_ref().map(format_timestamp),
                record.channel_id.as_deref(),
                record.thumbnail_url.as_deref(),
                record.item_count,
                record.privacy_status.as_deref(),
                format_timestamp(&record.refreshed_at),
            ],
        )
        .await
        .with_context(|| format!("inserting playlist {}", record.playlist_id))?;

        for (position, video_id) in record.video_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO playlist_videos (playlist_id, position, video_id) VALUES (?1, ?2, ?3)",
                params![record.playlist_id.as_str(), position as i64, video_id.as_str()],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Overwrites the playlist row and replaces its member list.
    pub async fn update_playlist(&self, record: &PlaylistRecord) -> Result<()> {
        let tx = self.conn.transaction().await?;
        let changed = tx
            .execute(
                r#"
                UPDATE playlists SET
                    title = ?2,
                    description = ?3,
                    published_at = ?4,
                    channel_id = ?5,
                    thumbnail_url = ?6,
                    item_count = ?7,
                    privacy_status = ?8,
                    refreshed_at = ?9
                WHERE playlist_id = ?1
                "#,
                params![
                    record.playlist_id.as_str(),
                    record.title.as_str(),
                    record.description.as_str(),
                    record.published_at.as_ref().map(format_timestamp),
                    record.channel_id.as_deref(),
                    record.thumbnail_url.as_deref(),
                    record.item_count,
                    record.privacy_status.as_deref(),
                    format_timestamp(&record.refreshed_at),
                ],
            )
            .await
            .with_context(|| format!("updating playlist {}", record.playlist_id))?;
        if changed == 0 {
            tx.rollback().await?;
            bail!("no stored playlist {}", record.playlist_id);
        }

        tx.execute(
            "DELETE FROM playlist_videos WHERE playlist_id = ?1",
            params![record.playlist_id.as_str()],
        )
        .await?;
        for (position, video_id) in record.video_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO playlist_videos (playlist_id, position, video_id) VALUES (?1, ?2, ?3)",
                params![record.playlist_id.as_str(), position as i64, video_id.as_str()],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Members are removed through the cascading foreign key.
    pub async fn delete_playlist(&self, playlist_id: &str) -> Result<()> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM playlists WHERE playlist_id = ?1",
                params![playlist_id],
            )
            .await
            .with_context(|| format!("deleting playlist {playlist_id}"))?;
        if removed == 0 {
            bail!("no stored playlist {playlist_id}");
        }
        Ok(())
    }

    async fn playlist_members(&self, playlist_id: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT video_id FROM playlist_videos WHERE playlist_id = ?1 ORDER BY position",
                params![playlist_id],
            )
            .await?;
        let mut members = Vec::new();
        while let Some(row) = rows.next().await? {
            members.push(row.get::<String>(0)?);
        }
        Ok(members)
    }

    pub async fn get_playlist(&self, playlist_id: &str) -> Result<Option<PlaylistRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {PLAYLIST_COLUMNS} FROM playlists WHERE playlist_id = ?1"),
                params![playlist_id],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let mut record = row_to_playlist(&row)?;
        record.video_ids = self.playlist_members(playlist_id).await?;
        Ok(Some(record))
    }

    /// Every playlist, newest first, with its members.
    pub async fn list_playlists(&self) -> Result<Vec<PlaylistRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {PLAYLIST_COLUMNS} FROM playlists \
                     ORDER BY published_at IS NULL, published_at DESC, playlist_id ASC"
                ),
                params![],
            )
            .await?;
        let mut playlists = Vec::new();
        while let Some(row) = rows.next().await? {
            playlists.push(row_to_playlist(&row)?);
        }

        let mut rows = self
            .conn
            .query(
                "SELECT playlist_id, video_id FROM playlist_videos ORDER BY playlist_id, position",
                params![],
            )
            .await?;
        let mut members: HashMap<String, Vec<String>> = HashMap::new();
        while let Some(row) = rows.next().await? {
            members
                .entry(row.get::<String>(0)?)
                .or_default()
                .push(row.get::<String>(1)?);
        }

        for playlist in &mut playlists {
            playlist.video_ids = members.remove(&playlist.playlist_id).unwrap_or_default();
        }
        Ok(playlists)
    }

    pub async fn count_playlists(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM playlists").await
    }

    // --- sync history --------------------------------------------------

    /// Appends an `IN_PROGRESS` row and returns it.
    pub async fn begin_run(&self, kind: SyncKind, started_at: NaiveDateTime) -> Result<SyncRun> {
        let mut rows = self
            .conn
            .query(
                "INSERT INTO sync_runs (kind, started_at, status) VALUES (?1, ?2, ?3) RETURNING id",
                params![
                    kind.as_str(),
                    format_timestamp(&started_at),
                    SyncStatus::InProgress.as_str(),
                ],
            )
            .await
            .with_context(|| format!("recording start of {kind} sync"))?;
        let id: i64 = rows
            .next()
            .await?
            .context("insert did not return the run id")?
            .get(0)?;
        Ok(SyncRun {
            id,
            kind,
            started_at,
            status: SyncStatus::InProgress,
            records_touched: 0,
            elapsed_seconds: 0,
            error_message: None,
        })
    }

    /// Moves an `IN_PROGRESS` run to its terminal status. A run can only be
    /// finished once.
    pub async fn finish_run(
        &self,
        id: i64,
        status: SyncStatus,
        records_touched: i64,
        elapsed_seconds: i64,
        error_message: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            bail!("cannot finish sync run {id} as {status}");
        }
        let changed = self
            .conn
            .execute(
                r#"
                UPDATE sync_runs
                SET status = ?2, records_touched = ?3, elapsed_seconds = ?4, error_message = ?5
                WHERE id = ?1 AND status = ?6
                "#,
                params![
                    id,
                    status.as_str(),
                    records_touched,
                    elapsed_seconds,
                    error_message,
                    SyncStatus::InProgress.as_str(),
                ],
            )
            .await
            .with_context(|| format!("finishing sync run {id}"))?;
        if changed == 0 {
            return Err(anyhow!("sync run {id} is not in progress"));
        }
        Ok(())
    }

    pub async fn get_run(&self, id: i64) -> Result<Option<SyncRun>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE id = ?1"),
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    /// Newest runs first.
    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM sync_runs ORDER BY id DESC LIMIT ?1"),
                params![limit as i64],
            )
            .await?;
        let mut runs = Vec::new();
        while let Some(row) = rows.next().await? {
            runs.push(row_to_run(&row)?);
        }
        Ok(runs)
    }

    /// The "last known good" run of a kind.
    pub async fn last_successful_run(&self, kind: SyncKind) -> Result<Option<SyncRun>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM sync_runs \
                     WHERE kind = ?1 AND status = ?2 ORDER BY id DESC LIMIT 1"
                ),
                params![kind.as_str(), SyncStatus::Success.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }
}

impl EntityStore<VideoRecord> for SiteStore {
    async fn local_ids(&self) -> Result<BTreeSet<String>> {
        self.video_ids().await
    }

    async fn fetch_by_id(&self, id: &str) -> Result<Option<VideoRecord>> {
        self.get_video(id).await
    }

    async fn insert(&self, record: &VideoRecord) -> Result<()> {
        self.insert_video(record).await
    }

    async fn update(&self, record: &VideoRecord) -> Result<()> {
        self.update_video(record).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.delete_video(id).await
    }
}

impl EntityStore<PlaylistRecord> for SiteStore {
    async fn local_ids(&self) -> Result<BTreeSet<String>> {
        self.playlist_ids().await
    }

    async fn fetch_by_id(&self, id: &str) -> Result<Option<PlaylistRecord>> {
        self.get_playlist(id).await
    }

    async fn insert(&self, record: &PlaylistRecord) -> Result<()> {
        self.insert_playlist(record).await
    }

    async fn update(&self, record: &PlaylistRecord) -> Result<()> {
        self.update_playlist(record).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.delete_playlist(id).await
    }
}

/// Column order must match `VIDEO_COLUMNS`.
fn row_to_video(row: &Row) -> Result<VideoRecord> {
    let refreshed_at: String = row.get(14)?;
    Ok(VideoRecord {
        video_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get::<Option<String>>(2)?.unwrap_or_default(),
        published_at: parse_optional_timestamp(row.get(3)?)?,
        duration: row.get(4)?,
        view_count: row.get(5)?,
        like_count: row.get(6)?,
        comment_count: row.get(7)?,
        thumbnail_url: row.get(8)?,
        channel_id: row.get(9)?,
        category_id: row.get(10)?,
        tags: row.get(11)?,
        is_latest: row.get::<i64>(12)? != 0,
        is_popular: row.get::<i64>(13)? != 0,
        refreshed_at: parse_stored_timestamp(&refreshed_at)?,
    })
}

/// Column order must match `PLAYLIST_COLUMNS`. Members are loaded separately.
fn row_to_playlist(row: &Row) -> Result<PlaylistRecord> {
    let refreshed_at: String = row.get(8)?;
    Ok(PlaylistRecord {
        playlist_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get::<Option<String>>(2)?.unwrap_or_default(),
        published_at: parse_optional_timestamp(row.get(3)?)?,
        channel_id: row.get(4)?,
        thumbnail_url: row.get(5)?,
        item_count: row.get(6)?,
        privacy_status: row.get(7)?,
        video_ids: Vec::new(),
        refreshed_at: parse_stored_timestamp(&refreshed_at)?,
    })
}

fn row_to_run(row: &Row) -> Result<SyncRun> {
    let kind: String = row.get(1)?;
    let started_at: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(SyncRun {
        id: row.get(0)?,
        kind: kind.parse()?,
        started_at: parse_stored_timestamp(&started_at)?,
        status: status.parse()?,
        records_touched: row.get(4)?,
        elapsed_seconds: row.get(5)?,
        error_message: row.get(6)?,
    })
}

#[cfg(test)]
impl SiteStore {
    /// Makes every insert of `video_id` abort, for exercising per-row
    /// failures.
    pub(crate) async fn reject_video_inserts(&self, video_id: &str) -> Result<()> {
        let name: String = video_id.chars().filter(char::is_ascii_alphanumeric).collect();
        let id = video_id.replace('\'', "''");
        self.conn
            .execute_batch(&format!(
                "CREATE TRIGGER IF NOT EXISTS reject_{name} BEFORE INSERT ON videos \
                 WHEN NEW.video_id = '{id}' \
                 BEGIN SELECT RAISE(ABORT, 'insert rejected'); END;"
            ))
            .await?;
        Ok(())
    }
}
