//! Canonical records. Everything past the normalizer works with these types
//! and never with the raw API payloads.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Latest known state of the mirrored channel. Only one snapshot is kept;
/// every successful channel sync replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriber_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<NaiveDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub refreshed_at: NaiveDateTime,
}

/// Rows stored in the `videos` table, keyed by the platform's video id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<NaiveDateTime>,
    /// Display form, e.g. `4:13` or `1:02:03`.
    pub duration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    /// Comma-joined tag list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(default)]
    pub is_latest: bool,
    #[serde(default)]
    pub is_popular: bool,
    pub refreshed_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistRecord {
    pub playlist_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<NaiveDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy_status: Option<String>,
    /// Member video ids in playlist order.
    #[serde(default)]
    pub video_ids: Vec<String>,
    pub refreshed_at: NaiveDateTime,
}

impl PlaylistRecord {
    pub fn is_public(&self) -> bool {
        self.privacy_status.as_deref() == Some("public")
    }
}

/// Which entity set a reconciliation pass works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Video,
    Playlist,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Video => "video",
            EntityKind::Playlist => "playlist",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncKind {
    ChannelStats,
    Videos,
    Playlists,
    All,
}

impl SyncKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncKind::ChannelStats => "CHANNEL_STATS",
            SyncKind::Videos => "VIDEOS",
            SyncKind::Playlists => "PLAYLISTS",
            SyncKind::All => "ALL",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "CHANNEL_STATS" => Ok(SyncKind::ChannelStats),
            "VIDEOS" => Ok(SyncKind::Videos),
            "PLAYLISTS" => Ok(SyncKind::Playlists),
            "ALL" => Ok(SyncKind::All),
            other => bail!("unknown sync kind: {other}"),
        }
    }
}

/// Lifecycle of a recorded run. `InProgress` moves to exactly one terminal
/// state and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    InProgress,
    Success,
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::InProgress => "IN_PROGRESS",
            SyncStatus::Success => "SUCCESS",
            SyncStatus::Partial => "PARTIAL",
            SyncStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SyncStatus::InProgress)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "IN_PROGRESS" => Ok(SyncStatus::InProgress),
            "SUCCESS" => Ok(SyncStatus::Success),
            "PARTIAL" => Ok(SyncStatus::Partial),
            "FAILED" => Ok(SyncStatus::Failed),
            other => bail!("unknown sync status: {other}"),
        }
    }
}

/// One row of the append-only sync history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub kind: SyncKind,
    pub started_at: NaiveDateTime,
    pub status: SyncStatus,
    pub records_touched: i64,
    pub elapsed_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_kind_round_trips_through_column_text() {
        for kind in [
            SyncKind::ChannelStats,
            SyncKind::Videos,
            SyncKind::Playlists,
            SyncKind::All,
        ] {
            assert_eq!(kind.as_str().parse::<SyncKind>().unwrap(), kind);
        }
        assert!("DAILY".parse::<SyncKind>().is_err());
    }

    #[test]
    fn only_in_progress_is_not_terminal() {
        assert!(!SyncStatus::InProgress.is_terminal());
        assert!(SyncStatus::Success.is_terminal());
        assert!(SyncStatus::Partial.is_terminal());
        assert!(SyncStatus::Failed.is_terminal());
        assert_eq!(
            serde_json::to_string(&SyncStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
    }
}
