//! Raw response shapes of the video platform API.
//!
//! Every field is optional: the API omits parts that were not requested,
//! hides statistics on some videos and returns ids in more than one shape.
//! Turning these into canonical records is the normalizer's job.

use serde::Deserialize;

/// One page of any list endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

impl<T> Default for ListResponse<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            next_page_token: None,
        }
    }
}

/// The `id` field of a video item. Search results nest it as
/// `{"kind": "...", "videoId": "..."}` while direct lookups return a string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Plain(String),
    Nested {
        #[serde(rename = "videoId")]
        video_id: Option<String>,
    },
    Other(serde_json::Value),
}

impl RawId {
    /// Single flat id, or `None` when the shape carries no usable id.
    pub fn flatten(&self) -> Option<&str> {
        let id = match self {
            RawId::Plain(id) => id.as_str(),
            RawId::Nested { video_id } => video_id.as_deref()?,
            RawId::Other(_) => return None,
        };
        let id = id.trim();
        if id.is_empty() { None } else { Some(id) }
    }
}

/// Counters are documented as strings but we accept bare numbers as well.
/// Any other shape lands in `Other` so one odd field never fails the page.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawCount {
    Number(i64),
    Text(String),
    Other(serde_json::Value),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawThumbnail {
    pub url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawThumbnails {
    #[serde(rename = "default")]
    pub default_res: Option<RawThumbnail>,
    pub medium: Option<RawThumbnail>,
    pub high: Option<RawThumbnail>,
}

/// Snippet part shared by channels, videos and playlists.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSnippet {
    pub title: Option<String>,
    pub description: Option<String>,
    pub published_at: Option<String>,
    pub channel_id: Option<String>,
    pub channel_title: Option<String>,
    pub category_id: Option<String>,
    pub tags: Option<Vec<String>>,
    pub thumbnails: Option<RawThumbnails>,
    pub custom_url: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawVideoStatistics {
    pub view_count: Option<RawCount>,
    pub like_count: Option<RawCount>,
    pub comment_count: Option<RawCount>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawVideoContentDetails {
    pub duration: Option<String>,
}

/// Video stub from the search listing, or a full record from the detail
/// lookup once statistics and content details are attached.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawVideo {
    pub id: Option<RawId>,
    pub snippet: Option<RawSnippet>,
    pub statistics: Option<RawVideoStatistics>,
    pub content_details: Option<RawVideoContentDetails>,
}

impl RawVideo {
    pub fn video_id(&self) -> Option<&str> {
        self.id.as_ref().and_then(RawId::flatten)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlaylistContentDetails {
    pub item_count: Option<RawCount>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlaylistStatus {
    pub privacy_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlaylist {
    pub id: Option<String>,
    pub snippet: Option<RawSnippet>,
    pub content_details: Option<RawPlaylistContentDetails>,
    pub status: Option<RawPlaylistStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlaylistItemDetails {
    pub video_id: Option<String>,
}

/// Entry of the playlist-items listing; only the member video id is used.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlaylistItem {
    pub content_details: Option<RawPlaylistItemDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChannelStatistics {
    pub view_count: Option<RawCount>,
    pub subscriber_count: Option<RawCount>,
    pub video_count: Option<RawCount>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawChannel {
    pub id: Option<String>,
    pub snippet: Option<RawSnippet>,
    pub statistics: Option<RawChannelStatistics>,
}

/// A playlist together with its ordered member ids, as fetched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaylistBundle {
    pub playlist: RawPlaylist,
    pub video_ids: Vec<String>,
}
