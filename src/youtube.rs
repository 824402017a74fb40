//! Blocking HTTP client for the YouTube Data API v3.
//!
//! Every request carries the API key as a query parameter. The key is never
//! logged and is scrubbed from transport error messages.

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::SourceError;
use crate::payload::{ListResponse, RawChannel, RawPlaylist, RawPlaylistItem, RawVideo};
use crate::source::{ChannelSource, MAX_DETAIL_BATCH};

pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";
const PAGE_SIZE: &str = "50";

#[derive(Clone)]
pub struct YouTubeConfig {
    pub base_url: String,
    pub api_key: String,
    pub channel_id: String,
    pub timeout: Duration,
}

impl fmt::Debug for YouTubeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YouTubeConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("channel_id", &self.channel_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

pub struct YouTubeClient {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    channel_id: String,
}

impl YouTubeClient {
    pub fn new(config: YouTubeConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            channel_id: config.channel_id,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SourceError> {
        let url = format!("{}/{endpoint}", self.base_url);
        debug!(endpoint, ?query, "requesting");

        let mut request = self.agent.get(&url);
        for (name, value) in query {
            request = request.query(name, value);
        }
        let response = request
            .query("key", &self.api_key)
            .call()
            .map_err(|err| self.scrub(err.into()))?;
        Ok(response.into_json::<T>()?)
    }

    fn scrub(&self, err: SourceError) -> SourceError {
        if self.api_key.is_empty() {
            return err;
        }
        match err {
            SourceError::Transport(message) => {
                SourceError::Transport(message.replace(&self.api_key, "<redacted>"))
            }
            SourceError::Status { status, body } => SourceError::Status {
                status,
                body: body.replace(&self.api_key, "<redacted>"),
            },
            other => other,
        }
    }

    fn page_query<'a>(
        base: &[(&'a str, &'a str)],
        page_token: Option<&'a str>,
    ) -> Vec<(&'a str, &'a str)> {
        let mut query = base.to_vec();
        if let Some(token) = page_token.filter(|token| !token.is_empty()) {
            query.push(("pageToken", token));
        }
        query
    }
}

impl ChannelSource for YouTubeClient {
    fn channel(&self) -> Result<Option<RawChannel>, SourceError> {
        let page: ListResponse<RawChannel> = self.get(
            "channels",
            &[("part", "snippet,statistics"), ("id", self.channel_id.as_str())],
        )?;
        Ok(page.items.into_iter().next())
    }

    fn video_page(&self, page_token: Option<&str>) -> Result<ListResponse<RawVideo>, SourceError> {
        let query = Self::page_query(
            &[
                ("part", "snippet"),
                ("channelId", self.channel_id.as_str()),
                ("order", "date"),
                ("type", "video"),
                ("maxResults", PAGE_SIZE),
            ],
            page_token,
        );
        self.get("search", &query)
    }

    fn playlist_page(
        &self,
        page_token: Option<&str>,
    ) -> Result<ListResponse<RawPlaylist>, SourceError> {
        let query = Self::page_query(
            &[
                ("part", "snippet,contentDetails,status"),
                ("channelId", self.channel_id.as_str()),
                ("maxResults", PAGE_SIZE),
            ],
            page_token,
        );
        self.get("playlists", &query)
    }

    fn playlist_items_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<ListResponse<RawPlaylistItem>, SourceError> {
        let query = Self::page_query(
            &[
                ("part", "contentDetails"),
                ("playlistId", playlist_id),
                ("maxResults", PAGE_SIZE),
            ],
            page_token,
        );
        self.get("playlistItems", &query)
    }

    fn video_details(&self, ids: &[&str]) -> Result<Vec<RawVideo>, SourceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        if ids.len() > MAX_DETAIL_BATCH {
            return Err(SourceError::InvalidRequest(format!(
                "{} ids exceed the detail batch limit of {MAX_DETAIL_BATCH}",
                ids.len()
            )));
        }
        let joined = ids.join(",");
        let page: ListResponse<RawVideo> = self.get(
            "videos",
            &[("part", "snippet,statistics,contentDetails"), ("id", joined.as_str())],
        )?;
        Ok(page.items)
    }
}
