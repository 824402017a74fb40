//! Contract for the external video platform plus the retrieval logic built on
//! top of it: walking paginated listings and enriching video stubs with
//! details in batches.
//!
//! Failures of a single page or batch are logged and end that listing early.
//! Callers always receive whatever was collected up to that point.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::error::SourceError;
use crate::payload::{
    ListResponse, PlaylistBundle, RawChannel, RawPlaylist, RawPlaylistItem, RawVideo,
};

/// Largest id list the detail lookup accepts in one call.
pub const MAX_DETAIL_BATCH: usize = 50;

/// Blocking calls against the video platform, one method per endpoint.
pub trait ChannelSource: Send + Sync {
    /// Channel snippet and statistics; `None` when the channel is unknown.
    fn channel(&self) -> Result<Option<RawChannel>, SourceError>;

    /// One page of the channel's video listing (stubs without statistics).
    fn video_page(&self, page_token: Option<&str>) -> Result<ListResponse<RawVideo>, SourceError>;

    fn playlist_page(
        &self,
        page_token: Option<&str>,
    ) -> Result<ListResponse<RawPlaylist>, SourceError>;

    fn playlist_items_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<ListResponse<RawPlaylistItem>, SourceError>;

    /// Full records for up to [`MAX_DETAIL_BATCH`] ids.
    fn video_details(&self, ids: &[&str]) -> Result<Vec<RawVideo>, SourceError>;
}

/// Follows continuation tokens until the listing ends or a page fails.
pub fn collect_pages<T, F>(label: &str, mut fetch_page: F) -> Vec<T>
where
    F: FnMut(Option<&str>) -> Result<ListResponse<T>, SourceError>,
{
    let mut items = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = match fetch_page(page_token.as_deref()) {
            Ok(page) => page,
            Err(err) => {
                warn!(listing = label, error = %err, "page fetch failed; keeping {} item(s) collected so far", items.len());
                break;
            }
        };
        let fetched = page.items.len();
        items.extend(page.items);
        let next = page.next_page_token.filter(|token| !token.is_empty());
        info!(listing = label, fetched, has_more = next.is_some(), "fetched page");
        // A token that repeats would never terminate the walk.
        if next.is_none() || next == page_token {
            break;
        }
        page_token = next;
    }
    items
}

/// Current channel information, or `None` when it is missing or the call
/// failed.
pub fn fetch_channel(source: &dyn ChannelSource) -> Option<RawChannel> {
    match source.channel() {
        Ok(Some(channel)) => Some(channel),
        Ok(None) => {
            warn!("channel lookup returned no items");
            None
        }
        Err(err) => {
            warn!(error = %err, "channel lookup failed");
            None
        }
    }
}

pub fn fetch_all_video_stubs(source: &dyn ChannelSource) -> Vec<RawVideo> {
    collect_pages("videos", |token| source.video_page(token))
}

/// Every video of the channel with statistics and content details attached
/// where the detail lookup succeeded.
pub fn fetch_all_videos(source: &dyn ChannelSource) -> Vec<RawVideo> {
    let stubs = fetch_all_video_stubs(source);
    enrich_with_details(source, stubs)
}

/// Looks up details for the stubs in batches of [`MAX_DETAIL_BATCH`] and
/// merges them back by id. Stubs without a matching detail record are kept
/// as they are.
pub fn enrich_with_details(source: &dyn ChannelSource, mut stubs: Vec<RawVideo>) -> Vec<RawVideo> {
    if stubs.is_empty() {
        return stubs;
    }

    let total = stubs.len();
    let mut enriched = 0;
    for chunk in stubs.chunks_mut(MAX_DETAIL_BATCH) {
        let ids: Vec<&str> = chunk.iter().filter_map(RawVideo::video_id).collect();
        if ids.is_empty() {
            warn!("skipping a detail batch without usable video ids");
            continue;
        }

        let details = match source.video_details(&ids) {
            Ok(details) => details,
            Err(err) => {
                warn!(first_id = ids[0], error = %err, "detail lookup failed for batch");
                continue;
            }
        };
        if details.is_empty() {
            warn!(first_id = ids[0], "detail lookup returned nothing for batch");
            continue;
        }

        let mut by_id: HashMap<String, RawVideo> = HashMap::with_capacity(details.len());
        for detail in details {
            if let Some(id) = detail.video_id().map(str::to_owned) {
                by_id.entry(id).or_insert(detail);
            }
        }

        for stub in chunk.iter_mut() {
            let Some(detail) = stub.video_id().and_then(|id| by_id.remove(id)) else {
                continue;
            };
            merge_detail(stub, detail);
            enriched += 1;
        }
    }

    info!(enriched, total, "video enrichment complete");
    stubs
}

fn merge_detail(stub: &mut RawVideo, detail: RawVideo) {
    stub.statistics = detail.statistics;
    stub.content_details = detail.content_details;
    let Some(detail_snippet) = detail.snippet else {
        return;
    };
    let snippet = stub.snippet.get_or_insert_with(Default::default);
    if snippet.tags.is_none() {
        snippet.tags = detail_snippet.tags;
    }
    if snippet.category_id.is_none() {
        snippet.category_id = detail_snippet.category_id;
    }
}

pub fn fetch_all_playlists(source: &dyn ChannelSource) -> Vec<RawPlaylist> {
    collect_pages("playlists", |token| source.playlist_page(token))
}

/// Member video ids of one playlist, in playlist order.
pub fn fetch_playlist_members(source: &dyn ChannelSource, playlist_id: &str) -> Vec<String> {
    collect_pages("playlist_items", |token| {
        source.playlist_items_page(playlist_id, token)
    })
    .into_iter()
    .filter_map(|item| item.content_details.and_then(|details| details.video_id))
    .filter(|id| !id.trim().is_empty())
    .collect()
}

/// Every playlist of the channel with its member ids.
pub fn fetch_all_playlist_bundles(source: &dyn ChannelSource) -> Vec<PlaylistBundle> {
    fetch_all_playlists(source)
        .into_iter()
        .map(|playlist| {
            let video_ids = match playlist.id.as_deref() {
                Some(id) if !id.trim().is_empty() => fetch_playlist_members(source, id),
                _ => Vec::new(),
            };
            PlaylistBundle {
                playlist,
                video_ids,
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory source shared by the source and sync tests.

    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    pub struct FakeSource {
        pub channel: Option<RawChannel>,
        pub channel_fails: bool,
        /// Video listing pages keyed by the token that requests them (`""` is
        /// the first page).
        pub video_pages: HashMap<String, Result<ListResponse<RawVideo>, u16>>,
        pub playlist_pages: HashMap<String, Result<ListResponse<RawPlaylist>, u16>>,
        pub playlist_members: HashMap<String, Vec<String>>,
        pub details: HashMap<String, RawVideo>,
        pub failing_detail_batches: Vec<usize>,
        pub panic_on_videos: bool,
        pub detail_calls: Mutex<Vec<Vec<String>>>,
    }

    pub fn stub(id: &str) -> RawVideo {
        serde_json::from_value(json!({
            "id": {"kind": "youtube#video", "videoId": id},
            "snippet": {
                "title": format!("Video {id}"),
                "publishedAt": "2024-01-01T00:00:00Z",
                "channelId": "UC1"
            }
        }))
        .unwrap()
    }

    pub fn detail(id: &str, views: &str) -> RawVideo {
        serde_json::from_value(json!({
            "id": id,
            "snippet": {"tags": ["t1", "t2"], "categoryId": "22"},
            "statistics": {"viewCount": views, "likeCount": "1", "commentCount": "0"},
            "contentDetails": {"duration": "PT4M13S"}
        }))
        .unwrap()
    }

    pub fn playlist(id: &str) -> RawPlaylist {
        serde_json::from_value(json!({
            "id": id,
            "snippet": {"title": format!("Playlist {id}"), "channelId": "UC1"},
            "contentDetails": {"itemCount": 1},
            "status": {"privacyStatus": "public"}
        }))
        .unwrap()
    }

    pub fn channel(id: &str) -> RawChannel {
        serde_json::from_value(json!({
            "id": id,
            "snippet": {"title": "The Channel"},
            "statistics": {"subscriberCount": "10", "videoCount": "3", "viewCount": "99"}
        }))
        .unwrap()
    }

    impl FakeSource {
        /// Source that lists `ids` on a single page and knows details for all
        /// of them.
        pub fn with_videos(ids: &[&str]) -> Self {
            let mut source = Self::default();
            source.set_videos(ids);
            source
        }

        pub fn set_videos(&mut self, ids: &[&str]) {
            self.video_pages.clear();
            self.video_pages.insert(
                String::new(),
                Ok(ListResponse {
                    items: ids.iter().map(|id| stub(id)).collect(),
                    next_page_token: None,
                }),
            );
            for id in ids {
                self.details.insert((*id).to_string(), detail(id, "100"));
            }
        }

        pub fn set_playlists(&mut self, ids: &[&str]) {
            self.playlist_pages.clear();
            self.playlist_pages.insert(
                String::new(),
                Ok(ListResponse {
                    items: ids.iter().map(|id| playlist(id)).collect(),
                    next_page_token: None,
                }),
            );
        }
    }

    fn scripted<T: Clone>(
        pages: &HashMap<String, Result<ListResponse<T>, u16>>,
        token: Option<&str>,
    ) -> Result<ListResponse<T>, SourceError> {
        match pages.get(token.unwrap_or_default()) {
            Some(Ok(page)) => Ok(page.clone()),
            Some(Err(status)) => Err(SourceError::Status {
                status: *status,
                body: "scripted failure".into(),
            }),
            None => Ok(ListResponse::default()),
        }
    }

    impl ChannelSource for FakeSource {
        fn channel(&self) -> Result<Option<RawChannel>, SourceError> {
            if self.channel_fails {
                return Err(SourceError::Transport("connection refused".into()));
            }
            Ok(self.channel.clone())
        }

        fn video_page(
            &self,
            page_token: Option<&str>,
        ) -> Result<ListResponse<RawVideo>, SourceError> {
            if self.panic_on_videos {
                panic!("video listing exploded");
            }
            scripted(&self.video_pages, page_token)
        }

        fn playlist_page(
            &self,
            page_token: Option<&str>,
        ) -> Result<ListResponse<RawPlaylist>, SourceError> {
            scripted(&self.playlist_pages, page_token)
        }

        fn playlist_items_page(
            &self,
            playlist_id: &str,
            _page_token: Option<&str>,
        ) -> Result<ListResponse<RawPlaylistItem>, SourceError> {
            let items = self
                .playlist_members
                .get(playlist_id)
                .map(|ids| {
                    ids.iter()
                        .map(|id| {
                            serde_json::from_value(json!({"contentDetails": {"videoId": id}}))
                                .unwrap()
                        })
                        .collect()
                })
                .unwrap_or_default();
            Ok(ListResponse {
                items,
                next_page_token: None,
            })
        }

        fn video_details(&self, ids: &[&str]) -> Result<Vec<RawVideo>, SourceError> {
            let mut calls = self.detail_calls.lock();
            let batch = calls.len();
            calls.push(ids.iter().map(|id| id.to_string()).collect());
            if self.failing_detail_batches.contains(&batch) {
                return Err(SourceError::Transport("timed out".into()));
            }
            Ok(ids
                .iter()
                .filter_map(|id| self.details.get(*id).cloned())
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn page(ids: &[&str], next: Option<&str>) -> Result<ListResponse<RawVideo>, u16> {
        Ok(ListResponse {
            items: ids.iter().map(|id| stub(id)).collect(),
            next_page_token: next.map(str::to_owned),
        })
    }

    #[test]
    fn follows_continuation_tokens_until_exhausted() {
        let mut source = FakeSource::default();
        source.video_pages.insert(String::new(), page(&["a", "b"], Some("p2")));
        source.video_pages.insert("p2".into(), page(&["c"], Some("p3")));
        source.video_pages.insert("p3".into(), page(&["d"], Some("")));

        let ids: Vec<String> = fetch_all_video_stubs(&source)
            .iter()
            .filter_map(|video| video.video_id().map(str::to_owned))
            .collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn failed_page_keeps_earlier_pages() {
        let mut source = FakeSource::default();
        source.video_pages.insert(String::new(), page(&["a"], Some("p2")));
        source.video_pages.insert("p2".into(), Err(503));
        source.video_pages.insert("p3".into(), page(&["never"], None));

        let stubs = fetch_all_video_stubs(&source);
        assert_eq!(stubs.len(), 1);
        assert_eq!(stubs[0].video_id(), Some("a"));
    }

    #[test]
    fn repeated_token_stops_the_walk() {
        let mut source = FakeSource::default();
        source.video_pages.insert(String::new(), page(&["a"], Some("loop")));
        source.video_pages.insert("loop".into(), page(&["b"], Some("loop")));

        assert_eq!(fetch_all_video_stubs(&source).len(), 2);
    }

    #[test]
    fn enrichment_batches_ids_by_fifty() {
        let ids: Vec<String> = (0..120).map(|n| format!("v{n}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let source = FakeSource::with_videos(&id_refs);

        let videos = fetch_all_videos(&source);
        assert_eq!(videos.len(), 120);

        let calls = source.detail_calls.lock();
        let sizes: Vec<usize> = calls.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert!(videos.iter().all(|video| video.statistics.is_some()));
    }

    #[test]
    fn enrichment_merges_details_onto_stubs() {
        let source = FakeSource::with_videos(&["a"]);
        let videos = fetch_all_videos(&source);
        let video = &videos[0];
        let snippet = video.snippet.as_ref().unwrap();

        assert_eq!(snippet.title.as_deref(), Some("Video a"));
        assert_eq!(snippet.tags.as_ref().map(Vec::len), Some(2));
        assert_eq!(snippet.category_id.as_deref(), Some("22"));
        assert_eq!(
            video.content_details.as_ref().unwrap().duration.as_deref(),
            Some("PT4M13S")
        );
    }

    #[test]
    fn failed_or_idless_batches_do_not_abort_enrichment() {
        let ids: Vec<String> = (0..60).map(|n| format!("v{n}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let mut source = FakeSource::with_videos(&id_refs);
        source.failing_detail_batches = vec![0];

        let videos = fetch_all_videos(&source);
        assert_eq!(videos.len(), 60);
        assert!(videos[..50].iter().all(|video| video.statistics.is_none()));
        assert!(videos[50..].iter().all(|video| video.statistics.is_some()));

        let idless = vec![RawVideo::default(); 3];
        let source = FakeSource::default();
        let out = enrich_with_details(&source, idless);
        assert_eq!(out.len(), 3);
        assert!(source.detail_calls.lock().is_empty());
    }

    #[test]
    fn playlist_bundles_include_members_in_order() {
        let mut source = FakeSource::default();
        source.set_playlists(&["PL1", "PL2"]);
        source
            .playlist_members
            .insert("PL1".into(), vec!["v3".into(), "v1".into()]);

        let bundles = fetch_all_playlist_bundles(&source);
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].video_ids, vec!["v3", "v1"]);
        assert!(bundles[1].video_ids.is_empty());
    }

    #[test]
    fn channel_failure_is_absent() {
        let source = FakeSource {
            channel_fails: true,
            ..FakeSource::default()
        };
        assert!(fetch_channel(&source).is_none());

        let source = FakeSource {
            channel: Some(channel("UC1")),
            ..FakeSource::default()
        };
        assert_eq!(fetch_channel(&source).and_then(|c| c.id).as_deref(), Some("UC1"));
    }
}
