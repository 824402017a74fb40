//! Maps raw API payloads onto canonical records.
//!
//! Nothing here performs I/O. Recoverable oddities (a counter that is not a
//! number, an unparseable timestamp) leave the field unset and are reported
//! back as warnings so the caller can log them with context.

use chrono::NaiveDateTime;

use crate::models::{ChannelSnapshot, PlaylistRecord, VideoRecord};
use crate::payload::{
    PlaylistBundle, RawChannel, RawCount, RawPlaylist, RawSnippet, RawThumbnails, RawVideo,
};

pub const ZERO_DURATION: &str = "0:00";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// A canonical record plus the non-fatal problems found while building it.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub record: T,
    pub warnings: Vec<String>,
}

/// Renders a duration code such as `PT1H2M3S` as `1:02:03`, or `PT4M13S` as
/// `4:13`. Missing or malformed codes render as `0:00`.
pub fn format_duration(code: Option<&str>) -> String {
    match code.and_then(parse_duration_code) {
        Some((hours, minutes, seconds)) if hours > 0 => {
            format!("{hours}:{minutes:02}:{seconds:02}")
        }
        Some((_, minutes, seconds)) => format!("{minutes}:{seconds:02}"),
        None => ZERO_DURATION.to_string(),
    }
}

/// Splits `P[nD]T[nH][nM][nS]` into hours, minutes and seconds. Days are
/// folded into hours; units must appear at most once and in order.
fn parse_duration_code(code: &str) -> Option<(u64, u64, u64)> {
    let rest = code.trim().strip_prefix('P')?;
    let (day_part, time_part) = match rest.split_once('T') {
        Some((days, time)) => (days, time),
        None => (rest, ""),
    };

    let days = match day_part {
        "" => 0,
        value => value.strip_suffix('D')?.parse::<u64>().ok()?,
    };

    let mut fields = [0u64; 3];
    let mut next_unit = 0;
    let mut digits = String::new();
    for ch in time_part.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let unit = match ch {
            'H' => 0,
            'M' => 1,
            'S' => 2,
            _ => return None,
        };
        if digits.is_empty() || unit < next_unit {
            return None;
        }
        fields[unit] = digits.parse().ok()?;
        digits.clear();
        next_unit = unit + 1;
    }
    if !digits.is_empty() {
        return None;
    }

    let hours = days.checked_mul(24)?.checked_add(fields[0])?;
    Some((hours, fields[1], fields[2]))
}

/// Parses the platform's zone-suffixed timestamps into a naive date-time by
/// dropping the zone designator, keeping the wall-clock value as written.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(strip_zone_suffix(raw.trim()), TIMESTAMP_FORMAT).ok()
}

fn strip_zone_suffix(value: &str) -> &str {
    if let Some(stripped) = value.strip_suffix('Z').or_else(|| value.strip_suffix('z')) {
        return stripped;
    }
    // Numeric offsets (`+02:00`, `-0500`) only ever follow the time part.
    if let Some(time_start) = value.find('T')
        && let Some(offset) = value[time_start..].rfind(|c: char| c == '+' || c == '-')
    {
        return &value[..time_start + offset];
    }
    value
}

/// Highest resolution thumbnail URL available.
pub fn best_thumbnail(thumbnails: Option<&RawThumbnails>) -> Option<String> {
    let thumbnails = thumbnails?;
    [&thumbnails.high, &thumbnails.medium, &thumbnails.default_res]
        .into_iter()
        .flatten()
        .find_map(|thumb| thumb.url.as_deref().filter(|url| !url.trim().is_empty()))
        .map(str::to_owned)
}

/// Parses an optional counter. A value that is not a number is dropped with a
/// warning naming the field.
pub fn parse_counter(
    field: &str,
    raw: Option<&RawCount>,
    warnings: &mut Vec<String>,
) -> Option<i64> {
    match raw? {
        RawCount::Number(value) => Some(*value),
        RawCount::Text(text) => match text.trim().parse::<i64>() {
            Ok(value) => Some(value),
            Err(_) => {
                warnings.push(format!("{field} is not a number: {text:?}"));
                None
            }
        },
        RawCount::Other(value) => {
            warnings.push(format!("{field} is not a number: {value}"));
            None
        }
    }
}

fn timestamp_field(
    field: &str,
    raw: Option<&str>,
    warnings: &mut Vec<String>,
) -> Option<NaiveDateTime> {
    let raw = raw?;
    let parsed = parse_timestamp(raw);
    if parsed.is_none() {
        warnings.push(format!("could not parse {field}: {raw:?}"));
    }
    parsed
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn join_tags(tags: Option<&[String]>) -> Option<String> {
    let joined = tags?
        .iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .collect::<Vec<_>>()
        .join(",");
    if joined.is_empty() { None } else { Some(joined) }
}

/// Builds a `VideoRecord`. Returns `None` when the item carries no usable id,
/// since such a record can never be reconciled.
pub fn normalize_video(raw: &RawVideo, refreshed_at: NaiveDateTime) -> Option<Normalized<VideoRecord>> {
    let video_id = raw.video_id()?.to_string();
    let mut warnings = Vec::new();
    let empty = RawSnippet::default();
    let snippet = raw.snippet.as_ref().unwrap_or(&empty);
    let stats = raw.statistics.as_ref();

    let duration_code = raw
        .content_details
        .as_ref()
        .and_then(|details| details.duration.as_deref());
    if let Some(code) = duration_code
        && parse_duration_code(code).is_none()
    {
        warnings.push(format!("could not parse duration: {code:?}"));
    }

    let record = VideoRecord {
        video_id,
        title: snippet.title.clone().unwrap_or_default(),
        description: snippet.description.clone().unwrap_or_default(),
        published_at: timestamp_field("publishedAt", snippet.published_at.as_deref(), &mut warnings),
        duration: format_duration(duration_code),
        view_count: parse_counter(
            "viewCount",
            stats.and_then(|s| s.view_count.as_ref()),
            &mut warnings,
        ),
        like_count: parse_counter(
            "likeCount",
            stats.and_then(|s| s.like_count.as_ref()),
            &mut warnings,
        ),
        comment_count: parse_counter(
            "commentCount",
            stats.and_then(|s| s.comment_count.as_ref()),
            &mut warnings,
        ),
        thumbnail_url: best_thumbnail(snippet.thumbnails.as_ref()),
        channel_id: non_empty(snippet.channel_id.as_deref()),
        category_id: non_empty(snippet.category_id.as_deref()),
        tags: join_tags(snippet.tags.as_deref()),
        is_latest: false,
        is_popular: false,
        refreshed_at,
    };

    Some(Normalized { record, warnings })
}

pub fn normalize_playlist(
    bundle: &PlaylistBundle,
    refreshed_at: NaiveDateTime,
) -> Option<Normalized<PlaylistRecord>> {
    let raw: &RawPlaylist = &bundle.playlist;
    let playlist_id = non_empty(raw.id.as_deref())?;
    let mut warnings = Vec::new();
    let empty = RawSnippet::default();
    let snippet = raw.snippet.as_ref().unwrap_or(&empty);

    let record = PlaylistRecord {
        playlist_id,
        title: snippet.title.clone().unwrap_or_default(),
        description: snippet.description.clone().unwrap_or_default(),
        published_at: timestamp_field("publishedAt", snippet.published_at.as_deref(), &mut warnings),
        channel_id: non_empty(snippet.channel_id.as_deref()),
        thumbnail_url: best_thumbnail(snippet.thumbnails.as_ref()),
        item_count: parse_counter(
            "itemCount",
            raw.content_details
                .as_ref()
                .and_then(|details| details.item_count.as_ref()),
            &mut warnings,
        ),
        privacy_status: non_empty(
            raw.status
                .as_ref()
                .and_then(|status| status.privacy_status.as_deref()),
        ),
        video_ids: bundle.video_ids.clone(),
        refreshed_at,
    };

    Some(Normalized { record, warnings })
}

pub fn normalize_channel(
    raw: &RawChannel,
    refreshed_at: NaiveDateTime,
) -> Option<Normalized<ChannelSnapshot>> {
    let channel_id = non_empty(raw.id.as_deref())?;
    let mut warnings = Vec::new();
    let empty = RawSnippet::default();
    let snippet = raw.snippet.as_ref().unwrap_or(&empty);
    let stats = raw.statistics.as_ref();

    let record = ChannelSnapshot {
        channel_id,
        title: snippet.title.clone().unwrap_or_default(),
        description: snippet.description.clone().unwrap_or_default(),
        subscriber_count: parse_counter(
            "subscriberCount",
            stats.and_then(|s| s.subscriber_count.as_ref()),
            &mut warnings,
        ),
        video_count: parse_counter(
            "videoCount",
            stats.and_then(|s| s.video_count.as_ref()),
            &mut warnings,
        ),
        view_count: parse_counter(
            "viewCount",
            stats.and_then(|s| s.view_count.as_ref()),
            &mut warnings,
        ),
        published_at: timestamp_field("publishedAt", snippet.published_at.as_deref(), &mut warnings),
        country: non_empty(snippet.country.as_deref()),
        custom_url: non_empty(snippet.custom_url.as_deref()),
        thumbnail_url: best_thumbnail(snippet.thumbnails.as_ref()),
        refreshed_at,
    };

    Some(Normalized { record, warnings })
}
