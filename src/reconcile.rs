//! Three-way reconciliation between the records the platform currently
//! reports and the rows stored locally.
//!
//! The engine is written once and shared by videos and playlists. Entity
//! specific behaviour lives behind [`Reconcilable`] (identity and overwrite
//! rules) and [`EntityStore`] (the four persistence operations).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::models::{EntityKind, PlaylistRecord, VideoRecord};

/// A canonical record the engine can diff and overwrite.
pub trait Reconcilable: Send + Sync {
    fn id(&self) -> &str;

    /// Replaces every field the platform owns with the value from `incoming`.
    /// Locally derived fields stay untouched.
    fn overwrite_from(&mut self, incoming: &Self);
}

impl Reconcilable for VideoRecord {
    fn id(&self) -> &str {
        &self.video_id
    }

    fn overwrite_from(&mut self, incoming: &Self) {
        let VideoRecord {
            video_id: _,
            title,
            description,
            published_at,
            duration,
            view_count,
            like_count,
            comment_count,
            thumbnail_url,
            channel_id,
            category_id,
            tags,
            is_latest: _,
            is_popular: _,
            refreshed_at,
        } = incoming.clone();
        self.title = title;
        self.description = description;
        self.published_at = published_at;
        self.duration = duration;
        self.view_count = view_count;
        self.like_count = like_count;
        self.comment_count = comment_count;
        self.thumbnail_url = thumbnail_url;
        self.channel_id = channel_id;
        self.category_id = category_id;
        self.tags = tags;
        self.refreshed_at = refreshed_at;
    }
}

impl Reconcilable for PlaylistRecord {
    fn id(&self) -> &str {
        &self.playlist_id
    }

    fn overwrite_from(&mut self, incoming: &Self) {
        let PlaylistRecord {
            playlist_id: _,
            title,
            description,
            published_at,
            channel_id,
            thumbnail_url,
            item_count,
            privacy_status,
            video_ids,
            refreshed_at,
        } = incoming.clone();
        self.title = title;
        self.description = description;
        self.published_at = published_at;
        self.channel_id = channel_id;
        self.thumbnail_url = thumbnail_url;
        self.item_count = item_count;
        self.privacy_status = privacy_status;
        self.video_ids = video_ids;
        self.refreshed_at = refreshed_at;
    }
}

/// Persistence operations the engine needs for one entity type. Each call
/// must be atomic for the single record it touches.
pub trait EntityStore<R: Reconcilable>: Sync {
    fn local_ids(&self) -> impl Future<Output = Result<BTreeSet<String>>> + Send;

    fn fetch_by_id(&self, id: &str) -> impl Future<Output = Result<Option<R>>> + Send;

    fn insert(&self, record: &R) -> impl Future<Output = Result<()>> + Send;

    /// Fails when no row with the record's id exists.
    fn update(&self, record: &R) -> impl Future<Output = Result<()>> + Send;

    /// Fails when no row with `id` exists.
    fn delete(&self, id: &str) -> impl Future<Output = Result<()>> + Send;
}

/// The three disjoint id sets of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_insert: BTreeSet<String>,
    pub to_update: BTreeSet<String>,
    pub to_delete: BTreeSet<String>,
}

impl ReconcilePlan {
    pub fn compute(external: &BTreeSet<String>, local: &BTreeSet<String>) -> Self {
        Self {
            to_insert: external.difference(local).cloned().collect(),
            to_update: external.intersection(local).cloned().collect(),
            to_delete: local.difference(external).cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        })
    }
}

/// One record whose operation did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub id: String,
    pub op: Operation,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub kind: EntityKind,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failures: Vec<ItemFailure>,
}

impl ReconcileReport {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            inserted: 0,
            updated: 0,
            deleted: 0,
            failures: Vec::new(),
        }
    }

    /// Number of records whose operation completed.
    pub fn touched(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    fn fail(&mut self, id: &str, op: Operation, reason: impl fmt::Display) {
        warn!(kind = %self.kind, id, %op, %reason, "reconcile item failed");
        self.failures.push(ItemFailure {
            id: id.to_owned(),
            op,
            reason: reason.to_string(),
        });
    }
}

/// Applies the difference between `external` and the stored rows: insert
/// what is new, overwrite what exists on both sides, delete what disappeared
/// upstream.
///
/// An empty `external` aborts the pass before the store is consulted, so an
/// upstream outage can never wipe local data. Per-record failures are
/// collected in the report and never stop the remaining records.
pub async fn reconcile<R, S>(
    kind: EntityKind,
    store: &S,
    external: Vec<R>,
) -> Result<ReconcileReport, ReconcileError>
where
    R: Reconcilable,
    S: EntityStore<R>,
{
    if external.is_empty() {
        warn!(%kind, "upstream returned nothing; skipping reconciliation");
        return Err(ReconcileError::EmptyUpstream(kind));
    }

    let mut incoming: BTreeMap<String, R> = BTreeMap::new();
    for record in external {
        let id = record.id().to_owned();
        if incoming.contains_key(&id) {
            debug!(%kind, id, "ignoring duplicate upstream record");
            continue;
        }
        incoming.insert(id, record);
    }

    let local = store
        .local_ids()
        .await
        .map_err(|source| ReconcileError::LocalIds { kind, source })?;
    let external_ids: BTreeSet<String> = incoming.keys().cloned().collect();
    let plan = ReconcilePlan::compute(&external_ids, &local);
    info!(
        %kind,
        insert = plan.to_insert.len(),
        update = plan.to_update.len(),
        delete = plan.to_delete.len(),
        "reconciling"
    );

    let mut report = ReconcileReport::new(kind);

    for id in &plan.to_insert {
        let Some(record) = incoming.get(id) else {
            continue;
        };
        match store.insert(record).await {
            Ok(()) => report.inserted += 1,
            Err(err) => report.fail(id, Operation::Insert, format_args!("{err:#}")),
        }
    }

    for id in &plan.to_update {
        let Some(fresh) = incoming.get(id) else {
            continue;
        };
        let mut existing = match store.fetch_by_id(id).await {
            Ok(Some(existing)) => existing,
            Ok(None) => {
                report.fail(id, Operation::Update, "local row disappeared before update");
                continue;
            }
            Err(err) => {
                report.fail(id, Operation::Update, format_args!("{err:#}"));
                continue;
            }
        };
        existing.overwrite_from(fresh);
        match store.update(&existing).await {
            Ok(()) => report.updated += 1,
            Err(err) => report.fail(id, Operation::Update, format_args!("{err:#}")),
        }
    }

    for id in &plan.to_delete {
        match store.delete(id).await {
            Ok(()) => report.deleted += 1,
            Err(err) => report.fail(id, Operation::Delete, format_args!("{err:#}")),
        }
    }

    info!(
        %kind,
        inserted = report.inserted,
        updated = report.updated,
        deleted = report.deleted,
        failed = report.failures.len(),
        "reconciliation finished"
    );
    Ok(report)
}
