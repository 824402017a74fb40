//! Error types shared across the sync pipeline.

use thiserror::Error;

use crate::models::EntityKind;

/// Failure of a single call against the video platform API.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode response: {0}")]
    Decode(#[from] std::io::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<ureq::Error> for SourceError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, response) => SourceError::Status {
                status,
                body: response.into_string().unwrap_or_default(),
            },
            ureq::Error::Transport(transport) => SourceError::Transport(transport.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The upstream fetch produced nothing usable. Reconciling against an
    /// empty set would delete every local row, so the pass is skipped.
    #[error("upstream returned no {0} records; reconciliation aborted")]
    EmptyUpstream(EntityKind),
    #[error("could not read local {kind} ids: {source}")]
    LocalIds {
        kind: EntityKind,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("background fetch did not complete: {0}")]
    Worker(String),
    #[error("sync run failed: {0}")]
    RunFailed(String),
}
