#![forbid(unsafe_code)]

//! Channel mirror: pulls channel, video and playlist metadata from the video
//! platform API, reconciles it into a local SQLite store and reports how each
//! sync run went.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod normalize;
pub mod payload;
pub mod reconcile;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod sync;
pub mod youtube;
