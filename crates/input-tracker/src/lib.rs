//! Per-minute input activity tracking.
//!
//! UI code forwards raw keyboard and mouse events to an [`ActivityTracker`].
//! The tracker samples them once per second into an "active seconds" count,
//! rolls the count over at each minute boundary, and hands completed minutes
//! to an [`ActivityStore`] (SQLite via [`Database`] by default).

pub mod bucket;
pub mod config;
pub mod db;
pub mod error;
pub mod surface;
pub mod tracker;

pub use bucket::{ActivityCounter, ActivitySample};
pub use config::TrackerConfig;
pub use db::{ActivityRecord, ActivityStore, Database, StoredActivity};
pub use error::{Result, TrackerError};
pub use surface::{InputKind, InputSurface, SurfaceId};
pub use tracker::{ActivityTracker, InputNotifier};
