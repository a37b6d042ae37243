use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::error::{Result, TrackerError};

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SurfaceId(u64);

impl SurfaceId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Raw input as reported by a UI toolkit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    KeyDown,
    KeyUp,
    MouseButtonDown,
    MouseButtonUp,
    MouseWheel,
    MouseMove,
}

impl InputKind {
    /// Key presses, mouse clicks and wheel turns count as activity. Releases
    /// and pointer motion do not.
    pub fn is_qualifying(self) -> bool {
        matches!(
            self,
            InputKind::KeyDown | InputKind::MouseButtonDown | InputKind::MouseWheel
        )
    }
}

/// A UI element whose input should count toward activity.
///
/// How the element detects input is up to the toolkit; it only needs a stable
/// id and to forward events through
/// [`ActivityTracker::on_raw_input`](crate::ActivityTracker::on_raw_input).
pub trait InputSurface {
    fn surface_id(&self) -> SurfaceId;
}

impl InputSurface for SurfaceId {
    fn surface_id(&self) -> SurfaceId {
        *self
    }
}

#[derive(Debug, Default)]
pub(crate) struct SurfaceRegistry {
    surfaces: RwLock<HashSet<SurfaceId>>,
    next_id: AtomicU64,
}

impl SurfaceRegistry {
    /// Ids are unique per registry; starts at 1.
    pub(crate) fn allocate(&self) -> SurfaceId {
        SurfaceId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn register(&self, id: SurfaceId) -> Result<()> {
        let mut surfaces = self
            .surfaces
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !surfaces.insert(id) {
            return Err(TrackerError::AlreadyRegistered(id));
        }
        Ok(())
    }

    pub(crate) fn unregister(&self, id: SurfaceId) -> Result<()> {
        let mut surfaces = self
            .surfaces
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !surfaces.remove(&id) {
            return Err(TrackerError::NotRegistered(id));
        }
        Ok(())
    }

    pub(crate) fn contains(&self, id: SurfaceId) -> bool {
        self.surfaces
            .read()
            .map(|surfaces| surfaces.contains(&id))
            .unwrap_or(false)
    }

    pub(crate) fn len(&self) -> usize {
        self.surfaces.read().map(|surfaces| surfaces.len()).unwrap_or(0)
    }
}
