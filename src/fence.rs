use std::fmt::{self, Debug};

/// Owned native fence handle.
///
/// On a real GPU backend this wraps a sync-file descriptor; duplication
/// and waiting go through the device so the software device can model
/// fences without touching the OS.
#[derive(PartialEq, Eq, Hash)]
pub struct SyncFd {
    raw: i64,
}

impl SyncFd {
    /// Wraps a raw handle, taking ownership.
    pub fn from_raw(raw: i64) -> Self {
        SyncFd { raw }
    }

    pub fn as_raw(&self) -> i64 {
        self.raw
    }

    /// Releases ownership of the raw handle.
    pub fn into_raw(self) -> i64 {
        self.raw
    }
}

impl Debug for SyncFd {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "SyncFd({})", self.raw)
    }
}

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum FenceError {
    #[error("Native fences are not supported by this device")]
    Unsupported,

    #[error("Duplicating the fence handle failed")]
    DupFailed,
}

/// What a queued timeline fence marks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimelineTag {
    BeginFrame,
    EndFrame,
}

/// Sync point queued for asynchronous GPU-timestamp readback.
///
/// When the fence signals, the engine emits the timestamp to the
/// timeline log and drops the point.
#[derive(Debug)]
pub struct TimelinePoint {
    pub tag: TimelineTag,
    pub frame: u64,
    pub fence: SyncFd,
}
