use {
    crate::{
        color::{ColorProfile, EotfMode},
        fence::{SyncFd, TimelineTag},
        region::Region,
        surface::BufferSpec,
    },
    std::sync::Arc,
};

/// Engine-owned surface handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceKey(pub(crate) usize);

/// Engine-owned output handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputKey(pub(crate) usize);

/// Everything the outside world tells the core.
///
/// The protocol layer resolves wire messages into these; the core
/// never blocks inside [`crate::Engine::handle_event`], it only
/// returns [`Effect`]s to act on.
#[derive(Debug)]
pub enum Event {
    BufferAttached {
        surface: SurfaceKey,
        spec: BufferSpec,
    },

    /// Damage in buffer coordinates.
    SurfaceDamaged {
        surface: SurfaceKey,
        region: Region,
    },

    SurfaceOpaqueRegion {
        surface: SurfaceKey,
        region: Region,
    },

    /// `None` detaches and falls back to the stock profile.
    SurfaceProfileAttached {
        surface: SurfaceKey,
        profile: Option<Arc<ColorProfile>>,
    },

    /// Explicit-sync acquire fence for the next draw of this surface.
    AcquireFence {
        surface: SurfaceKey,
        fence: SyncFd,
    },

    SurfaceDestroyed {
        surface: SurfaceKey,
    },

    OutputProfileAttached {
        output: OutputKey,
        profile: Option<Arc<ColorProfile>>,
    },

    OutputEotfChanged {
        output: OutputKey,
        mode: EotfMode,
    },

    OutputRemoved {
        output: OutputKey,
    },

    /// Repaint `output`; `damage` is this frame's new damage in output
    /// coordinates.
    FrameRequested {
        output: OutputKey,
        damage: Region,
    },

    FanDebug {
        enabled: bool,
    },

    GreenTint {
        enabled: bool,
    },
}

/// Protocol-visible errors attributable to one client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientError {
    /// The shader for this surface could not be built; the fallback
    /// was used.
    ShaderUnavailable,

    /// Duplicating a sync fence for this surface failed.
    SyncFenceFailed,
}

/// Everything the core asks the outside world to do.
#[derive(Debug)]
pub enum Effect {
    /// Hand this fence to the client; it signals when the compositor
    /// is done reading the surface's buffer.
    ReleaseFence {
        surface: SurfaceKey,
        fence: SyncFd,
    },

    /// The damage submitted with the frame, output coordinates.
    SubmittedDamage {
        output: OutputKey,
        damage: Region,
    },

    /// Deliver a protocol error to the surface's client.
    ProtocolError {
        surface: SurfaceKey,
        error: ClientError,
    },

    /// The frame could not be drawn and was dropped.
    FrameSkipped {
        output: OutputKey,
    },

    /// A queued timeline point signalled.
    GpuTimestamp {
        output: OutputKey,
        tag: TimelineTag,
        frame: u64,
        nanoseconds: u64,
    },
}
