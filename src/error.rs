//! Crate-wide error type.
//!
//! One enum, one variant per error kind the core can report (see spec §7). Internal
//! predicates that drive the validation algorithm (`validate_layer`, `test_commit`) return
//! `bool`, never `Error` — a failed test-commit is an expected branch, not a fault.

use std::io;

use drm::control::{connector, crtc, plane};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in the hardware-compositor core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A native buffer handle could not be imported into an [`crate::buffer::OverlayBuffer`].
    #[error("failed to import native buffer handle")]
    BadHandle(#[source] io::Error),

    /// A display has no primary plane; it cannot be driven at all.
    #[error("display has no primary plane")]
    NoPlane,

    /// The atomic commit ioctl failed with something other than `EBUSY`.
    #[error("atomic commit failed")]
    CommitFailed(#[source] io::Error),

    /// The atomic commit ioctl returned `EBUSY`; the frame was dropped, not an error condition
    /// that should be surfaced to the embedder as a failure.
    #[error("atomic commit returned EBUSY, frame dropped")]
    CommitBusy,

    /// Creating or destroying a mode property blob failed.
    #[error("failed to manage mode property blob")]
    ModeBlobFailed(#[source] io::Error),

    /// The fence/sync timeline could not produce a new fence.
    #[error("failed to create fence")]
    FenceCreateFailed,

    /// Reading from the hotplug socket (netlink or udev) failed.
    #[error("failed to read hotplug event")]
    HotplugReadFailed(#[source] io::Error),

    /// The target display is not currently connected.
    #[error("display is not connected")]
    Disconnected,

    /// Opening or negotiating client capabilities on the DRM device node failed.
    #[error("failed to initialize DRM device")]
    DeviceInitFailed(#[source] io::Error),

    /// The rendering backend failed to create a surface, import a texture, or draw a
    /// region; the frame composing it is aborted.
    #[error("gpu composition failed")]
    RenderFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A connector, encoder, or CRTC id referenced by the kernel no longer resolves.
    #[error("unknown {0} handle {1:?}")]
    UnknownHandle(&'static str, u32),

    #[doc(hidden)]
    #[error("internal: {0}")]
    Internal(&'static str),
}

impl Error {
    pub(crate) fn unknown_connector(handle: connector::Handle) -> Self {
        Error::UnknownHandle("connector", handle.into())
    }

    pub(crate) fn unknown_crtc(handle: crtc::Handle) -> Self {
        Error::UnknownHandle("crtc", handle.into())
    }

    pub(crate) fn unknown_plane(handle: plane::Handle) -> Self {
        Error::UnknownHandle("plane", handle.into())
    }
}
