//! The per-frame input data model (spec §3, "Layer").

use crate::fence::Fence;
use crate::utils::{Rect, RectF, Transform};

bitflags::bitflags! {
    /// Buffer usage bits carried on an [`OverlayBuffer`](crate::buffer::OverlayBuffer).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Usage: u8 {
        const SCANOUT = 0b0001;
        const CURSOR = 0b0010;
        const VIDEO = 0b0100;
        const PROTECTED = 0b1000;
    }
}

/// How a layer's sampled colour is combined with what's already in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Blending {
    /// No blending; the layer fully replaces the destination.
    #[default]
    None,
    /// Source colour is already premultiplied by alpha.
    Premultiplied,
    /// Straight (non-premultiplied) alpha coverage blending.
    Coverage,
}

/// An opaque native buffer handle supplied by the caller. The core never interprets this;
/// it is handed unchanged to the [`NativeBufferHandler`](crate::buffer::NativeBufferHandler).
pub type NativeHandle = u64;

/// One entry of the caller's per-frame layer list (spec §3, "Layer").
///
/// Index 0 is the bottom of the stack. Layers are caller-owned for the duration of a
/// `present` call; only the acquire/release fence slots transfer ownership into the
/// pipeline, matching `InternalDisplay::Present`'s construction of its internal
/// `OverlayLayer` array from caller `HwcLayer*`s.
#[derive(Debug)]
pub struct Layer {
    /// The native buffer handle to import for this frame.
    pub handle: NativeHandle,
    /// The region of the source buffer to sample, in buffer-local float coordinates.
    pub source_crop: RectF,
    /// Where on the display this layer lands, in integer display-frame coordinates.
    pub display_frame: Rect,
    pub transform: Transform,
    pub blending: Blending,
    /// Plane alpha in `0.0..=1.0`.
    pub alpha: f32,
    /// Buffer usage bits; `Usage::CURSOR` makes this layer eligible for the cursor phase
    /// of validation (spec §4.4 step 5).
    pub usage: Usage,
    /// Fence the consumer must wait on before reading this layer's buffer. Taken by the
    /// pipeline on import, consumed exactly once.
    pub acquire_fence: Fence,
    /// Filled in by `present()` with the fence the caller must wait on before reusing this
    /// layer's buffer; reset to `Fence::Invalid` on an `EBUSY` drop (spec §4.7 step 8, §8
    /// scenario 6).
    pub release_fence: Fence,
}

impl Layer {
    /// Whether this layer is eligible for the cursor phase of validation (spec §4.4 step 5):
    /// a pure usage-bit check, not a format test — the cursor plane's format set is
    /// consulted separately by `Plane::validate_layer`.
    pub fn is_cursor_candidate(&self) -> bool {
        self.usage.contains(Usage::CURSOR)
    }
}
