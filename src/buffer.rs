//! Buffer registry (C2).
//!
//! Grounded in `DisplayPlaneManager::GetOverlayBuffer`/`BeginFrameUpdate`/`EndFrameUpdate`
//! in `displayplanemanager.cpp`. The registry is an insertion-ordered handle→buffer pool
//! (spec §3, "Ownership"): `indexmap::IndexMap` gives us that ordering directly instead of
//! hand-rolling the source's linear-scan `std::vector`.

use drm::control::{framebuffer, plane};
use drm_fourcc::{DrmFourcc, DrmModifier};
use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::layer::{NativeHandle, Usage};

/// One imported plane of a (possibly multi-planar) buffer: a dmabuf-style fd descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneDescriptor {
    pub fd: std::os::unix::io::RawFd,
    pub stride: u32,
    pub offset: u32,
}

/// What the [`NativeBufferHandler`] reports back for an imported handle.
#[derive(Debug, Clone)]
pub struct ImportedBuffer {
    pub format: DrmFourcc,
    pub width: u32,
    pub height: u32,
    pub modifier: DrmModifier,
    pub planes: Vec<PlaneDescriptor>,
    pub usage: Usage,
}

/// External collaborator (spec §6, "Native buffer handler"): imports an opaque native
/// handle into a structured descriptor, and creates/releases the kernel framebuffer object
/// backing it. Implemented by the platform; this crate never talks to GBM/DMABUF directly.
pub trait NativeBufferHandler: std::fmt::Debug + Send + Sync {
    fn import(&self, handle: NativeHandle) -> Result<ImportedBuffer>;
    fn create_framebuffer(&self, imported: &ImportedBuffer) -> Result<framebuffer::Handle>;
    fn release(&self, fb: framebuffer::Handle);
}

/// A normalised view of an imported native handle (spec §3, "Overlay buffer").
#[derive(Debug)]
pub struct OverlayBuffer {
    handle: NativeHandle,
    imported: ImportedBuffer,
    fb: Option<framebuffer::Handle>,
    in_use: bool,
    refcount: i32,
}

impl OverlayBuffer {
    pub fn format(&self) -> DrmFourcc {
        self.imported.format
    }

    pub fn width(&self) -> u32 {
        self.imported.width
    }

    pub fn height(&self) -> u32 {
        self.imported.height
    }

    pub fn usage(&self) -> Usage {
        self.imported.usage
    }

    pub fn imported(&self) -> &ImportedBuffer {
        &self.imported
    }

    /// Returns the lazily-created framebuffer id, creating it on first use via `handler`.
    pub fn framebuffer(
        &mut self,
        handler: &dyn NativeBufferHandler,
    ) -> Result<framebuffer::Handle> {
        if let Some(fb) = self.fb {
            return Ok(fb);
        }
        let fb = handler.create_framebuffer(&self.imported)?;
        trace!(?fb, handle = self.handle, "created framebuffer for imported buffer");
        self.fb = Some(fb);
        Ok(fb)
    }

    fn is_compatible(&self, other: &ImportedBuffer) -> bool {
        self.imported.format == other.format
            && self.imported.width == other.width
            && self.imported.height == other.height
            && self.imported.modifier == other.modifier
            && self.imported.planes == other.planes
    }
}

/// Owns the pool of imported buffers for one display's plane manager (spec §4.2).
#[derive(Debug, Default)]
pub struct BufferRegistry {
    // Keyed by the native handle that first produced each entry; re-imports of a
    // structurally distinct handle that happens to dedupe against an existing entry still
    // look it up by scanning `buffers`, matching the source's linear `GetOverlayBuffer`.
    buffers: IndexMap<NativeHandle, OverlayBuffer>,
    /// Planes bound this frame, recorded so `end_frame` knows which buffers to retain.
    bound_this_frame: Vec<NativeHandle>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks every buffer as not in use for the upcoming frame (spec §4.2).
    pub fn begin_frame(&mut self) {
        self.bound_this_frame.clear();
        for buf in self.buffers.values_mut() {
            buf.in_use = false;
        }
    }

    /// Imports `handle`, deduplicating against any structurally identical existing entry.
    ///
    /// Structural identity requires equal format, width, height, modifier, and equal
    /// per-plane (fd, stride, offset) sets, including the modifier — resolving the open
    /// question in spec §9/§4.2 in favour of requiring modifier equality.
    ///
    /// Importing does not by itself mark the buffer in use — spec §4.2 ties `in_use` to a
    /// buffer actually ending up bound to a committed plane, which isn't known until
    /// `validate_layers` resolves the frame's plane-state bindings. Callers mark that with
    /// [`BufferRegistry::mark_in_use`] once bindings are final.
    pub fn import(
        &mut self,
        handle: NativeHandle,
        handler: &dyn NativeBufferHandler,
    ) -> Result<&mut OverlayBuffer> {
        let imported = handler.import(handle).map_err(|e| match e {
            Error::BadHandle(_) => e,
            other => other,
        })?;

        let existing_key = self
            .buffers
            .iter()
            .find(|(_, buf)| buf.is_compatible(&imported))
            .map(|(k, _)| *k);

        let key = if let Some(key) = existing_key {
            let buf = self.buffers.get_mut(&key).unwrap();
            buf.refcount += 1;
            key
        } else {
            debug!(handle, format = ?imported.format, "registered new overlay buffer");
            self.buffers.insert(
                handle,
                OverlayBuffer {
                    handle,
                    imported,
                    fb: None,
                    in_use: false,
                    refcount: 0,
                },
            );
            handle
        };

        self.bound_this_frame.push(key);
        Ok(self.buffers.get_mut(&key).unwrap())
    }

    /// Marks the buffer imported under `handle` as bound to a committed plane this frame
    /// (spec §4.2). The caller drives this from the representative layer(s) of each
    /// resolved plane-state, after `validate_layers` runs — not every buffer imported this
    /// frame ends up in use.
    pub fn mark_in_use(&mut self, handle: NativeHandle) {
        if let Some(buf) = self.buffers.get_mut(&handle) {
            buf.in_use = true;
        }
    }

    /// Retires buffers that weren't touched this frame and retains those that were
    /// (spec §4.2). Must be called exactly once per frame, after the commit.
    pub fn end_frame(&mut self, handler: &dyn NativeBufferHandler) {
        let mut to_remove = Vec::new();
        for (key, buf) in self.buffers.iter_mut() {
            if buf.in_use {
                buf.refcount += 1;
            } else {
                buf.refcount -= 1;
                if buf.refcount < 0 {
                    to_remove.push(*key);
                }
            }
        }
        for key in to_remove {
            if let Some(buf) = self.buffers.shift_remove(&key) {
                if let Some(fb) = buf.fb {
                    handler.release(fb);
                }
                trace!(handle = key, "evicted overlay buffer, refcount below zero");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get_mut(&mut self, handle: NativeHandle) -> Option<&mut OverlayBuffer> {
        self.buffers.get_mut(&handle)
    }
}

// drm_fourcc's plane::Handle doesn't implement Hash/Ord we rely on; keep this module's use
// of drm::control::plane scoped to the type alias other modules expect to re-export from
// here in future without pulling the whole drm::control prelude into every call site.
pub type PlaneHandle = plane::Handle;

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct FakeHandler {
        width: u32,
        height: u32,
        format: DrmFourcc,
    }

    impl NativeBufferHandler for FakeHandler {
        fn import(&self, handle: NativeHandle) -> Result<ImportedBuffer> {
            Ok(ImportedBuffer {
                format: self.format,
                width: self.width,
                height: self.height,
                modifier: DrmModifier::Linear,
                planes: vec![PlaneDescriptor {
                    fd: handle as i32,
                    stride: self.width * 4,
                    offset: 0,
                }],
                usage: Usage::SCANOUT,
            })
        }

        fn create_framebuffer(&self, _imported: &ImportedBuffer) -> Result<framebuffer::Handle> {
            Err(Error::Internal("fake handler does not create real framebuffers"))
        }

        fn release(&self, _fb: framebuffer::Handle) {}
    }

    fn handler() -> FakeHandler {
        FakeHandler {
            width: 1920,
            height: 1080,
            format: DrmFourcc::Argb8888,
        }
    }

    #[test]
    fn repeated_import_of_same_handle_dedupes() {
        let h = handler();
        let mut reg = BufferRegistry::new();
        reg.begin_frame();
        reg.import(1, &h).unwrap();
        reg.mark_in_use(1);
        reg.end_frame(&h);

        reg.begin_frame();
        reg.import(1, &h).unwrap();
        reg.mark_in_use(1);
        reg.end_frame(&h);

        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unused_buffer_is_evicted_after_refcount_drops_below_zero() {
        let h = handler();
        let mut reg = BufferRegistry::new();
        reg.begin_frame();
        reg.import(1, &h).unwrap();
        reg.mark_in_use(1);
        reg.end_frame(&h);
        assert_eq!(reg.len(), 1);

        // Not imported this frame: refcount goes from 1 -> 0, still retained.
        reg.begin_frame();
        reg.end_frame(&h);
        assert_eq!(reg.len(), 1);

        // Not imported again: refcount goes from 0 -> -1, evicted.
        reg.begin_frame();
        reg.end_frame(&h);
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn distinct_handles_with_distinct_geometry_do_not_dedupe() {
        let mut reg = BufferRegistry::new();
        reg.begin_frame();
        reg.import(1, &handler()).unwrap();
        reg.mark_in_use(1);
        reg.import(
            2,
            &FakeHandler {
                width: 640,
                height: 480,
                format: DrmFourcc::Argb8888,
            },
        )
        .unwrap();
        reg.mark_in_use(2);
        reg.end_frame(&handler());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn imported_buffer_not_marked_in_use_is_treated_as_unused() {
        // A buffer imported but never bound to a committed plane (e.g. composited away)
        // must not be retained just because `import` was called this frame.
        let h = handler();
        let mut reg = BufferRegistry::new();
        reg.begin_frame();
        reg.import(1, &h).unwrap();
        // no mark_in_use: this layer ended up GPU-composited, not scanned out directly.
        reg.end_frame(&h);
        assert_eq!(reg.len(), 0);
    }
}
