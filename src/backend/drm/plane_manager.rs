//! Plane manager (C4) — the validation algorithm and atomic commit (spec §4.4).
//!
//! Grounded in `DisplayPlaneManager::ValidateLayers`/`CommitFrame`/`TestCommit` in
//! `displayplanemanager.cpp`. The test-commit predicate is abstracted behind
//! [`AtomicSurface`] so the algorithm itself — the part spec §8 actually wants tested — runs
//! against a stub in unit tests without opening a real DRM device.

use drm::control::{crtc, framebuffer, plane};
use drm_fourcc::DrmFourcc;
use tracing::{debug, instrument, warn};

use crate::buffer::{BufferRegistry, NativeBufferHandler};
use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::utils::Rect;

use super::plane::{enumerate_planes, Plane, PlaneKind};

/// A provisional or committed plane→layer pairing, as passed to [`AtomicSurface::test_commit`].
#[derive(Debug, Clone, Copy)]
pub struct PlaneBinding {
    pub plane: plane::Handle,
    pub layer: usize,
}

/// One entry of the validated plane graph (spec §3, "Plane-state").
#[derive(Debug, Clone)]
pub struct PlaneState {
    pub plane: plane::Handle,
    pub kind: PlaneStateKind,
    /// Union of the display frames of every layer covered by this plane-state.
    pub frame: Rect,
}

#[derive(Debug, Clone)]
pub enum PlaneStateKind {
    /// Direct scanout of a single layer.
    Scanout(usize),
    /// GPU-composited: an ascending list of layer indices (spec §8, "Layer ordering").
    Render(Vec<usize>),
}

impl PlaneState {
    fn render_mut(&mut self) -> Option<&mut Vec<usize>> {
        match &mut self.kind {
            PlaneStateKind::Render(layers) => Some(layers),
            PlaneStateKind::Scanout(_) => None,
        }
    }

    fn is_render(&self) -> bool {
        matches!(self.kind, PlaneStateKind::Render(_))
    }
}

/// External, injectable half of the commit path: building the atomic request and driving
/// the kernel ioctl. Implemented for real DRM control devices; stubbed out in tests.
pub trait AtomicSurface {
    /// Runs `ATOMIC_TEST_ONLY` over every currently-committed binding plus `candidate`.
    /// A `false` here is an expected branch (spec §4.4), not an error.
    fn test_commit(&self, bindings: &[PlaneBinding]) -> bool;

    /// Allocates/looks-up a framebuffer id for `layer`'s buffer, via the buffer registry.
    fn framebuffer_for(&self, layer: usize) -> Result<framebuffer::Handle>;

    /// Builds the atomic request from `states`, disables unused planes, and issues the
    /// real commit with `{PAGE_FLIP_EVENT} ∪ {ALLOW_MODESET | NONBLOCK}` (spec §4.4,
    /// "Commit"). Returns `Ok(())` on success, `Err(Error::CommitBusy)` on EBUSY.
    fn commit(&self, states: &[PlaneState], needs_modeset: bool) -> Result<()>;
}

/// Per-display owner of plane descriptors, the buffer registry, and the validation
/// algorithm (spec §4.4, §4.2).
#[derive(Debug)]
pub struct PlaneManager {
    primary: Vec<Plane>,
    overlay: Vec<Plane>,
    cursor: Vec<Plane>,
    buffers: BufferRegistry,
}

impl PlaneManager {
    pub fn new<D: drm::control::Device>(dev: &D, crtc: crtc::Handle) -> Result<Self> {
        let (primary, overlay, cursor) = enumerate_planes(dev, crtc)?;
        Ok(PlaneManager {
            primary,
            overlay,
            cursor,
            buffers: BufferRegistry::new(),
        })
    }

    pub fn buffers(&mut self) -> &mut BufferRegistry {
        &mut self.buffers
    }

    pub fn import_layer(
        &mut self,
        handle: crate::layer::NativeHandle,
        native: &dyn NativeBufferHandler,
    ) -> Result<DrmFourcc> {
        let buf = self.buffers.import(handle, native)?;
        Ok(buf.format())
    }

    /// The core policy (spec §4.4). `formats[i]` is the imported format of `layers[i]`'s
    /// buffer. Returns the validated plane-state list and whether any plane needs GPU
    /// composition.
    #[instrument(skip(self, layers, formats, surface))]
    pub fn validate_layers(
        &mut self,
        layers: &[Layer],
        formats: &[DrmFourcc],
        surface: &dyn AtomicSurface,
    ) -> (Vec<PlaneState>, bool) {
        debug_assert_eq!(layers.len(), formats.len());

        for p in self.primary.iter_mut().chain(&mut self.overlay).chain(&mut self.cursor) {
            p.set_enabled(false);
            p.set_bound_layer(None);
        }

        if layers.is_empty() || self.primary.is_empty() {
            return (Vec::new(), false);
        }

        // Step 5 pre-pass: find the cursor layer by reverse iteration — the *last* (i.e.
        // topmost) layer carrying the cursor usage bit, per the resolved open question in
        // spec §9. It is excluded from the ordinary primary/overlay iteration below.
        let cursor_idx = layers.iter().enumerate().rev().find_map(|(idx, l)| {
            if l.is_cursor_candidate() {
                Some(idx)
            } else {
                None
            }
        });

        let mut states: Vec<PlaneState> = Vec::new();
        let mut bound: Vec<PlaneBinding> = Vec::new();

        // --- Step 1/2: primary seed + fallback -----------------------------------------
        let primary_plane = self.primary[0].handle();
        let layer0_ok = self.primary[0].validate_layer(&layers[0], formats[0]);
        let candidate = PlaneBinding {
            plane: primary_plane,
            layer: 0,
        };
        let primary_ok = layer0_ok && surface.test_commit(&[candidate]);

        if !primary_ok {
            // One-plane GPU-only path: every layer renders, in ascending order.
            warn!("primary plane rejected layer 0, falling back to full-frame GPU composition");
            let all: Vec<usize> = (0..layers.len()).collect();
            let frame = union_frames(layers, &all);
            self.primary[0].set_enabled(true);
            return (
                vec![PlaneState {
                    plane: primary_plane,
                    kind: PlaneStateKind::Render(all),
                    frame,
                }],
                true,
            );
        }

        self.primary[0].set_enabled(true);
        self.primary[0].set_bound_layer(Some(0));
        bound.push(candidate);
        states.push(PlaneState {
            plane: primary_plane,
            kind: PlaneStateKind::Scanout(0),
            frame: layers[0].display_frame,
        });

        // --- Step 3: overlay phase -------------------------------------------------------
        let mut next_layer = 1usize;
        for ov in self.overlay.iter_mut() {
            while next_layer < layers.len() {
                if Some(next_layer) == cursor_idx {
                    next_layer += 1;
                    continue;
                }
                let layer = &layers[next_layer];
                let fmt = formats[next_layer];
                let candidate = PlaneBinding {
                    plane: ov.handle(),
                    layer: next_layer,
                };
                let mut trial = bound.clone();
                trial.push(candidate);

                let ok = ov.validate_layer(layer, fmt) && surface.test_commit(&trial);
                if ok {
                    ov.set_enabled(true);
                    ov.set_bound_layer(Some(next_layer));
                    bound = trial;
                    states.push(PlaneState {
                        plane: ov.handle(),
                        kind: PlaneStateKind::Scanout(next_layer),
                        frame: layer.display_frame,
                    });
                    next_layer += 1;
                    break;
                } else {
                    fold_into_render(&mut states, next_layer, layer.display_frame);
                    next_layer += 1;
                }
            }
            if next_layer >= layers.len() {
                break;
            }
        }

        // --- Step 4: overflow -------------------------------------------------------------
        while next_layer < layers.len() {
            if Some(next_layer) == cursor_idx {
                next_layer += 1;
                continue;
            }
            fold_into_render(&mut states, next_layer, layers[next_layer].display_frame);
            next_layer += 1;
        }

        // --- Step 5: cursor phase ----------------------------------------------------------
        if let Some(idx) = cursor_idx {
            let layer = &layers[idx];
            let fmt = formats[idx];
            let mut placed = false;
            if let Some(cursor_plane) = self.cursor.first_mut() {
                let candidate = PlaneBinding {
                    plane: cursor_plane.handle(),
                    layer: idx,
                };
                let mut trial = bound.clone();
                trial.push(candidate);
                if cursor_plane.validate_layer(layer, fmt) && surface.test_commit(&trial) {
                    cursor_plane.set_enabled(true);
                    cursor_plane.set_bound_layer(Some(idx));
                    states.push(PlaneState {
                        plane: cursor_plane.handle(),
                        kind: PlaneStateKind::Scanout(idx),
                        frame: layer.display_frame,
                    });
                    placed = true;
                }
            }
            if !placed {
                fold_into_render(&mut states, idx, layer.display_frame);
            }
        }

        let render_layers = states.iter().any(PlaneState::is_render);
        debug!(
            plane_states = states.len(),
            render_layers, "validated plane-state list"
        );
        (states, render_layers)
    }

    /// Appends each plane-state's bindings, disables unused planes, attaches the flip
    /// cookie, and commits (spec §4.4, "Commit"). `EBUSY` is translated to
    /// [`Error::CommitBusy`], which is not fatal — the caller drops the frame.
    pub fn commit(
        &mut self,
        states: &[PlaneState],
        needs_modeset: bool,
        surface: &dyn AtomicSurface,
    ) -> Result<()> {
        match surface.commit(states, needs_modeset) {
            Ok(()) => Ok(()),
            Err(Error::CommitBusy) => {
                warn!("atomic commit returned EBUSY, dropping frame");
                Err(Error::CommitBusy)
            }
            Err(e) => Err(e),
        }
    }

    pub fn primary_planes(&self) -> &[Plane] {
        &self.primary
    }

    pub fn overlay_planes(&self) -> &[Plane] {
        &self.overlay
    }

    pub fn cursor_planes(&self) -> &[Plane] {
        &self.cursor
    }

    pub fn plane_kinds(&self) -> impl Iterator<Item = (plane::Handle, PlaneKind)> + '_ {
        self.primary
            .iter()
            .chain(&self.overlay)
            .chain(&self.cursor)
            .map(|p| (p.handle(), p.kind()))
    }
}

fn fold_into_render(states: &mut [PlaneState], layer_idx: usize, frame: Rect) {
    let last = states.last_mut().expect("primary seed always emits a plane-state first");
    match last.render_mut() {
        Some(list) => {
            list.push(layer_idx);
        }
        None => {
            // The last plane-state was a scanout; this is its first secondary layer, so it
            // becomes `kRender` — once entered it never leaves (spec §4.4 tie-breaks).
            let prior_scanout = match &last.kind {
                PlaneStateKind::Scanout(idx) => *idx,
                PlaneStateKind::Render(_) => unreachable!(),
            };
            last.kind = PlaneStateKind::Render(vec![prior_scanout, layer_idx]);
        }
    }
    last.frame = last.frame.union(&frame);
}

fn union_frames(layers: &[Layer], indices: &[usize]) -> Rect {
    indices
        .iter()
        .fold(Rect::default(), |acc, &i| acc.union(&layers[i].display_frame))
}

/// Builds a `PlaneManager` with stub planes and no real DRM device, for unit tests outside
/// this module that need one (e.g. `display`'s commit-path tests) — mirrors this module's
/// own `manager()` test fixture below.
#[cfg(test)]
pub(crate) fn test_plane_manager(primary: usize, overlay: usize, cursor: usize) -> PlaneManager {
    let fmt = [DrmFourcc::Argb8888];
    let make = |base: u32, count: usize, kind: PlaneKind| -> Vec<Plane> {
        (0..count)
            .map(|i| {
                Plane::new(
                    unsafe { std::mem::transmute::<u32, plane::Handle>(base + i as u32) },
                    kind,
                    0xFFFF_FFFF,
                    fmt.to_vec(),
                    super::plane::PlaneProps::default(),
                )
            })
            .collect()
    };
    PlaneManager {
        primary: make(0, primary, PlaneKind::Primary),
        overlay: make(100, overlay, PlaneKind::Overlay),
        cursor: make(200, cursor, PlaneKind::Cursor),
        buffers: BufferRegistry::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layer::{Blending, NativeHandle, Usage};
    use crate::utils::{Rect, RectF, Transform};
    use drm_fourcc::DrmFourcc;
    use std::cell::RefCell;

    fn layer(handle: NativeHandle, frame: Rect, usage: Usage) -> Layer {
        Layer {
            handle,
            source_crop: RectF::new(0.0, 0.0, frame.w as f32, frame.h as f32),
            display_frame: frame,
            transform: Transform::IDENTITY,
            blending: Blending::None,
            alpha: 1.0,
            usage,
            acquire_fence: crate::fence::Fence::Invalid,
            release_fence: crate::fence::Fence::Invalid,
        }
    }

    fn plane(id: u32, kind: PlaneKind, formats: &[DrmFourcc]) -> Plane {
        Plane::new(
            unsafe { std::mem::transmute::<u32, plane::Handle>(id) },
            kind,
            0xFFFF_FFFF,
            formats.to_vec(),
            super::super::plane::PlaneProps::default(),
        )
    }

    /// A stub surface whose `test_commit` always succeeds, used for scenarios where the
    /// kernel would accept every pairing the algorithm proposes.
    struct AlwaysOk;
    impl AtomicSurface for AlwaysOk {
        fn test_commit(&self, _bindings: &[PlaneBinding]) -> bool {
            true
        }
        fn framebuffer_for(&self, _layer: usize) -> Result<framebuffer::Handle> {
            unimplemented!()
        }
        fn commit(&self, _states: &[PlaneState], _needs_modeset: bool) -> Result<()> {
            Ok(())
        }
    }

    /// Fails every test_commit; used for the primary-fallback scenario.
    struct AlwaysFail;
    impl AtomicSurface for AlwaysFail {
        fn test_commit(&self, _bindings: &[PlaneBinding]) -> bool {
            false
        }
        fn framebuffer_for(&self, _layer: usize) -> Result<framebuffer::Handle> {
            unimplemented!()
        }
        fn commit(&self, _states: &[PlaneState], _needs_modeset: bool) -> Result<()> {
            Err(Error::CommitBusy)
        }
    }

    /// Succeeds up to a fixed number of simultaneously-bound planes, modelling a device
    /// that runs out of overlay bandwidth after N scanout planes are in use.
    struct FailAfterNPlanes(RefCell<usize>, usize);
    impl AtomicSurface for FailAfterNPlanes {
        fn test_commit(&self, bindings: &[PlaneBinding]) -> bool {
            bindings.len() <= self.1
        }
        fn framebuffer_for(&self, _layer: usize) -> Result<framebuffer::Handle> {
            unimplemented!()
        }
        fn commit(&self, _states: &[PlaneState], _needs_modeset: bool) -> Result<()> {
            *self.0.borrow_mut() += 1;
            Ok(())
        }
    }

    fn manager(primary: usize, overlay: usize, cursor: usize) -> PlaneManager {
        let fmt = [DrmFourcc::Argb8888];
        PlaneManager {
            primary: (0..primary).map(|i| plane(i as u32, PlaneKind::Primary, &fmt)).collect(),
            overlay: (0..overlay)
                .map(|i| plane(100 + i as u32, PlaneKind::Overlay, &fmt))
                .collect(),
            cursor: (0..cursor).map(|i| plane(200 + i as u32, PlaneKind::Cursor, &fmt)).collect(),
            buffers: BufferRegistry::new(),
        }
    }

    #[test]
    fn single_primary_scanout() {
        let mut mgr = manager(1, 0, 0);
        let layers = vec![layer(1, Rect::new(0, 0, 1920, 1080), Usage::SCANOUT)];
        let formats = vec![DrmFourcc::Argb8888];
        let (states, render_layers) = mgr.validate_layers(&layers, &formats, &AlwaysOk);
        assert!(!render_layers);
        assert_eq!(states.len(), 1);
        assert!(matches!(states[0].kind, PlaneStateKind::Scanout(0)));
    }

    #[test]
    fn primary_plus_one_overlay() {
        let mut mgr = manager(1, 1, 0);
        let layers = vec![
            layer(1, Rect::new(0, 0, 1920, 1080), Usage::SCANOUT),
            layer(2, Rect::new(100, 100, 200, 200), Usage::SCANOUT),
        ];
        let formats = vec![DrmFourcc::Argb8888, DrmFourcc::Argb8888];
        let (states, render_layers) = mgr.validate_layers(&layers, &formats, &AlwaysOk);
        assert!(!render_layers);
        assert_eq!(states.len(), 2);
        assert!(matches!(states[0].kind, PlaneStateKind::Scanout(0)));
        assert!(matches!(states[1].kind, PlaneStateKind::Scanout(1)));
    }

    #[test]
    fn primary_fallback_renders_every_layer() {
        let mut mgr = manager(1, 1, 0);
        let layers = vec![layer(1, Rect::new(0, 0, 1920, 1080), Usage::SCANOUT)];
        let formats = vec![DrmFourcc::Argb8888];
        let (states, render_layers) = mgr.validate_layers(&layers, &formats, &AlwaysFail);
        assert!(render_layers);
        assert_eq!(states.len(), 1);
        match &states[0].kind {
            PlaneStateKind::Render(layers) => assert_eq!(layers, &vec![0]),
            _ => panic!("expected a render plane-state"),
        }
    }

    #[test]
    fn overlay_exhaustion_folds_tail_into_last_render_state() {
        let mut mgr = manager(1, 1, 0);
        let layers = vec![
            layer(1, Rect::new(0, 0, 1920, 1080), Usage::SCANOUT),
            layer(2, Rect::new(0, 0, 100, 100), Usage::SCANOUT),
            layer(3, Rect::new(0, 0, 100, 100), Usage::SCANOUT),
            layer(4, Rect::new(0, 0, 100, 100), Usage::SCANOUT),
        ];
        let formats = vec![DrmFourcc::Argb8888; 4];
        // Accept at most 2 simultaneously bound planes (primary + one overlay); every
        // subsequent candidate test-commit fails, forcing layers 2 and 3 into the overlay's
        // render list.
        let surface = FailAfterNPlanes(RefCell::new(0), 2);
        let (states, render_layers) = mgr.validate_layers(&layers, &formats, &surface);
        assert!(render_layers);
        assert_eq!(states.len(), 2);
        assert!(matches!(states[0].kind, PlaneStateKind::Scanout(0)));
        match &states[1].kind {
            PlaneStateKind::Render(list) => assert_eq!(list, &vec![1, 2, 3]),
            _ => panic!("expected overlay plane-state to have folded into kRender"),
        }
    }

    #[test]
    fn cursor_dedicated_plane() {
        let mut mgr = manager(1, 1, 1);
        let layers = vec![
            layer(1, Rect::new(0, 0, 1920, 1080), Usage::SCANOUT),
            layer(2, Rect::new(0, 0, 200, 200), Usage::SCANOUT),
            layer(3, Rect::new(10, 10, 32, 32), Usage::CURSOR),
        ];
        let formats = vec![DrmFourcc::Argb8888; 3];
        let (states, render_layers) = mgr.validate_layers(&layers, &formats, &AlwaysOk);
        assert!(!render_layers);
        assert_eq!(states.len(), 3);
        assert!(matches!(states[0].kind, PlaneStateKind::Scanout(0)));
        assert!(matches!(states[1].kind, PlaneStateKind::Scanout(1)));
        assert!(matches!(states[2].kind, PlaneStateKind::Scanout(2)));
    }

    #[test]
    fn only_topmost_cursor_layer_is_treated_as_cursor() {
        let mut mgr = manager(1, 2, 1);
        let layers = vec![
            layer(1, Rect::new(0, 0, 1920, 1080), Usage::SCANOUT),
            layer(2, Rect::new(10, 10, 32, 32), Usage::CURSOR),
            layer(3, Rect::new(20, 20, 32, 32), Usage::CURSOR),
        ];
        let formats = vec![DrmFourcc::Argb8888; 3];
        let (states, _) = mgr.validate_layers(&layers, &formats, &AlwaysOk);
        // Layer 2 is treated as an ordinary overlay candidate; only layer 3 (topmost with
        // the cursor bit) goes through the cursor phase.
        let cursor_state = states.iter().find(|s| matches!(s.kind, PlaneStateKind::Scanout(2)));
        assert!(cursor_state.is_some());
        assert!(states.iter().any(|s| matches!(s.kind, PlaneStateKind::Scanout(1))));
    }
}
