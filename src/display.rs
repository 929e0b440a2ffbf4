//! Display (C7): the per-connector façade that runs the frame pipeline.
//!
//! Grounded in `InternalDisplay::Present`/`Connect`/`ApplyPendingModeset` in
//! `internaldisplay.cpp` for the pipeline's step order, and in spec §9's "virtual
//! inheritance" design note for the physical/virtual/headless split.

use std::collections::HashMap;
use std::sync::Arc;

use drm::control::{connector, crtc, property, Device as ControlDevice};
use tracing::{debug, instrument, warn};

use crate::backend::drm::pageflip::{PageFlipHandler, VsyncTime};
use crate::backend::drm::plane::Plane;
use crate::backend::drm::plane_manager::{AtomicSurface, PlaneManager, PlaneState};
use crate::backend::drm::{negotiate_client_caps, DrmAtomicSurface, LayerGeometry};
use crate::buffer::NativeBufferHandler;
use crate::compositor::{Compositor, Renderer};
use crate::error::{Error, Result};
use crate::fence::Fence;
use crate::layer::Layer;
use crate::utils::Rect;

/// µm per inch, used for the DPI formula (spec §6, "DPI is reported in dots per 1000
/// inches").
const UM_PER_INCH: i64 = 25400;

bitflags::bitflags! {
    /// Operations deferred to the next `present()` call (spec §3, "pending-ops bitmask").
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PendingOps: u8 {
        const DPMS = 0b01;
        const MODESET = 0b10;
    }
}

/// Power state applied via the connector's DPMS property (spec §6,
/// `set_dpms(on|off|suspend|standby)`). Values match `DRM_MODE_DPMS_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpmsState {
    On = 0,
    Standby = 1,
    Suspend = 2,
    Off = 3,
}

/// The attribute queried by `get_attribute` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Width,
    Height,
    RefreshMilliHz,
    DpiX,
    DpiY,
}

#[derive(Debug, Clone, Default)]
struct ConnectorProps {
    crtc_id: property::Handle,
    dpms: Option<property::Handle>,
}

/// The connector currently bound to a physical display's CRTC, plus its resolved property
/// ids. `None` while the pipe has no monitor attached (spec §4.8, "Disconnected displays").
#[derive(Debug, Clone)]
struct ConnectorBinding {
    connector: connector::Handle,
    props: ConnectorProps,
}

fn resolve_connector_props<D: ControlDevice>(dev: &D, handle: connector::Handle) -> Result<ConnectorProps> {
    let props = dev
        .get_properties(handle)
        .map_err(|e| Error::DeviceInitFailed(e.into()))?;
    let mut crtc_id = None;
    let mut dpms = None;
    for (prop_handle, _) in props.iter() {
        if let Ok(info) = dev.get_property(*prop_handle) {
            match info.name().to_str() {
                Ok("CRTC_ID") => crtc_id = Some(*prop_handle),
                Ok("DPMS") => dpms = Some(*prop_handle),
                _ => {}
            }
        }
    }
    Ok(ConnectorProps {
        crtc_id: crtc_id.ok_or(Error::Internal("missing connector CRTC_ID property"))?,
        dpms,
    })
}

/// A geometric/timing snapshot derived from the active mode and connector (spec §6, DPI and
/// refresh formulas).
#[derive(Debug, Clone, Copy, Default)]
struct ModeInfo {
    width: u32,
    height: u32,
    refresh_milli_hz: u32,
    dpi_x: i32,
    dpi_y: i32,
}

fn mode_info(mode: &drm::control::Mode, mm_width: u32, mm_height: u32) -> ModeInfo {
    let (width, height) = mode.size();
    let (_, _, htotal) = mode.hsync();
    let (_, _, vtotal) = mode.vsync();
    let refresh_milli_hz = if htotal == 0 || vtotal == 0 {
        0
    } else {
        (mode.clock() as u64 * 1000 / (htotal as u64 * vtotal as u64)) as u32
    };
    let dpi = |px: u32, mm: u32| -> i32 {
        if mm == 0 {
            -1
        } else {
            ((px as i64 * UM_PER_INCH) / mm as i64) as i32
        }
    };
    ModeInfo {
        width: width as u32,
        height: height as u32,
        refresh_milli_hz,
        dpi_x: dpi(width as u32, mm_width),
        dpi_y: dpi(height as u32, mm_height),
    }
}

/// What kind of backing a [`Display`] has (spec §9, "virtual inheritance").
enum Backing<D: ControlDevice, R: Renderer> {
    /// A real connector driven through DRM/KMS.
    Physical {
        dev: Arc<D>,
        crtc: crtc::Handle,
        /// Set by [`Display::connect`], cleared by [`Display::disconnect`]; built
        /// independent of connector state per spec §4.8 supplement (one `Display` per
        /// enumerated CRTC, regardless of what, if anything, is plugged into it).
        binding: Option<ConnectorBinding>,
        plane_manager: PlaneManager,
        mode: Option<drm::control::Mode>,
        mode_mm: (u32, u32),
        pending_ops: PendingOps,
        dpms: DpmsState,
        current_blob: Option<property::Value<'static>>,
        surface_ring_depth: usize,
    },
    /// An offscreen-only target for screen capture / headless rendering; never scans out.
    Virtual,
    /// No physical connector bound; present() is a no-op success (spec §4.8, "headless stub
    /// display").
    Headless,
}

/// Per-connector façade owning the plane manager, compositor, and page-flip handler for one
/// output (spec §3, "Display"; §4.7).
pub struct Display<D: ControlDevice, R: Renderer> {
    id: u64,
    backing: Backing<D, R>,
    compositor: Compositor<R>,
    pageflip: PageFlipHandler,
    native: Arc<dyn NativeBufferHandler>,
    retire: Fence,
    next_retire: Fence,
    vsync_enabled: bool,
    vsync_callback: Option<Arc<dyn Fn(u32, u32) + Send + Sync>>,
}

impl<D: ControlDevice, R: Renderer> std::fmt::Debug for Display<D, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Display").field("id", &self.id).finish()
    }
}

impl<D: ControlDevice, R: Renderer> Display<D, R> {
    /// Builds a physical display bound to `crtc`/`connector` (spec §4.8, one `InternalDisplay`
    /// per enumerated CRTC).
    pub fn new_physical(
        id: u64,
        dev: Arc<D>,
        crtc: crtc::Handle,
        native: Arc<dyn NativeBufferHandler>,
        renderer: R,
        surface_ring_depth: usize,
    ) -> Result<Self> {
        negotiate_client_caps(dev.as_ref())?;
        let plane_manager = PlaneManager::new(dev.as_ref(), crtc)?;
        Ok(Display {
            id,
            backing: Backing::Physical {
                dev,
                crtc,
                binding: None,
                plane_manager,
                mode: None,
                mode_mm: (0, 0),
                pending_ops: PendingOps::empty(),
                dpms: DpmsState::On,
                current_blob: None,
                surface_ring_depth,
            },
            compositor: Compositor::new(renderer),
            pageflip: PageFlipHandler::new(id),
            native,
            retire: Fence::Invalid,
            next_retire: Fence::Invalid,
            vsync_enabled: false,
            vsync_callback: None,
        })
    }

    /// Binds `connector` to this display's CRTC, resolving its DPMS/`CRTC_ID` property ids
    /// (spec §4.8, `UpdateDisplayState`). Replaces any previous binding.
    pub fn connect(
        &mut self,
        connector: connector::Handle,
        mode: drm::control::Mode,
        mm_width: u32,
        mm_height: u32,
    ) -> Result<()> {
        let Backing::Physical { dev, binding, mode: slot, mode_mm, pending_ops, .. } = &mut self.backing else {
            return Ok(());
        };
        let props = resolve_connector_props(dev.as_ref(), connector)?;
        *binding = Some(ConnectorBinding { connector, props });
        *slot = Some(mode);
        *mode_mm = (mm_width, mm_height);
        pending_ops.insert(PendingOps::MODESET);
        Ok(())
    }

    /// Unbinds the current connector, soft-disconnecting the pipe (spec §4.8,
    /// `DisConnect` — the plane manager and CRTC assignment survive; a future `connect()` to
    /// the same or a different connector reuses them).
    pub fn disconnect(&mut self) {
        if let Backing::Physical { binding, .. } = &mut self.backing {
            *binding = None;
        }
        self.pageflip.cancel_all();
    }

    /// The CRTC this physical display owns, for routing kernel events back to a `Display` by
    /// CRTC handle (spec §4.8).
    pub fn crtc(&self) -> Option<crtc::Handle> {
        match &self.backing {
            Backing::Physical { crtc, .. } => Some(*crtc),
            _ => None,
        }
    }

    /// Builds the always-present offscreen/capture display (spec §4.8, `get_virtual_display`).
    pub fn new_virtual(id: u64, native: Arc<dyn NativeBufferHandler>, renderer: R) -> Self {
        Display {
            id,
            backing: Backing::Virtual,
            compositor: Compositor::new(renderer),
            pageflip: PageFlipHandler::new(id),
            native,
            retire: Fence::Invalid,
            next_retire: Fence::Invalid,
            vsync_enabled: false,
            vsync_callback: None,
        }
    }

    /// Builds the headless stub installed when no connector is plugged in (spec §4.8).
    pub fn new_headless(id: u64, native: Arc<dyn NativeBufferHandler>, renderer: R) -> Self {
        Display {
            id,
            backing: Backing::Headless,
            compositor: Compositor::new(renderer),
            pageflip: PageFlipHandler::new(id),
            native,
            retire: Fence::Invalid,
            next_retire: Fence::Invalid,
            vsync_enabled: false,
            vsync_callback: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        matches!(&self.backing, Backing::Physical { binding: Some(_), .. })
    }

    /// Sets the active mode, queuing a modeset for the next `present()` (spec §6,
    /// `set_active_config`).
    pub fn set_active_config(&mut self, mode: drm::control::Mode, mm_width: u32, mm_height: u32) {
        if let Backing::Physical { mode: slot, mode_mm, pending_ops, .. } = &mut self.backing {
            *slot = Some(mode);
            *mode_mm = (mm_width, mm_height);
            pending_ops.insert(PendingOps::MODESET);
        }
    }

    /// Queues a DPMS state change for the next `present()` (spec §6, `set_dpms`).
    pub fn set_dpms(&mut self, state: DpmsState) {
        if let Backing::Physical { dpms, pending_ops, .. } = &mut self.backing {
            *dpms = state;
            pending_ops.insert(PendingOps::DPMS);
        }
    }

    pub fn set_vsync_enabled(&mut self, enabled: bool) {
        self.vsync_enabled = enabled;
        self.pageflip.set_vsync_enabled(enabled);
    }

    /// Registers the subscriber notified with (seconds, microseconds) on every page-flip
    /// completion once vsync is enabled (spec §6). Only one subscriber at a time; a second
    /// call replaces the first, matching the source's single vsync-callback slot per display.
    pub fn register_vsync_callback<F>(&mut self, callback: F)
    where
        F: Fn(u32, u32) + Send + Sync + 'static,
    {
        self.vsync_callback = Some(Arc::new(callback));
    }

    /// Reads a geometric/timing attribute of the currently active mode (spec §6,
    /// `get_attribute`). Returns `None` for a virtual/headless display or before a mode has
    /// been set.
    pub fn get_attribute(&self, attr: Attribute) -> Option<i64> {
        let Backing::Physical { mode, mode_mm, .. } = &self.backing else {
            return None;
        };
        let mode = mode.as_ref()?;
        let info = mode_info(mode, mode_mm.0, mode_mm.1);
        Some(match attr {
            Attribute::Width => info.width as i64,
            Attribute::Height => info.height as i64,
            Attribute::RefreshMilliHz => info.refresh_milli_hz as i64,
            Attribute::DpiX => info.dpi_x as i64,
            Attribute::DpiY => info.dpi_y as i64,
        })
    }

    /// Delivers a kernel page-flip completion event for this display (spec §4.6). The
    /// manager routes events to displays by CRTC handle, not by cookie, so this resolves
    /// whatever single flip is outstanding rather than matching an opaque id. Dispatches the
    /// registered vsync subscriber itself (spec §9, "message-passing of completion events"):
    /// the page-flip handler only tracks and traces, the display owns delivery.
    pub fn handle_page_flip_event(&self, sec: u32, usec: u32) {
        self.pageflip.complete_next(VsyncTime { sec, usec });
        if self.vsync_enabled {
            if let Some(callback) = &self.vsync_callback {
                callback(sec, usec);
            }
        }
    }

    /// Forcibly signals every outstanding fence, e.g. on connector disconnect (spec §4.6,
    /// "Cancellation").
    pub fn shutdown(&mut self) {
        self.pageflip.cancel_all();
        if let Backing::Physical { pending_ops, .. } = &mut self.backing {
            pending_ops.insert(PendingOps::DPMS);
        }
    }

    /// Runs the full per-frame pipeline (spec §4.7).
    #[instrument(skip(self, layers), fields(display = self.id))]
    pub fn present(&mut self, layers: &mut [Layer]) -> Result<Fence> {
        match &mut self.backing {
            Backing::Headless | Backing::Virtual => {
                // step 1-2: still merge and promote fences so callers observe the usual
                // handshake even though nothing is rendered.
                self.next_retire = Fence::merge(self.next_retire.clone(), Fence::Invalid);
                let retired = std::mem::replace(&mut self.retire, self.next_retire.clone());
                Ok(retired)
            }
            Backing::Physical {
                dev,
                crtc,
                binding,
                plane_manager,
                mode,
                pending_ops,
                dpms,
                current_blob,
                surface_ring_depth,
                ..
            } => {
                // A pipe with no monitor plugged in has nothing to scan out to; callers
                // retry once a hotplug event reconnects it (spec §4.8, "Disconnected
                // displays").
                let Some(binding) = binding.as_ref() else {
                    return Err(Error::Disconnected);
                };
                let connector = binding.connector;
                let connector_props = &binding.props;

                // step 4: import every layer's native buffer, gather its format and
                // resolved framebuffer id.
                plane_manager.buffers().begin_frame();
                let mut formats = Vec::with_capacity(layers.len());
                let mut geometry = Vec::with_capacity(layers.len());
                let mut framebuffers = HashMap::new();

                for (idx, layer) in layers.iter().enumerate() {
                    let fmt = plane_manager.import_layer(layer.handle, self.native.as_ref())?;
                    formats.push(fmt);
                    geometry.push(LayerGeometry {
                        source_crop: layer.source_crop,
                        display_frame: layer.display_frame,
                    });
                    let buf = plane_manager.buffers().get_mut(layer.handle).expect("just imported");
                    let fb = buf.framebuffer(self.native.as_ref())?;
                    framebuffers.insert(idx, fb);
                }

                let planes: Vec<Plane> = plane_manager
                    .primary_planes()
                    .iter()
                    .chain(plane_manager.overlay_planes())
                    .chain(plane_manager.cursor_planes())
                    .cloned()
                    .collect();
                let surface = DrmAtomicSurface::new(dev.as_ref(), *crtc, planes);
                surface.set_frame_state(geometry.clone(), framebuffers.clone());

                // step 5
                let (states, render_layers) = plane_manager.validate_layers(layers, &formats, &surface);

                // Only buffers that end up bound to a committed plane are in use (spec
                // §4.2); a layer folded into GPU composition marks the composited surface's
                // buffer instead, below, once that surface exists.
                for state in &states {
                    if let crate::backend::drm::plane_manager::PlaneStateKind::Scanout(idx) = state.kind {
                        plane_manager.buffers().mark_in_use(layers[idx].handle);
                    }
                }

                // step 6
                let mut composited_fence = Fence::Invalid;
                if render_layers {
                    self.compositor.ensure_ring(
                        mode.map(|m| m.size().0 as u32).unwrap_or(1920),
                        mode.map(|m| m.size().1 as u32).unwrap_or(1080),
                        *surface_ring_depth,
                    )?;
                    self.compositor.begin_frame()?;
                    let render_lists: Vec<&[usize]> = states
                        .iter()
                        .filter_map(|s| match &s.kind {
                            crate::backend::drm::plane_manager::PlaneStateKind::Render(list) => Some(list.as_slice()),
                            _ => None,
                        })
                        .collect();
                    self.compositor.draw(layers, &render_lists)?;
                    let composited_handle = self
                        .compositor
                        .current_surface_handle()
                        .expect("begin_frame set the current surface");
                    composited_fence = self.compositor.end_frame(true)?;

                    // The composed surface becomes the bound framebuffer for every kRender
                    // plane-state's bottom layer index (see DrmAtomicSurface::build_request),
                    // imported through the ordinary buffer registry like any other layer.
                    plane_manager.import_layer(composited_handle, self.native.as_ref())?;
                    plane_manager.buffers().mark_in_use(composited_handle);
                    let composited_fb = plane_manager
                        .buffers()
                        .get_mut(composited_handle)
                        .expect("just imported")
                        .framebuffer(self.native.as_ref())?;
                    for state in &states {
                        if let crate::backend::drm::plane_manager::PlaneStateKind::Render(list) = &state.kind {
                            if let Some(&first) = list.first() {
                                framebuffers.insert(first, composited_fb);
                            }
                        }
                    }
                    surface.set_frame_state(geometry.clone(), framebuffers.clone());
                }

                // step 7: apply pending DPMS / modeset into the same atomic request the
                // commit below issues.
                if pending_ops.contains(PendingOps::DPMS) {
                    if let Some(dpms_prop) = connector_props.dpms {
                        let conn = connector;
                        let value = *dpms as u64;
                        surface.queue_property(move |req| {
                            req.add_property(conn, dpms_prop, value.into());
                        });
                    }
                }
                let needs_modeset = pending_ops.contains(PendingOps::MODESET);
                if needs_modeset {
                    if let Some(m) = mode {
                        let blob = dev
                            .create_property_blob(m)
                            .map_err(|e| Error::ModeBlobFailed(e.into()))?;
                        let old_blob = current_blob.replace(blob.clone());
                        let conn = connector;
                        let crtc_id_prop = connector_props.crtc_id;
                        let crtc_handle = *crtc;
                        surface.queue_property(move |req| {
                            req.add_property(conn, crtc_id_prop, (Into::<u32>::into(crtc_handle) as u64).into());
                        });
                        if let Some(old) = old_blob {
                            if let property::Value::Blob(id) = old {
                                if let Err(err) = dev.destroy_property_blob(id) {
                                    warn!(?err, "failed to destroy previous mode property blob");
                                }
                            }
                        }
                    }
                }

                // steps 8-10: commit and apply its result to fences/buffer lifetimes.
                finish_commit(
                    plane_manager,
                    &surface,
                    &states,
                    needs_modeset,
                    pending_ops,
                    layers,
                    composited_fence,
                    &self.pageflip,
                    self.native.as_ref(),
                    &mut self.retire,
                    &mut self.next_retire,
                )
            }
        }
    }

    /// Renders the given layers into a caller-supplied native target instead of scanning
    /// them out (spec §4.5, "Offscreen mode").
    pub fn present_offscreen(
        &mut self,
        handle: crate::layer::NativeHandle,
        width: u32,
        height: u32,
        layers: &[Layer],
    ) -> Result<Fence> {
        let all: Vec<usize> = (0..layers.len()).collect();
        self.compositor.draw_offscreen(handle, width, height, layers, &[], &all)
    }

    pub fn union_visible_frame(&self, layers: &[Layer]) -> Rect {
        layers.iter().fold(Rect::default(), |acc, l| acc.union(&l.display_frame))
    }
}

/// The device-independent tail of `present()`'s physical path (spec §4.7 steps 8-10):
/// issues release fences, commits, and on `EBUSY` drops the frame instead of propagating an
/// error (spec §8 scenario 6). Generic over [`AtomicSurface`] rather than tied to
/// [`DrmAtomicSurface`] so it can run against a stub surface in tests without a real DRM
/// device, the same seam `plane_manager`'s validation-algorithm tests already use.
#[allow(clippy::too_many_arguments)]
fn finish_commit<S: AtomicSurface>(
    plane_manager: &mut PlaneManager,
    surface: &S,
    states: &[PlaneState],
    needs_modeset: bool,
    pending_ops: &mut PendingOps,
    layers: &mut [Layer],
    composited_fence: Fence,
    pageflip: &PageFlipHandler,
    native: &dyn NativeBufferHandler,
    retire: &mut Fence,
    next_retire: &mut Fence,
) -> Result<Fence> {
    // Issue per-layer release fences from the page-flip handler's timeline before the real
    // commit, matching the source's "issue release fences, then commit" order.
    let (_cookie, out_fence) = pageflip.submit();
    for layer in layers.iter_mut() {
        layer.release_fence = out_fence.clone();
    }

    match plane_manager.commit(states, needs_modeset, surface) {
        Ok(()) => {
            pending_ops.remove(PendingOps::DPMS | PendingOps::MODESET);
        }
        Err(Error::CommitBusy) => {
            for layer in layers.iter_mut() {
                layer.release_fence = Fence::Invalid;
            }
            plane_manager.buffers().end_frame(native);
            debug!("commit dropped this frame (EBUSY)");
            return Ok(retire.clone());
        }
        Err(e) => return Err(e),
    }

    plane_manager.buffers().end_frame(native);

    *next_retire = Fence::merge(next_retire.clone(), out_fence);
    *next_retire = Fence::merge(next_retire.clone(), composited_fence);
    let retired = std::mem::replace(retire, next_retire.clone());
    Ok(retired)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::drm::plane_manager::{test_plane_manager, PlaneBinding, PlaneStateKind};
    use crate::buffer::{ImportedBuffer, NativeBufferHandler, PlaneDescriptor};
    use crate::error::Error;
    use crate::layer::NativeHandle;
    use drm::control::{framebuffer, plane};
    use drm_fourcc::{DrmFourcc, DrmModifier};

    #[derive(Debug)]
    struct FakeHandler;
    impl NativeBufferHandler for FakeHandler {
        fn import(&self, handle: NativeHandle) -> Result<ImportedBuffer> {
            Ok(ImportedBuffer {
                format: DrmFourcc::Argb8888,
                width: 1920,
                height: 1080,
                modifier: DrmModifier::Linear,
                planes: vec![PlaneDescriptor { fd: handle as i32, stride: 7680, offset: 0 }],
                usage: crate::layer::Usage::SCANOUT,
            })
        }
        fn create_framebuffer(&self, _imported: &ImportedBuffer) -> Result<framebuffer::Handle> {
            Ok(unsafe { std::mem::transmute::<u32, framebuffer::Handle>(1) })
        }
        fn release(&self, _fb: framebuffer::Handle) {}
    }

    struct StubSurface {
        commit_result: std::cell::RefCell<Option<Result<()>>>,
    }
    impl StubSurface {
        fn ok() -> Self {
            StubSurface { commit_result: std::cell::RefCell::new(Some(Ok(()))) }
        }
        fn busy() -> Self {
            StubSurface { commit_result: std::cell::RefCell::new(Some(Err(Error::CommitBusy))) }
        }
    }
    impl AtomicSurface for StubSurface {
        fn test_commit(&self, _bindings: &[PlaneBinding]) -> bool {
            true
        }
        fn framebuffer_for(&self, _layer: usize) -> Result<framebuffer::Handle> {
            unimplemented!()
        }
        fn commit(&self, _states: &[PlaneState], _needs_modeset: bool) -> Result<()> {
            self.commit_result.borrow_mut().take().expect("commit called once")
        }
    }

    fn one_scanout_state() -> Vec<PlaneState> {
        vec![PlaneState {
            plane: unsafe { std::mem::transmute::<u32, plane::Handle>(1) },
            kind: PlaneStateKind::Scanout(0),
            frame: Rect::new(0, 0, 1920, 1080),
        }]
    }

    fn one_layer() -> Layer {
        Layer {
            handle: 1,
            source_crop: crate::utils::RectF::new(0.0, 0.0, 1920.0, 1080.0),
            display_frame: Rect::new(0, 0, 1920, 1080),
            transform: crate::utils::Transform::IDENTITY,
            blending: crate::layer::Blending::None,
            alpha: 1.0,
            usage: crate::layer::Usage::empty(),
            acquire_fence: Fence::Invalid,
            release_fence: Fence::Invalid,
        }
    }

    #[test]
    fn normal_commit_clears_pending_ops_and_retires_a_fence() {
        let mut plane_manager = test_plane_manager(1, 0, 0);
        let native = FakeHandler;
        let mut layers = vec![one_layer()];
        plane_manager.buffers().begin_frame();
        plane_manager.import_layer(layers[0].handle, &native).unwrap();
        plane_manager.buffers().mark_in_use(layers[0].handle);

        let surface = StubSurface::ok();
        let states = one_scanout_state();
        let mut pending_ops = PendingOps::MODESET;
        let pageflip = PageFlipHandler::new(1);
        let mut retire = Fence::Invalid;
        let mut next_retire = Fence::Invalid;

        let result = finish_commit(
            &mut plane_manager,
            &surface,
            &states,
            true,
            &mut pending_ops,
            &mut layers,
            Fence::Invalid,
            &pageflip,
            &native,
            &mut retire,
            &mut next_retire,
        );

        assert!(result.is_ok());
        assert!(pending_ops.is_empty());
        assert!(layers[0].release_fence.is_valid());
        assert_eq!(plane_manager.buffers().len(), 1);
    }

    #[test]
    fn ebusy_drops_the_frame_and_invalidates_release_fences() {
        let mut plane_manager = test_plane_manager(1, 0, 0);
        let native = FakeHandler;
        let mut layers = vec![one_layer()];
        plane_manager.buffers().begin_frame();
        plane_manager.import_layer(layers[0].handle, &native).unwrap();
        plane_manager.buffers().mark_in_use(layers[0].handle);

        let surface = StubSurface::busy();
        let states = one_scanout_state();
        let mut pending_ops = PendingOps::MODESET;
        let pageflip = PageFlipHandler::new(1);
        let mut retire = Fence::Invalid;
        let mut next_retire = Fence::Invalid;

        let result = finish_commit(
            &mut plane_manager,
            &surface,
            &states,
            true,
            &mut pending_ops,
            &mut layers,
            Fence::Invalid,
            &pageflip,
            &native,
            &mut retire,
            &mut next_retire,
        );

        assert!(result.is_ok());
        // EBUSY is not fatal, and must not be mistaken for a successful modeset.
        assert!(pending_ops.contains(PendingOps::MODESET));
        assert!(!layers[0].release_fence.is_valid());
        // Its buffer was already marked bound to a committed plane before the commit was
        // attempted (matching real `present()` ordering), so the dropped frame doesn't
        // evict it.
        assert_eq!(plane_manager.buffers().len(), 1);
    }
}
