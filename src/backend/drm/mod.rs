//! DRM/KMS backend: plane descriptors (C3), the plane manager (C4), the page-flip handler
//! (C6), and the concrete [`AtomicSurface`](plane_manager::AtomicSurface) implementation
//! that drives the kernel atomic-modesetting ioctl.
//!
//! Grounded in `AtomicDrmSurface::commit`/`page_flip`/`build_request` for the exact
//! `AtomicCommitFlags` combinations (spec §4.4, "Commit"); `AtomicDrmSurface` itself is not
//! reused directly since it carries connector/mode state this crate's
//! [`crate::display::Display`] owns instead.

pub mod pageflip;
pub mod plane;
pub mod plane_manager;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use drm::control::{
    atomic::AtomicModeReq, crtc, framebuffer, plane as plane_mod, AtomicCommitFlags, Device as ControlDevice,
};
use drm::Device as BasicDevice;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::utils::{DeviceFd, Rect, RectF};

use self::plane::Plane;
use self::plane_manager::{AtomicSurface, PlaneBinding, PlaneState, PlaneStateKind};

/// Per-layer geometry snapshot the surface needs to build `SRC_*`/`CRTC_*` properties,
/// captured just before `validate_layers` runs (the layers themselves are borrowed only
/// for the duration of that call).
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerGeometry {
    pub source_crop: RectF,
    pub display_frame: Rect,
}

// `drm::SystemError` is `rustix::io::Errno`; rustix provides the `std::io::Error`
// conversion we need, and exposes its own `Errno::BUSY`/etc constants for comparison
// instead of going through `libc` error codes.
pub(crate) fn to_io_error(err: drm::SystemError) -> std::io::Error {
    err.into()
}

/// Real [`AtomicSurface`] backed by a genuine `drm::control::Device`.
///
/// Holds its own clone of every plane known to the manager (so it can disable planes the
/// validation pass didn't bind) and per-frame state (layer geometry, resolved framebuffer
/// ids, and any pending CRTC/connector modeset properties) set by
/// [`Display::present`](crate::display::Display::present) before the validation algorithm
/// runs — this keeps `PlaneManager`'s buffer registry borrow and this surface's property
/// resolution from needing to alias the same data simultaneously.
pub struct DrmAtomicSurface<'a, D: ControlDevice> {
    dev: &'a D,
    crtc: crtc::Handle,
    planes: HashMap<plane_mod::Handle, Plane>,
    geometry: RefCell<Vec<LayerGeometry>>,
    framebuffers: RefCell<HashMap<usize, framebuffer::Handle>>,
    /// Type-erased CRTC/connector property writers queued by `Display::apply_pending_modeset`,
    /// applied to the request built for the next real commit and cleared afterward.
    pending_props: RefCell<Vec<Box<dyn Fn(&mut AtomicModeReq)>>>,
}

impl<'a, D: ControlDevice> std::fmt::Debug for DrmAtomicSurface<'a, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmAtomicSurface")
            .field("crtc", &self.crtc)
            .field("planes", &self.planes.len())
            .finish()
    }
}

impl<'a, D: ControlDevice> DrmAtomicSurface<'a, D> {
    pub fn new(dev: &'a D, crtc: crtc::Handle, planes: impl IntoIterator<Item = Plane>) -> Self {
        DrmAtomicSurface {
            dev,
            crtc,
            planes: planes.into_iter().map(|p| (p.handle(), p)).collect(),
            geometry: RefCell::new(Vec::new()),
            framebuffers: RefCell::new(HashMap::new()),
            pending_props: RefCell::new(Vec::new()),
        }
    }

    /// Replaces the plane set, e.g. after `update_display_state` re-enumerates planes.
    pub fn set_planes(&mut self, planes: impl IntoIterator<Item = Plane>) {
        self.planes = planes.into_iter().map(|p| (p.handle(), p)).collect();
    }

    /// Records this frame's layer geometry and resolved framebuffer ids, to be consulted by
    /// `test_commit`/`framebuffer_for`/`commit` during the upcoming `validate_layers` call.
    pub fn set_frame_state(&self, geometry: Vec<LayerGeometry>, framebuffers: HashMap<usize, framebuffer::Handle>) {
        *self.geometry.borrow_mut() = geometry;
        *self.framebuffers.borrow_mut() = framebuffers;
    }

    /// Queues a CRTC- or connector-scoped property write to be folded into the next real
    /// atomic commit (spec §4.7 step 7, "apply_pending_modeset" — DPMS, `MODE_ID`, and
    /// connector `CRTC_ID` all ride along with the plane properties in one atomic request).
    pub fn queue_property(&self, apply: impl Fn(&mut AtomicModeReq) + 'static) {
        self.pending_props.borrow_mut().push(Box::new(apply));
    }

    fn build_request(&self, states: &[PlaneState]) -> Result<AtomicModeReq> {
        let mut req = AtomicModeReq::new();
        let geometry = self.geometry.borrow();
        let framebuffers = self.framebuffers.borrow();
        let mut used = HashSet::new();

        for state in states {
            let plane = self
                .planes
                .get(&state.plane)
                .ok_or_else(|| Error::unknown_plane(state.plane))?;
            used.insert(state.plane);

            let layer_idx = match &state.kind {
                PlaneStateKind::Scanout(idx) => *idx,
                // `kRender` plane-states are drawn into a single composed buffer by the
                // compositor; the caller imports that buffer under its bottom layer's index
                // before calling commit (see Display::present).
                PlaneStateKind::Render(list) => *list.first().expect("render list never empty"),
            };
            let fb = *framebuffers
                .get(&layer_idx)
                .ok_or(Error::Internal("no framebuffer resolved for bound layer"))?;
            let geom = geometry.get(layer_idx).copied().unwrap_or_default();
            let crop = match &state.kind {
                PlaneStateKind::Scanout(_) => Rect::new(
                    geom.source_crop.x as i32,
                    geom.source_crop.y as i32,
                    geom.source_crop.w as i32,
                    geom.source_crop.h as i32,
                ),
                PlaneStateKind::Render(_) => state.frame,
            };
            plane.update_properties(&mut req, self.crtc, fb, crop, state.frame);
        }

        for (handle, plane) in &self.planes {
            if !used.contains(handle) {
                plane.disable(&mut req);
            }
        }

        for apply in self.pending_props.borrow_mut().drain(..) {
            apply(&mut req);
        }

        Ok(req)
    }
}

impl<'a, D: ControlDevice> AtomicSurface for DrmAtomicSurface<'a, D> {
    fn test_commit(&self, bindings: &[PlaneBinding]) -> bool {
        let mut req = AtomicModeReq::new();
        let geometry = self.geometry.borrow();
        let framebuffers = self.framebuffers.borrow();

        for binding in bindings {
            let Some(plane) = self.planes.get(&binding.plane) else {
                return false;
            };
            let Some(&fb) = framebuffers.get(&binding.layer) else {
                // Not yet resolved (e.g. a speculative overlay candidate probed before its
                // buffer was imported) — treat as not committable rather than panicking.
                return false;
            };
            let geom = geometry.get(binding.layer).copied().unwrap_or_default();
            let crop = Rect::new(
                geom.source_crop.x as i32,
                geom.source_crop.y as i32,
                geom.source_crop.w as i32,
                geom.source_crop.h as i32,
            );
            plane.update_properties(&mut req, self.crtc, fb, crop, geom.display_frame);
        }

        match self
            .dev
            .atomic_commit(AtomicCommitFlags::ALLOW_MODESET | AtomicCommitFlags::TEST_ONLY, req)
        {
            Ok(()) => true,
            Err(err) => {
                trace!(?err, "test-commit rejected");
                false
            }
        }
    }

    fn framebuffer_for(&self, layer: usize) -> Result<framebuffer::Handle> {
        self.framebuffers
            .borrow()
            .get(&layer)
            .copied()
            .ok_or(Error::Internal("no framebuffer resolved for layer"))
    }

    fn commit(&self, states: &[PlaneState], needs_modeset: bool) -> Result<()> {
        let req = self.build_request(states)?;

        // Matches `AtomicDrmSurface::commit`/`page_flip`: a page-flip-only commit must never
        // carry `ALLOW_MODESET`, since that would mask a bug where a modeset was silently
        // required.
        let flags = if needs_modeset {
            AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::ALLOW_MODESET
        } else {
            AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK
        };

        match self.dev.atomic_commit(flags, req) {
            Ok(()) => {
                debug!(crtc = ?self.crtc, states = states.len(), "atomic commit issued");
                Ok(())
            }
            Err(err) => {
                if err == rustix::io::Errno::BUSY {
                    warn!(crtc = ?self.crtc, "atomic commit returned EBUSY");
                    Err(Error::CommitBusy)
                } else {
                    Err(Error::CommitFailed(to_io_error(err)))
                }
            }
        }
    }
}

/// Negotiates the client capabilities every operation in this module assumes are set.
/// Universal planes must be negotiated before atomic, or the kernel never exposes overlay
/// and cursor plane objects (spec §4.8 supplement).
pub fn negotiate_client_caps<D: ControlDevice>(dev: &D) -> Result<()> {
    dev.set_client_capability(drm::control::ClientCapability::UniversalPlanes, true)
        .map_err(|e| Error::DeviceInitFailed(to_io_error(e)))?;
    dev.set_client_capability(drm::control::ClientCapability::Atomic, true)
        .map_err(|e| Error::DeviceInitFailed(to_io_error(e)))?;
    Ok(())
}

/// `DRM_MODE_TYPE_PREFERRED`, from the kernel mode-info `type` bitmask (`drm_mode.h`).
const DRM_MODE_TYPE_PREFERRED: u32 = 1 << 3;

/// The mode flagged `DRM_MODE_TYPE_PREFERRED` for a connector, or `None` if it has no modes
/// or none are flagged preferred (spec §4.8, "picks the preferred mode").
pub fn preferred_mode(connector: &drm::control::connector::Info) -> Option<drm::control::Mode> {
    connector
        .modes()
        .iter()
        .find(|m| m.type_() & DRM_MODE_TYPE_PREFERRED != 0)
        .copied()
}

/// Tries to rebind `connector` to the CRTC its current encoder already points at, matching
/// `SimpleCrtcMapper::restored_for_connector`. Returns `None` if the connector has no
/// current encoder, the encoder has no CRTC, or `taken` already claims that CRTC.
pub fn restore_crtc_for_connector<D: ControlDevice>(
    dev: &D,
    connector: &drm::control::connector::Info,
    taken: &HashSet<crtc::Handle>,
) -> Option<crtc::Handle> {
    let encoder_handle = connector.current_encoder()?;
    let encoder = dev.get_encoder(encoder_handle).ok()?;
    let crtc = encoder.crtc()?;
    if taken.contains(&crtc) {
        return None;
    }
    Some(crtc)
}

/// Assigns the first CRTC compatible with one of `connector`'s encoders that isn't already
/// in `taken`, matching `SimpleCrtcMapper::pick_next_avalible_for_connector`.
pub fn pick_crtc_for_connector<D: ControlDevice>(
    dev: &D,
    connector: &drm::control::connector::Info,
    all_crtcs: &[crtc::Handle],
    taken: &HashSet<crtc::Handle>,
) -> Option<crtc::Handle> {
    for encoder_handle in connector.encoders() {
        let Ok(encoder) = dev.get_encoder(*encoder_handle) else {
            continue;
        };
        for (index, &crtc) in all_crtcs.iter().enumerate() {
            if taken.contains(&crtc) {
                continue;
            }
            if encoder.possible_crtcs() & (1 << index) != 0 {
                return Some(crtc);
            }
        }
    }
    None
}

struct InternalDrmDeviceFd {
    fd: DeviceFd,
    privileged: bool,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                warn!(?err, "failed to release drm master lock");
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted handle to an open DRM device node (spec §4.8, `GpuDevice::Initialize`).
///
/// Tries to acquire the DRM master lock on construction and releases it on drop; newer
/// kernels grant master to whichever process opens the node first with no other master
/// attached, so a failed acquisition here just means another process (typically a display
/// manager) already holds it, and this device runs unprivileged.
#[derive(Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl std::fmt::Debug for DrmDeviceFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmDeviceFd").field("privileged", &self.0.privileged).finish()
    }
}

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for DrmDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

impl DrmDeviceFd {
    /// Opens `path` (e.g. `/dev/dri/card0`) read-write and wraps it.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
            .open(path)
            .map_err(Error::DeviceInitFailed)?;
        let owned: OwnedFd = file.into();
        Ok(Self::from_fd(DeviceFd::from(owned)))
    }

    fn from_fd(fd: DeviceFd) -> Self {
        let mut dev = InternalDrmDeviceFd { fd, privileged: false };
        match dev.acquire_master_lock() {
            Ok(()) => dev.privileged = true,
            Err(err) => info!(?err, "unable to become drm master, assuming unprivileged mode"),
        }
        DrmDeviceFd(Arc::new(dev))
    }

    pub fn device_fd(&self) -> DeviceFd {
        self.0.fd.clone()
    }
}

pub use self::plane::PlaneKind as DrmPlaneKind;
pub use self::plane_manager::PlaneManager;
