//! Plane descriptor (C3).
//!
//! Grounded in `displayplanemanager.cpp`'s `UpdateProperties`/`ValidateLayer` and in
//! `AtomicDrmSurface::build_request` for the exact atomic property layout. One [`Plane`]
//! wraps a kernel plane object plus the property ids resolved for it once at construction
//! time — re-resolving property ids every frame would mean a `drmModeObjectGetProperties`
//! round-trip per plane per frame, which the source and the teacher both avoid.

use std::collections::HashMap;

use drm::control::{crtc, plane, Device as ControlDevice};
use drm_fourcc::DrmFourcc;
use tracing::trace;

use crate::error::{Error, Result};
use crate::layer::{Blending, Layer};
use crate::utils::{Rect, Transform};

/// The three plane types the kernel distinguishes, in the order validation walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlaneKind {
    Primary,
    Overlay,
    Cursor,
}

/// Resolved property ids for one plane, looked up once by name against
/// `drmModeObjectGetProperties`.
#[derive(Debug, Clone, Default)]
pub struct PlaneProps {
    pub fb_id: plane::property::Handle,
    pub crtc_id: plane::property::Handle,
    pub src_x: plane::property::Handle,
    pub src_y: plane::property::Handle,
    pub src_w: plane::property::Handle,
    pub src_h: plane::property::Handle,
    pub crtc_x: plane::property::Handle,
    pub crtc_y: plane::property::Handle,
    pub crtc_w: plane::property::Handle,
    pub crtc_h: plane::property::Handle,
}

/// One hardware plane (spec §3, "Plane").
#[derive(Debug, Clone)]
pub struct Plane {
    handle: plane::Handle,
    kind: PlaneKind,
    possible_crtcs: u32,
    formats: Vec<DrmFourcc>,
    props: PlaneProps,
    enabled: bool,
    bound_layer: Option<usize>,
}

impl Plane {
    pub fn new(
        handle: plane::Handle,
        kind: PlaneKind,
        possible_crtcs: u32,
        formats: Vec<DrmFourcc>,
        props: PlaneProps,
    ) -> Self {
        Plane {
            handle,
            kind,
            possible_crtcs,
            formats,
            props,
            enabled: false,
            bound_layer: None,
        }
    }

    pub fn handle(&self) -> plane::Handle {
        self.handle
    }

    pub fn kind(&self) -> PlaneKind {
        self.kind
    }

    pub fn compatible_with(&self, crtc_index: u32) -> bool {
        self.possible_crtcs & (1 << crtc_index) != 0
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn bound_layer(&self) -> Option<usize> {
        self.bound_layer
    }

    pub fn set_bound_layer(&mut self, idx: Option<usize>) {
        self.bound_layer = idx;
    }

    /// Pure predicate over format, crop, transform, alpha and blending against this plane's
    /// capability set (spec §4.3). Never fails or logs; a `false` here is the normal signal
    /// that drives the overlay/cursor fallback branches of the validation algorithm.
    ///
    /// No plane here resolves a `ROTATION` property, so any transform other than identity
    /// is outside this plane's capability set and must fall back to GPU composition, where
    /// `compositor::transform_matrix` applies it instead. Likewise straight (non-premultiplied)
    /// coverage blending has no corresponding KMS pixel-blend-mode value and is rejected the
    /// same way; `None` and `Premultiplied` are the blend modes scanout hardware actually
    /// exposes.
    pub fn validate_layer(&self, layer: &Layer, format: DrmFourcc) -> bool {
        if !self.formats.contains(&format) {
            return false;
        }
        if layer.display_frame.is_empty() {
            return false;
        }
        if !(0.0..=1.0).contains(&layer.alpha) {
            return false;
        }
        if layer.transform != Transform::IDENTITY {
            return false;
        }
        if layer.blending == Blending::Coverage {
            return false;
        }
        true
    }

    /// Appends the property-set entries required to bind `layer`'s buffer to this plane
    /// for `crtc`, in the 16.16-fixed-point `SRC_*` / integer `CRTC_*` layout used by
    /// `AtomicDrmSurface::build_request`.
    pub fn update_properties(
        &self,
        req: &mut drm::control::atomic::AtomicModeReq,
        crtc: crtc::Handle,
        fb: drm::control::framebuffer::Handle,
        crop: Rect,
        frame: Rect,
    ) {
        req.add_property(self.handle, self.props.fb_id, (Into::<u32>::into(fb) as u64).into());
        req.add_property(self.handle, self.props.crtc_id, (Into::<u32>::into(crtc) as u64).into());
        req.add_property(self.handle, self.props.src_x, ((crop.x as u64) << 16).into());
        req.add_property(self.handle, self.props.src_y, ((crop.y as u64) << 16).into());
        req.add_property(self.handle, self.props.src_w, ((crop.w as u64) << 16).into());
        req.add_property(self.handle, self.props.src_h, ((crop.h as u64) << 16).into());
        req.add_property(self.handle, self.props.crtc_x, (frame.x as i64).into());
        req.add_property(self.handle, self.props.crtc_y, (frame.y as i64).into());
        req.add_property(self.handle, self.props.crtc_w, (frame.w as u64).into());
        req.add_property(self.handle, self.props.crtc_h, (frame.h as u64).into());
    }

    /// Appends entries that detach this plane from any CRTC.
    pub fn disable(&self, req: &mut drm::control::atomic::AtomicModeReq) {
        req.add_property(self.handle, self.props.crtc_id, 0u64.into());
        req.add_property(self.handle, self.props.fb_id, 0u64.into());
    }
}

/// Enumerates planes via `mode_get_plane_resources`/`mode_get_plane` and partitions them
/// into primary/overlay/cursor pools sorted by ascending plane id (spec §4.4 tie-breaks).
/// Fails with [`Error::NoPlane`] if no primary plane is found, matching
/// `DisplayPlaneManager::Initialize`.
pub fn enumerate_planes<D: ControlDevice>(
    dev: &D,
    crtc: crtc::Handle,
) -> Result<(Vec<Plane>, Vec<Plane>, Vec<Plane>)> {
    let res = dev
        .plane_handles()
        .map_err(|e| Error::DeviceInitFailed(e.into()))?;

    let crtcs = dev.resource_handles().map_err(|e| Error::DeviceInitFailed(e.into()))?;
    let crtc_index = crtcs
        .crtcs()
        .iter()
        .position(|&h| h == crtc)
        .ok_or_else(|| Error::unknown_crtc(crtc))? as u32;

    let mut primary = Vec::new();
    let mut overlay = Vec::new();
    let mut cursor = Vec::new();

    let mut handles: Vec<plane::Handle> = res.into_iter().collect();
    handles.sort_by_key(|h| Into::<u32>::into(*h));

    for handle in handles {
        let info = dev.get_plane(handle).map_err(|e| Error::DeviceInitFailed(e.into()))?;
        if info.possible_crtcs() & (1 << crtc_index) == 0 {
            continue;
        }

        let kind = plane_kind(dev, handle)?;
        let formats = info.formats().iter().filter_map(|f| DrmFourcc::try_from(*f).ok()).collect();
        let props = resolve_plane_props(dev, handle)?;
        let plane = Plane::new(handle, kind, info.possible_crtcs(), formats, props);

        trace!(?handle, ?kind, "enumerated plane");
        match kind {
            PlaneKind::Primary => primary.push(plane),
            PlaneKind::Overlay => overlay.push(plane),
            PlaneKind::Cursor => cursor.push(plane),
        }
    }

    if primary.is_empty() {
        return Err(Error::NoPlane);
    }

    primary.sort_by_key(|p| Into::<u32>::into(p.handle()));
    overlay.sort_by_key(|p| Into::<u32>::into(p.handle()));
    cursor.sort_by_key(|p| Into::<u32>::into(p.handle()));

    Ok((primary, overlay, cursor))
}

fn plane_kind<D: ControlDevice>(dev: &D, handle: plane::Handle) -> Result<PlaneKind> {
    let props = dev
        .get_properties(handle)
        .map_err(|e| Error::DeviceInitFailed(e.into()))?;
    for (prop_handle, value) in props.iter() {
        if let Ok(info) = dev.get_property(*prop_handle) {
            if info.name().to_str() == Ok("type") {
                return Ok(match value {
                    1 => PlaneKind::Primary,
                    2 => PlaneKind::Cursor,
                    _ => PlaneKind::Overlay,
                });
            }
        }
    }
    Ok(PlaneKind::Overlay)
}

fn resolve_plane_props<D: ControlDevice>(dev: &D, handle: plane::Handle) -> Result<PlaneProps> {
    let props = dev
        .get_properties(handle)
        .map_err(|e| Error::DeviceInitFailed(e.into()))?;
    let mut by_name: HashMap<String, plane::property::Handle> = HashMap::new();
    for (prop_handle, _) in props.iter() {
        if let Ok(info) = dev.get_property(*prop_handle) {
            if let Ok(name) = info.name().to_str() {
                by_name.insert(name.to_owned(), *prop_handle);
            }
        }
    }
    let get = |name: &str| -> Result<plane::property::Handle> {
        by_name
            .get(name)
            .copied()
            .ok_or(Error::Internal("missing expected plane property"))
    };
    Ok(PlaneProps {
        fb_id: get("FB_ID")?,
        crtc_id: get("CRTC_ID")?,
        src_x: get("SRC_X")?,
        src_y: get("SRC_Y")?,
        src_w: get("SRC_W")?,
        src_h: get("SRC_H")?,
        crtc_x: get("CRTC_X")?,
        crtc_y: get("CRTC_Y")?,
        crtc_w: get("CRTC_W")?,
        crtc_h: get("CRTC_H")?,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fence::Fence;
    use crate::layer::{NativeHandle, Usage};
    use crate::utils::RectF;

    fn plane(formats: &[DrmFourcc]) -> Plane {
        Plane::new(
            unsafe { std::mem::transmute::<u32, plane::Handle>(1) },
            PlaneKind::Overlay,
            0xFFFF_FFFF,
            formats.to_vec(),
            PlaneProps::default(),
        )
    }

    fn layer() -> Layer {
        Layer {
            handle: 0 as NativeHandle,
            source_crop: RectF::new(0.0, 0.0, 64.0, 64.0),
            display_frame: Rect::new(0, 0, 64, 64),
            transform: Transform::IDENTITY,
            blending: Blending::None,
            alpha: 1.0,
            usage: Usage::empty(),
            acquire_fence: Fence::Invalid,
            release_fence: Fence::Invalid,
        }
    }

    #[test]
    fn accepts_a_well_formed_identity_layer() {
        let p = plane(&[DrmFourcc::Argb8888]);
        assert!(p.validate_layer(&layer(), DrmFourcc::Argb8888));
    }

    #[test]
    fn rejects_unsupported_format() {
        let p = plane(&[DrmFourcc::Argb8888]);
        assert!(!p.validate_layer(&layer(), DrmFourcc::Nv12));
    }

    #[test]
    fn rejects_empty_display_frame() {
        let p = plane(&[DrmFourcc::Argb8888]);
        let mut l = layer();
        l.display_frame = Rect::default();
        assert!(!p.validate_layer(&l, DrmFourcc::Argb8888));
    }

    #[test]
    fn rejects_out_of_range_alpha() {
        let p = plane(&[DrmFourcc::Argb8888]);
        let mut l = layer();
        l.alpha = 1.5;
        assert!(!p.validate_layer(&l, DrmFourcc::Argb8888));
    }

    #[test]
    fn rejects_non_identity_transform_since_no_plane_resolves_rotation() {
        let p = plane(&[DrmFourcc::Argb8888]);
        let mut l = layer();
        l.transform = Transform::FLIP_H | Transform::ROT_90;
        assert!(!p.validate_layer(&l, DrmFourcc::Argb8888));
    }

    #[test]
    fn rejects_coverage_blending() {
        let p = plane(&[DrmFourcc::Argb8888]);
        let mut l = layer();
        l.blending = Blending::Coverage;
        assert!(!p.validate_layer(&l, DrmFourcc::Argb8888));
    }

    #[test]
    fn accepts_premultiplied_blending() {
        let p = plane(&[DrmFourcc::Argb8888]);
        let mut l = layer();
        l.blending = Blending::Premultiplied;
        assert!(p.validate_layer(&l, DrmFourcc::Argb8888));
    }
}
