//! Backend device access: the DRM/KMS plumbing this crate drives scanout through.

pub mod drm;
