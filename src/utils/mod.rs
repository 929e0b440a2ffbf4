//! Small standalone utilities shared by the rest of the crate.

pub mod fd;
pub mod geom;

pub use fd::{DevPath, DeviceFd};
pub use geom::{Point, Rect, RectF, Size, Transform};
