// SPDX-License-Identifier: MPL-2.0
use openxr_sys as xr;
use std::fmt;
use xrmirror_shared::DxgiFormat;

/// Size and format of a 2D texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceDesc {
	pub width: u32,
	pub height: u32,
	pub format: DxgiFormat,
}

impl SurfaceDesc {
	pub fn new(width: u32, height: u32, format: DxgiFormat) -> Self {
		Self {
			width,
			height,
			format,
		}
	}
}

impl fmt::Display for SurfaceDesc {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}x{} {}", self.width, self.height, self.format)
	}
}

/// How a shared texture handle has to be opened on the other device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
	/// `IDXGIResource::GetSharedHandle`, opened with `OpenSharedResource`.
	Legacy,
	/// An NT handle from `CreateSharedHandle`, opened with `OpenSharedResource1`.
	Nt,
}

/// A cross-device texture handle, carried as a plain integer until it is
/// handed back to the graphics API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedHandle {
	pub value: u64,
	pub kind: HandleKind,
}

impl SharedHandle {
	pub fn legacy(value: u64) -> Self {
		Self {
			value,
			kind: HandleKind::Legacy,
		}
	}

	pub fn nt(value: u64) -> Self {
		Self {
			value,
			kind: HandleKind::Nt,
		}
	}
}

/// A pixel rectangle inside a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixelRect {
	pub x: u32,
	pub y: u32,
	pub width: u32,
	pub height: u32,
}

impl PixelRect {
	pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
		Self {
			x,
			y,
			width,
			height,
		}
	}

	/// Negative offsets and extents from the runtime are clamped to zero.
	pub fn from_xr(rect: &xr::Rect2Di) -> Self {
		Self {
			x: rect.offset.x.max(0) as u32,
			y: rect.offset.y.max(0) as u32,
			width: rect.extent.width.max(0) as u32,
			height: rect.extent.height.max(0) as u32,
		}
	}

	pub fn right(&self) -> u32 {
		self.x.saturating_add(self.width)
	}

	pub fn bottom(&self) -> u32 {
		self.y.saturating_add(self.height)
	}

	pub fn is_empty(&self) -> bool {
		self.width == 0 || self.height == 0
	}

	pub fn offset_x(self, dx: u32) -> Self {
		Self {
			x: self.x.saturating_add(dx),
			..self
		}
	}
}
