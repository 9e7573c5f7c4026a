// SPDX-License-Identifier: MPL-2.0
//! Geometry for re-rendering quad layers and for the side-by-side wide
//! composite. Column vectors throughout, matching the shader's
//! `mul(matrix, vector)` with column-major packing.
use crate::surface::PixelRect;
use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
use openxr_sys as xr;
use xrmirror_shared::{EyeSelection, Tunables};

/// One corner of the unit quad: clip-space-ready position and texture
/// coordinate.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadVertex {
	pub position: [f32; 4],
	pub uv: [f32; 2],
}

const fn vertex(x: f32, y: f32, u: f32, v: f32) -> QuadVertex {
	QuadVertex {
		position: [x, y, 0.0, 1.0],
		uv: [u, v],
	}
}

/// Top-left, bottom-left, top-right, bottom-right.
pub const QUAD_VERTICES: [QuadVertex; 4] = [
	vertex(-0.5, 0.5, 0.0, 0.0),
	vertex(-0.5, -0.5, 0.0, 1.0),
	vertex(0.5, 0.5, 1.0, 0.0),
	vertex(0.5, -0.5, 1.0, 1.0),
];

pub const QUAD_INDICES: [u16; 6] = [2, 1, 0, 2, 3, 1];

/// Normalizes a sub-image rectangle into the texture's UV space, in
/// [`QUAD_VERTICES`] order.
pub fn quad_uvs(rect: PixelRect, width: u32, height: u32) -> [[f32; 2]; 4] {
	let width = width.max(1) as f32;
	let height = height.max(1) as f32;
	let left = rect.x as f32 / width;
	let top = rect.y as f32 / height;
	let right = rect.right() as f32 / width;
	let bottom = rect.bottom() as f32 / height;
	[[left, top], [left, bottom], [right, top], [right, bottom]]
}

pub fn quad_vertices(uvs: [[f32; 2]; 4]) -> [QuadVertex; 4] {
	let mut vertices = QUAD_VERTICES;
	for (vertex, uv) in vertices.iter_mut().zip(uvs) {
		vertex.uv = uv;
	}
	vertices
}

/// Runtimes occasionally submit an all-zero quaternion; that and anything
/// non-finite becomes the identity, everything else is normalized.
pub fn orientation(q: &xr::Quaternionf) -> Quat {
	let v = Vec4::new(q.x, q.y, q.z, q.w);
	if !v.is_finite() || v.length_squared() <= f32::EPSILON {
		Quat::IDENTITY
	} else {
		Quat::from_vec4(v.normalize())
	}
}

pub fn position(p: &xr::Vector3f) -> Vec3 {
	Vec3::new(p.x, p.y, p.z)
}

/// Off-axis right-handed projection from the view's FOV angles, depth
/// mapped to 0..1.
pub fn perspective(fov: &xr::Fovf, near: f32, far: f32) -> Mat4 {
	let left = near * fov.angle_left.tan();
	let right = near * fov.angle_right.tan();
	let down = near * fov.angle_down.tan();
	let up = near * fov.angle_up.tan();
	let width = right - left;
	let height = up - down;
	let range = near - far;
	Mat4::from_cols(
		Vec4::new(2.0 * near / width, 0.0, 0.0, 0.0),
		Vec4::new(0.0, 2.0 * near / height, 0.0, 0.0),
		Vec4::new(
			(left + right) / width,
			(up + down) / height,
			far / range,
			-1.0,
		),
		Vec4::new(0.0, 0.0, far * near / range, 0.0),
	)
}

pub fn view_matrix(pose: &xr::Posef) -> Mat4 {
	Mat4::from_rotation_translation(orientation(&pose.orientation), position(&pose.position)).inverse()
}

pub fn model_matrix(pose: &xr::Posef, size: &xr::Extent2Df) -> Mat4 {
	Mat4::from_scale_rotation_translation(
		Vec3::new(size.width, size.height, 1.0),
		orientation(&pose.orientation),
		position(&pose.position),
	)
}

/// Width of the composite target for a `width`-wide eye image: the wide
/// composite adds `overlap_percent` of extra width, and the result is
/// always rounded up to an even number.
pub fn output_width(width: u32, eye: EyeSelection, overlap_percent: f32) -> u32 {
	let width = match eye {
		EyeSelection::Wide => {
			let overlap = f64::from(overlap_percent.clamp(0.0, 100.0));
			let scaled = (f64::from(width) * (100.0 + overlap) / 100.0 - 1e-9).ceil();
			(scaled as u32).max(width)
		}
		_ => width,
	};
	width.saturating_add(width & 1)
}

/// Where the second view starts inside the wide composite.
pub fn second_view_offset(width: u32, overlap_percent: f32) -> u32 {
	(width as f32 * overlap_percent.clamp(0.0, 100.0) / 100.0).round() as u32
}

pub fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
	let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
	t * t * (3.0 - 2.0 * t)
}

/// The seam between the two views of the wide composite, in the second
/// view's horizontal coordinate (0 at its left edge).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendWindow {
	pub start: f32,
	pub end: f32,
}

impl BlendWindow {
	const MIN_WIDTH: f32 = 1e-5;

	pub fn from_tunables(tunables: &Tunables) -> Self {
		let tunables = tunables.clamped();
		// Part of the second view that lies over the first one.
		let span = 1.0 - tunables.overlap_percent / 100.0;
		let center = tunables.blend_center_percent / 100.0;
		let half_width = tunables.blend_width_percent / 200.0;
		Self {
			start: (span * (center - half_width)).clamp(0.0, span),
			end: (span * (center + half_width)).clamp(0.0, span),
		}
	}

	/// Opacity of the second view at `u`. Same formula as the pixel shader.
	pub fn alpha(&self, u: f32) -> f32 {
		if self.end - self.start <= Self::MIN_WIDTH {
			if u >= self.start {
				1.0
			} else {
				0.0
			}
		} else {
			smoothstep(self.start, self.end, u)
		}
	}
}

fn tangent_span(fov: &xr::Fovf) -> Vec2 {
	Vec2::new(
		fov.angle_right.tan() - fov.angle_left.tan(),
		fov.angle_up.tan() - fov.angle_down.tan(),
	)
}

fn fov_key(fov: &xr::Fovf) -> [f32; 4] {
	[fov.angle_left, fov.angle_right, fov.angle_up, fov.angle_down]
}

/// Scale between the headset's native FOV and a submitted view's FOV,
/// recomputed only when either changes.
#[derive(Debug, Clone)]
pub struct FovRatioCache {
	key: Option<([f32; 4], [f32; 4])>,
	ratio: Vec2,
	recomputed: u32,
}

impl Default for FovRatioCache {
	fn default() -> Self {
		Self {
			key: None,
			ratio: Vec2::ONE,
			recomputed: 0,
		}
	}
}

impl FovRatioCache {
	pub fn ratio(&mut self, native: &xr::Fovf, view: &xr::Fovf) -> Vec2 {
		let key = (fov_key(native), fov_key(view));
		if self.key != Some(key) {
			let native = tangent_span(native);
			let view = tangent_span(view);
			let component = |native: f32, view: f32| {
				let ratio = native / view;
				if view.abs() <= f32::EPSILON || !ratio.is_finite() {
					1.0
				} else {
					ratio
				}
			};
			self.ratio = Vec2::new(component(native.x, view.x), component(native.y, view.y));
			self.key = Some(key);
			self.recomputed += 1;
		}
		self.ratio
	}

	pub fn recomputations(&self) -> u32 {
		self.recomputed
	}
}

/// Projection for drawing a whole eye image as a unit quad at z = -1,
/// shrunk or grown by the FOV ratio.
pub fn orthographic(ratio: Vec2, near: f32, far: f32) -> Mat4 {
	Mat4::orthographic_rh(
		-0.5 * ratio.x,
		0.5 * ratio.x,
		-0.5 * ratio.y,
		0.5 * ratio.y,
		near,
		far,
	)
}
