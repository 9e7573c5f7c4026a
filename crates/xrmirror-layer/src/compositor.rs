// SPDX-License-Identifier: MPL-2.0
//! Builds the single mirrored image out of the shadow copies of the
//! application's swapchains and publishes it to the capture source.
//!
//! The GPU work itself sits behind [`CompositorDevice`]; this module owns
//! every decision about what to copy or draw where, the shared segment and
//! the consumer liveness check.
use crate::{
	config::LayerConfig,
	math::{self, BlendWindow, FovRatioCache, QuadVertex},
	surface::{PixelRect, SharedHandle, SurfaceDesc},
};
use ahash::AHashMap;
use anyhow::{Context, Result};
use glam::{Mat4, Vec3};
use openxr_sys as xr;
use xrmirror_shared::{
	format::view_format, DxgiFormat, EyeSelection, FormatInfo, Heartbeat, SharedSegment, Tunables,
};

/// Vertex shader constants (`b0`), column-major.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformConstants {
	pub world: [f32; 16],
	pub view_projection: [f32; 16],
}

impl TransformConstants {
	pub fn new(world: Mat4, view_projection: Mat4) -> Self {
		Self {
			world: world.to_cols_array(),
			view_projection: view_projection.to_cols_array(),
		}
	}
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
	/// Composite with the texture's own alpha.
	TextureAlpha = 0,
	/// Fade in across the quad with a horizontal ramp.
	Ramp = 1,
}

/// Pixel shader constants (`b1`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendConstants {
	pub start: f32,
	pub end: f32,
	pub mode: u32,
	_pad: u32,
}

impl BlendConstants {
	pub const TEXTURE_ALPHA: Self = Self {
		start: 0.0,
		end: 0.0,
		mode: BlendMode::TextureAlpha as u32,
		_pad: 0,
	};

	pub fn ramp(window: BlendWindow) -> Self {
		Self {
			start: window.start,
			end: window.end,
			mode: BlendMode::Ramp as u32,
			_pad: 0,
		}
	}

	pub fn mode(&self) -> BlendMode {
		if self.mode == BlendMode::Ramp as u32 {
			BlendMode::Ramp
		} else {
			BlendMode::TextureAlpha
		}
	}
}

/// Everything needed to draw one textured quad into the composite.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadDraw {
	/// Viewport and scissor, in composite pixels.
	pub viewport: PixelRect,
	pub vertices: [QuadVertex; 4],
	pub transform: TransformConstants,
	pub blend: BlendConstants,
}

/// The GPU side of compositing. Implemented on a private D3D11 device in
/// the layer and by counting stubs in tests.
pub trait CompositorDevice {
	/// A shadow texture opened on this device, ready to be sampled.
	type Source;
	/// The composite output plus its shareable mirror copies.
	type Target;

	/// Opens a shadow texture and creates a `view_format` view of it.
	/// Returns the texture's real description.
	fn open_source(
		&mut self,
		handle: SharedHandle,
		view_format: DxgiFormat,
	) -> Result<(Self::Source, SurfaceDesc)>;

	/// Allocates the output (stored as `desc`, rendered to as
	/// `render_format`) and `copies` shareable textures of the same
	/// description. Returns the copies' handles in order.
	fn create_target(
		&mut self,
		desc: SurfaceDesc,
		render_format: DxgiFormat,
		copies: usize,
	) -> Result<(Self::Target, Vec<u64>)>;

	/// Copies `rect` of `source` to (`dest_x`, 0) in the output.
	fn copy_region(
		&mut self,
		target: &Self::Target,
		source: &Self::Source,
		rect: PixelRect,
		dest_x: u32,
	) -> Result<()>;

	fn draw_quad(&mut self, target: &Self::Target, source: &Self::Source, draw: &QuadDraw) -> Result<()>;

	/// Copies the output into the first mirror copy.
	fn copy_to_mirror(&mut self, target: &Self::Target) -> Result<()>;

	/// Clears the output to transparent black.
	fn clear(&mut self, target: &Self::Target);

	fn flush(&mut self);
}

/// A mirrored swapchain's shadow, as seen by the compositor.
#[derive(Debug)]
pub struct SourceSurface<S> {
	pub desc: SurfaceDesc,
	pub view_format: DxgiFormat,
	pub handle: SharedHandle,
	texture: S,
}

#[derive(Debug)]
struct CompositeTarget<T> {
	/// What `ensure_output_surface` computed; compared to detect changes.
	desc: SurfaceDesc,
	/// Width of one eye image inside the composite.
	eye_width: u32,
	handles: Vec<u64>,
	texture: T,
}

pub struct Compositor<D: CompositorDevice> {
	device: D,
	segment: SharedSegment,
	sources: AHashMap<xr::Swapchain, SourceSurface<D::Source>>,
	target: Option<CompositeTarget<D::Target>>,
	consumer: Heartbeat,
	enabled: bool,
	fov_ratio: FovRatioCache,
	mirror_copies: usize,
	near_z: f32,
	far_z: f32,
}

impl<D: CompositorDevice> Compositor<D> {
	/// Creates (or attaches to) the shared segment. Failing here means the
	/// layer runs without mirroring.
	pub fn new(device: D, config: &LayerConfig) -> Result<Self> {
		let segment = SharedSegment::create(&config.segment_name)
			.context("failed to set up the mirror surface")?;
		segment.block().reset_handles();
		Ok(Self {
			device,
			segment,
			sources: AHashMap::new(),
			target: None,
			consumer: Heartbeat::new(config.stale_frame_limit),
			enabled: false,
			fov_ratio: FovRatioCache::default(),
			mirror_copies: config.mirror_copies,
			near_z: config.near_z,
			far_z: config.far_z,
		})
	}

	pub fn device(&self) -> &D {
		&self.device
	}

	/// Opens a swapchain's shadow texture on the compositor's device,
	/// replacing any earlier one for the same swapchain.
	pub fn create_shared_mirror_texture(
		&mut self,
		swapchain: xr::Swapchain,
		handle: SharedHandle,
		format: DxgiFormat,
	) -> Result<()> {
		self.sources.remove(&swapchain);
		let view_format = view_format(format);
		let (texture, desc) = self
			.device
			.open_source(handle, view_format)
			.with_context(|| format!("failed to open shadow texture {:#x}", handle.value))?;
		debug!(
			"swapchain {:?}: sampling {} shadow as {}",
			swapchain, desc, view_format
		);
		self.sources.insert(
			swapchain,
			SourceSurface {
				desc,
				view_format,
				handle,
				texture,
			},
		);
		Ok(())
	}

	pub fn remove_source(&mut self, swapchain: xr::Swapchain) -> bool {
		self.sources.remove(&swapchain).is_some()
	}

	pub fn has_source(&self, swapchain: xr::Swapchain) -> bool {
		self.sources.contains_key(&swapchain)
	}

	pub fn source(&self, swapchain: xr::Swapchain) -> Option<&SourceSurface<D::Source>> {
		self.sources.get(&swapchain)
	}

	/// Reads the consumer heartbeat once per frame.
	pub fn check_consumer(&mut self) -> bool {
		let was_enabled = self.enabled;
		self.enabled = self.consumer.observe(self.segment.block().consumer_heartbeat());
		match (was_enabled, self.enabled) {
			(false, true) => info!("capture source attached, mirroring"),
			(true, false) => info!(
				"capture source idle for {} frames, pausing",
				self.consumer.stale_frames()
			),
			_ => {}
		}
		self.enabled
	}

	/// Whether anyone is consuming the mirror. All GPU work is skipped
	/// while this is false.
	pub fn enabled(&self) -> bool {
		self.enabled
	}

	pub fn eye_selection(&self) -> EyeSelection {
		self.segment.block().eye_selection()
	}

	pub fn tunables(&self) -> Tunables {
		self.segment.block().tunables()
	}

	/// Makes sure the composite target fits an eye image of the given size
	/// and format, rebuilding and republishing it if it doesn't.
	pub fn ensure_output_surface(&mut self, width: u32, height: u32, format: DxgiFormat) -> Result<()> {
		if !self.enabled {
			return Ok(());
		}
		let eye = self.eye_selection();
		let overlap = self.tunables().overlap_percent;
		let desc = SurfaceDesc::new(math::output_width(width, eye, overlap), height, format);
		if self.target.as_ref().is_some_and(|target| target.desc == desc) {
			return Ok(());
		}

		// The consumer must never see handles of textures being released.
		self.segment.block().reset_handles();
		self.target = None;

		let storage = FormatInfo::lookup(format)
			.and_then(|info| info.typeless)
			.unwrap_or(format);
		let (texture, handles) = self
			.device
			.create_target(
				SurfaceDesc { format: storage, ..desc },
				view_format(format),
				self.mirror_copies,
			)
			.with_context(|| format!("failed to create {} composite target", desc))?;
		self.segment.block().publish_handles(&handles);
		info!("composite target {} ({:?}), handles {:x?}", desc, eye, handles);
		self.target = Some(CompositeTarget {
			desc,
			eye_width: width,
			handles,
			texture,
		});
		Ok(())
	}

	pub fn output_desc(&self) -> Option<SurfaceDesc> {
		self.target.as_ref().map(|target| target.desc)
	}

	pub fn published_handles(&self) -> &[u64] {
		self.target.as_ref().map_or(&[], |target| &target.handles)
	}

	/// Copies one projection view straight into the composite at `dest_x`.
	pub fn copy_perspective(&mut self, rect: PixelRect, swapchain: xr::Swapchain, dest_x: u32) -> Result<()> {
		if !self.enabled {
			return Ok(());
		}
		let (Some(target), Some(source)) = (&self.target, self.sources.get(&swapchain)) else {
			return Ok(());
		};
		let rect = clip(rect, source.desc.width, source.desc.height);
		let rect = PixelRect {
			width: rect.width.min(target.desc.width.saturating_sub(dest_x)),
			height: rect.height.min(target.desc.height),
			..rect
		};
		if rect.is_empty() {
			return Ok(());
		}
		self.device
			.copy_region(&target.texture, &source.texture, rect, dest_x)
	}

	/// Draws the second eye into the right part of the wide composite,
	/// fading it in across the overlap.
	pub fn blend_projection(
		&mut self,
		rect: PixelRect,
		swapchain: xr::Swapchain,
		view_fov: &xr::Fovf,
		native_fov: &xr::Fovf,
	) -> Result<()> {
		if !self.enabled {
			return Ok(());
		}
		let (Some(target), Some(source)) = (&self.target, self.sources.get(&swapchain)) else {
			return Ok(());
		};
		let tunables = self.segment.block().tunables();
		let offset = math::second_view_offset(target.eye_width, tunables.overlap_percent);
		let ratio = self.fov_ratio.ratio(native_fov, view_fov);
		let draw = QuadDraw {
			viewport: PixelRect::new(offset, 0, rect.width, rect.height),
			vertices: math::quad_vertices(math::quad_uvs(rect, source.desc.width, source.desc.height)),
			transform: TransformConstants::new(
				Mat4::from_translation(Vec3::new(0.0, 0.0, -1.0)),
				math::orthographic(ratio, self.near_z, self.far_z),
			),
			blend: BlendConstants::ramp(BlendWindow::from_tunables(&tunables)),
		};
		self.device.draw_quad(&target.texture, &source.texture, &draw)
	}

	/// Re-renders a quad layer as seen from one eye. Quads whose swapchain
	/// isn't mirrored are skipped.
	pub fn blend_quad(&mut self, view: &EyeView, quad: &QuadPlacement) -> Result<()> {
		if !self.enabled {
			return Ok(());
		}
		let (Some(target), Some(source)) = (&self.target, self.sources.get(&quad.swapchain)) else {
			return Ok(());
		};
		let view_projection =
			math::perspective(&view.fov, self.near_z, self.far_z) * math::view_matrix(&view.pose);
		let draw = QuadDraw {
			viewport: view.viewport,
			vertices: math::quad_vertices(math::quad_uvs(
				quad.rect,
				source.desc.width,
				source.desc.height,
			)),
			transform: TransformConstants::new(
				math::model_matrix(&quad.pose, &quad.size),
				view_projection,
			),
			blend: BlendConstants::TEXTURE_ALPHA,
		};
		self.device.draw_quad(&target.texture, &source.texture, &draw)
	}

	pub fn copy_to_mirror(&mut self) -> Result<()> {
		match &self.target {
			Some(target) if self.enabled => self.device.copy_to_mirror(&target.texture),
			_ => Ok(()),
		}
	}

	/// Starts a new frame: submits the previous one, clears the output and
	/// bumps the producer heartbeat.
	pub fn flush(&mut self) {
		self.device.flush();
		if let Some(target) = &self.target {
			self.device.clear(&target.texture);
		}
		self.segment.block().advance_producer_heartbeat();
	}
}

impl<D: CompositorDevice> Drop for Compositor<D> {
	fn drop(&mut self) {
		self.segment.block().reset_handles();
		debug!("compositor shut down, handles withdrawn");
	}
}

fn clip(rect: PixelRect, width: u32, height: u32) -> PixelRect {
	let x = rect.x.min(width);
	let y = rect.y.min(height);
	PixelRect {
		x,
		y,
		width: rect.width.min(width - x),
		height: rect.height.min(height - y),
	}
}

/// Where and how one eye sees the scene.
#[derive(Debug, Clone, Copy)]
pub struct EyeView {
	pub fov: xr::Fovf,
	pub pose: xr::Posef,
	/// The eye's area of the composite.
	pub viewport: PixelRect,
}

/// A quad layer as submitted, with its swapchain sub-image.
#[derive(Debug, Clone, Copy)]
pub struct QuadPlacement {
	pub swapchain: xr::Swapchain,
	pub rect: PixelRect,
	pub pose: xr::Posef,
	pub size: xr::Extent2Df,
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use anyhow::bail;
	use std::f32::consts::FRAC_PI_4;
	use xrmirror_shared::HandleSet;

	/// Records every call instead of touching a GPU.
	#[derive(Debug, Default)]
	pub(crate) struct CountingDevice {
		pub sources: AHashMap<u64, SurfaceDesc>,
		pub opened: Vec<(SharedHandle, DxgiFormat)>,
		pub targets: Vec<(SurfaceDesc, DxgiFormat, usize)>,
		pub copies: Vec<(PixelRect, u32)>,
		pub draws: Vec<QuadDraw>,
		pub mirrored: u32,
		pub cleared: u32,
		pub flushed: u32,
		next_handle: u64,
	}

	impl CountingDevice {
		pub fn gpu_work(&self) -> usize {
			self.copies.len() + self.draws.len() + self.mirrored as usize
		}
	}

	impl CompositorDevice for CountingDevice {
		type Source = SurfaceDesc;
		type Target = SurfaceDesc;

		fn open_source(
			&mut self,
			handle: SharedHandle,
			view_format: DxgiFormat,
		) -> Result<(SurfaceDesc, SurfaceDesc)> {
			let Some(desc) = self.sources.get(&handle.value).copied() else {
				bail!("no texture behind {:#x}", handle.value);
			};
			self.opened.push((handle, view_format));
			Ok((desc, desc))
		}

		fn create_target(
			&mut self,
			desc: SurfaceDesc,
			render_format: DxgiFormat,
			copies: usize,
		) -> Result<(SurfaceDesc, Vec<u64>)> {
			self.targets.push((desc, render_format, copies));
			let handles = (0..copies)
				.map(|_| {
					self.next_handle += 0x10;
					0x1000 + self.next_handle
				})
				.collect();
			Ok((desc, handles))
		}

		fn copy_region(
			&mut self,
			_target: &SurfaceDesc,
			_source: &SurfaceDesc,
			rect: PixelRect,
			dest_x: u32,
		) -> Result<()> {
			self.copies.push((rect, dest_x));
			Ok(())
		}

		fn draw_quad(&mut self, _target: &SurfaceDesc, _source: &SurfaceDesc, draw: &QuadDraw) -> Result<()> {
			self.draws.push(draw.clone());
			Ok(())
		}

		fn copy_to_mirror(&mut self, _target: &SurfaceDesc) -> Result<()> {
			self.mirrored += 1;
			Ok(())
		}

		fn clear(&mut self, _target: &SurfaceDesc) {
			self.cleared += 1;
		}

		fn flush(&mut self) {
			self.flushed += 1;
		}
	}

	fn config(segment: &str) -> LayerConfig {
		LayerConfig {
			segment_name: segment.to_owned(),
			..LayerConfig::default()
		}
	}

	fn fov() -> xr::Fovf {
		xr::Fovf {
			angle_left: -FRAC_PI_4,
			angle_right: FRAC_PI_4,
			angle_up: FRAC_PI_4,
			angle_down: -FRAC_PI_4,
		}
	}

	fn identity_pose(z: f32) -> xr::Posef {
		xr::Posef {
			orientation: xr::Quaternionf {
				x: 0.0,
				y: 0.0,
				z: 0.0,
				w: 1.0,
			},
			position: xr::Vector3f { x: 0.0, y: 0.0, z },
		}
	}

	const EYES: u64 = 0xE1;
	const HUD: u64 = 0xD1;

	fn eyes() -> xr::Swapchain {
		xr::Swapchain::from_raw(EYES)
	}

	fn hud() -> xr::Swapchain {
		xr::Swapchain::from_raw(HUD)
	}

	fn compositor(segment: &str) -> Compositor<CountingDevice> {
		let mut device = CountingDevice::default();
		device
			.sources
			.insert(0xAA, SurfaceDesc::new(2000, 1000, DxgiFormat::R8G8B8A8_TYPELESS));
		device
			.sources
			.insert(0xBB, SurfaceDesc::new(512, 256, DxgiFormat::R16G16B16A16_UNORM));
		let mut compositor = Compositor::new(device, &config(segment)).expect("compositor");
		compositor
			.create_shared_mirror_texture(eyes(), SharedHandle::legacy(0xAA), DxgiFormat::R8G8B8A8_TYPELESS)
			.expect("eyes");
		compositor
			.create_shared_mirror_texture(hud(), SharedHandle::nt(0xBB), DxgiFormat::R16G16B16A16_UNORM)
			.expect("hud");
		compositor
	}

	/// One frame the way the layer drives it.
	fn frame(compositor: &mut Compositor<CountingDevice>) {
		compositor.flush();
		compositor.check_consumer();
		compositor
			.ensure_output_surface(1000, 1000, DxgiFormat::R8G8B8A8_TYPELESS)
			.expect("target");
		compositor
			.copy_perspective(PixelRect::new(0, 0, 1000, 1000), eyes(), 0)
			.expect("copy");
		let view = EyeView {
			fov: fov(),
			pose: identity_pose(0.0),
			viewport: PixelRect::new(0, 0, 1000, 1000),
		};
		let quad = QuadPlacement {
			swapchain: hud(),
			rect: PixelRect::new(0, 0, 512, 256),
			pose: identity_pose(-2.0),
			size: xr::Extent2Df {
				width: 1.0,
				height: 0.5,
			},
		};
		compositor.blend_quad(&view, &quad).expect("quad");
		compositor.copy_to_mirror().expect("mirror");
	}

	#[test]
	fn consumer_attached_receives_frames() {
		let mut producer = compositor("xrmirror-test-scenario-a");
		let consumer = SharedSegment::open("xrmirror-test-scenario-a").expect("consumer");
		for _ in 0..5 {
			consumer.block().advance_consumer_heartbeat();
			frame(&mut producer);
			assert!(producer.enabled());
		}

		let handles = consumer.block().handles();
		assert!(handles.is_consistent());
		assert_eq!(handles, HandleSet([0x1010, 0x1020, 0x1030]));
		assert_eq!(producer.published_handles(), &handles.0);

		let device = producer.device();
		assert_eq!(device.targets.len(), 1, "target is built once");
		assert_eq!(device.copies.len(), 5);
		assert_eq!(device.draws.len(), 5);
		assert_eq!(device.mirrored, 5);
		assert_eq!(consumer.block().producer_heartbeat(), 5);
	}

	#[test]
	fn no_gpu_work_without_a_consumer() {
		let mut producer = compositor("xrmirror-test-scenario-b");
		for _ in 0..30 {
			frame(&mut producer);
			assert!(!producer.enabled());
		}
		let device = producer.device();
		assert_eq!(device.gpu_work(), 0);
		assert!(device.targets.is_empty());
		assert_eq!(device.flushed, 30);
	}

	#[test]
	fn mirroring_pauses_when_the_consumer_stops() {
		let mut producer = compositor("xrmirror-test-pause");
		let consumer = SharedSegment::open("xrmirror-test-pause").expect("consumer");
		consumer.block().advance_consumer_heartbeat();
		frame(&mut producer);
		assert!(producer.enabled());
		for stale in 1..=10 {
			frame(&mut producer);
			assert!(producer.enabled(), "still alive after {} stale frames", stale);
		}
		frame(&mut producer);
		assert!(!producer.enabled());
		let work = producer.device().gpu_work();
		frame(&mut producer);
		assert_eq!(producer.device().gpu_work(), work);
		consumer.block().advance_consumer_heartbeat();
		frame(&mut producer);
		assert!(producer.enabled());
	}

	#[test]
	fn sampling_views_follow_the_format_policy() {
		let producer = compositor("xrmirror-test-views");
		assert_eq!(
			producer.source(eyes()).map(|source| source.view_format),
			Some(DxgiFormat::R8G8B8A8_UNORM_SRGB)
		);
		assert_eq!(
			producer.source(hud()).map(|source| source.view_format),
			Some(DxgiFormat::R16G16B16A16_UNORM)
		);
	}

	#[test]
	fn target_is_rebuilt_only_when_the_description_changes() {
		let mut producer = compositor("xrmirror-test-resize");
		let consumer = SharedSegment::open("xrmirror-test-resize").expect("consumer");
		consumer.block().advance_consumer_heartbeat();
		producer.check_consumer();

		producer
			.ensure_output_surface(1000, 800, DxgiFormat::R8G8B8A8_UNORM_SRGB)
			.expect("target");
		producer
			.ensure_output_surface(1000, 800, DxgiFormat::R8G8B8A8_UNORM_SRGB)
			.expect("same target");
		assert_eq!(producer.device().targets.len(), 1);
		let (stored, render, copies) = producer.device().targets[0];
		assert_eq!(stored.format, DxgiFormat::R8G8B8A8_TYPELESS);
		assert_eq!(render, DxgiFormat::R8G8B8A8_UNORM_SRGB);
		assert_eq!(copies, 3);
		let first = consumer.block().handles();

		consumer.block().set_tunables(Tunables::default());
		consumer.block().set_eye_selection(EyeSelection::Wide);
		producer
			.ensure_output_surface(1000, 800, DxgiFormat::R8G8B8A8_UNORM_SRGB)
			.expect("wide target");
		assert_eq!(producer.device().targets.len(), 2);
		assert_eq!(
			producer.output_desc(),
			Some(SurfaceDesc::new(1200, 800, DxgiFormat::R8G8B8A8_UNORM_SRGB))
		);
		let second = consumer.block().handles();
		assert!(second.is_consistent());
		assert_ne!(first, second);
	}

	#[test]
	fn second_eye_is_ramped_into_the_wide_composite() {
		let mut producer = compositor("xrmirror-test-wide");
		let consumer = SharedSegment::open("xrmirror-test-wide").expect("consumer");
		consumer.block().set_tunables(Tunables::default());
		consumer.block().set_eye_selection(EyeSelection::Wide);
		consumer.block().advance_consumer_heartbeat();
		producer.check_consumer();
		producer
			.ensure_output_surface(1000, 1000, DxgiFormat::R8G8B8A8_TYPELESS)
			.expect("target");
		producer
			.copy_perspective(PixelRect::new(0, 0, 1000, 1000), eyes(), 0)
			.expect("first eye");
		producer
			.blend_projection(PixelRect::new(1000, 0, 1000, 1000), eyes(), &fov(), &fov())
			.expect("second eye");

		let draw = &producer.device().draws[0];
		assert_eq!(draw.viewport, PixelRect::new(200, 0, 1000, 1000));
		assert_eq!(draw.blend.mode(), BlendMode::Ramp);
		assert!(draw.blend.start < draw.blend.end);
		assert!(draw.blend.end <= 0.8 + 1e-6);
		assert_eq!(draw.vertices[0].uv, [0.5, 0.0]);
		assert_eq!(draw.vertices[3].uv, [1.0, 1.0]);
	}

	#[test]
	fn copies_are_clipped_to_both_textures() {
		let mut producer = compositor("xrmirror-test-clip");
		let consumer = SharedSegment::open("xrmirror-test-clip").expect("consumer");
		consumer.block().advance_consumer_heartbeat();
		producer.check_consumer();
		producer
			.ensure_output_surface(800, 1000, DxgiFormat::R8G8B8A8_TYPELESS)
			.expect("target");
		producer
			.copy_perspective(PixelRect::new(1500, 0, 1000, 1200), eyes(), 0)
			.expect("copy");
		assert_eq!(producer.device().copies, vec![(PixelRect::new(1500, 0, 500, 1000), 0)]);
	}

	#[test]
	fn unknown_sources_are_skipped() {
		let mut producer = compositor("xrmirror-test-missing");
		let consumer = SharedSegment::open("xrmirror-test-missing").expect("consumer");
		consumer.block().advance_consumer_heartbeat();
		producer.check_consumer();
		producer
			.ensure_output_surface(1000, 1000, DxgiFormat::R8G8B8A8_TYPELESS)
			.expect("target");
		assert!(producer.remove_source(hud()));
		assert!(!producer.has_source(hud()));
		let view = EyeView {
			fov: fov(),
			pose: identity_pose(0.0),
			viewport: PixelRect::new(0, 0, 1000, 1000),
		};
		let quad = QuadPlacement {
			swapchain: hud(),
			rect: PixelRect::new(0, 0, 512, 256),
			pose: identity_pose(-2.0),
			size: xr::Extent2Df {
				width: 1.0,
				height: 1.0,
			},
		};
		producer.blend_quad(&view, &quad).expect("skipped");
		assert!(producer.device().draws.is_empty());
		assert!(producer
			.create_shared_mirror_texture(hud(), SharedHandle::nt(0xCC), DxgiFormat::R8G8B8A8_UNORM)
			.is_err());
		assert!(!producer.has_source(hud()));
	}

	#[test]
	fn shutdown_withdraws_the_handles() {
		let consumer;
		{
			let mut producer = compositor("xrmirror-test-drop");
			consumer = SharedSegment::open("xrmirror-test-drop").expect("consumer");
			consumer.block().advance_consumer_heartbeat();
			producer.check_consumer();
			producer
				.ensure_output_surface(1000, 1000, DxgiFormat::R8G8B8A8_TYPELESS)
				.expect("target");
			assert!(consumer.block().handles().is_consistent());
		}
		assert_eq!(consumer.block().handles(), HandleSet::default());
	}
}
