// SPDX-License-Identifier: MPL-2.0
//! The interceptor: follows the application's swapchains, sessions and
//! spaces through the hooked calls and drives the compositor from them.
use crate::{
	compositor::{Compositor, CompositorDevice, EyeView, QuadPlacement},
	config::LayerConfig,
	dispatch::{succeeded, NextDispatch, OpenXrApi},
	host::{image_textures, HostBinding, HostConnector, HostGraphics},
	logging, math,
	spaces::SpaceRegistry,
	surface::{PixelRect, SurfaceDesc},
};
use ahash::{AHashMap, AHashSet};
use anyhow::{Context, Result};
use openxr_sys as xr;
use std::{ffi::c_void, ptr, slice};
use xrmirror_shared::{format::is_mirrorable, DxgiFormat, EyeSelection};

/// Where a swapchain is in its mirroring lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainPhase {
	/// Not a color target, or too wide a format.
	Unmirrored,
	/// Eligible, waiting for image enumeration to allocate a shadow.
	Pending,
	ShadowAllocated,
	/// At least one image has been copied into the shadow.
	Active,
}

#[derive(Debug, Clone)]
pub struct SwapchainState {
	pub session: xr::Session,
	pub desc: SurfaceDesc,
	pub usage: xr::SwapchainUsageFlags,
	pub phase: SwapchainPhase,
	pub acquired: Option<u32>,
	pub released: Option<u32>,
	pub copied: Option<u32>,
}

impl SwapchainState {
	pub fn new(session: xr::Session, info: &xr::SwapchainCreateInfo, max_bits_per_channel: u32) -> Self {
		let desc = SurfaceDesc::new(info.width, info.height, DxgiFormat::from_xr(info.format));
		let eligible = info
			.usage_flags
			.contains(xr::SwapchainUsageFlags::COLOR_ATTACHMENT)
			&& is_mirrorable(desc.format, max_bits_per_channel);
		Self {
			session,
			desc,
			usage: info.usage_flags,
			phase: if eligible {
				SwapchainPhase::Pending
			} else {
				SwapchainPhase::Unmirrored
			},
			acquired: None,
			released: None,
			copied: None,
		}
	}

	pub fn is_mirrored(&self) -> bool {
		self.phase != SwapchainPhase::Unmirrored
	}

	pub fn has_shadow(&self) -> bool {
		matches!(self.phase, SwapchainPhase::ShadowAllocated | SwapchainPhase::Active)
	}

	/// The last released image, if it was never copied into the shadow.
	pub fn stale_image(&self) -> Option<u32> {
		self.released.filter(|_| self.has_shadow() && self.released != self.copied)
	}
}

/// A view as the runtime last located it.
#[derive(Debug, Clone, Copy)]
pub struct LocatedView {
	pub fov: xr::Fovf,
	pub pose: xr::Posef,
}

impl LocatedView {
	/// Poses the runtime flagged as invalid are replaced by a plausible
	/// standing head pose.
	fn new(view: &xr::View, flags: xr::ViewStateFlags) -> Self {
		let mut pose = view.pose;
		if !flags.contains(xr::ViewStateFlags::ORIENTATION_VALID) {
			pose.orientation = xr::Quaternionf {
				x: 0.0,
				y: 0.0,
				z: 0.0,
				w: 1.0,
			};
		}
		if !flags.contains(xr::ViewStateFlags::POSITION_VALID) {
			pose.position = xr::Vector3f {
				x: 0.0,
				y: 1.5,
				z: 0.0,
			};
		}
		Self { fov: view.fov, pose }
	}
}

pub struct MirrorLayer<D: CompositorDevice> {
	next: NextDispatch,
	config: LayerConfig,
	compositor: Option<Compositor<D>>,
	connect: HostConnector,
	host: Option<Box<dyn HostGraphics>>,
	/// The session whose device `host` copies on.
	host_session: Option<xr::Session>,
	sessions: AHashSet<xr::Session>,
	/// Recommended per-eye sizes of the headset.
	view_configs: Vec<(u32, u32)>,
	located_views: Vec<LocatedView>,
	spaces: SpaceRegistry,
	swapchains: AHashMap<xr::Swapchain, SwapchainState>,
}

impl<D: CompositorDevice> MirrorLayer<D> {
	/// `compositor` is `None` when it couldn't be created; the layer then
	/// only passes calls through.
	pub fn new(
		next: NextDispatch,
		config: LayerConfig,
		compositor: Option<Compositor<D>>,
		connect: HostConnector,
	) -> Self {
		Self {
			next,
			config,
			compositor,
			connect,
			host: None,
			host_session: None,
			sessions: AHashSet::new(),
			view_configs: Vec::new(),
			located_views: Vec::new(),
			spaces: SpaceRegistry::default(),
			swapchains: AHashMap::new(),
		}
	}

	pub fn compositor(&self) -> Option<&Compositor<D>> {
		self.compositor.as_ref()
	}

	pub fn swapchain(&self, swapchain: xr::Swapchain) -> Option<&SwapchainState> {
		self.swapchains.get(&swapchain)
	}

	fn mirroring(&self) -> bool {
		self.compositor.is_some() && self.host.is_some()
	}

	/// Binds mirroring to the newest session's device. Whatever was set up
	/// on an earlier session's device is dropped first.
	fn connect_host(&mut self, session: xr::Session, create_info: *const xr::SessionCreateInfo) {
		if self.compositor.is_none() {
			return;
		}
		if self.host.is_some() {
			self.disconnect_host();
		}
		match unsafe { HostBinding::find(create_info) } {
			Some(binding) => match (self.connect)(&binding) {
				Ok(host) => {
					info!("mirroring {} session {:?}", host.api(), session);
					self.host = Some(host);
					self.host_session = Some(session);
				}
				Err(err) => logging::report("failed to attach to the application's device", &err),
			},
			None => warn!("session has no Direct3D binding, not mirroring"),
		}
	}

	fn disconnect_host(&mut self) {
		if let Some(session) = self.host_session.take() {
			info!("session {:?} no longer mirrored", session);
		}
		let swapchains: Vec<_> = self.swapchains.keys().copied().collect();
		for swapchain in swapchains {
			self.release_swapchain(swapchain);
		}
		self.host = None;
		self.view_configs.clear();
		self.located_views.clear();
	}

	/// Asks the runtime for the headset's recommended eye sizes, used when a
	/// frame carries no projection layer.
	unsafe fn query_view_configs(&mut self, instance: xr::Instance, fallback: xr::SystemId) {
		let get_info = xr::SystemGetInfo {
			ty: xr::StructureType::SYSTEM_GET_INFO,
			next: ptr::null(),
			form_factor: xr::FormFactor::HEAD_MOUNTED_DISPLAY,
		};
		let mut system = fallback;
		let result = self.next.get_system(instance, &get_info, &mut system);
		if !succeeded(result) {
			debug!("xrGetSystem: {:?}, using the session's system", result);
			system = fallback;
		}

		let stereo = xr::ViewConfigurationType::PRIMARY_STEREO;
		let mut count = 0;
		let result = self
			.next
			.enumerate_view_configuration_views(instance, system, stereo, 0, &mut count, ptr::null_mut());
		if !succeeded(result) || count == 0 {
			debug!("no view configuration views: {:?}", result);
			return;
		}
		let mut views = vec![empty_view_config(); count as usize];
		let result = self.next.enumerate_view_configuration_views(
			instance,
			system,
			stereo,
			count,
			&mut count,
			views.as_mut_ptr(),
		);
		if succeeded(result) {
			views.truncate(count as usize);
			self.view_configs = views
				.iter()
				.map(|view| {
					(
						view.recommended_image_rect_width,
						view.recommended_image_rect_height,
					)
				})
				.collect();
			debug!("recommended eye sizes {:?}", self.view_configs);
		}
	}

	fn mirror_images(&mut self, swapchain: xr::Swapchain, textures: &[*mut c_void]) -> Result<()> {
		let (Some(host), Some(compositor)) = (self.host.as_mut(), self.compositor.as_mut()) else {
			return Ok(());
		};
		let Some(state) = self.swapchains.get_mut(&swapchain) else {
			return Ok(());
		};
		host.bind_images(swapchain, textures)
			.context("failed to set up swapchain images")?;
		if state.has_shadow() && host.shadow_desc(swapchain) == Some(state.desc) {
			return Ok(());
		}

		state.phase = SwapchainPhase::Pending;
		compositor.remove_source(swapchain);
		let handle = host
			.create_shadow(swapchain, state.desc)
			.with_context(|| format!("failed to create {} shadow texture", state.desc))?;
		compositor.create_shared_mirror_texture(swapchain, handle, state.desc.format)?;
		state.phase = SwapchainPhase::ShadowAllocated;
		state.copied = None;
		info!("swapchain {:?}: mirroring through {} shadow", swapchain, state.desc);
		Ok(())
	}

	/// Copies released images that missed their copy (mirroring was off at
	/// the time) before they are composited.
	fn recopy_stale_images(&mut self) -> Result<()> {
		let Some(host) = self.host.as_mut() else {
			return Ok(());
		};
		for (&swapchain, state) in self.swapchains.iter_mut() {
			if let Some(index) = state.stale_image() {
				host.copy_image(swapchain, index)?;
				host.image_released(swapchain, index)?;
				state.copied = Some(index);
				state.phase = SwapchainPhase::Active;
			}
		}
		Ok(())
	}

	unsafe fn composite(&mut self, session: xr::Session, info: &xr::FrameEndInfo) -> Result<()> {
		let Some(compositor) = self.compositor.as_mut() else {
			return Ok(());
		};
		if !compositor.check_consumer() || !self.sessions.contains(&session) {
			return Ok(());
		}
		self.recopy_stale_images()?;

		let Self {
			compositor,
			swapchains,
			spaces,
			located_views,
			view_configs,
			..
		} = self;
		let Some(compositor) = compositor.as_mut() else {
			return Ok(());
		};
		let layers: &[*const xr::CompositionLayerBaseHeader] = if info.layers.is_null() {
			&[]
		} else {
			slice::from_raw_parts(info.layers, info.layer_count as usize)
		};
		let eye = compositor.eye_selection();
		let primary = usize::from(eye == EyeSelection::Right);
		let mirrored = |swapchain: xr::Swapchain| swapchains.get(&swapchain).filter(|state| state.has_shadow());

		// Which eye(s) quads are drawn for, and into which part of the output.
		let mut eyes = Vec::with_capacity(2);
		let projection = layers
			.iter()
			.filter_map(|&layer| layer.as_ref())
			.filter(|layer| layer.ty == xr::StructureType::COMPOSITION_LAYER_PROJECTION)
			.map(|layer| &*(layer as *const _ as *const xr::CompositionLayerProjection))
			.find(|layer| layer.view_count >= 2 && !layer.views.is_null());
		match projection {
			Some(layer) => {
				let views = slice::from_raw_parts(layer.views, layer.view_count as usize);
				let view = &views[primary];
				let rect = PixelRect::from_xr(&view.sub_image.image_rect);
				if let Some(state) = mirrored(view.sub_image.swapchain) {
					compositor.ensure_output_surface(rect.width, rect.height, state.desc.format)?;
					compositor.copy_perspective(rect, view.sub_image.swapchain, 0)?;
				}
				eyes.push(EyeView {
					fov: view.fov,
					pose: view.pose,
					viewport: PixelRect::new(0, 0, rect.width, rect.height),
				});

				if eye == EyeSelection::Wide {
					let second = &views[1];
					let second_rect = PixelRect::from_xr(&second.sub_image.image_rect);
					if mirrored(second.sub_image.swapchain).is_some() {
						let native = located_views.get(1).map_or(second.fov, |located| located.fov);
						compositor.blend_projection(
							second_rect,
							second.sub_image.swapchain,
							&second.fov,
							&native,
						)?;
					}
					let overlap = compositor.tunables().overlap_percent;
					eyes.push(EyeView {
						fov: second.fov,
						pose: second.pose,
						viewport: PixelRect::new(
							math::second_view_offset(rect.width, overlap),
							0,
							second_rect.width,
							second_rect.height,
						),
					});
				}
			}
			None => {
				// Overlay-only frame: place quads with the last located views.
				if let (Some(view), Some(&(width, height))) =
					(located_views.get(primary), view_configs.get(primary))
				{
					eyes.push(EyeView {
						fov: view.fov,
						pose: view.pose,
						viewport: PixelRect::new(0, 0, width, height),
					});
				}
			}
		}

		let quads = || {
			layers
				.iter()
				.filter_map(|&layer| layer.as_ref())
				.filter(|layer| layer.ty == xr::StructureType::COMPOSITION_LAYER_QUAD)
				.map(|layer| &*(layer as *const _ as *const xr::CompositionLayerQuad))
		};
		if projection.is_none() {
			// The first mirrored quad decides the output format for the frame.
			let first = quads().find_map(|quad| mirrored(quad.sub_image.swapchain));
			if let (Some(state), Some(view)) = (first, eyes.first()) {
				compositor.ensure_output_surface(view.viewport.width, view.viewport.height, state.desc.format)?;
			}
		}

		for quad in quads() {
			if mirrored(quad.sub_image.swapchain).is_none() {
				continue;
			}
			let placement = QuadPlacement {
				swapchain: quad.sub_image.swapchain,
				rect: PixelRect::from_xr(&quad.sub_image.image_rect),
				pose: quad.pose,
				size: quad.size,
			};
			let head_locked = spaces.view_pose(quad.space);
			for view in &eyes {
				let view = EyeView {
					pose: head_locked.unwrap_or(view.pose),
					..*view
				};
				compositor.blend_quad(&view, &placement)?;
			}
		}

		compositor.copy_to_mirror()
	}

	fn release_swapchain(&mut self, swapchain: xr::Swapchain) {
		if let Some(state) = self.swapchains.remove(&swapchain) {
			if state.has_shadow() {
				debug!("swapchain {:?} destroyed, dropping its shadow", swapchain);
			}
		}
		if let Some(host) = self.host.as_mut() {
			host.release(swapchain);
		}
		if let Some(compositor) = self.compositor.as_mut() {
			compositor.remove_source(swapchain);
		}
	}

	fn shutdown(&mut self) {
		let swapchains: Vec<_> = self.swapchains.keys().copied().collect();
		for swapchain in swapchains {
			self.release_swapchain(swapchain);
		}
		self.host = None;
		self.host_session = None;
		self.compositor = None;
		self.sessions.clear();
	}
}

fn empty_view_config() -> xr::ViewConfigurationView {
	xr::ViewConfigurationView {
		ty: xr::StructureType::VIEW_CONFIGURATION_VIEW,
		next: ptr::null_mut(),
		recommended_image_rect_width: 0,
		max_image_rect_width: 0,
		recommended_image_rect_height: 0,
		max_image_rect_height: 0,
		recommended_swapchain_sample_count: 0,
		max_swapchain_sample_count: 0,
	}
}

impl<D: CompositorDevice> OpenXrApi for MirrorLayer<D> {
	fn next(&self) -> &NextDispatch {
		&self.next
	}

	unsafe fn destroy_instance(&mut self, instance: xr::Instance) -> xr::Result {
		self.shutdown();
		self.next.destroy_instance(instance)
	}

	unsafe fn create_session(
		&mut self,
		instance: xr::Instance,
		create_info: *const xr::SessionCreateInfo,
		session: *mut xr::Session,
	) -> xr::Result {
		let result = self.next.create_session(instance, create_info, session);
		if succeeded(result) && !session.is_null() {
			self.sessions.insert(*session);
			self.connect_host(*session, create_info);
			if let Some(info) = create_info.as_ref() {
				if self.mirroring() {
					self.query_view_configs(instance, info.system_id);
				}
			}
		}
		result
	}

	unsafe fn destroy_session(&mut self, session: xr::Session) -> xr::Result {
		if self.sessions.remove(&session) {
			let owned: Vec<_> = self
				.swapchains
				.iter()
				.filter(|(_, state)| state.session == session)
				.map(|(&swapchain, _)| swapchain)
				.collect();
			for swapchain in owned {
				self.release_swapchain(swapchain);
			}
			if self.host_session == Some(session) {
				self.disconnect_host();
			}
		}
		self.next.destroy_session(session)
	}

	unsafe fn create_swapchain(
		&mut self,
		session: xr::Session,
		create_info: *const xr::SwapchainCreateInfo,
		swapchain: *mut xr::Swapchain,
	) -> xr::Result {
		let result = self.next.create_swapchain(session, create_info, swapchain);
		let (Some(info), false) = (create_info.as_ref(), swapchain.is_null()) else {
			return result;
		};
		if !succeeded(result) || !self.mirroring() || self.host_session != Some(session) {
			return result;
		}
		let new = SwapchainState::new(session, info, self.config.max_bits_per_channel);
		debug!(
			"swapchain {:?}: {} usage {:?} {:?}",
			*swapchain, new.desc, new.usage, new.phase
		);
		let recycled = self.swapchains.get_mut(&*swapchain).filter(|state| new.is_mirrored() && state.has_shadow());
		match recycled {
			// A recycled handle keeps its shadow; the next enumeration sees
			// the new description and reallocates.
			Some(state) => {
				state.session = new.session;
				state.desc = new.desc;
				state.usage = new.usage;
			}
			None => {
				if self.swapchains.contains_key(&*swapchain) {
					self.release_swapchain(*swapchain);
				}
				self.swapchains.insert(*swapchain, new);
			}
		}
		result
	}

	unsafe fn destroy_swapchain(&mut self, swapchain: xr::Swapchain) -> xr::Result {
		self.release_swapchain(swapchain);
		self.next.destroy_swapchain(swapchain)
	}

	unsafe fn enumerate_swapchain_images(
		&mut self,
		swapchain: xr::Swapchain,
		image_capacity_input: u32,
		image_count_output: *mut u32,
		images: *mut xr::SwapchainImageBaseHeader,
	) -> xr::Result {
		let result = self.next.enumerate_swapchain_images(
			swapchain,
			image_capacity_input,
			image_count_output,
			images,
		);
		let eligible = self
			.swapchains
			.get(&swapchain)
			.is_some_and(SwapchainState::is_mirrored);
		if succeeded(result) && eligible && image_capacity_input > 0 && !image_count_output.is_null() {
			let count = (*image_count_output).min(image_capacity_input);
			let textures = image_textures(images, count);
			if let Err(err) = self.mirror_images(swapchain, &textures) {
				logging::report("failed to mirror swapchain", &err);
			}
		}
		result
	}

	unsafe fn acquire_swapchain_image(
		&mut self,
		swapchain: xr::Swapchain,
		acquire_info: *const xr::SwapchainImageAcquireInfo,
		index: *mut u32,
	) -> xr::Result {
		let result = self.next.acquire_swapchain_image(swapchain, acquire_info, index);
		if succeeded(result) && !index.is_null() {
			if let Some(state) = self.swapchains.get_mut(&swapchain) {
				state.acquired = Some(*index);
			}
		}
		result
	}

	unsafe fn release_swapchain_image(
		&mut self,
		swapchain: xr::Swapchain,
		release_info: *const xr::SwapchainImageReleaseInfo,
	) -> xr::Result {
		let enabled = self.compositor.as_ref().is_some_and(Compositor::enabled);
		let mut copied = None;
		if let (true, Some(host), Some(state)) =
			(enabled, self.host.as_mut(), self.swapchains.get_mut(&swapchain))
		{
			if let (true, Some(index)) = (state.has_shadow(), state.acquired) {
				match host.copy_image(swapchain, index) {
					Ok(()) => {
						copied = Some(index);
						state.copied = Some(index);
						state.phase = SwapchainPhase::Active;
					}
					Err(err) => logging::report("failed to copy swapchain image", &err),
				}
			}
		}

		let result = self.next.release_swapchain_image(swapchain, release_info);

		if let Some(state) = self.swapchains.get_mut(&swapchain) {
			if succeeded(result) {
				state.released = state.acquired.take();
			}
		}
		if let (Some(index), Some(host)) = (copied, self.host.as_mut()) {
			if let Err(err) = host.image_released(swapchain, index) {
				logging::report("failed to signal copy completion", &err);
			}
		}
		result
	}

	unsafe fn locate_views(
		&mut self,
		session: xr::Session,
		view_locate_info: *const xr::ViewLocateInfo,
		view_state: *mut xr::ViewState,
		view_capacity_input: u32,
		view_count_output: *mut u32,
		views: *mut xr::View,
	) -> xr::Result {
		let result = self.next.locate_views(
			session,
			view_locate_info,
			view_state,
			view_capacity_input,
			view_count_output,
			views,
		);
		if !succeeded(result) || !self.mirroring() || view_capacity_input == 0 || views.is_null() {
			return result;
		}
		let (Some(info), Some(state), Some(&count)) = (
			view_locate_info.as_ref(),
			view_state.as_ref(),
			view_count_output.as_ref(),
		) else {
			return result;
		};
		// Head-locked locations say nothing about where the eyes are.
		if self.spaces.get(info.space).is_some_and(|space| !space.is_view()) {
			let count = count.min(view_capacity_input) as usize;
			self.located_views = slice::from_raw_parts(views, count)
				.iter()
				.map(|view| LocatedView::new(view, state.view_state_flags))
				.collect();
		}
		result
	}

	unsafe fn create_reference_space(
		&mut self,
		session: xr::Session,
		create_info: *const xr::ReferenceSpaceCreateInfo,
		space: *mut xr::Space,
	) -> xr::Result {
		let result = self.next.create_reference_space(session, create_info, space);
		if let (true, Some(info), false) = (succeeded(result), create_info.as_ref(), space.is_null()) {
			self.spaces.insert(*space, info);
		}
		result
	}

	unsafe fn destroy_space(&mut self, space: xr::Space) -> xr::Result {
		self.spaces.remove(space);
		self.next.destroy_space(space)
	}

	unsafe fn begin_frame(
		&mut self,
		session: xr::Session,
		frame_begin_info: *const xr::FrameBeginInfo,
	) -> xr::Result {
		if let Some(compositor) = self.compositor.as_mut() {
			compositor.flush();
		}
		self.next.begin_frame(session, frame_begin_info)
	}

	unsafe fn end_frame(
		&mut self,
		session: xr::Session,
		frame_end_info: *const xr::FrameEndInfo,
	) -> xr::Result {
		if let Some(info) = frame_end_info
			.as_ref()
			.filter(|info| info.ty == xr::StructureType::FRAME_END_INFO)
		{
			if self.mirroring() {
				if let Err(err) = self.composite(session, info) {
					logging::report("failed to composite frame", &err);
				}
			}
		}
		self.next.end_frame(session, frame_end_info)
	}
}
