// SPDX-License-Identifier: MPL-2.0
//! Calling down the layer chain.
use openxr_sys::{self as xr, pfn};
use std::ffi::CStr;

pub fn succeeded(result: xr::Result) -> bool {
	result.into_raw() >= 0
}

unsafe fn resolve(
	instance: xr::Instance,
	get_instance_proc_addr: pfn::GetInstanceProcAddr,
	name: &CStr,
) -> Option<pfn::VoidFunction> {
	let mut function = None;
	let result = get_instance_proc_addr(instance, name.as_ptr(), &mut function);
	if succeeded(result) {
		function
	} else {
		debug!("next layer has no {:?} ({:?})", name, result);
		None
	}
}

macro_rules! next_dispatch {
	($($method:ident: $pfn:ident = $name:expr => ($($arg:ident: $ty:ty),*);)*) => {
		/// Entry points of whatever sits below this layer, resolved once
		/// after instance creation.
		#[derive(Debug, Clone, Copy, Default)]
		pub struct NextDispatch {
			instance: xr::Instance,
			next_get_instance_proc_addr: Option<pfn::GetInstanceProcAddr>,
			$($method: Option<pfn::$pfn>,)*
		}

		impl NextDispatch {
			/// # Safety
			/// `get_instance_proc_addr` must be the next layer's resolver for
			/// `instance`.
			pub unsafe fn load(instance: xr::Instance, get_instance_proc_addr: pfn::GetInstanceProcAddr) -> Self {
				Self {
					instance,
					next_get_instance_proc_addr: Some(get_instance_proc_addr),
					$($method: resolve(instance, get_instance_proc_addr, $name)
						.map(|function| std::mem::transmute::<pfn::VoidFunction, pfn::$pfn>(function)),)*
				}
			}

			$(
				/// Calls the next layer, or reports the function as
				/// unsupported if it could not be resolved.
				///
				/// # Safety
				/// Same contract as the OpenXR entry point.
				pub unsafe fn $method(&self, $($arg: $ty),*) -> xr::Result {
					match self.$method {
						Some(next) => next($($arg),*),
						None => xr::Result::ERROR_FUNCTION_UNSUPPORTED,
					}
				}
			)*
		}
	};
}

next_dispatch! {
	destroy_instance: DestroyInstance = c"xrDestroyInstance" => (instance: xr::Instance);
	get_system: GetSystem = c"xrGetSystem" => (
		instance: xr::Instance,
		get_info: *const xr::SystemGetInfo,
		system_id: *mut xr::SystemId
	);
	enumerate_view_configuration_views: EnumerateViewConfigurationViews = c"xrEnumerateViewConfigurationViews" => (
		instance: xr::Instance,
		system_id: xr::SystemId,
		view_configuration_type: xr::ViewConfigurationType,
		view_capacity_input: u32,
		view_count_output: *mut u32,
		views: *mut xr::ViewConfigurationView
	);
	create_session: CreateSession = c"xrCreateSession" => (
		instance: xr::Instance,
		create_info: *const xr::SessionCreateInfo,
		session: *mut xr::Session
	);
	destroy_session: DestroySession = c"xrDestroySession" => (session: xr::Session);
	create_swapchain: CreateSwapchain = c"xrCreateSwapchain" => (
		session: xr::Session,
		create_info: *const xr::SwapchainCreateInfo,
		swapchain: *mut xr::Swapchain
	);
	destroy_swapchain: DestroySwapchain = c"xrDestroySwapchain" => (swapchain: xr::Swapchain);
	enumerate_swapchain_images: EnumerateSwapchainImages = c"xrEnumerateSwapchainImages" => (
		swapchain: xr::Swapchain,
		image_capacity_input: u32,
		image_count_output: *mut u32,
		images: *mut xr::SwapchainImageBaseHeader
	);
	acquire_swapchain_image: AcquireSwapchainImage = c"xrAcquireSwapchainImage" => (
		swapchain: xr::Swapchain,
		acquire_info: *const xr::SwapchainImageAcquireInfo,
		index: *mut u32
	);
	release_swapchain_image: ReleaseSwapchainImage = c"xrReleaseSwapchainImage" => (
		swapchain: xr::Swapchain,
		release_info: *const xr::SwapchainImageReleaseInfo
	);
	locate_views: LocateViews = c"xrLocateViews" => (
		session: xr::Session,
		view_locate_info: *const xr::ViewLocateInfo,
		view_state: *mut xr::ViewState,
		view_capacity_input: u32,
		view_count_output: *mut u32,
		views: *mut xr::View
	);
	create_reference_space: CreateReferenceSpace = c"xrCreateReferenceSpace" => (
		session: xr::Session,
		create_info: *const xr::ReferenceSpaceCreateInfo,
		space: *mut xr::Space
	);
	destroy_space: DestroySpace = c"xrDestroySpace" => (space: xr::Space);
	begin_frame: BeginFrame = c"xrBeginFrame" => (
		session: xr::Session,
		frame_begin_info: *const xr::FrameBeginInfo
	);
	end_frame: EndFrame = c"xrEndFrame" => (
		session: xr::Session,
		frame_end_info: *const xr::FrameEndInfo
	);
}

impl NextDispatch {
	pub fn instance(&self) -> xr::Instance {
		self.instance
	}

	/// Resolves a function this layer doesn't intercept.
	///
	/// # Safety
	/// Same contract as `xrGetInstanceProcAddr`.
	pub unsafe fn get_instance_proc_addr(
		&self,
		instance: xr::Instance,
		name: *const std::os::raw::c_char,
		function: *mut Option<pfn::VoidFunction>,
	) -> xr::Result {
		match self.next_get_instance_proc_addr {
			Some(next) => next(instance, name, function),
			None => xr::Result::ERROR_FUNCTION_UNSUPPORTED,
		}
	}
}

/// The intercepted entry points, one method each.
///
/// Every method must call the next layer exactly once and hand its result
/// back unchanged: mirroring may add work before or after the call, but
/// never replaces it or alters what the application sees. The provided
/// methods only call through.
#[allow(clippy::missing_safety_doc)]
pub trait OpenXrApi {
	fn next(&self) -> &NextDispatch;

	unsafe fn destroy_instance(&mut self, instance: xr::Instance) -> xr::Result {
		self.next().destroy_instance(instance)
	}

	unsafe fn create_session(
		&mut self,
		instance: xr::Instance,
		create_info: *const xr::SessionCreateInfo,
		session: *mut xr::Session,
	) -> xr::Result {
		self.next().create_session(instance, create_info, session)
	}

	unsafe fn destroy_session(&mut self, session: xr::Session) -> xr::Result {
		self.next().destroy_session(session)
	}

	unsafe fn create_swapchain(
		&mut self,
		session: xr::Session,
		create_info: *const xr::SwapchainCreateInfo,
		swapchain: *mut xr::Swapchain,
	) -> xr::Result {
		self.next().create_swapchain(session, create_info, swapchain)
	}

	unsafe fn destroy_swapchain(&mut self, swapchain: xr::Swapchain) -> xr::Result {
		self.next().destroy_swapchain(swapchain)
	}

	unsafe fn enumerate_swapchain_images(
		&mut self,
		swapchain: xr::Swapchain,
		image_capacity_input: u32,
		image_count_output: *mut u32,
		images: *mut xr::SwapchainImageBaseHeader,
	) -> xr::Result {
		self.next()
			.enumerate_swapchain_images(swapchain, image_capacity_input, image_count_output, images)
	}

	unsafe fn acquire_swapchain_image(
		&mut self,
		swapchain: xr::Swapchain,
		acquire_info: *const xr::SwapchainImageAcquireInfo,
		index: *mut u32,
	) -> xr::Result {
		self.next().acquire_swapchain_image(swapchain, acquire_info, index)
	}

	unsafe fn release_swapchain_image(
		&mut self,
		swapchain: xr::Swapchain,
		release_info: *const xr::SwapchainImageReleaseInfo,
	) -> xr::Result {
		self.next().release_swapchain_image(swapchain, release_info)
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
		self.next().locate_views(
			session,
			view_locate_info,
			view_state,
			view_capacity_input,
			view_count_output,
			views,
		)
	}

	unsafe fn create_reference_space(
		&mut self,
		session: xr::Session,
		create_info: *const xr::ReferenceSpaceCreateInfo,
		space: *mut xr::Space,
	) -> xr::Result {
		self.next().create_reference_space(session, create_info, space)
	}

	unsafe fn destroy_space(&mut self, space: xr::Space) -> xr::Result {
		self.next().destroy_space(space)
	}

	unsafe fn begin_frame(
		&mut self,
		session: xr::Session,
		frame_begin_info: *const xr::FrameBeginInfo,
	) -> xr::Result {
		self.next().begin_frame(session, frame_begin_info)
	}

	unsafe fn end_frame(
		&mut self,
		session: xr::Session,
		frame_end_info: *const xr::FrameEndInfo,
	) -> xr::Result {
		self.next().end_frame(session, frame_end_info)
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use std::os::raw::c_char;

	unsafe extern "system" fn fake_begin_frame(
		_session: xr::Session,
		_info: *const xr::FrameBeginInfo,
	) -> xr::Result {
		xr::Result::SESSION_LOSS_PENDING
	}

	unsafe extern "system" fn only_begin_frame(
		_instance: xr::Instance,
		name: *const c_char,
		function: *mut Option<pfn::VoidFunction>,
	) -> xr::Result {
		if CStr::from_ptr(name) == c"xrBeginFrame" {
			*function = Some(std::mem::transmute::<pfn::BeginFrame, pfn::VoidFunction>(
				fake_begin_frame,
			));
			xr::Result::SUCCESS
		} else {
			*function = None;
			xr::Result::ERROR_FUNCTION_UNSUPPORTED
		}
	}

	#[test]
	fn resolved_functions_are_called_and_missing_ones_are_unsupported() {
		let next = unsafe { NextDispatch::load(xr::Instance::from_raw(1), only_begin_frame) };
		assert_eq!(next.instance(), xr::Instance::from_raw(1));
		let session = xr::Session::from_raw(2);
		assert_eq!(
			unsafe { next.begin_frame(session, std::ptr::null()) },
			xr::Result::SESSION_LOSS_PENDING
		);
		assert_eq!(
			unsafe { next.end_frame(session, std::ptr::null()) },
			xr::Result::ERROR_FUNCTION_UNSUPPORTED
		);
	}

	#[test]
	fn qualifier_results_count_as_success() {
		assert!(succeeded(xr::Result::SUCCESS));
		assert!(succeeded(xr::Result::SESSION_LOSS_PENDING));
		assert!(!succeeded(xr::Result::ERROR_RUNTIME_FAILURE));
	}
}
