// SPDX-License-Identifier: MPL-2.0
//! What the OpenXR loader sees: interface negotiation, layer instance
//! creation and the table of hooked entry points.
use crate::{
	config::LayerConfig,
	dispatch::{succeeded, NextDispatch, OpenXrApi},
	logging,
};
use once_cell::sync::Lazy;
use openxr_sys::{self as xr, pfn};
use parking_lot::Mutex;
use std::{
	ffi::CStr,
	os::raw::c_char,
	path::{Path, PathBuf},
};

pub const LAYER_NAME: &CStr = c"XR_APILAYER_NOVENDOR_OBSMirror";

const LOADER_INFO: u32 = 1;
const API_LAYER_REQUEST: u32 = 2;
const API_LAYER_CREATE_INFO: u32 = 4;
const API_LAYER_NEXT_INFO: u32 = 5;
const INTERFACE_VERSION: u32 = 1;
const STRUCT_VERSION: u32 = 1;
const MAX_API_LAYER_NAME_SIZE: usize = 256;
const MAX_SETTINGS_PATH_SIZE: usize = 512;
const SETTINGS_FILE: &str = "settings.json";

pub type CreateApiLayerInstance = unsafe extern "system" fn(
	info: *const xr::InstanceCreateInfo,
	layer_info: *const ApiLayerCreateInfo,
	instance: *mut xr::Instance,
) -> xr::Result;

/// `XrNegotiateLoaderInfo`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NegotiateLoaderInfo {
	pub struct_type: u32,
	pub struct_version: u32,
	pub struct_size: usize,
	pub min_interface_version: u32,
	pub max_interface_version: u32,
	pub min_api_version: xr::Version,
	pub max_api_version: xr::Version,
}

/// `XrNegotiateApiLayerRequest`.
#[repr(C)]
pub struct NegotiateApiLayerRequest {
	pub struct_type: u32,
	pub struct_version: u32,
	pub struct_size: usize,
	pub layer_interface_version: u32,
	pub layer_api_version: xr::Version,
	pub get_instance_proc_addr: Option<pfn::GetInstanceProcAddr>,
	pub create_api_layer_instance: Option<CreateApiLayerInstance>,
}

/// `XrApiLayerNextInfo`.
#[repr(C)]
pub struct ApiLayerNextInfo {
	pub struct_type: u32,
	pub struct_version: u32,
	pub struct_size: usize,
	pub layer_name: [c_char; MAX_API_LAYER_NAME_SIZE],
	pub next_get_instance_proc_addr: pfn::GetInstanceProcAddr,
	pub next_create_api_layer_instance: CreateApiLayerInstance,
	pub next: *mut ApiLayerNextInfo,
}

/// `XrApiLayerCreateInfo`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ApiLayerCreateInfo {
	pub struct_type: u32,
	pub struct_version: u32,
	pub struct_size: usize,
	pub loader_instance: *mut std::ffi::c_void,
	pub settings_file_location: [c_char; MAX_SETTINGS_PATH_SIZE],
	pub next_info: *mut ApiLayerNextInfo,
}

/// The layer object behind the hooks. Only ever touched with the lock held.
struct LayerCell(Box<dyn OpenXrApi>);

// SAFETY: the layer and the COM objects it holds are only used with
// `LAYER` locked.
unsafe impl Send for LayerCell {}

static LAYER: Lazy<Mutex<Option<LayerCell>>> = Lazy::new(|| Mutex::new(None));

/// # Safety
/// Called by the OpenXR loader with valid (or null) structures.
#[no_mangle]
pub unsafe extern "system" fn xrNegotiateLoaderApiLayerInterface(
	loader_info: *const NegotiateLoaderInfo,
	layer_name: *const c_char,
	request: *mut NegotiateApiLayerRequest,
) -> xr::Result {
	negotiate(loader_info.as_ref(), layer_name, request.as_mut())
}

unsafe fn negotiate(
	loader_info: Option<&NegotiateLoaderInfo>,
	layer_name: *const c_char,
	request: Option<&mut NegotiateApiLayerRequest>,
) -> xr::Result {
	let (Some(loader_info), Some(request)) = (loader_info, request) else {
		return xr::Result::ERROR_INITIALIZATION_FAILED;
	};
	if !layer_name.is_null() && CStr::from_ptr(layer_name) != LAYER_NAME {
		return xr::Result::ERROR_INITIALIZATION_FAILED;
	}
	let loader_ok = loader_info.struct_type == LOADER_INFO
		&& loader_info.struct_version == STRUCT_VERSION
		&& loader_info.struct_size == std::mem::size_of::<NegotiateLoaderInfo>();
	let request_ok = request.struct_type == API_LAYER_REQUEST
		&& request.struct_version == STRUCT_VERSION
		&& request.struct_size == std::mem::size_of::<NegotiateApiLayerRequest>();
	let interface_ok = (loader_info.min_interface_version..=loader_info.max_interface_version)
		.contains(&INTERFACE_VERSION);
	let api_ok = loader_info.min_api_version.major() <= xr::CURRENT_API_VERSION.major()
		&& xr::CURRENT_API_VERSION.major() <= loader_info.max_api_version.major();
	if !(loader_ok && request_ok && interface_ok && api_ok) {
		return xr::Result::ERROR_INITIALIZATION_FAILED;
	}

	request.layer_interface_version = INTERFACE_VERSION;
	request.layer_api_version = xr::CURRENT_API_VERSION;
	request.get_instance_proc_addr = Some(get_instance_proc_addr);
	request.create_api_layer_instance = Some(create_api_layer_instance);
	xr::Result::SUCCESS
}

unsafe extern "system" fn create_api_layer_instance(
	info: *const xr::InstanceCreateInfo,
	layer_info: *const ApiLayerCreateInfo,
	instance: *mut xr::Instance,
) -> xr::Result {
	logging::init();
	let Some(layer_info) = layer_info
		.as_ref()
		.filter(|layer_info| layer_info.struct_type == API_LAYER_CREATE_INFO)
	else {
		return xr::Result::ERROR_INITIALIZATION_FAILED;
	};
	let Some(next_info) = layer_info
		.next_info
		.as_ref()
		.filter(|next_info| next_info.struct_type == API_LAYER_NEXT_INFO)
	else {
		return xr::Result::ERROR_INITIALIZATION_FAILED;
	};

	// The next layer sees the chain without us.
	let chained = ApiLayerCreateInfo {
		next_info: next_info.next,
		..*layer_info
	};
	let result = (next_info.next_create_api_layer_instance)(info, &chained, instance);
	if !succeeded(result) || instance.is_null() {
		return result;
	}

	let next = NextDispatch::load(*instance, next_info.next_get_instance_proc_addr);
	let settings = settings_path(CStr::from_ptr(layer_info.settings_file_location.as_ptr()));
	let config = LayerConfig::load(settings.as_deref());
	debug!("layer settings {:?}", config);
	*LAYER.lock() = Some(LayerCell(platform::create_layer(next, config)));
	result
}

/// `settings.json` in the directory the loader points at, or next to the
/// file it names.
fn settings_path(location: &CStr) -> Option<PathBuf> {
	let location = location.to_str().ok().filter(|location| !location.is_empty())?;
	let location = Path::new(location);
	let dir = if location.is_dir() {
		location
	} else {
		location.parent()?
	};
	Some(dir.join(SETTINGS_FILE))
}

/// Runs `call` on the layer, or fails if no instance is alive.
fn with_layer(call: impl FnOnce(&mut dyn OpenXrApi) -> xr::Result) -> xr::Result {
	match LAYER.lock().as_mut() {
		Some(cell) => call(cell.0.as_mut()),
		None => xr::Result::ERROR_HANDLE_INVALID,
	}
}

unsafe extern "system" fn get_instance_proc_addr(
	instance: xr::Instance,
	name: *const c_char,
	function: *mut Option<pfn::VoidFunction>,
) -> xr::Result {
	if name.is_null() || function.is_null() {
		return xr::Result::ERROR_VALIDATION_FAILURE;
	}
	if let Some(hook) = hook(CStr::from_ptr(name)) {
		*function = Some(hook);
		return xr::Result::SUCCESS;
	}
	with_layer(|layer| layer.next().get_instance_proc_addr(instance, name, function))
}

unsafe extern "system" fn destroy_instance(instance: xr::Instance) -> xr::Result {
	let mut layer = LAYER.lock();
	let result = match layer.as_mut() {
		Some(cell) => cell.0.destroy_instance(instance),
		None => return xr::Result::ERROR_HANDLE_INVALID,
	};
	*layer = None;
	info!("instance destroyed, layer unloaded");
	result
}

macro_rules! hooks {
	($($name:literal => $thunk:ident: $pfn:ident = $method:ident($($arg:ident: $ty:ty),*);)*) => {
		$(
			unsafe extern "system" fn $thunk($($arg: $ty),*) -> xr::Result {
				with_layer(|layer| layer.$method($($arg),*))
			}
		)*

		/// The entry points this layer answers itself.
		fn hook(name: &CStr) -> Option<pfn::VoidFunction> {
			// SAFETY: the loader casts these back to their real signatures.
			let function = unsafe {
				match name.to_bytes() {
					b"xrGetInstanceProcAddr" => std::mem::transmute::<pfn::GetInstanceProcAddr, pfn::VoidFunction>(
						get_instance_proc_addr,
					),
					b"xrDestroyInstance" => {
						std::mem::transmute::<pfn::DestroyInstance, pfn::VoidFunction>(destroy_instance)
					}
					$($name => std::mem::transmute::<pfn::$pfn, pfn::VoidFunction>($thunk),)*
					_ => return None,
				}
			};
			Some(function)
		}
	};
}

hooks! {
	b"xrCreateSession" => hook_create_session: CreateSession = create_session(
		instance: xr::Instance,
		create_info: *const xr::SessionCreateInfo,
		session: *mut xr::Session
	);
	b"xrDestroySession" => hook_destroy_session: DestroySession = destroy_session(session: xr::Session);
	b"xrCreateSwapchain" => hook_create_swapchain: CreateSwapchain = create_swapchain(
		session: xr::Session,
		create_info: *const xr::SwapchainCreateInfo,
		swapchain: *mut xr::Swapchain
	);
	b"xrDestroySwapchain" => hook_destroy_swapchain: DestroySwapchain = destroy_swapchain(swapchain: xr::Swapchain);
	b"xrEnumerateSwapchainImages" => hook_enumerate_swapchain_images: EnumerateSwapchainImages = enumerate_swapchain_images(
		swapchain: xr::Swapchain,
		image_capacity_input: u32,
		image_count_output: *mut u32,
		images: *mut xr::SwapchainImageBaseHeader
	);
	b"xrAcquireSwapchainImage" => hook_acquire_swapchain_image: AcquireSwapchainImage = acquire_swapchain_image(
		swapchain: xr::Swapchain,
		acquire_info: *const xr::SwapchainImageAcquireInfo,
		index: *mut u32
	);
	b"xrReleaseSwapchainImage" => hook_release_swapchain_image: ReleaseSwapchainImage = release_swapchain_image(
		swapchain: xr::Swapchain,
		release_info: *const xr::SwapchainImageReleaseInfo
	);
	b"xrLocateViews" => hook_locate_views: LocateViews = locate_views(
		session: xr::Session,
		view_locate_info: *const xr::ViewLocateInfo,
		view_state: *mut xr::ViewState,
		view_capacity_input: u32,
		view_count_output: *mut u32,
		views: *mut xr::View
	);
	b"xrCreateReferenceSpace" => hook_create_reference_space: CreateReferenceSpace = create_reference_space(
		session: xr::Session,
		create_info: *const xr::ReferenceSpaceCreateInfo,
		space: *mut xr::Space
	);
	b"xrDestroySpace" => hook_destroy_space: DestroySpace = destroy_space(space: xr::Space);
	b"xrBeginFrame" => hook_begin_frame: BeginFrame = begin_frame(
		session: xr::Session,
		frame_begin_info: *const xr::FrameBeginInfo
	);
	b"xrEndFrame" => hook_end_frame: EndFrame = end_frame(
		session: xr::Session,
		frame_end_info: *const xr::FrameEndInfo
	);
}

#[cfg(windows)]
mod platform {
	use crate::{
		compositor::Compositor,
		config::LayerConfig,
		d3d11::D3D11Compositor,
		d3d11_host::D3D11Host,
		d3d12_host::D3D12Host,
		dispatch::{NextDispatch, OpenXrApi},
		host::{HostBinding, HostConnector, HostGraphics},
		layer::MirrorLayer,
		logging,
	};

	pub fn create_layer(next: NextDispatch, config: LayerConfig) -> Box<dyn OpenXrApi> {
		let compositor = match D3D11Compositor::new().and_then(|device| Compositor::new(device, &config)) {
			Ok(compositor) => Some(compositor),
			Err(err) => {
				logging::report("mirroring disabled", &err);
				None
			}
		};
		let fence_timeout_ms = config.fence_timeout_ms;
		let connect: HostConnector = Box::new(move |binding| {
			Ok(match *binding {
				HostBinding::D3D11 { device } => Box::new(D3D11Host::new(device)?) as Box<dyn HostGraphics>,
				HostBinding::D3D12 { device, queue } => {
					Box::new(D3D12Host::new(device, queue, fence_timeout_ms)?)
				}
			})
		});
		Box::new(MirrorLayer::new(next, config, compositor, connect))
	}
}

#[cfg(not(windows))]
mod platform {
	use crate::{
		config::LayerConfig,
		dispatch::{NextDispatch, OpenXrApi},
	};

	/// There is no Direct3D to mirror from; forward everything.
	struct PassThrough {
		next: NextDispatch,
	}

	impl OpenXrApi for PassThrough {
		fn next(&self) -> &NextDispatch {
			&self.next
		}
	}

	pub fn create_layer(next: NextDispatch, _config: LayerConfig) -> Box<dyn OpenXrApi> {
		warn!("no Direct3D on this platform, passing calls through");
		Box::new(PassThrough { next })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::ptr;

	fn loader_info() -> NegotiateLoaderInfo {
		NegotiateLoaderInfo {
			struct_type: LOADER_INFO,
			struct_version: STRUCT_VERSION,
			struct_size: std::mem::size_of::<NegotiateLoaderInfo>(),
			min_interface_version: 1,
			max_interface_version: 1,
			min_api_version: xr::Version::new(1, 0, 0),
			max_api_version: xr::Version::new(1, 0x3ff, 0xfff),
		}
	}

	fn request() -> NegotiateApiLayerRequest {
		NegotiateApiLayerRequest {
			struct_type: API_LAYER_REQUEST,
			struct_version: STRUCT_VERSION,
			struct_size: std::mem::size_of::<NegotiateApiLayerRequest>(),
			layer_interface_version: 0,
			layer_api_version: xr::Version::new(0, 0, 0),
			get_instance_proc_addr: None,
			create_api_layer_instance: None,
		}
	}

	#[test]
	fn negotiation_hands_out_the_entry_points() {
		let info = loader_info();
		let mut request = request();
		let result = unsafe { negotiate(Some(&info), LAYER_NAME.as_ptr(), Some(&mut request)) };
		assert_eq!(result, xr::Result::SUCCESS);
		assert_eq!(request.layer_interface_version, 1);
		assert_eq!(request.layer_api_version, xr::CURRENT_API_VERSION);
		assert!(request.get_instance_proc_addr.is_some());
		assert!(request.create_api_layer_instance.is_some());
	}

	#[test]
	fn negotiation_rejects_what_it_cannot_serve() {
		let mut request = request();
		let newer = NegotiateLoaderInfo {
			min_interface_version: 2,
			max_interface_version: 3,
			..loader_info()
		};
		let result = unsafe { negotiate(Some(&newer), ptr::null(), Some(&mut request)) };
		assert_eq!(result, xr::Result::ERROR_INITIALIZATION_FAILED);
		assert!(request.get_instance_proc_addr.is_none());

		let result = unsafe { negotiate(Some(&loader_info()), c"XR_APILAYER_other".as_ptr(), Some(&mut request)) };
		assert_eq!(result, xr::Result::ERROR_INITIALIZATION_FAILED);

		let mut truncated = NegotiateApiLayerRequest {
			struct_size: 8,
			..request
		};
		let result = unsafe { negotiate(Some(&loader_info()), ptr::null(), Some(&mut truncated)) };
		assert_eq!(result, xr::Result::ERROR_INITIALIZATION_FAILED);
		assert_eq!(unsafe { negotiate(None, ptr::null(), None) }, xr::Result::ERROR_INITIALIZATION_FAILED);
	}

	#[test]
	fn hook_table_covers_the_intercepted_calls() {
		for name in [
			c"xrGetInstanceProcAddr",
			c"xrDestroyInstance",
			c"xrCreateSession",
			c"xrDestroySession",
			c"xrCreateSwapchain",
			c"xrDestroySwapchain",
			c"xrEnumerateSwapchainImages",
			c"xrAcquireSwapchainImage",
			c"xrReleaseSwapchainImage",
			c"xrLocateViews",
			c"xrCreateReferenceSpace",
			c"xrDestroySpace",
			c"xrBeginFrame",
			c"xrEndFrame",
		] {
			assert!(hook(name).is_some(), "{:?} is not hooked", name);
		}
		assert!(hook(c"xrPollEvent").is_none());
		assert!(hook(c"xrGetSystem").is_none());
	}

	#[test]
	fn settings_live_next_to_the_manifest() {
		let dir = std::env::temp_dir();
		let manifest = dir.join("XR_APILAYER_NOVENDOR_OBSMirror.json");
		let location = std::ffi::CString::new(manifest.to_string_lossy().into_owned()).expect("path");
		assert_eq!(settings_path(&location), Some(dir.join(SETTINGS_FILE)));
		let location = std::ffi::CString::new(dir.to_string_lossy().into_owned()).expect("path");
		assert_eq!(settings_path(&location), Some(dir.join(SETTINGS_FILE)));
		assert_eq!(settings_path(c""), None);
	}

	const INSTANCE: u64 = 0x42;

	unsafe extern "system" fn next_begin_frame(
		_session: xr::Session,
		_info: *const xr::FrameBeginInfo,
	) -> xr::Result {
		xr::Result::SESSION_LOSS_PENDING
	}

	unsafe extern "system" fn next_get_instance_proc_addr(
		_instance: xr::Instance,
		name: *const c_char,
		function: *mut Option<pfn::VoidFunction>,
	) -> xr::Result {
		if CStr::from_ptr(name) == c"xrBeginFrame" {
			*function = Some(std::mem::transmute::<pfn::BeginFrame, pfn::VoidFunction>(
				next_begin_frame,
			));
			xr::Result::SUCCESS
		} else {
			*function = None;
			xr::Result::ERROR_FUNCTION_UNSUPPORTED
		}
	}

	unsafe extern "system" fn next_create_api_layer_instance(
		_info: *const xr::InstanceCreateInfo,
		layer_info: *const ApiLayerCreateInfo,
		instance: *mut xr::Instance,
	) -> xr::Result {
		// This layer must have removed itself from the chain.
		if !(*layer_info).next_info.is_null() {
			return xr::Result::ERROR_VALIDATION_FAILURE;
		}
		*instance = xr::Instance::from_raw(INSTANCE);
		xr::Result::SUCCESS
	}

	#[test]
	fn instance_lifecycle_through_the_loader_entry_points() {
		let mut next_info = ApiLayerNextInfo {
			struct_type: API_LAYER_NEXT_INFO,
			struct_version: STRUCT_VERSION,
			struct_size: std::mem::size_of::<ApiLayerNextInfo>(),
			layer_name: [0; MAX_API_LAYER_NAME_SIZE],
			next_get_instance_proc_addr,
			next_create_api_layer_instance,
			next: ptr::null_mut(),
		};
		let layer_info = ApiLayerCreateInfo {
			struct_type: API_LAYER_CREATE_INFO,
			struct_version: STRUCT_VERSION,
			struct_size: std::mem::size_of::<ApiLayerCreateInfo>(),
			loader_instance: ptr::null_mut(),
			settings_file_location: [0; MAX_SETTINGS_PATH_SIZE],
			next_info: &mut next_info,
		};
		let mut instance = xr::Instance::NULL;
		let result = unsafe { create_api_layer_instance(ptr::null(), &layer_info, &mut instance) };
		assert_eq!(result, xr::Result::SUCCESS);
		assert_eq!(instance, xr::Instance::from_raw(INSTANCE));

		let mut function = None;
		let result = unsafe { get_instance_proc_addr(instance, c"xrBeginFrame".as_ptr(), &mut function) };
		assert_eq!(result, xr::Result::SUCCESS);
		let begin_frame = unsafe {
			std::mem::transmute::<pfn::VoidFunction, pfn::BeginFrame>(function.expect("hooked"))
		};
		let session = xr::Session::from_raw(7);
		assert_eq!(
			unsafe { begin_frame(session, ptr::null()) },
			xr::Result::SESSION_LOSS_PENDING
		);

		let mut function = None;
		let result = unsafe { get_instance_proc_addr(instance, c"xrPollEvent".as_ptr(), &mut function) };
		assert_eq!(result, xr::Result::ERROR_FUNCTION_UNSUPPORTED);
		assert!(function.is_none());

		let result = unsafe { destroy_instance(instance) };
		assert_eq!(result, xr::Result::ERROR_FUNCTION_UNSUPPORTED);
		assert!(LAYER.lock().is_none());
		assert_eq!(
			unsafe { begin_frame(session, ptr::null()) },
			xr::Result::ERROR_HANDLE_INVALID
		);
	}
}
