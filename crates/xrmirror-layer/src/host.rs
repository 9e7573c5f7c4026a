// SPDX-License-Identifier: MPL-2.0
//! The application's side of the GPU: its device, the runtime's swapchain
//! images, and the shareable shadow textures the layer copies them into.
use crate::surface::{SharedHandle, SurfaceDesc};
use anyhow::Result;
use openxr_sys as xr;
use std::{ffi::c_void, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphicsApi {
	D3D11,
	D3D12,
}

impl fmt::Display for GraphicsApi {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::D3D11 => "D3D11",
			Self::D3D12 => "D3D12",
		})
	}
}

/// `XrGraphicsBindingD3D11KHR`.
#[repr(C)]
pub struct GraphicsBindingD3D11 {
	pub ty: xr::StructureType,
	pub next: *const c_void,
	pub device: *mut c_void,
}

/// `XrGraphicsBindingD3D12KHR`.
#[repr(C)]
pub struct GraphicsBindingD3D12 {
	pub ty: xr::StructureType,
	pub next: *const c_void,
	pub device: *mut c_void,
	pub queue: *mut c_void,
}

/// `XrSwapchainImageD3D11KHR` and `XrSwapchainImageD3D12KHR` share this
/// layout; only the type of `texture` differs.
#[repr(C)]
pub struct SwapchainImageTexture {
	pub ty: xr::StructureType,
	pub next: *mut c_void,
	pub texture: *mut c_void,
}

/// The device (and queue) an application created its session with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostBinding {
	D3D11 { device: *mut c_void },
	D3D12 { device: *mut c_void, queue: *mut c_void },
}

impl HostBinding {
	pub fn api(&self) -> GraphicsApi {
		match self {
			Self::D3D11 { .. } => GraphicsApi::D3D11,
			Self::D3D12 { .. } => GraphicsApi::D3D12,
		}
	}

	/// Walks a session create info's `next` chain for a Direct3D binding.
	///
	/// # Safety
	/// `create_info` must be a valid `XrSessionCreateInfo` with a valid
	/// structure chain.
	pub unsafe fn find(create_info: *const xr::SessionCreateInfo) -> Option<Self> {
		let mut next = create_info.as_ref()?.next as *const xr::BaseInStructure;
		while let Some(header) = next.as_ref() {
			match header.ty {
				xr::StructureType::GRAPHICS_BINDING_D3D11_KHR => {
					let binding = &*(next as *const GraphicsBindingD3D11);
					return Some(Self::D3D11 {
						device: binding.device,
					});
				}
				xr::StructureType::GRAPHICS_BINDING_D3D12_KHR => {
					let binding = &*(next as *const GraphicsBindingD3D12);
					return Some(Self::D3D12 {
						device: binding.device,
						queue: binding.queue,
					});
				}
				_ => next = header.next,
			}
		}
		None
	}
}

/// Reads the texture pointers out of an enumerated image array.
///
/// # Safety
/// `images` must point at `count` Direct3D swapchain image structures.
pub unsafe fn image_textures(images: *const xr::SwapchainImageBaseHeader, count: u32) -> Vec<*mut c_void> {
	if images.is_null() {
		return Vec::new();
	}
	std::slice::from_raw_parts(images as *const SwapchainImageTexture, count as usize)
		.iter()
		.map(|image| image.texture)
		.collect()
}

/// Per-swapchain shadow management on the application's device.
pub trait HostGraphics {
	fn api(&self) -> GraphicsApi;

	/// Remembers the runtime's images for `swapchain` and sets up whatever
	/// per-image state copying needs.
	fn bind_images(&mut self, swapchain: xr::Swapchain, textures: &[*mut c_void]) -> Result<()>;

	/// (Re)allocates the shareable shadow texture, releasing any old one.
	fn create_shadow(&mut self, swapchain: xr::Swapchain, desc: SurfaceDesc) -> Result<SharedHandle>;

	fn shadow_desc(&self, swapchain: xr::Swapchain) -> Option<SurfaceDesc>;

	/// Copies image `index` into the shadow. Runs before the real release.
	fn copy_image(&mut self, swapchain: xr::Swapchain, index: u32) -> Result<()>;

	/// Runs after the real release of image `index`.
	fn image_released(&mut self, _swapchain: xr::Swapchain, _index: u32) -> Result<()> {
		Ok(())
	}

	/// Drops the shadow and every per-image resource of `swapchain`.
	fn release(&mut self, swapchain: xr::Swapchain);
}

/// Creates the [`HostGraphics`] for a session's binding.
pub type HostConnector = Box<dyn Fn(&HostBinding) -> Result<Box<dyn HostGraphics>> + Send>;

#[cfg(test)]
mod tests {
	use super::*;
	use std::ptr;

	#[test]
	fn binding_is_found_anywhere_in_the_chain() {
		let queue = 0x20 as *mut c_void;
		let device = 0x10 as *mut c_void;
		let d3d12 = GraphicsBindingD3D12 {
			ty: xr::StructureType::GRAPHICS_BINDING_D3D12_KHR,
			next: ptr::null(),
			device,
			queue,
		};
		let unrelated = xr::BaseInStructure {
			ty: xr::StructureType::SYSTEM_GET_INFO,
			next: &d3d12 as *const GraphicsBindingD3D12 as *const xr::BaseInStructure,
		};
		let create_info = xr::SessionCreateInfo {
			ty: xr::StructureType::SESSION_CREATE_INFO,
			next: &unrelated as *const xr::BaseInStructure as *const c_void,
			create_flags: xr::SessionCreateFlags::EMPTY,
			system_id: xr::SystemId::from_raw(1),
		};
		let binding = unsafe { HostBinding::find(&create_info) };
		assert_eq!(binding, Some(HostBinding::D3D12 { device, queue }));
		assert_eq!(binding.map(|b| b.api()), Some(GraphicsApi::D3D12));
	}

	#[test]
	fn no_binding_means_no_host() {
		let create_info = xr::SessionCreateInfo {
			ty: xr::StructureType::SESSION_CREATE_INFO,
			next: ptr::null(),
			create_flags: xr::SessionCreateFlags::EMPTY,
			system_id: xr::SystemId::from_raw(1),
		};
		assert_eq!(unsafe { HostBinding::find(&create_info) }, None);
		assert_eq!(unsafe { HostBinding::find(ptr::null()) }, None);
	}

	#[test]
	fn textures_are_read_from_image_structs() {
		let images: Vec<SwapchainImageTexture> = (1..=3usize)
			.map(|i| SwapchainImageTexture {
				ty: xr::StructureType::SWAPCHAIN_IMAGE_D3D11_KHR,
				next: ptr::null_mut(),
				texture: (i * 0x100) as *mut c_void,
			})
			.collect();
		let textures = unsafe { image_textures(images.as_ptr() as *const xr::SwapchainImageBaseHeader, 3) };
		assert_eq!(textures, vec![0x100 as *mut c_void, 0x200 as *mut _, 0x300 as *mut _]);
	}
}
