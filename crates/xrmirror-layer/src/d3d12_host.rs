// SPDX-License-Identifier: MPL-2.0
//! Shadow copies for applications rendering with D3D12.
//!
//! Each swapchain image gets its own allocator, command list, fence and
//! event. A copy waits for the previous copy of the same image, records
//! into the reset list and executes it before the real release; the fence
//! is signalled right after the release.
use crate::{
	d3d11_host::borrow_com,
	host::{GraphicsApi, HostGraphics},
	surface::{SharedHandle, SurfaceDesc},
};
use ahash::AHashMap;
use anyhow::{Context, Result};
use openxr_sys as xr;
use std::ffi::c_void;
use windows::{
	core::{ComInterface, PCWSTR},
	Win32::{
		Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0},
		Graphics::{
			Direct3D12::*,
			Dxgi::Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC},
		},
		System::Threading::{CreateEventW, WaitForSingleObject},
	},
};

const GENERIC_ALL: u32 = 0x1000_0000;

/// A Win32 handle closed on drop.
struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
	fn drop(&mut self) {
		if !self.0.is_invalid() {
			let _ = unsafe { CloseHandle(self.0) };
		}
	}
}

struct ImageCopy {
	image: ID3D12Resource,
	allocator: ID3D12CommandAllocator,
	list: ID3D12GraphicsCommandList,
	fence: ID3D12Fence,
	fence_value: u64,
	event: OwnedHandle,
}

struct Shadow {
	resource: ID3D12Resource,
	desc: SurfaceDesc,
	/// Closed with the shadow.
	_handle: OwnedHandle,
}

#[derive(Default)]
struct HostSwapchain {
	images: Vec<ImageCopy>,
	shadow: Option<Shadow>,
}

impl HostSwapchain {
	/// Lets copies still in flight on the current images finish.
	fn drain(&self, swapchain: xr::Swapchain, timeout_ms: u32) {
		for copy in &self.images {
			if let Err(err) = unsafe { copy.wait(timeout_ms) } {
				debug!("swapchain {:?}: {}", swapchain, err);
			}
		}
	}
}

pub struct D3D12Host {
	device: ID3D12Device,
	queue: ID3D12CommandQueue,
	swapchains: AHashMap<xr::Swapchain, HostSwapchain>,
	next_fence_value: u64,
	fence_timeout_ms: u32,
}

impl D3D12Host {
	pub fn new(device: *mut c_void, queue: *mut c_void, fence_timeout_ms: u32) -> Result<Self> {
		Ok(Self {
			device: borrow_com(device, "application device")?,
			queue: borrow_com(queue, "application command queue")?,
			swapchains: AHashMap::new(),
			next_fence_value: 1,
			fence_timeout_ms,
		})
	}

	unsafe fn image_copy(&self, texture: *mut c_void) -> Result<ImageCopy> {
		let image = borrow_com::<ID3D12Resource>(texture, "swapchain image")?;
		let allocator: ID3D12CommandAllocator = self
			.device
			.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT)?;
		let list: ID3D12GraphicsCommandList = self.device.CreateCommandList(
			0,
			D3D12_COMMAND_LIST_TYPE_DIRECT,
			&allocator,
			None::<&ID3D12PipelineState>,
		)?;
		list.Close()?;
		let fence: ID3D12Fence = self.device.CreateFence(0, D3D12_FENCE_FLAG_NONE)?;
		let event = OwnedHandle(CreateEventW(None, false, false, PCWSTR::null())?);
		Ok(ImageCopy {
			image,
			allocator,
			list,
			fence,
			fence_value: 0,
			event,
		})
	}
}

impl ImageCopy {
	/// Blocks until the previous copy of this image has finished, giving up
	/// after `timeout_ms`.
	unsafe fn wait(&self, timeout_ms: u32) -> Result<()> {
		if self.fence.GetCompletedValue() >= self.fence_value {
			return Ok(());
		}
		self.fence
			.SetEventOnCompletion(self.fence_value, self.event.0)?;
		if WaitForSingleObject(self.event.0, timeout_ms) != WAIT_OBJECT_0 {
			warn!(
				"copy fence {} not reached after {} ms",
				self.fence_value, timeout_ms
			);
		}
		Ok(())
	}
}

impl HostGraphics for D3D12Host {
	fn api(&self) -> GraphicsApi {
		GraphicsApi::D3D12
	}

	fn bind_images(&mut self, swapchain: xr::Swapchain, textures: &[*mut c_void]) -> Result<()> {
		if let Some(state) = self.swapchains.get(&swapchain) {
			state.drain(swapchain, self.fence_timeout_ms);
		}
		let images = textures
			.iter()
			.map(|&texture| unsafe { self.image_copy(texture) })
			.collect::<Result<Vec<_>>>()
			.context("failed to create per-image copy state")?;
		self.swapchains.entry(swapchain).or_default().images = images;
		Ok(())
	}

	fn create_shadow(&mut self, swapchain: xr::Swapchain, desc: SurfaceDesc) -> Result<SharedHandle> {
		let state = self.swapchains.entry(swapchain).or_default();
		state.shadow = None;
		let format = DXGI_FORMAT(desc.format.0 as _);
		let resource_desc = D3D12_RESOURCE_DESC {
			Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
			Alignment: 0,
			Width: u64::from(desc.width),
			Height: desc.height,
			DepthOrArraySize: 1,
			MipLevels: 1,
			Format: format,
			SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
			Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
			Flags: D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET | D3D12_RESOURCE_FLAG_ALLOW_SIMULTANEOUS_ACCESS,
		};
		let heap = D3D12_HEAP_PROPERTIES {
			Type: D3D12_HEAP_TYPE_DEFAULT,
			CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
			MemoryPoolPreference: D3D12_MEMORY_POOL_UNKNOWN,
			CreationNodeMask: 0,
			VisibleNodeMask: 0,
		};
		let clear = D3D12_CLEAR_VALUE {
			Format: format,
			Anonymous: D3D12_CLEAR_VALUE_0 { Color: [0.0; 4] },
		};
		unsafe {
			let mut resource: Option<ID3D12Resource> = None;
			self.device.CreateCommittedResource(
				&heap,
				D3D12_HEAP_FLAG_SHARED,
				&resource_desc,
				D3D12_RESOURCE_STATE_COMMON,
				Some(&clear),
				&mut resource,
			)?;
			let resource = resource.context("no shadow resource")?;
			let handle = OwnedHandle(self.device.CreateSharedHandle(
				&resource,
				None,
				GENERIC_ALL,
				PCWSTR::null(),
			)?);
			let shared = SharedHandle::nt(handle.0 .0 as u64);
			state.shadow = Some(Shadow {
				resource,
				desc,
				_handle: handle,
			});
			Ok(shared)
		}
	}

	fn shadow_desc(&self, swapchain: xr::Swapchain) -> Option<SurfaceDesc> {
		self.swapchains
			.get(&swapchain)
			.and_then(|state| state.shadow.as_ref())
			.map(|shadow| shadow.desc)
	}

	fn copy_image(&mut self, swapchain: xr::Swapchain, index: u32) -> Result<()> {
		let Some(state) = self.swapchains.get(&swapchain) else {
			return Ok(());
		};
		let (Some(shadow), Some(copy)) = (&state.shadow, state.images.get(index as usize)) else {
			return Ok(());
		};
		unsafe {
			copy.wait(self.fence_timeout_ms)?;
			copy.allocator.Reset()?;
			copy.list.Reset(&copy.allocator, None::<&ID3D12PipelineState>)?;
			copy.list.CopyResource(&shadow.resource, &copy.image);
			copy.list.Close()?;
			self.queue
				.ExecuteCommandLists(&[Some(copy.list.cast::<ID3D12CommandList>()?)]);
		}
		Ok(())
	}

	fn image_released(&mut self, swapchain: xr::Swapchain, index: u32) -> Result<()> {
		let Some(copy) = self
			.swapchains
			.get_mut(&swapchain)
			.and_then(|state| state.images.get_mut(index as usize))
		else {
			return Ok(());
		};
		let value = self.next_fence_value;
		unsafe { self.queue.Signal(&copy.fence, value)? };
		copy.fence_value = value;
		self.next_fence_value += 1;
		Ok(())
	}

	fn release(&mut self, swapchain: xr::Swapchain) {
		if let Some(state) = self.swapchains.remove(&swapchain) {
			state.drain(swapchain, self.fence_timeout_ms);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::{Duration, Instant};
	use windows::{
		core::Interface,
		Win32::Graphics::{
			Direct3D::D3D_FEATURE_LEVEL_11_0,
			Dxgi::{Common::DXGI_FORMAT_R8G8B8A8_UNORM, CreateDXGIFactory1, IDXGIAdapter, IDXGIFactory4},
		},
	};

	fn warp_device() -> Result<(ID3D12Device, ID3D12CommandQueue)> {
		unsafe {
			let factory: IDXGIFactory4 = CreateDXGIFactory1()?;
			let adapter: IDXGIAdapter = factory.EnumWarpAdapter()?;
			let mut device: Option<ID3D12Device> = None;
			D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device)?;
			let device = device.context("no device")?;
			let queue: ID3D12CommandQueue = device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
				Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
				..Default::default()
			})?;
			Ok((device, queue))
		}
	}

	fn image(device: &ID3D12Device) -> Result<ID3D12Resource> {
		let desc = D3D12_RESOURCE_DESC {
			Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
			Alignment: 0,
			Width: 64,
			Height: 64,
			DepthOrArraySize: 1,
			MipLevels: 1,
			Format: DXGI_FORMAT_R8G8B8A8_UNORM,
			SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
			Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
			Flags: D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET,
		};
		let heap = D3D12_HEAP_PROPERTIES {
			Type: D3D12_HEAP_TYPE_DEFAULT,
			..Default::default()
		};
		let mut resource: Option<ID3D12Resource> = None;
		unsafe {
			device.CreateCommittedResource(
				&heap,
				D3D12_HEAP_FLAG_NONE,
				&desc,
				D3D12_RESOURCE_STATE_COMMON,
				None,
				&mut resource,
			)?;
		}
		resource.context("no image")
	}

	#[test]
	fn rebinding_images_waits_for_pending_copies() -> Result<()> {
		let (device, queue) = warp_device()?;
		let texture = image(&device)?;
		let mut host = D3D12Host::new(device.as_raw(), queue.as_raw(), 200)?;
		let swapchain = xr::Swapchain::from_raw(1);
		host.bind_images(swapchain, &[texture.as_raw()])?;

		// Hold the queue so the copy fence can't complete yet.
		let gate: ID3D12Fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE)? };
		unsafe { queue.Wait(&gate, 1)? };
		host.image_released(swapchain, 0)?;

		let start = Instant::now();
		host.bind_images(swapchain, &[texture.as_raw()])?;
		let waited = start.elapsed();
		unsafe { gate.Signal(1)? };
		assert!(waited >= Duration::from_millis(150), "rebinding took {:?}", waited);

		// Nothing pending any more: no wait.
		host.image_released(swapchain, 0)?;
		let start = Instant::now();
		host.bind_images(swapchain, &[texture.as_raw()])?;
		assert!(start.elapsed() < Duration::from_millis(150));
		Ok(())
	}
}
