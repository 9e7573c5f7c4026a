// SPDX-License-Identifier: MPL-2.0
//! Shadow copies for applications rendering with D3D11.
use crate::{
	host::{GraphicsApi, HostGraphics},
	surface::{SharedHandle, SurfaceDesc},
};
use ahash::AHashMap;
use anyhow::{Context, Result};
use openxr_sys as xr;
use std::ffi::c_void;
use windows::{
	core::{ComInterface, Interface},
	Win32::Graphics::{
		Direct3D11::{
			ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D, D3D11_BIND_SHADER_RESOURCE,
			D3D11_RESOURCE_MISC_SHARED, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT,
		},
		Dxgi::{
			Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC},
			IDXGIResource,
		},
	},
};

/// Takes a new reference to a COM object the application or runtime owns.
pub(crate) fn borrow_com<T: Interface + Clone>(raw: *mut c_void, what: &str) -> Result<T> {
	unsafe { T::from_raw_borrowed(&raw) }
		.cloned()
		.with_context(|| format!("{} is null", what))
}

#[derive(Default)]
struct HostSwapchain {
	images: Vec<ID3D11Texture2D>,
	shadow: Option<(ID3D11Texture2D, SurfaceDesc)>,
}

pub struct D3D11Host {
	device: ID3D11Device,
	context: ID3D11DeviceContext,
	swapchains: AHashMap<xr::Swapchain, HostSwapchain>,
}

impl D3D11Host {
	pub fn new(device: *mut c_void) -> Result<Self> {
		let device: ID3D11Device = borrow_com(device, "application device")?;
		let context = unsafe { device.GetImmediateContext() }?;
		Ok(Self {
			device,
			context,
			swapchains: AHashMap::new(),
		})
	}
}

impl HostGraphics for D3D11Host {
	fn api(&self) -> GraphicsApi {
		GraphicsApi::D3D11
	}

	fn bind_images(&mut self, swapchain: xr::Swapchain, textures: &[*mut c_void]) -> Result<()> {
		let images = textures
			.iter()
			.map(|&texture| borrow_com::<ID3D11Texture2D>(texture, "swapchain image"))
			.collect::<Result<Vec<_>>>()?;
		self.swapchains.entry(swapchain).or_default().images = images;
		Ok(())
	}

	fn create_shadow(&mut self, swapchain: xr::Swapchain, desc: SurfaceDesc) -> Result<SharedHandle> {
		let state = self.swapchains.entry(swapchain).or_default();
		state.shadow = None;
		let texture_desc = D3D11_TEXTURE2D_DESC {
			Width: desc.width,
			Height: desc.height,
			MipLevels: 1,
			ArraySize: 1,
			Format: DXGI_FORMAT(desc.format.0 as _),
			SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
			Usage: D3D11_USAGE_DEFAULT,
			BindFlags: D3D11_BIND_SHADER_RESOURCE.0 as u32,
			CPUAccessFlags: 0,
			MiscFlags: D3D11_RESOURCE_MISC_SHARED.0 as u32,
		};
		unsafe {
			let mut texture = None;
			self.device
				.CreateTexture2D(&texture_desc, None, Some(&mut texture))?;
			let texture: ID3D11Texture2D = texture.context("no shadow texture")?;
			let handle = texture.cast::<IDXGIResource>()?.GetSharedHandle()?;
			state.shadow = Some((texture, desc));
			Ok(SharedHandle::legacy(handle.0 as u64))
		}
	}

	fn shadow_desc(&self, swapchain: xr::Swapchain) -> Option<SurfaceDesc> {
		self.swapchains
			.get(&swapchain)
			.and_then(|state| state.shadow.as_ref())
			.map(|(_, desc)| *desc)
	}

	fn copy_image(&mut self, swapchain: xr::Swapchain, index: u32) -> Result<()> {
		let Some(state) = self.swapchains.get(&swapchain) else {
			return Ok(());
		};
		let (Some((shadow, _)), Some(image)) = (&state.shadow, state.images.get(index as usize)) else {
			return Ok(());
		};
		unsafe { self.context.CopyResource(shadow, image) };
		Ok(())
	}

	fn release(&mut self, swapchain: xr::Swapchain) {
		self.swapchains.remove(&swapchain);
	}
}
