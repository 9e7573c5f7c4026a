// SPDX-License-Identifier: MPL-2.0
//! Reads the layer's mirror texture on a private D3D11 device and hands a
//! cropped, linear copy of it to OBS.
#![allow(non_camel_case_types)]
use crate::{crop::CropRegion, link::SurfaceOpener};
use anyhow::{Context, Result};
use std::os::raw::{c_char, c_int, c_void};
use windows::{
	core::ComInterface,
	Win32::{
		Foundation::{HANDLE, HMODULE},
		Graphics::{
			Direct3D::{D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_11_1},
			Direct3D11::{
				D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D, D3D11_BIND_SHADER_RESOURCE,
				D3D11_BOX, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_RESOURCE_MISC_SHARED, D3D11_SDK_VERSION,
				D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT,
			},
			Dxgi::{
				Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC},
				IDXGIResource,
			},
		},
	},
};
use xrmirror_shared::{format::linear_format, DxgiFormat};

type gs_texture_t = c_void;
type gs_effect_t = c_void;

/// `OBS_EFFECT_OPAQUE` in `enum obs_base_effect`.
const OBS_EFFECT_OPAQUE: c_int = 2;

#[link(name = "obs")]
extern "C" {
	fn obs_enter_graphics();
	fn obs_leave_graphics();
	fn gs_texture_open_shared(handle: u32) -> *mut gs_texture_t;
	fn gs_texture_destroy(texture: *mut gs_texture_t);
	fn obs_get_base_effect(effect: c_int) -> *mut gs_effect_t;
	fn gs_effect_loop(effect: *mut gs_effect_t, technique: *const c_char) -> bool;
	fn obs_source_draw(texture: *mut gs_texture_t, x: c_int, y: c_int, cx: u32, cy: u32, flip: bool);
}

/// The crop texture, both as our device sees it and as OBS opened it.
struct CropTarget {
	texture: ID3D11Texture2D,
	shared: *mut gs_texture_t,
}

impl Drop for CropTarget {
	fn drop(&mut self) {
		if !self.shared.is_null() {
			unsafe {
				obs_enter_graphics();
				gs_texture_destroy(self.shared);
				obs_leave_graphics();
			}
		}
	}
}

pub struct MirrorCapture {
	device: ID3D11Device,
	context: ID3D11DeviceContext,
	mirror: Option<(ID3D11Texture2D, D3D11_TEXTURE2D_DESC)>,
	crop: Option<CropTarget>,
}

impl MirrorCapture {
	pub fn new() -> Result<Self> {
		let feature_levels = [D3D_FEATURE_LEVEL_11_1, D3D_FEATURE_LEVEL_11_0];
		let mut device = None;
		let mut context = None;
		unsafe {
			D3D11CreateDevice(
				None,
				D3D_DRIVER_TYPE_HARDWARE,
				HMODULE::default(),
				D3D11_CREATE_DEVICE_BGRA_SUPPORT,
				Some(&feature_levels),
				D3D11_SDK_VERSION,
				Some(&mut device),
				None,
				Some(&mut context),
			)
		}
		.context("failed to create the capture device")?;
		Ok(Self {
			device: device.context("no device")?,
			context: context.context("no device context")?,
			mirror: None,
			crop: None,
		})
	}

	/// Draws the cropped mirror at the source's origin. Must be called from
	/// the source's render callback.
	pub fn draw(&self) {
		let Some(crop) = self.crop.as_ref().filter(|crop| !crop.shared.is_null()) else {
			return;
		};
		unsafe {
			let effect = obs_get_base_effect(OBS_EFFECT_OPAQUE);
			while gs_effect_loop(effect, c"Draw".as_ptr()) {
				obs_source_draw(crop.shared, 0, 0, 0, 0, false);
			}
		}
	}
}

impl SurfaceOpener for MirrorCapture {
	fn open(&mut self, handle: u64) -> Result<(u32, u32)> {
		self.close();
		let texture: ID3D11Texture2D = unsafe { self.device.OpenSharedResource(HANDLE(handle as isize)) }
			.context("failed to open the mirror texture")?;
		let mut desc = D3D11_TEXTURE2D_DESC::default();
		unsafe { texture.GetDesc(&mut desc) };
		let size = (desc.Width, desc.Height);
		self.mirror = Some((texture, desc));
		Ok(size)
	}

	fn prepare(&mut self, region: CropRegion) -> Result<()> {
		self.crop = None;
		let (_, mirror_desc) = self.mirror.as_ref().context("no mirror texture open")?;
		// sampling a linear copy lets OBS apply the sRGB curve itself
		let format = linear_format(DxgiFormat(mirror_desc.Format.0 as u32));
		info!("crop texture: {} {}x{}", format, region.width, region.height);
		let desc = D3D11_TEXTURE2D_DESC {
			Width: region.width,
			Height: region.height,
			MipLevels: 1,
			ArraySize: 1,
			Format: DXGI_FORMAT(format.0 as _),
			SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
			Usage: D3D11_USAGE_DEFAULT,
			BindFlags: D3D11_BIND_SHADER_RESOURCE.0 as u32,
			CPUAccessFlags: 0,
			MiscFlags: D3D11_RESOURCE_MISC_SHARED.0 as u32,
		};
		unsafe {
			let mut texture = None;
			self.device
				.CreateTexture2D(&desc, None, Some(&mut texture))
				.context("failed to create the crop texture")?;
			let texture: ID3D11Texture2D = texture.context("no crop texture")?;
			let handle = texture.cast::<IDXGIResource>()?.GetSharedHandle()?;
			obs_enter_graphics();
			scopeguard::defer! { unsafe { obs_leave_graphics(); } };
			// legacy shared handles always fit in 32 bits
			let shared = gs_texture_open_shared(handle.0 as u32);
			let crop = CropTarget { texture, shared };
			anyhow::ensure!(!crop.shared.is_null(), "OBS could not open the crop texture");
			self.crop = Some(crop);
		}
		Ok(())
	}

	fn copy(&mut self, region: CropRegion) -> Result<()> {
		let (Some((mirror, _)), Some(crop)) = (&self.mirror, &self.crop) else {
			anyhow::bail!("nothing to copy");
		};
		let source_box = D3D11_BOX {
			left: region.x,
			top: region.y,
			front: 0,
			right: region.right(),
			bottom: region.bottom(),
			back: 1,
		};
		unsafe {
			self.context
				.CopySubresourceRegion(&crop.texture, 0, 0, 0, 0, mirror, 0, Some(&source_box));
			self.context.Flush();
		}
		Ok(())
	}

	fn close(&mut self) {
		self.crop = None;
		self.mirror = None;
	}
}
