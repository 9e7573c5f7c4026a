// SPDX-License-Identifier: MPL-2.0
//! The compositor's private D3D11 device.
use crate::{
	compositor::{BlendConstants, CompositorDevice, QuadDraw, TransformConstants},
	math::{QuadVertex, QUAD_INDICES},
	surface::{HandleKind, PixelRect, SharedHandle, SurfaceDesc},
};
use anyhow::{anyhow, Context, Result};
use std::mem::size_of;
use windows::{
	core::{s, ComInterface, PCSTR},
	Win32::{
		Foundation::{HANDLE, HMODULE, RECT},
		Graphics::{
			Direct3D::{
				Fxc::{
					D3DCompile, D3DCOMPILE_ENABLE_STRICTNESS, D3DCOMPILE_OPTIMIZATION_LEVEL3,
					D3DCOMPILE_PACK_MATRIX_COLUMN_MAJOR,
				},
				ID3DBlob, D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_11_1,
				D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST, D3D_SRV_DIMENSION_TEXTURE2D,
			},
			Direct3D11::*,
			Dxgi::{
				Common::{
					DXGI_FORMAT, DXGI_FORMAT_R16_UINT, DXGI_FORMAT_R32G32B32A32_FLOAT,
					DXGI_FORMAT_R32G32_FLOAT, DXGI_SAMPLE_DESC,
				},
				IDXGIResource,
			},
		},
	},
};
use xrmirror_shared::DxgiFormat;

const SHADER: &str = r#"
cbuffer Transform : register(b0) {
	float4x4 world;
	float4x4 viewProjection;
};

cbuffer Blend : register(b1) {
	float blendStart;
	float blendEnd;
	uint blendMode;
	uint blendPad;
};

Texture2D source : register(t0);
SamplerState linearClamp : register(s0);

struct VertexIn {
	float4 position : POSITION;
	float2 uv : TEXCOORD0;
};

struct PixelIn {
	float4 position : SV_POSITION;
	float2 uv : TEXCOORD0;
	float ramp : TEXCOORD1;
};

PixelIn vs_main(VertexIn input) {
	PixelIn output;
	output.position = mul(viewProjection, mul(world, input.position));
	output.uv = input.uv;
	output.ramp = input.position.x + 0.5;
	return output;
}

float4 ps_main(PixelIn input) : SV_TARGET {
	float4 color = source.Sample(linearClamp, input.uv);
	if (blendMode == 1) {
		if (blendEnd - blendStart <= 1e-5) {
			color.a = input.ramp >= blendStart ? 1.0 : 0.0;
		} else {
			color.a = smoothstep(blendStart, blendEnd, input.ramp);
		}
	}
	return color;
}
"#;

fn dxgi(format: DxgiFormat) -> DXGI_FORMAT {
	DXGI_FORMAT(format.0 as _)
}

fn bytes(blob: &ID3DBlob) -> &[u8] {
	unsafe { std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()) }
}

unsafe fn compile(entry: PCSTR, target: PCSTR) -> Result<ID3DBlob> {
	let mut blob = None;
	let mut errors = None;
	let compiled = D3DCompile(
		SHADER.as_ptr() as *const _,
		SHADER.len(),
		None,
		None,
		None,
		entry,
		target,
		D3DCOMPILE_PACK_MATRIX_COLUMN_MAJOR | D3DCOMPILE_ENABLE_STRICTNESS | D3DCOMPILE_OPTIMIZATION_LEVEL3,
		0,
		&mut blob,
		Some(&mut errors),
	);
	if let Err(err) = compiled {
		let message = errors
			.as_ref()
			.map(|errors| String::from_utf8_lossy(bytes(errors)).into_owned())
			.unwrap_or_default();
		return Err(anyhow!("shader compilation failed: {} {}", err, message.trim()));
	}
	blob.context("compiler returned no bytecode")
}

unsafe fn dynamic_buffer(device: &ID3D11Device, size: usize, bind: D3D11_BIND_FLAG) -> Result<ID3D11Buffer> {
	let desc = D3D11_BUFFER_DESC {
		ByteWidth: size as u32,
		Usage: D3D11_USAGE_DYNAMIC,
		BindFlags: bind.0 as u32,
		CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
		MiscFlags: 0,
		StructureByteStride: 0,
	};
	let mut buffer = None;
	device.CreateBuffer(&desc, None, Some(&mut buffer))?;
	buffer.context("no buffer")
}

/// A shadow texture opened on the compositor's device.
#[derive(Debug)]
pub struct D3D11Source {
	texture: ID3D11Texture2D,
	view: ID3D11ShaderResourceView,
}

/// The composite and the copies handed to the capture source.
#[derive(Debug)]
pub struct D3D11Target {
	texture: ID3D11Texture2D,
	render_target: ID3D11RenderTargetView,
	mirrors: Vec<ID3D11Texture2D>,
}

pub struct D3D11Compositor {
	device: ID3D11Device,
	device1: Option<ID3D11Device1>,
	context: ID3D11DeviceContext,
	vertex_shader: ID3D11VertexShader,
	pixel_shader: ID3D11PixelShader,
	input_layout: ID3D11InputLayout,
	vertex_buffer: ID3D11Buffer,
	index_buffer: ID3D11Buffer,
	transform_buffer: ID3D11Buffer,
	blend_buffer: ID3D11Buffer,
	sampler: ID3D11SamplerState,
	blend_state: ID3D11BlendState,
	rasterizer: ID3D11RasterizerState,
}

impl D3D11Compositor {
	pub fn new() -> Result<Self> {
		unsafe { Self::create() }
	}

	unsafe fn create() -> Result<Self> {
		let feature_levels = [D3D_FEATURE_LEVEL_11_1, D3D_FEATURE_LEVEL_11_0];
		let mut device = None;
		let mut context = None;
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
		.context("failed to create the compositor device")?;
		let device: ID3D11Device = device.context("no device")?;
		let context = context.context("no device context")?;
		let device1 = device.cast::<ID3D11Device1>().ok();
		if device1.is_none() {
			warn!("ID3D11Device1 unavailable, D3D12 applications can't be mirrored");
		}

		let vs_blob = compile(s!("vs_main"), s!("vs_5_0")).context("vertex shader")?;
		let ps_blob = compile(s!("ps_main"), s!("ps_5_0")).context("pixel shader")?;
		let mut vertex_shader = None;
		device.CreateVertexShader(bytes(&vs_blob), None, Some(&mut vertex_shader))?;
		let mut pixel_shader = None;
		device.CreatePixelShader(bytes(&ps_blob), None, Some(&mut pixel_shader))?;

		let input_elements = [
			D3D11_INPUT_ELEMENT_DESC {
				SemanticName: s!("POSITION"),
				SemanticIndex: 0,
				Format: DXGI_FORMAT_R32G32B32A32_FLOAT,
				InputSlot: 0,
				AlignedByteOffset: 0,
				InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
				InstanceDataStepRate: 0,
			},
			D3D11_INPUT_ELEMENT_DESC {
				SemanticName: s!("TEXCOORD"),
				SemanticIndex: 0,
				Format: DXGI_FORMAT_R32G32_FLOAT,
				InputSlot: 0,
				AlignedByteOffset: 16,
				InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
				InstanceDataStepRate: 0,
			},
		];
		let mut input_layout = None;
		device.CreateInputLayout(&input_elements, bytes(&vs_blob), Some(&mut input_layout))?;

		let vertex_buffer = dynamic_buffer(&device, size_of::<[QuadVertex; 4]>(), D3D11_BIND_VERTEX_BUFFER)?;
		let transform_buffer =
			dynamic_buffer(&device, size_of::<TransformConstants>(), D3D11_BIND_CONSTANT_BUFFER)?;
		let blend_buffer = dynamic_buffer(&device, size_of::<BlendConstants>(), D3D11_BIND_CONSTANT_BUFFER)?;

		let index_desc = D3D11_BUFFER_DESC {
			ByteWidth: size_of::<[u16; 6]>() as u32,
			Usage: D3D11_USAGE_IMMUTABLE,
			BindFlags: D3D11_BIND_INDEX_BUFFER.0 as u32,
			CPUAccessFlags: 0,
			MiscFlags: 0,
			StructureByteStride: 0,
		};
		let index_data = D3D11_SUBRESOURCE_DATA {
			pSysMem: QUAD_INDICES.as_ptr() as *const _,
			SysMemPitch: 0,
			SysMemSlicePitch: 0,
		};
		let mut index_buffer = None;
		device.CreateBuffer(&index_desc, Some(&index_data), Some(&mut index_buffer))?;

		let sampler_desc = D3D11_SAMPLER_DESC {
			Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
			AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
			AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
			AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
			MipLODBias: 0.0,
			MaxAnisotropy: 1,
			ComparisonFunc: D3D11_COMPARISON_NEVER,
			BorderColor: [0.0; 4],
			MinLOD: 0.0,
			MaxLOD: f32::MAX,
		};
		let mut sampler = None;
		device.CreateSamplerState(&sampler_desc, Some(&mut sampler))?;

		let blend_desc = D3D11_BLEND_DESC {
			AlphaToCoverageEnable: false.into(),
			IndependentBlendEnable: false.into(),
			RenderTarget: [
				D3D11_RENDER_TARGET_BLEND_DESC {
					BlendEnable: true.into(),
					SrcBlend: D3D11_BLEND_SRC_ALPHA,
					DestBlend: D3D11_BLEND_INV_SRC_ALPHA,
					BlendOp: D3D11_BLEND_OP_ADD,
					SrcBlendAlpha: D3D11_BLEND_ONE,
					DestBlendAlpha: D3D11_BLEND_ZERO,
					BlendOpAlpha: D3D11_BLEND_OP_ADD,
					RenderTargetWriteMask: D3D11_COLOR_WRITE_ENABLE_ALL.0 as u8,
				},
				Default::default(),
				Default::default(),
				Default::default(),
				Default::default(),
				Default::default(),
				Default::default(),
				Default::default(),
			],
		};
		let mut blend_state = None;
		device.CreateBlendState(&blend_desc, Some(&mut blend_state))?;

		let rasterizer_desc = D3D11_RASTERIZER_DESC {
			FillMode: D3D11_FILL_SOLID,
			CullMode: D3D11_CULL_NONE,
			FrontCounterClockwise: false.into(),
			DepthBias: 0,
			DepthBiasClamp: 0.0,
			SlopeScaledDepthBias: 0.0,
			DepthClipEnable: true.into(),
			ScissorEnable: true.into(),
			MultisampleEnable: false.into(),
			AntialiasedLineEnable: false.into(),
		};
		let mut rasterizer = None;
		device.CreateRasterizerState(&rasterizer_desc, Some(&mut rasterizer))?;

		info!("compositor device ready");
		Ok(Self {
			device,
			device1,
			context,
			vertex_shader: vertex_shader.context("no vertex shader")?,
			pixel_shader: pixel_shader.context("no pixel shader")?,
			input_layout: input_layout.context("no input layout")?,
			vertex_buffer,
			index_buffer: index_buffer.context("no index buffer")?,
			transform_buffer,
			blend_buffer,
			sampler: sampler.context("no sampler")?,
			blend_state: blend_state.context("no blend state")?,
			rasterizer: rasterizer.context("no rasterizer state")?,
		})
	}

	/// Replaces the contents of a dynamic buffer.
	unsafe fn upload<T: Copy>(&self, buffer: &ID3D11Buffer, data: &[T]) -> Result<()> {
		let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
		self.context
			.Map(buffer, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped))?;
		scopeguard::defer! { unsafe { self.context.Unmap(buffer, 0); } };
		std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.pData as *mut T, data.len());
		Ok(())
	}

	unsafe fn texture(&self, desc: &D3D11_TEXTURE2D_DESC) -> Result<ID3D11Texture2D> {
		let mut texture = None;
		self.device.CreateTexture2D(desc, None, Some(&mut texture))?;
		texture.context("no texture")
	}

	unsafe fn open_shared(&self, handle: SharedHandle) -> Result<ID3D11Texture2D> {
		let raw = HANDLE(handle.value as isize);
		Ok(match handle.kind {
			HandleKind::Legacy => self.device.OpenSharedResource::<_, ID3D11Texture2D>(raw)?,
			HandleKind::Nt => self
				.device1
				.as_ref()
				.context("NT handles need ID3D11Device1")?
				.OpenSharedResource1::<_, ID3D11Texture2D>(raw)?,
		})
	}
}

impl CompositorDevice for D3D11Compositor {
	type Source = D3D11Source;
	type Target = D3D11Target;

	fn open_source(
		&mut self,
		handle: SharedHandle,
		view_format: DxgiFormat,
	) -> Result<(D3D11Source, SurfaceDesc)> {
		unsafe {
			let texture = self.open_shared(handle)?;
			let mut desc = D3D11_TEXTURE2D_DESC::default();
			texture.GetDesc(&mut desc);

			let view_desc = D3D11_SHADER_RESOURCE_VIEW_DESC {
				Format: dxgi(view_format),
				ViewDimension: D3D_SRV_DIMENSION_TEXTURE2D,
				Anonymous: D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
					Texture2D: D3D11_TEX2D_SRV {
						MostDetailedMip: 0,
						MipLevels: 1,
					},
				},
			};
			let mut view = None;
			self.device
				.CreateShaderResourceView(&texture, Some(&view_desc), Some(&mut view))?;
			let source = D3D11Source {
				texture,
				view: view.context("no shader resource view")?,
			};
			let desc = SurfaceDesc::new(desc.Width, desc.Height, DxgiFormat(desc.Format.0 as u32));
			Ok((source, desc))
		}
	}

	fn create_target(
		&mut self,
		desc: SurfaceDesc,
		render_format: DxgiFormat,
		copies: usize,
	) -> Result<(D3D11Target, Vec<u64>)> {
		unsafe {
			let mut texture_desc = D3D11_TEXTURE2D_DESC {
				Width: desc.width,
				Height: desc.height,
				MipLevels: 1,
				ArraySize: 1,
				Format: dxgi(desc.format),
				SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
				Usage: D3D11_USAGE_DEFAULT,
				BindFlags: (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
				CPUAccessFlags: 0,
				MiscFlags: 0,
			};
			let texture = self.texture(&texture_desc)?;

			let view_desc = D3D11_RENDER_TARGET_VIEW_DESC {
				Format: dxgi(render_format),
				ViewDimension: D3D11_RTV_DIMENSION_TEXTURE2D,
				Anonymous: D3D11_RENDER_TARGET_VIEW_DESC_0 {
					Texture2D: D3D11_TEX2D_RTV { MipSlice: 0 },
				},
			};
			let mut render_target = None;
			self.device
				.CreateRenderTargetView(&texture, Some(&view_desc), Some(&mut render_target))?;
			let render_target = render_target.context("no render target view")?;

			texture_desc.MiscFlags = D3D11_RESOURCE_MISC_SHARED.0 as u32;
			let mut mirrors = Vec::with_capacity(copies);
			let mut handles = Vec::with_capacity(copies);
			for _ in 0..copies {
				let mirror = self.texture(&texture_desc)?;
				let handle = mirror.cast::<IDXGIResource>()?.GetSharedHandle()?;
				handles.push(handle.0 as u64);
				mirrors.push(mirror);
			}

			self.context
				.ClearRenderTargetView(&render_target, &[0.0; 4]);
			Ok((
				D3D11Target {
					texture,
					render_target,
					mirrors,
				},
				handles,
			))
		}
	}

	fn copy_region(
		&mut self,
		target: &D3D11Target,
		source: &D3D11Source,
		rect: PixelRect,
		dest_x: u32,
	) -> Result<()> {
		let region = D3D11_BOX {
			left: rect.x,
			top: rect.y,
			front: 0,
			right: rect.right(),
			bottom: rect.bottom(),
			back: 1,
		};
		unsafe {
			self.context
				.CopySubresourceRegion(&target.texture, 0, dest_x, 0, 0, &source.texture, 0, Some(&region));
		}
		Ok(())
	}

	fn draw_quad(&mut self, target: &D3D11Target, source: &D3D11Source, draw: &QuadDraw) -> Result<()> {
		unsafe {
			self.upload(&self.vertex_buffer, &draw.vertices)?;
			self.upload(&self.transform_buffer, &[draw.transform])?;
			self.upload(&self.blend_buffer, &[draw.blend])?;

			let context = &self.context;
			context.OMSetRenderTargets(Some(&[Some(target.render_target.clone())]), None);
			context.OMSetBlendState(&self.blend_state, Some(&[0.0; 4]), 0xffffffff);
			let viewport = D3D11_VIEWPORT {
				TopLeftX: draw.viewport.x as f32,
				TopLeftY: draw.viewport.y as f32,
				Width: draw.viewport.width as f32,
				Height: draw.viewport.height as f32,
				MinDepth: 0.0,
				MaxDepth: 1.0,
			};
			context.RSSetViewports(Some(&[viewport]));
			context.RSSetScissorRects(Some(&[RECT {
				left: draw.viewport.x as i32,
				top: draw.viewport.y as i32,
				right: draw.viewport.right() as i32,
				bottom: draw.viewport.bottom() as i32,
			}]));
			context.RSSetState(&self.rasterizer);

			let stride = size_of::<QuadVertex>() as u32;
			let offset = 0u32;
			context.IASetInputLayout(&self.input_layout);
			context.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
			context.IASetVertexBuffers(
				0,
				1,
				Some(&Some(self.vertex_buffer.clone())),
				Some(&stride),
				Some(&offset),
			);
			context.IASetIndexBuffer(&self.index_buffer, DXGI_FORMAT_R16_UINT, 0);

			context.VSSetShader(&self.vertex_shader, None);
			context.VSSetConstantBuffers(0, Some(&[Some(self.transform_buffer.clone())]));
			context.PSSetShader(&self.pixel_shader, None);
			context.PSSetConstantBuffers(1, Some(&[Some(self.blend_buffer.clone())]));
			context.PSSetShaderResources(0, Some(&[Some(source.view.clone())]));
			context.PSSetSamplers(0, Some(&[Some(self.sampler.clone())]));

			context.DrawIndexed(QUAD_INDICES.len() as u32, 0, 0);
			context.PSSetShaderResources(0, Some(&[None]));
		}
		Ok(())
	}

	fn copy_to_mirror(&mut self, target: &D3D11Target) -> Result<()> {
		let mirror = target.mirrors.first().context("composite has no mirror copies")?;
		unsafe { self.context.CopyResource(mirror, &target.texture) };
		Ok(())
	}

	fn clear(&mut self, target: &D3D11Target) {
		unsafe {
			self.context
				.ClearRenderTargetView(&target.render_target, &[0.0; 4]);
		}
	}

	fn flush(&mut self) {
		unsafe { self.context.Flush() };
	}
}
