// SPDX-License-Identifier: MPL-2.0
//! OpenXR API layer that mirrors what an application submits to the headset
//! into a shared texture for the OBS capture source.
//!
//! The application's projection and quad layers are copied into shadow
//! textures as their swapchain images are released, composited on a private
//! D3D11 device at frame end and published through the shared surface block.
#![warn(
	clippy::correctness,
	clippy::suspicious,
	clippy::complexity,
	clippy::perf,
	clippy::style
)]
#![allow(clippy::missing_safety_doc, clippy::too_many_arguments)]
#[macro_use]
extern crate log;

pub mod compositor;
pub mod config;
#[cfg(windows)]
pub mod d3d11;
#[cfg(windows)]
pub mod d3d11_host;
#[cfg(windows)]
pub mod d3d12_host;
pub mod dispatch;
pub mod host;
pub mod layer;
pub mod loader;
pub mod logging;
pub mod math;
pub mod spaces;
pub mod surface;
