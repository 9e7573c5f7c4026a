// SPDX-License-Identifier: MPL-2.0
//! OBS capture source for the OpenXR mirror layer.
#![warn(
	clippy::correctness,
	clippy::suspicious,
	clippy::complexity,
	clippy::perf,
	clippy::style
)]
#[cfg(windows)]
#[macro_use]
extern crate obs_wrapper;
#[macro_use]
extern crate log;

#[cfg(windows)]
pub mod capture;
pub mod crop;
pub mod link;
#[cfg(windows)]
pub mod module;
#[cfg(windows)]
pub mod source;
