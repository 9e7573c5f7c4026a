// SPDX-License-Identifier: MPL-2.0
//! Everything both halves of the mirror agree on: the pixel format table,
//! the layout of the shared surface block, the named segment that carries
//! it, and the heartbeat bookkeeping each side runs against the other.
#![warn(
	clippy::correctness,
	clippy::suspicious,
	clippy::complexity,
	clippy::perf,
	clippy::style
)]
#[macro_use]
extern crate log;

pub mod block;
pub mod format;
pub mod liveness;
pub mod pacing;
pub mod shm;

pub use block::{EyeSelection, HandleSet, SharedSurfaceBlock, Tunables, MIRROR_COPIES};
pub use format::{DxgiFormat, FormatInfo};
pub use liveness::Heartbeat;
pub use pacing::{FramePacer, FrameStep};
pub use shm::{SegmentError, SharedSegment, SEGMENT_NAME};
