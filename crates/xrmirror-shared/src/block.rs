// SPDX-License-Identifier: MPL-2.0
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

/// Number of shareable copies of the composited output.
pub const MIRROR_COPIES: usize = 3;

/// Which view(s) the consumer wants composited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EyeSelection {
	#[default]
	Left,
	Right,
	/// Both eyes side by side with a blended seam.
	Wide,
}

impl EyeSelection {
	pub fn from_index(index: i32) -> Self {
		match index {
			1 => Self::Right,
			2 => Self::Wide,
			_ => Self::Left,
		}
	}

	pub fn index(self) -> i32 {
		match self {
			Self::Left => 0,
			Self::Right => 1,
			Self::Wide => 2,
		}
	}
}

/// Compositing knobs for the wide composite, in percent (0..=100).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tunables {
	pub overlap_percent: f32,
	pub blend_width_percent: f32,
	pub blend_center_percent: f32,
}

impl Default for Tunables {
	fn default() -> Self {
		Self {
			overlap_percent: 20.0,
			blend_width_percent: 50.0,
			blend_center_percent: 50.0,
		}
	}
}

impl Tunables {
	pub fn clamped(self) -> Self {
		Self {
			overlap_percent: clamp_percent(self.overlap_percent),
			blend_width_percent: clamp_percent(self.blend_width_percent),
			blend_center_percent: clamp_percent(self.blend_center_percent),
		}
	}
}

fn clamp_percent(value: f32) -> f32 {
	if value.is_nan() {
		0.0
	} else {
		value.clamp(0.0, 100.0)
	}
}

/// A snapshot of the published handle array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleSet(pub [u64; MIRROR_COPIES]);

impl HandleSet {
	/// The array can be read while the producer is rewriting it; a read is
	/// only usable when every slot is set and no two slots agree.
	pub fn is_consistent(&self) -> bool {
		let handles = &self.0;
		handles.iter().all(|&h| h != 0)
			&& handles
				.iter()
				.enumerate()
				.all(|(i, h)| !handles[i + 1..].contains(h))
	}

	pub fn primary(&self) -> Option<u64> {
		self.is_consistent().then_some(self.0[0])
	}

	/// Every slot is zero: the producer has torn its mirrors down.
	pub fn is_cleared(&self) -> bool {
		self.0.iter().all(|&h| h == 0)
	}
}

/// The cross-process contract. Lives in a named shared memory segment, so
/// the layout is fixed and every field is accessed atomically; neither
/// side ever blocks on the other.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SharedSurfaceBlock {
	last_processed_frame_index: AtomicU32,
	frame_number: AtomicU32,
	eye_index: AtomicI32,
	overlap_percent: AtomicU32,
	blend_width_percent: AtomicU32,
	blend_center_percent: AtomicU32,
	shared_handles: [AtomicU64; MIRROR_COPIES],
}

const _: () = assert!(std::mem::size_of::<SharedSurfaceBlock>() == 48);

impl SharedSurfaceBlock {
	/// Frames the producer has finished compositing.
	pub fn producer_heartbeat(&self) -> u32 {
		self.last_processed_frame_index.load(Ordering::Acquire)
	}

	pub fn advance_producer_heartbeat(&self) -> u32 {
		self.last_processed_frame_index
			.fetch_add(1, Ordering::AcqRel)
			.wrapping_add(1)
	}

	/// Frames the consumer has rendered.
	pub fn consumer_heartbeat(&self) -> u32 {
		self.frame_number.load(Ordering::Acquire)
	}

	pub fn advance_consumer_heartbeat(&self) -> u32 {
		self.frame_number.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
	}

	pub fn eye_selection(&self) -> EyeSelection {
		EyeSelection::from_index(self.eye_index.load(Ordering::Relaxed))
	}

	pub fn set_eye_selection(&self, eye: EyeSelection) {
		self.eye_index.store(eye.index(), Ordering::Relaxed);
	}

	pub fn tunables(&self) -> Tunables {
		Tunables {
			overlap_percent: f32::from_bits(self.overlap_percent.load(Ordering::Relaxed)),
			blend_width_percent: f32::from_bits(self.blend_width_percent.load(Ordering::Relaxed)),
			blend_center_percent: f32::from_bits(self.blend_center_percent.load(Ordering::Relaxed)),
		}
		.clamped()
	}

	pub fn set_tunables(&self, tunables: Tunables) {
		let tunables = tunables.clamped();
		self.overlap_percent
			.store(tunables.overlap_percent.to_bits(), Ordering::Relaxed);
		self.blend_width_percent
			.store(tunables.blend_width_percent.to_bits(), Ordering::Relaxed);
		self.blend_center_percent
			.store(tunables.blend_center_percent.to_bits(), Ordering::Relaxed);
	}

	pub fn handles(&self) -> HandleSet {
		let mut out = [0; MIRROR_COPIES];
		for (slot, handle) in out.iter_mut().zip(&self.shared_handles) {
			*slot = handle.load(Ordering::Acquire);
		}
		HandleSet(out)
	}

	/// Overwrites every slot. Slots past the end of `handles` are zeroed.
	pub fn publish_handles(&self, handles: &[u64]) {
		for (i, slot) in self.shared_handles.iter().enumerate() {
			slot.store(handles.get(i).copied().unwrap_or(0), Ordering::Release);
		}
	}

	pub fn reset_handles(&self) {
		self.publish_handles(&[]);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn eye_index_mapping() {
		assert_eq!(EyeSelection::from_index(0), EyeSelection::Left);
		assert_eq!(EyeSelection::from_index(1), EyeSelection::Right);
		assert_eq!(EyeSelection::from_index(2), EyeSelection::Wide);
		assert_eq!(EyeSelection::from_index(-1), EyeSelection::Left);
		assert_eq!(EyeSelection::from_index(7), EyeSelection::Left);
		for eye in [EyeSelection::Left, EyeSelection::Right, EyeSelection::Wide] {
			assert_eq!(EyeSelection::from_index(eye.index()), eye);
		}
	}

	#[test]
	fn tunables_are_clamped_on_both_sides() {
		let block = SharedSurfaceBlock::default();
		block.set_tunables(Tunables {
			overlap_percent: 150.0,
			blend_width_percent: -3.0,
			blend_center_percent: f32::NAN,
		});
		let read = block.tunables();
		assert_eq!(read.overlap_percent, 100.0);
		assert_eq!(read.blend_width_percent, 0.0);
		assert_eq!(read.blend_center_percent, 0.0);
	}

	#[test]
	fn torn_handle_reads_are_rejected() {
		assert!(HandleSet([1, 2, 3]).is_consistent());
		assert!(!HandleSet([1, 0, 3]).is_consistent());
		assert!(!HandleSet([1, 2, 1]).is_consistent());
		assert!(!HandleSet::default().is_consistent());
		assert_eq!(HandleSet([5, 6, 7]).primary(), Some(5));
		assert_eq!(HandleSet([5, 5, 7]).primary(), None);
		assert!(HandleSet::default().is_cleared());
		assert!(!HandleSet([0, 0, 9]).is_cleared());
	}

	#[test]
	fn publish_and_reset_handles() {
		let block = SharedSurfaceBlock::default();
		block.publish_handles(&[0x10, 0x20, 0x30]);
		assert_eq!(block.handles(), HandleSet([0x10, 0x20, 0x30]));
		block.publish_handles(&[0x40]);
		assert_eq!(block.handles(), HandleSet([0x40, 0, 0]));
		block.reset_handles();
		assert_eq!(block.handles(), HandleSet::default());
	}

	#[test]
	fn heartbeats_are_independent_and_wrap() {
		let block = SharedSurfaceBlock::default();
		assert_eq!(block.advance_consumer_heartbeat(), 1);
		assert_eq!(block.producer_heartbeat(), 0);
		block
			.last_processed_frame_index
			.store(u32::MAX, Ordering::Relaxed);
		assert_eq!(block.advance_producer_heartbeat(), 0);
		assert_eq!(block.consumer_heartbeat(), 1);
	}
}
