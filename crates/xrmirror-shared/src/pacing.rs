// SPDX-License-Identifier: MPL-2.0

/// What the pacer did to catch up with the producer this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStep {
	InStep,
	/// One producer frame was dropped to catch up.
	Skipped,
	/// The cursor was too far behind (or ahead, after a producer restart)
	/// and jumped straight to the latest frame.
	Resynced,
}

/// Keeps the consumer's own frame cursor within a frame or two of the
/// producer's published frame index.
#[derive(Debug, Clone, Default)]
pub struct FramePacer {
	current: u32,
}

impl FramePacer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn current(&self) -> u32 {
		self.current
	}

	/// Advances the cursor for one rendered frame given the producer's
	/// latest frame index.
	pub fn step(&mut self, latest: u32) -> FrameStep {
		let behind = latest.wrapping_sub(self.current);
		let step = if behind > 2 {
			// also covers "ahead", which wraps to a huge distance
			self.current = latest;
			FrameStep::Resynced
		} else if behind > 1 {
			self.current = self.current.wrapping_add(1);
			FrameStep::Skipped
		} else {
			FrameStep::InStep
		};
		self.current = self.current.wrapping_add(1);
		step
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn keeps_pace_with_a_steady_producer() {
		let mut pacer = FramePacer::new();
		for latest in 0..10 {
			assert_eq!(pacer.step(latest), FrameStep::InStep);
			assert_eq!(pacer.current(), latest + 1);
		}
	}

	#[test]
	fn skips_when_two_behind() {
		let mut pacer = FramePacer::new();
		assert_eq!(pacer.step(2), FrameStep::Skipped);
		assert_eq!(pacer.current(), 2);
	}

	#[test]
	fn resyncs_when_far_behind_or_ahead() {
		let mut pacer = FramePacer::new();
		assert_eq!(pacer.step(100), FrameStep::Resynced);
		assert_eq!(pacer.current(), 101);
		// producer restarted and its counter went back to zero
		assert_eq!(pacer.step(3), FrameStep::Resynced);
		assert_eq!(pacer.current(), 4);
	}
}
