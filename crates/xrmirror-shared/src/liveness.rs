// SPDX-License-Identifier: MPL-2.0

/// Watches a counter the other process bumps once per frame and decides
/// whether that process is still there.
///
/// Starts out stale, so nothing is considered alive until the counter has
/// been seen moving at least once.
#[derive(Debug, Clone)]
pub struct Heartbeat {
	last_seen: u32,
	stale_frames: u32,
	stale_limit: u32,
}

impl Heartbeat {
	pub const DEFAULT_STALE_LIMIT: u32 = 10;

	pub fn new(stale_limit: u32) -> Self {
		Self {
			last_seen: 0,
			stale_frames: stale_limit.saturating_add(1),
			stale_limit,
		}
	}

	/// Feeds this frame's counter value; returns [`Heartbeat::alive`].
	pub fn observe(&mut self, counter: u32) -> bool {
		if counter == self.last_seen {
			self.stale_frames = self.stale_frames.saturating_add(1);
		} else {
			self.stale_frames = 0;
		}
		self.last_seen = counter;
		self.alive()
	}

	pub fn alive(&self) -> bool {
		self.stale_frames <= self.stale_limit
	}

	pub fn stale_frames(&self) -> u32 {
		self.stale_frames
	}
}

impl Default for Heartbeat {
	fn default() -> Self {
		Self::new(Self::DEFAULT_STALE_LIMIT)
	}
}
