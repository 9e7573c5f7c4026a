// SPDX-License-Identifier: MPL-2.0
//! The consumer's side of the shared surface: finds the producer's segment,
//! opens the published mirror texture and keeps the heartbeat going.
use crate::crop::{CropPercent, CropRegion};
use anyhow::Result;
use std::time::{Duration, Instant};
use xrmirror_shared::{EyeSelection, FramePacer, FrameStep, SegmentError, SharedSegment, Tunables};

/// Minimum time between two unforced connection attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Minimum time between two settings-driven reinitialisations.
pub const REINIT_INTERVAL: Duration = Duration::from_secs(2);

/// GPU work done for the link: opening the producer's texture and cropping
/// it into something the host can draw.
pub trait SurfaceOpener {
	/// Opens the shared texture behind `handle` and returns its size.
	fn open(&mut self, handle: u64) -> Result<(u32, u32)>;
	/// Creates the crop target for `region` of the opened texture.
	fn prepare(&mut self, region: CropRegion) -> Result<()>;
	/// Copies `region` of the opened texture into the crop target.
	fn copy(&mut self, region: CropRegion) -> Result<()>;
	/// Drops everything opened or created so far.
	fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkSettings {
	pub crop: CropPercent,
	pub eye: EyeSelection,
	pub tunables: Tunables,
}

#[derive(Debug, Clone, Copy)]
struct OpenSurface {
	handle: u64,
	region: CropRegion,
}

pub struct MirrorLink<O: SurfaceOpener> {
	opener: O,
	segment_name: String,
	segment: Option<SharedSegment>,
	surface: Option<OpenSurface>,
	settings: LinkSettings,
	pacer: FramePacer,
	last_attempt: Option<Instant>,
	last_reinit: Option<Instant>,
	reinit_pending: bool,
}

fn elapsed_since(last: Option<Instant>, now: Instant) -> Option<Duration> {
	last.map(|last| now.saturating_duration_since(last))
}

impl<O: SurfaceOpener> MirrorLink<O> {
	pub fn new(opener: O, segment_name: impl Into<String>, settings: LinkSettings) -> Self {
		Self {
			opener,
			segment_name: segment_name.into(),
			segment: None,
			surface: None,
			settings,
			pacer: FramePacer::new(),
			last_attempt: None,
			last_reinit: None,
			reinit_pending: false,
		}
	}

	pub fn opener(&self) -> &O {
		&self.opener
	}

	pub fn settings(&self) -> &LinkSettings {
		&self.settings
	}

	pub fn is_connected(&self) -> bool {
		self.segment.is_some()
	}

	pub fn is_open(&self) -> bool {
		self.surface.is_some()
	}

	/// Size of the cropped output, zero until a texture is open.
	pub fn size(&self) -> (u32, u32) {
		self.surface
			.map(|surface| (surface.region.width, surface.region.height))
			.unwrap_or_default()
	}

	/// Stores new settings and pushes the eye and tunables to the producer.
	/// An open texture is re-cropped on a later frame.
	pub fn apply(&mut self, settings: LinkSettings) {
		let changed = settings != self.settings;
		self.settings = settings;
		self.publish_settings();
		if changed && self.surface.is_some() {
			self.reinit_pending = true;
		}
	}

	fn publish_settings(&self) {
		if let Some(segment) = &self.segment {
			let block = segment.block();
			block.set_eye_selection(self.settings.eye);
			block.set_tunables(self.settings.tunables);
		}
	}

	/// Tries to get to an open texture. Unless `force` is set, does nothing
	/// if the last attempt was less than [`RETRY_INTERVAL`] ago.
	pub fn connect(&mut self, force: bool, now: Instant) -> bool {
		if self.surface.is_some() {
			return true;
		}
		if !force && elapsed_since(self.last_attempt, now).is_some_and(|e| e < RETRY_INTERVAL) {
			return false;
		}
		self.last_attempt = Some(now);

		if self.segment.is_none() {
			match SharedSegment::open(&self.segment_name) {
				Ok(segment) => {
					info!("connected to {}", segment.name());
					self.segment = Some(segment);
					self.publish_settings();
				}
				Err(SegmentError::NotFound(_)) => return false,
				Err(err) => {
					warn!("{}", err);
					return false;
				}
			}
		}
		let Some(segment) = &self.segment else {
			return false;
		};
		let Some(handle) = segment.block().handles().primary() else {
			debug!("no consistent mirror handles published yet");
			return false;
		};

		match self.open_surface(handle) {
			Ok(surface) => {
				info!(
					"opened mirror {:#x}, showing {}x{} at {},{}",
					handle, surface.region.width, surface.region.height, surface.region.x, surface.region.y
				);
				self.surface = Some(surface);
				true
			}
			Err(err) => {
				warn!("failed to open mirror {:#x}: {:#}", handle, err);
				self.opener.close();
				false
			}
		}
	}

	fn open_surface(&mut self, handle: u64) -> Result<OpenSurface> {
		let (width, height) = self.opener.open(handle)?;
		let region = self
			.settings
			.crop
			.for_eye(self.settings.eye)
			.region(width, height);
		anyhow::ensure!(!region.is_empty(), "mirror texture is {}x{}", width, height);
		self.opener.prepare(region)?;
		Ok(OpenSurface { handle, region })
	}

	fn close_surface(&mut self) {
		if self.surface.take().is_some() {
			self.opener.close();
		}
	}

	/// Closes the texture and lets go of the segment.
	pub fn disconnect(&mut self) {
		self.close_surface();
		self.opener.close();
		if let Some(segment) = self.segment.take() {
			debug!("disconnected from {}", segment.name());
		}
		self.reinit_pending = false;
	}

	/// One host frame. Beats the consumer heartbeat, follows handle changes
	/// and, while `active`, copies the cropped region of the mirror.
	/// Returns how the frame lined up with the producer, or `None` if
	/// nothing was copied.
	pub fn render(&mut self, active: bool, now: Instant) -> Option<FrameStep> {
		if let Some(segment) = &self.segment {
			let block = segment.block();
			block.advance_consumer_heartbeat();
			if let Some(surface) = self.surface {
				let handles = block.handles();
				let replaced = handles.primary().is_some_and(|handle| handle != surface.handle);
				if replaced || handles.is_cleared() {
					info!("mirror {:#x} was replaced", surface.handle);
					self.close_surface();
				}
			}
		}

		if self.reinit_pending
			&& elapsed_since(self.last_reinit, now).map_or(true, |e| e >= REINIT_INTERVAL)
		{
			self.reinit_pending = false;
			self.last_reinit = Some(now);
			self.close_surface();
			self.connect(true, now);
		}

		if !active {
			return None;
		}
		if self.surface.is_none() && !self.connect(false, now) {
			return None;
		}
		let (segment, surface) = (self.segment.as_ref()?, self.surface?);
		let step = self.pacer.step(segment.block().producer_heartbeat());
		if let Err(err) = self.opener.copy(surface.region) {
			warn!("failed to copy mirror: {:#}", err);
			self.close_surface();
			return None;
		}
		Some(step)
	}
}

impl<O: SurfaceOpener> Drop for MirrorLink<O> {
	fn drop(&mut self) {
		self.disconnect();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use anyhow::bail;
	use std::sync::atomic::{AtomicU32, Ordering};

	#[derive(Default)]
	struct StubOpener {
		size: (u32, u32),
		fail_open: bool,
		opened: Vec<u64>,
		prepared: Vec<CropRegion>,
		copies: u32,
		closes: u32,
	}

	impl SurfaceOpener for StubOpener {
		fn open(&mut self, handle: u64) -> Result<(u32, u32)> {
			if self.fail_open {
				bail!("open failed");
			}
			self.opened.push(handle);
			Ok(self.size)
		}

		fn prepare(&mut self, region: CropRegion) -> Result<()> {
			self.prepared.push(region);
			Ok(())
		}

		fn copy(&mut self, _region: CropRegion) -> Result<()> {
			self.copies += 1;
			Ok(())
		}

		fn close(&mut self) {
			self.closes += 1;
		}
	}

	static NEXT_SEGMENT: AtomicU32 = AtomicU32::new(0);

	/// A segment name no other test uses.
	fn segment_name() -> String {
		format!(
			"xrmirror-link-test-{}-{}",
			std::process::id(),
			NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed)
		)
	}

	fn link(name: &str) -> MirrorLink<StubOpener> {
		let opener = StubOpener {
			size: (2000, 1000),
			..Default::default()
		};
		MirrorLink::new(opener, name, LinkSettings::default())
	}

	#[test]
	fn absent_producer_is_retried_once_per_second() {
		let name = segment_name();
		let mut link = link(&name);
		let start = Instant::now();
		assert!(!link.connect(false, start));
		assert!(!link.is_connected());

		let producer = SharedSegment::create(&name).unwrap();
		producer.block().publish_handles(&[1, 2, 3]);
		assert!(!link.connect(false, start + Duration::from_millis(500)));
		assert!(!link.is_connected());
		assert!(link.connect(false, start + Duration::from_millis(1000)));
		assert!(link.is_open());
	}

	#[test]
	fn forced_connect_skips_the_cooldown() {
		let name = segment_name();
		let mut link = link(&name);
		let start = Instant::now();
		assert!(!link.connect(false, start));
		let producer = SharedSegment::create(&name).unwrap();
		producer.block().publish_handles(&[1, 2, 3]);
		assert!(link.connect(true, start));
	}

	#[test]
	fn consumer_renders_while_producer_publishes() {
		let name = segment_name();
		let producer = SharedSegment::create(&name).unwrap();
		let block = producer.block();
		block.publish_handles(&[0x100, 0x200, 0x300]);

		let mut link = link(&name);
		link.apply(LinkSettings {
			eye: EyeSelection::Right,
			crop: CropPercent {
				left: 50.0,
				..Default::default()
			},
			tunables: Tunables {
				overlap_percent: 30.0,
				..Default::default()
			},
		});
		let now = Instant::now();
		assert!(link.connect(true, now));
		assert_eq!(block.eye_selection(), EyeSelection::Right);
		assert_eq!(block.tunables().overlap_percent, 30.0);
		assert_eq!(link.opener().opened, [0x100]);
		assert_eq!(link.size(), (1000, 1000));

		for frame in 0..5 {
			block.advance_producer_heartbeat();
			assert!(link.render(true, now).is_some());
			assert_eq!(block.consumer_heartbeat(), frame + 1);
		}
		assert_eq!(link.opener().copies, 5);
	}

	#[test]
	fn inactive_source_still_beats_the_heartbeat() {
		let name = segment_name();
		let producer = SharedSegment::create(&name).unwrap();
		producer.block().publish_handles(&[1, 2, 3]);
		let mut link = link(&name);
		let now = Instant::now();
		assert!(link.connect(true, now));
		assert_eq!(link.render(false, now), None);
		assert_eq!(link.render(false, now), None);
		assert_eq!(producer.block().consumer_heartbeat(), 2);
		assert_eq!(link.opener().copies, 0);
	}

	#[test]
	fn reopens_when_the_handle_changes() {
		let name = segment_name();
		let producer = SharedSegment::create(&name).unwrap();
		let block = producer.block();
		block.publish_handles(&[1, 2, 3]);
		let mut link = link(&name);
		let now = Instant::now();
		assert!(link.connect(true, now));

		block.publish_handles(&[4, 5, 6]);
		// the cooldown from the first connect still applies
		assert_eq!(link.render(true, now), None);
		assert!(!link.is_open());
		assert!(link.render(true, now + RETRY_INTERVAL).is_some());
		assert_eq!(link.opener().opened, [1, 4]);
	}

	#[test]
	fn torn_handle_reads_are_ignored() {
		let name = segment_name();
		let producer = SharedSegment::create(&name).unwrap();
		let block = producer.block();
		block.publish_handles(&[1, 2, 3]);
		let mut link = link(&name);
		let now = Instant::now();
		assert!(link.connect(true, now));

		block.publish_handles(&[7, 0, 3]);
		assert!(link.render(true, now).is_some());
		block.publish_handles(&[7, 7, 8]);
		assert!(link.render(true, now).is_some());
		assert_eq!(link.opener().opened, [1]);

		block.reset_handles();
		assert_eq!(link.render(true, now), None);
		assert!(!link.is_open());
	}

	#[test]
	fn torn_handles_block_the_first_open() {
		let name = segment_name();
		let producer = SharedSegment::create(&name).unwrap();
		producer.block().publish_handles(&[1, 1, 0]);
		let mut link = link(&name);
		assert!(!link.connect(true, Instant::now()));
		assert!(link.is_connected());
		assert!(link.opener().opened.is_empty());
	}

	#[test]
	fn failed_open_releases_partial_state() {
		let name = segment_name();
		let producer = SharedSegment::create(&name).unwrap();
		producer.block().publish_handles(&[1, 2, 3]);
		let mut link = link(&name);
		link.opener.fail_open = true;
		assert!(!link.connect(true, Instant::now()));
		assert_eq!(link.opener().closes, 1);
		assert_eq!(link.size(), (0, 0));
	}

	#[test]
	fn settings_changes_recrop_at_most_every_two_seconds() {
		let name = segment_name();
		let producer = SharedSegment::create(&name).unwrap();
		producer.block().publish_handles(&[1, 2, 3]);
		let mut link = link(&name);
		let start = Instant::now();
		assert!(link.connect(true, start));

		let mut settings = *link.settings();
		settings.eye = EyeSelection::Right;
		settings.crop.top = 50.0;
		link.apply(settings);
		assert_eq!(producer.block().eye_selection(), EyeSelection::Right);
		assert!(link.render(true, start).is_some());
		assert_eq!(link.size(), (2000, 500));

		settings.crop.top = 0.0;
		link.apply(settings);
		assert!(link.render(true, start + Duration::from_secs(1)).is_some());
		assert_eq!(link.size(), (2000, 500));
		assert!(link.render(true, start + REINIT_INTERVAL).is_some());
		assert_eq!(link.size(), (2000, 1000));
		assert_eq!(link.opener().prepared.len(), 3);
	}

	#[test]
	fn left_eye_crop_is_mirrored() {
		let name = segment_name();
		let producer = SharedSegment::create(&name).unwrap();
		producer.block().publish_handles(&[1, 2, 3]);
		let mut link = link(&name);
		link.apply(LinkSettings {
			eye: EyeSelection::Left,
			crop: CropPercent {
				left: 10.0,
				..Default::default()
			},
			..Default::default()
		});
		assert!(link.connect(true, Instant::now()));
		let region = link.opener().prepared[0];
		assert_eq!(region.x, 0);
		assert_eq!(region.width, 1800);
	}

	#[test]
	fn pacer_follows_the_producer() {
		let name = segment_name();
		let producer = SharedSegment::create(&name).unwrap();
		let block = producer.block();
		block.publish_handles(&[1, 2, 3]);
		let mut link = link(&name);
		let now = Instant::now();
		assert!(link.connect(true, now));
		for _ in 0..10 {
			block.advance_producer_heartbeat();
		}
		assert_eq!(link.render(true, now), Some(FrameStep::Resynced));
		block.advance_producer_heartbeat();
		assert_eq!(link.render(true, now), Some(FrameStep::InStep));
	}

	#[test]
	fn disconnect_releases_everything() {
		let name = segment_name();
		let producer = SharedSegment::create(&name).unwrap();
		producer.block().publish_handles(&[1, 2, 3]);
		let mut link = link(&name);
		assert!(link.connect(true, Instant::now()));
		link.disconnect();
		assert!(!link.is_connected());
		assert!(!link.is_open());
		assert_eq!(link.size(), (0, 0));
	}
}
