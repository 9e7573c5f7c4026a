// SPDX-License-Identifier: MPL-2.0
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{path::Path, str::FromStr};
use xrmirror_shared::{Heartbeat, MIRROR_COPIES, SEGMENT_NAME};

/// Layer settings. Built from defaults, then an optional `settings.json`
/// next to the layer manifest, then `XRMIRROR_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
	pub segment_name: String,
	/// Swapchains with more bits per channel than this are not mirrored.
	pub max_bits_per_channel: u32,
	pub stale_frame_limit: u32,
	pub fence_timeout_ms: u32,
	pub mirror_copies: usize,
	pub near_z: f32,
	pub far_z: f32,
}

impl Default for LayerConfig {
	fn default() -> Self {
		Self {
			segment_name: SEGMENT_NAME.to_owned(),
			max_bits_per_channel: 10,
			stale_frame_limit: Heartbeat::DEFAULT_STALE_LIMIT,
			fence_timeout_ms: 1000,
			mirror_copies: MIRROR_COPIES,
			near_z: 0.05,
			far_z: 100.0,
		}
	}
}

impl LayerConfig {
	pub fn load(settings: Option<&Path>) -> Self {
		let mut config = match settings.filter(|path| path.is_file()) {
			Some(path) => Self::from_file(path).unwrap_or_else(|err| {
				warn!("ignoring layer settings: {:#}", err);
				Self::default()
			}),
			None => Self::default(),
		};
		config.apply_overrides(|key| std::env::var(key).ok());
		config.sanitized()
	}

	fn from_file(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path)
			.with_context(|| format!("failed to read {}", path.display()))?;
		serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
	}

	fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
		fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
			let value = lookup(key)?;
			match value.trim().parse() {
				Ok(parsed) => Some(parsed),
				Err(_) => {
					warn!("ignoring {}={:?}", key, value);
					None
				}
			}
		}

		if let Some(name) = lookup("XRMIRROR_SEGMENT").filter(|name| !name.is_empty()) {
			self.segment_name = name;
		}
		if let Some(bpc) = parsed(&lookup, "XRMIRROR_MAX_BPC") {
			self.max_bits_per_channel = bpc;
		}
		if let Some(limit) = parsed(&lookup, "XRMIRROR_STALE_FRAMES") {
			self.stale_frame_limit = limit;
		}
		if let Some(timeout) = parsed(&lookup, "XRMIRROR_FENCE_TIMEOUT_MS") {
			self.fence_timeout_ms = timeout;
		}
	}

	fn sanitized(mut self) -> Self {
		self.mirror_copies = self.mirror_copies.clamp(1, MIRROR_COPIES);
		let defaults = Self::default();
		if !(self.near_z.is_finite() && self.far_z.is_finite() && 0.0 < self.near_z && self.near_z < self.far_z)
		{
			warn!(
				"invalid clip planes {}..{}, using defaults",
				self.near_z, self.far_z
			);
			self.near_z = defaults.near_z;
			self.far_z = defaults.far_z;
		}
		if self.segment_name.is_empty() {
			self.segment_name = defaults.segment_name;
		}
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ahash::AHashMap;

	#[test]
	fn defaults_match_the_consumer() {
		let config = LayerConfig::default();
		assert_eq!(config.segment_name, SEGMENT_NAME);
		assert_eq!(config.max_bits_per_channel, 10);
		assert_eq!(config.stale_frame_limit, 10);
		assert_eq!(config.fence_timeout_ms, 1000);
		assert_eq!(config.mirror_copies, 3);
	}

	#[test]
	fn partial_settings_keep_defaults() {
		let config: LayerConfig =
			serde_json::from_str(r#"{ "fence_timeout_ms": 250, "mirror_copies": 9 }"#).expect("parse");
		let config = config.sanitized();
		assert_eq!(config.fence_timeout_ms, 250);
		assert_eq!(config.mirror_copies, 3);
		assert_eq!(config.max_bits_per_channel, 10);
	}

	#[test]
	fn environment_overrides_settings() {
		let env: AHashMap<&str, &str> = [
			("XRMIRROR_MAX_BPC", "16"),
			("XRMIRROR_STALE_FRAMES", "not a number"),
			("XRMIRROR_SEGMENT", "OtherSurface"),
		]
		.into_iter()
		.collect();
		let mut config = LayerConfig::default();
		config.apply_overrides(|key| env.get(key).map(|value| value.to_string()));
		assert_eq!(config.max_bits_per_channel, 16);
		assert_eq!(config.stale_frame_limit, 10);
		assert_eq!(config.segment_name, "OtherSurface");
	}

	#[test]
	fn broken_clip_planes_fall_back() {
		let config = LayerConfig {
			near_z: 5.0,
			far_z: 1.0,
			..LayerConfig::default()
		}
		.sanitized();
		assert_eq!((config.near_z, config.far_z), (0.05, 100.0));
	}
}
