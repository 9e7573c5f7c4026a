// SPDX-License-Identifier: MPL-2.0
//! Crop percentages, the pixel region they select, and the presets file.
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use xrmirror_shared::EyeSelection;

/// Default name of the presets file.
pub const PRESETS_FILE: &str = "win_openxrmirror-presets.ini";

/// Presets loaded at module load, in file order.
pub static PRESETS: Lazy<RwLock<Vec<Preset>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Percentage cut off each edge of the mirror texture, 0 to 100.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CropPercent {
	pub top: f64,
	pub bottom: f64,
	pub left: f64,
	pub right: f64,
}

impl CropPercent {
	pub fn clamped(self) -> Self {
		let clamp = |value: f64| {
			if value.is_nan() {
				0.0
			} else {
				value.clamp(0.0, 100.0)
			}
		};
		Self {
			top: clamp(self.top),
			bottom: clamp(self.bottom),
			left: clamp(self.left),
			right: clamp(self.right),
		}
	}

	/// The crop as applied to the texture for `eye`.
	///
	/// Sliders describe the right eye; the left eye is its mirror image, so
	/// the horizontal values swap. The wide composite is never cropped
	/// horizontally.
	pub fn for_eye(self, eye: EyeSelection) -> Self {
		match eye {
			EyeSelection::Right => self,
			EyeSelection::Left => Self {
				left: self.right,
				right: self.left,
				..self
			},
			EyeSelection::Wide => Self {
				left: 0.0,
				right: 0.0,
				..self
			},
		}
	}

	/// Pixel region of a `width` x `height` texture left after cropping.
	/// Always at least one pixel in each direction for a non-empty texture.
	pub fn region(&self, width: u32, height: u32) -> CropRegion {
		if width == 0 || height == 0 {
			return CropRegion::default();
		}
		let crop = self.clamped();
		let cut = |percent: f64, extent: u32| -> u32 {
			((percent / 100.0 * f64::from(extent)) as u32).min(extent - 1)
		};
		let x = cut(crop.left, width);
		let y = cut(crop.top, height);
		let remaining_width = width - x;
		let remaining_height = height - y;
		CropRegion {
			x,
			y,
			width: remaining_width - cut(crop.right, remaining_width),
			height: remaining_height - cut(crop.bottom, remaining_height),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRegion {
	pub x: u32,
	pub y: u32,
	pub width: u32,
	pub height: u32,
}

impl CropRegion {
	pub fn is_empty(&self) -> bool {
		self.width == 0 || self.height == 0
	}

	pub fn right(&self) -> u32 {
		self.x + self.width
	}

	pub fn bottom(&self) -> u32 {
		self.y + self.height
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
	pub label: String,
	pub crop: CropPercent,
}

/// Parses `top,bottom,left,right,label` lines. Blank lines and lines
/// starting with `#` or `;` are skipped; malformed lines are logged and
/// skipped. The label runs to the end of the line and may contain commas.
pub fn parse_presets(text: &str) -> Vec<Preset> {
	text.lines()
		.enumerate()
		.filter_map(|(number, line)| {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
				return None;
			}
			match parse_preset(line) {
				Some(preset) => Some(preset),
				None => {
					warn!("ignoring malformed preset on line {}: {:?}", number + 1, line);
					None
				}
			}
		})
		.collect()
}

fn parse_preset(line: &str) -> Option<Preset> {
	let mut fields = line.splitn(5, ',');
	let mut number = || fields.next()?.trim().parse::<f64>().ok();
	let (top, bottom, left, right) = (number()?, number()?, number()?, number()?);
	let label = fields.next()?.trim();
	if label.is_empty() {
		return None;
	}
	Some(Preset {
		label: label.to_owned(),
		crop: CropPercent {
			top,
			bottom,
			left,
			right,
		}
		.clamped(),
	})
}

pub fn load_presets(path: &Path) -> Result<Vec<Preset>> {
	let text = std::fs::read_to_string(path)
		.with_context(|| format!("failed to read presets file {}", path.display()))?;
	Ok(parse_presets(&text))
}

/// Replaces [`PRESETS`] with the contents of `path`, keeping the old list
/// if the file can't be read.
pub fn reload_presets(path: &Path) {
	match load_presets(path) {
		Ok(presets) => {
			info!("loaded {} crop presets from {}", presets.len(), path.display());
			*PRESETS.write() = presets;
		}
		Err(err) => warn!("{:#}", err),
	}
}

/// Where the presets file named by a setting lives: absolute paths are
/// used as given, anything else is looked up next to the module.
pub fn presets_path(setting: &str, module_dir: Option<&Path>) -> PathBuf {
	let setting = match setting.trim() {
		"" => PRESETS_FILE,
		setting => setting,
	};
	let path = Path::new(setting);
	match module_dir {
		Some(dir) if path.is_relative() => dir.join(path),
		_ => path.to_path_buf(),
	}
}

/// Settles which crop applies when both a preset and the sliders are set.
///
/// Picking a preset overrides the sliders. Moving a slider afterwards
/// drops the preset until another one is picked.
#[derive(Debug, Default)]
pub struct PresetTracker {
	selection: i64,
	applied: Option<AppliedPreset>,
}

#[derive(Debug, Clone, Copy)]
struct AppliedPreset {
	sliders: CropPercent,
	crop: CropPercent,
}

impl PresetTracker {
	/// `preset` is the crop of list entry `selection`, if there is one.
	pub fn resolve(&mut self, selection: i64, preset: Option<CropPercent>, sliders: CropPercent) -> CropPercent {
		if selection != self.selection {
			self.selection = selection;
			self.applied = preset.map(|crop| AppliedPreset {
				sliders,
				crop: crop.clamped(),
			});
		} else if self.applied.is_some_and(|applied| applied.sliders != sliders) {
			debug!("crop sliders moved, dropping preset {}", selection);
			self.applied = None;
		}
		match self.applied {
			Some(applied) => applied.crop,
			None => sliders.clamped(),
		}
	}

	/// Whether a preset currently overrides the sliders.
	pub fn is_applied(&self) -> bool {
		self.applied.is_some()
	}
}

/// Preset list entry `selection`; 0 is "none", presets start at 1.
pub fn preset(selection: i64) -> Option<Preset> {
	let index = usize::try_from(selection.checked_sub(1)?).ok()?;
	PRESETS.read().get(index).cloned()
}
