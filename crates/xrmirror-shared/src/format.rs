// SPDX-License-Identifier: MPL-2.0
use std::fmt;

/// A raw `DXGI_FORMAT` code.
///
/// Kept as a plain integer so it can cross the OpenXR boundary (where
/// swapchain formats are `i64`) and the process boundary without pulling in
/// platform bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct DxgiFormat(pub u32);

impl DxgiFormat {
	pub const UNKNOWN: Self = Self(0);
	pub const R16G16B16A16_TYPELESS: Self = Self(9);
	pub const R16G16B16A16_UNORM: Self = Self(11);
	pub const R10G10B10A2_TYPELESS: Self = Self(23);
	pub const R10G10B10A2_UNORM: Self = Self(24);
	pub const R8G8B8A8_TYPELESS: Self = Self(27);
	pub const R8G8B8A8_UNORM: Self = Self(28);
	pub const R8G8B8A8_UNORM_SRGB: Self = Self(29);
	pub const BC1_TYPELESS: Self = Self(70);
	pub const BC1_UNORM: Self = Self(71);
	pub const BC1_UNORM_SRGB: Self = Self(72);
	pub const B5G6R5_UNORM: Self = Self(85);
	pub const B5G5R5A1_UNORM: Self = Self(86);
	pub const B8G8R8A8_UNORM: Self = Self(87);
	pub const B8G8R8X8_UNORM: Self = Self(88);
	pub const R10G10B10_XR_BIAS_A2_UNORM: Self = Self(89);
	pub const B8G8R8A8_TYPELESS: Self = Self(90);
	pub const B8G8R8A8_UNORM_SRGB: Self = Self(91);
	pub const B8G8R8X8_TYPELESS: Self = Self(92);
	pub const B8G8R8X8_UNORM_SRGB: Self = Self(93);
	pub const B4G4R4A4_UNORM: Self = Self(115);

	/// Converts an OpenXR swapchain format. Anything outside the `u32` range
	/// cannot be a DXGI code and maps to [`DxgiFormat::UNKNOWN`].
	pub fn from_xr(format: i64) -> Self {
		u32::try_from(format).map(Self).unwrap_or(Self::UNKNOWN)
	}

	pub fn as_xr(self) -> i64 {
		i64::from(self.0)
	}
}

impl fmt::Display for DxgiFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "DXGI_FORMAT({})", self.0)
	}
}

/// The family a format code belongs to: its typeless, linear and sRGB
/// variants and its bit layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
	pub typeless: Option<DxgiFormat>,
	pub linear: DxgiFormat,
	pub srgb: Option<DxgiFormat>,
	pub bits_per_pixel: u32,
	pub bits_per_channel: u32,
	pub channels: u32,
}

const fn family(
	typeless: Option<DxgiFormat>,
	linear: DxgiFormat,
	srgb: Option<DxgiFormat>,
	bits_per_pixel: u32,
	bits_per_channel: u32,
	channels: u32,
) -> FormatInfo {
	FormatInfo {
		typeless,
		linear,
		srgb,
		bits_per_pixel,
		bits_per_channel,
		channels,
	}
}

// Typeless and UNORM/sRGB families only; anything else is passed through.
const FAMILIES: [FormatInfo; 10] = [
	family(
		Some(DxgiFormat::R8G8B8A8_TYPELESS),
		DxgiFormat::R8G8B8A8_UNORM,
		Some(DxgiFormat::R8G8B8A8_UNORM_SRGB),
		32,
		8,
		4,
	),
	family(
		Some(DxgiFormat::B8G8R8A8_TYPELESS),
		DxgiFormat::B8G8R8A8_UNORM,
		Some(DxgiFormat::B8G8R8A8_UNORM_SRGB),
		32,
		8,
		4,
	),
	family(
		Some(DxgiFormat::B8G8R8X8_TYPELESS),
		DxgiFormat::B8G8R8X8_UNORM,
		Some(DxgiFormat::B8G8R8X8_UNORM_SRGB),
		32,
		8,
		3,
	),
	family(
		Some(DxgiFormat::R16G16B16A16_TYPELESS),
		DxgiFormat::R16G16B16A16_UNORM,
		None,
		64,
		16,
		4,
	),
	family(
		Some(DxgiFormat::R10G10B10A2_TYPELESS),
		DxgiFormat::R10G10B10A2_UNORM,
		None,
		32,
		10,
		4,
	),
	family(None, DxgiFormat::B5G6R5_UNORM, None, 16, 5, 3),
	family(None, DxgiFormat::B5G5R5A1_UNORM, None, 16, 5, 4),
	family(None, DxgiFormat::R10G10B10_XR_BIAS_A2_UNORM, None, 32, 10, 4),
	family(None, DxgiFormat::B4G4R4A4_UNORM, None, 16, 4, 4),
	family(
		Some(DxgiFormat::BC1_TYPELESS),
		DxgiFormat::BC1_UNORM,
		Some(DxgiFormat::BC1_UNORM_SRGB),
		64,
		16,
		4,
	),
];

impl FormatInfo {
	/// Finds the family containing `format`, or `None` if it isn't one of
	/// the known typeless/UNORM formats.
	pub fn lookup(format: DxgiFormat) -> Option<Self> {
		FAMILIES.iter().copied().find(|info| info.contains(format))
	}

	pub fn contains(&self, format: DxgiFormat) -> bool {
		self.linear == format || self.typeless == Some(format) || self.srgb == Some(format)
	}

	/// Wide formats are already linear and have no sRGB variant.
	pub fn prefers_linear(&self) -> bool {
		self.bits_per_channel > 8
	}

	/// The format a shader resource view should use so sampling is gamma
	/// correct.
	pub fn sampling_format(&self) -> DxgiFormat {
		if self.prefers_linear() {
			self.linear
		} else {
			self.srgb.unwrap_or(self.linear)
		}
	}
}

/// The view format for sampling a texture stored as `format`. Unknown
/// formats are used as-is.
pub fn view_format(format: DxgiFormat) -> DxgiFormat {
	match FormatInfo::lookup(format) {
		Some(info) => info.sampling_format(),
		None => {
			warn!("unknown texture format {}; using it unmodified", format);
			format
		}
	}
}

/// The linear UNORM variant of `format`. Unknown formats are used as-is.
pub fn linear_format(format: DxgiFormat) -> DxgiFormat {
	match FormatInfo::lookup(format) {
		Some(info) => info.linear,
		None => {
			warn!("unknown texture format {}; using it unmodified", format);
			format
		}
	}
}

/// Whether a swapchain in `format` is narrow enough to be mirrored.
/// Unknown formats are let through.
pub fn is_mirrorable(format: DxgiFormat, max_bits_per_channel: u32) -> bool {
	match FormatInfo::lookup(format) {
		Some(info) => info.bits_per_channel <= max_bits_per_channel,
		None => {
			warn!("unknown swapchain format {}; mirroring it anyway", format);
			true
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn all_codes() -> Vec<DxgiFormat> {
		FAMILIES
			.iter()
			.flat_map(|info| [info.typeless, Some(info.linear), info.srgb])
			.flatten()
			.collect()
	}

	#[test]
	fn every_listed_code_resolves_to_its_own_family() {
		for code in all_codes() {
			let info = FormatInfo::lookup(code).expect("listed code must resolve");
			assert!(info.contains(code));
			if let Some(typeless) = info.typeless {
				assert_eq!(FormatInfo::lookup(typeless), Some(info));
			}
			assert_eq!(FormatInfo::lookup(info.linear), Some(info));
		}
	}

	#[test]
	fn wide_formats_never_sample_as_srgb() {
		for info in FAMILIES.iter().filter(|info| info.bits_per_channel > 8) {
			assert_eq!(info.sampling_format(), info.linear);
			assert!(info.srgb.map_or(true, |srgb| srgb != info.sampling_format()));
		}
	}

	#[test]
	fn narrow_formats_sample_as_srgb_when_available() {
		assert_eq!(
			view_format(DxgiFormat::R8G8B8A8_TYPELESS),
			DxgiFormat::R8G8B8A8_UNORM_SRGB
		);
		assert_eq!(
			view_format(DxgiFormat::B8G8R8A8_UNORM),
			DxgiFormat::B8G8R8A8_UNORM_SRGB
		);
		assert_eq!(view_format(DxgiFormat::B5G6R5_UNORM), DxgiFormat::B5G6R5_UNORM);
		assert_eq!(
			view_format(DxgiFormat::R16G16B16A16_TYPELESS),
			DxgiFormat::R16G16B16A16_UNORM
		);
	}

	#[test]
	fn unknown_formats_pass_through() {
		// DXGI_FORMAT_R32G32B32A32_FLOAT
		let float = DxgiFormat(2);
		assert_eq!(FormatInfo::lookup(float), None);
		assert_eq!(FormatInfo::lookup(DxgiFormat::UNKNOWN), None);
		assert_eq!(view_format(float), float);
		assert_eq!(linear_format(float), float);
		assert!(is_mirrorable(float, 10));
	}

	#[test]
	fn mirrorable_respects_channel_depth() {
		assert!(is_mirrorable(DxgiFormat::R8G8B8A8_UNORM_SRGB, 10));
		assert!(is_mirrorable(DxgiFormat::R10G10B10A2_UNORM, 10));
		assert!(!is_mirrorable(DxgiFormat::R16G16B16A16_UNORM, 10));
		assert!(!is_mirrorable(DxgiFormat::BC1_UNORM, 10));
	}

	#[test]
	fn xr_format_conversion() {
		assert_eq!(DxgiFormat::from_xr(29), DxgiFormat::R8G8B8A8_UNORM_SRGB);
		assert_eq!(DxgiFormat::from_xr(-1), DxgiFormat::UNKNOWN);
		assert_eq!(DxgiFormat::B8G8R8A8_UNORM.as_xr(), 87);
	}
}
