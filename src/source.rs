// SPDX-License-Identifier: MPL-2.0
use crate::{
	capture::MirrorCapture,
	crop::{self, CropPercent, PresetTracker},
	link::{LinkSettings, MirrorLink},
};
use obs_wrapper::{
	data::DataObj,
	properties::{NumberProp, Properties, TextProp, TextType},
	source::{
		ActivateSource, CreatableSourceContext, DeactivateSource, GetDefaultsSource,
		GetHeightSource, GetNameSource, GetPropertiesSource, GetWidthSource, GlobalContext,
		HideSource, ShowSource, SourceContext, SourceType, Sourceable, UpdateSource,
		VideoRenderContext, VideoRenderSource, VideoTickSource,
	},
	string::ObsString,
};
use std::time::Instant;
use xrmirror_shared::{EyeSelection, Tunables, SEGMENT_NAME};

#[cfg_attr(target_pointer_width = "32", repr(align(64)))]
#[cfg_attr(target_pointer_width = "64", repr(align(128)))]
pub struct MirrorSource {
	link: Option<MirrorLink<MirrorCapture>>,
	settings: LinkSettings,
	presets: PresetTracker,
	presets_file: String,
	active: bool,
	ticks: f32,
}

impl MirrorSource {
	/// Brings up the capture device if it isn't running yet.
	fn ensure_link(&mut self) -> Option<&mut MirrorLink<MirrorCapture>> {
		if self.link.is_none() {
			match MirrorCapture::new() {
				Ok(capture) => self.link = Some(MirrorLink::new(capture, SEGMENT_NAME, self.settings)),
				Err(err) => error!("failed to set up mirror capture: {:#}", err),
			}
		}
		self.link.as_mut()
	}

	fn read_settings(&mut self, settings: &DataObj) -> LinkSettings {
		let percent = |key: ObsString| settings.get::<f64>(key).unwrap_or_default();
		let sliders = CropPercent {
			top: percent(obs_string!("croptop")),
			bottom: percent(obs_string!("cropbottom")),
			left: percent(obs_string!("cropleft")),
			right: percent(obs_string!("cropright")),
		};
		let selection = settings
			.get::<i64>(obs_string!("croppreset"))
			.unwrap_or_default();
		let preset = crop::preset(selection).map(|preset| preset.crop);
		let eye = settings
			.get::<i64>(obs_string!("eyeindex"))
			.map(|index| EyeSelection::from_index(index as i32))
			.unwrap_or(EyeSelection::Right);
		let defaults = Tunables::default();
		let tunable = |key: ObsString, default: f32| {
			settings
				.get::<f64>(key)
				.map(|value| value as f32)
				.unwrap_or(default)
		};
		LinkSettings {
			crop: self.presets.resolve(selection, preset, sliders),
			eye,
			tunables: Tunables {
				overlap_percent: tunable(obs_string!("overlap"), defaults.overlap_percent),
				blend_width_percent: tunable(obs_string!("blendwidth"), defaults.blend_width_percent),
				blend_center_percent: tunable(obs_string!("blendcenter"), defaults.blend_center_percent),
			},
		}
	}
}

impl Sourceable for MirrorSource {
	fn get_id() -> ObsString {
		obs_string!("openxrmirror_capture")
	}

	fn get_type() -> SourceType {
		SourceType::INPUT
	}

	fn create(create: &mut CreatableSourceContext<Self>, _source: SourceContext) -> Self {
		let mut this = Self {
			link: None,
			settings: LinkSettings::default(),
			presets: PresetTracker::default(),
			presets_file: String::new(),
			active: false,
			ticks: 0.0,
		};
		this.update(&mut create.settings, create.global);
		this.ensure_link();
		this
	}
}

impl GetNameSource for MirrorSource {
	fn get_name() -> ObsString {
		obs_string!("OpenXR Mirror Capture")
	}
}

fn percent_slider() -> NumberProp<f64> {
	NumberProp::new_float(0.1)
		.with_range(0.0..=100.0)
		.with_slider()
}

impl GetPropertiesSource for MirrorSource {
	fn get_properties(&mut self) -> Properties {
		let mut props = Properties::new();
		{
			let mut eyes = props.add_list::<i64>(obs_string!("eyeindex"), obs_string!("Eye"), false);
			eyes.push(obs_string!("Left Eye"), i64::from(EyeSelection::Left.index()));
			eyes.push(obs_string!("Right Eye"), i64::from(EyeSelection::Right.index()));
			eyes.push(obs_string!("Both Eyes (Wide)"), i64::from(EyeSelection::Wide.index()));
		}
		{
			let mut presets = props.add_list::<i64>(obs_string!("croppreset"), obs_string!("Preset"), false);
			presets.push(obs_string!("none"), 0);
			for (i, preset) in crop::PRESETS.read().iter().enumerate() {
				presets.push(preset.label.as_str(), i as i64 + 1);
			}
		}
		props.add(
			obs_string!("croptop"),
			obs_string!("Crop Top Percentage"),
			percent_slider(),
		);
		props.add(
			obs_string!("cropbottom"),
			obs_string!("Crop Bottom Percentage"),
			percent_slider(),
		);
		props.add(
			obs_string!("cropleft"),
			obs_string!("Crop Left Percentage"),
			percent_slider(),
		);
		props.add(
			obs_string!("cropright"),
			obs_string!("Crop Right Percentage"),
			percent_slider(),
		);
		props.add(
			obs_string!("overlap"),
			obs_string!("Wide Overlap Percentage"),
			percent_slider(),
		);
		props.add(
			obs_string!("blendwidth"),
			obs_string!("Wide Blend Width Percentage"),
			percent_slider(),
		);
		props.add(
			obs_string!("blendcenter"),
			obs_string!("Wide Blend Center Percentage"),
			percent_slider(),
		);
		props.add(
			obs_string!("presetsfile"),
			obs_string!("Presets File"),
			TextProp::new(TextType::Default),
		);
		props
	}
}

impl UpdateSource for MirrorSource {
	fn update(&mut self, settings: &mut DataObj, _context: &mut GlobalContext) {
		let presets_file = settings
			.get::<ObsString>(obs_string!("presetsfile"))
			.map(|os| os.as_str().to_string())
			.unwrap_or_default();
		if presets_file != self.presets_file {
			let path = crop::presets_path(&presets_file, crate::module::module_dir().as_deref());
			crop::reload_presets(&path);
			self.presets_file = presets_file;
		}
		self.settings = self.read_settings(settings);
		if let Some(link) = self.link.as_mut() {
			link.apply(self.settings);
		}
	}
}

impl GetDefaultsSource for MirrorSource {
	fn get_defaults(settings: &mut DataObj) {
		let tunables = Tunables::default();
		settings.set_default::<i64>(
			obs_string!("eyeindex"),
			i64::from(EyeSelection::Right.index()),
		);
		settings.set_default::<i64>(obs_string!("croppreset"), 0);
		settings.set_default::<f64>(obs_string!("croptop"), 0.0);
		settings.set_default::<f64>(obs_string!("cropbottom"), 0.0);
		settings.set_default::<f64>(obs_string!("cropleft"), 0.0);
		settings.set_default::<f64>(obs_string!("cropright"), 0.0);
		settings.set_default::<f64>(
			obs_string!("overlap"),
			f64::from(tunables.overlap_percent),
		);
		settings.set_default::<f64>(
			obs_string!("blendwidth"),
			f64::from(tunables.blend_width_percent),
		);
		settings.set_default::<f64>(
			obs_string!("blendcenter"),
			f64::from(tunables.blend_center_percent),
		);
		settings.set_default::<ObsString>(
			obs_string!("presetsfile"),
			obs_string!("win_openxrmirror-presets.ini"),
		);
	}
}

impl ShowSource for MirrorSource {
	fn show(&mut self) {
		if let Some(link) = self.ensure_link() {
			link.connect(true, Instant::now());
		}
	}
}

impl HideSource for MirrorSource {
	fn hide(&mut self) {
		if let Some(link) = self.link.as_mut() {
			link.disconnect();
		}
	}
}

impl ActivateSource for MirrorSource {
	fn activate(&mut self) {
		self.active = true;
	}
}

impl DeactivateSource for MirrorSource {
	fn deactivate(&mut self) {
		self.active = false;
	}
}

impl VideoTickSource for MirrorSource {
	fn video_tick(&mut self, seconds: f32) {
		if self.link.is_some() {
			return;
		}
		self.ticks += seconds;
		if self.ticks >= 2.0 {
			self.ticks = 0.0;
			if self.ensure_link().is_some() {
				info!("mirror capture device ready");
			}
		}
	}
}

impl VideoRenderSource for MirrorSource {
	fn video_render(&mut self, _context: &mut GlobalContext, _render: &mut VideoRenderContext) {
		let active = self.active;
		if let Some(link) = self.link.as_mut() {
			if link.render(active, Instant::now()).is_some() {
				link.opener().draw();
			}
		}
	}
}

impl GetWidthSource for MirrorSource {
	fn get_width(&mut self) -> u32 {
		match self.link.as_ref() {
			Some(link) => link.size().0,
			None => 0,
		}
	}
}

impl GetHeightSource for MirrorSource {
	fn get_height(&mut self) -> u32 {
		match self.link.as_ref() {
			Some(link) => link.size().1,
			None => 0,
		}
	}
}
