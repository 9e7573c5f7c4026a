// SPDX-License-Identifier: MPL-2.0
use obs_wrapper::{
	log::Logger,
	module::{LoadContext, Module, ModuleContext},
	obs_sys::{OBS_SOURCE_CUSTOM_DRAW, OBS_SOURCE_VIDEO},
	source::Icon,
	string::ObsString,
};
use std::{ffi::OsString, os::windows::ffi::OsStringExt, path::PathBuf};
use windows::{
	core::PCWSTR,
	Win32::{
		Foundation::HMODULE,
		System::LibraryLoader::{
			GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
			GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
		},
	},
};

/// Directory holding this plugin's DLL.
pub fn module_dir() -> Option<PathBuf> {
	let mut module = HMODULE::default();
	unsafe {
		GetModuleHandleExW(
			GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
			PCWSTR(module_dir as *const () as *const u16),
			&mut module,
		)
		.ok()?;
	}
	let mut buffer = vec![0u16; 1024];
	let len = unsafe { GetModuleFileNameW(module, &mut buffer) } as usize;
	if len == 0 || len >= buffer.len() {
		return None;
	}
	let path = PathBuf::from(OsString::from_wide(&buffer[..len]));
	path.parent().map(PathBuf::from)
}

#[cfg_attr(target_pointer_width = "32", repr(align(64)))]
#[cfg_attr(target_pointer_width = "64", repr(align(128)))]
pub struct XrMirrorModule {
	context: ModuleContext,
}

impl Module for XrMirrorModule {
	fn new(ctx: ModuleContext) -> Self {
		Self { context: ctx }
	}

	fn get_ctx(&self) -> &ModuleContext {
		&self.context
	}

	fn load(&mut self, load_context: &mut LoadContext) -> bool {
		let _ = Logger::new().init();
		crate::crop::reload_presets(&crate::crop::presets_path("", module_dir().as_deref()));
		let mut source = load_context
			.create_source_builder::<crate::source::MirrorSource>()
			.with_icon(Icon::GameCapture)
			.enable_get_properties()
			.enable_get_defaults()
			.enable_activate()
			.enable_deactivate()
			.enable_show()
			.enable_hide()
			.enable_video_render()
			.enable_video_tick()
			.enable_get_height()
			.enable_get_width()
			.enable_get_name()
			.enable_update()
			.build();
		source.as_mut().output_flags = OBS_SOURCE_VIDEO | OBS_SOURCE_CUSTOM_DRAW;
		load_context.register_source(source);
		true
	}

	fn description() -> ObsString {
		obs_string!("Captures what an OpenXR application shows in the headset.")
	}

	fn name() -> ObsString {
		obs_string!("OpenXR Mirror")
	}

	fn author() -> ObsString {
		obs_string!("OpenXR Mirror contributors")
	}
}

obs_register_module!(XrMirrorModule);
