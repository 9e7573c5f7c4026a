// SPDX-License-Identifier: MPL-2.0
use ahash::AHashMap;
use openxr_sys as xr;

/// What a reference space was created with.
#[derive(Debug, Clone, Copy)]
pub struct SpaceInfo {
	pub kind: xr::ReferenceSpaceType,
	pub pose: xr::Posef,
}

impl SpaceInfo {
	/// Head-locked space: content posed in it follows the view.
	pub fn is_view(&self) -> bool {
		self.kind == xr::ReferenceSpaceType::VIEW
	}
}

/// Reference spaces the application has created, keyed by handle.
#[derive(Debug, Default)]
pub struct SpaceRegistry {
	spaces: AHashMap<xr::Space, SpaceInfo>,
}

impl SpaceRegistry {
	pub fn insert(&mut self, space: xr::Space, info: &xr::ReferenceSpaceCreateInfo) {
		self.spaces.insert(
			space,
			SpaceInfo {
				kind: info.reference_space_type,
				pose: info.pose_in_reference_space,
			},
		);
	}

	pub fn remove(&mut self, space: xr::Space) -> Option<SpaceInfo> {
		self.spaces.remove(&space)
	}

	pub fn get(&self, space: xr::Space) -> Option<&SpaceInfo> {
		self.spaces.get(&space)
	}

	/// The creation pose of `space` if it is head-locked.
	pub fn view_pose(&self, space: xr::Space) -> Option<xr::Posef> {
		self.get(space).filter(|info| info.is_view()).map(|info| info.pose)
	}

	pub fn len(&self) -> usize {
		self.spaces.len()
	}

	pub fn is_empty(&self) -> bool {
		self.spaces.is_empty()
	}
}
