// SPDX-License-Identifier: MPL-2.0
use crate::block::SharedSurfaceBlock;
use thiserror::Error;

/// Name of the segment the layer publishes and the capture source opens.
pub const SEGMENT_NAME: &str = "OpenXROBSMirrorSurface";

#[derive(Debug, Error)]
pub enum SegmentError {
	/// Nobody has created the segment yet. The consumer treats this as
	/// "producer not running" and retries later.
	#[error("shared segment {0} does not exist")]
	NotFound(String),
	#[error("failed to create shared segment {name}: {reason}")]
	Create { name: String, reason: String },
	#[error("failed to open shared segment {name}: {reason}")]
	Open { name: String, reason: String },
	#[error("failed to map shared segment {name}: {reason}")]
	Map { name: String, reason: String },
}

/// A mapped view of the named segment holding the [`SharedSurfaceBlock`].
pub struct SharedSegment {
	name: String,
	mapping: imp::Mapping,
}

impl SharedSegment {
	/// Creates the segment, or attaches to it if a previous producer in
	/// another process left it alive.
	pub fn create(name: &str) -> Result<Self, SegmentError> {
		let mapping = imp::Mapping::create(name)?;
		info!("created shared segment {}", name);
		Ok(Self {
			name: name.to_owned(),
			mapping,
		})
	}

	/// Opens an existing segment. Never creates one.
	pub fn open(name: &str) -> Result<Self, SegmentError> {
		let mapping = imp::Mapping::open(name)?;
		debug!("opened shared segment {}", name);
		Ok(Self {
			name: name.to_owned(),
			mapping,
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn block(&self) -> &SharedSurfaceBlock {
		self.mapping.block()
	}
}

impl std::fmt::Debug for SharedSegment {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SharedSegment")
			.field("name", &self.name)
			.finish_non_exhaustive()
	}
}

cfg_if::cfg_if! {
	if #[cfg(windows)] {
		mod imp {
			use super::SegmentError;
			use crate::block::SharedSurfaceBlock;
			use std::ptr::NonNull;
			use windows::{
				core::HSTRING,
				Win32::{
					Foundation::{CloseHandle, ERROR_FILE_NOT_FOUND, HANDLE, INVALID_HANDLE_VALUE},
					System::Memory::{
						CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile,
						FILE_MAP_ALL_ACCESS, FILE_MAP_READ, FILE_MAP_WRITE,
						MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
					},
				},
			};

			const BLOCK_SIZE: usize = std::mem::size_of::<SharedSurfaceBlock>();

			pub(super) struct Mapping {
				handle: HANDLE,
				view: NonNull<SharedSurfaceBlock>,
			}

			impl Mapping {
				pub(super) fn create(name: &str) -> Result<Self, SegmentError> {
					let handle = unsafe {
						CreateFileMappingW(
							INVALID_HANDLE_VALUE,
							None,
							PAGE_READWRITE,
							0,
							BLOCK_SIZE as u32,
							&HSTRING::from(name),
						)
					}
					.map_err(|err| SegmentError::Create {
						name: name.to_owned(),
						reason: err.to_string(),
					})?;
					Self::map(name, handle)
				}

				pub(super) fn open(name: &str) -> Result<Self, SegmentError> {
					let handle = unsafe {
						OpenFileMappingW((FILE_MAP_READ | FILE_MAP_WRITE).0, false, &HSTRING::from(name))
					}
					.map_err(|err| {
						if err.code() == ERROR_FILE_NOT_FOUND.to_hresult() {
							SegmentError::NotFound(name.to_owned())
						} else {
							SegmentError::Open {
								name: name.to_owned(),
								reason: err.to_string(),
							}
						}
					})?;
					Self::map(name, handle)
				}

				fn map(name: &str, handle: HANDLE) -> Result<Self, SegmentError> {
					let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, BLOCK_SIZE) };
					match NonNull::new(view.Value.cast::<SharedSurfaceBlock>()) {
						Some(view) => Ok(Self { handle, view }),
						None => {
							let reason = windows::core::Error::from_win32().to_string();
							unsafe { CloseHandle(handle) }.ok();
							Err(SegmentError::Map {
								name: name.to_owned(),
								reason,
							})
						}
					}
				}

				pub(super) fn block(&self) -> &SharedSurfaceBlock {
					// The mapping is zero-filled on creation, which is a valid
					// all-zero block, and it lives as long as `self`.
					unsafe { self.view.as_ref() }
				}
			}

			impl Drop for Mapping {
				fn drop(&mut self) {
					unsafe {
						UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
							Value: self.view.as_ptr().cast(),
						})
						.ok();
						CloseHandle(self.handle).ok();
					}
				}
			}

			unsafe impl Send for Mapping {}
			unsafe impl Sync for Mapping {}
		}
	} else {
		/// Stand-in for named mappings on platforms without them: segments
		/// are shared between everything in this process that uses the same
		/// name, and disappear once the last handle is dropped.
		mod imp {
			use super::SegmentError;
			use crate::block::SharedSurfaceBlock;
			use once_cell::sync::Lazy;
			use parking_lot::Mutex;
			use std::{
				collections::HashMap,
				sync::{Arc, Weak},
			};

			static SEGMENTS: Lazy<Mutex<HashMap<String, Weak<SharedSurfaceBlock>>>> =
				Lazy::new(|| Mutex::new(HashMap::new()));

			pub(super) struct Mapping {
				block: Arc<SharedSurfaceBlock>,
			}

			impl Mapping {
				pub(super) fn create(name: &str) -> Result<Self, SegmentError> {
					let mut segments = SEGMENTS.lock();
					segments.retain(|_, block| block.strong_count() > 0);
					if let Some(block) = segments.get(name).and_then(Weak::upgrade) {
						return Ok(Self { block });
					}
					let block = Arc::new(SharedSurfaceBlock::default());
					segments.insert(name.to_owned(), Arc::downgrade(&block));
					Ok(Self { block })
				}

				pub(super) fn open(name: &str) -> Result<Self, SegmentError> {
					SEGMENTS
						.lock()
						.get(name)
						.and_then(Weak::upgrade)
						.map(|block| Self { block })
						.ok_or_else(|| SegmentError::NotFound(name.to_owned()))
				}

				pub(super) fn block(&self) -> &SharedSurfaceBlock {
					&self.block
				}
			}
		}
	}
}
