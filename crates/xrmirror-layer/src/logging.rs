// SPDX-License-Identifier: MPL-2.0
use std::{
	fs::File,
	path::PathBuf,
	sync::atomic::{AtomicU32, Ordering},
};

const LOG_DIR: &str = "XR_APILAYER_OBSMirror";
const LOG_FILE: &str = "XR_APILAYER_OBSMirror.log";

/// Sends the `log` facade to a file under `%LOCALAPPDATA%`. The filter comes
/// from `XRMIRROR_LOG` and defaults to `info`. Safe to call more than once.
pub fn init() {
	let filter = std::env::var("XRMIRROR_LOG").unwrap_or_else(|_| "info".to_owned());
	let mut builder = env_logger::Builder::new();
	builder.parse_filters(&filter);
	match open_log_file() {
		Ok(file) => {
			builder.target(env_logger::Target::Pipe(Box::new(file)));
		}
		Err(err) => eprintln!("xrmirror: logging to stderr, {}", err),
	}
	if builder.try_init().is_ok() {
		info!("xrmirror-layer v{}", env!("CARGO_PKG_VERSION"));
	}
}

fn log_dir() -> PathBuf {
	std::env::var_os("LOCALAPPDATA")
		.map(PathBuf::from)
		.unwrap_or_else(std::env::temp_dir)
		.join(LOG_DIR)
}

fn open_log_file() -> std::io::Result<File> {
	let dir = log_dir();
	std::fs::create_dir_all(&dir)?;
	File::create(dir.join(LOG_FILE))
}

/// Caps how many errors are written, so a failure repeating every frame
/// can't fill the disk.
#[derive(Debug)]
pub struct ErrorBudget {
	logged: AtomicU32,
	limit: u32,
}

impl ErrorBudget {
	pub const fn new(limit: u32) -> Self {
		Self {
			logged: AtomicU32::new(0),
			limit,
		}
	}

	/// Logs `err` unless the budget is spent. Returns whether it was logged.
	pub fn report(&self, what: &str, err: &anyhow::Error) -> bool {
		let count = self.logged.fetch_add(1, Ordering::Relaxed);
		if count >= self.limit {
			self.logged.store(self.limit, Ordering::Relaxed);
			return false;
		}
		error!("{}: {:#}", what, err);
		if count + 1 == self.limit {
			error!("logged {} errors, going silent", self.limit);
		}
		true
	}
}

pub static ERRORS: ErrorBudget = ErrorBudget::new(100);

/// Logs a mirroring failure against the process-wide budget.
pub fn report(what: &str, err: &anyhow::Error) {
	ERRORS.report(what, err);
}
