//! Small filesystem helpers shared by the credential store and the ledger.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StorageFault;

/// Writes `bytes` to `path` via a sibling temp file and a rename, so readers
/// observe either the old or the new content and never a partial file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageFault> {
	let parent = path.parent().unwrap_or_else(|| Path::new("."));
	fs::create_dir_all(parent).map_err(|e| StorageFault::io("create dir", parent, e))?;

	let tmp = temp_path(path);
	let result = (|| {
		let mut file = fs::File::create(&tmp).map_err(|e| StorageFault::io("create", &tmp, e))?;
		file.write_all(bytes).map_err(|e| StorageFault::io("write", &tmp, e))?;
		file.sync_all().map_err(|e| StorageFault::io("sync", &tmp, e))?;
		fs::rename(&tmp, path).map_err(|e| StorageFault::io("rename", path, e))
	})();

	if result.is_err() {
		let _ = fs::remove_file(&tmp);
	}
	result
}

/// Reads `path`, mapping "does not exist" to `None`.
pub(crate) fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageFault> {
	match fs::read(path) {
		Ok(bytes) => Ok(Some(bytes)),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(err) => Err(StorageFault::io("read", path, err)),
	}
}

fn temp_path(path: &Path) -> PathBuf {
	let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
	name.push(".tmp");
	path.with_file_name(name)
}
