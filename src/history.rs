//! Append-only build history, one JSON-lines row per build, stored at
//! `mok_history.json` under the keys directory.

use std::{
	fs::OpenOptions,
	io::Write,
	path::Path,
};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolVersions {
	pub grub2_mkimage: String,
	pub xorriso: String,
	pub sbsign: String,
	pub rpmbuild: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MokHistoryEntry {
	pub timestamp: i64,
	pub input_sha256: String,
	pub output_sha256: String,
	pub mok_fingerprint: String,
	pub tool_versions: ToolVersions,
}

/// Appends `entry` as one line of JSON to `path`, creating it if absent.
///
/// # Errors
/// Propagates I/O errors opening or writing the file.
pub fn append(path: &Path, entry: &MokHistoryEntry) -> Result<()> {
	let mut file = OpenOptions::new().create(true).append(true).open(path)?;
	let line = serde_json::to_string(entry).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
	writeln!(file, "{line}")?;
	Ok(())
}

/// Reads every recorded entry from `path`, skipping lines that fail to
/// parse (tolerating partial writes from an interrupted run).
///
/// # Errors
/// Propagates I/O errors reading the file; returns an empty `Vec` if the
/// file does not exist.
pub fn read_all(path: &Path) -> Result<Vec<MokHistoryEntry>> {
	if !path.exists() {
		return Ok(Vec::new());
	}
	let text = std::fs::read_to_string(path)?;
	Ok(text.lines().filter_map(|line| serde_json::from_str(line).ok()).collect())
}

/// Captures the current toolchain's reported versions, once per run.
///
/// # Errors
/// Never fails; a tool that cannot be queried reports `"unknown"`.
pub fn capture_tool_versions() -> ToolVersions {
	let version_of = |tool: &str, arg: &str| -> String {
		crate::util::run_tool(tool, &[std::ffi::OsStr::new(arg)])
			.map(|out| String::from_utf8_lossy(&out).lines().next().unwrap_or("unknown").to_owned())
			.unwrap_or_else(|_| "unknown".to_owned())
	};
	ToolVersions {
		grub2_mkimage: version_of("grub2-mkimage", "--version"),
		xorriso: version_of("xorriso", "--version"),
		sbsign: version_of("sbsign", "--version"),
		rpmbuild: version_of("rpmbuild", "--version"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_entry() -> MokHistoryEntry {
		MokHistoryEntry {
			timestamp: 1_700_000_000,
			input_sha256: "a".repeat(64),
			output_sha256: "b".repeat(64),
			mok_fingerprint: "c".repeat(64),
			tool_versions: ToolVersions {
				grub2_mkimage: "2.12".into(),
				xorriso: "1.5.6".into(),
				sbsign: "0.9.5".into(),
				rpmbuild: "4.19".into(),
			},
		}
	}

	#[test]
	fn append_then_read_all_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("mok_history.json");
		append(&path, &sample_entry()).unwrap();
		append(&path, &sample_entry()).unwrap();
		let entries = read_all(&path).unwrap();
		assert_eq!(entries.len(), 2);
	}

	#[test]
	fn read_all_on_missing_file_is_empty() {
		let dir = tempfile::tempdir().unwrap();
		let entries = read_all(&dir.path().join("nope.json")).unwrap();
		assert!(entries.is_empty());
	}
}
