//! Phase B — Rebuild EFI System Partition image.
//!
//! Allocates a fresh FAT32 image and populates it via loopback mount and
//! plain file copies: zero a file, `mkfs.vfat`, loop-mount, write files.

use std::path::{Path, PathBuf};

use crate::{
	error::{PsbError, Result},
	util::{LoopDevice, ScopedMount},
};

pub const ESP_SIZE_BYTES: u64 = 16 * 1024 * 1024;
pub const ESP_LABEL: &str = "EFIBOOT";

/// One dual-placed file to copy into both the ESP image and the ISO root
/// tree, at possibly different relative paths.
pub struct PlacedFile<'a> {
	pub bytes: &'a [u8],
	pub esp_path: &'static str,
	pub iso_path: &'static str,
}

/// Allocates a zeroed `size` FAT32 image at `path`, with volume label
/// `label`.
///
/// # Errors
/// [`PsbError::ToolFailed`] if `mkfs.vfat` fails.
pub fn allocate(path: &Path, size: u64, label: &str) -> Result<()> {
	let file = std::fs::File::create(path)?;
	file.set_len(size)?;
	drop(file);
	let path_str = path.to_string_lossy();
	crate::util::run_tool(
		"mkfs.vfat",
		&[std::ffi::OsStr::new("-F"), std::ffi::OsStr::new("32"), std::ffi::OsStr::new("-n"), std::ffi::OsStr::new(label), std::ffi::OsStr::new(path_str.as_ref())],
	)?;
	Ok(())
}

/// Populates `image` with `files` by loop-mounting it and copying each
/// file into place, creating parent directories as needed.
///
/// # Errors
/// [`PsbError::IsoWriteFailed`] on loop/mount/copy failure;
/// [`PsbError::EspOverflow`] if the image fills up.
pub fn populate(image: &Path, files: &[PlacedFile<'_>]) -> Result<()> {
	let loopdev = LoopDevice::attach(image)?;
	let mount_point = crate::util::mkdtemp(&std::env::temp_dir(), "photon-sb-esp-")?;
	let mount = ScopedMount::mount(loopdev.path(), mount_point.path(), "vfat", &[])?;

	let mut total = 0u64;
	for file in files {
		let dest = mount_point.path().join(file.esp_path.trim_start_matches('/'));
		if let Some(parent) = dest.parent() {
			std::fs::create_dir_all(parent).map_err(|e| PsbError::IsoWriteFailed { path: dest.clone(), reason: e.to_string() })?;
		}
		std::fs::write(&dest, file.bytes).map_err(|e| {
			if e.raw_os_error() == Some(28) {
				PsbError::EspOverflow { attempted_bytes: total + file.bytes.len() as u64 }
			} else {
				PsbError::IsoWriteFailed { path: dest.clone(), reason: e.to_string() }
			}
		})?;
		total += file.bytes.len() as u64;
	}

	drop(mount);
	Ok(())
}

/// Reads every dual-placed file back out of `image`, keyed by `esp_path`,
/// for the Verifier's byte-identity check (P5).
///
/// # Errors
/// [`PsbError::IsoUnreadable`] on mount failure.
pub fn read_back(image: &Path, esp_paths: &[&str]) -> Result<Vec<(String, Vec<u8>)>> {
	let loopdev = LoopDevice::attach(image)?;
	let mount_point = crate::util::mkdtemp(&std::env::temp_dir(), "photon-sb-esp-read-")?;
	let mount = ScopedMount::mount(loopdev.path(), mount_point.path(), "vfat", &["ro"])?;

	let mut out = Vec::new();
	for path in esp_paths {
		let full = mount_point.path().join(path.trim_start_matches('/'));
		let bytes = std::fs::read(&full).map_err(|e| PsbError::IsoUnreadable { path: full.clone(), reason: e.to_string() })?;
		out.push(((*path).to_owned(), bytes));
	}
	drop(mount);
	Ok(out)
}

#[must_use]
pub fn standard_layout() -> Vec<PathBuf> {
	vec![
		PathBuf::from("/EFI/BOOT/BOOTX64.EFI"),
		PathBuf::from("/EFI/BOOT/grub.efi"),
		PathBuf::from("/EFI/BOOT/grubx64.efi"),
		PathBuf::from("/EFI/BOOT/grubx64_real.efi"),
		PathBuf::from("/EFI/BOOT/MokManager.efi"),
		PathBuf::from("/MokManager.efi"),
		PathBuf::from("/ENROLL_THIS_KEY_IN_MOKMANAGER.cer"),
		PathBuf::from("/EFI/BOOT/ENROLL_THIS_KEY_IN_MOKMANAGER.cer"),
		PathBuf::from("/EFI/BOOT/grub.cfg"),
		PathBuf::from("/grub/grub.cfg"),
	]
}
