//! ISO Rewriter: extracts the source ISO, rebuilds the EFI System Partition
//! image, mirrors the dual-placed files to the ISO root, patches the
//! installer initrd, repopulates the RPM pool, and re-authors a hybrid
//! BIOS+UEFI+USB-bootable ISO.

pub mod esp;
pub mod hybrid;
pub mod initrd;

use std::path::{Path, PathBuf};

use crate::{
	error::{PsbError, Result},
	util::{LoopDevice, ScopedMount},
};

/// Everything Phase A recovers from the source ISO.
pub struct ExtractedIso {
	pub root: PathBuf,
	pub volume_id: String,
	pub original_grub: Option<PathBuf>,
}

/// Phase A — Extract: loop-mounts the source ISO read-only and copies its
/// tree into `dest`, recording the volume identifier for re-authoring.
///
/// # Errors
/// [`PsbError::IsoUnreadable`] if the source cannot be mounted or copied.
#[tracing::instrument(skip(dest))]
pub fn extract(source_iso: &Path, dest: &Path) -> Result<ExtractedIso> {
	std::fs::create_dir_all(dest)?;
	let loopdev = LoopDevice::attach(source_iso)?;
	let mount_point = crate::util::mkdtemp(&std::env::temp_dir(), "photon-sb-srcmnt-")?;
	let mount = ScopedMount::mount(loopdev.path(), mount_point.path(), "iso9660", &["ro"])?;

	copy_tree(mount_point.path(), dest).map_err(|e| PsbError::IsoUnreadable { path: source_iso.to_owned(), reason: e.to_string() })?;
	drop(mount);

	let volume_id = read_volume_id(source_iso)?;
	let candidate = dest.join("EFI/BOOT/grubx64.efi");
	let original_grub = candidate.exists().then_some(candidate);

	Ok(ExtractedIso { root: dest.to_owned(), volume_id, original_grub })
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
	for entry in std::fs::read_dir(src)? {
		let entry = entry?;
		let file_type = entry.file_type()?;
		let target = dst.join(entry.file_name());
		if file_type.is_dir() {
			std::fs::create_dir_all(&target)?;
			copy_tree(&entry.path(), &target)?;
		} else {
			std::fs::copy(entry.path(), &target)?;
		}
	}
	Ok(())
}

fn read_volume_id(source_iso: &Path) -> Result<String> {
	let iso_str = source_iso.to_string_lossy();
	let out = crate::util::run_tool("isoinfo", &[std::ffi::OsStr::new("-d"), std::ffi::OsStr::new("-i"), std::ffi::OsStr::new(iso_str.as_ref())])?;
	let text = String::from_utf8_lossy(&out);
	let id = text.lines().find_map(|l| l.strip_prefix("Volume id: ")).unwrap_or("").trim();
	Ok(hybrid::volume_id(id))
}

/// Phase D — regenerates repodata for `/RPMS/<arch>/` so the installer's
/// package manager sees both originals and MOK variants, via `createrepo_c`.
///
/// # Errors
/// [`PsbError::ToolFailed`] if `createrepo_c` fails.
pub fn regenerate_repodata(rpms_dir: &Path) -> Result<()> {
	let dir_str = rpms_dir.to_string_lossy();
	crate::util::run_tool("createrepo_c", &[std::ffi::OsStr::new("--update"), std::ffi::OsStr::new(dir_str.as_ref())])?;
	Ok(())
}

/// Writes the eFuse-USB simulation payload to a FAT32 image
/// at `device_image`: `efuse_sim/{srk_fuse.bin, sec_config.bin, efuse_config.json}`.
///
/// # Errors
/// [`PsbError::ToolFailed`]/[`PsbError::IsoWriteFailed`] on image or mount
/// failure.
pub fn write_efuse_payload(device_image: &Path, srk_sha256: &[u8; 32], closed: bool) -> Result<()> {
	esp::allocate(device_image, 8 * 1024 * 1024, "EFUSE_SIM")?;

	let sec_config = [u8::from(closed) * 2];
	let efuse_config = serde_json::json!({
		"srk_fuse": "efuse_sim/srk_fuse.bin",
		"sec_config": "efuse_sim/sec_config.bin",
		"closed": closed,
	})
	.to_string();

	let files = vec![
		esp::PlacedFile { bytes: srk_sha256, esp_path: "/efuse_sim/srk_fuse.bin", iso_path: "" },
		esp::PlacedFile { bytes: &sec_config, esp_path: "/efuse_sim/sec_config.bin", iso_path: "" },
		esp::PlacedFile { bytes: efuse_config.as_bytes(), esp_path: "/efuse_sim/efuse_config.json", iso_path: "" },
	];
	esp::populate(device_image, &files)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn volume_id_helper_is_reexported_correctly() {
		assert_eq!(hybrid::volume_id("PHOTON_5_0"), "PHOTON_5_0");
	}
}
