//! Phase E — Re-author hybrid ISO.
//!
//! Shells out to `xorriso -as mkisofs`, built for this crate's exact
//! El-Torito/isohybrid layout requirements (BIOS + UEFI + USB boot).

use std::path::Path;

use crate::error::{PsbError, Result};

const VOLUME_ID_FALLBACK: &str = "PHOTON_SB";
const MAX_VOLUME_ID_LEN: usize = 32;

/// Truncates `candidate` to the 32-byte ISO volume-id limit, falling back
/// to `PHOTON_SB` when empty.
#[must_use]
pub fn volume_id(candidate: &str) -> String {
	let candidate = candidate.trim();
	if candidate.is_empty() {
		return VOLUME_ID_FALLBACK.to_owned();
	}
	candidate.chars().take(MAX_VOLUME_ID_LEN).collect()
}

/// Re-authors `root_tree` into a hybrid BIOS+UEFI+USB-bootable ISO at
/// `output`, per the ISO external contract:
/// - BIOS via isolinux (El-Torito no-emulation, boot-info-table, 4 sectors).
/// - UEFI via `boot/grub2/efiboot.img` (El-Torito alternate entry, no-emul).
/// - USB write-through via an isohybrid MBR+GPT prefix.
///
/// # Errors
/// [`PsbError::IsoWriteFailed`] if `xorriso` exits non-zero.
#[tracing::instrument(skip(root_tree, output))]
pub fn author(root_tree: &Path, output: &Path, volid: &str, isohybrid_mbr: &Path, source_date_epoch: Option<i64>) -> Result<()> {
	let root_str = root_tree.to_string_lossy();
	let output_str = output.to_string_lossy();
	let mbr_str = isohybrid_mbr.to_string_lossy();

	let mut args: Vec<std::ffi::OsString> = vec![
		"-as".into(),
		"mkisofs".into(),
		"-iso-level".into(),
		"3".into(),
		"-full-iso9660-filenames".into(),
		"-volid".into(),
		volid.into(),
		"-eltorito-boot".into(),
		"isolinux/isolinux.bin".into(),
		"-eltorito-catalog".into(),
		"isolinux/boot.cat".into(),
		"-no-emul-boot".into(),
		"-boot-load-size".into(),
		"4".into(),
		"-boot-info-table".into(),
		"-eltorito-alt-boot".into(),
		"-e".into(),
		"boot/grub2/efiboot.img".into(),
		"-no-emul-boot".into(),
		"-isohybrid-mbr".into(),
		mbr_str.as_ref().into(),
		"-isohybrid-gpt-basdat".into(),
		"-output".into(),
		output_str.as_ref().into(),
	];
	if let Some(epoch) = source_date_epoch {
		args.push("--modification-date".into());
		args.push(epoch_to_iso_date(epoch).into());
	}
	args.push(root_str.as_ref().into());

	let arg_refs: Vec<&std::ffi::OsStr> = args.iter().map(std::ffi::OsString::as_os_str).collect();
	crate::util::run_tool("xorriso", &arg_refs).map_err(|e| PsbError::IsoWriteFailed { path: output.to_owned(), reason: e.to_string() })?;
	Ok(())
}

/// Renders a `SOURCE_DATE_EPOCH` value as the 16-digit `YYYYMMDDHHmmsscc`
/// timestamp `xorriso --modification-date` expects.
fn epoch_to_iso_date(epoch: i64) -> String {
	let dt = time::OffsetDateTime::from_unix_timestamp(epoch).unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
	format!(
		"{:04}{:02}{:02}{:02}{:02}{:02}00",
		dt.year(),
		u8::from(dt.month()),
		dt.day(),
		dt.hour(),
		dt.minute(),
		dt.second()
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn volume_id_truncates_to_32_bytes() {
		let long = "A".repeat(64);
		assert_eq!(volume_id(&long).len(), 32);
	}

	#[test]
	fn volume_id_falls_back_when_empty() {
		assert_eq!(volume_id("   "), "PHOTON_SB");
	}

	#[test]
	fn epoch_date_is_sixteen_digits() {
		assert_eq!(epoch_to_iso_date(1_700_000_000).len(), 16);
	}
}
