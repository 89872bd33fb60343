//! Shim Provider: decompresses the build-time-embedded SUSE
//! shim and MokManager, and validates the shim's SBAT generation and
//! Microsoft signer chain.

use flate2::read::GzDecoder;
use std::io::Read;

use crate::{
	error::{PsbError, Result},
	pe,
};

const MICROSOFT_ROOT: &str = "Microsoft Corporation UEFI CA 2011";
const MIN_SHIM_SBAT_GENERATION: u32 = 4;

/// The search path shim hardcodes for MokManager, which drives the
/// dual-placement rule.
pub const MOKMANAGER_SEARCH_PATH: &str = "\\MokManager.efi";

pub struct ShimBlob {
	pub bytes: Vec<u8>,
}

pub struct MokManagerBlob {
	pub bytes: Vec<u8>,
}

/// Decompresses the shim and MokManager blobs embedded at build time by
/// `build.rs`.
///
/// # Errors
/// [`PsbError::ShimInvalid`] if the embedded blob is the empty placeholder
/// (i.e. `PHOTON_SB_SHIM_PATH`/`PHOTON_SB_MOKMANAGER_PATH` were unset when
/// this crate was built) or fails to decompress.
pub fn load_embedded() -> Result<(ShimBlob, MokManagerBlob)> {
	let shim = decompress(include_bytes!(concat!(env!("OUT_DIR"), "/shim.efi.gz")), "shim")?;
	let mokmanager = decompress(include_bytes!(concat!(env!("OUT_DIR"), "/mokmanager.efi.gz")), "MokManager")?;
	if shim.is_empty() {
		return Err(PsbError::ShimInvalid {
			reason: "no shim embedded at build time (set PHOTON_SB_SHIM_PATH and rebuild)".into(),
		});
	}
	if mokmanager.is_empty() {
		return Err(PsbError::ShimInvalid {
			reason: "no MokManager embedded at build time (set PHOTON_SB_MOKMANAGER_PATH and rebuild)".into(),
		});
	}
	Ok((ShimBlob { bytes: shim }, MokManagerBlob { bytes: mokmanager }))
}

fn decompress(gz: &[u8], label: &str) -> Result<Vec<u8>> {
	let mut out = Vec::new();
	GzDecoder::new(gz)
		.read_to_end(&mut out)
		.map_err(|e| PsbError::ShimInvalid { reason: format!("decompressing embedded {label}: {e}") })?;
	Ok(out)
}

/// Validates a shim blob's SBAT generation and Microsoft signer chain.
///
/// A missing/invalid SBAT section or wrong Microsoft signer is fatal; a
/// missing secondary SUSE co-signer is logged as a warning, not an error.
///
/// # Errors
/// [`PsbError::ShimInvalid`].
pub fn validate(shim: &ShimBlob, tmp_path: &std::path::Path) -> Result<()> {
	std::fs::write(tmp_path, &shim.bytes)?;

	let sbat = pe::read_sbat_section(tmp_path)?
		.ok_or_else(|| PsbError::ShimInvalid { reason: "shim carries no `.sbat` section".into() })?;
	let generation = sbat
		.generation_of("shim")
		.ok_or_else(|| PsbError::ShimInvalid { reason: "`.sbat` section has no `shim` record".into() })?;
	if generation < MIN_SHIM_SBAT_GENERATION {
		return Err(PsbError::ShimInvalid {
			reason: format!("shim SBAT generation {generation} is below required {MIN_SHIM_SBAT_GENERATION}"),
		});
	}

	let signers = pe::list_signers(tmp_path)?;
	let has_microsoft = signers.iter().any(|s| s.issuer.contains(MICROSOFT_ROOT) || s.subject.contains(MICROSOFT_ROOT));
	if !has_microsoft {
		return Err(PsbError::ShimInvalid {
			reason: format!("no signer chain rooted at \"{MICROSOFT_ROOT}\""),
		});
	}

	let has_suse = signers.iter().any(|s| s.subject.to_ascii_lowercase().contains("suse"));
	if !has_suse {
		tracing::warn!("shim has no secondary SUSE co-signer; proceeding anyway");
	}

	Ok(())
}

/// Constant hardcoded-path accessor, kept as a function even though the
/// value never varies for this shim vendor.
#[must_use]
pub fn mokmanager_search_path(_shim: &ShimBlob) -> &'static str {
	MOKMANAGER_SEARCH_PATH
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mokmanager_path_is_root_level() {
		let shim = ShimBlob { bytes: Vec::new() };
		assert_eq!(mokmanager_search_path(&shim), "\\MokManager.efi");
	}
}
