//! PE/COFF inspection: `.sbat` section extraction, module-name scanning,
//! and Authenticode signer-chain inspection, using `goblin` rather than
//! hand-rolling a PE parser. Signing and verification are delegated to
//! the `sbsign`/`sbverify` tools.

use std::path::Path;

use goblin::pe::PE;

use crate::error::{PsbError, Result};

/// Ordered `component,generation` pairs from a `.sbat` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbatVector(pub Vec<(String, u32)>);

impl SbatVector {
	/// The generation recorded for `component`, if present.
	#[must_use]
	pub fn generation_of(&self, component: &str) -> Option<u32> {
		self.0.iter().find(|(c, _)| c == component).map(|(_, g)| *g)
	}
}

/// Parses the raw contents of a PE's `.sbat` section (CSV: `component,gen,vendor,...`).
#[must_use]
pub fn parse_sbat(raw: &[u8]) -> SbatVector {
	let text = String::from_utf8_lossy(raw);
	let pairs = text
		.lines()
		.filter(|l| !l.is_empty())
		.filter_map(|line| {
			let mut fields = line.split(',');
			let component = fields.next()?.trim();
			let generation: u32 = fields.next()?.trim().parse().ok()?;
			Some((component.to_owned(), generation))
		})
		.collect();
	SbatVector(pairs)
}

/// Reads a PE file from disk and returns its `.sbat` section contents, if any.
///
/// # Errors
/// [`PsbError::ShimInvalid`] if the file cannot be read or parsed as PE.
pub fn read_sbat_section(path: &Path) -> Result<Option<SbatVector>> {
	let bytes = std::fs::read(path)
		.map_err(|e| PsbError::ShimInvalid { reason: format!("reading {}: {e}", path.display()) })?;
	let pe = PE::parse(&bytes)
		.map_err(|e| PsbError::ShimInvalid { reason: format!("parsing PE {}: {e}", path.display()) })?;

	let section = pe.sections.iter().find(|s| section_name(s) == ".sbat");
	let Some(section) = section else {
		return Ok(None);
	};
	let start = section.pointer_to_raw_data as usize;
	let end = start.saturating_add(section.size_of_raw_data as usize);
	let raw = bytes.get(start..end).ok_or_else(|| PsbError::ShimInvalid {
		reason: format!("`.sbat` section in {} points outside the file", path.display()),
	})?;
	Ok(Some(parse_sbat(raw)))
}

fn section_name(section: &goblin::pe::section_table::SectionTable) -> String {
	String::from_utf8_lossy(&section.name).trim_end_matches('\0').to_owned()
}

/// Enumerates the module names linked into a GRUB-assembled PE, by scanning
/// for null-terminated ASCII strings in the data section that match GRUB's
/// module-name table convention. `grub2-mkimage` does not emit a structured
/// symbol table we can rely on, so this mirrors how `grub-editenv`/`grub-file`
/// inspect built images: a string scan for known module-name patterns.
#[must_use]
pub fn scan_module_names(bytes: &[u8]) -> Vec<String> {
	let mut names = Vec::new();
	let mut current = Vec::new();
	for &byte in bytes {
		if byte.is_ascii_graphic() && byte != b',' {
			current.push(byte);
		} else {
			if current.len() >= 3 {
				if let Ok(s) = String::from_utf8(current.clone()) {
					if s.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
						names.push(s);
					}
				}
			}
			current.clear();
		}
	}
	names
}

/// A parsed Authenticode signer identity, as reported by `sbverify --list`.
#[derive(Debug, Clone)]
pub struct SignerInfo {
	pub subject: String,
	pub issuer: String,
}

/// Lists Authenticode signers embedded in `path` by delegating to `sbverify
/// --list`, per design note §9 (signature *verification* is never
/// reimplemented in this crate).
///
/// # Errors
/// [`PsbError::ToolchainMissing`]/[`PsbError::ToolFailed`] if `sbverify` is
/// unavailable or fails outright (an unsigned file is not a failure here;
/// it simply yields an empty list).
pub fn list_signers(path: &Path) -> Result<Vec<SignerInfo>> {
	let path_str = path.to_string_lossy();
	let out = match crate::util::run_tool("sbverify", &[std::ffi::OsStr::new("--list"), std::ffi::OsStr::new(path_str.as_ref())]) {
		Ok(out) => out,
		Err(PsbError::ToolFailed { stderr, .. }) if stderr.contains("No signature") => return Ok(Vec::new()),
		Err(e) => return Err(e),
	};
	let text = String::from_utf8_lossy(&out);
	let mut signers = Vec::new();
	let mut subject = None;
	for line in text.lines() {
		let line = line.trim();
		if let Some(rest) = line.strip_prefix("subject:") {
			subject = Some(rest.trim().to_owned());
		} else if let Some(rest) = line.strip_prefix("issuer:") {
			if let Some(s) = subject.take() {
				signers.push(SignerInfo { subject: s, issuer: rest.trim().to_owned() });
			}
		}
	}
	Ok(signers)
}

/// Signs `path` in place with `key`/`cert`, writing to `output`, via
/// `sbsign` (Authenticode PKCS#7 signing over the PE hash excluding the
/// signature directory, per the Authenticode spec).
///
/// # Errors
/// [`PsbError::SignFailed`] if `sbsign` exits non-zero.
pub fn sbsign(path: &Path, key: &Path, cert: &Path, output: &Path) -> Result<()> {
	let path_str = path.to_string_lossy();
	let key_str = key.to_string_lossy();
	let cert_str = cert.to_string_lossy();
	let out_str = output.to_string_lossy();
	crate::util::run_tool(
		"sbsign",
		&[
			std::ffi::OsStr::new("--key"),
			std::ffi::OsStr::new(key_str.as_ref()),
			std::ffi::OsStr::new("--cert"),
			std::ffi::OsStr::new(cert_str.as_ref()),
			std::ffi::OsStr::new("--output"),
			std::ffi::OsStr::new(out_str.as_ref()),
			std::ffi::OsStr::new(path_str.as_ref()),
		],
	)
	.map_err(|e| PsbError::SignFailed { artifact: path.to_owned(), reason: e.to_string() })?;
	Ok(())
}

/// Verifies `path`'s Authenticode signature against `cert`, via `sbverify`.
///
/// # Errors
/// [`PsbError::VerifyFailed`] if `sbverify` reports the signature invalid.
pub fn sbverify(path: &Path, cert: &Path) -> Result<()> {
	let path_str = path.to_string_lossy();
	let cert_str = cert.to_string_lossy();
	crate::util::run_tool(
		"sbverify",
		&[std::ffi::OsStr::new("--cert"), std::ffi::OsStr::new(cert_str.as_ref()), std::ffi::OsStr::new(path_str.as_ref())],
	)
	.map_err(|e| PsbError::VerifyFailed { check: "authenticode_signature".into(), detail: e.to_string() })?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_shim_sbat_csv() {
		let raw = b"sbat,1,SBAT Version,sbat,1,https://example.com\nshim,4,UEFI shim,shim,4,https://example.com\n";
		let vector = parse_sbat(raw);
		assert_eq!(vector.generation_of("shim"), Some(4));
		assert_eq!(vector.generation_of("sbat"), Some(1));
		assert_eq!(vector.generation_of("grub"), None);
	}

	#[test]
	fn module_scan_extracts_lowercase_identifiers() {
		let bytes = b"\x00normal\x00search_fs_file\x00123\x00shim_lock\x00";
		let names = scan_module_names(bytes);
		assert!(names.contains(&"normal".to_owned()));
		assert!(names.contains(&"search_fs_file".to_owned()));
		assert!(names.contains(&"shim_lock".to_owned()));
	}
}
