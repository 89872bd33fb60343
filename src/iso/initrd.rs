//! Edits applied to the installer's initrd without disturbing its outer
//! compressed-cpio format.

use std::io::{Read, Write};

use serde_json::{json, Value};

use crate::error::{PsbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
	Gzip,
	Xz,
	Zstd,
}

impl Compression {
	/// Sniffs the compression format from magic bytes.
	#[must_use]
	pub fn detect(bytes: &[u8]) -> Option<Self> {
		match bytes {
			[0x1f, 0x8b, ..] => Some(Self::Gzip),
			[0xfd, b'7', b'z', b'X', b'Z', 0x00, ..] => Some(Self::Xz),
			[0x28, 0xb5, 0x2f, 0xfd, ..] => Some(Self::Zstd),
			_ => None,
		}
	}
}

fn decompress(bytes: &[u8], kind: Compression) -> Result<Vec<u8>> {
	match kind {
		Compression::Gzip => {
			let mut out = Vec::new();
			flate2::read::GzDecoder::new(bytes).read_to_end(&mut out)?;
			Ok(out)
		}
		Compression::Xz => pipe_through("xz", &["-dc"], bytes),
		Compression::Zstd => pipe_through("zstd", &["-dc"], bytes),
	}
}

fn recompress(bytes: &[u8], kind: Compression) -> Result<Vec<u8>> {
	match kind {
		Compression::Gzip => {
			let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::best());
			encoder.write_all(bytes)?;
			Ok(encoder.finish()?)
		}
		Compression::Xz => pipe_through("xz", &["-zc", "-9"], bytes),
		Compression::Zstd => pipe_through("zstd", &["-c", "-19"], bytes),
	}
}

fn pipe_through(tool: &str, args: &[&str], input: &[u8]) -> Result<Vec<u8>> {
	use std::process::{Command, Stdio};
	let mut child = Command::new(tool)
		.args(args)
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.spawn()
		.map_err(|e| {
			if e.kind() == std::io::ErrorKind::NotFound {
				PsbError::ToolchainMissing { tool: tool.to_owned() }
			} else {
				PsbError::Io(e)
			}
		})?;
	child.stdin.take().expect("piped stdin").write_all(input)?;
	let out = child.wait_with_output()?;
	if !out.status.success() {
		return Err(PsbError::ToolFailed { tool: tool.to_owned(), code: out.status.code(), stderr: String::from_utf8_lossy(&out.stderr).into_owned() });
	}
	Ok(out.stdout)
}

/// Builds the new `installer/packages_mok.json` content: the `minimal`
/// meta-package's direct dependency set, substituting every member that
/// has a MOK variant.
#[must_use]
pub fn build_packages_mok(minimal_deps: &[String]) -> Value {
	let substitutions = [("grub2-efi-image", "grub2-efi-image-mok"), ("shim-signed", "shim-signed-mok"), ("linux", "linux-mok")];
	let packages: Vec<String> = minimal_deps
		.iter()
		.map(|dep| {
			substitutions
				.iter()
				.find(|(orig, _)| orig == dep)
				.map_or_else(|| dep.clone(), |(_, mok)| (*mok).to_owned())
		})
		.collect();
	json!({ "packages": packages })
}

/// Prepends a `"mok"` entry to `build_install_options_all.json`, preserving
/// every original entry.
#[must_use]
pub fn patch_install_options(original: &Value) -> Value {
	let mut map = serde_json::Map::new();
	map.insert(
		"mok".to_owned(),
		json!({ "title": "1. Photon MOK Secure Boot", "packages_file": "packages_mok.json" }),
	);
	if let Some(orig_map) = original.as_object() {
		for (key, value) in orig_map {
			map.insert(key.clone(), value.clone());
		}
	}
	Value::Object(map)
}

/// Injects the `linux-mok → "MOK Secure Boot"` mapping into the installer's
/// kernel-flavor table.
#[must_use]
pub fn patch_flavor_table(mut table: Value) -> Value {
	if let Some(obj) = table.as_object_mut() {
		obj.insert("linux-mok".to_owned(), json!("MOK Secure Boot"));
	}
	table
}

/// Extracts `gzip|xz|zstd` framing, returning the inner newc cpio bytes and
/// the detected compression (so the caller can recompress identically).
///
/// # Errors
/// [`PsbError::IsoUnreadable`] if the compression format is not recognised.
pub fn unwrap_initrd(raw: &[u8]) -> Result<(Vec<u8>, Compression)> {
	let kind = Compression::detect(raw)
		.ok_or_else(|| PsbError::IsoUnreadable { path: "initrd.img".into(), reason: "unrecognised compression magic".into() })?;
	Ok((decompress(raw, kind)?, kind))
}

/// Recompresses `cpio_bytes` using the original `kind`, so the outer
/// compressed framing always matches the original.
///
/// # Errors
/// Propagates tool failures for xz/zstd recompression.
pub fn wrap_initrd(cpio_bytes: &[u8], kind: Compression) -> Result<Vec<u8>> {
	recompress(cpio_bytes, kind)
}

/// One file to splice into (or add to) a newc cpio archive.
pub struct SpliceEntry {
	pub name: String,
	pub contents: Vec<u8>,
}

/// Rewrites `cpio_bytes`, replacing any existing entry whose name matches
/// an entry in `splices` and appending the rest, preserving every other
/// entry's position and metadata. This is the mechanism behind
/// `InitrdPatch`'s three edits: adding `packages_mok.json`, rewriting
/// `build_install_options_all.json`, and patching the kernel-flavor table.
///
/// # Errors
/// [`PsbError::IsoWriteFailed`] if the archive cannot be parsed or
/// re-emitted.
pub fn splice_cpio(cpio_bytes: &[u8], splices: Vec<SpliceEntry>) -> Result<Vec<u8>> {
	let wrap = |e: std::io::Error| PsbError::IsoWriteFailed { path: "initrd.img (cpio)".into(), reason: e.to_string() };

	let mut remaining: std::collections::HashMap<String, Vec<u8>> = splices.into_iter().map(|s| (s.name, s.contents)).collect();
	let mut entries: Vec<(String, Vec<u8>)> = Vec::new();

	let mut cursor = std::io::Cursor::new(cpio_bytes);
	loop {
		let mut reader = cpio::newc::Reader::new(&mut cursor).map_err(wrap)?;
		if reader.entry().is_trailer() {
			let _: &mut std::io::Cursor<&[u8]> = reader.finish().map_err(wrap)?;
			break;
		}
		let name = reader.entry().name().trim_start_matches("./").to_owned();
		let is_dir = reader.entry().mode().0 & 0o170_000 == 0o040_000;
		let mut data = Vec::new();
		if !is_dir {
			std::io::Read::read_to_end(&mut reader, &mut data).map_err(wrap)?;
		}
		cursor = reader.finish().map_err(wrap)?;

		let contents = remaining.remove(&name).unwrap_or(data);
		entries.push((name, contents));
	}

	for (name, contents) in remaining {
		entries.push((name, contents));
	}

	let mut out = Vec::new();
	for (index, (name, contents)) in entries.iter().enumerate() {
		let builder = cpio::newc::Builder::new(name).ino(index as u32 + 1).mode(0o100_644).uid(0).gid(0);
		builder.write(&mut out, contents).map_err(wrap)?;
	}
	cpio::newc::trailer(&mut out).map_err(wrap)?;
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn detects_gzip_magic() {
		assert_eq!(Compression::detect(&[0x1f, 0x8b, 0x08]), Some(Compression::Gzip));
	}

	#[test]
	fn substitutes_mok_variants_in_package_list() {
		let deps = vec!["grub2-efi-image".to_owned(), "shim-signed".to_owned(), "linux".to_owned(), "photon-release".to_owned()];
		let packages = build_packages_mok(&deps);
		let list = packages["packages"].as_array().unwrap();
		assert!(list.contains(&json!("grub2-efi-image-mok")));
		assert!(list.contains(&json!("linux-mok")));
		assert!(list.contains(&json!("photon-release")));
	}

	#[test]
	fn install_options_prepend_mok_and_keep_originals() {
		let original = json!({ "minimal": { "title": "1. Minimal" } });
		let patched = patch_install_options(&original);
		let keys: Vec<&String> = patched.as_object().unwrap().keys().collect();
		assert_eq!(keys.first().map(String::as_str), Some("mok"));
		assert!(patched.get("minimal").is_some());
	}

	#[test]
	fn flavor_table_recognises_linux_mok() {
		let table = patch_flavor_table(json!({ "linux": "Standard" }));
		assert_eq!(table["linux-mok"], json!("MOK Secure Boot"));
	}

	fn build_test_cpio(entries: &[(&str, &[u8])]) -> Vec<u8> {
		let mut out = Vec::new();
		for (index, (name, contents)) in entries.iter().enumerate() {
			cpio::newc::Builder::new(name).ino(index as u32 + 1).mode(0o100_644).uid(0).gid(0).write(&mut out, *contents).unwrap();
		}
		cpio::newc::trailer(&mut out).unwrap();
		out
	}

	fn read_entry(cpio_bytes: &[u8], name: &str) -> Option<Vec<u8>> {
		let mut cursor = std::io::Cursor::new(cpio_bytes);
		loop {
			let mut reader = cpio::newc::Reader::new(&mut cursor).ok()?;
			if reader.entry().is_trailer() {
				return None;
			}
			let entry_name = reader.entry().name().trim_start_matches("./").to_owned();
			let mut data = Vec::new();
			std::io::Read::read_to_end(&mut reader, &mut data).ok()?;
			cursor = reader.finish().ok()?;
			if entry_name == name {
				return Some(data);
			}
		}
	}

	#[test]
	fn splice_cpio_replaces_existing_entry_and_appends_new_ones() {
		let original = build_test_cpio(&[("installer/flavors.json", b"{\"linux\":\"Standard\"}"), ("installer/other.txt", b"unchanged")]);

		let splices = vec![
			SpliceEntry { name: "installer/flavors.json".to_owned(), contents: b"{\"linux-mok\":\"MOK Secure Boot\"}".to_vec() },
			SpliceEntry { name: "installer/packages_mok.json".to_owned(), contents: b"{\"packages\":[]}".to_vec() },
		];
		let patched = splice_cpio(&original, splices).unwrap();

		assert_eq!(read_entry(&patched, "installer/flavors.json").unwrap(), b"{\"linux-mok\":\"MOK Secure Boot\"}");
		assert_eq!(read_entry(&patched, "installer/other.txt").unwrap(), b"unchanged");
		assert_eq!(read_entry(&patched, "installer/packages_mok.json").unwrap(), b"{\"packages\":[]}");
	}
}
