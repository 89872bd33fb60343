//! GRUB Stub Builder: assembles the minimal MOK-signed GRUB EFI application
//! that replaces shim's trust in upstream GRUB's `shim_lock` verifier with
//! trust in the MOK certificate instead.

use std::path::Path;

use crate::{
	error::{PsbError, Result},
	pe,
};

/// The module set every stub links.
const BASE_MODULES: &[&str] = &[
	"normal",
	"search",
	"search_fs_file",
	"search_fs_uuid",
	"search_label",
	"configfile",
	"chain",
	"linux",
	"initrd",
	"fat",
	"iso9660",
	"part_gpt",
	"part_msdos",
	"efi_gop",
	"gfxterm",
	"font",
	"loadenv",
	"echo",
	"test",
	"regexp",
];

/// Added iff `efuse_usb_mode` is enabled.
const USB_MODULES: &[&str] = &["usb", "usbms"];

const STUB_PREFIX: &str = "/EFI/BOOT";

/// Renders the embedded `grub.cfg` text for the requested variant.
///
/// Uses a standalone `tera::Tera` instance over the two templates compiled
/// into the binary (they are part of the crate's source, not user-supplied
/// files, so `include_str!` is preferred over runtime filesystem lookup).
pub fn render_config(owner: &str, efuse_usb_mode: bool) -> Result<String> {
	let mut tera = tera::Tera::default();
	tera.add_raw_template("grub.cfg", include_str!("../templates/grub.cfg.tera"))
		.map_err(|e| PsbError::StubAssemblyFailed { stderr: e.to_string() })?;
	tera.add_raw_template("grub-efuse.cfg", include_str!("../templates/grub-efuse.cfg.tera"))
		.map_err(|e| PsbError::StubAssemblyFailed { stderr: e.to_string() })?;

	let mut ctx = tera::Context::new();
	ctx.insert("owner", owner);

	let name = if efuse_usb_mode { "grub-efuse.cfg" } else { "grub.cfg" };
	tera.render(name, &ctx).map_err(|e| PsbError::StubAssemblyFailed { stderr: e.to_string() })
}

/// Assembles, validates, and MOK-signs the GRUB stub, writing the result to
/// `out_path`. Returns the SHA-256 of the signed stub so callers can place
/// byte-identical copies at `grub.efi`/`grubx64.efi` without re-signing.
///
/// # Errors
/// [`PsbError::ToolchainMissing`] if `grub2-mkimage` is absent,
/// [`PsbError::StubAssemblyFailed`] if it exits non-zero,
/// [`PsbError::StubContaminated`] if the emitted image still links
/// `shim_lock`, [`PsbError::SignFailed`] if MOK signing fails.
#[tracing::instrument(skip(mod_dir, mok_key, mok_cert))]
pub fn build(
	mod_dir: &Path,
	mok_key: &Path,
	mok_cert: &Path,
	owner: &str,
	efuse_usb_mode: bool,
	out_path: &Path,
) -> Result<()> {
	let scratch = crate::util::mkdtemp(&std::env::temp_dir(), "photon-sb-grubstub-")?;
	let cfg_text = render_config(owner, efuse_usb_mode)?;
	let cfg_path = scratch.path().join("grub.cfg");
	std::fs::write(&cfg_path, &cfg_text)?;

	let mut modules: Vec<&str> = BASE_MODULES.to_vec();
	if efuse_usb_mode {
		modules.extend_from_slice(USB_MODULES);
	}

	let unsigned_path = scratch.path().join("grub-unsigned.efi");
	let mod_dir_str = mod_dir.to_string_lossy();
	let cfg_str = cfg_path.to_string_lossy();
	let out_str = unsigned_path.to_string_lossy();

	let mut args: Vec<std::ffi::OsString> = vec![
		"--format=x86_64-efi".into(),
		"--prefix".into(),
		STUB_PREFIX.into(),
		"--directory".into(),
		mod_dir_str.as_ref().into(),
		"--config".into(),
		cfg_str.as_ref().into(),
		"--output".into(),
		out_str.as_ref().into(),
	];
	args.extend(modules.iter().map(std::ffi::OsString::from));
	let arg_refs: Vec<&std::ffi::OsStr> = args.iter().map(std::ffi::OsString::as_os_str).collect();

	crate::util::run_tool("grub2-mkimage", &arg_refs).map_err(|e| match e {
		PsbError::ToolchainMissing { tool } => PsbError::ToolchainMissing { tool },
		other => PsbError::StubAssemblyFailed { stderr: other.to_string() },
	})?;

	let unsigned_bytes = std::fs::read(&unsigned_path)?;
	let linked = pe::scan_module_names(&unsigned_bytes);
	if linked.iter().any(|m| m == "shim_lock") {
		return Err(PsbError::StubContaminated);
	}

	let sbat = pe::read_sbat_section(&unsigned_path)?
		.ok_or_else(|| PsbError::StubAssemblyFailed { stderr: "assembled stub carries no `.sbat` section".into() })?;
	if sbat.generation_of("grub").is_none() {
		return Err(PsbError::StubAssemblyFailed { stderr: "assembled stub `.sbat` section has no `grub` record".into() });
	}

	pe::sbsign(&unsigned_path, mok_key, mok_cert, out_path)?;
	pe::sbverify(out_path, mok_cert)?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn standard_config_contains_five_menu_entries() {
		let text = render_config("Photon OS", false).unwrap();
		assert_eq!(text.matches("menuentry").count(), 6);
		assert!(text.contains("set timeout=5"));
		assert!(!text.contains("EFUSE_SIM"));
	}

	#[test]
	fn efuse_config_gates_on_efuse_valid() {
		let text = render_config("Photon OS", true).unwrap();
		assert!(text.contains("EFUSE_SIM"));
		assert!(text.contains("efuse_valid"));
		assert!(text.contains("chainloader $prefix/grub.cfg"));
	}

	#[test]
	fn base_module_set_excludes_shim_lock() {
		assert!(!BASE_MODULES.contains(&"shim_lock"));
		assert!(BASE_MODULES.contains(&"configfile"));
	}
}
