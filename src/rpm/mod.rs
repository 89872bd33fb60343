//! RPM Patcher: clones selected installer RPMs into
//! MOK-signed `*-mok` variants, preserving kernel-module signatures.

use std::path::{Path, PathBuf};

use crate::error::{PsbError, Result};

const MODULE_SIGNATURE_TRAILER: &[u8] = b"~Module signature appended~\n";

/// The three MOK RPM variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MokVariant {
	ShimSignedMok,
	GrubEfiImageMok,
	LinuxMok,
}

impl MokVariant {
	#[must_use]
	pub const fn provided_path(self) -> &'static str {
		match self {
			Self::ShimSignedMok => "/boot/efi/EFI/BOOT/bootx64.efi",
			Self::GrubEfiImageMok => "/boot/efi/EFI/BOOT/grubx64.efi",
			Self::LinuxMok => "/boot/vmlinuz",
		}
	}

	/// The pattern used to discover the original RPM providing this
	/// variant. Differs from [`Self::provided_path`] only for the kernel,
	/// whose installed path always carries a version suffix.
	#[must_use]
	pub const fn search_pattern(self) -> &'static str {
		match self {
			Self::LinuxMok => "/boot/vmlinuz-*",
			Self::ShimSignedMok | Self::GrubEfiImageMok => self.provided_path(),
		}
	}

	#[must_use]
	pub const fn original_name(self) -> &'static str {
		match self {
			Self::ShimSignedMok => "shim-signed",
			Self::GrubEfiImageMok => "grub2-efi-image",
			Self::LinuxMok => "linux",
		}
	}

	#[must_use]
	pub fn mok_name(self) -> String {
		format!("{}-mok", self.original_name())
	}
}

/// An entry in the `rpm -qlp` index used to discover which input RPM
/// provides a given installed file path.
pub struct RpmIndex {
	entries: Vec<(PathBuf, Vec<String>)>,
}

/// Builds a discovery index over every `*.rpm` under `candidates_dir`,
/// searched recursively so the installer's `RPMS/<arch>/*.rpm` layout is
/// picked up regardless of how many arch subdirectories it has.
///
/// # Errors
/// [`PsbError::ToolchainMissing`]/[`PsbError::ToolFailed`] if `rpm` is
/// unavailable or fails on a candidate file.
pub fn build_index(candidates_dir: &Path) -> Result<RpmIndex> {
	let pattern = candidates_dir.join("**").join("*.rpm");
	let mut entries = Vec::new();
	for entry in glob::glob(&pattern.to_string_lossy()).map_err(|e| PsbError::InputValidation(e.to_string()))? {
		let path = entry.map_err(|e| PsbError::InputValidation(e.to_string()))?;
		let path_str = path.to_string_lossy();
		let out = crate::util::run_tool("rpm", &[std::ffi::OsStr::new("-qlp"), std::ffi::OsStr::new(path_str.as_ref())])?;
		let files = String::from_utf8_lossy(&out).lines().map(str::to_owned).collect();
		entries.push((path, files));
	}
	Ok(RpmIndex { entries })
}

impl RpmIndex {
	/// Finds the original RPM providing `variant`'s path, matching by
	/// shell-glob semantics so `vmlinuz-*` resolves to a concrete kernel.
	///
	/// # Errors
	/// [`PsbError::OriginalMissing`] if no candidate RPM provides it.
	pub fn find(&self, variant: MokVariant) -> Result<&Path> {
		let wanted = variant.search_pattern();
		let wanted_glob = glob::Pattern::new(wanted).unwrap_or_else(|_| glob::Pattern::new("").expect("empty pattern is valid"));
		self.entries
			.iter()
			.find(|(_, files)| files.iter().any(|f| f == wanted || wanted_glob.matches(f) || glob_like(wanted, f)))
			.map(|(path, _)| path.as_path())
			.ok_or_else(|| PsbError::OriginalMissing { path: wanted.to_owned() })
	}

	/// The installed path of the original file `find` resolved for
	/// `variant`, matching the wildcard against its own file list (so the
	/// kernel's concrete versioned filename is recovered, not its pattern).
	///
	/// # Errors
	/// [`PsbError::OriginalMissing`] if no candidate RPM provides it.
	pub fn resolved_path(&self, variant: MokVariant) -> Result<&str> {
		let wanted = variant.search_pattern();
		let wanted_glob = glob::Pattern::new(wanted).unwrap_or_else(|_| glob::Pattern::new("").expect("empty pattern is valid"));
		self.entries
			.iter()
			.find_map(|(_, files)| files.iter().find(|f| f.as_str() == wanted || wanted_glob.matches(f) || glob_like(wanted, f)))
			.map(String::as_str)
			.ok_or_else(|| PsbError::OriginalMissing { path: wanted.to_owned() })
	}
}

fn glob_like(pattern: &str, candidate: &str) -> bool {
	match pattern.split_once('*') {
		Some((prefix, suffix)) => candidate.starts_with(prefix) && candidate.ends_with(suffix),
		None => pattern == candidate,
	}
}

/// Extracts an RPM's CPIO payload into `dest`, via `rpm2cpio | cpio -idmv`.
///
/// # Errors
/// [`PsbError::PayloadMismatch`] if extraction fails.
pub fn extract_payload(rpm: &Path, dest: &Path) -> Result<()> {
	std::fs::create_dir_all(dest)?;
	let cpio_bytes = rpm2cpio(rpm)?;
	let mut cursor = std::io::Cursor::new(cpio_bytes);

	let wrap_err = |e: std::io::Error| PsbError::PayloadMismatch { rpm: rpm.display().to_string(), reason: e.to_string() };

	loop {
		let mut reader = cpio::newc::Reader::new(&mut cursor).map_err(wrap_err)?;
		if reader.entry().is_trailer() {
			let _: &mut std::io::Cursor<Vec<u8>> = reader.finish().map_err(wrap_err)?;
			break;
		}

		let rel = reader.entry().name().trim_start_matches("./").trim_start_matches('/').to_owned();
		let is_dir = reader.entry().mode().0 & 0o170_000 == 0o040_000;

		if rel.is_empty() {
			let _: &mut std::io::Cursor<Vec<u8>> = reader.finish().map_err(wrap_err)?;
			continue;
		}
		let out_path = dest.join(&rel);
		if is_dir {
			std::fs::create_dir_all(&out_path)?;
			let _: &mut std::io::Cursor<Vec<u8>> = reader.finish().map_err(wrap_err)?;
		} else {
			if let Some(parent) = out_path.parent() {
				std::fs::create_dir_all(parent)?;
			}
			let mut data = Vec::new();
			std::io::Read::read_to_end(&mut reader, &mut data).map_err(wrap_err)?;
			std::fs::write(&out_path, &data)?;
			let _: &mut std::io::Cursor<Vec<u8>> = reader.finish().map_err(wrap_err)?;
		}
	}
	Ok(())
}

fn rpm2cpio(rpm: &Path) -> Result<Vec<u8>> {
	let rpm_str = rpm.to_string_lossy();
	crate::util::run_tool("rpm2cpio", &[std::ffi::OsStr::new(rpm_str.as_ref())])
}

/// The MOK-signed bytes available to overwrite a variant's extracted
/// payload with, keyed by variant so a mismatched pairing is a caller bug
/// caught at the `rewrite` call site rather than silently ignored.
pub enum ReplacementPayload<'a> {
	/// `shim-signed-mok`: the embedded SUSE shim plus MokManager, neither
	/// of which is MOK-signed (shim chains to the Microsoft CA; MokManager
	/// is shim's own trusted companion).
	ShimAndMokManager { shim: &'a [u8], mokmanager: &'a [u8] },
	/// `grub2-efi-image-mok`: the already MOK-signed GRUB stub.
	GrubStub { stub: &'a [u8] },
	/// `linux-mok`: a kernel image freshly signed with the MOK key.
	SignedKernel { vmlinuz: &'a [u8] },
}

/// Overwrites the file(s) `variant` provides within `payload_root` (an
/// already-extracted RPM payload) with `replacement`, returning the
/// `%files` entries the rebuilt RPM should declare.
///
/// # Errors
/// [`PsbError::PayloadMismatch`] if `replacement` doesn't match `variant`,
/// or if an expected original file (the kernel's versioned filename) isn't
/// present in the extracted payload.
pub fn rewrite(variant: MokVariant, payload_root: &Path, replacement: &ReplacementPayload<'_>) -> Result<Vec<String>> {
	let mismatch = || PsbError::PayloadMismatch { rpm: variant.mok_name(), reason: "replacement payload does not match variant".into() };

	match (variant, replacement) {
		(MokVariant::GrubEfiImageMok, ReplacementPayload::GrubStub { stub }) => {
			let rel = "boot/efi/EFI/BOOT/grubx64.efi";
			write_into_payload(payload_root, rel, stub)?;
			Ok(vec![format!("/{rel}")])
		}
		(MokVariant::ShimSignedMok, ReplacementPayload::ShimAndMokManager { shim, mokmanager }) => {
			let shim_rel = "boot/efi/EFI/BOOT/bootx64.efi";
			let mokmanager_rel = "boot/efi/EFI/BOOT/MokManager.efi";
			write_into_payload(payload_root, shim_rel, shim)?;
			write_into_payload(payload_root, mokmanager_rel, mokmanager)?;
			Ok(vec![format!("/{shim_rel}"), format!("/{mokmanager_rel}")])
		}
		(MokVariant::LinuxMok, ReplacementPayload::SignedKernel { vmlinuz }) => {
			let pattern = payload_root.join("boot/vmlinuz-*");
			let found = glob::glob(&pattern.to_string_lossy())
				.into_iter()
				.flatten()
				.flatten()
				.next()
				.ok_or_else(|| PsbError::PayloadMismatch { rpm: variant.mok_name(), reason: "no /boot/vmlinuz-* in extracted payload".into() })?;
			std::fs::write(&found, vmlinuz)?;
			let rel = found.strip_prefix(payload_root).unwrap_or(&found);
			Ok(vec![format!("/{}", rel.display())])
		}
		_ => Err(mismatch()),
	}
}

fn write_into_payload(payload_root: &Path, rel: &str, bytes: &[u8]) -> Result<()> {
	let dest = payload_root.join(rel);
	if let Some(parent) = dest.parent() {
		std::fs::create_dir_all(parent)?;
	}
	std::fs::write(&dest, bytes)?;
	Ok(())
}

/// Describes a single rebuilt `*-mok` RPM's manifest, for spec generation.
pub struct MokRpmPlan {
	pub variant: MokVariant,
	pub version: String,
	pub release: String,
	pub payload_root: PathBuf,
	pub files: Vec<String>,
}

/// Renders a minimal RPM spec for `plan`.
#[must_use]
pub fn render_spec(plan: &MokRpmPlan) -> String {
	let mut spec = String::new();
	spec.push_str(&format!("Name: {}\n", plan.variant.mok_name()));
	spec.push_str(&format!("Version: {}\n", plan.version));
	spec.push_str(&format!("Release: {}\n", plan.release));
	spec.push_str("Summary: MOK-signed variant for Secure Boot\n");
	spec.push_str("License: BSD\n");
	spec.push_str(&format!("Provides: {}\n", plan.variant.original_name()));
	spec.push_str(&format!("Conflicts: {}\n", plan.variant.original_name()));
	if matches!(plan.variant, MokVariant::LinuxMok) {
		spec.push_str("%define __strip /bin/true\n");
		spec.push_str("%define debug_package %{nil}\n");
	}
	spec.push_str("\n%description\nMOK Secure Boot variant produced by an automated rebuild.\n");
	spec.push_str("\n%files\n");
	for file in &plan.files {
		spec.push_str(file);
		spec.push('\n');
	}
	spec
}

/// Rebuilds an RPM from `plan`'s payload root and spec, via `rpmbuild`, and
/// optionally signs it with `gpg_home` when `sign` is set.
///
/// # Errors
/// Propagates [`PsbError::ToolFailed`] from `rpmbuild`/`rpmsign`.
pub fn rebuild(plan: &MokRpmPlan, spec_path: &Path, buildroot: &Path, out_dir: &Path, gpg_home: Option<&Path>) -> Result<PathBuf> {
	let spec_str = spec_path.to_string_lossy();
	let buildroot_arg = format!("_buildrootdir {}", buildroot.display());
	let topdir_arg = format!("_rpmdir {}", out_dir.display());
	crate::util::run_tool(
		"rpmbuild",
		&[
			std::ffi::OsStr::new("--define"),
			std::ffi::OsStr::new(&buildroot_arg),
			std::ffi::OsStr::new("--define"),
			std::ffi::OsStr::new(&topdir_arg),
			std::ffi::OsStr::new("-bb"),
			std::ffi::OsStr::new(spec_str.as_ref()),
		],
	)?;

	let built = locate_built_rpm(out_dir, &plan.variant.mok_name(), &plan.version, &plan.release)?;

	if let Some(home) = gpg_home {
		if matches!(plan.variant, MokVariant::LinuxMok) {
			verify_module_signatures(&plan.payload_root, plan.variant)?;
		}
		let home_arg = format!("--homedir={}", home.display());
		let built_str = built.to_string_lossy();
		crate::util::run_tool(
			"rpmsign",
			&[
				std::ffi::OsStr::new("--addsign"),
				std::ffi::OsStr::new(&home_arg),
				std::ffi::OsStr::new(built_str.as_ref()),
			],
		)?;
	} else if matches!(plan.variant, MokVariant::LinuxMok) {
		verify_module_signatures(&plan.payload_root, plan.variant)?;
	}

	Ok(built)
}

/// Finds the RPM `rpmbuild -bb` just produced under `out_dir`.
///
/// With `_rpmdir` defined, `rpmbuild` nests output under an arch
/// subdirectory (`noarch/`, `x86_64/`, ...) rather than writing flatly into
/// `out_dir`, so the final path has to be discovered rather than assumed.
///
/// # Errors
/// [`PsbError::ToolFailed`] if no matching RPM is found anywhere under
/// `out_dir`.
fn locate_built_rpm(out_dir: &Path, name: &str, version: &str, release: &str) -> Result<PathBuf> {
	let pattern = out_dir.join("**").join(format!("{name}-{version}-{release}*.rpm"));
	glob::glob(&pattern.to_string_lossy())
		.into_iter()
		.flatten()
		.flatten()
		.next()
		.ok_or_else(|| PsbError::ToolFailed {
			tool: "rpmbuild".into(),
			code: None,
			stderr: format!("no output RPM matching {name}-{version}-{release}*.rpm found under {}", out_dir.display()),
		})
}

/// Probes every `.ko` under `payload_root` for the kernel module signature
/// trailer, which stripping would otherwise destroy.
///
/// # Errors
/// [`PsbError::ModuleSignaturesLost`] if any `.ko` lacks the trailer.
fn verify_module_signatures(payload_root: &Path, variant: MokVariant) -> Result<()> {
	let pattern = payload_root.join("**/*.ko");
	for entry in glob::glob(&pattern.to_string_lossy()).into_iter().flatten().flatten() {
		let bytes = std::fs::read(&entry)?;
		let tail_len = MODULE_SIGNATURE_TRAILER.len();
		if bytes.len() < tail_len || &bytes[bytes.len() - tail_len..] != MODULE_SIGNATURE_TRAILER {
			return Err(PsbError::ModuleSignaturesLost { rpm: variant.mok_name() });
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mok_name_appends_suffix() {
		assert_eq!(MokVariant::LinuxMok.mok_name(), "linux-mok");
		assert_eq!(MokVariant::ShimSignedMok.mok_name(), "shim-signed-mok");
	}

	#[test]
	fn spec_for_linux_mok_disables_strip() {
		let plan = MokRpmPlan {
			variant: MokVariant::LinuxMok,
			version: "6.0.0".into(),
			release: "1mok".into(),
			payload_root: PathBuf::from("/tmp/payload"),
			files: vec!["/boot/vmlinuz-mok".into()],
		};
		let spec = render_spec(&plan);
		assert!(spec.contains("%define __strip /bin/true"));
		assert!(spec.contains("Conflicts: linux"));
	}

	#[test]
	fn spec_for_grub_stub_does_not_disable_strip() {
		let plan = MokRpmPlan {
			variant: MokVariant::GrubEfiImageMok,
			version: "1.0".into(),
			release: "1mok".into(),
			payload_root: PathBuf::from("/tmp/payload"),
			files: vec!["/boot/efi/EFI/BOOT/grubx64.efi".into()],
		};
		let spec = render_spec(&plan);
		assert!(!spec.contains("__strip"));
	}

	#[test]
	fn glob_like_matches_kernel_wildcard() {
		assert!(glob_like("/boot/vmlinuz-*", "/boot/vmlinuz-6.0.0-1.ph6"));
		assert!(!glob_like("/boot/vmlinuz-*", "/boot/initrd.img"));
	}

	#[test]
	fn index_find_rejects_missing_original() {
		let index = RpmIndex { entries: vec![(PathBuf::from("a.rpm"), vec!["/boot/initrd.img".into()])] };
		assert!(index.find(MokVariant::LinuxMok).is_err());
	}

	#[test]
	fn index_resolved_path_recovers_concrete_kernel_filename() {
		let index = RpmIndex {
			entries: vec![(PathBuf::from("kernel.rpm"), vec!["/boot/vmlinuz-6.1.0-1.ph6".into(), "/boot/System.map-6.1.0-1.ph6".into()])],
		};
		assert_eq!(index.resolved_path(MokVariant::LinuxMok).unwrap(), "/boot/vmlinuz-6.1.0-1.ph6");
	}

	#[test]
	fn rewrite_grub_stub_overwrites_payload_file() {
		let dir = std::env::temp_dir().join(format!("psb-test-grub-{}", std::process::id()));
		std::fs::create_dir_all(dir.join("boot/efi/EFI/BOOT")).unwrap();
		std::fs::write(dir.join("boot/efi/EFI/BOOT/grubx64.efi"), b"original stub").unwrap();

		let files = rewrite(MokVariant::GrubEfiImageMok, &dir, &ReplacementPayload::GrubStub { stub: b"signed stub" }).unwrap();
		assert_eq!(files, vec!["/boot/efi/EFI/BOOT/grubx64.efi".to_owned()]);
		assert_eq!(std::fs::read(dir.join("boot/efi/EFI/BOOT/grubx64.efi")).unwrap(), b"signed stub");

		std::fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn rewrite_shim_writes_both_shim_and_mokmanager() {
		let dir = std::env::temp_dir().join(format!("psb-test-shim-{}", std::process::id()));
		std::fs::create_dir_all(dir.join("boot/efi/EFI/BOOT")).unwrap();
		std::fs::write(dir.join("boot/efi/EFI/BOOT/bootx64.efi"), b"original shim").unwrap();

		let files = rewrite(
			MokVariant::ShimSignedMok,
			&dir,
			&ReplacementPayload::ShimAndMokManager { shim: b"suse shim", mokmanager: b"mokmanager" },
		)
		.unwrap();
		assert_eq!(files, vec!["/boot/efi/EFI/BOOT/bootx64.efi".to_owned(), "/boot/efi/EFI/BOOT/MokManager.efi".to_owned()]);
		assert_eq!(std::fs::read(dir.join("boot/efi/EFI/BOOT/bootx64.efi")).unwrap(), b"suse shim");
		assert_eq!(std::fs::read(dir.join("boot/efi/EFI/BOOT/MokManager.efi")).unwrap(), b"mokmanager");

		std::fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn rewrite_kernel_finds_versioned_vmlinuz() {
		let dir = std::env::temp_dir().join(format!("psb-test-kernel-{}", std::process::id()));
		std::fs::create_dir_all(dir.join("boot")).unwrap();
		std::fs::write(dir.join("boot/vmlinuz-6.1.0-1.ph6"), b"original kernel").unwrap();

		let files = rewrite(MokVariant::LinuxMok, &dir, &ReplacementPayload::SignedKernel { vmlinuz: b"signed kernel" }).unwrap();
		assert_eq!(files, vec!["/boot/vmlinuz-6.1.0-1.ph6".to_owned()]);
		assert_eq!(std::fs::read(dir.join("boot/vmlinuz-6.1.0-1.ph6")).unwrap(), b"signed kernel");

		std::fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn rewrite_rejects_mismatched_variant_and_payload() {
		let dir = std::env::temp_dir();
		let err = rewrite(MokVariant::GrubEfiImageMok, &dir, &ReplacementPayload::SignedKernel { vmlinuz: b"x" });
		assert!(err.is_err());
	}
}
