//! Verifier: re-reads a produced ISO from scratch and asserts every
//! invariant of the boot chain. Trusts nothing held in memory from the
//! build that produced it.

use std::path::Path;

use serde::Serialize;

use crate::{
	error::Result,
	iso::{self, esp},
	pe, shim,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
	Ok,
	Warn,
	Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
	pub id: &'static str,
	pub label: String,
	pub status: Status,
	pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
	pub checks: Vec<CheckResult>,
}

impl VerifyReport {
	#[must_use]
	pub fn passed(&self) -> bool {
		self.checks.iter().all(|c| c.status != Status::Fail)
	}
}

fn ok(id: &'static str, label: &str) -> CheckResult {
	CheckResult { id, label: label.to_owned(), status: Status::Ok, detail: String::new() }
}

fn fail(id: &'static str, label: &str, detail: impl Into<String>) -> CheckResult {
	CheckResult { id, label: label.to_owned(), status: Status::Fail, detail: detail.into() }
}

fn warn(id: &'static str, label: &str, detail: impl Into<String>) -> CheckResult {
	CheckResult { id, label: label.to_owned(), status: Status::Warn, detail: detail.into() }
}

/// Mounts `iso_path` and runs every boot-chain check in parallel (each
/// check is independent and only reads the extracted tree).
///
/// # Errors
/// Propagates mount/extraction failure as [`crate::error::PsbError::IsoUnreadable`];
/// individual check failures are captured in the returned report, not as
/// a `Result` error.
pub fn verify(iso_path: &Path, mok_cert: &Path, expected_mok_rpms: &[String]) -> Result<VerifyReport> {
	let extract_dir = crate::util::mkdtemp(&std::env::temp_dir(), "photon-sb-verify-")?;
	let extracted = iso::extract(iso_path, extract_dir.path())?;

	let root = extracted.root.clone();
	let mok_cert = mok_cert.to_owned();
	let expected: Vec<String> = expected_mok_rpms.to_vec();

	let checks = std::thread::scope(|scope| {
		let handles = vec![
			scope.spawn({
				let root = root.clone();
				move || check_mokmanager_root(&root)
			}),
			scope.spawn({
				let root = root.clone();
				move || check_efi_boot_tree(&root)
			}),
			scope.spawn({
				let root = root.clone();
				move || check_shim_sbat_and_signer(&root)
			}),
			scope.spawn({
				let root = root.clone();
				let cert = mok_cert.clone();
				move || check_grub_signature(&root, &cert)
			}),
			scope.spawn({
				let root = root.clone();
				move || check_esp_dual_placement(&root)
			}),
			scope.spawn({
				let root = root.clone();
				let cert = mok_cert.clone();
				move || check_enrollment_cert(&root, &cert)
			}),
			scope.spawn({
				let root = root.clone();
				let expected = expected.clone();
				move || check_repodata(&root, &expected)
			}),
			scope.spawn({
				let root = root.clone();
				move || check_patched_initrd(&root)
			}),
		];
		handles.into_iter().map(|h| h.join().unwrap_or_else(|_| fail("panic", "check panicked", "worker thread panicked"))).collect()
	});

	Ok(VerifyReport { checks })
}

fn check_mokmanager_root(root: &Path) -> CheckResult {
	if root.join("MokManager.efi").is_file() {
		ok("root_mokmanager", "root-level MokManager.efi present")
	} else {
		fail("root_mokmanager", "root-level MokManager.efi present", "missing /MokManager.efi")
	}
}

fn check_efi_boot_tree(root: &Path) -> CheckResult {
	let required = ["BOOTX64.EFI", "grub.efi", "grubx64.efi", "MokManager.efi"];
	let missing: Vec<&str> = required.iter().filter(|f| !root.join("EFI/BOOT").join(f).is_file()).copied().collect();
	if missing.is_empty() {
		ok("efi_boot_tree", "/EFI/BOOT required files present")
	} else {
		fail("efi_boot_tree", "/EFI/BOOT required files present", format!("missing: {}", missing.join(", ")))
	}
}

fn check_shim_sbat_and_signer(root: &Path) -> CheckResult {
	let shim_path = root.join("EFI/BOOT/BOOTX64.EFI");
	match pe::read_sbat_section(&shim_path) {
		Ok(Some(sbat)) => match sbat.generation_of("shim") {
			Some(gen) if gen >= 4 => match pe::list_signers(&shim_path) {
				Ok(signers) if signers.iter().any(|s| s.issuer.contains("Microsoft Corporation UEFI CA 2011")) => {
					ok("shim_sbat_signer", "BOOTX64.EFI SBAT + Microsoft signer")
				}
				Ok(_) => fail("shim_sbat_signer", "BOOTX64.EFI SBAT + Microsoft signer", "no Microsoft signer chain"),
				Err(e) => fail("shim_sbat_signer", "BOOTX64.EFI SBAT + Microsoft signer", e.to_string()),
			},
			other => fail("shim_sbat_signer", "BOOTX64.EFI SBAT + Microsoft signer", format!("shim SBAT generation {other:?} < 4")),
		},
		Ok(None) => fail("shim_sbat_signer", "BOOTX64.EFI SBAT + Microsoft signer", "no `.sbat` section"),
		Err(e) => fail("shim_sbat_signer", "BOOTX64.EFI SBAT + Microsoft signer", e.to_string()),
	}
}

fn check_grub_signature(root: &Path, mok_cert: &Path) -> CheckResult {
	let grub_path = root.join("EFI/BOOT/grub.efi");
	match pe::sbverify(&grub_path, mok_cert) {
		Ok(()) => ok("grub_signature", "grub.efi verifies against MOK certificate"),
		Err(e) => fail("grub_signature", "grub.efi verifies against MOK certificate", e.to_string()),
	}
}

fn check_esp_dual_placement(root: &Path) -> CheckResult {
	let esp_image = root.join("boot/grub2/efiboot.img");
	if !esp_image.is_file() {
		return fail("esp_dual_placement", "efiboot.img byte-identical to ISO-root copies", "missing efiboot.img");
	}
	let pairs = [
		("/EFI/BOOT/BOOTX64.EFI", "EFI/BOOT/BOOTX64.EFI"),
		("/EFI/BOOT/grub.efi", "EFI/BOOT/grub.efi"),
		("/EFI/BOOT/grubx64.efi", "EFI/BOOT/grubx64.efi"),
		("/MokManager.efi", "MokManager.efi"),
		("/ENROLL_THIS_KEY_IN_MOKMANAGER.cer", "ENROLL_THIS_KEY_IN_MOKMANAGER.cer"),
	];
	let esp_paths: Vec<&str> = pairs.iter().map(|(esp, _)| *esp).collect();
	let read = match esp::read_back(&esp_image, &esp_paths) {
		Ok(r) => r,
		Err(e) => return fail("esp_dual_placement", "efiboot.img byte-identical to ISO-root copies", e.to_string()),
	};
	for ((esp_path, iso_rel), (_, esp_bytes)) in pairs.iter().zip(read.iter()) {
		let iso_bytes = match std::fs::read(root.join(iso_rel)) {
			Ok(b) => b,
			Err(e) => return fail("esp_dual_placement", "efiboot.img byte-identical to ISO-root copies", format!("{iso_rel}: {e}")),
		};
		if &iso_bytes != esp_bytes {
			return fail(
				"esp_dual_placement",
				"efiboot.img byte-identical to ISO-root copies",
				format!("{esp_path} differs between ESP and ISO root"),
			);
		}
	}
	ok("esp_dual_placement", "efiboot.img byte-identical to ISO-root copies")
}

fn check_enrollment_cert(root: &Path, mok_cert: &Path) -> CheckResult {
	let cer_path = root.join("ENROLL_THIS_KEY_IN_MOKMANAGER.cer");
	let Ok(cer_bytes) = std::fs::read(&cer_path) else {
		return fail("enrollment_cert", "enrollment cert matches MOK cert", "missing or unreadable .cer");
	};
	if x509_parser::parse_x509_certificate(&cer_bytes).is_err() {
		return fail("enrollment_cert", "enrollment cert matches MOK cert", "does not parse as DER X.509");
	}
	let Ok(cert_pem) = std::fs::read_to_string(mok_cert) else {
		return fail("enrollment_cert", "enrollment cert matches MOK cert", "cannot read MOK.crt for comparison");
	};
	match x509_parser::pem::parse_x509_pem(cert_pem.as_bytes()) {
		Ok((_, pem)) if pem.contents == cer_bytes => ok("enrollment_cert", "enrollment cert matches MOK cert"),
		Ok(_) => fail("enrollment_cert", "enrollment cert matches MOK cert", "DER content differs from MOK.crt"),
		Err(e) => fail("enrollment_cert", "enrollment cert matches MOK cert", e.to_string()),
	}
}

fn check_repodata(root: &Path, expected_mok_rpms: &[String]) -> CheckResult {
	let repomd = root.join("RPMS").read_dir().ok().and_then(|mut dirs| dirs.find_map(std::result::Result::ok)).map(|arch_dir| arch_dir.path().join("repodata/repomd.xml"));
	let Some(repomd) = repomd else {
		return fail("repodata", "repomd.xml lists every expected MOK RPM", "no /RPMS/<arch>/repodata/repomd.xml found");
	};
	let Ok(contents) = std::fs::read_to_string(&repomd) else {
		return fail("repodata", "repomd.xml lists every expected MOK RPM", format!("cannot read {}", repomd.display()));
	};
	let missing: Vec<&String> = expected_mok_rpms.iter().filter(|name| !contents.contains(name.as_str())).collect();
	if missing.is_empty() {
		ok("repodata", "repomd.xml lists every expected MOK RPM")
	} else {
		fail("repodata", "repomd.xml lists every expected MOK RPM", format!("missing: {:?}", missing))
	}
}

fn check_patched_initrd(root: &Path) -> CheckResult {
	let initrd_path = root.join("isolinux/initrd.img");
	let Ok(raw) = std::fs::read(&initrd_path) else {
		return fail("patched_initrd", "patched initrd contents", "missing /isolinux/initrd.img");
	};
	let Ok((cpio_bytes, _)) = iso::initrd::unwrap_initrd(&raw) else {
		return fail("patched_initrd", "patched initrd contents", "could not unwrap initrd compression");
	};
	let has_packages_mok = find_in_cpio(&cpio_bytes, "installer/packages_mok.json").is_some();
	let options_bytes = find_in_cpio(&cpio_bytes, "installer/build_install_options_all.json");
	let starts_with_mok = options_bytes
		.and_then(|b| serde_json::from_slice::<serde_json::Value>(&b).ok())
		.and_then(|v| v.as_object().and_then(|m| m.keys().next().cloned()))
		.is_some_and(|first_key| first_key == "mok");

	if has_packages_mok && starts_with_mok {
		ok("patched_initrd", "patched initrd contents")
	} else {
		fail("patched_initrd", "patched initrd contents", "packages_mok.json missing or `mok` is not the first install option")
	}
}

fn find_in_cpio(cpio_bytes: &[u8], wanted: &str) -> Option<Vec<u8>> {
	let mut cursor = std::io::Cursor::new(cpio_bytes);
	loop {
		let mut reader = cpio::newc::Reader::new(&mut cursor).ok()?;
		if reader.entry().is_trailer() {
			return None;
		}
		let name = reader.entry().name().trim_start_matches("./").to_owned();
		if name == wanted {
			let mut data = Vec::new();
			std::io::Read::read_to_end(&mut reader, &mut data).ok()?;
			return Some(data);
		}
		cursor = reader.finish().ok()?;
	}
}

/// Runs the same checks against an arbitrary ISO, for the `diagnose`
/// command surface entry — identical to [`verify`] but does not assume the
/// ISO was produced by this pipeline (`expected_mok_rpms` may be empty).
pub fn diagnose(iso_path: &Path, mok_cert: Option<&Path>) -> Result<VerifyReport> {
	let placeholder_cert;
	let cert = match mok_cert {
		Some(c) => c,
		None => {
			placeholder_cert = crate::util::mkdtemp(&std::env::temp_dir(), "photon-sb-diagnose-")?.path().join("absent.crt");
			&placeholder_cert
		}
	};
	verify(iso_path, cert, &[])
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn report_fails_if_any_check_fails() {
		let report = VerifyReport {
			checks: vec![ok("a", "a"), fail("b", "b", "broken"), warn("c", "c", "meh")],
		};
		assert!(!report.passed());
	}

	#[test]
	fn report_passes_with_only_warnings() {
		let report = VerifyReport { checks: vec![ok("a", "a"), warn("c", "c", "meh")] };
		assert!(report.passed());
	}
}
