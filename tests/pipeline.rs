//! Integration coverage for the parts of the pipeline that don't require a
//! privileged loopback mount: RPM spec rendering, the initrd JSON edit
//! chain, and ISO volume-id handling, exercised at the data-transformation
//! level. Verifier's ISO-mounting checks need root and are left to a real
//! installer build. No real vendor ISO or Microsoft-signed shim is fetched
//! anywhere in this suite.

use photon_secureboot::{
	iso::{hybrid, initrd},
	rpm,
};
use serde_json::json;

/// Every MOK variant's derived RPM name is `<orig>-mok`, and its spec
/// `Conflicts:`/`Provides:` both reference the original capability, never
/// the `-mok` name.
#[test]
fn mok_rpm_spec_never_conflicts_with_itself() {
	for variant in [rpm::MokVariant::ShimSignedMok, rpm::MokVariant::GrubEfiImageMok, rpm::MokVariant::LinuxMok] {
		let plan = rpm::MokRpmPlan {
			variant,
			version: "1.0".into(),
			release: "1mok".into(),
			payload_root: std::env::temp_dir(),
			files: vec![variant.provided_path().to_owned()],
		};
		let spec = rpm::render_spec(&plan);
		assert!(spec.contains(&format!("Name: {}", variant.mok_name())));
		let original = variant.original_name();
		assert!(spec.contains(&format!("Provides: {original}")));
		assert!(spec.contains(&format!("Conflicts: {original}")));
		assert!(!spec.contains(&format!("Conflicts: {}", variant.mok_name())));
	}
}

/// Only `linux-mok` disables stripping; the other two variants must not,
/// since disabling strip is specifically the kernel-module-signature
/// preservation workaround.
#[test]
fn strip_is_disabled_only_for_linux_mok() {
	let linux_plan = rpm::MokRpmPlan {
		variant: rpm::MokVariant::LinuxMok,
		version: "6.0".into(),
		release: "1mok".into(),
		payload_root: std::env::temp_dir(),
		files: vec!["/boot/vmlinuz-mok".into()],
	};
	assert!(rpm::render_spec(&linux_plan).contains("%define __strip /bin/true"));

	for variant in [rpm::MokVariant::ShimSignedMok, rpm::MokVariant::GrubEfiImageMok] {
		let plan = rpm::MokRpmPlan {
			variant,
			version: "1.0".into(),
			release: "1mok".into(),
			payload_root: std::env::temp_dir(),
			files: vec![variant.provided_path().to_owned()],
		};
		assert!(!rpm::render_spec(&plan).contains("__strip"));
	}
}

/// The full chain of installer JSON edits, run together as a caller
/// would apply them.
#[test]
fn initrd_patch_chain_produces_expected_structure() {
	let minimal_deps = vec!["grub2-efi-image".to_owned(), "shim-signed".to_owned(), "linux".to_owned(), "photon-release".to_owned()];
	let packages_mok = initrd::build_packages_mok(&minimal_deps);
	let list: Vec<&str> = packages_mok["packages"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
	assert_eq!(list, vec!["grub2-efi-image-mok", "shim-signed-mok", "linux-mok", "photon-release"]);

	let original_options = json!({ "minimal": { "title": "1. Minimal Install" }, "full": { "title": "2. Full Install" } });
	let patched_options = initrd::patch_install_options(&original_options);
	let keys: Vec<&String> = patched_options.as_object().unwrap().keys().collect();
	assert_eq!(keys[0], "mok");
	assert_eq!(patched_options["mok"]["title"], json!("1. Photon MOK Secure Boot"));
	assert!(patched_options.get("minimal").is_some());
	assert!(patched_options.get("full").is_some());

	let flavor_table = initrd::patch_flavor_table(json!({ "linux": "Standard Install" }));
	assert_eq!(flavor_table["linux-mok"], json!("MOK Secure Boot"));
	assert_eq!(flavor_table["linux"], json!("Standard Install"));
}

/// Round-trips a synthetic gzip-wrapped initrd through unwrap/wrap,
/// checking the compression kind survives (the "outer format matches the
/// original" half of the `InitrdPatch` invariant).
#[test]
fn initrd_gzip_round_trips_detection() {
	use std::io::Write;
	let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
	encoder.write_all(b"fake cpio newc bytes").unwrap();
	let wrapped = encoder.finish().unwrap();

	let (inner, kind) = initrd::unwrap_initrd(&wrapped).unwrap();
	assert_eq!(kind, initrd::Compression::Gzip);
	assert_eq!(inner, b"fake cpio newc bytes");

	let rewrapped = initrd::wrap_initrd(&inner, kind).unwrap();
	let (roundtrip, _) = initrd::unwrap_initrd(&rewrapped).unwrap();
	assert_eq!(roundtrip, inner);
}

/// Volume-id truncation/fallback for the re-authored ISO.
#[test]
fn volume_id_contract() {
	assert_eq!(hybrid::volume_id(""), "PHOTON_SB");
	assert_eq!(hybrid::volume_id("PHOTON_5_0_X86_64").len(), "PHOTON_5_0_X86_64".len());
	assert_eq!(hybrid::volume_id(&"X".repeat(40)).len(), 32);
}
