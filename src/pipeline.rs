//! Top-level build orchestration: drives Key Manager → (Shim Provider,
//! GRUB Stub Builder) → RPM Patcher → ISO Rewriter → Verifier in a fixed
//! stage order.

use std::{
	path::{Path, PathBuf},
	sync::mpsc,
};

use crate::{
	config::BuildConfig,
	error::{PsbError, Result},
	history::{self, MokHistoryEntry},
	iso, keys, pe, rpm, shim, util::CancelToken, verify::VerifyReport,
};

/// Result of a full `build-iso` run.
pub struct BuildOutcome {
	pub output_iso: PathBuf,
	pub verify_report: VerifyReport,
}

/// A pidfile-backed guard giving this process exclusive ownership of the
/// scratch root.
struct ScratchLock {
	pidfile: PathBuf,
}

impl ScratchLock {
	fn acquire(scratch_root: &Path) -> Result<Self> {
		std::fs::create_dir_all(scratch_root)?;
		let pidfile = scratch_root.join(".photon-sb.pid");
		if let Ok(existing) = std::fs::read_to_string(&pidfile) {
			if let Ok(pid) = existing.trim().parse::<i32>() {
				if process_alive(pid) {
					return Err(PsbError::IsoWriteFailed {
						path: scratch_root.to_owned(),
						reason: format!("scratch root locked by running pid {pid}"),
					});
				}
			}
		}
		std::fs::write(&pidfile, std::process::id().to_string())?;
		Ok(Self { pidfile })
	}
}

impl Drop for ScratchLock {
	fn drop(&mut self) {
		let _ = std::fs::remove_file(&self.pidfile);
	}
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
	nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
	false
}

/// Runs the full `build-iso` pipeline against `cfg`.
///
/// # Errors
/// Any stage's [`PsbError`] short-circuits the pipeline; the scratch root
/// is torn down via RAII regardless of where the failure occurred.
#[tracing::instrument(skip(cfg, cancel))]
pub fn rebuild(cfg: &BuildConfig, mod_dir: &Path, scratch_root: &Path, cancel: &CancelToken) -> Result<BuildOutcome> {
	cfg.validate()?;
	let _lock = ScratchLock::acquire(scratch_root)?;

	let input_iso = match &cfg.input_iso {
		Some(p) => p.clone(),
		None => crate::config::discover_input_iso(&std::env::current_dir()?)?,
	};
	let input_sha256 = crate::util::sha256_file(&input_iso)?;

	check_cancel(cancel)?;
	tracing::info!("stage: key manager");
	let mok = keys::ensure_mok(&cfg.keys_dir, cfg.key_bits.bits(), cfg.mok_days, &cfg.owner)?;
	keys::ensure_module_signing_key(&cfg.keys_dir)?;
	let gpg_home = if cfg.rpm_signing { Some(keys::ensure_gpg_key(&cfg.keys_dir, &cfg.owner)?) } else { None };

	check_cancel(cancel)?;
	tracing::info!("stage: shim provider");
	let shim_scratch = crate::util::mkdtemp(scratch_root, "shim-validate-")?;
	let (shim_blob, mokmanager_blob) = shim::load_embedded()?;
	shim::validate(&shim_blob, &shim_scratch.path().join("shim.efi"))?;

	check_cancel(cancel)?;
	tracing::info!("stage: grub stub builder");
	let stub_path = cfg.grub_stub_cache_path();
	grubstub_build(mod_dir, &mok, &cfg.owner, cfg.efuse_usb_mode, &stub_path)?;
	let stub_bytes = std::fs::read(&stub_path)?;

	check_cancel(cancel)?;
	tracing::info!("stage: iso rewriter (extract)");
	let extract_dir = scratch_root.join("extracted");
	let extracted = iso::extract(&input_iso, &extract_dir)?;

	check_cancel(cancel)?;
	tracing::info!("stage: rpm patcher");
	let rpms_dir = extracted.root.join("RPMS");
	let rpm_index = rpm::build_index(&rpms_dir)?;
	let artifacts = SignedArtifacts {
		mok_key: mok.key_path.clone(),
		mok_cert: mok.crt_path.clone(),
		stub_bytes: stub_bytes.clone(),
		shim_bytes: shim_blob.bytes.clone(),
		mokmanager_bytes: mokmanager_blob.bytes.clone(),
	};
	let mok_rpms = patch_rpms(scratch_root, &rpm_index, &artifacts, gpg_home.as_deref(), cancel)?;

	check_cancel(cancel)?;
	tracing::info!("stage: iso rewriter");
	let cert_der = std::fs::read(&mok.der_path)?;
	let grub_cfg_text = crate::grubstub::render_config(&cfg.owner, cfg.efuse_usb_mode)?;
	let grub_cfg_bytes = grub_cfg_text.into_bytes();

	let mut dual_placed: Vec<(Vec<u8>, &str, &str)> = vec![
		(shim_blob.bytes.clone(), "/EFI/BOOT/BOOTX64.EFI", "EFI/BOOT/BOOTX64.EFI"),
		(stub_bytes.clone(), "/EFI/BOOT/grub.efi", "EFI/BOOT/grub.efi"),
		(stub_bytes.clone(), "/EFI/BOOT/grubx64.efi", "EFI/BOOT/grubx64.efi"),
		(mokmanager_blob.bytes.clone(), "/EFI/BOOT/MokManager.efi", "EFI/BOOT/MokManager.efi"),
		(mokmanager_blob.bytes.clone(), "/MokManager.efi", "MokManager.efi"),
		(cert_der.clone(), "/ENROLL_THIS_KEY_IN_MOKMANAGER.cer", "ENROLL_THIS_KEY_IN_MOKMANAGER.cer"),
		(cert_der.clone(), "/EFI/BOOT/ENROLL_THIS_KEY_IN_MOKMANAGER.cer", "EFI/BOOT/ENROLL_THIS_KEY_IN_MOKMANAGER.cer"),
		(grub_cfg_bytes.clone(), "/EFI/BOOT/grub.cfg", "EFI/BOOT/grub.cfg"),
		(grub_cfg_bytes, "/grub/grub.cfg", "grub/grub.cfg"),
	];
	if let Some(original_grub) = &extracted.original_grub {
		let original_bytes = std::fs::read(original_grub)?;
		dual_placed.push((original_bytes, "/EFI/BOOT/grubx64_real.efi", "EFI/BOOT/grubx64_real.efi"));
	}

	let esp_image = extracted.root.join("boot/grub2/efiboot.img");
	iso::esp::allocate(&esp_image, iso::esp::ESP_SIZE_BYTES, iso::esp::ESP_LABEL)?;
	let placed: Vec<iso::esp::PlacedFile<'_>> =
		dual_placed.iter().map(|(bytes, esp_path, iso_path)| iso::esp::PlacedFile { bytes, esp_path, iso_path }).collect();
	iso::esp::populate(&esp_image, &placed)?;
	for (bytes, _, iso_path) in &dual_placed {
		let dest = extracted.root.join(iso_path);
		if let Some(parent) = dest.parent() {
			std::fs::create_dir_all(parent)?;
		}
		std::fs::write(&dest, bytes)?;
	}

	patch_installer_initrd(cfg, &extracted.root)?;
	if let Some(signed_kernel) = mok_rpms.iter().find_map(|r| r.signed_kernel.as_ref()) {
		std::fs::write(extracted.root.join("isolinux/vmlinuz"), signed_kernel)?;
	}

	let arch_dir = rpms_arch_dir(&rpms_dir)?;
	for built in &mok_rpms {
		let file_name = built.built_path.file_name().ok_or_else(|| PsbError::IsoWriteFailed {
			path: built.built_path.clone(),
			reason: "rpmbuild output has no file name".into(),
		})?;
		std::fs::copy(&built.built_path, arch_dir.join(file_name))?;
	}
	iso::regenerate_repodata(&arch_dir)?;

	let mbr = scratch_root.join("isohdpfx.bin");
	iso::hybrid::author(&extracted.root, &cfg.output_iso, &extracted.volume_id, &mbr, cfg.source_date_epoch)?;

	check_cancel(cancel)?;
	tracing::info!("stage: verifier");
	let mok_rpm_names: Vec<String> = mok_rpms.iter().map(|r| r.name.clone()).collect();
	let report = crate::verify::verify(&cfg.output_iso, &mok.crt_path, &mok_rpm_names)?;
	if !report.passed() {
		return Err(PsbError::VerifyFailed {
			check: "post-build".into(),
			detail: format!("{} check(s) failed", report.checks.iter().filter(|c| c.status == crate::verify::Status::Fail).count()),
		});
	}

	let output_sha256 = crate::util::sha256_file(&cfg.output_iso)?;
	let mok_fingerprint = crate::util::sha256_file(&mok.der_path)?;
	history::append(
		&cfg.history_path(),
		&MokHistoryEntry {
			timestamp: cfg.source_date_epoch.unwrap_or_default(),
			input_sha256,
			output_sha256,
			mok_fingerprint,
			tool_versions: history::capture_tool_versions(),
		},
	)?;

	let _ = mokmanager_blob;
	Ok(BuildOutcome { output_iso: cfg.output_iso.clone(), verify_report: report })
}

fn grubstub_build(mod_dir: &Path, mok: &keys::MokKeypair, owner: &str, efuse_usb_mode: bool, out_path: &Path) -> Result<()> {
	crate::grubstub::build(mod_dir, &mok.key_path, &mok.crt_path, owner, efuse_usb_mode, out_path)
}

/// Phase C: applies `InitrdPatch`'s three JSON edits to the installer's
/// `/isolinux/initrd.img`, re-splicing the edited files into the archive
/// without disturbing its outer compression.
fn patch_installer_initrd(cfg: &BuildConfig, iso_root: &Path) -> Result<()> {
	let initrd_path = iso_root.join("isolinux/initrd.img");
	let raw = std::fs::read(&initrd_path)?;
	let (cpio_bytes, kind) = iso::initrd::unwrap_initrd(&raw)?;

	let minimal_deps = read_minimal_deps(&cpio_bytes)?;
	let packages_mok = iso::initrd::build_packages_mok(&minimal_deps);

	let install_options = read_json_entry(&cpio_bytes, "installer/build_install_options_all.json")?.unwrap_or_else(|| serde_json::json!({}));
	let patched_options = iso::initrd::patch_install_options(&install_options);

	let flavor_table = read_json_entry(&cpio_bytes, "installer/flavors.json")?.unwrap_or_else(|| serde_json::json!({}));
	let patched_flavors = iso::initrd::patch_flavor_table(flavor_table);

	let splices = vec![
		iso::initrd::SpliceEntry { name: "installer/packages_mok.json".into(), contents: to_json_bytes(&packages_mok)? },
		iso::initrd::SpliceEntry { name: "installer/build_install_options_all.json".into(), contents: to_json_bytes(&patched_options)? },
		iso::initrd::SpliceEntry { name: "installer/flavors.json".into(), contents: to_json_bytes(&patched_flavors)? },
	];
	let patched_cpio = iso::initrd::splice_cpio(&cpio_bytes, splices)?;
	let repacked = iso::initrd::wrap_initrd(&patched_cpio, kind)?;
	std::fs::write(&initrd_path, repacked)?;

	let _ = cfg;
	Ok(())
}

fn read_minimal_deps(cpio_bytes: &[u8]) -> Result<Vec<String>> {
	let value = read_json_entry(cpio_bytes, "installer/packages_minimal.json")?.unwrap_or_else(|| serde_json::json!({ "packages": [] }));
	Ok(value["packages"].as_array().map_or_else(Vec::new, |arr| arr.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect()))
}

fn read_json_entry(cpio_bytes: &[u8], name: &str) -> Result<Option<serde_json::Value>> {
	let wrap = |e: std::io::Error| PsbError::IsoUnreadable { path: name.into(), reason: e.to_string() };
	let mut cursor = std::io::Cursor::new(cpio_bytes);
	loop {
		let mut reader = cpio::newc::Reader::new(&mut cursor).map_err(wrap)?;
		if reader.entry().is_trailer() {
			let _: &mut std::io::Cursor<&[u8]> = reader.finish().map_err(wrap)?;
			return Ok(None);
		}
		let entry_name = reader.entry().name().trim_start_matches("./").to_owned();
		let mut data = Vec::new();
		std::io::Read::read_to_end(&mut reader, &mut data).map_err(wrap)?;
		cursor = reader.finish().map_err(wrap)?;
		if entry_name == name {
			let value = serde_json::from_slice(&data)
				.map_err(|e| PsbError::IsoUnreadable { path: name.into(), reason: e.to_string() })?;
			return Ok(Some(value));
		}
	}
}

fn to_json_bytes(value: &serde_json::Value) -> Result<Vec<u8>> {
	serde_json::to_vec_pretty(value).map_err(|e| PsbError::IsoWriteFailed { path: "initrd.img (json)".into(), reason: e.to_string() })
}

/// MOK key material and MOK-signed/embedded bytes every RPM-patching
/// worker needs to overwrite a payload with.
#[derive(Clone)]
struct SignedArtifacts {
	mok_key: PathBuf,
	mok_cert: PathBuf,
	stub_bytes: Vec<u8>,
	shim_bytes: Vec<u8>,
	mokmanager_bytes: Vec<u8>,
}

/// One rebuilt `*-mok` RPM: its declared name, the path `rpmbuild` wrote it
/// to, and (`linux-mok` only) the signed kernel bytes the ISO rewriter also
/// copies to `/isolinux/vmlinuz`.
struct MokRpmResult {
	name: String,
	built_path: PathBuf,
	signed_kernel: Option<Vec<u8>>,
}

/// Processes the three MOK RPM variants with a worker pool sized to
/// `min(3, available cores)`; each worker owns a disjoint scratch dir.
fn patch_rpms(
	scratch_root: &Path,
	index: &rpm::RpmIndex,
	artifacts: &SignedArtifacts,
	gpg_home: Option<&Path>,
	cancel: &CancelToken,
) -> Result<Vec<MokRpmResult>> {
	let variants = [rpm::MokVariant::ShimSignedMok, rpm::MokVariant::GrubEfiImageMok, rpm::MokVariant::LinuxMok];
	let workers = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get).min(3);

	let (job_tx, job_rx) = mpsc::channel::<rpm::MokVariant>();
	let (result_tx, result_rx) = mpsc::channel::<Result<MokRpmResult>>();
	let job_rx = std::sync::Arc::new(std::sync::Mutex::new(job_rx));

	std::thread::scope(|scope| {
		for worker_id in 0..workers {
			let job_rx = std::sync::Arc::clone(&job_rx);
			let result_tx = result_tx.clone();
			let scratch_root = scratch_root.to_owned();
			let gpg_home = gpg_home.map(Path::to_owned);
			let cancel = cancel.clone();
			let artifacts = artifacts.clone();
			scope.spawn(move || {
				loop {
					let variant = {
						let rx = job_rx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
						rx.recv()
					};
					let Ok(variant) = variant else { break };
					if cancel.is_cancelled() {
						let _ = result_tx.send(Err(PsbError::InputValidation("build cancelled".into())));
						continue;
					}
					let worker_scratch = scratch_root.join(format!("rpm-worker-{worker_id}"));
					let outcome = patch_one_rpm(variant, index, &worker_scratch, gpg_home.as_deref(), &artifacts);
					let _ = result_tx.send(outcome);
				}
			});
		}
		drop(result_tx);
		for variant in variants {
			let _ = job_tx.send(variant);
		}
		drop(job_tx);
	});

	let mut results = Vec::new();
	for result in result_rx {
		results.push(result?);
	}
	Ok(results)
}

fn patch_one_rpm(
	variant: rpm::MokVariant,
	index: &rpm::RpmIndex,
	scratch: &Path,
	gpg_home: Option<&Path>,
	artifacts: &SignedArtifacts,
) -> Result<MokRpmResult> {
	let original = index.find(variant)?;
	std::fs::create_dir_all(scratch)?;
	let payload_root = scratch.join("payload");
	rpm::extract_payload(original, &payload_root)?;

	let mut signed_kernel = None;
	let files = match variant {
		rpm::MokVariant::GrubEfiImageMok => {
			rpm::rewrite(variant, &payload_root, &rpm::ReplacementPayload::GrubStub { stub: &artifacts.stub_bytes })?
		}
		rpm::MokVariant::ShimSignedMok => rpm::rewrite(
			variant,
			&payload_root,
			&rpm::ReplacementPayload::ShimAndMokManager { shim: &artifacts.shim_bytes, mokmanager: &artifacts.mokmanager_bytes },
		)?,
		rpm::MokVariant::LinuxMok => {
			let resolved = index.resolved_path(variant)?;
			let original_kernel = payload_root.join(resolved.trim_start_matches('/'));
			let signed_path = scratch.join("vmlinuz.signed");
			pe::sbsign(&original_kernel, &artifacts.mok_key, &artifacts.mok_cert, &signed_path)?;
			let bytes = std::fs::read(&signed_path)?;
			let files = rpm::rewrite(variant, &payload_root, &rpm::ReplacementPayload::SignedKernel { vmlinuz: &bytes })?;
			signed_kernel = Some(bytes);
			files
		}
	};

	let plan = rpm::MokRpmPlan { variant, version: "1.0".into(), release: "1mok".into(), payload_root: payload_root.clone(), files };
	let spec_text = rpm::render_spec(&plan);
	let spec_path = scratch.join(format!("{}.spec", variant.mok_name()));
	std::fs::write(&spec_path, spec_text)?;

	let out_dir = scratch.join("RPMS");
	std::fs::create_dir_all(&out_dir)?;
	let built_path = rpm::rebuild(&plan, &spec_path, &payload_root, &out_dir, gpg_home)?;

	Ok(MokRpmResult { name: plan.variant.mok_name(), built_path, signed_kernel })
}

/// The single `/RPMS/<arch>/` directory an extracted installer ISO carries,
/// where both original and MOK RPMs must live for `createrepo_c` to index.
///
/// # Errors
/// [`PsbError::IsoUnreadable`] if `rpms_dir` has no subdirectory.
fn rpms_arch_dir(rpms_dir: &Path) -> Result<PathBuf> {
	std::fs::read_dir(rpms_dir)
		.map_err(|e| PsbError::IsoUnreadable { path: rpms_dir.to_owned(), reason: e.to_string() })?
		.filter_map(std::result::Result::ok)
		.find(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
		.map(|entry| entry.path())
		.ok_or_else(|| PsbError::IsoUnreadable { path: rpms_dir.to_owned(), reason: "no arch subdirectory under RPMS".into() })
}

fn check_cancel(cancel: &CancelToken) -> Result<()> {
	if cancel.is_cancelled() {
		return Err(PsbError::InputValidation("build cancelled".into()));
	}
	Ok(())
}
