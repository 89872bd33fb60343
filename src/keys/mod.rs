//! Key Manager: generates or loads the MOK keypair, the
//! kernel-module signing key, and (optionally) a GPG key; reports expiry.
//!
//! Policy is fixed and not configurable: existing keys under `dir` are never
//! regenerated, and expired keys are reported, never auto-rotated.

use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use rsa::{
	pkcs1::EncodeRsaPrivateKey,
	pkcs8::{EncodePrivateKey, LineEnding},
	RsaPrivateKey,
};
use time::{Duration, OffsetDateTime};

use crate::{
	error::{PsbError, Result},
};

/// A generated or loaded MOK keypair.
pub struct MokKeypair {
	pub key_path: PathBuf,
	pub crt_path: PathBuf,
	pub der_path: PathBuf,
	pub cert_pem: String,
}

/// Loads `MOK.key`/`MOK.crt`/`MOK.der` from `dir` if all three exist,
/// otherwise generates a fresh RSA keypair and self-signed `CN=<owner> MOK`
/// certificate and writes all three serializations.
///
/// # Errors
/// [`PsbError::KeyIo`] on filesystem failure, [`PsbError::KeyFormat`] if the
/// existing files are present but do not parse, or do not agree with each
/// other on key material.
#[tracing::instrument(skip(dir))]
pub fn ensure_mok(dir: &Path, bits: usize, days: u32, owner: &str) -> Result<MokKeypair> {
	let key_path = dir.join("MOK.key");
	let crt_path = dir.join("MOK.crt");
	let der_path = dir.join("MOK.der");

	if key_path.exists() && crt_path.exists() && der_path.exists() {
		return load_mok(&key_path, &crt_path, &der_path);
	}

	std::fs::create_dir_all(dir).map_err(|e| PsbError::KeyIo { path: dir.to_owned(), source: e })?;

	tracing::info!(bits, days, "generating new MOK keypair");
	let private_key = RsaPrivateKey::new(&mut OsRng, bits)
		.map_err(|e| PsbError::KeyFormat { path: key_path.clone(), reason: e.to_string() })?;

	let key_pem = private_key
		.to_pkcs8_pem(LineEnding::LF)
		.map_err(|e| PsbError::KeyFormat { path: key_path.clone(), reason: e.to_string() })?;

	let key_pair = rcgen::KeyPair::from_pem(&key_pem)
		.map_err(|e| PsbError::KeyFormat { path: key_path.clone(), reason: e.to_string() })?;

	let mut params = rcgen::CertificateParams::new(Vec::new())
		.map_err(|e| PsbError::KeyFormat { path: crt_path.clone(), reason: e.to_string() })?;
	params.distinguished_name = rcgen::DistinguishedName::new();
	params.distinguished_name.push(rcgen::DnType::CommonName, format!("{owner} MOK"));
	params.not_before = rcgen::date_time_ymd(2000, 1, 1);
	let not_after = OffsetDateTime::now_utc() + Duration::days(i64::from(days));
	params.not_after = not_after.into();
	params.is_ca = rcgen::IsCa::NoCa;
	params.key_usages = vec![rcgen::KeyUsagePurpose::DigitalSignature, rcgen::KeyUsagePurpose::KeyCertSign];

	let cert = params
		.self_signed(&key_pair)
		.map_err(|e| PsbError::KeyFormat { path: crt_path.clone(), reason: e.to_string() })?;

	let cert_pem = cert.pem();
	let cert_der = cert.der().to_vec();

	write_private(&key_path, key_pem.as_bytes())?;
	write_public(&crt_path, cert_pem.as_bytes())?;
	write_public(&der_path, &cert_der)?;

	Ok(MokKeypair { key_path, crt_path, der_path, cert_pem })
}

fn load_mok(key_path: &Path, crt_path: &Path, der_path: &Path) -> Result<MokKeypair> {
	let cert_pem = std::fs::read_to_string(crt_path).map_err(|e| PsbError::KeyIo { path: crt_path.to_owned(), source: e })?;
	let cert_der = std::fs::read(der_path).map_err(|e| PsbError::KeyIo { path: der_path.to_owned(), source: e })?;

	let (_, parsed_pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
		.map_err(|e| PsbError::KeyFormat { path: crt_path.to_owned(), reason: e.to_string() })?;
	parsed_pem
		.parse_x509()
		.map_err(|e| PsbError::KeyFormat { path: crt_path.to_owned(), reason: e.to_string() })?;

	if parsed_pem.contents != cert_der {
		return Err(PsbError::KeyFormat {
			path: der_path.to_owned(),
			reason: "DER certificate does not match PEM certificate".into(),
		});
	}

	tracing::debug!(path = %key_path.display(), "loaded existing MOK keypair");
	Ok(MokKeypair {
		key_path: key_path.to_owned(),
		crt_path: crt_path.to_owned(),
		der_path: der_path.to_owned(),
		cert_pem,
	})
}

/// Generates a separate 4096-bit RSA key for kernel-module signing and
/// writes it, concatenated with a self-signed cert, as a single PEM file —
/// the format the kernel build system's `sign-file` expects.
///
/// # Errors
/// [`PsbError::KeyIo`]/[`PsbError::KeyFormat`] as in [`ensure_mok`].
#[tracing::instrument(skip(dir))]
pub fn ensure_module_signing_key(dir: &Path) -> Result<PathBuf> {
	let pem_path = dir.join("kernel_module_signing.pem");
	if pem_path.exists() {
		return Ok(pem_path);
	}

	std::fs::create_dir_all(dir).map_err(|e| PsbError::KeyIo { path: dir.to_owned(), source: e })?;

	let private_key = RsaPrivateKey::new(&mut OsRng, 4096)
		.map_err(|e| PsbError::KeyFormat { path: pem_path.clone(), reason: e.to_string() })?;
	let key_pkcs1_pem = private_key
		.to_pkcs1_pem(LineEnding::LF)
		.map_err(|e| PsbError::KeyFormat { path: pem_path.clone(), reason: e.to_string() })?;
	let key_pkcs8_pem = private_key
		.to_pkcs8_pem(LineEnding::LF)
		.map_err(|e| PsbError::KeyFormat { path: pem_path.clone(), reason: e.to_string() })?;

	let key_pair = rcgen::KeyPair::from_pem(&key_pkcs8_pem)
		.map_err(|e| PsbError::KeyFormat { path: pem_path.clone(), reason: e.to_string() })?;
	let mut params = rcgen::CertificateParams::new(Vec::new())
		.map_err(|e| PsbError::KeyFormat { path: pem_path.clone(), reason: e.to_string() })?;
	params.distinguished_name = rcgen::DistinguishedName::new();
	params.distinguished_name.push(rcgen::DnType::CommonName, "Photon OS Module Signing");
	params.not_before = rcgen::date_time_ymd(2000, 1, 1);
	let not_after = OffsetDateTime::now_utc() + Duration::days(3650);
	params.not_after = not_after.into();
	let cert = params
		.self_signed(&key_pair)
		.map_err(|e| PsbError::KeyFormat { path: pem_path.clone(), reason: e.to_string() })?;

	let mut combined = key_pkcs1_pem.to_string();
	combined.push_str(&cert.pem());

	write_private(&pem_path, combined.as_bytes())?;
	Ok(pem_path)
}

/// Imports/generates a GPG key for RPM signing by delegating to the `gpg`
/// binary, into a process-local keyring directory under `dir/gnupg`.
///
/// # Errors
/// [`PsbError::ToolchainMissing`]/[`PsbError::ToolFailed`] if `gpg` is
/// missing or fails.
#[tracing::instrument(skip(dir))]
pub fn ensure_gpg_key(dir: &Path, uid: &str) -> Result<PathBuf> {
	let gnupg_home = dir.join("gnupg");
	std::fs::create_dir_all(&gnupg_home).map_err(|e| PsbError::KeyIo { path: gnupg_home.clone(), source: e })?;
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		std::fs::set_permissions(&gnupg_home, std::fs::Permissions::from_mode(0o700))
			.map_err(|e| PsbError::KeyIo { path: gnupg_home.clone(), source: e })?;
	}

	let home_arg = format!("--homedir={}", gnupg_home.display());
	let list = crate::util::run_tool(
		"gpg",
		&[std::ffi::OsStr::new(&home_arg), std::ffi::OsStr::new("--list-secret-keys"), std::ffi::OsStr::new(uid)],
	);
	if list.is_err() {
		let batch = format!(
			"%no-protection\nKey-Type: RSA\nKey-Length: 4096\nName-Real: {uid}\nExpire-Date: 0\n%commit\n"
		);
		let batch_path = gnupg_home.join("gen-key.batch");
		std::fs::write(&batch_path, batch).map_err(|e| PsbError::KeyIo { path: batch_path.clone(), source: e })?;
		let batch_arg = batch_path.to_string_lossy().into_owned();
		crate::util::run_tool(
			"gpg",
			&[
				std::ffi::OsStr::new(&home_arg),
				std::ffi::OsStr::new("--batch"),
				std::ffi::OsStr::new("--gen-key"),
				std::ffi::OsStr::new(&batch_arg),
			],
		)?;
	}

	Ok(gnupg_home)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ExpiryStatus {
	Ok,
	Warn,
	Expired,
}

#[derive(Debug, serde::Serialize)]
pub struct ExpiryReport {
	pub path: PathBuf,
	pub status: ExpiryStatus,
	pub days_remaining: i64,
}

/// Enumerates every `*.crt` under `dir`, parses its `notAfter`, and
/// classifies it relative to `warn_days`.
///
/// # Errors
/// Propagates glob/filesystem errors; a certificate that fails to parse is
/// reported inline as [`ExpiryStatus::Expired`] rather than aborting the
/// whole scan.
pub fn check_expiry(dir: &Path, warn_days: i64) -> Result<Vec<ExpiryReport>> {
	let pattern = dir.join("*.crt");
	let mut reports = Vec::new();
	for entry in glob::glob(&pattern.to_string_lossy()).map_err(|e| PsbError::InputValidation(e.to_string()))? {
		let path = entry.map_err(|e| PsbError::InputValidation(e.to_string()))?;
		let pem = std::fs::read_to_string(&path).map_err(|e| PsbError::KeyIo { path: path.clone(), source: e })?;
		let days_remaining = match x509_parser::pem::parse_x509_pem(pem.as_bytes())
			.ok()
			.and_then(|(_, p)| p.parse_x509().ok().map(|c| c.validity().time_to_expiration()))
		{
			Some(Some(dur)) => dur.whole_days(),
			_ => -1,
		};
		let status = if days_remaining < 0 {
			ExpiryStatus::Expired
		} else if days_remaining <= warn_days {
			ExpiryStatus::Warn
		} else {
			ExpiryStatus::Ok
		};
		reports.push(ExpiryReport { path, status, days_remaining });
	}
	Ok(reports)
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
	std::fs::write(path, bytes).map_err(|e| PsbError::KeyIo { path: path.to_owned(), source: e })?;
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
			.map_err(|e| PsbError::KeyIo { path: path.to_owned(), source: e })?;
	}
	Ok(())
}

fn write_public(path: &Path, bytes: &[u8]) -> Result<()> {
	std::fs::write(path, bytes).map_err(|e| PsbError::KeyIo { path: path.to_owned(), source: e })?;
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
			.map_err(|e| PsbError::KeyIo { path: path.to_owned(), source: e })?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generates_then_reloads_identical_mok() {
		let dir = tempfile::tempdir().unwrap();
		let first = ensure_mok(dir.path(), 2048, 30, "Test Vendor").unwrap();
		let second = ensure_mok(dir.path(), 2048, 30, "Test Vendor").unwrap();
		assert_eq!(first.cert_pem, second.cert_pem);
	}

	#[test]
	fn module_signing_key_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let first = ensure_module_signing_key(dir.path()).unwrap();
		let contents_before = std::fs::read(&first).unwrap();
		let second = ensure_module_signing_key(dir.path()).unwrap();
		assert_eq!(first, second);
		assert_eq!(contents_before, std::fs::read(&second).unwrap());
	}

	#[test]
	fn check_expiry_reports_freshly_generated_key_as_ok() {
		let dir = tempfile::tempdir().unwrap();
		ensure_mok(dir.path(), 2048, 180, "Test Vendor").unwrap();
		let reports = check_expiry(dir.path(), 30).unwrap();
		assert_eq!(reports.len(), 1);
		assert_eq!(reports[0].status, ExpiryStatus::Ok);
	}
}
