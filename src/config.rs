//! Pipeline-wide configuration. Following design note §9 ("Global state →
//! pipeline state"), this is the one value threaded explicitly into every
//! stage; nothing reads ambient global state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{error::Result, util::validate_path};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Release {
	#[serde(rename = "4.0")]
	V4_0,
	#[serde(rename = "5.0")]
	V5_0,
	#[serde(rename = "6.0")]
	V6_0,
}

impl std::str::FromStr for Release {
	type Err = String;
	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s {
			"4.0" => Ok(Self::V4_0),
			"5.0" => Ok(Self::V5_0),
			"6.0" => Ok(Self::V6_0),
			_ => Err(format!("{s} is not a supported release (expected 4.0, 5.0 or 6.0)")),
		}
	}
}

impl std::fmt::Display for Release {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			Self::V4_0 => "4.0",
			Self::V5_0 => "5.0",
			Self::V6_0 => "6.0",
		})
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum KeyBits {
	Bits2048,
	#[default]
	Bits3072,
	Bits4096,
}

impl KeyBits {
	#[must_use]
	pub const fn bits(self) -> usize {
		match self {
			Self::Bits2048 => 2048,
			Self::Bits3072 => 3072,
			Self::Bits4096 => 4096,
		}
	}
}

impl std::str::FromStr for KeyBits {
	type Err = String;
	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s {
			"2048" => Ok(Self::Bits2048),
			"3072" => Ok(Self::Bits3072),
			"4096" => Ok(Self::Bits4096),
			_ => Err(format!("{s} is not a supported key size (expected 2048, 3072 or 4096)")),
		}
	}
}

/// Configuration shared by every stage of a `build-iso` invocation.
///
/// Constructed once by the CLI (or any other caller) from flags/env, then
/// passed by reference into `pipeline::rebuild`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
	pub release: Release,
	pub input_iso: Option<PathBuf>,
	pub output_iso: PathBuf,
	pub keys_dir: PathBuf,
	#[serde(default)]
	pub key_bits: KeyBits,
	#[serde(default = "default_mok_days")]
	pub mok_days: u32,
	#[serde(default)]
	pub rpm_signing: bool,
	#[serde(default)]
	pub efuse_usb_mode: bool,
	#[serde(default)]
	pub drivers_dir: Option<PathBuf>,
	/// Owner name embedded in the MOK certificate subject (`CN=<Owner> MOK`).
	#[serde(default = "default_owner")]
	pub owner: String,
	/// Overrides wall-clock timestamps embedded in the ISO, for
	/// determinism (P6). Read from `$SOURCE_DATE_EPOCH` by the CLI.
	#[serde(default)]
	pub source_date_epoch: Option<i64>,
}

fn default_mok_days() -> u32 {
	180
}

fn default_owner() -> String {
	"Photon OS".to_owned()
}

impl BuildConfig {
	/// Validates every caller-supplied path in this configuration.
	///
	/// # Errors
	/// Returns [`crate::error::PsbError::InputValidation`] if any path is
	/// rejected (NUL byte, shell metacharacter, or `..` segment).
	pub fn validate(&self) -> Result<()> {
		if let Some(input) = &self.input_iso {
			validate_path(input)?;
		}
		validate_path(&self.output_iso)?;
		validate_path(&self.keys_dir)?;
		if let Some(drivers) = &self.drivers_dir {
			validate_path(drivers)?;
		}
		Ok(())
	}

	#[must_use]
	pub fn mok_key_path(&self) -> PathBuf {
		self.keys_dir.join("MOK.key")
	}

	#[must_use]
	pub fn mok_crt_path(&self) -> PathBuf {
		self.keys_dir.join("MOK.crt")
	}

	#[must_use]
	pub fn mok_der_path(&self) -> PathBuf {
		self.keys_dir.join("MOK.der")
	}

	#[must_use]
	pub fn module_signing_pem_path(&self) -> PathBuf {
		self.keys_dir.join("kernel_module_signing.pem")
	}

	#[must_use]
	pub fn gpg_pubkey_path(&self, vendor: &str) -> PathBuf {
		self.keys_dir.join(format!("RPM-GPG-KEY-{vendor}"))
	}

	#[must_use]
	pub fn shim_cache_path(&self) -> PathBuf {
		self.keys_dir.join("shim-suse.efi")
	}

	#[must_use]
	pub fn mokmanager_cache_path(&self) -> PathBuf {
		self.keys_dir.join("MokManager-suse.efi")
	}

	#[must_use]
	pub fn grub_stub_cache_path(&self) -> PathBuf {
		self.keys_dir.join("grub-photon-stub.efi")
	}

	#[must_use]
	pub fn history_path(&self) -> PathBuf {
		self.keys_dir.join("mok_history.json")
	}
}

/// Resolves the `SOURCE_DATE_EPOCH` / `TMPDIR` / `GNUPGHOME` ambient
/// environment.
#[must_use]
pub fn source_date_epoch_from_env() -> Option<i64> {
	std::env::var("SOURCE_DATE_EPOCH").ok().and_then(|v| v.parse().ok())
}

#[must_use]
pub fn tmpdir_from_env() -> PathBuf {
	std::env::var_os("TMPDIR").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
}

#[must_use]
pub fn gnupghome_from_env() -> Option<PathBuf> {
	std::env::var_os("GNUPGHOME").map(PathBuf::from)
}

/// Discovers a single `*.iso` file under `dir`, for the `--input`-less
/// auto-discovery mode.
///
/// # Errors
/// Returns [`crate::error::PsbError::InputValidation`] if zero or more than
/// one candidate is found.
pub fn discover_input_iso(dir: &Path) -> Result<PathBuf> {
	let pattern = dir.join("*.iso");
	let mut candidates: Vec<PathBuf> =
		glob::glob(&pattern.to_string_lossy()).map_err(|e| crate::error::PsbError::InputValidation(e.to_string()))?.filter_map(std::result::Result::ok).collect();
	candidates.sort();
	match candidates.len() {
		1 => Ok(candidates.remove(0)),
		0 => Err(crate::error::PsbError::InputValidation(format!("no *.iso found under {}", dir.display()))),
		_ => Err(crate::error::PsbError::InputValidation(format!(
			"multiple *.iso candidates under {}; pass --input explicitly",
			dir.display()
		))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_traversal_in_output_path() {
		let cfg = BuildConfig {
			release: Release::V5_0,
			input_iso: None,
			output_iso: PathBuf::from("../escape.iso"),
			keys_dir: PathBuf::from("/keys"),
			key_bits: KeyBits::default(),
			mok_days: 180,
			rpm_signing: false,
			efuse_usb_mode: false,
			drivers_dir: None,
			owner: "Photon OS".into(),
			source_date_epoch: None,
		};
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn key_bits_round_trip_through_str() {
		assert_eq!("3072".parse::<KeyBits>().unwrap().bits(), 3072);
		assert!("1024".parse::<KeyBits>().is_err());
	}
}
