//! Thin CLI wrapping `photon_secureboot`: parse args, build a
//! `BuildConfig`, call one library entry point, map the result to an exit
//! code. Argument parsing and progress rendering are intentionally kept
//! outside the library's test surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use photon_secureboot::{
	config::{self, BuildConfig, KeyBits, Release},
	error::PsbError,
	keys, pipeline,
	util::CancelToken,
	verify,
};

#[derive(Parser)]
#[command(name = "photon-sb", about = "Rebuilds Photon OS installer ISOs to boot under a user-owned MOK")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Rebuild a source ISO into a MOK-signed Secure Boot installer ISO.
	BuildIso {
		#[arg(long, value_enum)]
		release: ReleaseArg,
		#[arg(long)]
		input: Option<PathBuf>,
		#[arg(long)]
		output: PathBuf,
		#[arg(long = "keys-dir")]
		keys_dir: PathBuf,
		#[arg(long = "grub-module-dir", default_value = "/usr/lib/grub/x86_64-efi")]
		grub_module_dir: PathBuf,
		#[arg(long)]
		drivers: Option<PathBuf>,
		#[arg(long = "rpm-signing")]
		rpm_signing: bool,
		#[arg(long = "efuse-usb")]
		efuse_usb: bool,
		#[arg(long = "key-bits", default_value = "3072")]
		key_bits: String,
		#[arg(long = "mok-days", default_value_t = 180)]
		mok_days: u32,
	},
	/// Run the Verifier's checks against an arbitrary ISO.
	Diagnose {
		iso: PathBuf,
		#[arg(long = "mok-cert")]
		mok_cert: Option<PathBuf>,
		#[arg(long)]
		json: bool,
	},
	/// Report expiry status for every certificate under a keys directory.
	CheckCerts {
		#[arg(long = "keys-dir")]
		keys_dir: PathBuf,
		#[arg(long = "cert-warn", default_value_t = 30)]
		cert_warn: i64,
	},
	/// Populate a keys directory without building an ISO.
	GenerateKeys {
		#[arg(long = "keys-dir")]
		keys_dir: PathBuf,
		#[arg(long = "key-bits", default_value = "3072")]
		key_bits: String,
		#[arg(long = "mok-days", default_value_t = 180)]
		mok_days: u32,
		#[arg(long, default_value = "Photon OS")]
		owner: String,
	},
	/// Remove generated artifacts.
	Clean {
		#[arg(long = "keys-dir")]
		keys_dir: PathBuf,
		#[arg(long = "output-dir")]
		output_dir: Option<PathBuf>,
	},
	/// Write an eFuse-USB simulation payload to `device`.
	CreateEfuseUsb {
		device: PathBuf,
		#[arg(long)]
		yes: bool,
		#[arg(long)]
		closed: bool,
	},
}

#[derive(Clone, clap::ValueEnum)]
enum ReleaseArg {
	#[value(name = "4.0")]
	V4_0,
	#[value(name = "5.0")]
	V5_0,
	#[value(name = "6.0")]
	V6_0,
}

impl From<ReleaseArg> for Release {
	fn from(value: ReleaseArg) -> Self {
		match value {
			ReleaseArg::V4_0 => Self::V4_0,
			ReleaseArg::V5_0 => Self::V5_0,
			ReleaseArg::V6_0 => Self::V6_0,
		}
	}
}

fn main() {
	photon_secureboot::logging::init();
	dotenvy::dotenv().ok();

	let cli = Cli::parse();
	let code = match run(cli) {
		Ok(()) => 0,
		Err(e) => {
			tracing::error!(error = %e, "photon-sb failed");
			e.exit_code()
		}
	};
	std::process::exit(code);
}

fn run(cli: Cli) -> Result<(), PsbError> {
	match cli.command {
		Command::BuildIso { release, input, output, keys_dir, grub_module_dir, drivers, rpm_signing, efuse_usb, key_bits, mok_days } => {
			let key_bits: KeyBits = key_bits.parse().map_err(PsbError::InputValidation)?;
			let cfg = BuildConfig {
				release: release.into(),
				input_iso: input,
				output_iso: output,
				keys_dir,
				key_bits,
				mok_days,
				rpm_signing,
				efuse_usb_mode: efuse_usb,
				drivers_dir: drivers,
				owner: "Photon OS".into(),
				source_date_epoch: config::source_date_epoch_from_env(),
			};
			let scratch_root = config::tmpdir_from_env().join("photon-sb-scratch");
			let cancel = CancelToken::new();
			install_sigterm_handler(cancel.clone());
			let outcome = pipeline::rebuild(&cfg, &grub_module_dir, &scratch_root, &cancel)?;
			println!("built {}", outcome.output_iso.display());
			Ok(())
		}
		Command::Diagnose { iso, mok_cert, json } => {
			let report = verify::diagnose(&iso, mok_cert.as_deref())?;
			print_report(&report, json);
			if report.passed() {
				Ok(())
			} else {
				Err(PsbError::VerifyFailed { check: "diagnose".into(), detail: "one or more checks failed".into() })
			}
		}
		Command::CheckCerts { keys_dir, cert_warn } => {
			let reports = keys::check_expiry(&keys_dir, cert_warn)?;
			let mut any_bad = false;
			for r in &reports {
				any_bad |= r.status != keys::ExpiryStatus::Ok;
				println!("{}: {:?} ({} days remaining)", r.path.display(), r.status, r.days_remaining);
			}
			if any_bad {
				Err(PsbError::InputValidation("one or more certificates are expiring or expired".into()))
			} else {
				Ok(())
			}
		}
		Command::GenerateKeys { keys_dir, key_bits, mok_days, owner } => {
			let key_bits: KeyBits = key_bits.parse().map_err(PsbError::InputValidation)?;
			keys::ensure_mok(&keys_dir, key_bits.bits(), mok_days, &owner)?;
			keys::ensure_module_signing_key(&keys_dir)?;
			println!("keys populated at {}", keys_dir.display());
			Ok(())
		}
		Command::Clean { keys_dir, output_dir } => {
			for name in ["MOK.key", "MOK.crt", "MOK.der", "kernel_module_signing.pem", "mok_history.json"] {
				let _ = std::fs::remove_file(keys_dir.join(name));
			}
			if let Some(dir) = output_dir {
				let _ = std::fs::remove_dir_all(dir);
			}
			Ok(())
		}
		Command::CreateEfuseUsb { device, yes, closed } => {
			if !yes {
				return Err(PsbError::InputValidation("refusing to write to a device without --yes".into()));
			}
			use sha2::{Digest, Sha256};
			let hash: [u8; 32] = Sha256::digest(b"placeholder-srk-public-key").into();
			photon_secureboot::iso::write_efuse_payload(&device, &hash, closed)?;
			println!("wrote eFuse-USB payload to {}", device.display());
			Ok(())
		}
	}
}

fn print_report(report: &verify::VerifyReport, json: bool) {
	if json {
		if let Ok(text) = serde_json::to_string_pretty(report) {
			println!("{text}");
		}
		return;
	}
	for check in &report.checks {
		println!("[{:?}] {}: {}", check.status, check.label, check.detail);
	}
}

static SIGTERM_RECEIVED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_sigterm(_: std::ffi::c_int) {
	SIGTERM_RECEIVED.store(true, std::sync::atomic::Ordering::SeqCst);
}

/// Installs a SIGTERM handler and a watcher thread that flips `cancel`,
/// so a cancellation token is checked between pipeline stages.
#[cfg(unix)]
fn install_sigterm_handler(cancel: CancelToken) {
	// SAFETY: `on_sigterm` only performs an async-signal-safe atomic store,
	// and this is the only place in the process that installs a handler for
	// SIGTERM, so replacing its disposition here races with nothing else.
	unsafe {
		let action = nix::sys::signal::SigAction::new(
			nix::sys::signal::SigHandler::Handler(on_sigterm),
			nix::sys::signal::SaFlags::empty(),
			nix::sys::signal::SigSet::empty(),
		);
		let _ = nix::sys::signal::sigaction(nix::sys::signal::Signal::SIGTERM, &action);
	}
	std::thread::spawn(move || loop {
		if SIGTERM_RECEIVED.load(std::sync::atomic::Ordering::SeqCst) {
			cancel.cancel();
			break;
		}
		std::thread::sleep(std::time::Duration::from_millis(200));
	});
}

#[cfg(not(unix))]
fn install_sigterm_handler(_cancel: CancelToken) {}
