//! The closed error-kind set for the rebuild pipeline.
//!
//! Every stage boundary returns exactly one of these; no partial success
//! crosses a boundary. The CLI layer wraps this in
//! `color_eyre::Report` for presentation; the library itself never depends
//! on `color_eyre`.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, PsbError>;

#[derive(Debug, thiserror::Error)]
pub enum PsbError {
	#[error("invalid input: {0}")]
	InputValidation(String),

	#[error("required tool `{tool}` is not installed")]
	ToolchainMissing { tool: String },

	#[error("network unreachable fetching {resource} after {attempts} attempts")]
	NetworkUnreachable { resource: String, attempts: u32 },

	#[error("key I/O error at {path}: {source}")]
	KeyIo { path: PathBuf, #[source] source: std::io::Error },

	#[error("inconsistent key material at {path}: {reason}")]
	KeyFormat { path: PathBuf, reason: String },

	#[error("shim is not acceptable: {reason}")]
	ShimInvalid { reason: String },

	#[error("GRUB stub assembly failed: {stderr}")]
	StubAssemblyFailed { stderr: String },

	#[error("GRUB stub contains a linked `shim_lock` module; upstream GRUB must have changed")]
	StubContaminated,

	#[error("signing failed for {artifact}: {reason}")]
	SignFailed { artifact: PathBuf, reason: String },

	#[error("could not locate original package providing {path}")]
	OriginalMissing { path: String },

	#[error("payload mismatch rebuilding {rpm}: {reason}")]
	PayloadMismatch { rpm: String, reason: String },

	#[error("kernel module signatures lost in {rpm} (strip was not disabled)")]
	ModuleSignaturesLost { rpm: String },

	#[error("EFI System Partition image overflowed at {attempted_bytes} bytes")]
	EspOverflow { attempted_bytes: u64 },

	#[error("source ISO at {path} could not be read: {reason}")]
	IsoUnreadable { path: PathBuf, reason: String },

	#[error("failed to author output ISO at {path}: {reason}")]
	IsoWriteFailed { path: PathBuf, reason: String },

	#[error("verification check `{check}` failed: {detail}")]
	VerifyFailed { check: String, detail: String },

	#[error("running `{tool}` failed (exit {code:?}): {stderr}")]
	ToolFailed { tool: String, code: Option<i32>, stderr: String },

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl PsbError {
	/// Maps an error kind to its process exit code.
	#[must_use]
	pub const fn exit_code(&self) -> i32 {
		match self {
			Self::InputValidation(_) => 1,
			Self::ToolchainMissing { .. } => 2,
			Self::ShimInvalid { .. }
			| Self::StubContaminated
			| Self::SignFailed { .. }
			| Self::StubAssemblyFailed { .. } => 3,
			Self::KeyIo { .. }
			| Self::KeyFormat { .. }
			| Self::OriginalMissing { .. }
			| Self::PayloadMismatch { .. }
			| Self::ModuleSignaturesLost { .. }
			| Self::EspOverflow { .. }
			| Self::IsoUnreadable { .. }
			| Self::IsoWriteFailed { .. }
			| Self::Io(_)
			| Self::NetworkUnreachable { .. }
			| Self::ToolFailed { .. } => 4,
			Self::VerifyFailed { .. } => 5,
		}
	}
}
