//! Shared low-level helpers: subprocess invocation, path validation, and
//! scoped (RAII) resource guards for loopback devices, mounts and scratch
//! directories.

use std::{
	ffi::OsStr,
	path::{Path, PathBuf},
	process::{Command, Stdio},
};

use crate::error::{PsbError, Result};

/// Runs an external tool, capturing output and turning a non-zero exit into
/// a [`PsbError::ToolFailed`].
#[macro_export]
macro_rules! cmd {
	($tool:expr $(, $arg:expr)* $(,)?) => {{
		$crate::util::run_tool($tool, &[$($arg.as_ref(),)*])
	}};
}

/// Runs `tool` with `args`, returning captured stdout on success.
///
/// # Errors
/// Returns [`PsbError::ToolchainMissing`] if the binary cannot be found on
/// `$PATH`, or [`PsbError::ToolFailed`] if it exits non-zero.
pub fn run_tool(tool: &str, args: &[&OsStr]) -> Result<Vec<u8>> {
	tracing::trace!(tool, ?args, "invoking external tool");
	let out = Command::new(tool).args(args).stdin(Stdio::null()).output().map_err(|e| {
		if e.kind() == std::io::ErrorKind::NotFound {
			PsbError::ToolchainMissing { tool: tool.to_owned() }
		} else {
			PsbError::Io(e)
		}
	})?;
	if out.status.success() {
		Ok(out.stdout)
	} else {
		Err(PsbError::ToolFailed {
			tool: tool.to_owned(),
			code: out.status.code(),
			stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
		})
	}
}

/// Validates a caller-supplied path: rejects NUL bytes, shell
/// metacharacters, and `..` segments.
///
/// # Errors
/// Returns [`PsbError::InputValidation`] if the path is rejected.
pub fn validate_path(path: &Path) -> Result<()> {
	let s = path.to_string_lossy();
	if s.contains('\0') {
		return Err(PsbError::InputValidation(format!("path {s} contains a NUL byte")));
	}
	const METACHARS: &[char] = &[';', '|', '&', '$', '`', '"', '\''];
	if let Some(c) = s.chars().find(|c| METACHARS.contains(c)) {
		return Err(PsbError::InputValidation(format!("path {s} contains shell metacharacter {c:?}")));
	}
	if path.components().any(|c| c.as_os_str() == "..") {
		return Err(PsbError::InputValidation(format!("path {s} contains a `..` segment")));
	}
	Ok(())
}

/// Creates a scratch directory with `mkdtemp` semantics (unpredictable
/// suffix, mode 0700) under `parent`.
///
/// # Errors
/// Propagates filesystem errors.
pub fn mkdtemp(parent: &Path, prefix: &str) -> Result<tempfile::TempDir> {
	std::fs::create_dir_all(parent)?;
	let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(parent)?;
	std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;
	Ok(dir)
}

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// A loopback device backed by a regular file, torn down on drop.
///
/// Acquiring the device returns a guard whose `Drop` detaches it, so
/// unwinding for any reason (including a mid-pipeline error) releases it.
pub struct LoopDevice {
	path: PathBuf,
	dev: Option<loopdev_fyra::LoopDevice>,
}

impl LoopDevice {
	/// Attaches `file` to a free loop device.
	///
	/// # Errors
	/// Propagates I/O errors from the loop control device.
	pub fn attach(file: &Path) -> Result<Self> {
		let lc = loopdev_fyra::LoopControl::open()?;
		let dev = lc.next_free()?;
		dev.attach_file(file)?;
		let path = dev.path().ok_or_else(|| PsbError::IsoWriteFailed {
			path: file.to_owned(),
			reason: "loop device has no path".into(),
		})?;
		Ok(Self { path, dev: Some(dev) })
	}

	#[must_use]
	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for LoopDevice {
	fn drop(&mut self) {
		if let Some(dev) = self.dev.take() {
			if let Err(e) = dev.detach() {
				tracing::warn!(path = %self.path.display(), error = %e, "failed to detach loop device");
			}
		}
	}
}

/// A mounted filesystem, unmounted on drop (reverse of acquisition order
/// when several guards are held).
pub struct ScopedMount {
	target: PathBuf,
}

impl ScopedMount {
	/// Mounts `source` (a device or image path) at `target`, creating
	/// `target` if needed.
	///
	/// # Errors
	/// Propagates mount(2) failures via [`PsbError::Io`].
	pub fn mount(source: &Path, target: &Path, fstype: &str, options: &[&str]) -> Result<Self> {
		std::fs::create_dir_all(target)?;
		let mut builder = sys_mount::Mount::builder().fstype(fstype);
		if !options.is_empty() {
			builder = builder.data(&options.join(","));
		}
		builder.mount(source, target).map_err(|e| PsbError::IsoUnreadable {
			path: source.to_owned(),
			reason: e.to_string(),
		})?;
		Ok(Self { target: target.to_owned() })
	}
}

impl Drop for ScopedMount {
	fn drop(&mut self) {
		if let Err(e) = sys_mount::unmount(&self.target, sys_mount::UnmountFlags::DETACH) {
			tracing::warn!(path = %self.target.display(), error = %e, "failed to unmount");
		}
	}
}

/// A cooperative cancellation token checked between pipeline stages and
/// between RPM-patcher workers.
#[derive(Clone, Default)]
pub struct CancelToken(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancelToken {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.0.store(true, std::sync::atomic::Ordering::SeqCst);
	}

	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.0.load(std::sync::atomic::Ordering::SeqCst)
	}
}

/// Computes a hex-encoded SHA-256 digest of a file's contents.
///
/// # Errors
/// Propagates I/O errors reading `path`.
pub fn sha256_file(path: &Path) -> Result<String> {
	use sha2::{Digest, Sha256};
	let mut file = std::fs::File::open(path)?;
	let mut hasher = Sha256::new();
	std::io::copy(&mut file, &mut hasher)?;
	Ok(hex::encode(hasher.finalize()))
}
