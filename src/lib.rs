//! Rebuilds Photon OS installer ISOs to boot under UEFI Secure Boot using a
//! user-owned Machine Owner Key, chaining through the distro-neutral SUSE
//! shim rather than requesting a Microsoft-signed bootloader.
//!
//! The pipeline is leaves-first: Key Manager feeds the Shim Provider and
//! GRUB Stub Builder, which feed the RPM Patcher, which feeds the ISO
//! Rewriter, which the Verifier checks. [`pipeline::rebuild`] drives all of
//! it from a single [`config::BuildConfig`].

pub mod config;
pub mod error;
pub mod grubstub;
pub mod history;
pub mod iso;
pub mod keys;
pub mod logging;
pub mod pe;
pub mod pipeline;
pub mod rpm;
pub mod shim;
pub mod util;
pub mod verify;

pub use error::{PsbError, Result};
