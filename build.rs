//! Embeds the vendor shim and MokManager binaries into the crate, compressed.
//!
//! The real Microsoft-signed shim is not something this repository can ship
//! or fabricate; it is supplied out of band by whoever packages this crate,
//! via `PHOTON_SB_SHIM_PATH` / `PHOTON_SB_MOKMANAGER_PATH`. When those are
//! unset (e.g. in CI, or during `cargo test`), we embed a tiny zero-length
//! placeholder so the crate still builds; `shim::load_embedded` refuses to
//! treat a placeholder as a usable shim at runtime.

use std::{
	env, fs,
	io::Write,
	path::{Path, PathBuf},
};

fn gzip_embed(src_env: &str, out_name: &str, out_dir: &Path) {
	println!("cargo:rerun-if-env-changed={src_env}");
	let bytes = env::var_os(src_env)
		.map(PathBuf::from)
		.and_then(|p| {
			println!("cargo:rerun-if-changed={}", p.display());
			fs::read(&p).ok()
		})
		.unwrap_or_default();

	let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::best());
	encoder.write_all(&bytes).expect("compress embedded blob");
	let compressed = encoder.finish().expect("finish compressing embedded blob");

	fs::write(out_dir.join(out_name), compressed).expect("write embedded blob");
}

fn main() {
	let out_dir = PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR set by cargo"));
	gzip_embed("PHOTON_SB_SHIM_PATH", "shim.efi.gz", &out_dir);
	gzip_embed("PHOTON_SB_MOKMANAGER_PATH", "mokmanager.efi.gz", &out_dir);
}
