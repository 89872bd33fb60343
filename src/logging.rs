//! Tracing subscriber setup, with a redaction layer spliced in so
//! private-key paths never reach a log sink verbatim.

use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

const REDACTED: &str = "[PRIVATE_KEY]";

/// Replaces any substring that looks like a private-key path
/// (`MOK.key`, `kernel_module_signing.pem`, or any path ending in `.key`)
/// with the literal `[PRIVATE_KEY]`.
#[must_use]
pub fn redact(input: &str) -> String {
	let needles = ["MOK.key", "kernel_module_signing.pem"];
	let mut out = input.to_owned();
	for needle in needles {
		if out.contains(needle) {
			out = out.replace(needle, REDACTED);
		}
	}
	if out.contains(".key") {
		// Fall back to masking any whitespace-delimited token ending in
		// `.key`, to catch caller-chosen key filenames we don't know by name.
		out = out
			.split(' ')
			.map(|tok| if tok.ends_with(".key") { REDACTED } else { tok })
			.collect::<Vec<_>>()
			.join(" ");
	}
	out
}

struct RedactingWriter<W>(W);

impl<W: std::io::Write> std::io::Write for RedactingWriter<W> {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		let text = String::from_utf8_lossy(buf);
		let redacted = redact(&text);
		self.0.write_all(redacted.as_bytes())?;
		Ok(buf.len())
	}

	fn flush(&mut self) -> std::io::Result<()> {
		self.0.flush()
	}
}

#[derive(Clone, Copy, Default)]
struct RedactingMakeWriter;

impl<'a> fmt::MakeWriter<'a> for RedactingMakeWriter {
	type Writer = RedactingWriter<std::io::Stderr>;

	fn make_writer(&'a self) -> Self::Writer {
		RedactingWriter(std::io::stderr())
	}
}

/// Installs the global `tracing` subscriber. Call once, at process start.
///
/// # Panics
/// Panics if a global subscriber has already been installed; this is a
/// one-shot process-startup call, not a library entry point.
pub fn init() {
	let filter = EnvFilter::try_from_env("PHOTON_SB_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
	let fmtlyr = fmt::layer().pretty().with_writer(RedactingMakeWriter).with_filter(filter);
	let subscriber =
		Registry::default().with(tracing_error::ErrorLayer::default()).with(fmtlyr);
	tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

#[cfg(test)]
mod tests {
	use super::redact;

	#[test]
	fn redacts_known_key_filenames() {
		assert_eq!(redact("loaded /keys/MOK.key ok"), "loaded /keys/[PRIVATE_KEY] ok");
	}

	#[test]
	fn redacts_unknown_dot_key_tokens() {
		assert_eq!(redact("loaded /keys/custom.key ok"), "loaded [PRIVATE_KEY] ok");
	}

	#[test]
	fn leaves_unrelated_text_alone() {
		assert_eq!(redact("building ISO at /out/photon.iso"), "building ISO at /out/photon.iso");
	}
}
