//! Logging setup and log-safe renderings of key material.
//!
//! Secrets never reach a log line. Public keys are logged as short
//! fingerprints so related events can be correlated.

use crate::keys::PublicKey;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};

/// Installs a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `default_directive`. Returns `false` if
/// a global subscriber was already installed.
pub fn init_logging(default_directive: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    subscriber_fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Short SHA-256 fingerprint of a public key (8 base64 characters).
pub struct Fingerprint<'a>(pub &'a PublicKey);

impl fmt::Display for Fingerprint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digest = Sha256::digest(self.0.as_bytes());
        f.write_str(&URL_SAFE_NO_PAD.encode(&digest[..6]))
    }
}

impl fmt::Debug for Fingerprint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Renders a byte payload as its length only.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl fmt::Display for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}
