//! Session layer policy configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default largest forward gap bridged within one receiving chain.
pub const DEFAULT_MAX_SKIP: u32 = 1000;

/// Default capacity of the skipped message key cache.
pub const DEFAULT_MAX_SKIPPED_KEYS: usize = 2000;

/// Default number of superseded remote ratchet keys remembered per session.
pub const DEFAULT_MAX_RETIRED_RATCHET_KEYS: usize = 32;

/// Default one-time prekey count below which the pool is replenished.
pub const DEFAULT_PREKEY_LOW_WATER: usize = 20;

/// Default one-time prekey pool size after replenishment.
pub const DEFAULT_PREKEY_TARGET: usize = 100;

/// Default signed prekey rotation interval (7 days).
pub const DEFAULT_SIGNED_PREKEY_ROTATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Default retention of a superseded signed prekey (3 days).
pub const DEFAULT_SIGNED_PREKEY_GRACE_SECS: u64 = 3 * 24 * 60 * 60;

/// Default bound on automatic re-handshakes for one send.
pub const DEFAULT_MAX_HANDSHAKE_ATTEMPTS: u32 = 3;

/// Default bundle fetch timeout in milliseconds.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;

/// Default consecutive authentication failures before a session is reset.
pub const DEFAULT_RESET_AFTER_FAILURES: u32 = 5;

/// Policy values for key management, the ratchet and the manager's retry logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Largest counter gap bridged in a single receiving chain.
    pub max_skip: u32,

    /// Skipped message key cache capacity; the oldest entries are evicted first.
    pub max_skipped_keys: usize,

    /// Superseded remote ratchet keys remembered for duplicate detection.
    pub max_retired_ratchet_keys: usize,

    /// Replenish the one-time prekey pool when it falls below this.
    pub prekey_low_water: usize,

    /// One-time prekey pool size after replenishment.
    pub prekey_target: usize,

    /// Signed prekey rotation interval in seconds.
    pub signed_prekey_rotation_secs: u64,

    /// How long a superseded signed prekey stays usable for in-flight handshakes.
    pub signed_prekey_grace_secs: u64,

    /// Automatic re-handshakes attempted per send before giving up.
    pub max_handshake_attempts: u32,

    /// Bundle fetch timeout in milliseconds.
    pub fetch_timeout_ms: u64,

    /// Consecutive authentication failures on a session before it is reset.
    pub reset_after_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_skip: DEFAULT_MAX_SKIP,
            max_skipped_keys: DEFAULT_MAX_SKIPPED_KEYS,
            max_retired_ratchet_keys: DEFAULT_MAX_RETIRED_RATCHET_KEYS,
            prekey_low_water: DEFAULT_PREKEY_LOW_WATER,
            prekey_target: DEFAULT_PREKEY_TARGET,
            signed_prekey_rotation_secs: DEFAULT_SIGNED_PREKEY_ROTATION_SECS,
            signed_prekey_grace_secs: DEFAULT_SIGNED_PREKEY_GRACE_SECS,
            max_handshake_attempts: DEFAULT_MAX_HANDSHAKE_ATTEMPTS,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            reset_after_failures: DEFAULT_RESET_AFTER_FAILURES,
        }
    }
}

/// Limits applied by the ratchet while decrypting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetLimits {
    pub max_skip: u32,
    pub max_skipped_keys: usize,
    pub max_retired_ratchet_keys: usize,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        SessionConfig::default().ratchet_limits()
    }
}

impl SessionConfig {
    /// Parses a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the session layer cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_skip == 0 || self.max_skipped_keys == 0 {
            return Err(Error::InvalidConfig("skip window must be non-zero".into()));
        }
        if self.max_skip as usize > self.max_skipped_keys {
            return Err(Error::InvalidConfig(
                "max_skip must not exceed max_skipped_keys".into(),
            ));
        }
        if self.prekey_target == 0 {
            return Err(Error::InvalidConfig("prekey_target must be non-zero".into()));
        }
        if self.prekey_low_water > self.prekey_target {
            return Err(Error::InvalidConfig(
                "prekey_low_water must not exceed prekey_target".into(),
            ));
        }
        if self.signed_prekey_rotation_secs == 0 {
            return Err(Error::InvalidConfig(
                "signed_prekey_rotation_secs must be non-zero".into(),
            ));
        }
        if self.max_handshake_attempts == 0 || self.reset_after_failures == 0 {
            return Err(Error::InvalidConfig("retry limits must be non-zero".into()));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(Error::InvalidConfig("fetch_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    #[must_use]
    pub fn ratchet_limits(&self) -> RatchetLimits {
        RatchetLimits {
            max_skip: self.max_skip,
            max_skipped_keys: self.max_skipped_keys,
            max_retired_ratchet_keys: self.max_retired_ratchet_keys,
        }
    }
}
