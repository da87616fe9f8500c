//! Timeouts, limits and SSH algorithm presets.
//!
//! Option structs load from JSON documents; durations are expressed in
//! milliseconds there and every field has a default, so partial documents are
//! accepted.

use std::borrow::Cow;
use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{Preferred, cipher, compression, kex, mac};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::SwitchError;

/// Limits applied by the command channel's read-until-prompt loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ChannelOptions {
    /// Maximum silence between two chunks before the command times out.
    pub inactivity_timeout_ms: u64,
    /// Maximum total time a single command may take.
    pub absolute_timeout_ms: u64,
    /// Maximum bytes requested from the transport per read.
    pub read_chunk: usize,
    /// Number of trailing bytes of the cleaned buffer searched for a prompt.
    pub search_depth: usize,
    /// Maximum pager continuations answered for a single command.
    pub max_pages: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: 10_000,
            absolute_timeout_ms: 30_000,
            read_chunk: 4096,
            search_depth: 1000,
            max_pages: 1000,
        }
    }
}

impl ChannelOptions {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn absolute_timeout(&self) -> Duration {
        Duration::from_millis(self.absolute_timeout_ms)
    }
}

/// Limits applied by the session manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionOptions {
    /// Window during which the banner and first prompt are collected.
    pub detection_window_ms: u64,
    /// Maximum time the transport provider may take to connect.
    pub connect_timeout_ms: u64,
    /// Depth of the per-session job queue.
    pub queue_depth: usize,
    /// Number of closed or failed sessions kept for audit.
    pub retired_capacity: u64,
    /// How long a retired session stays readable.
    pub retired_ttl_secs: u64,
    /// Read loop limits.
    pub channel: ChannelOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            detection_window_ms: 2_000,
            connect_timeout_ms: 15_000,
            queue_depth: 32,
            retired_capacity: 1024,
            retired_ttl_secs: 24 * 60 * 60,
            channel: ChannelOptions::default(),
        }
    }
}

impl SessionOptions {
    /// Parse options from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, SwitchError> {
        serde_json::from_str(json)
            .map_err(|e| SwitchError::InternalServerError(format!("session options: {e}")))
    }

    pub fn detection_window(&self) -> Duration {
        Duration::from_millis(self.detection_window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retired_ttl(&self) -> Duration {
        Duration::from_secs(self.retired_ttl_secs)
    }
}

/// Key exchange algorithms offered to modern devices.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
];

/// Key exchange algorithms offered when legacy switches are expected.
///
/// Old IOS and VRP images only speak group1/group14 SHA-1.
pub const LEGACY_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::ECDH_SHA2_NISTP256,
    kex::DH_G14_SHA256,
    kex::DH_GEX_SHA256,
    kex::DH_G14_SHA1,
    kex::DH_GEX_SHA1,
    kex::DH_G1_SHA1,
];

pub const SECURE_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_128_CTR,
];

pub const LEGACY_CIPHERS: &[cipher::Name] = &[
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_192_CBC,
    cipher::AES_128_CBC,
];

pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
];

pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
];

pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] = &[compression::NONE];

pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

pub const LEGACY_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
    Algorithm::Dsa,
];

/// SSH algorithm preset offered during negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SshAlgorithms {
    #[default]
    Secure,
    /// Adds SHA-1 key exchange, CBC ciphers, SHA-1 MACs and DSA host keys.
    Legacy,
}

impl SshAlgorithms {
    pub fn from_legacy_flag(legacy: bool) -> Self {
        if legacy {
            SshAlgorithms::Legacy
        } else {
            SshAlgorithms::Secure
        }
    }

    /// Algorithm lists in russh's negotiation format.
    pub fn preferred(&self) -> Preferred {
        match self {
            SshAlgorithms::Secure => Preferred {
                kex: Cow::Borrowed(SECURE_KEX_ORDER),
                key: Cow::Borrowed(SECURE_KEY_TYPES),
                cipher: Cow::Borrowed(SECURE_CIPHERS),
                mac: Cow::Borrowed(SECURE_MAC_ALGORITHMS),
                compression: Cow::Borrowed(DEFAULT_COMPRESSION_ALGORITHMS),
            },
            SshAlgorithms::Legacy => Preferred {
                kex: Cow::Borrowed(LEGACY_KEX_ORDER),
                key: Cow::Borrowed(LEGACY_KEY_TYPES),
                cipher: Cow::Borrowed(LEGACY_CIPHERS),
                mac: Cow::Borrowed(LEGACY_MAC_ALGORITHMS),
                compression: Cow::Borrowed(DEFAULT_COMPRESSION_ALGORITHMS),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_timeouts() {
        let options = SessionOptions::default();
        assert_eq!(options.detection_window(), Duration::from_secs(2));
        assert_eq!(options.channel.inactivity_timeout(), Duration::from_secs(10));
        assert_eq!(options.channel.absolute_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let options = SessionOptions::from_json(
            r#"{"detection_window_ms": 500, "channel": {"absolute_timeout_ms": 5000}}"#,
        )
        .expect("parse options");
        assert_eq!(options.detection_window_ms, 500);
        assert_eq!(options.channel.absolute_timeout_ms, 5000);
        assert_eq!(options.channel.inactivity_timeout_ms, 10_000);
        assert_eq!(options.queue_depth, 32);
    }

    #[test]
    fn legacy_preset_extends_secure_one() {
        let secure = SshAlgorithms::from_legacy_flag(false).preferred();
        let legacy = SshAlgorithms::from_legacy_flag(true).preferred();
        assert!(!secure.kex.contains(&kex::DH_G1_SHA1));
        assert!(legacy.kex.contains(&kex::DH_G1_SHA1));
        assert!(legacy.cipher.contains(&cipher::AES_128_CBC));
    }

    #[test]
    fn malformed_json_is_reported() {
        let err = SessionOptions::from_json("{not json").expect_err("should fail");
        assert!(matches!(err, SwitchError::InternalServerError(_)));
    }
}
