//! Receiver Types
//!
//! Caller-facing values. A receiver is not a source of truth; the persisted
//! control program and its index allocation are.

use bitcoin::bip32::{DerivationPath, Xpub};
use bitcoin::ScriptBuf;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Expiry applied when the caller does not supply one
pub const DEFAULT_RECEIVER_EXPIRY_DAYS: i64 = 30;

/// Default receiver expiry as a duration
pub fn default_receiver_expiry() -> Duration {
    Duration::days(DEFAULT_RECEIVER_EXPIRY_DAYS)
}

/// Time-bounded payment destination handed to a payer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receiver {
    /// Program the payment must be sent to
    pub control_program: ScriptBuf,
    /// Display encoding of the program, for address receivers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Payers should stop using the receiver after this time
    pub expires_at: DateTime<Utc>,
}

impl Receiver {
    /// Whether the receiver is past its expiry at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Read-only projection of a derivation point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountPubkey {
    /// Account root key the pubkey was derived from
    pub root: Xpub,
    /// Compressed public key at `path`
    #[serde(with = "hex_bytes")]
    pub pubkey: Vec<u8>,
    /// Path below `root`
    pub path: DerivationPath,
    /// Allocated index, the last component of `path`
    pub index: u32,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
