//! Known devices and their pinned identity.
//!
//! A [`DeviceRecord`] is created when the client pairs with a device and is
//! then loaded read-only whenever the client connects.  Its two identifying
//! fields form the [`DeviceKey`], which is how probe results are matched back
//! to the record they were started for.
//!
//! # Fingerprints
//!
//! A device proves its identity with a long-term key pair.  The client stores
//! the SHA-256 digest of the public key (the *fingerprint*) at pairing time
//! and requires every later connection to present exactly the same digest.
//! On disk the fingerprint is written as lowercase hex.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length in bytes of a SHA-256 public-key fingerprint.
pub const FINGERPRINT_LEN: usize = 32;

/// Error returned when a hex fingerprint string cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintParseError {
    /// The string is empty.
    #[error("fingerprint is empty")]
    Empty,
    /// Hex strings must contain an even number of digits.
    #[error("fingerprint hex has odd length {0}")]
    OddLength(usize),
    /// A character outside `[0-9a-fA-F]` was found.
    #[error("invalid hex digit {ch:?} at position {position}")]
    InvalidDigit { ch: char, position: usize },
    /// The hex decodes to something other than [`FINGERPRINT_LEN`] bytes.
    #[error("fingerprint is {0} bytes, expected {FINGERPRINT_LEN}")]
    WrongLength(usize),
}

/// Public-key fingerprint of a device.
///
/// Stored as an opaque byte sequence; equality is exact byte-for-byte.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    /// Wraps raw fingerprint bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns `true` when `other` holds exactly the same bytes.
    pub fn matches(&self, other: &Fingerprint) -> bool {
        self.0 == other.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * 2);
        for byte in &self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(FingerprintParseError::Empty);
        }
        if s.len() % 2 != 0 {
            return Err(FingerprintParseError::OddLength(s.len()));
        }
        let digits: Vec<char> = s.chars().collect();
        let mut bytes = Vec::with_capacity(digits.len() / 2);
        for (i, pair) in digits.chunks(2).enumerate() {
            let hi = hex_value(pair[0], i * 2)?;
            let lo = hex_value(pair[1], i * 2 + 1)?;
            bytes.push((hi << 4) | lo);
        }
        if bytes.len() != FINGERPRINT_LEN {
            return Err(FingerprintParseError::WrongLength(bytes.len()));
        }
        Ok(Self(bytes))
    }
}

fn hex_value(ch: char, position: usize) -> Result<u8, FingerprintParseError> {
    ch.to_digit(16)
        .map(|d| d as u8)
        .ok_or(FingerprintParseError::InvalidDigit { ch, position })
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_hex()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Identity of a device: the `(product id, device id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub product_id: String,
    pub device_id: String,
}

impl DeviceKey {
    pub fn new(product_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.product_id, self.device_id)
    }
}

/// Identity and connection hints for a device known to this client.
///
/// Immutable for the duration of a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub product_id: String,
    pub device_id: String,
    /// Display only.
    pub friendly_name: String,
    /// Optional LAN address tried alongside the relayed path.
    pub direct_candidate_host: Option<String>,
    /// Fingerprint pinned at pairing time.  `None` for a device that was
    /// never paired.
    pub pinned_fingerprint: Option<Fingerprint>,
    /// Credential presented to the rendezvous server for this device.
    pub server_connect_token: String,
}

impl DeviceRecord {
    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(self.product_id.clone(), self.device_id.clone())
    }

    /// Name to show for this device: the friendly name if set, otherwise the
    /// device id.
    pub fn display_name(&self) -> &str {
        if self.friendly_name.is_empty() {
            &self.device_id
        } else {
            &self.friendly_name
        }
    }

    /// Returns `true` when both identifying fields are non-empty.
    pub fn has_identity(&self) -> bool {
        !self.product_id.trim().is_empty() && !self.device_id.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record() -> DeviceRecord {
        DeviceRecord {
            product_id: "pr-abcd1234".to_string(),
            device_id: "de-wxyz5678".to_string(),
            friendly_name: String::new(),
            direct_candidate_host: None,
            pinned_fingerprint: None,
            server_connect_token: "sct-1".to_string(),
        }
    }

    #[test]
    fn test_fingerprint_hex_roundtrip_preserves_bytes() {
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes[..4].copy_from_slice(&[0x00, 0x7f, 0xab, 0xff]);
        let fp = Fingerprint::from_bytes(bytes);
        let parsed: Fingerprint = fp.to_hex().parse().unwrap();
        assert_eq!(parsed, fp);
        assert!(fp.to_hex().starts_with("007fabff00"));
        assert_eq!(fp.to_hex().len(), FINGERPRINT_LEN * 2);
    }

    #[test]
    fn test_fingerprint_parse_accepts_uppercase() {
        let fp: Fingerprint = "ABCDEF01".repeat(8).parse().unwrap();
        assert_eq!(&fp.as_bytes()[..4], &[0xab, 0xcd, 0xef, 0x01]);
    }

    #[test]
    fn test_fingerprint_parse_rejects_truncated_value() {
        assert_eq!(
            "ab".repeat(FINGERPRINT_LEN - 1).parse::<Fingerprint>(),
            Err(FingerprintParseError::WrongLength(FINGERPRINT_LEN - 1))
        );
        assert_eq!(
            "ab".repeat(FINGERPRINT_LEN + 1).parse::<Fingerprint>(),
            Err(FingerprintParseError::WrongLength(FINGERPRINT_LEN + 1))
        );
    }

    #[test]
    fn test_fingerprint_parse_rejects_odd_length() {
        assert_eq!(
            "abc".parse::<Fingerprint>(),
            Err(FingerprintParseError::OddLength(3))
        );
    }

    #[test]
    fn test_fingerprint_parse_rejects_non_hex() {
        assert_eq!(
            "zz".parse::<Fingerprint>(),
            Err(FingerprintParseError::InvalidDigit { ch: 'z', position: 0 })
        );
    }

    #[test]
    fn test_fingerprint_parse_rejects_empty() {
        assert_eq!("  ".parse::<Fingerprint>(), Err(FingerprintParseError::Empty));
    }

    #[test]
    fn test_fingerprint_matches_detects_single_byte_difference() {
        let a = Fingerprint::from_bytes([7u8; FINGERPRINT_LEN]);
        let mut other = [7u8; FINGERPRINT_LEN];
        other[FINGERPRINT_LEN - 1] = 8;
        let b = Fingerprint::from_bytes(other);
        assert!(a.matches(&a.clone()));
        assert!(!a.matches(&b));
    }

    #[test]
    fn test_display_name_falls_back_to_device_id() {
        let mut record = make_record();
        assert_eq!(record.display_name(), "de-wxyz5678");
        record.friendly_name = "garage camera".to_string();
        assert_eq!(record.display_name(), "garage camera");
    }

    #[test]
    fn test_has_identity_rejects_blank_ids() {
        let mut record = make_record();
        assert!(record.has_identity());
        record.device_id = " ".to_string();
        assert!(!record.has_identity());
    }

    #[test]
    fn test_device_key_display_joins_ids() {
        assert_eq!(make_record().key().to_string(), "pr-abcd1234.de-wxyz5678");
    }
}
