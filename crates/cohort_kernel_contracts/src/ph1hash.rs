#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, Validate};

pub const DIGEST_HEX_LEN: usize = 64;

fn hex_lower(bytes: &[u8; 32]) -> String {
    const ALPHABET: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(DIGEST_HEX_LEN);
    for b in bytes {
        out.push(ALPHABET[(b >> 4) as usize] as char);
        out.push(ALPHABET[(b & 0x0f) as usize] as char);
    }
    out
}

fn validate_digest_hex(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.len() != DIGEST_HEX_LEN {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be 64 hex chars",
        });
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be lowercase hex",
        });
    }
    Ok(())
}

/// Content address of an attendance/performance payload (SHA-256, lowercase hex).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PayloadHash(String);

impl PayloadHash {
    /// Accepts upper- or lowercase hex and stores it lowercase.
    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        let h = Self(raw.trim().to_ascii_lowercase());
        h.validate()?;
        Ok(h)
    }

    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(hex_lower(&digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PayloadHash {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_digest_hex("payload_hash", &self.0)
    }
}

impl TryFrom<String> for PayloadHash {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PayloadHash> for String {
    fn from(value: PayloadHash) -> Self {
        value.0
    }
}

impl fmt::Display for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Idempotency key of a group: digest over the sorted member list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemberSetKey(String);

impl MemberSetKey {
    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        let k = Self(raw.to_string());
        k.validate()?;
        Ok(k)
    }

    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(hex_lower(&digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The genesis metadata hash of a freshly drafted group.
    pub fn to_genesis_hash(&self) -> PayloadHash {
        PayloadHash(self.0.clone())
    }
}

impl Validate for MemberSetKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_digest_hex("member_set_key", &self.0)
    }
}

impl TryFrom<String> for MemberSetKey {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MemberSetKey> for String {
    fn from(value: MemberSetKey) -> Self {
        value.0
    }
}

impl fmt::Display for MemberSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
