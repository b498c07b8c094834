#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, Validate};

pub const IDENTITY_MAX_LEN: usize = 128;

/// Canonical wallet address. The only principal the engine knows about.
///
/// Construction trims surrounding whitespace and lowercases ASCII, so two
/// addresses that differ only in case compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        let id = Self(raw.trim().to_ascii_lowercase());
        id.validate()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for Identity {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "identity",
                reason: "must not be empty",
            });
        }
        if self.0.len() > IDENTITY_MAX_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "identity",
                reason: "must be <= 128 chars",
            });
        }
        if !self.0.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ContractViolation::InvalidValue {
                field: "identity",
                reason: "must be ascii alphanumeric",
            });
        }
        if self.0.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ContractViolation::InvalidValue {
                field: "identity",
                reason: "must be canonical lowercase",
            });
        }
        Ok(())
    }
}

impl TryFrom<String> for Identity {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
