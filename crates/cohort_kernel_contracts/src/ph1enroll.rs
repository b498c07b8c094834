#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::common::validate_token;
use crate::ph1id::Identity;
use crate::{ContractViolation, SchemaVersion, Validate};

pub const PH1ENROLL_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const TAG_MAX_LEN: usize = 64;
pub const MAX_SKILLS: usize = 32;
pub const MAX_PREFERENCES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnrollmentSeq(pub u64);

/// Trims and lowercases tags, dropping blanks. Order is kept.
pub fn normalize_tags<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    raw.iter()
        .map(|t| t.as_ref().trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub identity: Identity,
    pub skills: BTreeSet<String>,
    /// First entry is the most preferred role.
    pub preferences: Vec<String>,
    pub enrollment_seq: EnrollmentSeq,
}

impl EnrollmentRecord {
    pub fn v1<S: AsRef<str>, P: AsRef<str>>(
        identity: Identity,
        skills: &[S],
        preferences: &[P],
        enrollment_seq: EnrollmentSeq,
    ) -> Result<Self, ContractViolation> {
        let skills: BTreeSet<String> = normalize_tags(skills).into_iter().collect();
        let mut seen = BTreeSet::new();
        let preferences: Vec<String> = normalize_tags(preferences)
            .into_iter()
            .filter(|p| seen.insert(p.clone()))
            .collect();
        let r = Self {
            identity,
            skills,
            preferences,
            enrollment_seq,
        };
        r.validate()?;
        Ok(r)
    }

    pub fn primary_preference(&self) -> &str {
        self.preferences.first().map(String::as_str).unwrap_or("")
    }
}

impl Validate for EnrollmentRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.identity.validate()?;
        if self.enrollment_seq.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "enrollment_record.enrollment_seq",
                reason: "must be > 0",
            });
        }
        if self.preferences.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "enrollment_record.preferences",
                reason: "must contain at least one role",
            });
        }
        if self.preferences.len() > MAX_PREFERENCES {
            return Err(ContractViolation::InvalidRange {
                field: "enrollment_record.preferences",
                min: 1,
                max: MAX_PREFERENCES as u64,
                got: self.preferences.len() as u64,
            });
        }
        if self.skills.len() > MAX_SKILLS {
            return Err(ContractViolation::InvalidRange {
                field: "enrollment_record.skills",
                min: 0,
                max: MAX_SKILLS as u64,
                got: self.skills.len() as u64,
            });
        }
        for p in &self.preferences {
            validate_token("enrollment_record.preferences", p, TAG_MAX_LEN)?;
        }
        for s in &self.skills {
            validate_token("enrollment_record.skills", s, TAG_MAX_LEN)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    #[test]
    fn at_enroll_contract_01_skills_are_deduplicated_and_normalized() {
        let r = EnrollmentRecord::v1(
            id("walleta"),
            &["Python", "python ", "ML", ""],
            &["Frontend"],
            EnrollmentSeq(1),
        )
        .unwrap();
        let skills: Vec<&str> = r.skills.iter().map(String::as_str).collect();
        assert_eq!(skills, vec!["ml", "python"]);
        assert_eq!(r.primary_preference(), "frontend");
    }

    #[test]
    fn at_enroll_contract_02_preference_order_kept_first_occurrence_wins() {
        let r = EnrollmentRecord::v1(
            id("walleta"),
            &[] as &[&str],
            &["infra", "ux", "INFRA", "leader"],
            EnrollmentSeq(3),
        )
        .unwrap();
        assert_eq!(r.preferences, vec!["infra", "ux", "leader"]);
    }

    #[test]
    fn at_enroll_contract_03_blank_preferences_rejected() {
        let err = EnrollmentRecord::v1(id("walleta"), &["ml"], &["  ", ""], EnrollmentSeq(1))
            .unwrap_err();
        assert!(matches!(
            err,
            ContractViolation::InvalidValue {
                field: "enrollment_record.preferences",
                ..
            }
        ));
    }
}
