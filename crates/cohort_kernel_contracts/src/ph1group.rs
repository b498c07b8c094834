#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ph1hash::{MemberSetKey, PayloadHash};
use crate::ph1id::Identity;
use crate::{ContractViolation, SchemaVersion, Validate};

pub const PH1GROUP_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const MAX_GROUP_MEMBERS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl GroupId {
    pub fn next(self) -> GroupId {
        GroupId(self.0.saturating_add(1))
    }
}

impl Validate for GroupId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "group_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn validate_members(field: &'static str, members: &[Identity]) -> Result<(), ContractViolation> {
    if members.is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must contain at least one member",
        });
    }
    if members.len() > MAX_GROUP_MEMBERS {
        return Err(ContractViolation::InvalidRange {
            field,
            min: 1,
            max: MAX_GROUP_MEMBERS as u64,
            got: members.len() as u64,
        });
    }
    let mut seen = BTreeSet::new();
    for m in members {
        m.validate()?;
        if !seen.insert(m) {
            return Err(ContractViolation::InvalidValue {
                field,
                reason: "must not list an identity twice",
            });
        }
    }
    Ok(())
}

/// Sorted copy of a member list; the canonical form hashed into a [`MemberSetKey`].
pub fn sorted_members(members: &[Identity]) -> Vec<Identity> {
    let mut sorted = members.to_vec();
    sorted.sort();
    sorted
}

/// Uncommitted group as produced by allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDraft {
    pub schema_version: SchemaVersion,
    pub group_id: GroupId,
    /// Assignment order.
    pub members: Vec<Identity>,
    pub member_key: MemberSetKey,
    pub metadata_hash: PayloadHash,
}

impl GroupDraft {
    pub fn v1(
        group_id: GroupId,
        members: Vec<Identity>,
        member_key: MemberSetKey,
        metadata_hash: PayloadHash,
    ) -> Result<Self, ContractViolation> {
        let d = Self {
            schema_version: PH1GROUP_CONTRACT_VERSION,
            group_id,
            members,
            member_key,
            metadata_hash,
        };
        d.validate()?;
        Ok(d)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.members.contains(identity)
    }
}

impl Validate for GroupDraft {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1GROUP_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "group_draft.schema_version",
                reason: "must match PH1GROUP_CONTRACT_VERSION",
            });
        }
        self.group_id.validate()?;
        validate_members("group_draft.members", &self.members)?;
        self.member_key.validate()?;
        self.metadata_hash.validate()?;
        Ok(())
    }
}

/// Committed group. Membership never changes after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub group_id: GroupId,
    pub members: Vec<Identity>,
    pub metadata_hash: PayloadHash,
}

impl GroupRecord {
    pub fn contains(&self, identity: &Identity) -> bool {
        self.members.contains(identity)
    }
}

impl Validate for GroupRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.group_id.validate()?;
        validate_members("group_record.members", &self.members)?;
        self.metadata_hash.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<Identity> {
        raw.iter().map(|s| Identity::parse(s).unwrap()).collect()
    }

    fn key() -> MemberSetKey {
        MemberSetKey::parse(&"0".repeat(64)).unwrap()
    }

    #[test]
    fn at_group_contract_01_draft_rejects_zero_id_and_duplicates() {
        assert!(GroupDraft::v1(GroupId(0), ids(&["a", "b"]), key(), key().to_genesis_hash()).is_err());
        assert!(GroupDraft::v1(GroupId(1), ids(&["a", "A"]), key(), key().to_genesis_hash()).is_err());
        assert!(GroupDraft::v1(GroupId(1), Vec::new(), key(), key().to_genesis_hash()).is_err());
        assert!(GroupDraft::v1(GroupId(1), ids(&["a", "b"]), key(), key().to_genesis_hash()).is_ok());
    }

    #[test]
    fn at_group_contract_02_sorted_members_is_order_independent() {
        assert_eq!(
            sorted_members(&ids(&["c", "a", "b"])),
            sorted_members(&ids(&["b", "c", "a"]))
        );
    }
}
