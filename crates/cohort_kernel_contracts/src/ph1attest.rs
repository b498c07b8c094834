#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::ph1group::GroupId;
use crate::ph1hash::PayloadHash;
use crate::ph1id::Identity;
use crate::{ContractViolation, Validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttestationSeq(pub u64);

impl AttestationSeq {
    pub fn next(self) -> AttestationSeq {
        AttestationSeq(self.0.saturating_add(1))
    }
}

/// One accepted attendance/performance submission. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationEntry {
    pub group_id: GroupId,
    pub submitter: Identity,
    pub payload_hash: PayloadHash,
    pub sequence_no: AttestationSeq,
}

impl AttestationEntry {
    pub fn v1(
        group_id: GroupId,
        submitter: Identity,
        payload_hash: PayloadHash,
        sequence_no: AttestationSeq,
    ) -> Result<Self, ContractViolation> {
        let e = Self {
            group_id,
            submitter,
            payload_hash,
            sequence_no,
        };
        e.validate()?;
        Ok(e)
    }
}

impl Validate for AttestationEntry {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.group_id.validate()?;
        self.submitter.validate()?;
        self.payload_hash.validate()?;
        if self.sequence_no.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "attestation_entry.sequence_no",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}
