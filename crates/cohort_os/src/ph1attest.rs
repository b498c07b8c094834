#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use cohort_engines::ph1hash::ContentHasher;
use cohort_kernel_contracts::ph1attest::{AttestationEntry, AttestationSeq};
use cohort_kernel_contracts::ph1group::GroupId;
use cohort_kernel_contracts::ph1hash::PayloadHash;
use cohort_kernel_contracts::ph1id::Identity;
use cohort_kernel_contracts::{ContractViolation, Validate};

use crate::keyed_lock::KeyedLocks;
use crate::ph1ledger::{GatewayError, LedgerGateway};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttestationError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("invalid attestation: {0}")]
    Invalid(#[from] ContractViolation),
    #[error("attestation mirror lock poisoned")]
    LockPoisoned,
}

/// Snapshot of one group's attestations ordered by sequence number.
/// Cheap to clone; every call to [`AttestationHistory::iter`] starts over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationHistory {
    group_id: GroupId,
    entries: Arc<[AttestationEntry]>,
}

impl AttestationHistory {
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AttestationEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&AttestationEntry> {
        self.entries.last()
    }
}

impl<'a> IntoIterator for &'a AttestationHistory {
    type Item = &'a AttestationEntry;
    type IntoIter = std::slice::Iter<'a, AttestationEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Default)]
struct GroupMirror {
    entries: Vec<AttestationEntry>,
    diverged: bool,
    /// Set while a submit is waiting on the ledger; left set if that submit
    /// is dropped before it hears back.
    write_pending: bool,
}

impl GroupMirror {
    fn last_seq(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.sequence_no.0)
    }

    fn is_stale(&self) -> bool {
        self.diverged || self.write_pending
    }
}

/// Local append-only mirror of accepted attestations. Ledger history is the
/// source of truth; the mirror is rebuilt from it whenever a gap shows up.
#[derive(Debug)]
pub struct AttestationLog {
    gateway: LedgerGateway,
    locks: Arc<KeyedLocks>,
    mirror: Mutex<BTreeMap<GroupId, GroupMirror>>,
}

impl AttestationLog {
    pub fn new(gateway: LedgerGateway) -> Self {
        Self {
            gateway,
            locks: KeyedLocks::new(),
            mirror: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn gateway(&self) -> &LedgerGateway {
        &self.gateway
    }

    fn lock_mirror(&self) -> Result<MutexGuard<'_, BTreeMap<GroupId, GroupMirror>>, AttestationError> {
        self.mirror.lock().map_err(|_| AttestationError::LockPoisoned)
    }

    pub async fn submit(
        &self,
        group_id: GroupId,
        identity: Identity,
        payload: &[u8],
    ) -> Result<AttestationEntry, AttestationError> {
        let payload_hash = ContentHasher::digest(payload);
        self.submit_hash(group_id, identity, payload_hash).await
    }

    pub async fn submit_hash(
        &self,
        group_id: GroupId,
        identity: Identity,
        payload_hash: PayloadHash,
    ) -> Result<AttestationEntry, AttestationError> {
        self.submit_hash_expecting(group_id, identity, payload_hash, None)
            .await
    }

    /// As [`Self::submit_hash`], but the write only lands if the group's
    /// current hash equals `expected_hash`.
    pub async fn submit_hash_expecting(
        &self,
        group_id: GroupId,
        identity: Identity,
        payload_hash: PayloadHash,
        expected_hash: Option<PayloadHash>,
    ) -> Result<AttestationEntry, AttestationError> {
        group_id.validate()?;
        identity.validate()?;
        payload_hash.validate()?;

        let _guard = self.locks.acquire(format!("attest:{group_id}")).await;
        self.lock_mirror()?.entry(group_id).or_default().write_pending = true;
        let result = self
            .gateway
            .update_metadata(group_id, identity.clone(), payload_hash.clone(), expected_hash)
            .await;

        let mut mirror = self.lock_mirror()?;
        let group = mirror.entry(group_id).or_default();
        group.write_pending = false;
        let commit = match result {
            Ok(commit) => commit,
            Err(err) => {
                if err.is_indeterminate() {
                    warn!(%group_id, error = %err, "attestation outcome unknown, mirror marked diverged");
                    group.diverged = true;
                }
                return Err(err.into());
            }
        };
        let entry = AttestationEntry::v1(
            group_id,
            identity,
            payload_hash,
            AttestationSeq(commit.metadata_version),
        )?;

        let expected_seq = group.last_seq() + 1;
        if group.diverged || entry.sequence_no.0 != expected_seq {
            if !group.diverged {
                warn!(
                    %group_id,
                    expected = expected_seq,
                    got = entry.sequence_no.0,
                    "attestation mirror diverged from ledger"
                );
            }
            group.diverged = true;
        } else {
            group.entries.push(entry.clone());
        }
        info!(%group_id, seq = entry.sequence_no.0, submitter = %entry.submitter, "attestation accepted");
        Ok(entry)
    }

    /// Serves the mirror, rebuilding it from ledger history first when the
    /// group is diverged, has a write of unknown outcome, or has never been
    /// mirrored.
    pub async fn read_history(&self, group_id: GroupId) -> Result<AttestationHistory, AttestationError> {
        group_id.validate()?;
        let _guard = self.locks.acquire(format!("attest:{group_id}")).await;
        {
            let mirror = self.lock_mirror()?;
            if let Some(group) = mirror.get(&group_id).filter(|g| !g.is_stale()) {
                return Ok(AttestationHistory {
                    group_id,
                    entries: group.entries.clone().into(),
                });
            }
        }
        self.reconcile_locked(group_id).await
    }

    /// Forces a rebuild of the group's mirror from ledger history.
    pub async fn reconcile(&self, group_id: GroupId) -> Result<AttestationHistory, AttestationError> {
        group_id.validate()?;
        let _guard = self.locks.acquire(format!("attest:{group_id}")).await;
        self.reconcile_locked(group_id).await
    }

    async fn reconcile_locked(&self, group_id: GroupId) -> Result<AttestationHistory, AttestationError> {
        let writes = self.gateway.settled_metadata_history(group_id).await?;
        let entries = writes
            .into_iter()
            .map(|w| {
                AttestationEntry::v1(w.group_id, w.submitter, w.metadata_hash, AttestationSeq(w.version))
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(%group_id, entries = entries.len(), "attestation mirror reconciled from ledger");

        let history = AttestationHistory {
            group_id,
            entries: entries.clone().into(),
        };
        self.lock_mirror()?.insert(
            group_id,
            GroupMirror {
                entries,
                ..GroupMirror::default()
            },
        );
        Ok(history)
    }

    pub fn is_diverged(&self, group_id: GroupId) -> Result<bool, AttestationError> {
        Ok(self
            .lock_mirror()?
            .get(&group_id)
            .is_some_and(GroupMirror::is_stale))
    }
}
