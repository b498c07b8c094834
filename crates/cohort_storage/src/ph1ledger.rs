#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use cohort_kernel_contracts::ph1group::{GroupDraft, GroupId, GroupRecord};
use cohort_kernel_contracts::ph1hash::{MemberSetKey, PayloadHash};
use cohort_kernel_contracts::ph1id::Identity;
use cohort_kernel_contracts::{ContractViolation, Validate};

/// On-chain view of one group: immutable members, versioned metadata hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerGroupEntry {
    pub group_id: GroupId,
    pub members: Vec<Identity>,
    pub member_key: MemberSetKey,
    pub metadata_hash: PayloadHash,
    /// 0 at creation, +1 per accepted metadata write.
    pub metadata_version: u64,
}

impl LedgerGroupEntry {
    pub fn from_draft(draft: &GroupDraft) -> Self {
        Self {
            group_id: draft.group_id,
            members: draft.members.clone(),
            member_key: draft.member_key.clone(),
            metadata_hash: draft.metadata_hash.clone(),
            metadata_version: 0,
        }
    }

    pub fn to_record(&self) -> GroupRecord {
        GroupRecord {
            group_id: self.group_id,
            members: self.members.clone(),
            metadata_hash: self.metadata_hash.clone(),
        }
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.members.contains(identity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataWrite {
    pub group_id: GroupId,
    pub version: u64,
    pub submitter: Identity,
    pub metadata_hash: PayloadHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(LedgerGroupEntry),
    AlreadyExists(LedgerGroupEntry),
}

impl CreateOutcome {
    pub fn entry(&self) -> &LedgerGroupEntry {
        match self {
            CreateOutcome::Created(e) | CreateOutcome::AlreadyExists(e) => e,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("group {group_id} already exists with a different member set")]
    GroupIdTaken { group_id: GroupId },
    #[error("identity {identity} already belongs to group {group_id}")]
    MemberAlreadyGrouped { identity: Identity, group_id: GroupId },
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),
    #[error("identity {identity} is not authorized to write group {group_id}")]
    NotAuthorized { group_id: GroupId, identity: Identity },
    #[error("group {group_id} metadata version is {actual}, expected {expected}")]
    VersionMismatch {
        group_id: GroupId,
        expected: u64,
        actual: u64,
    },
    #[error("ledger journal error: {0}")]
    Journal(String),
    /// An append failed and could not be rolled back. Not retryable.
    #[error("ledger journal torn: {0}")]
    JournalTorn(String),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error("ledger state lock poisoned")]
    LockPoisoned,
}

/// What the engine needs from the ledger: create-if-absent and
/// compare-and-swap on the metadata hash, each an atomic single-writer
/// transaction, plus reads.
pub trait LedgerBackend: Send + Sync {
    fn create_if_absent(&self, draft: &GroupDraft) -> Result<CreateOutcome, LedgerError>;

    fn compare_and_swap_metadata(
        &self,
        group_id: GroupId,
        submitter: &Identity,
        expected_version: u64,
        new_hash: &PayloadHash,
    ) -> Result<LedgerGroupEntry, LedgerError>;

    fn read_group(&self, group_id: GroupId) -> Result<Option<LedgerGroupEntry>, LedgerError>;

    fn find_by_member_key(
        &self,
        key: &MemberSetKey,
    ) -> Result<Option<LedgerGroupEntry>, LedgerError>;

    fn find_group_for_member(
        &self,
        identity: &Identity,
    ) -> Result<Option<LedgerGroupEntry>, LedgerError>;

    /// Ordered by group id.
    fn list_groups(&self) -> Result<Vec<LedgerGroupEntry>, LedgerError>;

    /// Accepted metadata writes for one group, ordered by version.
    fn metadata_history(&self, group_id: GroupId) -> Result<Vec<MetadataWrite>, LedgerError>;

    fn total_groups(&self) -> Result<u64, LedgerError>;

    fn max_group_id(&self) -> Result<Option<GroupId>, LedgerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tx", rename_all = "snake_case")]
enum LedgerTx {
    CreateGroup { entry: LedgerGroupEntry },
    UpdateMetadata { write: MetadataWrite },
}

#[derive(Debug, Default)]
struct LedgerState {
    groups: BTreeMap<GroupId, LedgerGroupEntry>,
    member_key_index: BTreeMap<MemberSetKey, GroupId>,
    membership_index: BTreeMap<Identity, GroupId>,
    metadata_writes: BTreeMap<GroupId, Vec<MetadataWrite>>,
    total_groups: u64,
    journal: Option<File>,
}

impl LedgerState {
    fn check_create(&self, draft: &GroupDraft) -> Result<Option<LedgerGroupEntry>, LedgerError> {
        if let Some(existing) = self.member_key_index.get(&draft.member_key) {
            return Ok(self.groups.get(existing).cloned());
        }
        if self.groups.contains_key(&draft.group_id) {
            return Err(LedgerError::GroupIdTaken {
                group_id: draft.group_id,
            });
        }
        for m in &draft.members {
            if let Some(group_id) = self.membership_index.get(m) {
                return Err(LedgerError::MemberAlreadyGrouped {
                    identity: m.clone(),
                    group_id: *group_id,
                });
            }
        }
        Ok(None)
    }

    fn check_update(
        &self,
        group_id: GroupId,
        submitter: &Identity,
        expected_version: u64,
    ) -> Result<&LedgerGroupEntry, LedgerError> {
        let entry = self
            .groups
            .get(&group_id)
            .ok_or(LedgerError::UnknownGroup(group_id))?;
        if !entry.contains(submitter) {
            return Err(LedgerError::NotAuthorized {
                group_id,
                identity: submitter.clone(),
            });
        }
        if entry.metadata_version != expected_version {
            return Err(LedgerError::VersionMismatch {
                group_id,
                expected: expected_version,
                actual: entry.metadata_version,
            });
        }
        Ok(entry)
    }

    fn append_journal(&mut self, tx: &LedgerTx) -> Result<(), LedgerError> {
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };
        let line = serde_json::to_string(tx)
            .map_err(|err| LedgerError::Journal(format!("failed to encode ledger tx: {err}")))?;
        let start = journal
            .metadata()
            .map_err(|err| LedgerError::Journal(format!("failed to stat ledger journal: {err}")))?
            .len();
        match writeln!(journal, "{line}").and_then(|_| journal.flush()) {
            Ok(()) => Ok(()),
            // A partial line must not survive into the next append.
            Err(err) => match journal.set_len(start) {
                Ok(()) => Err(LedgerError::Journal(format!(
                    "failed to append ledger tx: {err}"
                ))),
                Err(cut_err) => Err(LedgerError::JournalTorn(format!(
                    "failed to append ledger tx: {err}; rollback failed: {cut_err}"
                ))),
            },
        }
    }

    fn apply(&mut self, tx: LedgerTx) {
        match tx {
            LedgerTx::CreateGroup { entry } => {
                self.member_key_index
                    .insert(entry.member_key.clone(), entry.group_id);
                for m in &entry.members {
                    self.membership_index.insert(m.clone(), entry.group_id);
                }
                self.total_groups = self.total_groups.saturating_add(1);
                self.groups.insert(entry.group_id, entry);
            }
            LedgerTx::UpdateMetadata { write } => {
                if let Some(entry) = self.groups.get_mut(&write.group_id) {
                    entry.metadata_hash = write.metadata_hash.clone();
                    entry.metadata_version = write.version;
                }
                self.metadata_writes
                    .entry(write.group_id)
                    .or_default()
                    .push(write);
            }
        }
    }

    fn replay(&mut self, tx: LedgerTx) -> Result<(), LedgerError> {
        match &tx {
            LedgerTx::CreateGroup { entry } => {
                let draft = GroupDraft::v1(
                    entry.group_id,
                    entry.members.clone(),
                    entry.member_key.clone(),
                    entry.metadata_hash.clone(),
                )?;
                if self.check_create(&draft)?.is_some() {
                    return Err(LedgerError::Journal(format!(
                        "group {} replayed twice",
                        entry.group_id
                    )));
                }
            }
            LedgerTx::UpdateMetadata { write } => {
                write.metadata_hash.validate()?;
                self.check_update(
                    write.group_id,
                    &write.submitter,
                    write.version.saturating_sub(1),
                )?;
            }
        }
        self.apply(tx);
        Ok(())
    }
}

/// Process-local ledger: one mutex makes every call an atomic single-writer
/// transaction. With a journal path, each committed transaction is appended
/// as a JSON line before it is applied and replayed on open.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    journal_path: Option<PathBuf>,
}

impl InMemoryLedger {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    pub fn open_journaled(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                LedgerError::Journal(format!(
                    "failed to create ledger journal directory '{}': {}",
                    parent.display(),
                    err
                ))
            })?;
        }
        let mut state = LedgerState::default();
        if path.exists() {
            replay_journal(&path, &mut state)?;
        }
        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                LedgerError::Journal(format!(
                    "failed to open ledger journal '{}': {}",
                    path.display(),
                    err
                ))
            })?;
        state.journal = Some(journal);
        Ok(Self {
            state: Mutex::new(state),
            journal_path: Some(path),
        })
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        self.state.lock().map_err(|_| LedgerError::LockPoisoned)
    }

}

/// Replays every committed line. A final line without its newline is a
/// write that never completed; it is cut off instead of failing the open.
fn replay_journal(path: &Path, state: &mut LedgerState) -> Result<(), LedgerError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        LedgerError::Journal(format!(
            "failed to read ledger journal '{}': {}",
            path.display(),
            err
        ))
    })?;
    let mut offset: u64 = 0;
    for (line_no, chunk) in raw.split_inclusive('\n').enumerate() {
        let start = offset;
        offset += chunk.len() as u64;
        let line = chunk.trim();
        if line.is_empty() {
            continue;
        }
        let tx: LedgerTx = match serde_json::from_str(line) {
            Ok(tx) => tx,
            Err(_) if !chunk.ends_with('\n') => {
                truncate_journal(path, start)?;
                break;
            }
            Err(err) => {
                return Err(LedgerError::Journal(format!(
                    "invalid ledger journal entry '{}' at line {}: {}",
                    path.display(),
                    line_no + 1,
                    err
                )))
            }
        };
        state.replay(tx)?;
    }
    Ok(())
}

fn truncate_journal(path: &Path, len: u64) -> Result<(), LedgerError> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|f| f.set_len(len))
        .map_err(|err| {
            LedgerError::Journal(format!(
                "failed to cut torn tail of ledger journal '{}': {}",
                path.display(),
                err
            ))
        })
}

impl LedgerBackend for InMemoryLedger {
    fn create_if_absent(&self, draft: &GroupDraft) -> Result<CreateOutcome, LedgerError> {
        draft.validate()?;
        let mut state = self.lock()?;
        if let Some(existing) = state.check_create(draft)? {
            return Ok(CreateOutcome::AlreadyExists(existing));
        }
        let entry = LedgerGroupEntry::from_draft(draft);
        let tx = LedgerTx::CreateGroup {
            entry: entry.clone(),
        };
        state.append_journal(&tx)?;
        state.apply(tx);
        Ok(CreateOutcome::Created(entry))
    }

    fn compare_and_swap_metadata(
        &self,
        group_id: GroupId,
        submitter: &Identity,
        expected_version: u64,
        new_hash: &PayloadHash,
    ) -> Result<LedgerGroupEntry, LedgerError> {
        new_hash.validate()?;
        let mut state = self.lock()?;
        state.check_update(group_id, submitter, expected_version)?;
        let tx = LedgerTx::UpdateMetadata {
            write: MetadataWrite {
                group_id,
                version: expected_version.saturating_add(1),
                submitter: submitter.clone(),
                metadata_hash: new_hash.clone(),
            },
        };
        state.append_journal(&tx)?;
        state.apply(tx);
        state
            .groups
            .get(&group_id)
            .cloned()
            .ok_or(LedgerError::UnknownGroup(group_id))
    }

    fn read_group(&self, group_id: GroupId) -> Result<Option<LedgerGroupEntry>, LedgerError> {
        Ok(self.lock()?.groups.get(&group_id).cloned())
    }

    fn find_by_member_key(
        &self,
        key: &MemberSetKey,
    ) -> Result<Option<LedgerGroupEntry>, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .member_key_index
            .get(key)
            .and_then(|id| state.groups.get(id))
            .cloned())
    }

    fn find_group_for_member(
        &self,
        identity: &Identity,
    ) -> Result<Option<LedgerGroupEntry>, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .membership_index
            .get(identity)
            .and_then(|id| state.groups.get(id))
            .cloned())
    }

    fn list_groups(&self) -> Result<Vec<LedgerGroupEntry>, LedgerError> {
        Ok(self.lock()?.groups.values().cloned().collect())
    }

    fn metadata_history(&self, group_id: GroupId) -> Result<Vec<MetadataWrite>, LedgerError> {
        let state = self.lock()?;
        if !state.groups.contains_key(&group_id) {
            return Err(LedgerError::UnknownGroup(group_id));
        }
        Ok(state
            .metadata_writes
            .get(&group_id)
            .cloned()
            .unwrap_or_default())
    }

    fn total_groups(&self) -> Result<u64, LedgerError> {
        Ok(self.lock()?.total_groups)
    }

    fn max_group_id(&self) -> Result<Option<GroupId>, LedgerError> {
        Ok(self.lock()?.groups.keys().next_back().copied())
    }
}
