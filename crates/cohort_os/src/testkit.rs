#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cohort_engines::ph1hash::ContentHasher;
use cohort_kernel_contracts::ph1group::{GroupDraft, GroupId};
use cohort_kernel_contracts::ph1hash::{MemberSetKey, PayloadHash};
use cohort_kernel_contracts::ph1id::Identity;
use cohort_storage::ph1ledger::{
    CreateOutcome, InMemoryLedger, LedgerBackend, LedgerError, LedgerGroupEntry, MetadataWrite,
};

use crate::ph1ledger::{LedgerGateway, LedgerGatewayConfig};

pub fn id(s: &str) -> Identity {
    Identity::parse(s).unwrap()
}

pub fn hash(s: &str) -> PayloadHash {
    ContentHasher::digest(s.as_bytes())
}

pub fn draft(group_id: u64, members: &[&str]) -> GroupDraft {
    let members: Vec<Identity> = members.iter().map(|m| id(m)).collect();
    let key = ContentHasher::member_set_key(&members);
    let genesis = key.to_genesis_hash();
    GroupDraft::v1(GroupId(group_id), members, key, genesis).unwrap()
}

pub fn fast_config() -> LedgerGatewayConfig {
    LedgerGatewayConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        call_timeout: Duration::from_secs(2),
    }
}

pub fn gateway_over(backend: Arc<dyn LedgerBackend>) -> LedgerGateway {
    LedgerGateway::new(backend, fast_config())
}

pub fn flaky(failures: u32) -> Arc<FlakyLedger> {
    Arc::new(FlakyLedger::failing(failures))
}

/// Fails the next `failures` calls with `Unavailable`, then behaves.
/// Optionally applies one CAS and then reports it as failed.
#[derive(Debug, Default)]
pub struct FlakyLedger {
    inner: InMemoryLedger,
    failures_left: AtomicU32,
    calls: AtomicU32,
    lose_cas_reply: AtomicBool,
}

impl FlakyLedger {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    pub fn lose_next_cas_reply() -> Self {
        Self {
            lose_cas_reply: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn set_failures(&self, failures: u32) {
        self.failures_left.store(failures, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<(), LedgerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(LedgerError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

impl LedgerBackend for FlakyLedger {
    fn create_if_absent(&self, draft: &GroupDraft) -> Result<CreateOutcome, LedgerError> {
        self.gate()?;
        self.inner.create_if_absent(draft)
    }

    fn compare_and_swap_metadata(
        &self,
        group_id: GroupId,
        submitter: &Identity,
        expected_version: u64,
        new_hash: &PayloadHash,
    ) -> Result<LedgerGroupEntry, LedgerError> {
        self.gate()?;
        let out = self
            .inner
            .compare_and_swap_metadata(group_id, submitter, expected_version, new_hash)?;
        if self.lose_cas_reply.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("reply lost".to_string()));
        }
        Ok(out)
    }

    fn read_group(&self, group_id: GroupId) -> Result<Option<LedgerGroupEntry>, LedgerError> {
        self.gate()?;
        self.inner.read_group(group_id)
    }

    fn find_by_member_key(
        &self,
        key: &MemberSetKey,
    ) -> Result<Option<LedgerGroupEntry>, LedgerError> {
        self.gate()?;
        self.inner.find_by_member_key(key)
    }

    fn find_group_for_member(
        &self,
        identity: &Identity,
    ) -> Result<Option<LedgerGroupEntry>, LedgerError> {
        self.gate()?;
        self.inner.find_group_for_member(identity)
    }

    fn list_groups(&self) -> Result<Vec<LedgerGroupEntry>, LedgerError> {
        self.gate()?;
        self.inner.list_groups()
    }

    fn metadata_history(&self, group_id: GroupId) -> Result<Vec<MetadataWrite>, LedgerError> {
        self.gate()?;
        self.inner.metadata_history(group_id)
    }

    fn total_groups(&self) -> Result<u64, LedgerError> {
        self.gate()?;
        self.inner.total_groups()
    }

    fn max_group_id(&self) -> Result<Option<GroupId>, LedgerError> {
        self.gate()?;
        self.inner.max_group_id()
    }
}

/// Sleeps before calls to widen race windows.
#[derive(Debug)]
pub struct SlowLedger {
    inner: InMemoryLedger,
    read_delay: Duration,
    write_delay: Duration,
}

impl SlowLedger {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryLedger::new_in_memory(),
            read_delay: delay,
            write_delay: delay,
        }
    }

    /// Only creates and metadata writes are slow.
    pub fn slow_writes(delay: Duration) -> Self {
        Self {
            inner: InMemoryLedger::new_in_memory(),
            read_delay: Duration::ZERO,
            write_delay: delay,
        }
    }

    fn pause(&self) {
        thread::sleep(self.read_delay);
    }

    fn pause_write(&self) {
        thread::sleep(self.write_delay);
    }
}

impl LedgerBackend for SlowLedger {
    fn create_if_absent(&self, draft: &GroupDraft) -> Result<CreateOutcome, LedgerError> {
        self.pause_write();
        self.inner.create_if_absent(draft)
    }

    fn compare_and_swap_metadata(
        &self,
        group_id: GroupId,
        submitter: &Identity,
        expected_version: u64,
        new_hash: &PayloadHash,
    ) -> Result<LedgerGroupEntry, LedgerError> {
        self.pause_write();
        self.inner
            .compare_and_swap_metadata(group_id, submitter, expected_version, new_hash)
    }

    fn read_group(&self, group_id: GroupId) -> Result<Option<LedgerGroupEntry>, LedgerError> {
        self.pause();
        self.inner.read_group(group_id)
    }

    fn find_by_member_key(
        &self,
        key: &MemberSetKey,
    ) -> Result<Option<LedgerGroupEntry>, LedgerError> {
        self.pause();
        self.inner.find_by_member_key(key)
    }

    fn find_group_for_member(
        &self,
        identity: &Identity,
    ) -> Result<Option<LedgerGroupEntry>, LedgerError> {
        self.pause();
        self.inner.find_group_for_member(identity)
    }

    fn list_groups(&self) -> Result<Vec<LedgerGroupEntry>, LedgerError> {
        self.inner.list_groups()
    }

    fn metadata_history(&self, group_id: GroupId) -> Result<Vec<MetadataWrite>, LedgerError> {
        self.inner.metadata_history(group_id)
    }

    fn total_groups(&self) -> Result<u64, LedgerError> {
        self.inner.total_groups()
    }

    fn max_group_id(&self) -> Result<Option<GroupId>, LedgerError> {
        self.inner.max_group_id()
    }
}

/// Lets a second writer slip a metadata write in just before the next CAS.
#[derive(Debug, Default)]
pub struct RacingLedger {
    inner: InMemoryLedger,
    armed: Mutex<Option<(GroupId, Identity, PayloadHash)>>,
}

impl RacingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, group_id: GroupId, submitter: Identity, hash: PayloadHash) {
        *self.armed.lock().unwrap() = Some((group_id, submitter, hash));
    }

    /// Writes directly, bypassing any gateway.
    pub fn external_write(&self, group_id: GroupId, submitter: &Identity, hash: &PayloadHash) {
        let version = self
            .inner
            .read_group(group_id)
            .unwrap()
            .unwrap()
            .metadata_version;
        self.inner
            .compare_and_swap_metadata(group_id, submitter, version, hash)
            .unwrap();
    }
}

impl LedgerBackend for RacingLedger {
    fn create_if_absent(&self, draft: &GroupDraft) -> Result<CreateOutcome, LedgerError> {
        self.inner.create_if_absent(draft)
    }

    fn compare_and_swap_metadata(
        &self,
        group_id: GroupId,
        submitter: &Identity,
        expected_version: u64,
        new_hash: &PayloadHash,
    ) -> Result<LedgerGroupEntry, LedgerError> {
        let armed = self.armed.lock().unwrap().take();
        if let Some((gid, who, h)) = armed {
            self.external_write(gid, &who, &h);
        }
        self.inner
            .compare_and_swap_metadata(group_id, submitter, expected_version, new_hash)
    }

    fn read_group(&self, group_id: GroupId) -> Result<Option<LedgerGroupEntry>, LedgerError> {
        self.inner.read_group(group_id)
    }

    fn find_by_member_key(
        &self,
        key: &MemberSetKey,
    ) -> Result<Option<LedgerGroupEntry>, LedgerError> {
        self.inner.find_by_member_key(key)
    }

    fn find_group_for_member(
        &self,
        identity: &Identity,
    ) -> Result<Option<LedgerGroupEntry>, LedgerError> {
        self.inner.find_group_for_member(identity)
    }

    fn list_groups(&self) -> Result<Vec<LedgerGroupEntry>, LedgerError> {
        self.inner.list_groups()
    }

    fn metadata_history(&self, group_id: GroupId) -> Result<Vec<MetadataWrite>, LedgerError> {
        self.inner.metadata_history(group_id)
    }

    fn total_groups(&self) -> Result<u64, LedgerError> {
        self.inner.total_groups()
    }

    fn max_group_id(&self) -> Result<Option<GroupId>, LedgerError> {
        self.inner.max_group_id()
    }
}
