#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use cohort_kernel_contracts::ph1group::{GroupDraft, GroupId, GroupRecord};
use cohort_kernel_contracts::ph1hash::PayloadHash;
use cohort_kernel_contracts::ph1id::Identity;
use cohort_kernel_contracts::{ContractViolation, Validate};
use cohort_storage::ph1ledger::{
    CreateOutcome, LedgerBackend, LedgerError, LedgerGroupEntry, MetadataWrite,
};

use crate::keyed_lock::KeyedLocks;

pub const LEDGER_MAX_ATTEMPTS_DEFAULT: u32 = 4;
pub const LEDGER_INITIAL_BACKOFF_MS_DEFAULT: u64 = 50;
pub const LEDGER_MAX_BACKOFF_MS_DEFAULT: u64 = 2_000;
pub const LEDGER_CALL_TIMEOUT_MS_DEFAULT: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerGatewayConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
}

impl LedgerGatewayConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_attempts: LEDGER_MAX_ATTEMPTS_DEFAULT,
            initial_backoff: Duration::from_millis(LEDGER_INITIAL_BACKOFF_MS_DEFAULT),
            max_backoff: Duration::from_millis(LEDGER_MAX_BACKOFF_MS_DEFAULT),
            call_timeout: Duration::from_millis(LEDGER_CALL_TIMEOUT_MS_DEFAULT),
        }
    }

    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for LedgerGatewayConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    Invalid(#[from] ContractViolation),
    #[error("identity {identity} is not a member of group {group_id}")]
    NotAMember { group_id: GroupId, identity: Identity },
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),
    #[error("conflicting write on group {group_id}: {reason}")]
    Conflict { group_id: GroupId, reason: String },
    #[error("group id {group_id} is already taken by a different member set")]
    GroupIdTaken { group_id: GroupId },
    #[error("identity {identity} already belongs to group {group_id}")]
    MemberAlreadyGrouped { identity: Identity, group_id: GroupId },
    #[error("ledger unavailable after {attempts} attempts: {last_error}")]
    LedgerUnavailable { attempts: u32, last_error: String },
    #[error("ledger call cancelled after {timeout_ms}ms")]
    Cancelled { timeout_ms: u64 },
    #[error("ledger gateway internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The write may still have landed on the ledger.
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            GatewayError::Cancelled { .. } | GatewayError::LedgerUnavailable { .. }
        )
    }

    fn from_ledger(err: LedgerError) -> Self {
        match err {
            LedgerError::GroupIdTaken { group_id } => GatewayError::GroupIdTaken { group_id },
            LedgerError::MemberAlreadyGrouped { identity, group_id } => {
                GatewayError::MemberAlreadyGrouped { identity, group_id }
            }
            LedgerError::UnknownGroup(group_id) => GatewayError::UnknownGroup(group_id),
            LedgerError::NotAuthorized { group_id, identity } => {
                GatewayError::NotAMember { group_id, identity }
            }
            LedgerError::VersionMismatch {
                group_id,
                expected,
                actual,
            } => GatewayError::Conflict {
                group_id,
                reason: format!("metadata version moved from {expected} to {actual}"),
            },
            LedgerError::Contract(v) => GatewayError::Invalid(v),
            LedgerError::Unavailable(msg) | LedgerError::Journal(msg) => {
                GatewayError::LedgerUnavailable {
                    attempts: 1,
                    last_error: msg,
                }
            }
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

fn is_transient(err: &LedgerError) -> bool {
    matches!(err, LedgerError::Unavailable(_) | LedgerError::Journal(_))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateGroupOutcome {
    Committed(GroupRecord),
    AlreadyExists(GroupRecord),
}

impl CreateGroupOutcome {
    pub fn record(&self) -> &GroupRecord {
        match self {
            CreateGroupOutcome::Committed(r) | CreateGroupOutcome::AlreadyExists(r) => r,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, CreateGroupOutcome::Committed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataCommit {
    pub record: GroupRecord,
    /// Ledger version produced by this write.
    pub metadata_version: u64,
}

/// Sole path to the ledger. Same-key calls queue behind one another,
/// transient ledger failures are retried with capped exponential backoff,
/// and every call runs on its own task so a caller timeout can never leave
/// a half-applied write behind.
#[derive(Clone)]
pub struct LedgerGateway {
    backend: Arc<dyn LedgerBackend>,
    locks: Arc<KeyedLocks>,
    config: LedgerGatewayConfig,
}

impl std::fmt::Debug for LedgerGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerGateway")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LedgerGateway {
    pub fn new(backend: Arc<dyn LedgerBackend>, config: LedgerGatewayConfig) -> Self {
        Self {
            backend,
            locks: KeyedLocks::new(),
            config,
        }
    }

    pub fn config(&self) -> &LedgerGatewayConfig {
        &self.config
    }

    pub async fn create_group(&self, draft: GroupDraft) -> Result<CreateGroupOutcome, GatewayError> {
        draft.validate()?;
        let key = format!("members:{}", draft.member_key);
        let this = self.clone();
        self.run_keyed(key, async move { this.create_group_locked(draft).await })
            .await
    }

    async fn create_group_locked(&self, draft: GroupDraft) -> Result<CreateGroupOutcome, GatewayError> {
        let backend = self.backend.clone();
        let member_key = draft.member_key.clone();
        let existing = self
            .with_retry("find_by_member_key", move || {
                backend.find_by_member_key(&member_key)
            })
            .await?;
        if let Some(existing) = existing {
            debug!(group_id = %existing.group_id, "create_group collapsed onto committed member set");
            return Ok(CreateGroupOutcome::AlreadyExists(existing.to_record()));
        }

        let backend = self.backend.clone();
        let draft = Arc::new(draft);
        let outcome = self
            .with_retry("create_if_absent", move || backend.create_if_absent(&draft))
            .await?;
        Ok(match outcome {
            CreateOutcome::Created(entry) => {
                info!(group_id = %entry.group_id, members = entry.members.len(), "group committed");
                CreateGroupOutcome::Committed(entry.to_record())
            }
            CreateOutcome::AlreadyExists(entry) => {
                debug!(group_id = %entry.group_id, "group already committed");
                CreateGroupOutcome::AlreadyExists(entry.to_record())
            }
        })
    }

    /// Read-modify-write of the metadata hash. `expected_hash`, when given,
    /// must match the current on-chain hash.
    pub async fn update_metadata(
        &self,
        group_id: GroupId,
        identity: Identity,
        new_hash: PayloadHash,
        expected_hash: Option<PayloadHash>,
    ) -> Result<MetadataCommit, GatewayError> {
        group_id.validate()?;
        identity.validate()?;
        new_hash.validate()?;
        let key = format!("group:{group_id}");
        let this = self.clone();
        self.run_keyed(key, async move {
            this.update_metadata_locked(group_id, identity, new_hash, expected_hash)
                .await
        })
        .await
    }

    async fn update_metadata_locked(
        &self,
        group_id: GroupId,
        identity: Identity,
        new_hash: PayloadHash,
        expected_hash: Option<PayloadHash>,
    ) -> Result<MetadataCommit, GatewayError> {
        let current = self
            .read_entry(group_id)
            .await?
            .ok_or(GatewayError::UnknownGroup(group_id))?;
        if !current.contains(&identity) {
            return Err(GatewayError::NotAMember { group_id, identity });
        }
        if let Some(expected) = &expected_hash {
            if expected != &current.metadata_hash {
                return Err(GatewayError::Conflict {
                    group_id,
                    reason: "metadata hash differs from expected".to_string(),
                });
            }
        }

        let expected_version = current.metadata_version;
        let backend = self.backend.clone();
        let (who, hash) = (identity.clone(), new_hash.clone());
        let result = self
            .with_retry("compare_and_swap_metadata", move || {
                backend.compare_and_swap_metadata(group_id, &who, expected_version, &hash)
            })
            .await;
        let err = match result {
            Ok(entry) => {
                info!(%group_id, version = entry.metadata_version, "group metadata updated");
                return Ok(MetadataCommit {
                    record: entry.to_record(),
                    metadata_version: entry.metadata_version,
                });
            }
            Err(err @ GatewayError::Conflict { .. }) => err,
            Err(err) => return Err(err),
        };

        if !self
            .write_already_applied(group_id, &identity, expected_version, &new_hash)
            .await?
        {
            warn!(%group_id, "metadata write lost a race with a concurrent writer");
            return Err(err);
        }
        let entry = self
            .read_entry(group_id)
            .await?
            .ok_or(GatewayError::UnknownGroup(group_id))?;
        debug!(%group_id, "metadata write was applied by an earlier attempt");
        Ok(MetadataCommit {
            record: entry.to_record(),
            metadata_version: expected_version + 1,
        })
    }

    /// A retried CAS whose first attempt landed but whose reply was lost
    /// shows up as a version mismatch; recognise our own write.
    async fn write_already_applied(
        &self,
        group_id: GroupId,
        identity: &Identity,
        expected_version: u64,
        new_hash: &PayloadHash,
    ) -> Result<bool, GatewayError> {
        let history = self.metadata_history(group_id).await?;
        Ok(history.iter().any(|w| {
            w.version == expected_version + 1
                && &w.submitter == identity
                && &w.metadata_hash == new_hash
        }))
    }

    pub async fn group(&self, group_id: GroupId) -> Result<Option<GroupRecord>, GatewayError> {
        Ok(self.read_entry(group_id).await?.map(|e| e.to_record()))
    }

    pub async fn group_for_member(
        &self,
        identity: &Identity,
    ) -> Result<Option<GroupRecord>, GatewayError> {
        let backend = self.backend.clone();
        let identity = identity.clone();
        let entry = self
            .read_with_timeout("find_group_for_member", move || {
                backend.find_group_for_member(&identity)
            })
            .await?;
        Ok(entry.map(|e| e.to_record()))
    }

    /// Committed groups ordered by group id.
    pub async fn groups(&self) -> Result<Vec<GroupRecord>, GatewayError> {
        let backend = self.backend.clone();
        let entries = self
            .read_with_timeout("list_groups", move || backend.list_groups())
            .await?;
        Ok(entries.iter().map(LedgerGroupEntry::to_record).collect())
    }

    pub async fn metadata_history(
        &self,
        group_id: GroupId,
    ) -> Result<Vec<MetadataWrite>, GatewayError> {
        let backend = self.backend.clone();
        self.read_with_timeout("metadata_history", move || {
            backend.metadata_history(group_id)
        })
        .await
    }

    /// As [`Self::metadata_history`], but queued behind any write already in
    /// flight for the group, including one whose caller has timed out.
    pub async fn settled_metadata_history(
        &self,
        group_id: GroupId,
    ) -> Result<Vec<MetadataWrite>, GatewayError> {
        group_id.validate()?;
        let key = format!("group:{group_id}");
        let this = self.clone();
        self.run_keyed(key, async move { this.metadata_history(group_id).await })
            .await
    }

    pub async fn next_group_id(&self) -> Result<GroupId, GatewayError> {
        let backend = self.backend.clone();
        let max = self
            .read_with_timeout("max_group_id", move || backend.max_group_id())
            .await?;
        Ok(max.map_or(GroupId(1), GroupId::next))
    }

    async fn read_entry(&self, group_id: GroupId) -> Result<Option<LedgerGroupEntry>, GatewayError> {
        let backend = self.backend.clone();
        self.read_with_timeout("read_group", move || backend.read_group(group_id))
            .await
    }

    async fn read_with_timeout<T, F>(&self, op: &'static str, f: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: Fn() -> Result<T, LedgerError> + Send + Sync + 'static,
    {
        match tokio::time::timeout(self.config.call_timeout, self.with_retry(op, f)).await {
            Ok(result) => result,
            Err(_) => Err(self.cancelled(op)),
        }
    }

    fn cancelled(&self, op: &'static str) -> GatewayError {
        let timeout_ms = u64::try_from(self.config.call_timeout.as_millis()).unwrap_or(u64::MAX);
        warn!(op, timeout_ms, "ledger call cancelled by caller timeout");
        GatewayError::Cancelled { timeout_ms }
    }

    /// Runs `work` on its own task while holding the lock for `key`. The
    /// caller may give up after `call_timeout`; the task still runs to
    /// completion so the ledger ends up either untouched or fully written.
    async fn run_keyed<T, Fut>(&self, key: String, work: Fut) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let locks = self.locks.clone();
        let task = tokio::spawn(async move {
            let _guard = locks.acquire(key).await;
            work.await
        });
        match tokio::time::timeout(self.config.call_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(GatewayError::Internal(format!(
                "ledger task failed: {join_err}"
            ))),
            Err(_) => Err(self.cancelled("keyed_write")),
        }
    }

    async fn with_retry<T, F>(&self, op: &'static str, f: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: Fn() -> Result<T, LedgerError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let call = f.clone();
            let result = tokio::task::spawn_blocking(move || call())
                .await
                .map_err(|err| GatewayError::Internal(format!("ledger call {op} failed: {err}")))?;
            match result {
                Ok(v) => return Ok(v),
                Err(err) if is_transient(&err) && attempt < max_attempts => {
                    let delay = self.config.backoff_for(attempt);
                    warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %err, "ledger call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if is_transient(&err) => {
                    warn!(op, attempts = attempt, error = %err, "ledger unavailable, giving up");
                    return Err(GatewayError::LedgerUnavailable {
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
                Err(err) => return Err(GatewayError::from_ledger(err)),
            }
        }
    }
}
