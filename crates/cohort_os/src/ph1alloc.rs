#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use cohort_engines::ph1alloc::{AllocationEngine, AllocationError};
use cohort_kernel_contracts::ph1enroll::EnrollmentRecord;
use cohort_kernel_contracts::ph1group::GroupRecord;
use cohort_kernel_contracts::ph1id::Identity;
use cohort_storage::ph1enroll::{EnrollmentError, EnrollmentStore};

use crate::ph1ledger::{CreateGroupOutcome, GatewayError, LedgerGateway};

pub const TARGET_GROUP_SIZE_DEFAULT: usize = 4;
pub const MAX_BATCH_DEFAULT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRunnerConfig {
    pub target_group_size: usize,
    pub max_batch: usize,
}

impl AllocationRunnerConfig {
    pub fn mvp_v1() -> Self {
        Self {
            target_group_size: TARGET_GROUP_SIZE_DEFAULT,
            max_batch: MAX_BATCH_DEFAULT,
        }
    }
}

impl Default for AllocationRunnerConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllocationRunOutcome {
    /// Records taken from pending by this run (carried-over records excluded).
    pub drained: usize,
    pub carried_in: usize,
    pub skipped_already_grouped: Vec<Identity>,
    pub groups: Vec<CreateGroupOutcome>,
}

impl AllocationRunOutcome {
    pub fn committed(&self) -> impl Iterator<Item = &GroupRecord> {
        self.groups
            .iter()
            .filter(|g| g.is_committed())
            .map(CreateGroupOutcome::record)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationRunError {
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("allocation carry-over lock poisoned")]
    LockPoisoned,
}

impl AllocationRunError {
    pub fn is_run_active(&self) -> bool {
        matches!(
            self,
            AllocationRunError::Enrollment(EnrollmentError::AllocationRunActive)
        )
    }

    pub fn is_insufficient_enrollment(&self) -> bool {
        matches!(
            self,
            AllocationRunError::Allocation(AllocationError::InsufficientEnrollment { .. })
        )
    }
}

/// Drains pending enrollments, allocates them and commits the drafts.
/// A run that fails or is dropped mid-commit keeps its batch and hands it
/// to the next run.
#[derive(Debug)]
pub struct AllocationRunner {
    enrollment: Arc<EnrollmentStore>,
    engine: AllocationEngine,
    gateway: LedgerGateway,
    config: AllocationRunnerConfig,
    carry_over: Mutex<Vec<EnrollmentRecord>>,
}

impl AllocationRunner {
    pub fn new(
        enrollment: Arc<EnrollmentStore>,
        engine: AllocationEngine,
        gateway: LedgerGateway,
        config: AllocationRunnerConfig,
    ) -> Self {
        Self {
            enrollment,
            engine,
            gateway,
            config,
            carry_over: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AllocationRunnerConfig {
        &self.config
    }

    fn lock_carry_over(&self) -> Result<MutexGuard<'_, Vec<EnrollmentRecord>>, AllocationRunError> {
        self.carry_over
            .lock()
            .map_err(|_| AllocationRunError::LockPoisoned)
    }

    pub fn carried_over(&self) -> Result<usize, AllocationRunError> {
        Ok(self.lock_carry_over()?.len())
    }

    pub async fn run_once(&self) -> Result<AllocationRunOutcome, AllocationRunError> {
        let run = self.enrollment.begin_allocation_run()?;
        let drained = self.enrollment.drain_pending(&run, self.config.max_batch)?;
        let carried = std::mem::take(&mut *self.lock_carry_over()?);
        let mut outcome = AllocationRunOutcome {
            drained: drained.len(),
            carried_in: carried.len(),
            ..AllocationRunOutcome::default()
        };
        let batch = merge_batch(carried, drained);
        // Parked before the first await: a dropped run leaves it for the next.
        *self.lock_carry_over()? = batch.clone();
        debug!(batch = batch.len(), "allocation run started");

        match self.allocate_and_commit(&batch, &mut outcome).await {
            Ok(()) => {
                self.lock_carry_over()?.clear();
                info!(
                    groups = outcome.groups.len(),
                    committed = outcome.committed().count(),
                    skipped = outcome.skipped_already_grouped.len(),
                    "allocation run finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                if err.is_insufficient_enrollment() {
                    debug!(batch = batch.len(), "not enough enrollments to allocate yet");
                } else {
                    warn!(error = %err, batch = batch.len(), "allocation run failed, batch carried over");
                }
                Err(err)
            }
        }
    }

    async fn allocate_and_commit(
        &self,
        batch: &[EnrollmentRecord],
        outcome: &mut AllocationRunOutcome,
    ) -> Result<(), AllocationRunError> {
        let mut eligible = Vec::with_capacity(batch.len());
        for record in batch {
            if let Some(group) = self.gateway.group_for_member(&record.identity).await? {
                info!(identity = %record.identity, group_id = %group.group_id, "identity already grouped, skipping");
                outcome.skipped_already_grouped.push(record.identity.clone());
            } else {
                eligible.push(record.clone());
            }
        }
        if eligible.is_empty() && !outcome.skipped_already_grouped.is_empty() {
            return Ok(());
        }

        let first_group_id = self.gateway.next_group_id().await?;
        let drafts = self
            .engine
            .allocate(&eligible, self.config.target_group_size, first_group_id)?;
        for draft in drafts {
            let committed = self.gateway.create_group(draft).await?;
            outcome.groups.push(committed);
        }
        Ok(())
    }
}

/// Carried-over records first, newer enrollment per identity wins,
/// result ordered by enrollment sequence.
fn merge_batch(
    carried: Vec<EnrollmentRecord>,
    drained: Vec<EnrollmentRecord>,
) -> Vec<EnrollmentRecord> {
    let mut by_identity: BTreeMap<Identity, EnrollmentRecord> = BTreeMap::new();
    for record in carried.into_iter().chain(drained) {
        match by_identity.get(&record.identity) {
            Some(existing) if existing.enrollment_seq >= record.enrollment_seq => {}
            _ => {
                by_identity.insert(record.identity.clone(), record);
            }
        }
    }
    let mut batch: Vec<EnrollmentRecord> = by_identity.into_values().collect();
    batch.sort_by_key(|r| r.enrollment_seq);
    batch
}
