#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use cohort_kernel_contracts::ph1enroll::{normalize_tags, EnrollmentRecord, EnrollmentSeq};
use cohort_kernel_contracts::ph1id::Identity;
use cohort_kernel_contracts::ContractViolation;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnrollmentError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(ContractViolation),
    #[error("preferences must contain at least one role")]
    EmptyPreferences,
    #[error("invalid enrollment: {0}")]
    InvalidRecord(ContractViolation),
    #[error("an allocation run is already active")]
    AllocationRunActive,
    #[error("allocation run guard belongs to a different store")]
    ForeignRunGuard,
    #[error("enrollment store lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Default)]
struct EnrollmentState {
    next_seq: u64,
    pending: BTreeMap<Identity, EnrollmentRecord>,
    // Append-only audit trail of every record an allocation run consumed.
    consumed: Vec<EnrollmentRecord>,
}

/// Pending enrollments keyed by identity plus the process-wide allocation-run flag.
#[derive(Debug, Default)]
pub struct EnrollmentStore {
    state: Mutex<EnrollmentState>,
    run_active: AtomicBool,
}

/// Proof that the holder owns the single allocation run. Released on drop.
#[derive(Debug)]
pub struct AllocationRunGuard<'a> {
    store: &'a EnrollmentStore,
}

impl Drop for AllocationRunGuard<'_> {
    fn drop(&mut self) {
        self.store.run_active.store(false, Ordering::Release);
    }
}

impl EnrollmentStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, EnrollmentState>, EnrollmentError> {
        self.state.lock().map_err(|_| EnrollmentError::LockPoisoned)
    }

    /// Last write wins per identity. Re-enrolling a consumed identity puts it back in pending.
    pub fn upsert<S: AsRef<str>, P: AsRef<str>>(
        &self,
        raw_identity: &str,
        skills: &[S],
        preferences: &[P],
    ) -> Result<EnrollmentRecord, EnrollmentError> {
        let identity = Identity::parse(raw_identity).map_err(EnrollmentError::InvalidIdentity)?;
        if normalize_tags(preferences).is_empty() {
            return Err(EnrollmentError::EmptyPreferences);
        }

        let mut state = self.lock()?;
        let seq = EnrollmentSeq(state.next_seq.saturating_add(1));
        let record = EnrollmentRecord::v1(identity, skills, preferences, seq)
            .map_err(EnrollmentError::InvalidRecord)?;
        state.next_seq = seq.0;
        state
            .pending
            .insert(record.identity.clone(), record.clone());
        Ok(record)
    }

    pub fn begin_allocation_run(&self) -> Result<AllocationRunGuard<'_>, EnrollmentError> {
        if self
            .run_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EnrollmentError::AllocationRunActive);
        }
        Ok(AllocationRunGuard { store: self })
    }

    pub fn allocation_run_active(&self) -> bool {
        self.run_active.load(Ordering::Acquire)
    }

    /// Moves up to `max_n` of the oldest pending records to consumed and returns them.
    pub fn drain_pending(
        &self,
        run: &AllocationRunGuard<'_>,
        max_n: usize,
    ) -> Result<Vec<EnrollmentRecord>, EnrollmentError> {
        if !std::ptr::eq(run.store, self) {
            return Err(EnrollmentError::ForeignRunGuard);
        }
        let mut state = self.lock()?;
        let mut oldest: Vec<(EnrollmentSeq, Identity)> = state
            .pending
            .values()
            .map(|r| (r.enrollment_seq, r.identity.clone()))
            .collect();
        oldest.sort();
        oldest.truncate(max_n);

        let mut drained = Vec::with_capacity(oldest.len());
        for (_, identity) in oldest {
            if let Some(record) = state.pending.remove(&identity) {
                state.consumed.push(record.clone());
                drained.push(record);
            }
        }
        Ok(drained)
    }

    pub fn pending_len(&self) -> Result<usize, EnrollmentError> {
        Ok(self.lock()?.pending.len())
    }

    pub fn pending_record(
        &self,
        identity: &Identity,
    ) -> Result<Option<EnrollmentRecord>, EnrollmentError> {
        Ok(self.lock()?.pending.get(identity).cloned())
    }

    /// Most recent consumed record for `identity`.
    pub fn consumed_record(
        &self,
        identity: &Identity,
    ) -> Result<Option<EnrollmentRecord>, EnrollmentError> {
        Ok(self
            .lock()?
            .consumed
            .iter()
            .rev()
            .find(|r| &r.identity == identity)
            .cloned())
    }

    pub fn consumed_records(&self) -> Result<Vec<EnrollmentRecord>, EnrollmentError> {
        Ok(self.lock()?.consumed.clone())
    }
}
