#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread;

use cohort_kernel_contracts::ph1id::Identity;
use cohort_storage::ph1enroll::{EnrollmentError, EnrollmentStore};

fn id(s: &str) -> Identity {
    Identity::parse(s).unwrap()
}

#[test]
fn at_enroll_db_01_upsert_is_last_write_wins_per_identity() {
    let s = EnrollmentStore::new_in_memory();
    s.upsert("WalletA", &["python"], &["frontend"]).unwrap();
    s.upsert("walleta", &["ml", "ml"], &["infra", "ux"]).unwrap();

    assert_eq!(s.pending_len().unwrap(), 1);
    let r = s.pending_record(&id("walleta")).unwrap().unwrap();
    assert_eq!(r.preferences, vec!["infra", "ux"]);
    assert_eq!(r.skills.len(), 1);
}

#[test]
fn at_enroll_db_02_validation_failures() {
    let s = EnrollmentStore::new_in_memory();
    assert!(matches!(
        s.upsert("not a wallet", &["ml"], &["ux"]),
        Err(EnrollmentError::InvalidIdentity(_))
    ));
    assert_eq!(
        s.upsert("walleta", &["ml"], &[] as &[&str]),
        Err(EnrollmentError::EmptyPreferences)
    );
    assert_eq!(
        s.upsert("walleta", &["ml"], &[" "]),
        Err(EnrollmentError::EmptyPreferences)
    );
    assert_eq!(s.pending_len().unwrap(), 0);
}

#[test]
fn at_enroll_db_03_drain_moves_records_to_consumed_in_enrollment_order() {
    let s = EnrollmentStore::new_in_memory();
    for w in ["c", "a", "b"] {
        s.upsert(w, &[] as &[&str], &["ux"]).unwrap();
    }
    let run = s.begin_allocation_run().unwrap();
    let first = s.drain_pending(&run, 2).unwrap();
    let ids: Vec<&str> = first.iter().map(|r| r.identity.as_str()).collect();
    assert_eq!(ids, vec!["c", "a"]);

    let second = s.drain_pending(&run, 10).unwrap();
    assert_eq!(second.len(), 1);
    assert!(s.drain_pending(&run, 10).unwrap().is_empty());

    assert_eq!(s.consumed_records().unwrap().len(), 3);
    assert!(s.consumed_record(&id("a")).unwrap().is_some());
    assert_eq!(s.pending_len().unwrap(), 0);
}

#[test]
fn at_enroll_db_04_only_one_allocation_run_at_a_time() {
    let s = EnrollmentStore::new_in_memory();
    let run = s.begin_allocation_run().unwrap();
    assert!(s.allocation_run_active());
    assert_eq!(
        s.begin_allocation_run().unwrap_err(),
        EnrollmentError::AllocationRunActive
    );
    drop(run);
    assert!(!s.allocation_run_active());
    assert!(s.begin_allocation_run().is_ok());
}

#[test]
fn at_enroll_db_05_run_guard_released_on_error_path() {
    fn failing_run(s: &EnrollmentStore) -> Result<(), EnrollmentError> {
        let run = s.begin_allocation_run()?;
        s.drain_pending(&run, 1)?;
        Err(EnrollmentError::EmptyPreferences)
    }
    let s = EnrollmentStore::new_in_memory();
    assert!(failing_run(&s).is_err());
    assert!(!s.allocation_run_active());
}

#[test]
fn at_enroll_db_06_guard_from_other_store_rejected() {
    let a = EnrollmentStore::new_in_memory();
    let b = EnrollmentStore::new_in_memory();
    b.upsert("walleta", &[] as &[&str], &["ux"]).unwrap();
    let run = a.begin_allocation_run().unwrap();
    assert_eq!(
        b.drain_pending(&run, 10).unwrap_err(),
        EnrollmentError::ForeignRunGuard
    );
    assert_eq!(b.pending_len().unwrap(), 1);
}

#[test]
fn at_enroll_db_07_re_enrollment_after_consumption_returns_to_pending() {
    let s = EnrollmentStore::new_in_memory();
    s.upsert("walleta", &[] as &[&str], &["ux"]).unwrap();
    {
        let run = s.begin_allocation_run().unwrap();
        assert_eq!(s.drain_pending(&run, 10).unwrap().len(), 1);
    }
    assert!(s.pending_record(&id("walleta")).unwrap().is_none());

    s.upsert("walleta", &[] as &[&str], &["infra"]).unwrap();
    let r = s.pending_record(&id("walleta")).unwrap().unwrap();
    assert_eq!(r.primary_preference(), "infra");
    assert_eq!(
        s.consumed_record(&id("walleta")).unwrap().unwrap().primary_preference(),
        "ux"
    );
}

#[test]
fn at_enroll_db_08_concurrent_upserts_all_land_and_drain_once() {
    let s = Arc::new(EnrollmentStore::new_in_memory());
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let s = s.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    s.upsert(&format!("w{t}x{i}"), &["ml"], &["ux"]).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(s.pending_len().unwrap(), 200);

    let run = s.begin_allocation_run().unwrap();
    let drained = s.drain_pending(&run, usize::MAX).unwrap();
    assert_eq!(drained.len(), 200);
    let mut seqs: Vec<u64> = drained.iter().map(|r| r.enrollment_seq.0).collect();
    let sorted = {
        let mut v = seqs.clone();
        v.sort();
        v
    };
    assert_eq!(seqs, sorted);
    seqs.dedup();
    assert_eq!(seqs.len(), 200);
}
