#![forbid(unsafe_code)]

use cohort_engines::ph1hash::ContentHasher;
use cohort_kernel_contracts::ph1group::{GroupDraft, GroupId};
use cohort_kernel_contracts::ph1id::Identity;
use cohort_storage::ph1ledger::{CreateOutcome, InMemoryLedger, LedgerBackend, LedgerError};

fn ids(raw: &[&str]) -> Vec<Identity> {
    raw.iter().map(|s| Identity::parse(s).unwrap()).collect()
}

fn draft(group_id: u64, members: &[&str]) -> GroupDraft {
    let members = ids(members);
    let key = ContentHasher::member_set_key(&members);
    let genesis = key.to_genesis_hash();
    GroupDraft::v1(GroupId(group_id), members, key, genesis).unwrap()
}

#[test]
fn at_ledger_db_01_create_if_absent_is_idempotent_by_member_set() {
    let l = InMemoryLedger::new_in_memory();
    let first = l.create_if_absent(&draft(1, &["a", "b", "c"])).unwrap();
    assert!(matches!(first, CreateOutcome::Created(_)));

    // Same members, different order and proposed id: collapses onto group 1.
    let again = l.create_if_absent(&draft(2, &["c", "b", "a"])).unwrap();
    match again {
        CreateOutcome::AlreadyExists(e) => assert_eq!(e.group_id, GroupId(1)),
        other => panic!("expected AlreadyExists, got {other:?}"),
    }
    assert_eq!(l.total_groups().unwrap(), 1);
    assert_eq!(l.list_groups().unwrap().len(), 1);
}

#[test]
fn at_ledger_db_02_group_id_and_membership_are_exclusive() {
    let l = InMemoryLedger::new_in_memory();
    l.create_if_absent(&draft(1, &["a", "b"])).unwrap();
    assert_eq!(
        l.create_if_absent(&draft(1, &["c", "d"])).unwrap_err(),
        LedgerError::GroupIdTaken {
            group_id: GroupId(1)
        }
    );
    assert!(matches!(
        l.create_if_absent(&draft(2, &["b", "e"])).unwrap_err(),
        LedgerError::MemberAlreadyGrouped { group_id: GroupId(1), .. }
    ));
    assert_eq!(l.total_groups().unwrap(), 1);
}

#[test]
fn at_ledger_db_03_cas_requires_member_and_matching_version() {
    let l = InMemoryLedger::new_in_memory();
    l.create_if_absent(&draft(7, &["a", "b"])).unwrap();
    let h1 = ContentHasher::digest(b"week 1 attendance");
    let h2 = ContentHasher::digest(b"week 2 attendance");
    let a = Identity::parse("a").unwrap();
    let x = Identity::parse("x").unwrap();

    assert!(matches!(
        l.compare_and_swap_metadata(GroupId(7), &x, 0, &h1),
        Err(LedgerError::NotAuthorized { .. })
    ));
    let e = l.compare_and_swap_metadata(GroupId(7), &a, 0, &h1).unwrap();
    assert_eq!(e.metadata_version, 1);
    assert_eq!(e.metadata_hash, h1);

    assert_eq!(
        l.compare_and_swap_metadata(GroupId(7), &a, 0, &h2)
            .unwrap_err(),
        LedgerError::VersionMismatch {
            group_id: GroupId(7),
            expected: 0,
            actual: 1
        }
    );
    assert_eq!(
        l.compare_and_swap_metadata(GroupId(8), &a, 0, &h2)
            .unwrap_err(),
        LedgerError::UnknownGroup(GroupId(8))
    );
    let history = l.metadata_history(GroupId(7)).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].submitter, a);
}

#[test]
fn at_ledger_db_04_torn_journal_tail_is_cut_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.jsonl");
    {
        let l = InMemoryLedger::open_journaled(&path).unwrap();
        l.create_if_absent(&draft(1, &["a", "b"])).unwrap();
    }
    let committed_len = std::fs::metadata(&path).unwrap().len();
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"tx":"create_group","entry":{"group_id":2,"mem"#)
            .unwrap();
    }

    let reopened = InMemoryLedger::open_journaled(&path).unwrap();
    assert_eq!(reopened.total_groups().unwrap(), 1);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), committed_len);

    reopened.create_if_absent(&draft(2, &["c", "d"])).unwrap();
    drop(reopened);
    let again = InMemoryLedger::open_journaled(&path).unwrap();
    assert_eq!(again.total_groups().unwrap(), 2);
    assert_eq!(
        again.read_group(GroupId(1)).unwrap().unwrap().members,
        ids(&["a", "b"])
    );
}

#[test]
fn at_ledger_db_05_lookup_by_member_and_key() {
    let l = InMemoryLedger::new_in_memory();
    let d = draft(3, &["a", "b"]);
    l.create_if_absent(&d).unwrap();
    let by_member = l
        .find_group_for_member(&Identity::parse("B").unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(by_member.group_id, GroupId(3));
    let by_key = l.find_by_member_key(&d.member_key).unwrap().unwrap();
    assert_eq!(by_key.group_id, GroupId(3));
    assert!(l
        .find_group_for_member(&Identity::parse("q").unwrap())
        .unwrap()
        .is_none());
    assert_eq!(l.max_group_id().unwrap(), Some(GroupId(3)));
}

#[test]
fn at_ledger_db_06_journal_replays_groups_and_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger").join("journal.jsonl");
    let h = ContentHasher::digest(b"attended");
    {
        let l = InMemoryLedger::open_journaled(&path).unwrap();
        l.create_if_absent(&draft(1, &["a", "b"])).unwrap();
        l.create_if_absent(&draft(2, &["c", "d"])).unwrap();
        l.compare_and_swap_metadata(GroupId(2), &Identity::parse("d").unwrap(), 0, &h)
            .unwrap();
    }
    let reopened = InMemoryLedger::open_journaled(&path).unwrap();
    assert_eq!(reopened.journal_path(), Some(path.as_path()));
    assert_eq!(reopened.total_groups().unwrap(), 2);
    let g2 = reopened.read_group(GroupId(2)).unwrap().unwrap();
    assert_eq!(g2.metadata_hash, h);
    assert_eq!(g2.metadata_version, 1);
    assert_eq!(reopened.metadata_history(GroupId(2)).unwrap().len(), 1);

    // Replayed indexes still enforce idempotency and disjointness.
    assert!(matches!(
        reopened.create_if_absent(&draft(5, &["b", "a"])).unwrap(),
        CreateOutcome::AlreadyExists(_)
    ));
    assert!(matches!(
        reopened.create_if_absent(&draft(5, &["a", "z"])),
        Err(LedgerError::MemberAlreadyGrouped { .. })
    ));
}

#[test]
fn at_ledger_db_07_corrupt_journal_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.jsonl");
    std::fs::write(&path, "{not json}\n").unwrap();
    assert!(matches!(
        InMemoryLedger::open_journaled(&path),
        Err(LedgerError::Journal(_))
    ));
}
