// Request lifecycle invariants exercised concurrently through the ledger.

use rendezvous_core::store::{MemoryStorage, StorageBackend};
use rendezvous_core::{
    ConnectionLedger, DirectoryStore, RelayError, RequestStatus, ResolveAction,
};
use std::sync::Arc;
use std::thread;

fn build_ledger(users: &[&str]) -> ConnectionLedger {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
    let directory = DirectoryStore::new(backend.clone());
    for user in users {
        directory.register(user, &format!("key-{user}")).unwrap();
    }
    ConnectionLedger::new(backend, Arc::new(directory))
}

#[test]
fn concurrent_cross_submissions_leave_one_active_record() {
    // A->B and B->A racing from many threads: exactly one pending record may
    // exist for the unordered pair afterwards.
    for _ in 0..20 {
        let ledger = build_ledger(&["alice", "bob"]);

        let forward = {
            let ledger = ledger.clone();
            thread::spawn(move || ledger.submit("@alice", "@bob"))
        };
        let reverse = {
            let ledger = ledger.clone();
            thread::spawn(move || ledger.submit("@bob", "@alice"))
        };

        let results = [forward.join().unwrap(), reverse.join().unwrap()];
        let oks = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(oks, 1, "exactly one submission must win");
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(RelayError::Conflict(_)))));

        let pending_bob = ledger.list_pending("@bob").unwrap();
        let pending_alice = ledger.list_pending("@alice").unwrap();
        assert_eq!(pending_bob.len() + pending_alice.len(), 1);
    }
}

#[test]
fn resolution_happens_exactly_once() {
    let ledger = build_ledger(&["alice", "bob"]);
    let request = ledger.submit("@alice", "@bob").unwrap();

    let first = ledger
        .resolve(&request.id, "@bob", ResolveAction::Accept)
        .unwrap();
    assert_eq!(first.status, RequestStatus::Accepted);

    // Replaying the accept, or flipping to decline, is indistinguishable
    // from an unknown request.
    assert_eq!(
        ledger.resolve(&request.id, "@bob", ResolveAction::Accept),
        Err(RelayError::NotFound)
    );
    assert_eq!(
        ledger.resolve(&request.id, "@bob", ResolveAction::Decline),
        Err(RelayError::NotFound)
    );
    assert!(ledger.is_connected("@alice", "@bob").unwrap());
}

#[test]
fn sever_then_reconnect_cycle() {
    let ledger = build_ledger(&["alice", "bob"]);

    for _ in 0..3 {
        let request = ledger.submit("@alice", "@bob").unwrap();
        ledger
            .resolve(&request.id, "@bob", ResolveAction::Accept)
            .unwrap();
        assert!(ledger.is_connected("@alice", "@bob").unwrap());

        assert!(ledger.sever("@alice", "@bob").unwrap());
        assert!(!ledger.is_connected("@alice", "@bob").unwrap());
        // Second sever is a no-op, not an error.
        assert!(!ledger.sever("@bob", "@alice").unwrap());
    }
}

#[test]
fn declined_pair_can_try_again_but_not_while_pending() {
    let ledger = build_ledger(&["alice", "bob"]);

    let request = ledger.submit("@alice", "@bob").unwrap();
    assert!(matches!(
        ledger.submit("@bob", "@alice"),
        Err(RelayError::Conflict(_))
    ));

    ledger
        .resolve(&request.id, "@bob", ResolveAction::Decline)
        .unwrap();
    let retry = ledger.submit("@bob", "@alice").unwrap();
    assert_eq!(retry.status, RequestStatus::Pending);
    assert_ne!(retry.id, request.id);
}

#[test]
fn independent_pairs_do_not_interfere() {
    let ledger = build_ledger(&["alice", "bob", "carol", "dave"]);

    let mut handles = Vec::new();
    for (a, b) in [("@alice", "@bob"), ("@carol", "@dave")] {
        let ledger = ledger.clone();
        handles.push(thread::spawn(move || {
            let request = ledger.submit(a, b).unwrap();
            ledger.resolve(&request.id, b, ResolveAction::Accept).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(ledger.is_connected("@alice", "@bob").unwrap());
    assert!(ledger.is_connected("@carol", "@dave").unwrap());
    assert!(!ledger.is_connected("@alice", "@carol").unwrap());
}
