// Durable collections (directory + ledger) must survive a process restart.
// The mailbox is intentionally ephemeral and is not covered here.

use rendezvous_core::store::{SledStorage, StorageBackend};
use rendezvous_core::{ConnectionLedger, Directory, DirectoryStore, ResolveAction};
use std::sync::Arc;
use tempfile::tempdir;

fn open(path: &str) -> (ConnectionLedger, DirectoryStore) {
    let backend: Arc<dyn StorageBackend> = Arc::new(SledStorage::new(path).unwrap());
    let directory = DirectoryStore::new(backend.clone());
    let ledger = ConnectionLedger::new(backend, Arc::new(directory.clone()));
    (ledger, directory)
}

#[test]
fn accepted_connection_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();

    {
        let (ledger, directory) = open(&path);
        directory.register("alice", "PGP-ALICE").unwrap();
        directory.register("bob", "PGP-BOB").unwrap();

        let request = ledger.submit("@alice", "@bob").unwrap();
        ledger
            .resolve(&request.id, "@bob", ResolveAction::Accept)
            .unwrap();
        // Drop closes the sled handle before reopening.
    }

    let (ledger, directory) = open(&path);
    assert!(directory.exists("@alice").unwrap());
    assert!(ledger.is_connected("@alice", "@bob").unwrap());

    let connections = ledger.list_accepted("@bob").unwrap();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].peer, "@alice");
    assert_eq!(connections[0].public_key, "PGP-ALICE");
}

#[test]
fn pending_request_and_pair_lock_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();

    let request_id = {
        let (ledger, directory) = open(&path);
        directory.register("alice", "ka").unwrap();
        directory.register("bob", "kb").unwrap();
        ledger.submit("@alice", "@bob").unwrap().id
    };

    let (ledger, _) = open(&path);
    // The pair is still claimed after restart.
    assert!(matches!(
        ledger.submit("@bob", "@alice"),
        Err(rendezvous_core::RelayError::Conflict(_))
    ));

    let pending = ledger.list_pending("@bob").unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, request_id);

    ledger
        .resolve(&request_id, "@bob", ResolveAction::Accept)
        .unwrap();
    assert!(ledger.is_connected("@alice", "@bob").unwrap());
}
