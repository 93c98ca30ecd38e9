//! Sharing records with delegates: grants, downgrades, revocation, re-sealing
//! and notice-driven sync.

mod common;

use std::sync::Arc;

use common::{eventually, identity, Device};
use dersync_core::sync::{BroadcastMedium, MemoryMedium, MemoryRemoteServer};
use dersync_core::{Collection, IdentityProvider, Permission, SyncError, TaskFields};

#[tokio::test]
async fn test_read_delegate_sees_record() {
    let server = MemoryRemoteServer::new();
    let alice = Device::new(&server, identity());
    let bob = Device::new(&server, identity());

    let record = alice
        .engine
        .create_record(Collection::tasks(), TaskFields::titled("Water plants"))
        .unwrap();
    alice
        .engine
        .grant(&record.record_id, &bob.did(), Permission::Read)
        .await
        .unwrap();
    alice.sync_self().await;

    let report = bob.sync(&alice.did()).await;
    assert_eq!(report.pulled, 1);
    let shared = bob.record(&alice.did(), &record.record_id).unwrap();
    assert_eq!(shared.fields.title, "Water plants");
    assert_eq!(shared.owner, alice.did());
    assert_eq!(shared.grants.permission_of(&bob.did()), Some(Permission::Read));

    // Read-only on the delegate side
    let edit = bob
        .engine
        .update_record(&alice.did(), &record.record_id, |f| f.title = "nope".into());
    assert!(matches!(edit, Err(SyncError::PermissionDenied(_))));

    let delegations = alice.engine.delegations().await.unwrap();
    assert_eq!(delegations.len(), 1);
    assert_eq!(delegations[0].delegate, bob.did());
    assert_eq!(delegations[0].permission, Permission::Read);
}

#[tokio::test]
async fn test_write_delegate_edit_reaches_owner() {
    let server = MemoryRemoteServer::new();
    let alice = Device::new(&server, identity());
    let bob = Device::new(&server, identity());

    let record = alice
        .engine
        .create_record(Collection::tasks(), TaskFields::titled("Plan trip"))
        .unwrap();
    alice
        .engine
        .grant(&record.record_id, &bob.did(), Permission::Write)
        .await
        .unwrap();
    alice.sync_self().await;
    bob.sync(&alice.did()).await;

    bob.engine
        .update_record(&alice.did(), &record.record_id, |f| {
            f.notes = "booked the train".into()
        })
        .unwrap();
    let report = bob.sync(&alice.did()).await;
    assert_eq!(report.pushed, 1);
    assert!(report.is_clean());

    let on_bob = bob.record(&alice.did(), &record.record_id).unwrap();
    assert_eq!(on_bob.version, 2);
    assert!(!on_bob.pending);

    let report = alice.sync_self().await;
    assert_eq!(report.updated, 1);
    let on_alice = alice.record(&alice.did(), &record.record_id).unwrap();
    assert_eq!(on_alice.fields.notes, "booked the train");
    // Grants survive a delegate's write
    assert_eq!(on_alice.grants.permission_of(&bob.did()), Some(Permission::Write));
    assert_eq!(on_alice.version, 2);
}

#[tokio::test]
async fn test_downgraded_delegate_push_is_denied() {
    let server = MemoryRemoteServer::new();
    let alice = Device::new(&server, identity());
    let bob = Device::new(&server, identity());

    let record = alice
        .engine
        .create_record(Collection::tasks(), TaskFields::titled("Budget"))
        .unwrap();
    alice
        .engine
        .grant(&record.record_id, &bob.did(), Permission::Write)
        .await
        .unwrap();
    alice.sync_self().await;
    bob.sync(&alice.did()).await;

    // The server knows about the downgrade before bob does
    alice
        .engine
        .grant(&record.record_id, &bob.did(), Permission::Read)
        .await
        .unwrap();

    bob.engine
        .update_record(&alice.did(), &record.record_id, |f| f.title = "Budget v2".into())
        .unwrap();
    let report = bob.sync(&alice.did()).await;
    assert_eq!(report.permission_denied, vec![record.record_id.clone()]);
    assert_eq!(report.pushed, 0);

    let on_bob = bob.record(&alice.did(), &record.record_id).unwrap();
    assert!(on_bob.pending);
    assert_eq!(on_bob.fields.title, "Budget v2");
    assert_eq!(server.version_of(&alice.did(), &record.record_id), Some(1));
}

#[tokio::test]
async fn test_revoked_delegate_loses_record() {
    let server = MemoryRemoteServer::new();
    let alice = Device::new(&server, identity());
    let bob = Device::new(&server, identity());

    let shared = alice
        .engine
        .create_record(Collection::tasks(), TaskFields::titled("Shared"))
        .unwrap();
    let private = alice
        .engine
        .create_record(Collection::tasks(), TaskFields::titled("Private"))
        .unwrap();
    alice
        .engine
        .grant(&shared.record_id, &bob.did(), Permission::Read)
        .await
        .unwrap();
    alice.sync_self().await;

    bob.sync(&alice.did()).await;
    assert!(bob.record(&alice.did(), &shared.record_id).is_some());
    assert!(bob.record(&alice.did(), &private.record_id).is_none());

    let revoked = alice.engine.revoke(&shared.record_id, &bob.did()).await.unwrap();
    assert!(revoked.grants.is_empty());
    assert!(revoked.pending);
    alice.sync_self().await;

    let report = bob.sync(&alice.did()).await;
    assert_eq!(report.removed, 1);
    assert!(bob.all_records(&alice.did()).is_empty());

    // The re-sealed envelope carries no copy for bob
    let raw = server.raw_of(&alice.did(), &shared.record_id).unwrap();
    assert!(raw.delegate_payloads.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_missing_delegate_payload_triggers_reseal() {
    let server = MemoryRemoteServer::new();
    let alice = Device::new(&server, identity());
    let bob = Device::new(&server, identity());
    let owner = alice.did();

    let record = alice
        .engine
        .create_record(Collection::tasks(), TaskFields::titled("Groceries"))
        .unwrap();
    alice
        .engine
        .grant(&record.record_id, &bob.did(), Permission::Read)
        .await
        .unwrap();
    alice.sync_self().await;

    // Another client rewrote it without bob's copy
    let mut raw = server.raw_of(&owner, &record.record_id).unwrap();
    raw.delegate_payloads = None;
    raw.version = Some(2);
    server.insert_raw(&owner, &Collection::tasks(), raw).unwrap();

    let report = bob.sync(&owner).await;
    assert_eq!(report.failures.len(), 1);
    assert!(bob.record(&owner, &record.record_id).is_none());

    let report = alice.sync_self().await;
    assert_eq!(report.updated, 1);
    assert_eq!(report.resealed, 1);
    assert_eq!(report.pushed, 1);
    assert_eq!(server.version_of(&owner, &record.record_id), Some(3));

    let raw = server.raw_of(&owner, &record.record_id).unwrap();
    assert!(raw.delegate_payloads.unwrap().contains_key(&bob.did()));

    let report = bob.sync(&owner).await;
    assert_eq!(report.pulled, 1);
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_notices_and_manifests_drive_delegate_sync() {
    let server = MemoryRemoteServer::new();
    let medium: Arc<dyn BroadcastMedium> = Arc::new(MemoryMedium::default());
    let alice = Device::with_medium(&server, identity(), medium.clone());
    let bob = Device::with_medium(&server, identity(), medium.clone());
    let owner = alice.did();

    let _handles = bob.engine.listen().await.unwrap();

    let record = alice
        .engine
        .create_record(Collection::tasks(), TaskFields::titled("Call the plumber"))
        .unwrap();
    alice
        .engine
        .grant(&record.record_id, &bob.did(), Permission::Read)
        .await
        .unwrap();

    // The manifest makes bob start tracking alice
    assert!(
        eventually(|| bob
            .engine
            .manifests()
            .current(&owner)
            .unwrap()
            .is_some_and(|m| m.permission_for(&record.record_id) == Some(Permission::Read)))
        .await
    );
    assert!(bob.engine.tracked_owners().unwrap().contains(&owner));

    // Alice's push notifies bob, who pulls without being asked
    alice.sync_self().await;
    assert!(eventually(|| bob.record(&owner, &record.record_id).is_some()).await);

    // Later edits flow the same way
    alice
        .engine
        .update_record(&owner, &record.record_id, |f| f.notes = "after 5pm".into())
        .unwrap();
    alice.sync_self().await;
    assert!(
        eventually(|| bob
            .record(&owner, &record.record_id)
            .is_some_and(|r| r.fields.notes == "after 5pm"))
        .await
    );
}

#[tokio::test]
async fn test_back_to_back_grant_changes_reach_delegate_in_order() {
    let server = MemoryRemoteServer::new();
    let medium: Arc<dyn BroadcastMedium> = Arc::new(MemoryMedium::default());
    let alice = Device::with_medium(&server, identity(), medium.clone());
    let bob = Device::with_medium(&server, identity(), medium.clone());
    let owner = alice.did();

    let _handles = bob.engine.listen().await.unwrap();

    let record = alice
        .engine
        .create_record(Collection::tasks(), TaskFields::titled("Surprise party"))
        .unwrap();

    // Grant and revoke well within one millisecond of each other
    alice
        .engine
        .grant(&record.record_id, &bob.did(), Permission::Read)
        .await
        .unwrap();
    let granted = alice
        .engine
        .storage()
        .load_manifest(&owner, &bob.did())
        .unwrap()
        .unwrap();
    alice.engine.revoke(&record.record_id, &bob.did()).await.unwrap();
    let revoked = alice
        .engine
        .storage()
        .load_manifest(&owner, &bob.did())
        .unwrap()
        .unwrap();

    assert!(revoked.issued_at > granted.issued_at);
    assert!(revoked.entries.is_empty());

    // The revoking manifest is the one bob ends up holding
    assert!(
        eventually(|| bob
            .engine
            .manifests()
            .current(&owner)
            .unwrap()
            .is_some_and(|m| m.issued_at == revoked.issued_at))
        .await
    );
    let held = bob.engine.manifests().current(&owner).unwrap().unwrap();
    assert_eq!(held.permission_for(&record.record_id), None);
}
