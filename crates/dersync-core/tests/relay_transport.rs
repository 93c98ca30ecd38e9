//! The replication scenarios again, with every device reaching the store
//! through a relay peer over QUIC instead of in-process.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{identity, Device};
use dersync_core::identity::LocalIdentity;
use dersync_core::sync::{MemoryRemoteServer, RelayNode, RelayRemoteStore};
use dersync_core::{Collection, IdentityProvider, Permission, SyncError, TaskFields};

/// A relay in front of one in-process server.
async fn relay(server: &MemoryRemoteServer) -> RelayNode {
    let node = RelayNode::bind(None, Arc::new(server.clone())).await.unwrap();
    // Give the endpoint a moment to learn its local addresses
    tokio::time::sleep(Duration::from_millis(50)).await;
    node
}

async fn relayed_device(node: &RelayNode, identity: Arc<LocalIdentity>) -> Device {
    let timeout = Duration::from_secs(10);
    let store = RelayRemoteStore::bind(node.endpoint_addr(), identity.clone(), timeout)
        .await
        .unwrap();
    Device::with_remote(Arc::new(store), identity)
}

#[tokio::test]
async fn test_two_devices_converge_through_relay() {
    let server = MemoryRemoteServer::new();
    let node = relay(&server).await;
    let alice = identity();
    let me = alice.did();

    let a = relayed_device(&node, alice.clone()).await;
    let b = relayed_device(&node, alice.clone()).await;

    let record = a
        .engine
        .create_record(Collection::tasks(), TaskFields::titled("Book flights"))
        .unwrap();
    let report = a.sync_self().await;
    assert_eq!(report.pushed, 1);
    assert_eq!(server.version_of(&me, &record.record_id), Some(1));

    let report = b.sync_self().await;
    assert_eq!(report.pulled, 1);
    let on_b = b.record(&me, &record.record_id).unwrap();
    assert_eq!(on_b.fields.title, "Book flights");
    assert_eq!(on_b.version, 1);
    assert!(!on_b.pending);

    b.engine
        .update_record(&me, &record.record_id, |f| f.notes = "window seat".into())
        .unwrap();
    b.sync_self().await;
    let report = a.sync_self().await;
    assert_eq!(report.updated, 1);
    assert_eq!(a.record(&me, &record.record_id).unwrap().fields.notes, "window seat");

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pending_edit_survives_newer_version_through_relay() {
    let server = MemoryRemoteServer::new();
    let node = relay(&server).await;
    let alice = identity();
    let me = alice.did();

    let a = relayed_device(&node, alice.clone()).await;
    let b = relayed_device(&node, alice.clone()).await;

    let record = a
        .engine
        .create_record(Collection::tasks(), TaskFields::titled("Shared draft"))
        .unwrap();
    a.sync_self().await;
    b.sync_self().await;

    a.engine
        .update_record(&me, &record.record_id, |f| f.notes = "A's edit".into())
        .unwrap();
    b.engine
        .update_record(&me, &record.record_id, |f| f.title = "B's title".into())
        .unwrap();
    b.sync_self().await;
    assert_eq!(server.version_of(&me, &record.record_id), Some(2));

    let report = a.sync_self().await;
    assert_eq!(report.updated, 0);
    assert_eq!(report.pushed, 1);
    assert_eq!(server.version_of(&me, &record.record_id), Some(3));

    b.sync_self().await;
    let on_b = b.record(&me, &record.record_id).unwrap();
    assert_eq!(on_b.version, 3);
    assert_eq!(on_b.fields.notes, "A's edit");

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delegation_through_relay() {
    let server = MemoryRemoteServer::new();
    let node = relay(&server).await;
    let alice = relayed_device(&node, identity()).await;
    let bob = relayed_device(&node, identity()).await;

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

    let report = bob.sync(&alice.did()).await;
    assert_eq!(report.pulled, 1);
    assert_eq!(
        bob.record(&alice.did(), &record.record_id).unwrap().fields.title,
        "Budget"
    );

    // Downgrade known to the server before bob edits
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
    assert_eq!(server.version_of(&alice.did(), &record.record_id), Some(1));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_deletion_detected_through_relay() {
    let server = MemoryRemoteServer::new();
    let node = relay(&server).await;
    let alice = identity();
    let me = alice.did();
    let device = relayed_device(&node, alice.clone()).await;

    let record = device
        .engine
        .create_record(Collection::tasks(), TaskFields::titled("gone upstream"))
        .unwrap();
    device.sync_self().await;
    assert!(server.remove(&me, &record.record_id));

    let report = device.sync_self().await;
    assert_eq!(report.removed, 1);
    assert!(device.record(&me, &record.record_id).is_none());

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unavailable_store_is_transient_through_relay() {
    let server = MemoryRemoteServer::new();
    let node = relay(&server).await;
    let alice = identity();
    let device = relayed_device(&node, alice.clone()).await;

    device
        .engine
        .create_record(Collection::tasks(), TaskFields::titled("offline"))
        .unwrap();
    server.set_available(false);

    let err = device.engine.sync_once(&alice.did()).await.unwrap_err();
    assert!(matches!(err, SyncError::RemoteUnavailable(_)));
    assert!(err.is_transient());

    server.set_available(true);
    let report = device.sync_self().await;
    assert_eq!(report.pushed, 1);

    node.shutdown().await.unwrap();
}
