//! Property-based tests for the codec, sealing and version ordering.

mod common;

use std::sync::Arc;

use common::Device;
use dersync_core::codec::{self, Recovery};
use dersync_core::seal;
use dersync_core::sync::MemoryRemoteServer;
use dersync_core::{Collection, IdentityProvider, LocalIdentity, RecordId};
use proptest::prelude::*;

/// Text that agents typically mangle: quotes, backslashes, tabs, newlines
fn messy_text() -> impl Strategy<Value = String> {
    proptest::collection::vec(
        prop_oneof![
            Just('\n'),
            Just('\t'),
            Just('\r'),
            Just('"'),
            Just('\\'),
            Just('é'),
            proptest::char::range('a', 'z'),
            proptest::char::range('0', '9'),
        ],
        0..40,
    )
    .prop_map(|chars| chars.into_iter().collect())
}

/// JSON string literal with quotes and backslashes escaped but control
/// characters left raw, as a careless writer produces
fn raw_literal(text: &str) -> String {
    let mut out = String::from("\"");
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

proptest! {
    #[test]
    fn prop_raw_control_characters_decode(title in messy_text(), notes in messy_text()) {
        let blob = format!(
            "{{\"title\":{},\"notes\":{}}}",
            raw_literal(&title),
            raw_literal(&notes)
        );
        let decoded = codec::decode_tolerant(blob.as_bytes());

        prop_assert_ne!(decoded.recovery, Recovery::Placeholder);
        prop_assert_eq!(&decoded.payload.task.title, &title);
        prop_assert_eq!(&decoded.payload.task.notes, &notes);
        prop_assert!(!decoded.payload.task.deleted);
    }

    #[test]
    fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let decoded = codec::decode_tolerant(&bytes);
        if decoded.recovery == Recovery::Placeholder {
            prop_assert!(decoded.payload.task.deleted);
        }
    }

    #[test]
    fn prop_sealed_copy_opens_only_for_its_recipient(
        plaintext in proptest::collection::vec(any::<u8>(), 0..512)
    ) {
        let owner = LocalIdentity::generate();
        let delegate = LocalIdentity::generate();
        let outsider = LocalIdentity::generate();

        let sealed = seal::seal_to(&owner, &plaintext, &delegate.did()).unwrap();
        prop_assert_eq!(
            seal::unseal_from(&delegate, &sealed, &owner.did()).unwrap(),
            plaintext.clone()
        );
        // The sender can read back what it sealed
        prop_assert_eq!(
            seal::unseal_from(&owner, &sealed, &delegate.did()).unwrap(),
            plaintext
        );
        prop_assert!(seal::unseal_from(&outsider, &sealed, &owner.did()).is_err());
    }
}

#[derive(Debug, Clone)]
enum Op {
    Edit(usize),
    SyncA,
    SyncB,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..2).prop_map(Op::Edit),
        Just(Op::SyncA),
        Just(Op::SyncB),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_local_versions_are_monotonic(ops in proptest::collection::vec(op(), 1..16)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let server = MemoryRemoteServer::new();
            let alice = Arc::new(LocalIdentity::generate());
            let me = alice.did();
            let devices = [Device::new(&server, alice.clone()), Device::new(&server, alice.clone())];

            let record = devices[0]
                .engine
                .create_record(Collection::tasks(), dersync_core::TaskFields::titled("counter"))
                .unwrap();
            devices[0].sync_self().await;
            devices[1].sync_self().await;

            let id: RecordId = record.record_id.clone();
            let mut last = [1u64, 1u64];
            for (step, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Edit(i) => {
                        devices[i]
                            .engine
                            .update_record(&me, &id, |f| f.notes = format!("step {}", step))
                            .unwrap();
                    }
                    Op::SyncA => {
                        devices[0].sync_self().await;
                    }
                    Op::SyncB => {
                        devices[1].sync_self().await;
                    }
                }
                for (i, device) in devices.iter().enumerate() {
                    let version = device.record(&me, &id).unwrap().version;
                    assert!(version >= last[i], "device {} went from {} to {}", i, last[i], version);
                    assert!(Some(version) <= server.version_of(&me, &id));
                    last[i] = version;
                }
            }

            // Settle: both devices end on the server's latest version
            devices[0].sync_self().await;
            devices[1].sync_self().await;
            devices[0].sync_self().await;
            let server_version = server.version_of(&me, &id).unwrap();
            for device in &devices {
                assert_eq!(device.record(&me, &id).unwrap().version, server_version);
            }
        });
    }
}
