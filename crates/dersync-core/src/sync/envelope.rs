//! Sealed record envelopes and wire-format detection
//!
//! Three generations of clients have written to the remote store. Every
//! fetched object is first read as a [`RawEnvelope`] (all fields optional)
//! and then classified once by [`detect`]:
//!
//! ```text
//! version + encrypted_from   -> Versioned  (current)
//! metadata                   -> Delegated  (v1: owner->self seal, delegate list only)
//! encrypted_data = "{...}"   -> Legacy     (plain JSON, no seal)
//! ```
//!
//! Legacy and Delegated objects carry no server version; they are read as
//! version 1 so any later versioned write supersedes them.
//!
//! Byte fields travel as standard base64 strings.

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::identity::{Did, IdentityProvider};
use crate::seal::{self, OpenedAs};
use crate::types::{Collection, DelegateGrants, Record, RecordId};

/// Version assumed for envelopes written before the server assigned versions
pub const UNVERSIONED: u64 = 1;

mod b64 {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(serde::de::Error::custom)
    }
}

mod b64_map {
    use std::collections::BTreeMap;

    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::identity::Did;

    pub fn serialize<S: Serializer>(map: &BTreeMap<Did, Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&Did, String> = map
            .iter()
            .map(|(k, v)| (k, base64::engine::general_purpose::STANDARD.encode(v)))
            .collect();
        encoded.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<Did, Vec<u8>>, D::Error> {
        let encoded = BTreeMap::<Did, String>::deserialize(d)?;
        encoded
            .into_iter()
            .map(|(k, v)| {
                base64::engine::general_purpose::STANDARD
                    .decode(v)
                    .map(|bytes| (k, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// A record as the remote store holds it: ciphertext plus routing fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub record_id: RecordId,
    pub collection: Collection,
    pub owner: Did,
    /// Owner copy, sealed between `encrypted_from` and `owner`
    #[serde(with = "b64")]
    pub encrypted_data: Vec<u8>,
    /// Identity that produced every ciphertext in this envelope
    pub encrypted_from: Did,
    #[serde(with = "b64_map", default)]
    pub delegate_payloads: BTreeMap<Did, Vec<u8>>,
    /// Server-assigned; on push, the version the edit was based on
    pub version: u64,
    pub updated_at: i64,
}

impl SealedEnvelope {
    /// Seal an encoded payload for the record's owner and every granted delegate.
    pub fn seal(identity: &dyn IdentityProvider, record: &Record, plaintext: &[u8]) -> SyncResult<Self> {
        let me = identity.did();
        let encrypted_data = if me == record.owner {
            seal::seal_to_self(identity, plaintext)?
        } else {
            seal::seal_to(identity, plaintext, &record.owner)?
        };
        let recipients = record.grants.recipients();
        let delegate_payloads = seal::seal_for_delegates(identity, plaintext, recipients.iter())?;

        Ok(Self {
            record_id: record.record_id.clone(),
            collection: record.collection.clone(),
            owner: record.owner.clone(),
            encrypted_data,
            encrypted_from: me,
            delegate_payloads,
            version: record.version,
            updated_at: record.fields.updated_at,
        })
    }

    /// Delegates holding a payload entry
    pub fn payload_holders(&self) -> BTreeSet<Did> {
        self.delegate_payloads.keys().cloned().collect()
    }
}

/// Delegation metadata carried in clear by v1 envelopes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationMetadata {
    pub schema_version: u32,
    pub read_delegates: BTreeSet<Did>,
    pub write_delegates: BTreeSet<Did>,
}

impl DelegationMetadata {
    pub fn grants(&self) -> DelegateGrants {
        DelegateGrants {
            read: self.read_delegates.clone(),
            write: self.write_delegates.clone(),
        }
    }
}

/// Any stored object, before classification. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawEnvelope {
    pub record_id: Option<String>,
    pub collection: Option<String>,
    pub owner: Option<Did>,
    pub encrypted_data: Option<String>,
    pub encrypted_from: Option<Did>,
    pub delegate_payloads: Option<BTreeMap<Did, String>>,
    pub metadata: Option<DelegationMetadata>,
    pub version: Option<u64>,
    pub updated_at: Option<i64>,
}

impl From<&SealedEnvelope> for RawEnvelope {
    fn from(env: &SealedEnvelope) -> Self {
        let b64 = &base64::engine::general_purpose::STANDARD;
        Self {
            record_id: Some(env.record_id.to_string()),
            collection: Some(env.collection.to_string()),
            owner: Some(env.owner.clone()),
            encrypted_data: Some(b64.encode(&env.encrypted_data)),
            encrypted_from: Some(env.encrypted_from.clone()),
            delegate_payloads: Some(
                env.delegate_payloads
                    .iter()
                    .map(|(k, v)| (k.clone(), b64.encode(v)))
                    .collect(),
            ),
            metadata: None,
            version: Some(env.version),
            updated_at: Some(env.updated_at),
        }
    }
}

/// A classified envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEnvelope {
    /// Plain JSON written by the oldest clients
    Legacy {
        record_id: RecordId,
        collection: Collection,
        owner: Did,
        plaintext: Vec<u8>,
    },
    /// Owner-to-self ciphertext with clear delegate lists
    Delegated {
        record_id: RecordId,
        collection: Collection,
        owner: Did,
        ciphertext: Vec<u8>,
        metadata: DelegationMetadata,
    },
    /// Current format
    Versioned(SealedEnvelope),
}

/// Decrypted envelope contents, ready for decoding.
#[derive(Debug, Clone)]
pub struct OpenedEnvelope {
    pub record_id: RecordId,
    pub collection: Collection,
    pub owner: Did,
    pub version: u64,
    pub plaintext: Vec<u8>,
    /// `None` for legacy plaintext
    pub opened_as: Option<OpenedAs>,
    /// Delegates that hold a sealed copy
    pub payload_holders: BTreeSet<Did>,
    /// Grants carried in clear (v1 only)
    pub clear_grants: Option<DelegateGrants>,
}

/// Classify a raw object fetched for (`owner`, `collection`).
///
/// `owner` and `collection` fill in fields older writers left out.
pub fn detect(raw: RawEnvelope, owner: &Did, collection: &Collection) -> SyncResult<WireEnvelope> {
    let record_id = raw
        .record_id
        .filter(|id| !id.is_empty())
        .map(RecordId::from_string)
        .ok_or_else(|| SyncError::RemoteProtocol("envelope without record_id".into()))?;
    let collection = raw.collection.map(Collection::new).unwrap_or_else(|| collection.clone());
    let owner = raw.owner.unwrap_or_else(|| owner.clone());
    let data = raw
        .encrypted_data
        .ok_or_else(|| SyncError::RemoteProtocol(format!("{}: no encrypted_data", record_id)))?;

    let decode_b64 = |text: &str| {
        base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(|e| SyncError::RemoteProtocol(format!("{}: bad base64: {}", record_id, e)))
    };

    if let (Some(version), Some(encrypted_from)) = (raw.version, raw.encrypted_from) {
        let mut delegate_payloads = BTreeMap::new();
        for (did, text) in raw.delegate_payloads.unwrap_or_default() {
            delegate_payloads.insert(did, decode_b64(&text)?);
        }
        return Ok(WireEnvelope::Versioned(SealedEnvelope {
            encrypted_data: decode_b64(&data)?,
            record_id,
            collection,
            owner,
            encrypted_from,
            delegate_payloads,
            version,
            updated_at: raw.updated_at.unwrap_or_default(),
        }));
    }

    if let Some(metadata) = raw.metadata {
        return Ok(WireEnvelope::Delegated {
            ciphertext: decode_b64(&data)?,
            record_id,
            collection,
            owner,
            metadata,
        });
    }

    if data.trim_start().starts_with('{') {
        return Ok(WireEnvelope::Legacy {
            record_id,
            collection,
            owner,
            plaintext: data.into_bytes(),
        });
    }

    Err(SyncError::RemoteProtocol(format!(
        "{}: unrecognized envelope format",
        record_id
    )))
}

impl WireEnvelope {
    pub fn record_id(&self) -> &RecordId {
        match self {
            WireEnvelope::Legacy { record_id, .. } | WireEnvelope::Delegated { record_id, .. } => {
                record_id
            }
            WireEnvelope::Versioned(env) => &env.record_id,
        }
    }

    pub fn owner(&self) -> &Did {
        match self {
            WireEnvelope::Legacy { owner, .. } | WireEnvelope::Delegated { owner, .. } => owner,
            WireEnvelope::Versioned(env) => &env.owner,
        }
    }

    /// Server version, or [`UNVERSIONED`] for older formats
    pub fn version(&self) -> u64 {
        match self {
            WireEnvelope::Versioned(env) => env.version,
            _ => UNVERSIONED,
        }
    }

    pub fn format_name(&self) -> &'static str {
        match self {
            WireEnvelope::Legacy { .. } => "legacy",
            WireEnvelope::Delegated { .. } => "delegated",
            WireEnvelope::Versioned(_) => "versioned",
        }
    }

    /// Recover the plaintext blob.
    pub fn open(self, identity: &dyn IdentityProvider) -> SyncResult<OpenedEnvelope> {
        match self {
            WireEnvelope::Legacy {
                record_id,
                collection,
                owner,
                plaintext,
            } => Ok(OpenedEnvelope {
                record_id,
                collection,
                owner,
                version: UNVERSIONED,
                plaintext,
                opened_as: None,
                payload_holders: BTreeSet::new(),
                clear_grants: None,
            }),
            WireEnvelope::Delegated {
                record_id,
                collection,
                owner,
                ciphertext,
                metadata,
            } => {
                let plaintext = seal::unseal_from(identity, &ciphertext, &owner)?;
                Ok(OpenedEnvelope {
                    record_id,
                    collection,
                    owner,
                    version: UNVERSIONED,
                    plaintext,
                    opened_as: Some(OpenedAs::Owner),
                    payload_holders: BTreeSet::new(),
                    clear_grants: Some(metadata.grants()),
                })
            }
            WireEnvelope::Versioned(env) => {
                let (plaintext, opened_as) = seal::open(
                    identity,
                    &env.encrypted_data,
                    &env.encrypted_from,
                    &env.delegate_payloads,
                )?;
                debug!(
                    record_id = %env.record_id,
                    version = env.version,
                    ?opened_as,
                    "Opened envelope"
                );
                Ok(OpenedEnvelope {
                    payload_holders: env.payload_holders(),
                    record_id: env.record_id,
                    collection: env.collection,
                    owner: env.owner,
                    version: env.version,
                    plaintext,
                    opened_as: Some(opened_as),
                    clear_grants: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;
    use crate::types::{Permission, TaskFields};

    fn owned_record(owner: &LocalIdentity) -> Record {
        Record::new(owner.did(), Collection::tasks(), TaskFields::titled("Fix fence"))
    }

    #[test]
    fn test_versioned_roundtrip_through_raw() {
        let owner = LocalIdentity::generate();
        let delegate = LocalIdentity::generate();
        let mut record = owned_record(&owner);
        record.grants.grant(delegate.did(), Permission::Read);
        record.version = 7;

        let env = SealedEnvelope::seal(&owner, &record, b"{\"title\":\"Fix fence\"}").unwrap();
        let json = serde_json::to_string(&env).unwrap();
        let raw: RawEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(raw, RawEnvelope::from(&env));

        let detected = detect(raw, &owner.did(), &Collection::tasks()).unwrap();
        assert_eq!(detected.format_name(), "versioned");
        assert_eq!(detected.version(), 7);
        assert_eq!(detected, WireEnvelope::Versioned(env));
    }

    #[test]
    fn test_delegate_opens_versioned() {
        let owner = LocalIdentity::generate();
        let delegate = LocalIdentity::generate();
        let mut record = owned_record(&owner);
        record.grants.grant(delegate.did(), Permission::Write);

        let env = SealedEnvelope::seal(&owner, &record, b"{}").unwrap();
        let opened = WireEnvelope::Versioned(env).open(&delegate).unwrap();
        assert_eq!(opened.plaintext, b"{}");
        assert_eq!(opened.opened_as, Some(OpenedAs::Delegate));
        assert!(opened.payload_holders.contains(&delegate.did()));
    }

    #[test]
    fn test_detect_legacy_plain_json() {
        let owner = LocalIdentity::generate().did();
        let raw: RawEnvelope = serde_json::from_str(
            r#"{"record_id":"old-1","encrypted_data":"{\"title\":\"Buy seeds\"}"}"#,
        )
        .unwrap();

        let detected = detect(raw, &owner, &Collection::tasks()).unwrap();
        assert_eq!(detected.format_name(), "legacy");
        assert_eq!(detected.version(), UNVERSIONED);
        assert_eq!(detected.owner(), &owner);

        let opened = detected.open(&LocalIdentity::generate()).unwrap();
        assert_eq!(opened.plaintext, br#"{"title":"Buy seeds"}"#);
        assert_eq!(opened.collection, Collection::tasks());
        assert!(opened.opened_as.is_none());
    }

    #[test]
    fn test_detect_delegated_v1() {
        let owner = LocalIdentity::generate();
        let delegate = LocalIdentity::generate().did();
        let ciphertext = seal::seal_to_self(&owner, b"{\"title\":\"v1\"}").unwrap();
        let raw = RawEnvelope {
            record_id: Some("v1-rec".into()),
            encrypted_data: Some(base64::engine::general_purpose::STANDARD.encode(&ciphertext)),
            metadata: Some(DelegationMetadata {
                schema_version: 1,
                read_delegates: [delegate.clone()].into_iter().collect(),
                write_delegates: BTreeSet::new(),
            }),
            ..Default::default()
        };

        let detected = detect(raw, &owner.did(), &Collection::tasks()).unwrap();
        assert_eq!(detected.format_name(), "delegated");

        let opened = detected.open(&owner).unwrap();
        assert_eq!(opened.plaintext, b"{\"title\":\"v1\"}");
        let grants = opened.clear_grants.unwrap();
        assert_eq!(grants.permission_of(&delegate), Some(Permission::Read));
    }

    #[test]
    fn test_detect_rejects_garbage() {
        let owner = LocalIdentity::generate().did();
        let tasks = Collection::tasks();

        assert!(detect(RawEnvelope::default(), &owner, &tasks).is_err());

        let no_data = RawEnvelope {
            record_id: Some("x".into()),
            ..Default::default()
        };
        assert!(matches!(
            detect(no_data, &owner, &tasks),
            Err(SyncError::RemoteProtocol(_))
        ));

        let opaque = RawEnvelope {
            record_id: Some("x".into()),
            encrypted_data: Some("not json, not tagged".into()),
            ..Default::default()
        };
        assert!(detect(opaque, &owner, &tasks).is_err());
    }

    #[test]
    fn test_outsider_cannot_open() {
        let owner = LocalIdentity::generate();
        let env = SealedEnvelope::seal(&owner, &owned_record(&owner), b"secret").unwrap();
        let result = WireEnvelope::Versioned(env).open(&LocalIdentity::generate());
        assert!(matches!(result, Err(SyncError::Unseal(_))));
    }
}
