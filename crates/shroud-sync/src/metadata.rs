//! Remote metadata model: intrinsics, namefiles and their classification
//!
//! Every object in the bucket is one of:
//!
//! ```text
//! shroud.keyfile        sealed master key
//! names/<uuid>          namefile   fields: timestamp, m = enc(local name), a = intrinsic name
//! <uuid>                intrinsic  fields: m = enc(digest(20) || size(8, LE)), body = framed stream
//! anything else         unrecognized (foreign object, or sealed under another key)
//! ```
//!
//! Object names are random and carry nothing about the content or the
//! local path. Classification happens once, at ingestion; nothing
//! downstream looks at name strings.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use shroud_core::{ShroudError, ShroudResult};
use shroud_crypto::{Crypter, Digest, DIGEST_LEN};
use shroud_storage::{Fields, RemoteObject};
use uuid::Uuid;

pub const KEYFILE_NAME: &str = "shroud.keyfile";
pub const NAMEFILE_PREFIX: &str = "names/";

pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_META: &str = "m";
pub const FIELD_INTRINSIC: &str = "a";

/// Random filler carried as a namefile's body.
pub const NAMEFILE_BODY_LEN: usize = 16;

const INTRINSIC_PACKED_LEN: usize = DIGEST_LEN + 8;

/// Immutable record of one uploaded file body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntrinsicMetadata {
    pub digest: Digest,
    pub size: u64,
    pub remote_name: String,
    pub remote_id: String,
}

impl IntrinsicMetadata {
    /// A fresh random object name for a new body.
    pub fn new_remote_name() -> String {
        Uuid::new_v4().to_string()
    }

    /// Custom fields to attach to the body upload.
    pub fn encode_fields(digest: &Digest, size: u64, crypter: &Crypter) -> ShroudResult<Fields> {
        let blob = crypter.encrypt_blob(&pack_intrinsic(digest, size))?;
        let mut fields = Fields::new();
        fields.insert(FIELD_META.to_string(), BASE64.encode(blob));
        Ok(fields)
    }

    pub fn decode(obj: &RemoteObject, crypter: &Crypter) -> ShroudResult<Self> {
        let blob = decode_field(obj, FIELD_META)?;
        let (digest, size) = unpack_intrinsic(&crypter.decrypt_blob(&blob)?)?;
        Ok(Self {
            digest,
            size,
            remote_name: obj.name.clone(),
            remote_id: obj.id.clone(),
        })
    }

    /// Interchangeable content: same digest and same size.
    pub fn same_content(&self, digest: &Digest, size: u64) -> bool {
        self.size == size && &self.digest == digest
    }
}

/// Mutable binding of a local name to an intrinsic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamefileMetadata {
    /// Local modification time, milliseconds since the epoch
    pub timestamp: i64,
    pub local_name: String,
    pub remote_name: String,
    pub remote_id: String,
    /// Remote name of the intrinsic this namefile resolves to
    pub intrinsic_name: String,
}

impl NamefileMetadata {
    pub fn new_remote_name() -> String {
        format!("{NAMEFILE_PREFIX}{}", Uuid::new_v4())
    }

    pub fn encode_fields(
        timestamp: i64,
        local_name: &str,
        intrinsic_name: &str,
        crypter: &Crypter,
    ) -> ShroudResult<Fields> {
        let blob = crypter.encrypt_blob(local_name.as_bytes())?;
        let mut fields = Fields::new();
        fields.insert(FIELD_TIMESTAMP.to_string(), timestamp.to_string());
        fields.insert(FIELD_META.to_string(), BASE64.encode(blob));
        fields.insert(FIELD_INTRINSIC.to_string(), intrinsic_name.to_string());
        Ok(fields)
    }

    pub fn filler_body() -> Vec<u8> {
        let mut body = vec![0u8; NAMEFILE_BODY_LEN];
        rand::thread_rng().fill_bytes(&mut body);
        body
    }

    pub fn decode(obj: &RemoteObject, crypter: &Crypter) -> ShroudResult<Self> {
        let timestamp = require_field(obj, FIELD_TIMESTAMP)?
            .parse::<i64>()
            .map_err(|e| ShroudError::Format(format!("{}: bad timestamp: {e}", obj.name)))?;
        let intrinsic_name = require_field(obj, FIELD_INTRINSIC)?.to_string();
        let name_bytes = crypter.decrypt_blob(&decode_field(obj, FIELD_META)?)?;
        let local_name = String::from_utf8(name_bytes)
            .map_err(|e| ShroudError::Format(format!("{}: local name not UTF-8: {e}", obj.name)))?;

        Ok(Self {
            timestamp,
            local_name,
            remote_name: obj.name.clone(),
            remote_id: obj.id.clone(),
            intrinsic_name,
        })
    }
}

/// A namefile joined to the intrinsic it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub namefile: NamefileMetadata,
    pub intrinsic: IntrinsicMetadata,
}

impl RemoteRecord {
    pub fn local_name(&self) -> &str {
        &self.namefile.local_name
    }

    pub fn size(&self) -> u64 {
        self.intrinsic.size
    }

    pub fn timestamp(&self) -> i64 {
        self.namefile.timestamp
    }
}

/// One listed object, decoded.
#[derive(Debug, Clone)]
pub enum RemoteEntry {
    Keyfile(RemoteObject),
    Intrinsic(IntrinsicMetadata),
    Namefile(NamefileMetadata),
    Unrecognized { object: RemoteObject, reason: String },
}

/// Decode a listed object. Decode failures never propagate: a
/// foreign or undecodable object is `Unrecognized`.
pub fn classify(obj: &RemoteObject, crypter: &Crypter) -> RemoteEntry {
    if obj.name == KEYFILE_NAME {
        return RemoteEntry::Keyfile(obj.clone());
    }

    let decoded = if obj.name.starts_with(NAMEFILE_PREFIX) {
        NamefileMetadata::decode(obj, crypter).map(RemoteEntry::Namefile)
    } else {
        IntrinsicMetadata::decode(obj, crypter).map(RemoteEntry::Intrinsic)
    };

    decoded.unwrap_or_else(|e| RemoteEntry::Unrecognized {
        object: obj.clone(),
        reason: e.to_string(),
    })
}

pub fn pack_intrinsic(digest: &Digest, size: u64) -> [u8; INTRINSIC_PACKED_LEN] {
    let mut out = [0u8; INTRINSIC_PACKED_LEN];
    out[..DIGEST_LEN].copy_from_slice(digest);
    out[DIGEST_LEN..].copy_from_slice(&size.to_le_bytes());
    out
}

pub fn unpack_intrinsic(bytes: &[u8]) -> ShroudResult<(Digest, u64)> {
    if bytes.len() != INTRINSIC_PACKED_LEN {
        return Err(ShroudError::Format(format!(
            "intrinsic metadata has {} bytes, expected {INTRINSIC_PACKED_LEN}",
            bytes.len()
        )));
    }
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&bytes[..DIGEST_LEN]);
    let mut size = [0u8; 8];
    size.copy_from_slice(&bytes[DIGEST_LEN..]);
    Ok((digest, u64::from_le_bytes(size)))
}

fn require_field<'a>(obj: &'a RemoteObject, key: &str) -> ShroudResult<&'a str> {
    obj.field(key)
        .ok_or_else(|| ShroudError::Format(format!("{}: missing field '{key}'", obj.name)))
}

fn decode_field(obj: &RemoteObject, key: &str) -> ShroudResult<Vec<u8>> {
    BASE64
        .decode(require_field(obj, key)?)
        .map_err(|e| ShroudError::Format(format!("{}: field '{key}' is not base64: {e}", obj.name)))
}
