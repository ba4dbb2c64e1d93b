//! The `ObjectStore` trait and the listing entry it yields

use std::collections::BTreeMap;

use async_trait::async_trait;
use shroud_core::ShroudResult;
use tokio::io::{AsyncRead, AsyncWrite};

/// Custom per-object key/value fields (S3 user metadata).
pub type Fields = BTreeMap<String, String>;

/// Streaming body handed to [`ObjectStore::upload_large`].
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// One object as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Object name (key) in the bucket namespace
    pub name: String,
    /// Store-assigned identifier for this object version
    pub id: String,
    /// Stored byte length
    pub size: u64,
    pub fields: Fields,
}

impl RemoteObject {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Remote object store scoped to a single bucket.
///
/// Missing objects surface as `ShroudError::NotFound`, transport failures as
/// `ShroudError::Remote`. Implementations must be safe to share between
/// upload workers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable bucket name, for logs.
    fn bucket(&self) -> &str;

    /// Every complete object in the bucket.
    async fn list_objects(&self) -> ShroudResult<Vec<RemoteObject>>;

    /// Single-request upload.
    async fn upload_small(
        &self,
        name: &str,
        body: Vec<u8>,
        fields: &Fields,
    ) -> ShroudResult<RemoteObject>;

    /// Multipart upload of `size` bytes read from `body`.
    async fn upload_large(
        &self,
        name: &str,
        body: BodyReader,
        size: u64,
        fields: &Fields,
    ) -> ShroudResult<RemoteObject>;

    async fn download_by_id(
        &self,
        id: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> ShroudResult<u64>;

    async fn download_by_name(
        &self,
        name: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> ShroudResult<u64>;

    /// Delete one object version. Also cancels an incomplete large upload
    /// with that name and id.
    async fn delete(&self, name: &str, id: &str) -> ShroudResult<()>;

    /// Large uploads that were started but never finished.
    async fn list_incomplete_large(&self) -> ShroudResult<Vec<RemoteObject>>;

    /// Convenience: download a (small) object into memory.
    async fn read_object(&self, name: &str) -> ShroudResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.download_by_name(name, &mut buf).await?;
        Ok(buf)
    }
}
