//! OpenDAL-backed object store for S3-compatible endpoints

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use opendal::{ErrorKind, Operator, Writer};
use shroud_core::{ShroudError, ShroudResult};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::store::{BodyReader, Fields, ObjectStore, RemoteObject};

/// Bytes fetched per ranged read when streaming a download.
const DOWNLOAD_RANGE: u64 = 8 * 1024 * 1024;

/// In-flight `stat` requests while listing the bucket.
const LIST_STAT_CONCURRENCY: usize = 16;

/// Minimal config needed to build an operator
/// (full config lives in shroud-core's StorageConfig)
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Build an OpenDAL Operator for an S3-compatible endpoint
///
/// Uses path-style addressing (default in opendal 0.55), which MinIO and
/// SeaweedFS require.
pub fn build_operator(cfg: &StorageConfig) -> Result<Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(&cfg.secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// Build an operator from shroud-core config + loaded credentials.
///
/// If `enforce_tls` is true and the endpoint uses HTTP, this returns an error.
/// Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_from_core_config(
    storage: &shroud_core::config::StorageConfig,
    access_key_id: &str,
    secret_access_key: &str,
) -> Result<Operator> {
    if storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            anyhow::bail!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local testing.",
                storage.endpoint
            );
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
        );
    }

    build_operator(&StorageConfig {
        endpoint: storage.endpoint.clone(),
        region: storage.region.clone(),
        bucket: storage.bucket.clone(),
        access_key_id: access_key_id.to_string(),
        secret_access_key: secret_access_key.to_string(),
    })
}

/// [`ObjectStore`] over an OpenDAL operator.
///
/// Custom fields travel as S3 user metadata. The object key doubles as its
/// id. Abandoned multipart uploads are not enumerable through OpenDAL, so
/// `list_incomplete_large` always reports none; bucket lifecycle rules are
/// expected to reap them.
#[derive(Clone)]
pub struct OpendalStore {
    op: Operator,
    bucket: String,
    multipart_chunk_size: usize,
    multipart_concurrency: usize,
}

impl OpendalStore {
    pub fn new(op: Operator, bucket: impl Into<String>) -> Self {
        Self {
            op,
            bucket: bucket.into(),
            multipart_chunk_size: 64 * 1024 * 1024,
            multipart_concurrency: 4,
        }
    }

    pub fn with_multipart(mut self, chunk_size: usize, concurrency: usize) -> Self {
        self.multipart_chunk_size = chunk_size.max(5 * 1024 * 1024);
        self.multipart_concurrency = concurrency.max(1);
        self
    }

    /// Connect using the `[storage]` config section and explicit credentials.
    pub fn connect(
        storage: &shroud_core::config::StorageConfig,
        access_key_id: &str,
        secret_access_key: &str,
    ) -> ShroudResult<Self> {
        let op = build_from_core_config(storage, access_key_id, secret_access_key)?;
        Ok(Self::new(op, storage.bucket.clone())
            .with_multipart(storage.multipart_chunk_size, storage.multipart_concurrency))
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    async fn stat_object(&self, name: &str) -> ShroudResult<RemoteObject> {
        let meta = self.op.stat(name).await.map_err(|e| map_err(name, e))?;
        let fields: Fields = meta
            .user_metadata()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Ok(RemoteObject {
            name: name.to_string(),
            id: name.to_string(),
            size: meta.content_length(),
            fields,
        })
    }
}

/// Feed `body` into `writer` part by part; exactly `size` bytes must arrive.
async fn copy_parts(
    writer: &mut Writer,
    body: &mut BodyReader,
    part_size: usize,
    name: &str,
    size: u64,
) -> ShroudResult<()> {
    let mut sent: u64 = 0;
    let mut buf = vec![0u8; part_size];
    loop {
        let n = body.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer
            .write(buf[..n].to_vec())
            .await
            .map_err(|e| map_err(name, e))?;
        sent += n as u64;
    }
    if sent != size {
        return Err(ShroudError::Remote(format!(
            "large upload {name}: declared {size} bytes, sent {sent}"
        )));
    }
    Ok(())
}

/// Abort a failed multipart upload so no parts stay behind under `name`.
async fn abort_writer(writer: &mut Writer, name: &str) {
    if let Err(e) = writer.abort().await {
        tracing::warn!(key = name, "failed to abort multipart upload: {e}");
    }
}

fn map_err(name: &str, e: opendal::Error) -> ShroudError {
    if e.kind() == ErrorKind::NotFound {
        ShroudError::NotFound(format!("object {name}"))
    } else {
        ShroudError::Remote(format!("{name}: {e}"))
    }
}

#[async_trait]
impl ObjectStore for OpendalStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list_objects(&self) -> ShroudResult<Vec<RemoteObject>> {
        let keys: Vec<String> = self
            .op
            .list_with("")
            .recursive(true)
            .await
            .map_err(|e| map_err("<list>", e))?
            .into_iter()
            .filter(|entry| entry.metadata().is_file())
            .map(|entry| entry.path().to_string())
            .collect();

        // Listings carry no user metadata; stat each key for its fields.
        let mut stats = stream::iter(keys)
            .map(|key| async move {
                let stat = self.stat_object(&key).await;
                (key, stat)
            })
            .buffer_unordered(LIST_STAT_CONCURRENCY);

        let mut objects = Vec::new();
        while let Some((key, stat)) = stats.next().await {
            match stat {
                Ok(obj) => objects.push(obj),
                Err(ShroudError::NotFound(_)) => {
                    tracing::debug!(%key, "object vanished during listing");
                }
                Err(e) => return Err(e),
            }
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::debug!(bucket = %self.bucket, count = objects.len(), "listed bucket");
        Ok(objects)
    }

    async fn upload_small(
        &self,
        name: &str,
        body: Vec<u8>,
        fields: &Fields,
    ) -> ShroudResult<RemoteObject> {
        let size = body.len() as u64;
        let mut request = self.op.write_with(name, body);
        if !fields.is_empty() {
            request = request.user_metadata(fields.clone());
        }
        request.await.map_err(|e| map_err(name, e))?;

        Ok(RemoteObject {
            name: name.to_string(),
            id: name.to_string(),
            size,
            fields: fields.clone(),
        })
    }

    async fn upload_large(
        &self,
        name: &str,
        mut body: BodyReader,
        size: u64,
        fields: &Fields,
    ) -> ShroudResult<RemoteObject> {
        let mut request = self
            .op
            .writer_with(name)
            .chunk(self.multipart_chunk_size)
            .concurrent(self.multipart_concurrency);
        if !fields.is_empty() {
            request = request.user_metadata(fields.clone());
        }
        let mut writer = request.await.map_err(|e| map_err(name, e))?;

        let written = match copy_parts(&mut writer, &mut body, self.multipart_chunk_size, name, size)
            .await
        {
            Ok(()) => writer.close().await.map(|_| ()).map_err(|e| map_err(name, e)),
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            abort_writer(&mut writer, name).await;
            return Err(e);
        }

        tracing::debug!(key = name, bytes = size, "multipart upload complete");
        Ok(RemoteObject {
            name: name.to_string(),
            id: name.to_string(),
            size,
            fields: fields.clone(),
        })
    }

    async fn download_by_id(
        &self,
        id: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> ShroudResult<u64> {
        self.download_by_name(id, sink).await
    }

    async fn download_by_name(
        &self,
        name: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> ShroudResult<u64> {
        let len = self
            .op
            .stat(name)
            .await
            .map_err(|e| map_err(name, e))?
            .content_length();
        let reader = self.op.reader(name).await.map_err(|e| map_err(name, e))?;

        let mut offset = 0u64;
        while offset < len {
            let end = (offset + DOWNLOAD_RANGE).min(len);
            let buf = reader
                .read(offset..end)
                .await
                .map_err(|e| map_err(name, e))?;
            sink.write_all(&buf.to_vec()).await?;
            offset = end;
        }
        sink.flush().await?;
        Ok(len)
    }

    async fn delete(&self, name: &str, _id: &str) -> ShroudResult<()> {
        self.op.delete(name).await.map_err(|e| map_err(name, e))
    }

    async fn list_incomplete_large(&self) -> ShroudResult<Vec<RemoteObject>> {
        Ok(Vec::new())
    }
}
