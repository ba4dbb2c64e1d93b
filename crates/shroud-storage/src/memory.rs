//! In-memory object store for tests and dry runs
//!
//! Behaves like a real bucket as far as the sync engine can tell: every
//! upload gets a fresh id, large uploads can be left incomplete, and every
//! mutating call is recorded so tests can assert on exactly what was sent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use shroud_core::{ShroudError, ShroudResult};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::store::{BodyReader, Fields, ObjectStore, RemoteObject};

/// One recorded store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    UploadSmall { name: String, size: u64 },
    UploadLarge { name: String, size: u64 },
    Delete { name: String },
}

impl StoreOp {
    pub fn name(&self) -> &str {
        match self {
            StoreOp::UploadSmall { name, .. }
            | StoreOp::UploadLarge { name, .. }
            | StoreOp::Delete { name } => name,
        }
    }

    pub fn is_upload(&self) -> bool {
        !matches!(self, StoreOp::Delete { .. })
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Stored>,
    incomplete: BTreeMap<String, RemoteObject>,
    ops: Vec<StoreOp>,
    next_id: u64,
    fail_uploads: bool,
}

struct Stored {
    meta: RemoteObject,
    body: Vec<u8>,
}

impl State {
    fn mint_id(&mut self) -> String {
        self.next_id += 1;
        format!("mem-{:08}", self.next_id)
    }

    fn store(&mut self, name: &str, body: Vec<u8>, fields: &Fields) -> RemoteObject {
        let meta = RemoteObject {
            name: name.to_string(),
            id: self.mint_id(),
            size: body.len() as u64,
            fields: fields.clone(),
        };
        self.objects.insert(
            name.to_string(),
            Stored {
                meta: meta.clone(),
                body,
            },
        );
        meta
    }
}

/// A thread-safe in-process bucket.
#[derive(Clone)]
pub struct MemoryStore {
    bucket: String,
    state: Arc<Mutex<State>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Place an object directly, bypassing the operation log.
    pub fn seed(&self, name: &str, body: Vec<u8>, fields: Fields) -> RemoteObject {
        self.lock().store(name, body, &fields)
    }

    /// Simulate a large upload that was started and then abandoned.
    pub fn begin_incomplete_large(&self, name: &str, fields: Fields) -> RemoteObject {
        let mut state = self.lock();
        let meta = RemoteObject {
            name: name.to_string(),
            id: state.mint_id(),
            size: 0,
            fields,
        };
        state.incomplete.insert(name.to_string(), meta.clone());
        meta
    }

    /// Make every subsequent upload fail with a remote error.
    pub fn fail_uploads(&self, fail: bool) {
        self.lock().fail_uploads = fail;
    }

    /// Every recorded mutation, oldest first.
    pub fn ops(&self) -> Vec<StoreOp> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    pub fn uploads(&self) -> Vec<StoreOp> {
        self.ops().into_iter().filter(StoreOp::is_upload).collect()
    }

    pub fn deletions(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                StoreOp::Delete { name } => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn object_names(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn incomplete_names(&self) -> Vec<String> {
        self.lock().incomplete.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().objects.contains_key(name)
    }

    pub fn body(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(name).map(|s| s.body.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_upload(&self, name: &str) -> ShroudResult<()> {
        if self.lock().fail_uploads {
            return Err(ShroudError::Remote(format!("injected upload failure: {name}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list_objects(&self) -> ShroudResult<Vec<RemoteObject>> {
        Ok(self.lock().objects.values().map(|s| s.meta.clone()).collect())
    }

    async fn upload_small(
        &self,
        name: &str,
        body: Vec<u8>,
        fields: &Fields,
    ) -> ShroudResult<RemoteObject> {
        self.check_upload(name)?;
        let mut state = self.lock();
        let meta = state.store(name, body, fields);
        state.ops.push(StoreOp::UploadSmall {
            name: name.to_string(),
            size: meta.size,
        });
        Ok(meta)
    }

    async fn upload_large(
        &self,
        name: &str,
        mut body: BodyReader,
        size: u64,
        fields: &Fields,
    ) -> ShroudResult<RemoteObject> {
        self.check_upload(name)?;

        let mut buf = Vec::with_capacity(size as usize);
        body.read_to_end(&mut buf).await?;
        if buf.len() as u64 != size {
            return Err(ShroudError::Remote(format!(
                "large upload {name}: declared {size} bytes, got {}",
                buf.len()
            )));
        }

        let mut state = self.lock();
        state.incomplete.remove(name);
        let meta = state.store(name, buf, fields);
        state.ops.push(StoreOp::UploadLarge {
            name: name.to_string(),
            size,
        });
        Ok(meta)
    }

    async fn download_by_id(
        &self,
        id: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> ShroudResult<u64> {
        let body = self
            .lock()
            .objects
            .values()
            .find(|s| s.meta.id == id)
            .map(|s| s.body.clone())
            .ok_or_else(|| ShroudError::NotFound(format!("object id {id}")))?;
        sink.write_all(&body).await?;
        sink.flush().await?;
        Ok(body.len() as u64)
    }

    async fn download_by_name(
        &self,
        name: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> ShroudResult<u64> {
        let body = self
            .body(name)
            .ok_or_else(|| ShroudError::NotFound(format!("object {name}")))?;
        sink.write_all(&body).await?;
        sink.flush().await?;
        Ok(body.len() as u64)
    }

    async fn delete(&self, name: &str, id: &str) -> ShroudResult<()> {
        let mut state = self.lock();
        let removed_complete = state.objects.get(name).is_some_and(|s| s.meta.id == id);
        if removed_complete {
            state.objects.remove(name);
        }
        let removed_incomplete = state.incomplete.get(name).is_some_and(|m| m.id == id);
        if removed_incomplete {
            state.incomplete.remove(name);
        }
        if !removed_complete && !removed_incomplete {
            return Err(ShroudError::NotFound(format!("object {name} ({id})")));
        }
        state.ops.push(StoreOp::Delete {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn list_incomplete_large(&self) -> ShroudResult<Vec<RemoteObject>> {
        Ok(self.lock().incomplete.values().cloned().collect())
    }
}
