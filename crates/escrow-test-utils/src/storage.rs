//! Storage wrapper that records operations and injects failures.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use escrow_core::error::{Error, Result};
use escrow_core::storage::{
    MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};

/// A storage call observed by [`TracingMemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// `get(path)`.
    Get {
        /// Object path.
        path: String,
    },
    /// `put(path, ..)`.
    Put {
        /// Object path.
        path: String,
        /// Payload size.
        size: usize,
        /// Precondition supplied by the caller.
        precondition: WritePrecondition,
        /// Whether the write was applied.
        applied: bool,
    },
    /// `delete(path)`.
    Delete {
        /// Object path.
        path: String,
    },
    /// `list(prefix)`.
    List {
        /// Listed prefix.
        prefix: String,
    },
    /// `head(path)`.
    Head {
        /// Object path.
        path: String,
    },
}

impl StorageOp {
    /// Path or prefix the operation touched.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Get { path }
            | Self::Put { path, .. }
            | Self::Delete { path }
            | Self::Head { path } => path,
            Self::List { prefix } => prefix,
        }
    }

    /// Returns true for an applied write.
    #[must_use]
    pub fn is_applied_put(&self) -> bool {
        matches!(self, Self::Put { applied: true, .. })
    }
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    prefix: String,
    remaining: Option<u32>,
    writes_only: bool,
}

#[derive(Debug, Default)]
struct Recorder {
    operations: Vec<StorageOp>,
    failures: Vec<InjectedFailure>,
}

/// In-memory storage that records every call.
///
/// Injected failures surface as transient storage errors, so retry paths
/// can be driven from tests. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    inner: MemoryBackend,
    recorder: Arc<Mutex<Recorder>>,
    latency: Option<Duration>,
}

impl TracingMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixed delay to every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fails every call under `prefix` until [`Self::clear_failures`].
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.push_failure(prefix.into(), None, false);
    }

    /// Fails every put and delete under `prefix` until
    /// [`Self::clear_failures`]; reads still succeed.
    pub fn inject_write_failure(&self, prefix: impl Into<String>) {
        self.push_failure(prefix.into(), None, true);
    }

    /// Fails the next `times` calls under `prefix`, then recovers.
    pub fn fail_times(&self, prefix: impl Into<String>, times: u32) {
        self.push_failure(prefix.into(), Some(times), false);
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        self.recorder.lock().unwrap().failures.clear();
    }

    /// Returns the recorded operations in call order.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.recorder.lock().unwrap().operations.clone()
    }

    /// Returns applied writes whose path starts with `prefix`.
    #[must_use]
    pub fn applied_puts(&self, prefix: &str) -> Vec<String> {
        self.operations()
            .into_iter()
            .filter(|op| op.is_applied_put() && op.path().starts_with(prefix))
            .map(|op| op.path().to_string())
            .collect()
    }

    /// Forgets recorded operations.
    pub fn clear_operations(&self) {
        self.recorder.lock().unwrap().operations.clear();
    }

    /// Every stored path, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.inner.paths().unwrap()
    }

    /// The wrapped backend, bypassing recording and injection.
    #[must_use]
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    fn push_failure(&self, prefix: String, remaining: Option<u32>, writes_only: bool) {
        self.recorder
            .lock()
            .unwrap()
            .failures
            .push(InjectedFailure {
                prefix,
                remaining,
                writes_only,
            });
    }

    async fn enter(&self, op: StorageOp) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut recorder = self.recorder.lock().unwrap();
        let path = op.path().to_string();
        let is_write = matches!(op, StorageOp::Put { .. } | StorageOp::Delete { .. });
        recorder.operations.push(op);

        let failure = recorder.failures.iter_mut().find(|f| {
            path.starts_with(&f.prefix) && f.remaining != Some(0) && (is_write || !f.writes_only)
        });
        match failure {
            Some(failure) => {
                if let Some(remaining) = failure.remaining.as_mut() {
                    *remaining -= 1;
                }
                Err(Error::storage(format!("injected failure: {path}")))
            }
            None => Ok(()),
        }
    }

    fn mark_put(&self, applied: bool) {
        let mut recorder = self.recorder.lock().unwrap();
        if let Some(StorageOp::Put { applied: a, .. }) = recorder.operations.last_mut() {
            *a = applied;
        }
    }
}

#[async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.enter(StorageOp::Get { path: path.into() }).await?;
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.enter(StorageOp::Put {
            path: path.into(),
            size: data.len(),
            precondition: precondition.clone(),
            applied: false,
        })
        .await?;
        let result = self.inner.put(path, data, precondition).await?;
        self.mark_put(result.is_success());
        Ok(result)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.enter(StorageOp::Delete { path: path.into() }).await?;
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.enter(StorageOp::List {
            prefix: prefix.into(),
        })
        .await?;
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.enter(StorageOp::Head { path: path.into() }).await?;
        self.inner.head(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_operations_in_order() {
        let backend = TracingMemoryBackend::new();
        backend
            .put("a/1", Bytes::from("x"), WritePrecondition::None)
            .await
            .unwrap();
        backend.get("a/1").await.unwrap();
        backend.list("a/").await.unwrap();

        let ops = backend.operations();
        assert_eq!(ops.len(), 3);
        assert!(ops[0].is_applied_put());
        assert_eq!(ops[1], StorageOp::Get { path: "a/1".into() });
        assert_eq!(backend.applied_puts("a/"), vec!["a/1".to_string()]);
    }

    #[tokio::test]
    async fn failed_precondition_is_not_an_applied_put() {
        let backend = TracingMemoryBackend::new();
        backend
            .put("k", Bytes::from("1"), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        let second = backend
            .put("k", Bytes::from("2"), WritePrecondition::DoesNotExist)
            .await
            .unwrap();

        assert!(!second.is_success());
        assert_eq!(backend.applied_puts("k").len(), 1);
    }

    #[tokio::test]
    async fn fail_times_recovers() {
        let backend = TracingMemoryBackend::new();
        backend.fail_times("cursors/", 2);

        for _ in 0..2 {
            let err = backend.get("cursors/x").await.unwrap_err();
            assert!(err.is_transient());
        }
        assert!(matches!(
            backend.get("cursors/x").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn inject_failure_persists_until_cleared() {
        let backend = TracingMemoryBackend::new();
        backend.inject_failure("locks/");
        assert!(backend.head("locks/a").await.is_err());
        assert!(backend.head("locks/a").await.is_err());

        backend.clear_failures();
        assert!(backend.head("locks/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_failure_leaves_reads_working() {
        let backend = TracingMemoryBackend::new();
        backend
            .put("cursors/x", Bytes::from("1"), WritePrecondition::None)
            .await
            .unwrap();
        backend.inject_write_failure("cursors/");

        assert_eq!(backend.get("cursors/x").await.unwrap(), Bytes::from("1"));
        assert!(backend.head("cursors/x").await.unwrap().is_some());
        let err = backend
            .put("cursors/x", Bytes::from("2"), WritePrecondition::None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(backend.delete("cursors/x").await.is_err());
        assert_eq!(backend.inner().get("cursors/x").await.unwrap(), Bytes::from("1"));
    }
}
