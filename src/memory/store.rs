//! Persistent memory store: JSON record log plus a derived vector index.
//!
//! The log is the source of truth. Every successful `insert` rewrites it
//! atomically before returning, so an acknowledged memory survives a crash.
//! The index snapshot is only written by `save` and is discarded on load
//! whenever its fingerprint no longer matches the log.

use crate::config::LoadFailurePolicy;
use crate::error::{Error, MemoryError, Result};
use crate::memory::embedding::{Embedder, validate_embedding};
use crate::memory::index::FlatIndex;
use crate::memory::persist::{self, StorePaths};
use crate::memory::types::{EmbeddingModelInfo, MemoryRecord, MemorySearchResult, Metadata, TIMESTAMP_KEY};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Memory store for insert and similarity retrieval.
///
/// Shared as `Arc<MemoryStore>`. Inserts, saves and index rebuilds are
/// serialised behind a write lock; reads run concurrently with each other.
pub struct MemoryStore {
    embedder: Arc<dyn Embedder>,
    paths: Option<StorePaths>,
    state: RwLock<StoreState>,
}

#[derive(Debug)]
struct StoreState {
    records: Vec<MemoryRecord>,
    index: FlatIndex,
}

impl StoreState {
    fn empty(dimension: usize) -> Self {
        Self {
            records: Vec::new(),
            index: FlatIndex::new(dimension),
        }
    }

    fn rollback_to(&mut self, len: usize) {
        self.records.truncate(len);
        self.index.truncate(len);
    }
}

/// Where the index of a freshly loaded store came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexSource {
    Empty,
    Snapshot,
    Rebuilt,
}

impl MemoryStore {
    /// Open the store at `paths`, loading existing artifacts if present.
    pub async fn open(paths: StorePaths, embedder: Arc<dyn Embedder>) -> Result<Arc<Self>> {
        let model = embedder.model().clone();
        let (state, source) = load_state(paths.clone(), model).await?;

        tracing::info!(
            log = %paths.log.display(),
            records = state.records.len(),
            index = ?source,
            model = %embedder.model(),
            "memory store opened"
        );

        Ok(Arc::new(Self {
            embedder,
            paths: Some(paths),
            state: RwLock::new(state),
        }))
    }

    /// Open the store at `paths`, handling a load failure per `policy`.
    ///
    /// Under [`LoadFailurePolicy::StartEmpty`] an unreadable store yields an
    /// empty in-memory store, so the artifacts on disk are never overwritten.
    pub async fn open_with_policy(
        paths: StorePaths,
        embedder: Arc<dyn Embedder>,
        policy: LoadFailurePolicy,
    ) -> Result<Arc<Self>> {
        match Self::open(paths, embedder.clone()).await {
            Ok(store) => Ok(store),
            Err(error) => match policy {
                LoadFailurePolicy::Abort => {
                    tracing::error!(%error, "memory store failed to load, aborting");
                    Err(error)
                }
                LoadFailurePolicy::StartEmpty => {
                    tracing::warn!(
                        %error,
                        "memory store failed to load, continuing with an empty in-memory store"
                    );
                    Ok(Self::in_memory(embedder))
                }
            },
        }
    }

    /// A store without persistent artifacts.
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Arc<Self> {
        let dimension = embedder.model().dimension;
        Arc::new(Self {
            embedder,
            paths: None,
            state: RwLock::new(StoreState::empty(dimension)),
        })
    }

    /// Open the store, run `f` against it, and save on success.
    ///
    /// Artifacts are written back only when `f` returns `Ok`; an error from
    /// `f` is returned as-is and the checkpoint is skipped.
    pub async fn scoped<T, F>(paths: StorePaths, embedder: Arc<dyn Embedder>, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a MemoryStore) -> BoxFuture<'a, Result<T>>,
    {
        let store = Self::open(paths, embedder).await?;
        let value = f(store.as_ref()).await?;
        store.save().await?;
        Ok(value)
    }

    pub fn model(&self) -> &EmbeddingModelInfo {
        self.embedder.model()
    }

    pub fn paths(&self) -> Option<&StorePaths> {
        self.paths.as_ref()
    }

    pub fn is_persistent(&self) -> bool {
        self.paths.is_some()
    }

    /// Fail with [`MemoryError::NotPersistent`] for an in-memory store.
    pub fn require_persistent(&self) -> Result<&StorePaths> {
        self.paths.as_ref().ok_or_else(|| MemoryError::NotPersistent.into())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.records.is_empty()
    }

    /// Clone of all records in insertion order.
    pub async fn records(&self) -> Vec<MemoryRecord> {
        self.state.read().await.records.clone()
    }

    /// Look up a record by id.
    pub async fn get(&self, id: u64) -> Result<MemoryRecord> {
        let state = self.state.read().await;
        state
            .records
            .binary_search_by_key(&id, |record| record.id)
            .map(|position| state.records[position].clone())
            .map_err(|_| MemoryError::NotFound { id }.into())
    }

    /// Embed `text`, append it as a new record and persist the log.
    ///
    /// On any failure the store is left exactly as it was before the call.
    pub async fn insert(&self, text: &str, metadata: Option<Metadata>) -> Result<MemoryRecord> {
        if text.trim().is_empty() {
            return Err(MemoryError::InvalidInput("memory text must not be empty".into()).into());
        }

        let embedding = self.embed(text).await?;

        let mut metadata = metadata.unwrap_or_default();
        metadata
            .entry(TIMESTAMP_KEY.to_string())
            .or_insert_with(|| serde_json::Value::String(chrono::Utc::now().to_rfc3339()));

        let mut state = self.state.write().await;
        let previous_len = state.records.len();
        let id = state.records.last().map_or(1, |record| record.id + 1);
        let record = MemoryRecord {
            id,
            text: text.to_string(),
            metadata,
            embedding,
        };

        state.index.push(&record.embedding);
        state.records.push(record.clone());

        if let Some(paths) = &self.paths {
            let written = write_log(paths, self.model(), &state.records).await;
            if let Err(error) = written {
                state.rollback_to(previous_len);
                tracing::warn!(%error, memory_id = id, "memory insert rolled back");
                return Err(error);
            }
        }

        tracing::debug!(memory_id = id, text_len = text.len(), "memory inserted");
        Ok(record)
    }

    /// The `k` records nearest to `query`, most similar first.
    ///
    /// Returns `min(k, len)` results; ties in distance go to the earlier
    /// record.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<MemorySearchResult>> {
        if query.trim().is_empty() {
            return Err(MemoryError::InvalidInput("query must not be empty".into()).into());
        }
        if k == 0 {
            return Err(MemoryError::InvalidInput("k must be at least 1".into()).into());
        }

        let query_embedding = self.embed(query).await?;

        let state = self.state.read().await;
        let results: Vec<MemorySearchResult> = state
            .index
            .search(&query_embedding, k)
            .into_iter()
            .map(|(position, distance)| MemorySearchResult {
                record: state.records[position].clone(),
                distance,
            })
            .collect();

        tracing::debug!(k, found = results.len(), "memories retrieved");
        Ok(results)
    }

    /// Write both artifacts. A no-op for in-memory stores.
    pub async fn save(&self) -> Result<()> {
        let Some(paths) = &self.paths else {
            tracing::debug!("in-memory store has nothing to save");
            return Ok(());
        };

        // Write lock keeps inserts out while the checkpoint is taken.
        let state = self.state.write().await;
        let log_bytes = persist::encode_log(self.model(), &state.records)
            .map_err(|error| MemoryError::persistence(&paths.log, error))?;
        let snapshot_bytes = state
            .index
            .encode_snapshot(&persist::fingerprint(&log_bytes))
            .map_err(|error| MemoryError::persistence(&paths.snapshot, error))?;

        let log_path = paths.log.clone();
        let snapshot_path = paths.snapshot.clone();
        run_blocking(move || {
            persist::write_atomic(&log_path, &log_bytes)?;
            persist::write_atomic(&snapshot_path, &snapshot_bytes)
        })
        .await?;

        tracing::info!(records = state.records.len(), log = %paths.log.display(), "memory store saved");
        Ok(())
    }

    /// Replace the in-memory state with what is on disk.
    ///
    /// On failure the current state is kept; nothing partially loaded is
    /// ever installed.
    pub async fn load(&self) -> Result<()> {
        let Some(paths) = &self.paths else {
            return Ok(());
        };

        let (loaded, source) = load_state(paths.clone(), self.model().clone()).await?;
        let mut state = self.state.write().await;
        tracing::info!(records = loaded.records.len(), index = ?source, "memory store reloaded");
        *state = loaded;
        Ok(())
    }

    /// Discard the index and rebuild it from the records.
    pub async fn rebuild_index(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let dimension = self.model().dimension;
        let index = FlatIndex::from_rows(dimension, state.records.iter().map(|r| r.embedding.as_slice()))
            .map_err(|position| {
                MemoryError::InvalidInput(format!(
                    "record {} has an embedding of the wrong length",
                    state.records[position].id
                ))
            })?;
        state.index = index;
        tracing::info!(records = state.records.len(), "memory index rebuilt");
        Ok(())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = self.embedder.embed(text).await.map_err(into_embedding_error)?;
        validate_embedding(self.model(), embedding)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("model", self.model())
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

/// Any provider failure surfaces as an embedding failure.
fn into_embedding_error(error: Error) -> Error {
    match error {
        Error::Memory(MemoryError::EmbeddingFailed(_)) => error,
        other => MemoryError::EmbeddingFailed(other.to_string()).into(),
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|error| Error::Other(anyhow::anyhow!("blocking task failed: {error}")))?
}

async fn write_log(paths: &StorePaths, model: &EmbeddingModelInfo, records: &[MemoryRecord]) -> Result<()> {
    let bytes = persist::encode_log(model, records).map_err(|error| MemoryError::persistence(&paths.log, error))?;
    let path = paths.log.clone();
    run_blocking(move || persist::write_atomic(&path, &bytes)).await
}

async fn load_state(paths: StorePaths, model: EmbeddingModelInfo) -> Result<(StoreState, IndexSource)> {
    run_blocking(move || load_state_blocking(&paths, &model)).await
}

fn load_state_blocking(paths: &StorePaths, model: &EmbeddingModelInfo) -> Result<(StoreState, IndexSource)> {
    let Some(log_bytes) = persist::read_optional(&paths.log)? else {
        return Ok((StoreState::empty(model.dimension), IndexSource::Empty));
    };

    let log = persist::decode_log(&paths.log, &log_bytes)?;
    if log.model != *model {
        return Err(MemoryError::IncompatibleModel {
            stored: log.model.to_string(),
            active: model.to_string(),
        }
        .into());
    }

    let mut previous_id = 0;
    for record in &log.records {
        if record.id <= previous_id {
            return Err(MemoryError::corrupt(
                &paths.log,
                format!("record id {} is not greater than {previous_id}", record.id),
            )
            .into());
        }
        if record.embedding.len() != model.dimension {
            return Err(MemoryError::corrupt(
                &paths.log,
                format!(
                    "record {} has {} dimensions, expected {}",
                    record.id,
                    record.embedding.len(),
                    model.dimension
                ),
            )
            .into());
        }
        previous_id = record.id;
    }

    let records = log.records;
    if let Some(index) = load_snapshot(paths, model, &log_bytes, records.len()) {
        return Ok((StoreState { records, index }, IndexSource::Snapshot));
    }

    let index = FlatIndex::from_rows(model.dimension, records.iter().map(|r| r.embedding.as_slice()))
        .map_err(|position| MemoryError::corrupt(&paths.log, format!("record at position {position} has the wrong length")))?;
    Ok((StoreState { records, index }, IndexSource::Rebuilt))
}

/// The snapshot, if it exists and was built from exactly these log bytes.
fn load_snapshot(
    paths: &StorePaths,
    model: &EmbeddingModelInfo,
    log_bytes: &[u8],
    record_count: usize,
) -> Option<FlatIndex> {
    let bytes = match persist::read_optional(&paths.snapshot) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            tracing::debug!(snapshot = %paths.snapshot.display(), "no index snapshot, rebuilding from log");
            return None;
        }
        Err(error) => {
            tracing::warn!(%error, "index snapshot unreadable, rebuilding from log");
            return None;
        }
    };

    match FlatIndex::decode_snapshot(&bytes) {
        Ok((fingerprint, index))
            if fingerprint == persist::fingerprint(log_bytes)
                && index.dimension() == model.dimension
                && index.len() == record_count =>
        {
            Some(index)
        }
        Ok((fingerprint, _)) => {
            tracing::warn!(
                snapshot_fingerprint = %hex::encode(fingerprint),
                "index snapshot is stale, rebuilding from log"
            );
            None
        }
        Err(reason) => {
            tracing::warn!(%reason, "index snapshot is corrupt, rebuilding from log");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::embedding::HashingEmbedder;
    use futures::FutureExt as _;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyEmbedder {
        inner: HashingEmbedder,
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Embedder for FlakyEmbedder {
        fn model(&self) -> &EmbeddingModelInfo {
            self.inner.model()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("provider offline").into());
            }
            self.inner.embed(text).await
        }
    }

    struct ShortEmbedder {
        model: EmbeddingModelInfo,
    }

    #[async_trait::async_trait]
    impl Embedder for ShortEmbedder {
        fn model(&self) -> &EmbeddingModelInfo {
            &self.model
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0])
        }
    }

    fn hashing() -> Arc<dyn Embedder> {
        Arc::new(HashingEmbedder::new(64))
    }

    #[tokio::test]
    async fn ids_increase_from_one() {
        let store = MemoryStore::in_memory(hashing());
        let first = store.insert("first", None).await.expect("insert");
        let second = store.insert("second", None).await.expect("insert");
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert!(first.timestamp().is_some());
    }

    #[tokio::test]
    async fn caller_timestamp_is_kept() {
        let store = MemoryStore::in_memory(hashing());
        let mut metadata = Metadata::new();
        metadata.insert(TIMESTAMP_KEY.into(), serde_json::json!("2024-01-01T00:00:00+00:00"));
        let record = store.insert("dated", Some(metadata)).await.expect("insert");
        assert_eq!(record.metadata[TIMESTAMP_KEY], "2024-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn rejects_empty_text_and_zero_k() {
        let store = MemoryStore::in_memory(hashing());
        let error = store.insert("   ", None).await.expect_err("empty text");
        assert!(matches!(error.as_memory(), Some(MemoryError::InvalidInput(_))));

        let error = store.retrieve("query", 0).await.expect_err("zero k");
        assert!(matches!(error.as_memory(), Some(MemoryError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn retrieve_on_empty_store_is_empty() {
        let store = MemoryStore::in_memory(hashing());
        assert!(store.retrieve("anything", 3).await.expect("retrieve").is_empty());
    }

    #[tokio::test]
    async fn get_unknown_id_is_not_found() {
        let store = MemoryStore::in_memory(hashing());
        store.insert("only", None).await.expect("insert");
        assert_eq!(store.get(1).await.expect("present").text, "only");

        let error = store.get(42).await.expect_err("absent");
        assert!(matches!(error.as_memory(), Some(MemoryError::NotFound { id: 42 })));
    }

    #[tokio::test]
    async fn provider_failure_is_an_embedding_error_and_changes_nothing() {
        let embedder = Arc::new(FlakyEmbedder {
            inner: HashingEmbedder::new(64),
            fail: AtomicBool::new(false),
        });
        let store = MemoryStore::in_memory(embedder.clone());
        store.insert("kept", None).await.expect("insert");

        embedder.fail.store(true, Ordering::SeqCst);
        let error = store.insert("lost", None).await.expect_err("provider is down");
        assert!(matches!(error.as_memory(), Some(MemoryError::EmbeddingFailed(_))));
        assert_eq!(store.len().await, 1);

        embedder.fail.store(false, Ordering::SeqCst);
        let next = store.insert("next", None).await.expect("insert");
        assert_eq!(next.id, 2);
    }

    #[tokio::test]
    async fn malformed_embeddings_are_rejected() {
        let store = MemoryStore::in_memory(Arc::new(ShortEmbedder {
            model: EmbeddingModelInfo::new("short", 4),
        }));
        let error = store.insert("text", None).await.expect_err("wrong dimension");
        assert!(matches!(error.as_memory(), Some(MemoryError::EmbeddingFailed(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn failed_log_write_rolls_back_the_insert() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let paths = StorePaths::new(dir.path(), "agent");
        let store = MemoryStore::open(paths.clone(), hashing()).await.expect("open");
        store.insert("durable", None).await.expect("insert");

        // A directory where the log should be makes the rename fail.
        std::fs::remove_file(&paths.log).expect("remove log");
        std::fs::create_dir(&paths.log).expect("block log path");

        let error = store.insert("orphan", None).await.expect_err("write must fail");
        assert!(matches!(error.as_memory(), Some(MemoryError::PersistenceFailed { .. })));
        assert_eq!(store.len().await, 1);

        let results = store.retrieve("orphan", 5).await.expect("retrieve");
        assert!(results.iter().all(|result| result.record.text != "orphan"));
    }

    #[tokio::test]
    async fn scoped_saves_on_success_only() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let paths = StorePaths::new(dir.path(), "agent");

        let id = MemoryStore::scoped(paths.clone(), hashing(), |store| {
            async move { store.insert("remember me", None).await.map(|record| record.id) }.boxed()
        })
        .await
        .expect("scoped run");
        assert_eq!(id, 1);
        assert!(paths.snapshot.exists());

        let snapshot_before = std::fs::read(&paths.snapshot).expect("snapshot");
        let result: Result<()> = MemoryStore::scoped(paths.clone(), hashing(), |store| {
            async move {
                store.insert("second", None).await?;
                Err::<(), Error>(MemoryError::InvalidInput("abort".into()).into())
            }
            .boxed()
        })
        .await;
        assert!(result.is_err());
        // The insert itself is durable, but no checkpoint was taken.
        assert_eq!(std::fs::read(&paths.snapshot).expect("snapshot"), snapshot_before);
    }

    #[tokio::test]
    async fn rebuild_index_matches_loaded_index() {
        let store = MemoryStore::in_memory(hashing());
        for text in ["alpha beta", "beta gamma", "gamma delta"] {
            store.insert(text, None).await.expect("insert");
        }
        let before = store.retrieve("beta", 3).await.expect("retrieve");
        store.rebuild_index().await.expect("rebuild");
        let after = store.retrieve("beta", 3).await.expect("retrieve");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn load_picks_up_records_written_elsewhere() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let paths = StorePaths::new(dir.path(), "agent");
        let reader = MemoryStore::open(paths.clone(), hashing()).await.expect("open");
        let writer = MemoryStore::open(paths, hashing()).await.expect("open");
        writer.insert("written by another handle", None).await.expect("insert");
        assert!(reader.is_empty().await);

        reader.load().await.expect("reload");
        assert_eq!(reader.records().await, writer.records().await);
        let results = reader.retrieve("another handle", 1).await.expect("retrieve");
        assert_eq!(results[0].record.id, 1);
    }

    #[tokio::test]
    async fn failed_load_keeps_the_current_state() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let paths = StorePaths::new(dir.path(), "agent");
        let store = MemoryStore::open(paths.clone(), hashing()).await.expect("open");
        store.insert("still here", None).await.expect("insert");

        std::fs::write(&paths.log, b"not json").expect("clobber log");
        let error = store.load().await.expect_err("log is corrupt");
        assert!(matches!(error.as_memory(), Some(MemoryError::Corrupt { .. })));

        assert_eq!(store.len().await, 1);
        let results = store.retrieve("still here", 1).await.expect("retrieve");
        assert_eq!(results[0].record.text, "still here");
    }

    #[tokio::test]
    async fn load_failure_policy_decides_between_abort_and_empty() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let paths = StorePaths::new(dir.path(), "agent");
        std::fs::write(&paths.log, b"not json").expect("write log");

        let error = MemoryStore::open_with_policy(paths.clone(), hashing(), LoadFailurePolicy::Abort)
            .await
            .expect_err("abort keeps the error");
        assert!(matches!(error.as_memory(), Some(MemoryError::Corrupt { .. })));

        let store = MemoryStore::open_with_policy(paths.clone(), hashing(), LoadFailurePolicy::StartEmpty)
            .await
            .expect("start empty");
        assert!(!store.is_persistent());
        assert!(store.is_empty().await);

        store.insert("only in memory", None).await.expect("insert");
        store.save().await.expect("save is a no-op");
        assert_eq!(std::fs::read(&paths.log).expect("read log"), b"not json");
    }

    #[tokio::test]
    async fn in_memory_store_is_not_persistent() {
        let store = MemoryStore::in_memory(hashing());
        let error = store.require_persistent().expect_err("no artifacts");
        assert!(matches!(error.as_memory(), Some(MemoryError::NotPersistent)));

        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let paths = StorePaths::new(dir.path(), "agent");
        let store = MemoryStore::open(paths.clone(), hashing()).await.expect("open");
        assert_eq!(store.require_persistent().expect("persistent"), &paths);
    }
}
