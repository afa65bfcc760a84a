//! Document store collaborator: keyed JSON documents grouped in collections.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub type Document = JsonMap<String, JsonValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set {
        id: String,
        document: Document,
        merge: bool,
    },
    Delete {
        id: String,
    },
}

impl WriteOp {
    pub fn id(&self) -> &str {
        match self {
            WriteOp::Set { id, .. } | WriteOp::Delete { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub data: Document,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected for {id}: {reason}")]
    Rejected { id: String, reason: String },
    #[error("store i/o failure at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stored document {id} is not valid json: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    /// A filesystem batch stopped partway; `committed` ops are applied, the rest are not.
    #[error("batch stopped at {failed_id} after applying {} of {total} ops: {source}", .committed.len())]
    PartialCommit {
        committed: Vec<String>,
        total: usize,
        failed_id: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Connectivity failures abort a whole run; everything else is scoped to one write.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    async fn set(
        &self,
        collection: &str,
        id: &str,
        document: Document,
        merge: bool,
    ) -> Result<(), StoreError>;

    /// Applies every op or none of them. [`FsDocumentStore`] is atomic per document only: a
    /// failure after staging reports the applied prefix as [`StoreError::PartialCommit`].
    async fn batch_commit(&self, collection: &str, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    fn stream_all<'a>(
        &'a self,
        collection: &'a str,
    ) -> BoxStream<'a, Result<StoredDocument, StoreError>>;
}

/// Recursive field merge: nested objects merge, every other value replaces.
pub fn merge_documents(target: &mut Document, patch: Document) {
    for (key, value) in patch {
        match (target.get_mut(&key), value) {
            (Some(JsonValue::Object(existing)), JsonValue::Object(incoming)) => {
                merge_documents(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

fn apply_set(slot: Option<Document>, document: Document, merge: bool) -> Document {
    match (slot, merge) {
        (Some(mut existing), true) => {
            merge_documents(&mut existing, document);
            existing
        }
        _ => document,
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: Mutex<BTreeMap<String, BTreeMap<String, Document>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .await
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, collection: &str) -> bool {
        self.len(collection).await == 0
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self
            .collections
            .lock()
            .await
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        document: Document,
        merge: bool,
    ) -> Result<(), StoreError> {
        let mut guard = self.collections.lock().await;
        let docs = guard.entry(collection.to_string()).or_default();
        let next = apply_set(docs.remove(id), document, merge);
        docs.insert(id.to_string(), next);
        Ok(())
    }

    async fn batch_commit(&self, collection: &str, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut guard = self.collections.lock().await;
        let docs = guard.entry(collection.to_string()).or_default();
        for op in ops {
            match op {
                WriteOp::Set {
                    id,
                    document,
                    merge,
                } => {
                    let next = apply_set(docs.remove(&id), document, merge);
                    docs.insert(id, next);
                }
                WriteOp::Delete { id } => {
                    docs.remove(&id);
                }
            }
        }
        Ok(())
    }

    fn stream_all<'a>(
        &'a self,
        collection: &'a str,
    ) -> BoxStream<'a, Result<StoredDocument, StoreError>> {
        stream::once(async move {
            let snapshot = self
                .collections
                .lock()
                .await
                .get(collection)
                .map(|docs| {
                    docs.iter()
                        .map(|(id, data)| {
                            Ok(StoredDocument {
                                id: id.clone(),
                                data: data.clone(),
                            })
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            stream::iter(snapshot)
        })
        .flatten()
        .boxed()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DocumentEnvelope {
    id: String,
    data: Document,
}

/// Filesystem-backed store: one JSON file per document, written by atomic rename.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    /// Opens (creating if needed) the store root. Fails with `Unavailable` when unwritable.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            StoreError::Unavailable(format!("creating store root {}: {e}", root.display()))
        })?;
        let meta = fs::metadata(&root).await.map_err(|e| {
            StoreError::Unavailable(format!("reading store root {}: {e}", root.display()))
        })?;
        if meta.permissions().readonly() {
            return Err(StoreError::Unavailable(format!(
                "store root {} is read-only",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(collection)
    }

    /// Ids are hashed so arbitrary id strings map to safe file names.
    pub fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{}.json", Self::sha256_hex(id.as_bytes())))
    }

    async fn read_document(&self, path: &Path) -> Result<Option<DocumentEnvelope>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    id: path.display().to_string(),
                    source,
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    async fn ensure_collection(&self, collection: &str) -> Result<PathBuf, StoreError> {
        let dir = self.collection_dir(collection);
        fs::create_dir_all(&dir).await.map_err(|source| StoreError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(dir)
    }

    /// Writes the envelope to a temp file beside its final path and returns the temp path.
    async fn stage(&self, final_path: &Path, envelope: &DocumentEnvelope) -> Result<PathBuf, StoreError> {
        let bytes = serde_json::to_vec_pretty(envelope).map_err(|e| StoreError::Rejected {
            id: envelope.id.clone(),
            reason: e.to_string(),
        })?;
        let parent = final_path.parent().unwrap_or(&self.root);
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let io_err = |source| StoreError::Io {
            path: temp_path.display().to_string(),
            source,
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        file.write_all(&bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(temp_path)
    }

    fn stopped_at(
        committed: Vec<String>,
        total: usize,
        failed_id: &str,
        path: &Path,
        source: std::io::Error,
    ) -> StoreError {
        if committed.is_empty() {
            return StoreError::Io {
                path: path.display().to_string(),
                source,
            };
        }
        warn!(applied = committed.len(), total, failed_id, "filesystem batch partially applied");
        StoreError::PartialCommit {
            committed,
            total,
            failed_id: failed_id.to_string(),
            source,
        }
    }

    async fn discard(paths: &[PathBuf]) {
        for path in paths {
            let _ = fs::remove_file(path).await;
        }
    }

    async fn next_envelope(
        &self,
        path: &Path,
        id: &str,
        document: Document,
        merge: bool,
    ) -> Result<DocumentEnvelope, StoreError> {
        let existing = if merge {
            self.read_document(path).await?.map(|env| env.data)
        } else {
            None
        };
        Ok(DocumentEnvelope {
            id: id.to_string(),
            data: apply_set(existing, document, merge),
        })
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let path = self.document_path(collection, id);
        Ok(self.read_document(&path).await?.map(|env| env.data))
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        document: Document,
        merge: bool,
    ) -> Result<(), StoreError> {
        self.batch_commit(
            collection,
            vec![WriteOp::Set {
                id: id.to_string(),
                document,
                merge,
            }],
        )
        .await
    }

    async fn batch_commit(&self, collection: &str, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        self.ensure_collection(collection).await?;

        // Stage every write first so a staging failure leaves the collection untouched.
        let total = ops.len();
        let mut staged: Vec<(String, PathBuf, PathBuf)> = Vec::new();
        let mut deletes: Vec<(String, PathBuf)> = Vec::new();
        for op in ops {
            let final_path = self.document_path(collection, op.id());
            let result = match op {
                WriteOp::Set {
                    id,
                    document,
                    merge,
                } => match self.next_envelope(&final_path, &id, document, merge).await {
                    Ok(envelope) => self
                        .stage(&final_path, &envelope)
                        .await
                        .map(|temp| staged.push((id, temp, final_path))),
                    Err(err) => Err(err),
                },
                WriteOp::Delete { id } => {
                    deletes.push((id, final_path));
                    Ok(())
                }
            };
            if let Err(err) = result {
                let temps = staged.iter().map(|(_, t, _)| t.clone()).collect::<Vec<_>>();
                Self::discard(&temps).await;
                return Err(err);
            }
        }

        let mut committed: Vec<String> = Vec::with_capacity(total);
        for (index, (id, temp, final_path)) in staged.iter().enumerate() {
            if let Err(source) = fs::rename(temp, final_path).await {
                let leftover = staged[index..]
                    .iter()
                    .map(|(_, t, _)| t.clone())
                    .collect::<Vec<_>>();
                Self::discard(&leftover).await;
                return Err(Self::stopped_at(committed, total, id, final_path, source));
            }
            committed.push(id.clone());
        }
        for (id, path) in deletes {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(Self::stopped_at(committed, total, &id, &path, source)),
            }
            committed.push(id);
        }
        Ok(())
    }

    fn stream_all<'a>(
        &'a self,
        collection: &'a str,
    ) -> BoxStream<'a, Result<StoredDocument, StoreError>> {
        stream::once(async move {
            let dir = self.collection_dir(collection);
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return stream::iter(Vec::new());
                }
                Err(source) => {
                    return stream::iter(vec![Err(StoreError::Io {
                        path: dir.display().to_string(),
                        source,
                    })]);
                }
            };

            let mut paths = Vec::new();
            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        let path = entry.path();
                        let is_doc = path.extension().is_some_and(|ext| ext == "json")
                            && !entry.file_name().to_string_lossy().starts_with('.');
                        if is_doc {
                            paths.push(path);
                        }
                    }
                    Ok(None) => break,
                    Err(source) => {
                        return stream::iter(vec![Err(StoreError::Io {
                            path: dir.display().to_string(),
                            source,
                        })]);
                    }
                }
            }
            paths.sort();

            let mut docs = Vec::with_capacity(paths.len());
            for path in paths {
                match self.read_document(&path).await {
                    Ok(Some(env)) => docs.push(Ok(StoredDocument {
                        id: env.id,
                        data: env.data,
                    })),
                    Ok(None) => {}
                    Err(err) => docs.push(Err(err)),
                }
            }
            stream::iter(docs)
        })
        .flatten()
        .boxed()
    }
}
