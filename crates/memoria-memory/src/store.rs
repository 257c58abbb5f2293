//! Durable, authoritative storage for documents, vectors, proposals and
//! snapshots.
//!
//! On disk every record is one JSON file:
//!
//! ```text
//! <root>/manifest.json
//! <root>/documents/<uuid>.json
//! <root>/vectors/<uuid>.json
//! <root>/proposals/<uuid>.json
//! <root>/snapshots/<uuid>.json
//! ```
//!
//! Writes go to a temp file which is fsynced and renamed over the target, so a
//! reader sees either the previous record or the new one.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use memoria_core::{Document, MemoriaError, MemoriaResult, Snapshot, VectorRecord};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// On-disk layout version written to `manifest.json`.
pub const SCHEMA_VERSION: u32 = 1;

/// A record family. Each maps to one directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// [`Document`] records.
    Documents,
    /// [`VectorRecord`] records, keyed by document id.
    Vectors,
    /// Proposal records.
    Proposals,
    /// [`Snapshot`] records.
    Snapshots,
}

impl Namespace {
    /// Every namespace, in layout order.
    pub const ALL: [Namespace; 4] = [
        Namespace::Documents,
        Namespace::Vectors,
        Namespace::Proposals,
        Namespace::Snapshots,
    ];

    /// Directory name under the store root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Namespace::Documents => "documents",
            Namespace::Vectors => "vectors",
            Namespace::Proposals => "proposals",
            Namespace::Snapshots => "snapshots",
        }
    }
}

/// Layout metadata stored at the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreManifest {
    /// Layout version.
    pub schema_version: u32,
    /// When the store was first created.
    pub created_at: DateTime<Utc>,
    /// Last time the manifest was written.
    pub updated_at: DateTime<Utc>,
}

/// Raw key-value storage underneath a [`Store`].
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Atomically write a record, replacing any previous value.
    async fn put(&self, ns: Namespace, id: Uuid, bytes: Vec<u8>) -> MemoriaResult<()>;

    /// Read a record, `None` if absent.
    async fn get(&self, ns: Namespace, id: Uuid) -> MemoriaResult<Option<Vec<u8>>>;

    /// Delete a record. Returns false if it was absent.
    async fn delete(&self, ns: Namespace, id: Uuid) -> MemoriaResult<bool>;

    /// Ids present in a namespace, sorted.
    async fn list(&self, ns: Namespace) -> MemoriaResult<Vec<Uuid>>;

    /// Raw manifest bytes, `None` for a fresh store.
    async fn read_manifest(&self) -> MemoriaResult<Option<Vec<u8>>>;

    /// Replace the manifest.
    async fn write_manifest(&self, bytes: Vec<u8>) -> MemoriaResult<()>;

    /// Root directory, for backends that live on disk.
    fn root(&self) -> Option<&Path> {
        None
    }
}

/// One JSON file per record under a root directory.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Create the directory layout if needed.
    pub async fn open(root: impl Into<PathBuf>) -> MemoriaResult<Self> {
        let root = root.into();
        for ns in Namespace::ALL {
            tokio::fs::create_dir_all(root.join(ns.dir_name()))
                .await
                .map_err(|e| {
                    MemoriaError::PersistenceWrite(format!(
                        "Failed to create {}: {e}",
                        root.join(ns.dir_name()).display()
                    ))
                })?;
        }
        Ok(Self { root })
    }

    fn record_path(&self, ns: Namespace, id: Uuid) -> PathBuf {
        self.root.join(ns.dir_name()).join(format!("{id}.json"))
    }

    /// temp file, fsync, rename, then confirm the length landed
    async fn write_atomic(path: &Path, bytes: &[u8]) -> MemoriaResult<()> {
        let tmp = path.with_extension("json.tmp");
        let write_err =
            |e: std::io::Error| MemoriaError::PersistenceWrite(format!("{}: {e}", path.display()));

        let mut file = tokio::fs::File::create(&tmp).await.map_err(write_err)?;
        file.write_all(bytes).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);
        tokio::fs::rename(&tmp, path).await.map_err(write_err)?;

        let written = tokio::fs::metadata(path).await.map_err(write_err)?.len();
        if written != bytes.len() as u64 {
            return Err(MemoriaError::PersistenceWrite(format!(
                "{}: wrote {written} bytes, expected {}",
                path.display(),
                bytes.len()
            )));
        }
        Ok(())
    }

    async fn read_optional(path: &Path) -> MemoriaResult<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MemoriaError::PersistenceRead(format!(
                "{}: {e}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl KvBackend for FileBackend {
    async fn put(&self, ns: Namespace, id: Uuid, bytes: Vec<u8>) -> MemoriaResult<()> {
        Self::write_atomic(&self.record_path(ns, id), &bytes).await
    }

    async fn get(&self, ns: Namespace, id: Uuid) -> MemoriaResult<Option<Vec<u8>>> {
        Self::read_optional(&self.record_path(ns, id)).await
    }

    async fn delete(&self, ns: Namespace, id: Uuid) -> MemoriaResult<bool> {
        match tokio::fs::remove_file(self.record_path(ns, id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MemoriaError::PersistenceWrite(format!(
                "Failed to delete {} {id}: {e}",
                ns.dir_name()
            ))),
        }
    }

    async fn list(&self, ns: Namespace) -> MemoriaResult<Vec<Uuid>> {
        let dir = self.root.join(ns.dir_name());
        let read_err =
            |e: std::io::Error| MemoriaError::PersistenceRead(format!("{}: {e}", dir.display()));
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(read_err)?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            if let Some(name) = entry.file_name().to_str() {
                // leftover .json.tmp files from an interrupted write are ignored
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn read_manifest(&self) -> MemoriaResult<Option<Vec<u8>>> {
        Self::read_optional(&self.root.join("manifest.json")).await
    }

    async fn write_manifest(&self, bytes: Vec<u8>) -> MemoriaResult<()> {
        Self::write_atomic(&self.root.join("manifest.json"), &bytes).await
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

/// Volatile backend for tests and dry runs.
#[derive(Default)]
pub struct MemoryBackend {
    records: parking_lot::RwLock<HashMap<(Namespace, Uuid), Vec<u8>>>,
    manifest: parking_lot::RwLock<Option<Vec<u8>>>,
}

impl MemoryBackend {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn put(&self, ns: Namespace, id: Uuid, bytes: Vec<u8>) -> MemoriaResult<()> {
        self.records.write().insert((ns, id), bytes);
        Ok(())
    }

    async fn get(&self, ns: Namespace, id: Uuid) -> MemoriaResult<Option<Vec<u8>>> {
        Ok(self.records.read().get(&(ns, id)).cloned())
    }

    async fn delete(&self, ns: Namespace, id: Uuid) -> MemoriaResult<bool> {
        Ok(self.records.write().remove(&(ns, id)).is_some())
    }

    async fn list(&self, ns: Namespace) -> MemoriaResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .records
            .read()
            .keys()
            .filter(|(n, _)| *n == ns)
            .map(|(_, id)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn read_manifest(&self) -> MemoriaResult<Option<Vec<u8>>> {
        Ok(self.manifest.read().clone())
    }

    async fn write_manifest(&self, bytes: Vec<u8>) -> MemoriaResult<()> {
        *self.manifest.write() = Some(bytes);
        Ok(())
    }
}

/// Which documents a retention pass removes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Documents ingested more than this many days ago are expired.
    pub max_age_days: Option<i64>,
    /// Restrict expiry to these source types; empty means all.
    #[serde(default)]
    pub source_types: Vec<String>,
}

impl RetentionPolicy {
    /// Oldest ingestion time kept at `now`, or `None` when the policy has no
    /// age limit. A negative or out-of-range age is a config error.
    pub fn cutoff(&self, now: DateTime<Utc>) -> MemoriaResult<Option<DateTime<Utc>>> {
        let Some(days) = self.max_age_days else {
            return Ok(None);
        };
        if days < 0 {
            return Err(MemoriaError::Config(format!(
                "max_age_days must be non-negative, got {days}"
            )));
        }
        Duration::try_days(days)
            .and_then(|age| now.checked_sub_signed(age))
            .map(Some)
            .ok_or_else(|| MemoriaError::Config(format!("max_age_days {days} is out of range")))
    }

    /// Whether `doc` is expired at `now`. An invalid policy expires nothing.
    pub fn is_expired(&self, doc: &Document, now: DateTime<Utc>) -> bool {
        match self.cutoff(now) {
            Ok(Some(cutoff)) => self.covers(doc) && doc.ingested_at < cutoff,
            _ => false,
        }
    }

    fn covers(&self, doc: &Document) -> bool {
        self.source_types.is_empty() || self.source_types.contains(&doc.source_type)
    }
}

/// Typed handle over a [`KvBackend`].
///
/// Construct once and share behind an `Arc`. Documents are cached in memory;
/// the content-hash table backs per-document compare-and-swap during
/// ingestion.
pub struct Store {
    backend: Arc<dyn KvBackend>,
    documents: RwLock<HashMap<Uuid, Document>>,
    /// content_hash -> id of the document holding (or reserving) it
    hashes: parking_lot::Mutex<HashMap<String, Uuid>>,
}

impl Store {
    /// Open a store, checking the manifest and loading the document cache.
    pub async fn open(backend: Arc<dyn KvBackend>) -> MemoriaResult<Self> {
        let now = Utc::now();
        let manifest = match backend.read_manifest().await? {
            Some(bytes) => {
                let mut manifest: StoreManifest = serde_json::from_slice(&bytes).map_err(|e| {
                    MemoriaError::PersistenceRead(format!("Invalid manifest.json: {e}"))
                })?;
                if manifest.schema_version > SCHEMA_VERSION {
                    return Err(MemoriaError::Config(format!(
                        "Store schema version {} is newer than supported version {SCHEMA_VERSION}",
                        manifest.schema_version
                    )));
                }
                if manifest.schema_version < SCHEMA_VERSION {
                    info!(
                        from = manifest.schema_version,
                        to = SCHEMA_VERSION,
                        "Upgrading store manifest"
                    );
                    manifest.schema_version = SCHEMA_VERSION;
                    manifest.updated_at = now;
                    backend.write_manifest(serde_json::to_vec_pretty(&manifest)?).await?;
                }
                manifest
            }
            None => {
                let manifest = StoreManifest {
                    schema_version: SCHEMA_VERSION,
                    created_at: now,
                    updated_at: now,
                };
                backend.write_manifest(serde_json::to_vec_pretty(&manifest)?).await?;
                manifest
            }
        };

        let mut documents = HashMap::new();
        let mut hashes = HashMap::new();
        for id in backend.list(Namespace::Documents).await? {
            let Some(doc) = read_record::<Document>(backend.as_ref(), Namespace::Documents, id).await?
            else {
                continue;
            };
            if let Some(existing) = hashes.get(&doc.content_hash) {
                warn!(
                    doc_id = %doc.id,
                    existing = %existing,
                    "Duplicate content hash found on load, keeping first"
                );
                continue;
            }
            hashes.insert(doc.content_hash.clone(), doc.id);
            documents.insert(doc.id, doc);
        }

        info!(
            schema_version = manifest.schema_version,
            documents = documents.len(),
            root = ?backend.root(),
            "Store opened"
        );

        Ok(Self {
            backend,
            documents: RwLock::new(documents),
            hashes: parking_lot::Mutex::new(hashes),
        })
    }

    /// Open a file-backed store rooted at `root`.
    pub async fn open_dir(root: impl Into<PathBuf>) -> MemoriaResult<Self> {
        let backend = FileBackend::open(root).await?;
        Self::open(Arc::new(backend)).await
    }

    /// Open an empty volatile store.
    pub async fn in_memory() -> MemoriaResult<Self> {
        Self::open(Arc::new(MemoryBackend::new())).await
    }

    /// Root directory of a file-backed store.
    pub fn root(&self) -> Option<&Path> {
        self.backend.root()
    }

    // --- content hash CAS ---

    /// Claim `hash` for `doc_id`. Fails with `DuplicateContent` if another
    /// document already holds or is inserting it.
    pub fn reserve_hash(&self, hash: &str, doc_id: Uuid) -> MemoriaResult<()> {
        let mut hashes = self.hashes.lock();
        match hashes.get(hash) {
            Some(&existing) if existing != doc_id => Err(MemoriaError::DuplicateContent {
                hash: hash.to_string(),
                existing,
            }),
            _ => {
                hashes.insert(hash.to_string(), doc_id);
                Ok(())
            }
        }
    }

    /// Drop a reservation, if `doc_id` holds it.
    pub fn release_hash(&self, hash: &str, doc_id: Uuid) {
        let mut hashes = self.hashes.lock();
        if hashes.get(hash) == Some(&doc_id) {
            hashes.remove(hash);
        }
    }

    /// Id of the document holding `hash`.
    pub fn lookup_hash(&self, hash: &str) -> Option<Uuid> {
        self.hashes.lock().get(hash).copied()
    }

    // --- documents ---

    /// Persist a document and add it to the cache.
    pub async fn put_document(&self, doc: &Document) -> MemoriaResult<()> {
        self.put_record(Namespace::Documents, doc.id, doc).await?;
        self.documents.write().await.insert(doc.id, doc.clone());
        debug!(doc_id = %doc.id, source_type = %doc.source_type, "Document persisted");
        Ok(())
    }

    /// Cached document by id.
    pub async fn get_document(&self, id: Uuid) -> Option<Document> {
        self.documents.read().await.get(&id).cloned()
    }

    /// Cached documents for a set of ids, in the given order, skipping unknowns.
    pub async fn get_documents(&self, ids: &[Uuid]) -> Vec<Document> {
        let docs = self.documents.read().await;
        ids.iter().filter_map(|id| docs.get(id).cloned()).collect()
    }

    /// All documents, oldest first.
    pub async fn documents(&self) -> Vec<Document> {
        let mut docs: Vec<Document> = self.documents.read().await.values().cloned().collect();
        docs.sort_by(|a, b| a.ingested_at.cmp(&b.ingested_at).then_with(|| a.id.cmp(&b.id)));
        docs
    }

    /// Number of stored documents.
    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Delete a document with its vector and release its hash.
    ///
    /// The vector goes first so no vector outlives its document; if the
    /// document delete then fails, the vector is written back.
    pub async fn delete_document(&self, id: Uuid) -> MemoriaResult<bool> {
        let vector = self.backend.get(Namespace::Vectors, id).await?;
        self.backend.delete(Namespace::Vectors, id).await?;
        let removed = match self.backend.delete(Namespace::Documents, id).await {
            Ok(removed) => removed,
            Err(e) => {
                if let Some(bytes) = vector {
                    if let Err(restore) = self.backend.put(Namespace::Vectors, id, bytes).await {
                        warn!(doc_id = %id, error = %restore, "Failed to restore vector after delete error");
                    }
                }
                return Err(e);
            }
        };
        if let Some(doc) = self.documents.write().await.remove(&id) {
            self.release_hash(&doc.content_hash, id);
        }
        Ok(removed)
    }

    // --- vectors ---

    /// Persist a vector record keyed by its document id.
    pub async fn put_vector(&self, record: &VectorRecord) -> MemoriaResult<()> {
        self.put_record(Namespace::Vectors, record.doc_id, record).await
    }

    /// Vector record for a document.
    pub async fn get_vector(&self, doc_id: Uuid) -> MemoriaResult<Option<VectorRecord>> {
        self.get_record(Namespace::Vectors, doc_id).await
    }

    /// Delete a vector record.
    pub async fn delete_vector(&self, doc_id: Uuid) -> MemoriaResult<bool> {
        self.backend.delete(Namespace::Vectors, doc_id).await
    }

    /// Every vector record that references a live document.
    ///
    /// Orphans (vector without document) are skipped with a warning.
    pub async fn vectors(&self) -> MemoriaResult<Vec<VectorRecord>> {
        let records: Vec<VectorRecord> = self.list_records(Namespace::Vectors).await?;
        let docs = self.documents.read().await;
        Ok(records
            .into_iter()
            .filter(|r| {
                let live = docs.contains_key(&r.doc_id);
                if !live {
                    warn!(doc_id = %r.doc_id, "Vector record without document, skipping");
                }
                live
            })
            .collect())
    }

    // --- snapshots ---

    /// Write a snapshot. Snapshots are immutable: an existing id is refused.
    pub async fn put_snapshot(&self, snapshot: &Snapshot) -> MemoriaResult<()> {
        if self.backend.get(Namespace::Snapshots, snapshot.id).await?.is_some() {
            return Err(MemoriaError::PersistenceWrite(format!(
                "Snapshot {} already exists and cannot be modified",
                snapshot.id
            )));
        }
        self.put_record(Namespace::Snapshots, snapshot.id, snapshot).await
    }

    /// Snapshots of a proposal, oldest first.
    pub async fn snapshots_for(&self, proposal_id: Uuid) -> MemoriaResult<Vec<Snapshot>> {
        let mut snapshots: Vec<Snapshot> = self
            .list_records::<Snapshot>(Namespace::Snapshots)
            .await?
            .into_iter()
            .filter(|s| s.proposal_id == proposal_id)
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }

    /// Delete a proposal's snapshots. Refused while the proposal is still in
    /// flight.
    pub async fn delete_snapshots_for(
        &self,
        proposal_id: Uuid,
        proposal_terminal: bool,
    ) -> MemoriaResult<usize> {
        if !proposal_terminal {
            return Err(MemoriaError::PersistenceWrite(format!(
                "Snapshots of proposal {proposal_id} cannot be deleted while it is not terminal"
            )));
        }
        let mut deleted = 0;
        for snapshot in self.snapshots_for(proposal_id).await? {
            if self.backend.delete(Namespace::Snapshots, snapshot.id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    // --- generic records ---

    /// Serialize and write any record.
    pub async fn put_record<T: Serialize + Sync>(
        &self,
        ns: Namespace,
        id: Uuid,
        value: &T,
    ) -> MemoriaResult<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.backend.put(ns, id, bytes).await
    }

    /// Read and decode a record.
    pub async fn get_record<T: DeserializeOwned>(
        &self,
        ns: Namespace,
        id: Uuid,
    ) -> MemoriaResult<Option<T>> {
        read_record(self.backend.as_ref(), ns, id).await
    }

    /// Read and decode every record in a namespace.
    pub async fn list_records<T: DeserializeOwned>(&self, ns: Namespace) -> MemoriaResult<Vec<T>> {
        let mut out = Vec::new();
        for id in self.backend.list(ns).await? {
            if let Some(value) = read_record(self.backend.as_ref(), ns, id).await? {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// Delete any record.
    pub async fn delete_record(&self, ns: Namespace, id: Uuid) -> MemoriaResult<bool> {
        self.backend.delete(ns, id).await
    }

    /// Documents the policy marks as expired at `now`.
    pub async fn expired(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> MemoriaResult<Vec<Uuid>> {
        let Some(cutoff) = policy.cutoff(now)? else {
            return Ok(Vec::new());
        };
        Ok(self
            .documents
            .read()
            .await
            .values()
            .filter(|d| policy.covers(d) && d.ingested_at < cutoff)
            .map(|d| d.id)
            .collect())
    }
}

async fn read_record<T: DeserializeOwned>(
    backend: &dyn KvBackend,
    ns: Namespace,
    id: Uuid,
) -> MemoriaResult<Option<T>> {
    let Some(bytes) = backend.get(ns, id).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes).map(Some).map_err(|e| {
        MemoriaError::PersistenceRead(format!("Corrupt {} record {id}: {e}", ns.dir_name()))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use memoria_core::{NewDocument, SnapshotPhase};
    use std::collections::BTreeMap;

    fn doc(text: &str) -> Document {
        Document::from_new(NewDocument::new("report", text))
    }

    #[tokio::test]
    async fn test_file_store_layout_and_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open_dir(tmp.path()).await.unwrap();
        for ns in Namespace::ALL {
            assert!(tmp.path().join(ns.dir_name()).is_dir());
        }
        let manifest: StoreManifest =
            serde_json::from_slice(&std::fs::read(tmp.path().join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(manifest.schema_version, SCHEMA_VERSION);
        assert_eq!(store.root(), Some(tmp.path()));
    }

    #[tokio::test]
    async fn test_documents_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let d = doc("copper inventories fall");
        {
            let store = Store::open_dir(tmp.path()).await.unwrap();
            store.put_document(&d).await.unwrap();
            store
                .put_vector(&VectorRecord::new(d.id, vec![1.0, 0.0], "v1"))
                .await
                .unwrap();
        }
        let store = Store::open_dir(tmp.path()).await.unwrap();
        assert_eq!(store.get_document(d.id).await, Some(d.clone()));
        assert_eq!(store.lookup_hash(&d.content_hash), Some(d.id));
        assert_eq!(store.vectors().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_newer_schema_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = StoreManifest {
            schema_version: SCHEMA_VERSION + 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        std::fs::write(
            tmp.path().join("manifest.json"),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();
        let err = Store::open_dir(tmp.path()).await.err().unwrap();
        assert!(matches!(err, MemoriaError::Config(_)));
    }

    #[tokio::test]
    async fn test_reserve_hash_is_exclusive() {
        let store = Store::in_memory().await.unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.reserve_hash("h", a).unwrap();
        store.reserve_hash("h", a).unwrap();
        match store.reserve_hash("h", b) {
            Err(MemoriaError::DuplicateContent { existing, .. }) => assert_eq!(existing, a),
            other => panic!("expected duplicate, got {other:?}"),
        }
        store.release_hash("h", b);
        assert_eq!(store.lookup_hash("h"), Some(a));
        store.release_hash("h", a);
        assert!(store.reserve_hash("h", b).is_ok());
    }

    #[tokio::test]
    async fn test_delete_document_releases_hash_and_vector() {
        let store = Store::in_memory().await.unwrap();
        let d = doc("lumber prices spike");
        store.reserve_hash(&d.content_hash, d.id).unwrap();
        store.put_document(&d).await.unwrap();
        store
            .put_vector(&VectorRecord::new(d.id, vec![0.5], "v1"))
            .await
            .unwrap();

        assert!(store.delete_document(d.id).await.unwrap());
        assert!(store.get_document(d.id).await.is_none());
        assert!(store.get_vector(d.id).await.unwrap().is_none());
        assert!(store.lookup_hash(&d.content_hash).is_none());
    }

    #[tokio::test]
    async fn test_snapshots_are_write_once() {
        let store = Store::in_memory().await.unwrap();
        let proposal = Uuid::new_v4();
        let snap = Snapshot::new(proposal, SnapshotPhase::Pre, BTreeMap::new());
        store.put_snapshot(&snap).await.unwrap();
        assert!(matches!(
            store.put_snapshot(&snap).await,
            Err(MemoriaError::PersistenceWrite(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_deletion_requires_terminal_proposal() {
        let store = Store::in_memory().await.unwrap();
        let proposal = Uuid::new_v4();
        store
            .put_snapshot(&Snapshot::new(proposal, SnapshotPhase::Pre, BTreeMap::new()))
            .await
            .unwrap();
        store
            .put_snapshot(&Snapshot::new(proposal, SnapshotPhase::Post, BTreeMap::new()))
            .await
            .unwrap();

        assert!(store.delete_snapshots_for(proposal, false).await.is_err());
        assert_eq!(store.snapshots_for(proposal).await.unwrap().len(), 2);
        assert_eq!(store.delete_snapshots_for(proposal, true).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_read_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open_dir(tmp.path()).await.unwrap();
        let id = Uuid::new_v4();
        std::fs::write(tmp.path().join("vectors").join(format!("{id}.json")), b"{oops").unwrap();
        assert!(matches!(
            store.get_vector(id).await,
            Err(MemoriaError::PersistenceRead(_))
        ));
    }

    /// Backend whose document deletes always fail.
    #[derive(Default)]
    struct StuckDocuments {
        inner: MemoryBackend,
    }

    #[async_trait]
    impl KvBackend for StuckDocuments {
        async fn put(&self, ns: Namespace, id: Uuid, bytes: Vec<u8>) -> MemoriaResult<()> {
            self.inner.put(ns, id, bytes).await
        }
        async fn get(&self, ns: Namespace, id: Uuid) -> MemoriaResult<Option<Vec<u8>>> {
            self.inner.get(ns, id).await
        }
        async fn delete(&self, ns: Namespace, id: Uuid) -> MemoriaResult<bool> {
            if ns == Namespace::Documents {
                return Err(MemoriaError::PersistenceWrite("disk full".to_string()));
            }
            self.inner.delete(ns, id).await
        }
        async fn list(&self, ns: Namespace) -> MemoriaResult<Vec<Uuid>> {
            self.inner.list(ns).await
        }
        async fn read_manifest(&self) -> MemoriaResult<Option<Vec<u8>>> {
            self.inner.read_manifest().await
        }
        async fn write_manifest(&self, bytes: Vec<u8>) -> MemoriaResult<()> {
            self.inner.write_manifest(bytes).await
        }
    }

    #[tokio::test]
    async fn test_failed_document_delete_keeps_vector() {
        let store = Store::open(Arc::new(StuckDocuments::default())).await.unwrap();
        let d = doc("copper strike");
        store.put_document(&d).await.unwrap();
        store
            .put_vector(&VectorRecord::new(d.id, vec![1.0, 0.0], "test/2"))
            .await
            .unwrap();

        assert!(store.delete_document(d.id).await.is_err());
        assert!(store.get_vector(d.id).await.unwrap().is_some());
        assert!(store.get_document(d.id).await.is_some());
    }

    #[test]
    fn test_retention_rejects_negative_and_huge_ages() {
        let now = Utc::now();
        let mut old = doc("stale report");
        old.ingested_at = now - Duration::days(40);

        for days in [-1, 100_000_000_000, i64::MAX] {
            let policy = RetentionPolicy {
                max_age_days: Some(days),
                source_types: vec![],
            };
            assert!(matches!(policy.cutoff(now), Err(MemoriaError::Config(_))));
            assert!(!policy.is_expired(&old, now));
        }
    }

    #[tokio::test]
    async fn test_expired_surfaces_invalid_policy() {
        let store = Store::in_memory().await.unwrap();
        store.put_document(&doc("stale report")).await.unwrap();
        let policy = RetentionPolicy {
            max_age_days: Some(100_000_000_000),
            source_types: vec![],
        };
        assert!(matches!(
            store.expired(&policy, Utc::now()).await,
            Err(MemoriaError::Config(_))
        ));
    }

    #[test]
    fn test_retention_policy() {
        let now = Utc::now();
        let mut old = doc("stale report");
        old.ingested_at = now - Duration::days(40);
        let fresh = doc("fresh report");

        let policy = RetentionPolicy {
            max_age_days: Some(30),
            source_types: vec![],
        };
        assert!(policy.is_expired(&old, now));
        assert!(!policy.is_expired(&fresh, now));

        let scoped = RetentionPolicy {
            max_age_days: Some(30),
            source_types: vec!["proposal_outcome".into()],
        };
        assert!(!scoped.is_expired(&old, now));
        assert!(!RetentionPolicy::default().is_expired(&old, now));
    }
}
