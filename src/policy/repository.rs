//! Backing storage for the policy document.
//!
//! Every backend hands out a version with each load and refuses a save whose
//! expected version is stale, so two writers that raced on the same
//! document cannot silently overwrite each other.

use fs2::FileExt;
use redb::{Database, ReadableTable, TableDefinition};
use ring::digest;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::document::PolicyDocument;
use crate::error::PolicyStoreError;

/// redb table holding the document (key: "document", value: MessagePack bytes).
const DOCUMENT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("policy_document");

/// redb table holding the document version (key: "version").
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("policy_meta");

const DOCUMENT_KEY: &str = "document";
const VERSION_KEY: &str = "version";

/// A document together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedDocument {
    pub version: u64,
    pub document: PolicyDocument,
}

/// Whole-document storage with optimistic concurrency.
pub trait PolicyRepository: Send + Sync {
    fn load(&self) -> Result<VersionedDocument, PolicyStoreError>;

    /// Replace the document if the stored version still equals `expected_version`.
    ///
    /// Returns the new version.
    fn save(&self, document: &PolicyDocument, expected_version: u64)
        -> Result<u64, PolicyStoreError>;
}

fn storage<E: std::fmt::Display>(err: E) -> PolicyStoreError {
    PolicyStoreError::Storage(err.to_string())
}

/// JSON file on disk. The version is derived from the file contents, so
/// edits made by hand between a load and a save are detected too.
pub struct FilePolicyRepository {
    path: PathBuf,
}

impl FilePolicyRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<String>, PolicyStoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage(format!("{}: {}", self.path.display(), e))),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn content_version(contents: Option<&str>) -> u64 {
        match contents {
            None => 0,
            Some(text) => {
                let hash = digest::digest(&digest::SHA256, text.as_bytes());
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&hash.as_ref()[..8]);
                // 0 is reserved for "no file yet"
                u64::from_be_bytes(bytes).max(1)
            }
        }
    }
}

impl PolicyRepository for FilePolicyRepository {
    fn load(&self) -> Result<VersionedDocument, PolicyStoreError> {
        let contents = self.read()?;
        let version = Self::content_version(contents.as_deref());
        let document = match contents {
            Some(text) => PolicyDocument::from_json(&text)?,
            None => PolicyDocument::default(),
        };
        Ok(VersionedDocument { version, document })
    }

    fn save(
        &self,
        document: &PolicyDocument,
        expected_version: u64,
    ) -> Result<u64, PolicyStoreError> {
        let parent = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(storage)?;

        // Held until the new document is in place; other writers block here.
        let lock_path = self.lock_path();
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| storage(format!("{}: {}", lock_path.display(), e)))?;
        FileExt::lock_exclusive(&lock_file)
            .map_err(|e| storage(format!("failed to lock {}: {}", lock_path.display(), e)))?;

        let current = Self::content_version(self.read()?.as_deref());
        if current != expected_version {
            return Err(PolicyStoreError::ConcurrentModification {
                expected: expected_version,
                found: current,
            });
        }

        let json = document.to_json()?;
        let mut temp = tempfile::NamedTempFile::new_in(&parent).map_err(storage)?;
        temp.write_all(json.as_bytes()).map_err(storage)?;
        temp.as_file().sync_all().map_err(storage)?;
        temp.persist(&self.path)
            .map_err(|e| storage(format!("{}: {}", self.path.display(), e)))?;
        drop(lock_file);

        debug!(path = %self.path.display(), "Policy document written");
        Ok(Self::content_version(Some(&json)))
    }
}

/// Document stored in a redb database alongside an explicit version counter.
pub struct RedbPolicyRepository {
    db: Database,
}

impl RedbPolicyRepository {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PolicyStoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(storage)?;
        }

        let db = Database::create(path)
            .map_err(|e| storage(format!("failed to open policy database {:?}: {}", path, e)))?;

        let write_txn = db.begin_write().map_err(storage)?;
        {
            let _ = write_txn.open_table(DOCUMENT_TABLE).map_err(storage)?;
            let _ = write_txn.open_table(META_TABLE).map_err(storage)?;
        }
        write_txn.commit().map_err(storage)?;

        Ok(Self { db })
    }
}

impl PolicyRepository for RedbPolicyRepository {
    fn load(&self) -> Result<VersionedDocument, PolicyStoreError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let documents = read_txn.open_table(DOCUMENT_TABLE).map_err(storage)?;
        let meta = read_txn.open_table(META_TABLE).map_err(storage)?;

        let version = meta
            .get(VERSION_KEY)
            .map_err(storage)?
            .map(|v| v.value())
            .unwrap_or(0);

        let document = match documents.get(DOCUMENT_KEY).map_err(storage)? {
            Some(bytes) => rmp_serde::from_slice(bytes.value())
                .map_err(|e| PolicyStoreError::Malformed(e.to_string()))?,
            None => PolicyDocument::default(),
        };

        Ok(VersionedDocument { version, document })
    }

    fn save(
        &self,
        document: &PolicyDocument,
        expected_version: u64,
    ) -> Result<u64, PolicyStoreError> {
        let bytes = rmp_serde::to_vec_named(document).map_err(storage)?;

        let write_txn = self.db.begin_write().map_err(storage)?;
        let next = {
            let mut meta = write_txn.open_table(META_TABLE).map_err(storage)?;
            let current = meta
                .get(VERSION_KEY)
                .map_err(storage)?
                .map(|v| v.value())
                .unwrap_or(0);
            if current != expected_version {
                return Err(PolicyStoreError::ConcurrentModification {
                    expected: expected_version,
                    found: current,
                });
            }

            let next = current + 1;
            meta.insert(VERSION_KEY, next).map_err(storage)?;

            let mut documents = write_txn.open_table(DOCUMENT_TABLE).map_err(storage)?;
            documents
                .insert(DOCUMENT_KEY, bytes.as_slice())
                .map_err(storage)?;
            next
        };
        write_txn.commit().map_err(storage)?;

        debug!(version = next, "Policy document committed");
        Ok(next)
    }
}

/// In-process repository, mostly for tests and embedding.
#[derive(Default)]
pub struct MemoryPolicyRepository {
    state: Mutex<VersionedDocument>,
}

impl Default for VersionedDocument {
    fn default() -> Self {
        Self {
            version: 0,
            document: PolicyDocument::default(),
        }
    }
}

impl MemoryPolicyRepository {
    pub fn new(document: PolicyDocument) -> Self {
        Self {
            state: Mutex::new(VersionedDocument {
                version: 1,
                document,
            }),
        }
    }
}

impl PolicyRepository for MemoryPolicyRepository {
    fn load(&self) -> Result<VersionedDocument, PolicyStoreError> {
        self.state
            .lock()
            .map(|s| s.clone())
            .map_err(|_| storage("policy lock poisoned"))
    }

    fn save(
        &self,
        document: &PolicyDocument,
        expected_version: u64,
    ) -> Result<u64, PolicyStoreError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| storage("policy lock poisoned"))?;
        if state.version != expected_version {
            return Err(PolicyStoreError::ConcurrentModification {
                expected: expected_version,
                found: state.version,
            });
        }
        state.version += 1;
        state.document = document.clone();
        Ok(state.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::document::tests::SAMPLE;
    use tempfile::{tempdir, TempDir};

    fn sample() -> PolicyDocument {
        PolicyDocument::from_json(SAMPLE).unwrap()
    }

    fn test_redb() -> (RedbPolicyRepository, TempDir) {
        let dir = tempdir().unwrap();
        let repo = RedbPolicyRepository::open(dir.path().join("policy.redb")).unwrap();
        (repo, dir)
    }

    #[test]
    fn test_file_missing_is_empty() {
        let dir = tempdir().unwrap();
        let repo = FilePolicyRepository::new(dir.path().join("policy.json"));
        let loaded = repo.load().unwrap();
        assert_eq!(loaded.version, 0);
        assert!(loaded.document.scopes.is_empty());
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempdir().unwrap();
        let repo = FilePolicyRepository::new(dir.path().join("nested").join("policy.json"));

        let version = repo.save(&sample(), 0).unwrap();
        let loaded = repo.load().unwrap();
        assert_eq!(loaded.version, version);
        assert_eq!(loaded.document, sample());
    }

    #[test]
    fn test_file_detects_external_edit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let repo = FilePolicyRepository::new(&path);
        let version = repo.save(&sample(), 0).unwrap();

        std::fs::write(&path, r#"{ "scopes": [] }"#).unwrap();

        assert!(matches!(
            repo.save(&sample(), version),
            Err(PolicyStoreError::ConcurrentModification { .. })
        ));
    }

    #[test]
    fn test_file_stale_writer_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let first = FilePolicyRepository::new(&path);
        let second = FilePolicyRepository::new(&path);

        let version = first.save(&PolicyDocument::default(), 0).unwrap();
        assert_eq!(second.load().unwrap().version, version);

        first.save(&sample(), version).unwrap();
        assert!(matches!(
            second.save(&PolicyDocument::default(), version),
            Err(PolicyStoreError::ConcurrentModification { .. })
        ));
        assert_eq!(second.load().unwrap().document, sample());

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["policy.json", "policy.json.lock"]);
    }

    #[test]
    fn test_file_racing_writers_one_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("policy.json");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    FilePolicyRepository::new(path)
                        .save(&sample(), 0)
                        .is_ok()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(FilePolicyRepository::new(&path).load().unwrap().document, sample());
    }

    #[test]
    fn test_redb_versions_increase() {
        let (repo, _dir) = test_redb();
        assert_eq!(repo.load().unwrap().version, 0);

        assert_eq!(repo.save(&sample(), 0).unwrap(), 1);
        assert_eq!(repo.save(&PolicyDocument::default(), 1).unwrap(), 2);

        let loaded = repo.load().unwrap();
        assert_eq!(loaded.version, 2);
        assert!(loaded.document.scopes.is_empty());
    }

    #[test]
    fn test_redb_rejects_stale_version() {
        let (repo, _dir) = test_redb();
        repo.save(&sample(), 0).unwrap();

        let result = repo.save(&PolicyDocument::default(), 0);
        assert!(matches!(
            result,
            Err(PolicyStoreError::ConcurrentModification { expected: 0, found: 1 })
        ));
        assert_eq!(repo.load().unwrap().document, sample());
    }

    #[test]
    fn test_redb_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("policy.redb");
        {
            let repo = RedbPolicyRepository::open(&path).unwrap();
            repo.save(&sample(), 0).unwrap();
        }
        let repo = RedbPolicyRepository::open(&path).unwrap();
        let loaded = repo.load().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.document, sample());
    }

    #[test]
    fn test_memory_rejects_stale_version() {
        let repo = MemoryPolicyRepository::new(sample());
        assert_eq!(repo.save(&sample(), 1).unwrap(), 2);
        assert!(repo.save(&sample(), 1).is_err());
    }
}
