//! Record store on shared storage
//!
//! Mutations happen under `flock(LOCK_EX)` on the record file itself, so
//! the lock is shared by every process on every machine that opens the
//! same file. The record is always rewritten in place: replacing it by
//! rename would hand later lockers a different inode.

use kiwi_util::{NodeName, RECORD_FILENAME, record_path};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::{LeaseRecord, StoreError, StoreResult};

/// The lease record of one node
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_node(shared: &Path, node: &NodeName) -> Self {
        Self::open(record_path(shared, node.as_str()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read without locking. Fine for display and optimistic checks, never
    /// enough on its own to justify a write.
    pub fn read(&self) -> StoreResult<LeaseRecord> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| self.map_io(e))?;
        self.decode(&content)
    }

    /// Run `f` while holding the exclusive lock on the record.
    ///
    /// Blocks until the lock is granted. The lock is released when `f`
    /// returns, whatever it returns.
    pub fn with_lock<T, E>(
        &self,
        f: impl FnOnce(&mut LockedRecord<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| self.map_io(e))?;

        let guard = self.lock_exclusive(file)?;
        trace!(path = %self.path.display(), "Record locked");

        let mut locked = LockedRecord {
            store: self,
            file: guard,
        };
        f(&mut locked)
    }

    fn lock_exclusive(&self, mut file: File) -> StoreResult<Flock<File>> {
        loop {
            match Flock::lock(file, FlockArg::LockExclusive) {
                Ok(guard) => return Ok(guard),
                Err((f, Errno::EINTR)) => file = f,
                Err((_, errno)) => {
                    return Err(StoreError::Lock {
                        path: self.path.clone(),
                        reason: errno.to_string(),
                    });
                }
            }
        }
    }

    /// Create the node directory and its idle record. Refuses to touch an
    /// existing record.
    pub fn initialize(&self) -> StoreResult<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => StoreError::AlreadyExists(self.path.clone()),
                _ => StoreError::Io(e),
            })?;
        file.write_all(LeaseRecord::idle().encode().as_bytes())?;
        file.sync_all()?;

        // Clients and daemons run as ordinary users
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o666))?;

        debug!(path = %self.path.display(), "Idle record created");
        Ok(())
    }

    fn decode(&self, content: &str) -> StoreResult<LeaseRecord> {
        content.parse().map_err(|e: crate::RecordFormatError| StoreError::Malformed {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn map_io(&self, e: std::io::Error) -> StoreError {
        match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound(self.path.clone()),
            _ => StoreError::Io(e),
        }
    }
}

/// A record whose exclusive lock is held; unlocked on drop
pub struct LockedRecord<'a> {
    store: &'a RecordStore,
    file: Flock<File>,
}

impl LockedRecord<'_> {
    pub fn read(&mut self) -> StoreResult<LeaseRecord> {
        let file: &mut File = &mut self.file;
        let mut content = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut content)?;
        self.store.decode(&content)
    }

    pub fn write(&mut self, record: &LeaseRecord) -> StoreResult<()> {
        let file: &mut File = &mut self.file;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(record.encode().as_bytes())?;
        file.sync_data()?;

        debug!(path = %self.store.path.display(), record = %record, "Record written");
        Ok(())
    }
}

/// All node records under one shared directory
#[derive(Debug, Clone)]
pub struct NodeDirectory {
    root: PathBuf,
}

impl NodeDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn record(&self, node: &NodeName) -> RecordStore {
        RecordStore::for_node(&self.root, node)
    }

    /// Nodes that have a record, sorted by name
    pub fn nodes(&self) -> StoreResult<Vec<NodeName>> {
        let mut nodes = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || !entry.path().join(RECORD_FILENAME).is_file() {
                continue;
            }
            nodes.push(NodeName::new(entry.file_name().to_string_lossy().into_owned()));
        }
        nodes.sort();
        Ok(nodes)
    }

    /// Every registered node with its record store
    pub fn records(&self) -> StoreResult<Vec<(NodeName, RecordStore)>> {
        Ok(self
            .nodes()?
            .into_iter()
            .map(|node| {
                let store = self.record(&node);
                (node, store)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LeaseState;
    use kiwi_util::Username;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn node_store(dir: &Path) -> RecordStore {
        let store = RecordStore::for_node(dir, &NodeName::new("gpu1"));
        store.initialize().unwrap();
        store
    }

    #[test]
    fn initialize_writes_idle_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = node_store(dir.path());

        assert!(store.exists());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "[idle] 0 0 0");
        assert_eq!(store.read().unwrap(), LeaseRecord::idle());
    }

    #[test]
    fn initialize_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = node_store(dir.path());

        assert!(matches!(store.initialize(), Err(StoreError::AlreadyExists(_))));
    }

    #[test]
    fn missing_record_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::for_node(dir.path(), &NodeName::new("ghost"));

        assert!(matches!(store.read(), Err(StoreError::NotFound(_))));
        let locked: StoreResult<()> = store.with_lock(|_| Ok(()));
        assert!(matches!(locked, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn malformed_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = node_store(dir.path());
        std::fs::write(store.path(), "alice 3 0").unwrap();

        let err = store.read().unwrap_err();
        assert!(err.is_vanished_or_malformed());
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[test]
    fn locked_write_replaces_whole_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = node_store(dir.path());

        let longer = LeaseRecord {
            state: LeaseState::Initializing(Username::new("a-long-user-name")),
            job_id: 12345,
            start: 1_700_000_000.125,
            duration: 86_400,
        };
        store
            .with_lock(|rec| -> StoreResult<()> { rec.write(&longer) })
            .unwrap();
        store
            .with_lock(|rec| -> StoreResult<()> {
                assert_eq!(rec.read()?, longer);
                rec.write(&LeaseRecord::idle())
            })
            .unwrap();

        // No stale tail from the longer record
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "[idle] 0 0 0");
    }

    #[test]
    fn lock_excludes_other_holders() {
        let dir = tempfile::tempdir().unwrap();
        let store = node_store(dir.path());

        let inside = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let inside = inside.clone();
                std::thread::spawn(move || {
                    store
                        .with_lock(|rec| -> StoreResult<()> {
                            assert!(!inside.swap(true, Ordering::SeqCst));
                            let mut record = rec.read()?;
                            std::thread::sleep(Duration::from_millis(5));
                            record.job_id += 1;
                            rec.write(&record)?;
                            inside.store(false, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.read().unwrap().job_id, 8);
    }

    #[test]
    fn lock_is_released_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = node_store(dir.path());

        let failed: StoreResult<()> = store.with_lock(|_| {
            Err(StoreError::Io(std::io::Error::other("boom")))
        });
        assert!(failed.is_err());

        // A second locker would block forever if the first lock leaked
        let record = store
            .with_lock(|rec| -> StoreResult<LeaseRecord> { rec.read() })
            .unwrap();
        assert_eq!(record, LeaseRecord::idle());
    }

    #[test]
    fn directory_lists_registered_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = NodeDirectory::new(dir.path());
        for name in ["gpu2", "gpu1"] {
            nodes.record(&NodeName::new(name)).initialize().unwrap();
        }
        std::fs::create_dir(dir.path().join("not-a-node")).unwrap();
        std::fs::write(dir.path().join("config.toml"), "").unwrap();

        assert_eq!(
            nodes.nodes().unwrap(),
            vec![NodeName::new("gpu1"), NodeName::new("gpu2")]
        );

        let records = nodes.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].1.path(), dir.path().join("gpu2").join(RECORD_FILENAME));
    }
}
