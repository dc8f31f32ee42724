/// Durable storage engine: in-memory map + write-ahead log + snapshot.
///
/// Every mutation is appended to a line-framed JSON WAL and force-synced
/// before it is applied to the map and acknowledged. After each mutation the
/// full map is snapshotted to `data.json`; `checkpoint` additionally
/// truncates the WAL. Recovery loads the snapshot and replays the WAL on
/// top, skipping lines that fail to parse (a crash mid-append can leave a
/// torn trailing record).
///
/// # Storage layout
///
/// ```text
/// <data_dir>/
/// ├── data.json   # snapshot: full key → value map
/// └── wal.log     # one JSON entry per line, append-only
/// ```
///
/// # Locking
///
/// One mutex guards the map and both files, held for the entire duration of
/// each operation including the fsync. Within a node, operations are
/// serialised; durability is traded against throughput deliberately.
use crate::error::KvResult;
use crate::types::WalEntry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Snapshot file name inside the data directory.
const SNAPSHOT_FILE: &str = "data.json";

/// Write-ahead log file name inside the data directory.
const WAL_FILE: &str = "wal.log";

/// Probability of a skipped snapshot when fault injection is armed.
const FAULT_PROBABILITY: f64 = 0.01;

/// Durable key-value storage engine.
pub struct KvStore {
    data_dir: PathBuf,
    snapshot_path: PathBuf,
    wal_path: PathBuf,
    debug: bool,
    map: Mutex<HashMap<String, String>>,
}

impl KvStore {
    /// Open (or create) a store rooted at `data_dir` and recover its state.
    ///
    /// Recovery reads the snapshot if present (a corrupt snapshot yields an
    /// empty map), then replays the WAL entry by entry. Unparseable WAL
    /// lines are skipped so a torn trailing record cannot block startup.
    pub fn open(data_dir: impl AsRef<Path>, debug: bool) -> KvResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let snapshot_path = data_dir.join(SNAPSHOT_FILE);
        let wal_path = data_dir.join(WAL_FILE);

        let mut map = load_snapshot(&snapshot_path);
        replay_wal(&wal_path, &mut map)?;

        Ok(Self {
            data_dir,
            snapshot_path,
            wal_path,
            debug,
            map: Mutex::new(map),
        })
    }

    /// The directory this store persists into.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Store a value under a key.
    ///
    /// The WAL record is flushed and fsynced before the map is touched, so
    /// a successful return implies the write is durable. `simulate_failure`
    /// arms the debug-mode snapshot skip (the WAL append is never skipped),
    /// exercising the replay path.
    pub fn set(&self, key: &str, value: &str, simulate_failure: bool) -> KvResult<()> {
        let mut map = self.lock_map();

        self.append_wal(&WalEntry::Set {
            key: key.to_string(),
            value: value.to_string(),
        })?;

        map.insert(key.to_string(), value.to_string());
        self.save_snapshot(&map, simulate_failure)?;
        Ok(())
    }

    /// Read the value for a key, if present.
    pub fn get(&self, key: &str) -> Option<String> {
        self.lock_map().get(key).cloned()
    }

    /// Remove a key.
    ///
    /// Returns `false` without side effects if the key is absent; otherwise
    /// the delete record is made durable before the map is updated.
    pub fn delete(&self, key: &str, simulate_failure: bool) -> KvResult<bool> {
        let mut map = self.lock_map();

        if !map.contains_key(key) {
            return Ok(false);
        }

        self.append_wal(&WalEntry::Delete {
            key: key.to_string(),
        })?;

        map.remove(key);
        self.save_snapshot(&map, simulate_failure)?;
        Ok(true)
    }

    /// Store several pairs, in order, with one snapshot at the end.
    ///
    /// Each WAL record is individually fsynced before the map is touched. A
    /// crash between appends can leave a durable prefix; ordering within
    /// the call is preserved but all-or-nothing is not promised.
    pub fn bulk_set(&self, items: &[(String, String)], simulate_failure: bool) -> KvResult<usize> {
        let mut map = self.lock_map();

        for (key, value) in items {
            self.append_wal(&WalEntry::Set {
                key: key.clone(),
                value: value.clone(),
            })?;
        }

        for (key, value) in items {
            map.insert(key.clone(), value.clone());
        }

        self.save_snapshot(&map, simulate_failure)?;
        Ok(items.len())
    }

    /// Force a snapshot and truncate the WAL.
    ///
    /// The WAL is only removed after the snapshot write has fsynced, so a
    /// crash anywhere in between still recovers the full map.
    pub fn checkpoint(&self) -> KvResult<()> {
        let map = self.lock_map();
        self.save_snapshot(&map, false)?;

        if self.wal_path.exists() {
            fs::remove_file(&self.wal_path)?;
        }
        Ok(())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.lock_map().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.lock_map().is_empty()
    }

    fn lock_map(&self) -> MutexGuard<'_, HashMap<String, String>> {
        // A poisoned lock only means a panicking thread held it; the data
        // is still consistent because every mutation completes under one
        // guard scope.
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one entry to the WAL: write, flush, force-sync.
    fn append_wal(&self, entry: &WalEntry) -> KvResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.wal_path)?;

        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    /// Write the full map to the snapshot file: temp file, flush,
    /// force-sync, atomic rename.
    fn save_snapshot(&self, map: &HashMap<String, String>, simulate_failure: bool) -> KvResult<()> {
        if simulate_failure && self.debug && rand::random::<f64>() < FAULT_PROBABILITY {
            tracing::debug!("debug fault injection: skipping snapshot write");
            return Ok(());
        }
        persist_json(&self.snapshot_path, map)
    }
}

/// Write a JSON document durably: temp file, flush, force-sync, atomic
/// rename. Shared by the snapshot, the clock file and the index files.
pub(crate) fn persist_json<T: serde::Serialize>(path: &Path, value: &T) -> KvResult<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    serde_json::to_writer(&mut file, value)?;
    file.flush()?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Read the snapshot file; a missing or corrupt snapshot yields an empty map.
fn load_snapshot(path: &Path) -> HashMap<String, String> {
    let Ok(bytes) = fs::read(path) else {
        return HashMap::new();
    };
    match serde_json::from_slice(&bytes) {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!("snapshot unreadable, starting from WAL only: {e}");
            HashMap::new()
        }
    }
}

/// Replay the WAL on top of the snapshot, skipping malformed lines.
fn replay_wal(path: &Path, map: &mut HashMap<String, String>) -> KvResult<()> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WalEntry>(&line) {
            Ok(WalEntry::Set { key, value }) => {
                map.insert(key, value);
            }
            Ok(WalEntry::Delete { key }) => {
                map.remove(&key);
            }
            Err(e) => {
                // Torn trailing record from a crash mid-append, or garbage.
                tracing::debug!("skipping unparseable WAL line: {e}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> KvStore {
        KvStore::open(dir.path(), false).unwrap()
    }

    #[test]
    fn test_set_then_get() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.set("k", "v", false).unwrap();
        assert_eq!(store.get("k"), Some("v".to_string()));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.set("k", "v1", false).unwrap();
        store.set("k", "v2", false).unwrap();
        assert_eq!(store.get("k"), Some("v2".to_string()));
    }

    #[test]
    fn test_delete_existing_and_absent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.set("k", "v", false).unwrap();
        assert!(store.delete("k", false).unwrap());
        assert_eq!(store.get("k"), None);

        // Absent key: no side effects, returns false.
        assert!(!store.delete("k", false).unwrap());
        assert!(!store.delete("never-set", false).unwrap());
    }

    #[test]
    fn test_bulk_set_applies_in_order() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let items = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "3".to_string()),
        ];
        assert_eq!(store.bulk_set(&items, false).unwrap(), 3);
        assert_eq!(store.get("a"), Some("3".to_string()));
        assert_eq!(store.get("b"), Some("2".to_string()));
    }

    #[test]
    fn test_restart_recovers_state() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store.set("k1", "v1", false).unwrap();
            store.set("k2", "v2", false).unwrap();
            store.delete("k1", false).unwrap();
        }

        let store = open_store(&dir);
        assert_eq!(store.get("k1"), None);
        assert_eq!(store.get("k2"), Some("v2".to_string()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_wal_replay_without_snapshot() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store.set("k", "durable", false).unwrap();
        }

        // A hard kill before the snapshot landed: only the WAL survives.
        fs::remove_file(dir.path().join(SNAPSHOT_FILE)).unwrap();

        let store = open_store(&dir);
        assert_eq!(store.get("k"), Some("durable".to_string()));
    }

    #[test]
    fn test_replay_skips_torn_trailing_record() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store.set("k1", "v1", false).unwrap();
        }

        // Simulate a crash mid-append: a valid line followed by a torn one.
        let wal = dir.path().join(WAL_FILE);
        let mut file = OpenOptions::new().append(true).open(&wal).unwrap();
        writeln!(file, r#"{{"op":"set","key":"k2","value":"v2"}}"#).unwrap();
        write!(file, r#"{{"op":"set","key":"k3","val"#).unwrap();
        drop(file);
        fs::remove_file(dir.path().join(SNAPSHOT_FILE)).unwrap();

        let store = open_store(&dir);
        assert_eq!(store.get("k1"), Some("v1".to_string()));
        assert_eq!(store.get("k2"), Some("v2".to_string()));
        assert_eq!(store.get("k3"), None);
    }

    #[test]
    fn test_corrupt_snapshot_falls_back_to_wal() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store.set("k", "v", false).unwrap();
        }

        fs::write(dir.path().join(SNAPSHOT_FILE), b"not json").unwrap();

        let store = open_store(&dir);
        assert_eq!(store.get("k"), Some("v".to_string()));
    }

    #[test]
    fn test_checkpoint_truncates_wal() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.set("k", "v", false).unwrap();
        assert!(dir.path().join(WAL_FILE).exists());

        store.checkpoint().unwrap();
        assert!(!dir.path().join(WAL_FILE).exists());

        // Snapshot alone carries the state.
        drop(store);
        let store = open_store(&dir);
        assert_eq!(store.get("k"), Some("v".to_string()));
    }

    #[test]
    fn test_wal_is_durable_before_ack() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.set("k", "v", false).unwrap();

        let wal = fs::read_to_string(dir.path().join(WAL_FILE)).unwrap();
        let entry: WalEntry = serde_json::from_str(wal.lines().next().unwrap()).unwrap();
        assert_eq!(
            entry,
            WalEntry::Set {
                key: "k".to_string(),
                value: "v".to_string()
            }
        );
    }
}
