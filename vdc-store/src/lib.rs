//! Embedded versioned key-value store.
//!
//! The store is the single authoritative state of a control-plane region:
//! one writer process, many readers. Every committed batch advances a global
//! revision; compare-and-set on per-key revisions is the only concurrency
//! primitive, and multi-entity invariants are enforced by committing all
//! affected rows in one batch.
//!
//! Durability is an append-only commit log plus periodic snapshot
//! compaction, both under the store directory. A batch is appended (and
//! fsynced) before it is applied in memory, so recovery replays exactly the
//! committed prefix; a torn trailing line is discarded.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Context, Error};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};

use vdc_api_types::api_err;

mod watch;
pub use watch::{WatchEvent, WatchError, Watcher};

const LOG_NAME: &str = "commits.log";
const SNAPSHOT_NAME: &str = "snapshot.json";
const LOCK_NAME: &str = ".store.lck";

/// Batches between snapshot compactions.
const COMPACT_EVERY: u64 = 1024;

/// Watch replay buffer length; watchers further behind must resync.
const TAIL_CAPACITY: usize = 8192;

/// Expected revision of a key in a compare-and-set operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expect {
    /// The key must not exist.
    Absent,
    /// The key must exist at exactly this revision.
    Rev(u64),
    /// No precondition.
    Any,
}

/// One operation of an atomic batch.
#[derive(Clone, Debug)]
pub struct TxOp {
    pub key: String,
    pub expect: Expect,
    /// `Some` writes the value, `None` deletes the key.
    pub value: Option<Value>,
}

impl TxOp {
    pub fn put<T: Serialize>(key: String, expect: Expect, value: &T) -> Result<Self, Error> {
        Ok(Self {
            key,
            expect,
            value: Some(serde_json::to_value(value)?),
        })
    }

    pub fn delete(key: String, expect: Expect) -> Self {
        Self {
            key,
            expect,
            value: None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct LogItem {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct LogBatch {
    rev: u64,
    items: Vec<LogItem>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    revision: u64,
    entries: BTreeMap<String, SnapshotEntry>,
}

#[derive(Clone, Serialize, Deserialize)]
struct SnapshotEntry {
    rev: u64,
    value: Value,
}

struct Persistence {
    dir: PathBuf,
    log: File,
    /// Held for the store lifetime; enforces the single-writer contract.
    _lock: Flock<File>,
    batches_since_compact: u64,
}

struct StoreState {
    revision: u64,
    entries: BTreeMap<String, SnapshotEntry>,
    persistence: Option<Persistence>,
    /// Set once a log append failed; all further writes are refused.
    broken: bool,
    tail: VecDeque<WatchEvent>,
    /// Smallest revision for which `tail` still holds every event.
    oldest_retained: u64,
}

/// Handle to the store; cheap to clone.
#[derive(Clone)]
pub struct Store {
    state: Arc<Mutex<StoreState>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Store {
    /// Open (or initialize) a store directory, replaying snapshot and log.
    pub fn open(dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("unable to create store directory {dir:?}"))?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_NAME))?;
        let lock = Flock::lock(lock_file, FlockArg::LockExclusiveNonblock)
            .map_err(|(_, err)| format_err!("store {dir:?} is locked by another process: {err}"))?;

        let mut revision = 0;
        let mut entries = BTreeMap::new();

        let snapshot_path = dir.join(SNAPSHOT_NAME);
        if snapshot_path.exists() {
            let file = File::open(&snapshot_path)
                .with_context(|| format!("unable to open {snapshot_path:?}"))?;
            let snapshot: Snapshot =
                serde_json::from_reader(BufReader::new(file)).context("corrupt store snapshot")?;
            revision = snapshot.revision;
            entries = snapshot.entries;
        }

        let log_path = dir.join(LOG_NAME);
        let mut replayed = 0u64;
        if log_path.exists() {
            let file =
                File::open(&log_path).with_context(|| format!("unable to open {log_path:?}"))?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                let batch: LogBatch = match serde_json::from_str(&line) {
                    Ok(batch) => batch,
                    Err(_) => {
                        // torn tail write from a crash; everything before it
                        // was fsynced, so stop here
                        warn!("discarding torn trailing commit log entry");
                        break;
                    }
                };
                if batch.rev <= revision {
                    continue; // already covered by the snapshot
                }
                revision = batch.rev;
                for item in batch.items {
                    match item.value {
                        Some(value) => {
                            entries.insert(
                                item.key,
                                SnapshotEntry {
                                    rev: batch.rev,
                                    value,
                                },
                            );
                        }
                        None => {
                            entries.remove(&item.key);
                        }
                    }
                }
                replayed += 1;
            }
        }

        let log = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_path)?;

        info!(
            revision,
            replayed_batches = replayed,
            keys = entries.len(),
            "store opened at {dir:?}"
        );

        let (events, _) = broadcast::channel(TAIL_CAPACITY);
        Ok(Self {
            state: Arc::new(Mutex::new(StoreState {
                revision,
                entries,
                persistence: Some(Persistence {
                    dir: dir.to_owned(),
                    log,
                    _lock: lock,
                    batches_since_compact: replayed,
                }),
                broken: false,
                tail: VecDeque::new(),
                oldest_retained: revision + 1,
            })),
            events,
        })
    }

    /// A purely in-memory store; used by tests and by dry runs.
    pub fn in_memory() -> Self {
        let (events, _) = broadcast::channel(TAIL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(StoreState {
                revision: 0,
                entries: BTreeMap::new(),
                persistence: None,
                broken: false,
                tail: VecDeque::new(),
                oldest_retained: 1,
            })),
            events,
        }
    }

    /// Current global revision.
    pub fn revision(&self) -> u64 {
        self.state.lock().unwrap().revision
    }

    /// True if the commit log is failing; reads still work but are
    /// potentially stale relative to what callers believe they wrote.
    pub fn is_degraded(&self) -> bool {
        self.state.lock().unwrap().broken
    }

    pub fn get(&self, key: &str) -> Option<(Value, u64)> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .get(key)
            .map(|entry| (entry.value.clone(), entry.rev))
    }

    /// Typed read; deserialization failure means a corrupted row and is an
    /// error, not `None`.
    pub fn get_typed<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<(T, u64)>, Error> {
        match self.get(key) {
            None => Ok(None),
            Some((value, rev)) => {
                let typed = serde_json::from_value(value)
                    .with_context(|| format!("corrupt row at {key}"))?;
                Ok(Some((typed, rev)))
            }
        }
    }

    /// All entries below a key prefix, in key order.
    pub fn list(&self, prefix: &str) -> Vec<(String, Value, u64)> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone(), entry.rev))
            .collect()
    }

    pub fn list_typed<T: serde::de::DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<(T, u64)>, Error> {
        self.list(prefix)
            .into_iter()
            .map(|(key, value, rev)| {
                let typed = serde_json::from_value(value)
                    .with_context(|| format!("corrupt row at {key}"))?;
                Ok((typed, rev))
            })
            .collect()
    }

    /// Single-key compare-and-set write.
    pub fn put<T: Serialize>(&self, key: &str, value: &T, expect: Expect) -> Result<u64, Error> {
        self.batch(vec![TxOp::put(key.to_string(), expect, value)?])
    }

    /// Single-key compare-and-set delete.
    pub fn delete(&self, key: &str, expect: Expect) -> Result<u64, Error> {
        self.batch(vec![TxOp::delete(key.to_string(), expect)])
    }

    /// Commit a batch atomically. Either every operation applies at one new
    /// revision, or the batch fails as a whole (`conflict` on the first
    /// precondition violation).
    pub fn batch(&self, ops: Vec<TxOp>) -> Result<u64, Error> {
        if ops.is_empty() {
            bail!("refusing to commit an empty batch");
        }

        let mut state = self.state.lock().unwrap();

        if state.broken {
            return Err(api_err!(
                StorageUnavailable,
                "store commit log is failing, refusing writes"
            ));
        }

        // check all preconditions before touching anything
        for op in &ops {
            let current = state.entries.get(&op.key).map(|entry| entry.rev);
            match (op.expect, current) {
                (Expect::Any, _) => (),
                (Expect::Absent, None) => (),
                (Expect::Absent, Some(_)) => {
                    return Err(api_err!(Conflict, "key {} already exists", op.key));
                }
                (Expect::Rev(_), None) => {
                    return Err(api_err!(NotFound, "key {} does not exist", op.key));
                }
                (Expect::Rev(expected), Some(rev)) if rev != expected => {
                    return Err(api_err!(
                        Conflict,
                        "key {} changed (expected revision {expected}, found {rev})",
                        op.key
                    ));
                }
                (Expect::Rev(_), Some(_)) => (),
            }
        }

        let rev = state.revision + 1;

        let batch = LogBatch {
            rev,
            items: ops
                .iter()
                .map(|op| LogItem {
                    key: op.key.clone(),
                    value: op.value.clone(),
                })
                .collect(),
        };

        if let Some(persistence) = state.persistence.as_mut() {
            if let Err(err) = append_batch(&mut persistence.log, &batch) {
                state.broken = true;
                return Err(api_err!(
                    StorageUnavailable,
                    "store commit log append failed: {err}"
                ));
            }
            persistence.batches_since_compact += 1;
        }

        state.revision = rev;
        let mut events = Vec::with_capacity(ops.len());
        for op in ops {
            match op.value {
                Some(value) => {
                    state.entries.insert(
                        op.key.clone(),
                        SnapshotEntry {
                            rev,
                            value: value.clone(),
                        },
                    );
                    events.push(WatchEvent {
                        key: op.key,
                        value: Some(value),
                        rev,
                    });
                }
                None => {
                    state.entries.remove(&op.key);
                    events.push(WatchEvent {
                        key: op.key,
                        value: None,
                        rev,
                    });
                }
            }
        }

        for event in events {
            state.tail.push_back(event.clone());
            if state.tail.len() > TAIL_CAPACITY {
                if let Some(evicted) = state.tail.pop_front() {
                    state.oldest_retained = evicted.rev + 1;
                }
            }
            let _ = self.events.send(event); // no receivers is fine
        }

        let needs_compact = state
            .persistence
            .as_ref()
            .is_some_and(|p| p.batches_since_compact >= COMPACT_EVERY);
        if needs_compact {
            if let Err(err) = compact(&mut state) {
                // not fatal: the log still has everything
                warn!("store compaction failed: {err:#}");
            }
        }

        Ok(rev)
    }

    /// Watch all keys below `prefix`, starting after revision `from_rev`.
    ///
    /// The returned watcher replays buffered events first and then follows
    /// live commits; it reports [`WatchError::Resync`] when it cannot
    /// guarantee a gap-free stream, in which case the caller re-reads a
    /// snapshot and restarts from its revision.
    pub fn watch(&self, prefix: &str, from_rev: u64) -> Watcher {
        let state = self.state.lock().unwrap();
        watch::watcher_from_tail(
            prefix,
            from_rev,
            &state.tail,
            state.oldest_retained,
            self.events.subscribe(),
        )
    }

    /// Write a snapshot and truncate the commit log.
    pub fn compact(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        compact(&mut state)
    }
}

fn append_batch(log: &mut File, batch: &LogBatch) -> Result<(), Error> {
    let mut line = serde_json::to_vec(batch)?;
    line.push(b'\n');
    log.write_all(&line)?;
    nix::unistd::fsync(log.as_raw_fd())?;
    Ok(())
}

fn compact(state: &mut StoreState) -> Result<(), Error> {
    let Some(persistence) = state.persistence.as_mut() else {
        return Ok(());
    };

    let snapshot = Snapshot {
        revision: state.revision,
        entries: state.entries.clone(),
    };
    let data = serde_json::to_vec(&snapshot)?;
    replace_file(&persistence.dir.join(SNAPSHOT_NAME), &data)?;

    // everything up to `revision` is in the snapshot now
    let log_path = persistence.dir.join(LOG_NAME);
    let log = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&log_path)?;
    nix::unistd::fsync(log.as_raw_fd())?;
    persistence.log = OpenOptions::new().append(true).open(&log_path)?;
    persistence.batches_since_compact = 0;

    info!(revision = state.revision, "store compacted");
    Ok(())
}

/// Atomically replace a file: write a temporary sibling, fsync, rename over.
///
/// The store is single-writer (flock-guarded), so a pid-suffixed temp name
/// is collision free.
fn replace_file(path: &Path, data: &[u8]) -> Result<(), Error> {
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    if let Err(err) = file.write_all(data) {
        let _ = std::fs::remove_file(&tmp_path);
        bail!("write failed: {err}");
    }
    if let Err(err) = nix::unistd::fsync(file.as_raw_fd()) {
        let _ = std::fs::remove_file(&tmp_path);
        bail!("fsync failed: {err}");
    }

    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        bail!("atomic rename failed for file {path:?} - {err}");
    }

    Ok(())
}

#[cfg(test)]
mod tests;
