//! Durable dedup state for monitor notifications.
//!
//! Layout under the state directory:
//!   seen_events.json      → JSON array of activity id strings
//!   timed_purchase.json   → JSON array of activity id strings
//!   initialized.flag      → presence-only sentinel (content: RFC 3339 timestamp)
//!
//! Reads take the shared lock; every mutation takes the exclusive lock and
//! writes through to disk before returning. A failed write is logged and the
//! in-memory state keeps the mutation.
//!
//! Not safe for multiple processes sharing one state directory.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::DEFAULT_STATE_DIR;

const SEEN_FILE: &str = "seen_events.json";
const TIMED_FILE: &str = "timed_purchase.json";
const INIT_FLAG: &str = "initialized.flag";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to create state directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Default)]
struct State {
    seen: HashSet<String>,
    timed: HashSet<String>,
    initialized: bool,
}

#[derive(Debug)]
pub struct DedupStore {
    seen_path: PathBuf,
    timed_path: PathBuf,
    init_path: PathBuf,
    state: RwLock<State>,
}

impl DedupStore {
    /// Open (creating if needed) the state directory and load both sets.
    /// An empty `dir` means the default `monitor_state`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        let dir = if dir.as_os_str().is_empty() {
            Path::new(DEFAULT_STATE_DIR)
        } else {
            dir
        };
        fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let seen_path = dir.join(SEEN_FILE);
        let timed_path = dir.join(TIMED_FILE);
        let init_path = dir.join(INIT_FLAG);

        let state = State {
            seen: read_set(&seen_path)?,
            timed: read_set(&timed_path)?,
            initialized: init_path.exists(),
        };

        info!(
            dir = %dir.display(),
            seen = state.seen.len(),
            timed = state.timed.len(),
            initialized = state.initialized,
            "loaded monitor state"
        );

        Ok(Self {
            seen_path,
            timed_path,
            init_path,
            state: RwLock::new(state),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    /// Set the bootstrap flag. Idempotent.
    pub fn mark_initialized(&self) {
        let mut state = self.write();
        if state.initialized {
            return;
        }
        let stamp = chrono::Utc::now().to_rfc3339();
        if let Err(e) = fs::write(&self.init_path, stamp) {
            error!(path = %self.init_path.display(), error = %e, "failed to write init flag");
        }
        state.initialized = true;
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.read().seen.contains(id)
    }

    pub fn has_timed(&self, id: &str) -> bool {
        self.read().timed.contains(id)
    }

    pub fn seen_count(&self) -> usize {
        self.read().seen.len()
    }

    pub fn timed_count(&self) -> usize {
        self.read().timed.len()
    }

    pub fn mark_seen(&self, id: &str) {
        let mut state = self.write();
        state.seen.insert(id.to_string());
        self.persist(&state);
    }

    pub fn mark_timed(&self, id: &str) {
        let mut state = self.write();
        state.timed.insert(id.to_string());
        self.persist(&state);
    }

    /// Commit a timed-purchase dispatch: the id lands in both sets at once.
    pub fn mark_timed_purchase(&self, id: &str) {
        self.batch_mark(&[id], &[id]);
    }

    /// Add many ids and persist once. Empty ids are ignored.
    pub fn batch_mark<S: AsRef<str>>(&self, seen_ids: &[S], timed_ids: &[S]) {
        let mut state = self.write();
        for id in seen_ids.iter().map(|id| id.as_ref()).filter(|id| !id.is_empty()) {
            state.seen.insert(id.to_string());
        }
        for id in timed_ids.iter().map(|id| id.as_ref()).filter(|id| !id.is_empty()) {
            state.timed.insert(id.to_string());
        }
        self.persist(&state);
    }

    fn persist(&self, state: &State) {
        if let Err(e) = write_set(&self.seen_path, &state.seen) {
            error!(path = %self.seen_path.display(), error = %e, "failed to persist seen state");
        }
        if let Err(e) = write_set(&self.timed_path, &state.timed) {
            error!(path = %self.timed_path.display(), error = %e, "failed to persist timed state");
        }
        debug!(
            seen = state.seen.len(),
            timed = state.timed.len(),
            "persisted monitor state"
        );
    }
}

fn read_set(path: &Path) -> Result<HashSet<String>, StoreError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let ids: Vec<String> = serde_json::from_slice(&data).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ids.into_iter().collect())
}

/// Sorted, pretty-printed, written via temp file + rename.
fn write_set(path: &Path, ids: &HashSet<String>) -> io::Result<()> {
    let mut sorted: Vec<&String> = ids.iter().collect();
    sorted.sort();
    let json = serde_json::to_vec_pretty(&sorted)?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}
