//! In-process BM25 keyword index.
//!
//! Whole documents are stored as three parallel arrays (raw text,
//! lowercased tokens, metadata) with Okapi BM25 statistics rebuilt on
//! every mutation. The arrays are persisted as a single bincode snapshot
//! guarded by an inter-process advisory file lock: shared for reads,
//! exclusive for writes, both acquired non-blocking with retry under a
//! deadline. The snapshot path must live on a local filesystem — the
//! lock coordinates processes on one machine only.
//!
//! Tokenization is lowercase whitespace splitting with no stemming and
//! no stop-word removal; recall on morphology is traded for zero
//! language dependence.

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

use crate::document::DocumentMeta;
use crate::error::{AppError, AppResult};
use crate::vector::SearchFilter;

const LOCK_DEADLINE: Duration = Duration::from_secs(30);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Lowercase whitespace tokenization shared by indexing and querying.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|token| token.to_lowercase())
        .collect()
}

/// The persisted portion: three equal-length parallel arrays.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Bm25Snapshot {
    raw_texts: Vec<String>,
    tokenized: Vec<Vec<String>>,
    metadatas: Vec<DocumentMeta>,
}

/// Derived scoring state, rebuilt from the snapshot on every mutation or
/// reload.
#[derive(Debug, Default)]
struct Bm25Stats {
    doc_freqs: HashMap<String, usize>,
    term_freqs: Vec<HashMap<String, u32>>,
    doc_lens: Vec<usize>,
    avg_doc_len: f64,
}

impl Bm25Stats {
    fn rebuild(snapshot: &Bm25Snapshot) -> Self {
        let mut doc_freqs: HashMap<String, usize> = HashMap::new();
        let mut term_freqs: Vec<HashMap<String, u32>> = Vec::with_capacity(snapshot.tokenized.len());
        let mut doc_lens: Vec<usize> = Vec::with_capacity(snapshot.tokenized.len());

        for tokens in &snapshot.tokenized {
            doc_lens.push(tokens.len());
            let mut freqs: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *freqs.entry(token.clone()).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *doc_freqs.entry(term.clone()).or_insert(0) += 1;
            }
            term_freqs.push(freqs);
        }

        let avg_doc_len = if doc_lens.is_empty() {
            0.0
        } else {
            doc_lens.iter().sum::<usize>() as f64 / doc_lens.len() as f64
        };

        Self {
            doc_freqs,
            term_freqs,
            doc_lens,
            avg_doc_len,
        }
    }
}

struct Bm25State {
    snapshot: Bm25Snapshot,
    stats: Bm25Stats,
    /// Modification time of the snapshot file when it was last loaded;
    /// used to detect writes from other processes.
    loaded_mtime: Option<SystemTime>,
}

/// One keyword search result.
#[derive(Debug, Clone)]
pub struct Bm25Hit {
    pub score: f64,
    pub text: String,
    pub meta: DocumentMeta,
}

/// Okapi BM25 engine over full documents.
///
/// All methods are synchronous; async callers run them on the blocking
/// pool since lock acquisition and snapshot IO touch the disk.
pub struct Bm25Engine {
    state: RwLock<Bm25State>,
    path: PathBuf,
    lock_path: PathBuf,
    k1: f64,
    b: f64,
    lock_deadline: Duration,
    lock_retry: Duration,
}

#[derive(Clone, Copy)]
enum LockKind {
    Shared,
    Exclusive,
}

impl Bm25Engine {
    /// Open an engine over the snapshot at `path`. A missing or corrupt
    /// snapshot starts the engine empty; it never fails construction.
    pub fn open(path: impl Into<PathBuf>, k1: f32, b: f32) -> Self {
        let path: PathBuf = path.into();
        let lock_path = lock_path_for(&path);
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("could not create bm25 index directory: {}", e);
            }
        }

        let engine = Self {
            state: RwLock::new(Bm25State {
                snapshot: Bm25Snapshot::default(),
                stats: Bm25Stats::default(),
                loaded_mtime: None,
            }),
            path,
            lock_path,
            k1: k1 as f64,
            b: b as f64,
            lock_deadline: LOCK_DEADLINE,
            lock_retry: LOCK_RETRY_INTERVAL,
        };

        match engine.with_lock(LockKind::Shared, |e| e.load_snapshot()) {
            Ok(count) => {
                if count > 0 {
                    info!("bm25 index loaded: {} documents", count);
                }
            }
            Err(e) => warn!("bm25 index unavailable at startup, starting empty: {}", e),
        }
        engine
    }

    /// Append a document, rebuild scoring stats, and persist under the
    /// exclusive lock. The snapshot on disk is re-read first so appends
    /// from other processes are preserved.
    pub fn index_document(&self, text: &str, meta: DocumentMeta) -> AppResult<()> {
        self.with_lock(LockKind::Exclusive, |engine| {
            engine.reload_if_stale()?;

            let tokens = tokenize(text);
            {
                let mut state = engine.state.write();
                state.snapshot.raw_texts.push(text.to_string());
                state.snapshot.tokenized.push(tokens);
                state.snapshot.metadatas.push(meta);
                state.stats = Bm25Stats::rebuild(&state.snapshot);
            }
            engine.persist_snapshot()
        })?;
        debug!("bm25 index now holds {} documents", self.count_in_memory());
        Ok(())
    }

    /// Score all documents against the query tokens, filter by metadata
    /// equality, and return the top `limit` by descending score. The
    /// on-disk snapshot is reloaded first if another process has written
    /// a newer one.
    pub fn search(
        &self,
        query_tokens: &[String],
        limit: usize,
        filter: &SearchFilter,
    ) -> AppResult<Vec<Bm25Hit>> {
        self.with_lock(LockKind::Shared, |engine| engine.reload_if_stale())?;

        if query_tokens.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let state = self.state.read();
        let doc_count = state.snapshot.raw_texts.len();
        if doc_count == 0 {
            return Ok(vec![]);
        }

        let mut scored: Vec<(usize, f64)> = (0..doc_count)
            .into_par_iter()
            .filter(|&i| filter.matches_meta(&state.snapshot.metadatas[i]))
            .filter_map(|i| {
                let score = self.score_doc(&state.stats, doc_count, i, query_tokens);
                (score > 0.0).then_some((i, score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(i, score)| Bm25Hit {
                score,
                text: state.snapshot.raw_texts[i].clone(),
                meta: state.snapshot.metadatas[i].clone(),
            })
            .collect())
    }

    /// Number of indexed documents.
    pub fn count(&self) -> usize {
        // Pick up external writes opportunistically; failure to acquire
        // the lock just reports the in-memory view.
        let _ = self.with_lock(LockKind::Shared, |engine| engine.reload_if_stale());
        self.count_in_memory()
    }

    fn count_in_memory(&self) -> usize {
        self.state.read().snapshot.raw_texts.len()
    }

    /// Shrink the lock deadline so tests can provoke `LockTimeout`
    /// without waiting out the production 30s.
    #[doc(hidden)]
    pub fn set_lock_timing_for_tests(&mut self, deadline: Duration, retry: Duration) {
        self.lock_deadline = deadline;
        self.lock_retry = retry;
    }

    fn score_doc(
        &self,
        stats: &Bm25Stats,
        doc_count: usize,
        doc: usize,
        query_tokens: &[String],
    ) -> f64 {
        let doc_len = stats.doc_lens[doc] as f64;
        if doc_len == 0.0 {
            return 0.0;
        }
        let avg = stats.avg_doc_len.max(1.0);

        let mut score = 0.0;
        for token in query_tokens {
            let Some(&tf) = stats.term_freqs[doc].get(token) else {
                continue;
            };
            let Some(&df) = stats.doc_freqs.get(token) else {
                continue;
            };
            let n = df as f64;
            let idf = ((doc_count as f64 - n + 0.5) / (n + 0.5) + 1.0).ln();
            let tf = tf as f64;
            let saturation =
                (tf * (self.k1 + 1.0)) / (tf + self.k1 * (1.0 - self.b + self.b * doc_len / avg));
            score += idf * saturation;
        }
        score
    }

    // -----------------------------------------------------------------
    // Locking & persistence
    // -----------------------------------------------------------------

    fn with_lock<T>(
        &self,
        kind: LockKind,
        op: impl FnOnce(&Self) -> AppResult<T>,
    ) -> AppResult<T> {
        let lock_file = self.acquire_lock(kind)?;
        let result = op(self);
        let _ = lock_file.unlock();
        result
    }

    fn acquire_lock(&self, kind: LockKind) -> AppResult<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;

        let deadline = Instant::now() + self.lock_deadline;
        loop {
            let attempt = match kind {
                LockKind::Shared => fs2::FileExt::try_lock_shared(&file),
                LockKind::Exclusive => fs2::FileExt::try_lock_exclusive(&file),
            };
            match attempt {
                Ok(()) => return Ok(file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(AppError::LockTimeout(format!(
                            "bm25 {} lock on {} not acquired within {:?}",
                            match kind {
                                LockKind::Shared => "shared",
                                LockKind::Exclusive => "exclusive",
                            },
                            self.lock_path.display(),
                            self.lock_deadline
                        )));
                    }
                    std::thread::sleep(self.lock_retry);
                }
                Err(e) => return Err(AppError::Io(e)),
            }
        }
    }

    /// Load the snapshot from disk, replacing in-memory state. Missing or
    /// corrupt files leave the engine empty. Returns the document count.
    fn load_snapshot(&self) -> AppResult<usize> {
        let (snapshot, mtime) = match std::fs::read(&self.path) {
            Ok(bytes) => {
                let mtime = std::fs::metadata(&self.path)
                    .and_then(|m| m.modified())
                    .ok();
                match bincode::deserialize::<Bm25Snapshot>(&bytes) {
                    Ok(snapshot) => {
                        if snapshot.raw_texts.len() != snapshot.tokenized.len()
                            || snapshot.raw_texts.len() != snapshot.metadatas.len()
                        {
                            warn!("bm25 snapshot arrays disagree in length, starting empty");
                            (Bm25Snapshot::default(), mtime)
                        } else {
                            (snapshot, mtime)
                        }
                    }
                    Err(e) => {
                        warn!("bm25 snapshot corrupt, starting empty: {}", e);
                        (Bm25Snapshot::default(), mtime)
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Bm25Snapshot::default(), None),
            Err(e) => return Err(AppError::Io(e)),
        };

        let mut state = self.state.write();
        state.stats = Bm25Stats::rebuild(&snapshot);
        state.snapshot = snapshot;
        state.loaded_mtime = mtime;
        Ok(state.snapshot.raw_texts.len())
    }

    /// Reload when the file on disk is newer than what we loaded. Caller
    /// must hold the file lock.
    fn reload_if_stale(&self) -> AppResult<()> {
        let disk_mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        let loaded = self.state.read().loaded_mtime;
        match (disk_mtime, loaded) {
            (Some(disk), Some(mem)) if disk <= mem => Ok(()),
            (None, _) => Ok(()),
            _ => self.load_snapshot().map(|_| ()),
        }
    }

    /// Write the snapshot to a sibling temp file and rename it over the
    /// live path, so a concurrent reader observes either the previous or
    /// the new snapshot, never a torn one. Caller must hold the
    /// exclusive lock.
    fn persist_snapshot(&self) -> AppResult<()> {
        let state = self.state.read();
        let bytes = bincode::serialize(&state.snapshot)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("bm25 snapshot encode: {}", e)))?;
        drop(state);

        let tmp_path = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, &self.path)?;

        let mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        self.state.write().loaded_mtime = mtime;
        Ok(())
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "bm25_index.bin".to_string());
    name.push_str(".lock");
    path.with_file_name(name)
}
