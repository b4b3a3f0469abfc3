// Key/value backend for the play log.
//
// `KvBackend` is the narrow capability set the store needs from a remote
// key/value service: plain string get/set/delete, ordered-set insert with an
// integer score, range scans by score, and prefix enumeration of keys. All
// ordering, id padding, and tick reconstruction live in `store.rs` and are
// written once against this trait; a new backend only supplies these calls.
//
// Ordered sets follow the usual remote-store rule: members are ordered by
// score, and members with equal scores are ordered by their bytes. Member
// values are strings, so numeric ids only sort correctly within a score when
// they have equal width (see the padding rule in `store.rs`).
//
// `MemoryBackend` keeps everything in one `Mutex`-guarded state. It is the
// default backend of the relay binary and the one the tests run against.
// Every method takes `&self` and the backend is `Send + Sync`, so one
// instance is shared by every play in the process.
//
// Calls are synchronous and are made from the server's single event loop.
// While one call blocks, no play in the process makes progress. An
// implementation that talks to a remote service must bound every call with
// its own timeout and report a miss as `BackendError::Unavailable`; the
// request that triggered it then fails with `RuntimeError` and the loop moves
// on.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::{Bound, RangeBounds};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Ordered-set score.
pub type Score = i64;

/// Direction of an ordered-set scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

#[derive(Debug, Error)]
pub enum BackendError {
    /// The key exists but holds the other kind of value (string vs ordered
    /// set).
    #[error("key {0:?} holds a value of the wrong kind")]
    WrongKind(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Storage operations the play log is built on.
///
/// Every method runs on the relay's event loop and must return promptly,
/// failing with `BackendError::Unavailable` rather than waiting indefinitely.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError>;

    /// Delete a key of either kind. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Insert `member` into the ordered set at `key`, or move it to `score`
    /// if already present.
    fn zadd(&self, key: &str, score: Score, member: &str) -> Result<(), BackendError>;

    /// Members of the ordered set at `key` whose score lies within
    /// `(min, max)`, as `(score, member)` pairs in `order`, at most `limit`
    /// of them. A missing key is an empty set.
    fn zrange_by_score(
        &self,
        key: &str,
        min: Bound<Score>,
        max: Bound<Score>,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<(Score, String)>, BackendError>;

    /// Every key (of either kind) starting with `prefix`.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError>;
}

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, Score>,
    ordered: BTreeSet<(Score, String)>,
}

#[derive(Default)]
struct MemoryState {
    strings: BTreeMap<String, String>,
    sorted: BTreeMap<String, SortedSet>,
}

/// In-process backend.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of keys of both kinds.
    pub fn key_count(&self) -> usize {
        let state = self.lock();
        state.strings.len() + state.sorted.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // Every mutation below completes before it can panic, so a poisoned
        // state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let state = self.lock();
        if state.sorted.contains_key(key) {
            return Err(BackendError::WrongKind(key.to_string()));
        }
        Ok(state.strings.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.sorted.contains_key(key) {
            return Err(BackendError::WrongKind(key.to_string()));
        }
        state.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let mut state = self.lock();
        let had_string = state.strings.remove(key).is_some();
        let had_set = state.sorted.remove(key).is_some();
        Ok(had_string || had_set)
    }

    fn zadd(&self, key: &str, score: Score, member: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.strings.contains_key(key) {
            return Err(BackendError::WrongKind(key.to_string()));
        }
        let set = state.sorted.entry(key.to_string()).or_default();
        if let Some(old) = set.scores.insert(member.to_string(), score) {
            set.ordered.remove(&(old, member.to_string()));
        }
        set.ordered.insert((score, member.to_string()));
        Ok(())
    }

    fn zrange_by_score(
        &self,
        key: &str,
        min: Bound<Score>,
        max: Bound<Score>,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<(Score, String)>, BackendError> {
        let state = self.lock();
        if state.strings.contains_key(key) {
            return Err(BackendError::WrongKind(key.to_string()));
        }
        let Some(set) = state.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let range = (min, max);
        let limit = limit.unwrap_or(usize::MAX);
        let matching = set
            .ordered
            .iter()
            .filter(|(score, _)| range.contains(score));
        let entries = match order {
            Order::Ascending => matching.take(limit).cloned().collect(),
            Order::Descending => matching.rev().take(limit).cloned().collect(),
        };
        Ok(entries)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let state = self.lock();
        let strings = state
            .strings
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix));
        let sorted = state
            .sorted
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix));
        Ok(strings.chain(sorted).cloned().collect())
    }
}
