//! Ordered key-value sessions.
//!
//! The storage collaborator is abstracted behind [`Engine`]: an ordered store
//! with atomic batched writes, consistent snapshots, range iteration and
//! range deletion. [`MemoryEngine`] implements it over a persistent
//! `im::OrdMap`, so a snapshot is an O(1) structural clone and a batch is a
//! private copy installed atomically on commit.
//!
//! Three session modes:
//!
//! | mode      | reads see          | writes | commit |
//! |-----------|--------------------|--------|--------|
//! | snapshot  | committed state    | no     | never  |
//! | batch     | batch ∪ committed  | yes    | yes    |
//! | transient | own batch only     | yes    | never  |
//!
//! A batch session holds the engine's writer lock for its whole lifetime:
//! there is at most one writer at a time and later writers block. Transient
//! sessions are scratch space for sort spills and distinct sets; they flush
//! partially when they grow past the configured threshold, which is
//! acceptable only because they can never commit.

use crate::error::{Error, Result};
use im::OrdMap;
use parking_lot::{Condvar, Mutex};
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

type Map = OrdMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Clone, Default)]
pub struct IterOptions {
    /// Inclusive lower bound.
    pub lower: Option<Vec<u8>>,
    /// Exclusive upper bound.
    pub upper: Option<Vec<u8>>,
}

pub trait Session: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;
    fn exists(&self, key: &[u8]) -> Result<bool>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    /// Like `put`, but fails with a unique violation when the key is present.
    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    fn delete_range(&self, lo: &[u8], hi: &[u8]) -> Result<()>;
    fn cursor(&self, opts: IterOptions) -> Result<Cursor>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
}

pub trait Engine: Send + Sync {
    fn snapshot_session(&self) -> Box<dyn Session>;
    /// Blocks until the current writer (if any) commits or rolls back.
    fn batch_session(&self) -> Box<dyn Session>;
    fn transient_session(&self, max_batch_size: usize) -> Box<dyn Session>;
}

#[derive(Default)]
struct EngineShared {
    committed: Mutex<Map>,
    writer_locked: Mutex<bool>,
    writer_released: Condvar,
}

/// Exclusive writer permit. At most one exists per engine; dropping it wakes
/// the next blocked writer.
struct WriterPermit {
    shared: Arc<EngineShared>,
}

impl WriterPermit {
    fn acquire(shared: &Arc<EngineShared>) -> Self {
        let mut locked = shared.writer_locked.lock();
        while *locked {
            shared.writer_released.wait(&mut locked);
        }
        *locked = true;
        Self {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for WriterPermit {
    fn drop(&mut self) {
        *self.shared.writer_locked.lock() = false;
        self.shared.writer_released.notify_one();
    }
}

#[derive(Clone, Default)]
pub struct MemoryEngine {
    shared: Arc<EngineShared>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Engine for MemoryEngine {
    fn snapshot_session(&self) -> Box<dyn Session> {
        let view = self.shared.committed.lock().clone();
        Box::new(SnapshotSession {
            state: Mutex::new(ReadState {
                map: view,
                closed: false,
            }),
        })
    }

    fn batch_session(&self) -> Box<dyn Session> {
        let guard = WriterPermit::acquire(&self.shared);
        let base = self.shared.committed.lock().clone();
        Box::new(BatchSession {
            shared: Arc::clone(&self.shared),
            state: Mutex::new(BatchState {
                map: base,
                writes: 0,
                status: BatchStatus::Open,
                guard: Some(guard),
            }),
        })
    }

    fn transient_session(&self, max_batch_size: usize) -> Box<dyn Session> {
        Box::new(TransientSession {
            state: Mutex::new(TransientState {
                map: Map::new(),
                staged_bytes: 0,
                closed: false,
            }),
            max_batch_size,
        })
    }
}

fn check_key_value(key: &[u8], value: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Validation("cannot store empty key".into()));
    }
    if value.is_empty() {
        return Err(Error::Validation("cannot store empty value".into()));
    }
    Ok(())
}

fn map_get(map: &Map, key: &[u8]) -> Result<Vec<u8>> {
    map.get(key).cloned().ok_or(Error::KeyNotFound)
}

fn map_delete(map: &mut Map, key: &[u8]) -> Result<()> {
    match map.remove(key) {
        Some(_) => Ok(()),
        None => Err(Error::KeyNotFound),
    }
}

fn map_delete_range(map: &mut Map, lo: &[u8], hi: &[u8]) {
    let doomed: Vec<Vec<u8>> = map
        .range::<_, [u8]>((Bound::Included(lo), Bound::Excluded(hi)))
        .map(|(k, _)| k.clone())
        .collect();
    for key in doomed {
        map.remove(&key);
    }
}

// ---------------------------------------------------------------------------
// Snapshot

struct ReadState {
    map: Map,
    closed: bool,
}

struct SnapshotSession {
    state: Mutex<ReadState>,
}

impl SnapshotSession {
    fn view(&self) -> Result<Map> {
        let state = self.state.lock();
        if state.closed {
            return Err(Error::Validation("session already closed".into()));
        }
        Ok(state.map.clone())
    }
}

impl Session for SnapshotSession {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        map_get(&self.view()?, key)
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.view()?.contains_key(key))
    }

    fn put(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn insert(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn delete(&self, _key: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn delete_range(&self, _lo: &[u8], _hi: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn cursor(&self, opts: IterOptions) -> Result<Cursor> {
        Ok(Cursor::new(self.view()?, opts))
    }

    fn commit(&self) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn rollback(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Validation("session already closed".into()));
        }
        state.closed = true;
        state.map = Map::new();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Batch

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchStatus {
    Open,
    Committed,
    Closed,
}

struct BatchState {
    map: Map,
    writes: u64,
    status: BatchStatus,
    guard: Option<WriterPermit>,
}

struct BatchSession {
    shared: Arc<EngineShared>,
    state: Mutex<BatchState>,
}

impl BatchSession {
    fn with_open<T>(&self, f: impl FnOnce(&mut BatchState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        if state.status != BatchStatus::Open {
            return Err(Error::Validation("session already closed".into()));
        }
        f(&mut state)
    }
}

impl Session for BatchSession {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.with_open(|state| map_get(&state.map, key))
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        self.with_open(|state| Ok(state.map.contains_key(key)))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key_value(key, value)?;
        self.with_open(|state| {
            state.map.insert(key.to_vec(), value.to_vec());
            state.writes += 1;
            Ok(())
        })
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key_value(key, value)?;
        self.with_open(|state| {
            if state.map.contains_key(key) {
                return Err(Error::UniqueViolation {
                    constraint: "key".into(),
                    key: key.to_vec(),
                });
            }
            state.map.insert(key.to_vec(), value.to_vec());
            state.writes += 1;
            Ok(())
        })
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.with_open(|state| {
            map_delete(&mut state.map, key)?;
            state.writes += 1;
            Ok(())
        })
    }

    fn delete_range(&self, lo: &[u8], hi: &[u8]) -> Result<()> {
        self.with_open(|state| {
            map_delete_range(&mut state.map, lo, hi);
            state.writes += 1;
            Ok(())
        })
    }

    fn cursor(&self, opts: IterOptions) -> Result<Cursor> {
        self.with_open(|state| Ok(Cursor::new(state.map.clone(), opts)))
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != BatchStatus::Open {
            return Err(Error::Validation("session already closed".into()));
        }
        *self.shared.committed.lock() = state.map.clone();
        state.status = BatchStatus::Committed;
        state.map = Map::new();
        debug!(writes = state.writes, "batch committed");
        state.guard.take();
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != BatchStatus::Open {
            // Rolling back an already-closed batch is a no-op.
            return Ok(());
        }
        state.status = BatchStatus::Closed;
        state.map = Map::new();
        debug!(writes = state.writes, "batch rolled back");
        state.guard.take();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.status {
            BatchStatus::Open => {
                state.status = BatchStatus::Closed;
                state.map = Map::new();
                state.guard.take();
                Ok(())
            }
            BatchStatus::Committed => {
                state.status = BatchStatus::Closed;
                Ok(())
            }
            BatchStatus::Closed => Err(Error::Validation("session already closed".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Transient

struct TransientState {
    map: Map,
    staged_bytes: usize,
    closed: bool,
}

struct TransientSession {
    state: Mutex<TransientState>,
    max_batch_size: usize,
}

impl TransientSession {
    fn with_open<T>(&self, f: impl FnOnce(&mut TransientState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Validation("session already closed".into()));
        }
        f(&mut state)
    }

    fn note_write(&self, state: &mut TransientState, bytes: usize) {
        state.staged_bytes += bytes;
        if state.staged_bytes > self.max_batch_size {
            // Partial flush. The staged writes stay visible to this session
            // only; a transient session can never commit, so the loss of
            // atomicity across the flush boundary is unobservable.
            debug!(staged_bytes = state.staged_bytes, "transient partial flush");
            state.staged_bytes = 0;
        }
    }
}

impl Session for TransientSession {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.with_open(|state| map_get(&state.map, key))
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        self.with_open(|state| Ok(state.map.contains_key(key)))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key_value(key, value)?;
        self.with_open(|state| {
            state.map.insert(key.to_vec(), value.to_vec());
            self.note_write(state, key.len() + value.len());
            Ok(())
        })
    }

    fn insert(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Err(Error::Validation("cannot insert in transient mode".into()))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.with_open(|state| map_delete(&mut state.map, key))
    }

    fn delete_range(&self, lo: &[u8], hi: &[u8]) -> Result<()> {
        self.with_open(|state| {
            map_delete_range(&mut state.map, lo, hi);
            Ok(())
        })
    }

    fn cursor(&self, opts: IterOptions) -> Result<Cursor> {
        self.with_open(|state| Ok(Cursor::new(state.map.clone(), opts)))
    }

    fn commit(&self) -> Result<()> {
        Err(Error::Validation("cannot commit in transient mode".into()))
    }

    fn rollback(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.with_open(|state| {
            state.closed = true;
            state.map = Map::new();
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Cursor

/// Bidirectional cursor over a stable view of the store. The view is pinned
/// at creation: later writes through the owning session are not reflected.
pub struct Cursor {
    map: Map,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl Cursor {
    fn new(map: Map, opts: IterOptions) -> Self {
        Self {
            map,
            lower: opts.lower,
            upper: opts.upper,
            current: None,
        }
    }

    fn in_bounds(&self, key: &[u8]) -> bool {
        if let Some(lower) = &self.lower
            && key < lower.as_slice()
        {
            return false;
        }
        if let Some(upper) = &self.upper
            && key >= upper.as_slice()
        {
            return false;
        }
        true
    }

    fn first_at_least(&self, pivot: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let start: &[u8] = match &self.lower {
            Some(lower) if lower.as_slice() > pivot => lower.as_slice(),
            _ => pivot,
        };
        self.map
            .range::<_, [u8]>((Bound::Included(start), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
            .filter(|(k, _)| self.in_bounds(k))
    }

    fn last_below(&self, pivot: Bound<&[u8]>) -> Option<(Vec<u8>, Vec<u8>)> {
        // The tighter of the pivot and the cursor's upper bound.
        let end: Bound<&[u8]> = match (&pivot, &self.upper) {
            (Bound::Unbounded, Some(upper)) => Bound::Excluded(upper.as_slice()),
            (Bound::Excluded(p), Some(upper)) if upper.as_slice() < *p => {
                Bound::Excluded(upper.as_slice())
            }
            _ => pivot,
        };
        self.map
            .range::<_, [u8]>((Bound::Unbounded, end))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
            .filter(|(k, _)| self.in_bounds(k))
    }

    pub fn seek_first(&mut self) {
        let lower = self.lower.clone().unwrap_or_default();
        self.current = self.first_at_least(&lower);
    }

    pub fn seek_last(&mut self) {
        self.current = match self.upper.clone() {
            Some(upper) => self.last_below(Bound::Excluded(upper.as_slice())),
            None => self.last_below(Bound::Unbounded),
        };
    }

    /// Positions on the first key >= pivot (within bounds).
    pub fn seek(&mut self, pivot: &[u8]) {
        self.current = self.first_at_least(pivot);
    }

    pub fn next(&mut self) {
        self.current = match self.current.take() {
            Some((key, _)) => self
                .map
                .range::<_, [u8]>((Bound::Excluded(key.as_slice()), Bound::Unbounded))
                .next()
                .map(|(k, v)| (k.clone(), v.clone()))
                .filter(|(k, _)| self.in_bounds(k)),
            None => None,
        };
    }

    pub fn prev(&mut self) {
        self.current = match self.current.take() {
            Some((key, _)) => self.last_below(Bound::Excluded(key.as_slice())),
            None => None,
        };
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(k, _)| k.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, v)| v.as_slice())
    }

    pub fn close(&mut self) {
        self.current = None;
        self.map = Map::new();
    }
}
