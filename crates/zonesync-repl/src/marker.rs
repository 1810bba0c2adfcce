//! Ordering and dedup of concurrently applied entries.
//!
//! Appliers finish in any order. The tracker only reports a position as
//! durable once every earlier position has finished, and it refuses to run
//! two operations on the same key at once.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// A position that is safe to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistAction<M> {
    /// Highest position with nothing older still in flight.
    pub marker: M,
    /// Ordinal registered with that position.
    pub ordinal: u64,
    /// Timestamp registered with that position.
    pub timestamp_us: u64,
}

#[derive(Debug, Clone, Copy)]
struct Stamp {
    ordinal: u64,
    timestamp_us: u64,
}

/// Sliding-window tracker turning out-of-order completions into a watermark.
///
/// `K` is the logical key (object or metadata name), `M` the ordered
/// position, `R` the request stashed when a key is busy.
#[derive(Debug)]
pub struct MarkerTracker<K, M, R = ()> {
    window: usize,
    pending: BTreeMap<M, Stamp>,
    finished: BTreeMap<M, Stamp>,
    watermark: Option<(M, Stamp)>,
    last_emitted: Option<M>,
    updates_since_flush: usize,
    key_to_marker: HashMap<K, Option<M>>,
    marker_to_key: HashMap<M, K>,
    need_retry: HashMap<K, R>,
}

impl<K, M, R> MarkerTracker<K, M, R>
where
    K: Eq + Hash + Clone,
    M: Ord + Hash + Clone,
{
    /// Creates a tracker that emits at most one persist action per `window` completions.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            pending: BTreeMap::new(),
            finished: BTreeMap::new(),
            watermark: None,
            last_emitted: None,
            updates_since_flush: 0,
            key_to_marker: HashMap::new(),
            marker_to_key: HashMap::new(),
            need_retry: HashMap::new(),
        }
    }

    /// Registers `pos` as in flight. Returns false if it already is.
    pub fn start(&mut self, pos: M, ordinal: u64, timestamp_us: u64) -> bool {
        if self.pending.contains_key(&pos) {
            return false;
        }
        self.pending.insert(
            pos,
            Stamp {
                ordinal,
                timestamp_us,
            },
        );
        true
    }

    /// Marks `pos` done and releases the key indexed to it.
    ///
    /// Returns a persist action when the watermark moved and either the
    /// window filled up or nothing is left in flight.
    pub fn finish(&mut self, pos: &M) -> Option<PersistAction<M>> {
        let stamp = self.pending.remove(pos)?;
        if let Some(key) = self.marker_to_key.remove(pos) {
            self.key_to_marker.remove(&key);
        }
        self.finished.insert(pos.clone(), stamp);
        self.updates_since_flush += 1;
        self.advance();

        if self.updates_since_flush >= self.window || self.pending.is_empty() {
            self.emit()
        } else {
            None
        }
    }

    /// Emits the watermark if it moved since the last persist action.
    pub fn flush(&mut self) -> Option<PersistAction<M>> {
        self.advance();
        self.emit()
    }

    /// Associates an in-flight `key` with its log position.
    ///
    /// Returns false if the key already has an operation in flight; the
    /// caller should stash the request with [`Self::set_need_retry`].
    pub fn index_key_to_marker(&mut self, key: K, marker: M) -> bool {
        if self.key_to_marker.contains_key(&key) {
            return false;
        }
        self.marker_to_key.insert(marker.clone(), key.clone());
        self.key_to_marker.insert(key, Some(marker));
        true
    }

    /// Marks `key` as in flight without a log position.
    pub fn index_untracked(&mut self, key: K) -> bool {
        if self.key_to_marker.contains_key(&key) {
            return false;
        }
        self.key_to_marker.insert(key, None);
        true
    }

    /// Releases a key without finishing a position.
    pub fn release_key(&mut self, key: &K) {
        if let Some(Some(marker)) = self.key_to_marker.remove(key) {
            self.marker_to_key.remove(&marker);
        }
    }

    /// True if `key` has an operation in flight.
    pub fn is_key_busy(&self, key: &K) -> bool {
        self.key_to_marker.contains_key(key)
    }

    /// Position the key's in-flight operation finishes, if it has one.
    pub fn key_marker(&self, key: &K) -> Option<&M> {
        self.key_to_marker.get(key).and_then(|m| m.as_ref())
    }

    /// Hands a key held by an untracked operation over to `marker`.
    ///
    /// The caller starts `marker` and finishes it once the key's next run
    /// completes, so the watermark stays below it meanwhile. Returns false
    /// if the key is free or already tied to a position.
    pub fn attach_marker(&mut self, key: &K, marker: M) -> bool {
        match self.key_to_marker.get_mut(key) {
            Some(slot) if slot.is_none() => {
                self.marker_to_key.insert(marker.clone(), key.clone());
                *slot = Some(marker);
                true
            }
            _ => false,
        }
    }

    /// Counts `pos` as finished without it ever being in flight.
    ///
    /// Used for entries that are skipped or coalesced into a running
    /// operation. The watermark still cannot pass any older pending position.
    pub fn try_update_high_marker(&mut self, pos: M, ordinal: u64, timestamp_us: u64) {
        if self.pending.contains_key(&pos) {
            return;
        }
        if matches!(&self.watermark, Some((w, _)) if pos <= *w) {
            return;
        }
        self.finished.insert(
            pos,
            Stamp {
                ordinal,
                timestamp_us,
            },
        );
    }

    /// Stashes the newest request for a busy key, replacing older ones.
    pub fn set_need_retry(&mut self, key: K, request: R) {
        self.need_retry.insert(key, request);
    }

    /// Takes the stashed request for `key`, if any.
    pub fn take_need_retry(&mut self, key: &K) -> Option<R> {
        self.need_retry.remove(key)
    }

    /// True if `pos` is in flight.
    pub fn is_pending(&self, pos: &M) -> bool {
        self.pending.contains_key(pos)
    }

    /// Positions still in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Oldest position still in flight.
    pub fn oldest_pending(&self) -> Option<&M> {
        self.pending.keys().next()
    }

    /// Current watermark, persisted or not.
    pub fn watermark(&self) -> Option<&M> {
        self.watermark.as_ref().map(|(m, _)| m)
    }

    fn advance(&mut self) {
        let safe = match self.pending.keys().next() {
            Some(oldest) => self
                .finished
                .range(..oldest.clone())
                .next_back()
                .map(|(m, s)| (m.clone(), *s)),
            None => self
                .finished
                .iter()
                .next_back()
                .map(|(m, s)| (m.clone(), *s)),
        };
        if let Some((marker, stamp)) = safe {
            self.finished.retain(|m, _| *m > marker);
            self.watermark = Some((marker, stamp));
        }
    }

    fn emit(&mut self) -> Option<PersistAction<M>> {
        let (marker, stamp) = self.watermark.as_ref()?;
        if self.last_emitted.as_ref() == Some(marker) {
            return None;
        }
        self.updates_since_flush = 0;
        self.last_emitted = Some(marker.clone());
        Some(PersistAction {
            marker: marker.clone(),
            ordinal: stamp.ordinal,
            timestamp_us: stamp.timestamp_us,
        })
    }
}
