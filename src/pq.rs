//! Event queue with lazy deletion
//!
//! Uses std::collections::BinaryHeap keyed on (when, priority, seq) with a
//! HashMap of live records. Cancellation only touches the map; stale heap
//! entries are discarded on peek/pop.

use crate::error::{ExecutiveError, Result};
use crate::event::{EventId, EventRecord, Priority, TargetId};
use crate::time::SimTime;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Heap key. Dispatch order is earliest `when`, then highest priority, then
/// lowest insertion sequence.
#[derive(Clone, Debug)]
struct Key {
    when: SimTime,
    priority: Priority,
    seq: u64,
    id: EventId,
}

impl Key {
    fn of(record: &EventRecord) -> Self {
        Self {
            when: record.when,
            priority: record.priority,
            seq: record.seq,
            id: record.id,
        }
    }

    fn dispatch_order(&self, other: &Self) -> Ordering {
        self.when
            .cmp(&other.when)
            .then_with(|| other.priority.total_cmp(&self.priority))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.dispatch_order(other) == Ordering::Equal && self.id == other.id
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap, so the dispatch order is reversed.
impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dispatch_order(other)
            .then_with(|| self.id.cmp(&other.id))
            .reverse()
    }
}

/// Rebuild the heap once stale keys outnumber live ones by this much.
const COMPACT_SLACK: usize = 64;

/// Pending events in dispatch order.
/// The map is the source of truth; the heap may hold stale keys.
#[derive(Default)]
pub struct EventQueue {
    heap: BinaryHeap<Key>,
    live: HashMap<EventId, EventRecord>,
    daemons: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a record. Fails if a record with the same id is already queued.
    pub fn insert(&mut self, record: EventRecord) -> Result<()> {
        if self.live.contains_key(&record.id) {
            return Err(ExecutiveError::DuplicateEventId(record.id));
        }
        if record.is_daemon() {
            self.daemons += 1;
        }
        self.heap.push(Key::of(&record));
        self.live.insert(record.id, record);
        Ok(())
    }

    /// The next record to dispatch, if any.
    pub fn peek_min(&mut self) -> Option<&EventRecord> {
        self.clean_top();
        let k = self.heap.peek()?;
        self.live.get(&k.id)
    }

    /// Remove and return the next record to dispatch.
    pub fn pop_min(&mut self) -> Result<EventRecord> {
        loop {
            let k = self.heap.pop().ok_or(ExecutiveError::EmptyQueue)?;
            if !self.is_current(&k) {
                continue; // stale entry
            }
            if let Some(record) = self.take(k.id) {
                return Ok(record);
            }
        }
    }

    /// Remove a record by id. Missing ids are not an error.
    pub fn remove_by_id(&mut self, id: EventId) -> Option<EventRecord> {
        let record = self.take(id)?;
        self.maybe_compact();
        Some(record)
    }

    /// Remove every record owned by `target`.
    pub fn remove_by_target(&mut self, target: TargetId) -> Vec<EventRecord> {
        self.remove_where(|r| r.target == Some(target))
    }

    /// Remove every record matching `pred`, returned in dispatch order.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<EventRecord>
    where
        F: FnMut(&EventRecord) -> bool,
    {
        let ids: Vec<EventId> = self
            .live
            .values()
            .filter(|r| pred(r))
            .map(|r| r.id)
            .collect();
        let mut removed: Vec<EventRecord> = ids.into_iter().filter_map(|id| self.take(id)).collect();
        removed.sort_by(|a, b| Key::of(a).dispatch_order(&Key::of(b)));
        self.maybe_compact();
        removed
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn get(&self, id: EventId) -> Option<&EventRecord> {
        self.live.get(&id)
    }

    /// Number of queued records, daemons included.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Number of queued records that are not daemons.
    pub fn non_daemon_len(&self) -> usize {
        self.live.len() - self.daemons
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
        self.daemons = 0;
    }

    /// Snapshot of all queued records in dispatch order.
    pub fn iter_ordered(&self) -> Vec<&EventRecord> {
        let mut records: Vec<&EventRecord> = self.live.values().collect();
        records.sort_by(|a, b| Key::of(a).dispatch_order(&Key::of(b)));
        records
    }

    fn take(&mut self, id: EventId) -> Option<EventRecord> {
        let record = self.live.remove(&id)?;
        if record.is_daemon() {
            self.daemons -= 1;
        }
        Some(record)
    }

    fn is_current(&self, k: &Key) -> bool {
        matches!(self.live.get(&k.id), Some(r) if r.seq == k.seq)
    }

    /// Remove stale entries from the top of the heap.
    fn clean_top(&mut self) {
        while let Some(k) = self.heap.peek() {
            if self.is_current(k) {
                break;
            }
            self.heap.pop();
        }
    }

    fn maybe_compact(&mut self) {
        if self.heap.len() <= 2 * self.live.len() + COMPACT_SLACK {
            return;
        }
        self.heap = self.live.values().map(Key::of).collect();
    }
}
