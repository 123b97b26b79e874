//! Indexed priority event queue.
//!
//! Events are keyed two ways at once: by a monotonically increasing id
//! (for keyed mutation and deletion) and by scheduled time (for ordered
//! extraction).  Instead of a full priority search queue we keep a
//! `HashMap` of event records next to a `BTreeMap` of time buckets;
//! the tree gives both find-min and lookup-by-key in O(log n).
//!
//! Times are quantized to 1/1000 units for bucketing, so events within
//! the same millisecond-equivalent fire as one batch.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;

/// Quantization factor for bucket keys: `trunc(t * RESOLUTION)`.
pub const RESOLUTION: f64 = 1000.0;

/// Event identifier, assigned on insertion, never reused.
pub type EventId = u64;

/// The callable that runs when an event fires.  Receives a handle to the
/// owning clock so it can schedule further events or query virtual time.
/// Shared (`Arc`) because cyclic events outlive a single execution and
/// queue snapshots are cloned out to clients.
pub type Action = Arc<dyn Fn(&Clock) + Send + Sync>;

/// Wrap a closure as an [`Action`].
pub fn action<F>(f: F) -> Action
where
    F: Fn(&Clock) + Send + Sync + 'static,
{
    Arc::new(f)
}

fn bucket_key(t: f64) -> i64 {
    (t * RESOLUTION).trunc() as i64
}

// ── Event record ───────────────────────────────────────────────

/// A scheduled event: time, action, and optional recurrence interval.
#[derive(Clone)]
pub struct Event {
    /// Scheduled virtual time.
    pub t: f64,
    /// Recurrence interval.  `Some(c)`: after firing at `t_due` the event
    /// is re-inserted at `t_due + c`.  `None`: consumed on extraction.
    pub cycle: Option<f64>,
    pub action: Action,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("t", &self.t)
            .field("cycle", &self.cycle)
            .finish_non_exhaustive()
    }
}

/// A keyed mutation of a pending event.
#[derive(Clone)]
pub enum Update {
    /// Move the event to a new absolute time (re-homes its bucket entry).
    Time(f64),
    /// Replace the action.
    Action(Action),
    /// Replace the recurrence interval.
    Cycle(f64),
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Update::Time(t) => write!(f, "Time({t})"),
            Update::Action(_) => write!(f, "Action(..)"),
            Update::Cycle(c) => write!(f, "Cycle({c})"),
        }
    }
}

// ── Time buckets ───────────────────────────────────────────────

/// All event ids sharing one quantized time, in insertion order.
#[derive(Clone, Debug)]
struct Bucket {
    time: f64,
    ids: Vec<EventId>,
}

// ── The queue ──────────────────────────────────────────────────

/// Priority event queue.
///
/// `events` is the authoritative store; `buckets` is the time index.
/// `delete` removes from `events` only; bucket entries go dangling and
/// are filtered out during [`EventQueue::next`], which keeps deletion
/// O(1) instead of scanning a bucket.
#[derive(Clone, Debug, Default)]
pub struct EventQueue {
    last_id: EventId,
    events: HashMap<EventId, Event>,
    buckets: BTreeMap<i64, Bucket>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event, returning its freshly assigned id.
    pub fn add(&mut self, action: Action, t: f64, cycle: Option<f64>) -> EventId {
        self.last_id += 1;
        let id = self.last_id;
        self.events.insert(id, Event { t, cycle, action });
        self.insert_into_bucket(id, t);
        id
    }

    /// Mutate a pending event.  Unknown ids are a silent no-op.
    pub fn update(&mut self, id: EventId, change: Update) {
        let Some(ev) = self.events.get_mut(&id) else {
            return;
        };
        match change {
            Update::Cycle(c) => ev.cycle = Some(c),
            Update::Action(f) => ev.action = f,
            Update::Time(new_t) => {
                let old_key = bucket_key(ev.t);
                ev.t = new_t;
                if let Some(bucket) = self.buckets.get_mut(&old_key) {
                    bucket.ids.retain(|&other| other != id);
                    if bucket.ids.is_empty() {
                        self.buckets.remove(&old_key);
                    }
                }
                self.insert_into_bucket(id, new_t);
            }
        }
    }

    /// Drop events by id.  Only the record store is touched; bucket
    /// entries stay behind and are skipped on extraction.  Unknown ids
    /// are a silent no-op.
    pub fn delete(&mut self, ids: &[EventId]) {
        for id in ids {
            self.events.remove(id);
        }
    }

    /// Extract the next due batch: the lowest bucket's recorded time and
    /// the actions of its still-live events, in insertion order.
    ///
    /// Cyclic events are re-inserted at `t_due + cycle` (and their
    /// recorded time refreshed to match); non-cyclic ones are consumed.
    /// Returns `None` when no buckets remain.  A bucket whose events
    /// were all deleted still comes back, with an empty action list, so
    /// the caller's notion of time can advance over it.
    pub fn next(&mut self) -> Option<(f64, Vec<Action>)> {
        let (_, bucket) = self.buckets.pop_first()?;
        let mut actions = Vec::with_capacity(bucket.ids.len());
        for id in bucket.ids {
            let (act, cycle) = match self.events.get(&id) {
                Some(ev) => (ev.action.clone(), ev.cycle),
                None => continue, // deleted; dangling bucket entry
            };
            actions.push(act);
            match cycle {
                Some(c) => {
                    let t_next = bucket.time + c;
                    if let Some(ev) = self.events.get_mut(&id) {
                        ev.t = t_next;
                    }
                    self.insert_into_bucket(id, t_next);
                }
                None => {
                    self.events.remove(&id);
                }
            }
        }
        Some((bucket.time, actions))
    }

    // ── Introspection ──────────────────────────────────────────

    /// Number of live (non-deleted) events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Id of the most recently inserted event (0 on a fresh queue).
    pub fn last_id(&self) -> EventId {
        self.last_id
    }

    pub fn get(&self, id: EventId) -> Option<&Event> {
        self.events.get(&id)
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.events.contains_key(&id)
    }

    /// Recorded time of the earliest bucket, if any.  This is a peek
    /// over the index: it may name a bucket whose events were all
    /// deleted, so `Some(_)` over-approximates "work remains".
    pub fn next_time(&self) -> Option<f64> {
        self.buckets.first_key_value().map(|(_, b)| b.time)
    }

    fn insert_into_bucket(&mut self, id: EventId, t: f64) {
        self.buckets
            .entry(bucket_key(t))
            .or_insert_with(|| Bucket {
                time: t,
                ids: Vec::new(),
            })
            .ids
            .push(id);
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Action {
        action(|_| {})
    }

    #[test]
    fn test_ids_are_sequential() {
        let mut eq = EventQueue::new();
        for i in 1..=5u64 {
            let id = eq.add(noop(), i as f64, None);
            assert_eq!(id, i);
        }
        assert_eq!(eq.last_id(), 5);
        assert_eq!(eq.len(), 5);
        for i in 1..=5u64 {
            assert!(eq.contains(i));
        }
    }

    #[test]
    fn test_next_on_empty_queue() {
        let mut eq = EventQueue::new();
        assert!(eq.next().is_none());
        assert_eq!(eq.last_id(), 0);
        assert_eq!(eq.next_time(), None);
    }

    #[test]
    fn test_batch_preserves_insertion_order() {
        let mut eq = EventQueue::new();
        let (a, b, c) = (noop(), noop(), noop());
        eq.add(a.clone(), 1.0, None);
        eq.add(b.clone(), 2.0, None);
        eq.add(c.clone(), 1.0, None);

        let (t, batch) = eq.next().unwrap();
        assert_eq!(t, 1.0);
        assert_eq!(batch.len(), 2);
        assert!(Arc::ptr_eq(&batch[0], &a));
        assert!(Arc::ptr_eq(&batch[1], &c));

        let (t, batch) = eq.next().unwrap();
        assert_eq!(t, 2.0);
        assert!(Arc::ptr_eq(&batch[0], &b));
        assert!(eq.next().is_none());
        assert!(eq.is_empty());
    }

    #[test]
    fn test_quantization_groups_same_millisecond() {
        let mut eq = EventQueue::new();
        eq.add(noop(), 1.0004, None);
        eq.add(noop(), 1.0009, None);
        eq.add(noop(), 1.001, None);

        let (t, batch) = eq.next().unwrap();
        assert_eq!(t, 1.0004); // first inserter names the bucket
        assert_eq!(batch.len(), 2);
        let (t, batch) = eq.next().unwrap();
        assert_eq!(t, 1.001);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_delete_suppresses_extraction() {
        let mut eq = EventQueue::new();
        let (a, b) = (noop(), noop());
        eq.add(a.clone(), 1.0, None);
        eq.add(b.clone(), 1.0, None);
        eq.add(noop(), 2.0, None);
        eq.delete(&[2]);

        // id 2 still sits in the bucket, but only id 1 comes back
        let (t, batch) = eq.next().unwrap();
        assert_eq!(t, 1.0);
        assert_eq!(batch.len(), 1);
        assert!(Arc::ptr_eq(&batch[0], &a));
        assert!(!eq.contains(2));
    }

    #[test]
    fn test_fully_deleted_bucket_still_yields_its_time() {
        let mut eq = EventQueue::new();
        eq.add(noop(), 1.0, None);
        eq.delete(&[1]);

        let (t, batch) = eq.next().unwrap();
        assert_eq!(t, 1.0);
        assert!(batch.is_empty());
        assert!(eq.next().is_none());
    }

    #[test]
    fn test_update_time_rehomes_bucket_entry() {
        let mut eq = EventQueue::new();
        eq.add(noop(), 1.0, None);
        eq.add(noop(), 2.0, None);
        eq.add(noop(), 3.0, None);
        eq.update(1, Update::Time(3.0));

        assert_eq!(eq.get(1).unwrap().t, 3.0);
        assert!(!eq.buckets.contains_key(&bucket_key(1.0)));
        let bucket = &eq.buckets[&bucket_key(3.0)];
        assert_eq!(bucket.ids, vec![3, 1]); // appended behind the incumbent

        let (t, batch) = eq.next().unwrap();
        assert_eq!(t, 2.0);
        assert_eq!(batch.len(), 1);
        let (t, batch) = eq.next().unwrap();
        assert_eq!(t, 3.0);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_update_time_keeps_shared_bucket_intact() {
        let mut eq = EventQueue::new();
        eq.add(noop(), 1.0, None);
        eq.add(noop(), 1.0, None);
        eq.update(1, Update::Time(5.0));

        let old = &eq.buckets[&bucket_key(1.0)];
        assert_eq!(old.ids, vec![2]);
        assert_eq!(old.time, 1.0); // survivor's recorded time untouched
        assert_eq!(eq.buckets[&bucket_key(5.0)].ids, vec![1]);
    }

    #[test]
    fn test_cyclic_event_is_reinserted() {
        let mut eq = EventQueue::new();
        let a = noop();
        eq.add(a.clone(), 1.0, Some(2.0));

        let (t, batch) = eq.next().unwrap();
        assert_eq!(t, 1.0);
        assert_eq!(batch.len(), 1);
        assert!(eq.contains(1));
        assert_eq!(eq.get(1).unwrap().t, 3.0);
        assert_eq!(eq.buckets[&bucket_key(3.0)].ids, vec![1]);

        // fires again one cycle later, same action
        let (t, batch) = eq.next().unwrap();
        assert_eq!(t, 3.0);
        assert!(Arc::ptr_eq(&batch[0], &a));
    }

    #[test]
    fn test_update_cycle_is_idempotent() {
        let mut eq = EventQueue::new();
        let a = noop();
        eq.add(a.clone(), 1.0, None);
        eq.update(1, Update::Cycle(2.5));
        eq.update(1, Update::Cycle(2.5));

        let ev = eq.get(1).unwrap();
        assert_eq!(ev.t, 1.0);
        assert_eq!(ev.cycle, Some(2.5));
        assert!(Arc::ptr_eq(&ev.action, &a));
        assert_eq!(eq.buckets.len(), 1);
    }

    #[test]
    fn test_update_unknown_id_is_noop() {
        let mut eq = EventQueue::new();
        eq.add(noop(), 1.0, None);
        eq.update(42, Update::Time(9.0));
        eq.update(42, Update::Cycle(1.0));
        eq.delete(&[42]);

        assert_eq!(eq.len(), 1);
        assert_eq!(eq.last_id(), 1);
        assert_eq!(eq.buckets.len(), 1);
        assert_eq!(eq.get(1).unwrap().t, 1.0);
    }

    #[test]
    fn test_update_action_leaves_index_alone() {
        let mut eq = EventQueue::new();
        let replacement = noop();
        eq.add(noop(), 1.0, None);
        eq.update(1, Update::Action(replacement.clone()));

        assert_eq!(eq.buckets[&bucket_key(1.0)].ids, vec![1]);
        let (_, batch) = eq.next().unwrap();
        assert!(Arc::ptr_eq(&batch[0], &replacement));
    }

    #[test]
    fn test_negative_times_order_correctly() {
        let mut eq = EventQueue::new();
        eq.add(noop(), 0.5, None);
        eq.add(noop(), -1.5, None);

        let (t, _) = eq.next().unwrap();
        assert_eq!(t, -1.5);
        let (t, _) = eq.next().unwrap();
        assert_eq!(t, 0.5);
    }
}
