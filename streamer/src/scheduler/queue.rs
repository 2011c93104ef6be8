//! Ordered request queue.
//!
//! Requests are ordered by deadline (soonest first, no deadline last), then
//! priority (highest first), then pending id (earliest queued first), then
//! sequence for entries that share a pending id. Every component that
//! reorders requests uses this queue so the tie-break policy is applied the
//! same way everywhere.

use crate::request::{Deadline, Priority};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap};

/// Sort key of a queued request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OrderKey {
    pub deadline: Deadline,
    pub priority: Priority,
    pub pending_id: u64,
    /// Orders entries that share a pending id; zero for scheduler entries.
    pub sequence: u64,
}

impl OrderKey {
    pub fn new(deadline: Deadline, priority: Priority, pending_id: u64) -> Self {
        Self {
            deadline,
            priority,
            pending_id,
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    fn slot(&self) -> (u64, u64) {
        (self.pending_id, self.sequence)
    }

    fn sort_tuple(&self) -> (Deadline, Reverse<Priority>, u64, u64) {
        (self.deadline, Reverse(self.priority), self.pending_id, self.sequence)
    }
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_tuple().cmp(&other.sort_tuple())
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Queue of values ordered by [`OrderKey`], addressable by pending id.
///
/// Lookups by pending id address the sequence-zero entry; entries pushed
/// with another sequence leave through `pop` or `drain_where`.
#[derive(Debug)]
pub struct OrderedQueue<T> {
    entries: BTreeMap<OrderKey, T>,
    keys: HashMap<(u64, u64), OrderKey>,
}

impl<T> Default for OrderedQueue<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            keys: HashMap::new(),
        }
    }
}

impl<T> OrderedQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value. A value already queued under the same pending id and
    /// sequence is replaced.
    pub fn push(&mut self, key: OrderKey, value: T) {
        if let Some(old) = self.keys.insert(key.slot(), key) {
            self.entries.remove(&old);
        }
        self.entries.insert(key, value);
    }

    /// Removes and returns the first value in order.
    pub fn pop(&mut self) -> Option<(OrderKey, T)> {
        let (key, value) = self.entries.pop_first()?;
        self.keys.remove(&key.slot());
        Some((key, value))
    }

    /// Returns the first value in order without removing it.
    pub fn peek(&self) -> Option<(&OrderKey, &T)> {
        self.entries.first_key_value()
    }

    /// Removes the value queued under `pending_id`.
    pub fn remove(&mut self, pending_id: u64) -> Option<T> {
        let key = self.keys.remove(&(pending_id, 0))?;
        self.entries.remove(&key)
    }

    pub fn contains(&self, pending_id: u64) -> bool {
        self.keys.contains_key(&(pending_id, 0))
    }

    /// Moves a queued value to new ordering keys.
    ///
    /// Returns false if nothing is queued under `pending_id`.
    pub fn reschedule(&mut self, pending_id: u64, deadline: Deadline, priority: Priority) -> bool {
        let Some(old) = self.keys.get(&(pending_id, 0)).copied() else {
            return false;
        };
        let Some(value) = self.entries.remove(&old) else {
            return false;
        };
        let key = OrderKey::new(deadline, priority, pending_id);
        self.keys.insert(key.slot(), key);
        self.entries.insert(key, value);
        true
    }

    /// Removes every value for which `remove` returns true, in queue order.
    pub fn drain_where(&mut self, mut remove: impl FnMut(&T) -> bool) -> Vec<(OrderKey, T)> {
        let doomed: Vec<OrderKey> = self
            .entries
            .iter()
            .filter(|(_, value)| remove(value))
            .map(|(key, _)| *key)
            .collect();
        doomed
            .into_iter()
            .filter_map(|key| {
                self.keys.remove(&key.slot());
                self.entries.remove(&key).map(|value| (key, value))
            })
            .collect()
    }

    /// Iterates values in queue order.
    pub fn iter(&self) -> impl Iterator<Item = (&OrderKey, &T)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn order(queue: &mut OrderedQueue<&'static str>) -> Vec<&'static str> {
        std::iter::from_fn(|| queue.pop().map(|(_, v)| v)).collect()
    }

    #[test]
    fn test_deadline_then_priority_then_pending_id() {
        let base = Instant::now();
        let soon = Deadline::at(base + Duration::from_millis(10));
        let later = Deadline::at(base + Duration::from_millis(50));

        let mut queue = OrderedQueue::new();
        queue.push(OrderKey::new(Deadline::NONE, Priority::HIGHEST, 1), "no-deadline");
        queue.push(OrderKey::new(later, Priority::HIGH, 2), "later");
        queue.push(OrderKey::new(soon, Priority::LOWEST, 3), "soon-low");
        queue.push(OrderKey::new(soon, Priority::HIGH, 5), "soon-high-b");
        queue.push(OrderKey::new(soon, Priority::HIGH, 4), "soon-high-a");

        assert_eq!(
            order(&mut queue),
            vec!["soon-high-a", "soon-high-b", "soon-low", "later", "no-deadline"]
        );
    }

    #[test]
    fn test_remove_by_pending_id() {
        let mut queue = OrderedQueue::new();
        queue.push(OrderKey::new(Deadline::NONE, Priority::MEDIUM, 1), "a");
        queue.push(OrderKey::new(Deadline::NONE, Priority::MEDIUM, 2), "b");

        assert_eq!(queue.remove(1), Some("a"));
        assert_eq!(queue.remove(1), None);
        assert!(!queue.contains(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_reschedule_moves_entry() {
        let mut queue = OrderedQueue::new();
        queue.push(OrderKey::new(Deadline::NONE, Priority::MEDIUM, 1), "first");
        queue.push(OrderKey::new(Deadline::NONE, Priority::MEDIUM, 2), "second");

        assert!(queue.reschedule(2, Deadline::NONE, Priority::HIGHEST));
        assert!(!queue.reschedule(9, Deadline::NONE, Priority::HIGHEST));
        assert_eq!(order(&mut queue), vec!["second", "first"]);
    }

    #[test]
    fn test_push_same_pending_id_replaces() {
        let mut queue = OrderedQueue::new();
        queue.push(OrderKey::new(Deadline::NONE, Priority::LOWEST, 1), "old");
        queue.push(OrderKey::new(Deadline::NONE, Priority::HIGH, 1), "new");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek().map(|(_, v)| *v), Some("new"));
    }

    #[test]
    fn test_sequence_orders_entries_sharing_pending_id() {
        let mut queue = OrderedQueue::new();
        let key = |pending_id, sequence| {
            OrderKey::new(Deadline::NONE, Priority::MEDIUM, pending_id).with_sequence(sequence)
        };
        queue.push(key(7, 0), "late-root");
        queue.push(key(3, 5), "early-root-second");
        queue.push(key(3, 2), "early-root-first");

        assert_eq!(queue.len(), 3);
        assert_eq!(
            order(&mut queue),
            vec!["early-root-first", "early-root-second", "late-root"]
        );
    }

    #[test]
    fn test_drain_where() {
        let mut queue = OrderedQueue::new();
        for (id, name) in [(1, "keep"), (2, "drop"), (3, "drop")] {
            queue.push(OrderKey::new(Deadline::NONE, Priority::MEDIUM, id), name);
        }
        let drained = queue.drain_where(|v| *v == "drop");
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(1));
    }
}
