//! Deferred resync bookkeeping.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use slurm_core::crd::ObjectKey;

/// Schedules an object to be reconciled again after some duration.
pub trait ResyncScheduler: Send + Sync {
    fn push(&self, key: &ObjectKey, after: Duration);
}

/// A per-object store of resync durations where the shortest duration wins.
#[derive(Default)]
pub struct DurationStore {
    inner: DashMap<ObjectKey, Duration>,
}

impl DurationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the pending resync duration of the given object, if any.
    pub fn pop(&self, key: &ObjectKey) -> Option<Duration> {
        self.inner.remove(key).map(|(_, after)| after)
    }

    /// Keep only the entries of objects matching the given predicate.
    pub fn retain(&self, mut keep: impl FnMut(&ObjectKey) -> bool) {
        self.inner.retain(|key, _| keep(key));
    }

    /// Peek at the pending resync duration of the given object.
    pub fn peek(&self, key: &ObjectKey) -> Option<Duration> {
        self.inner.get(key).map(|after| *after.value())
    }
}

impl ResyncScheduler for DurationStore {
    fn push(&self, key: &ObjectKey, after: Duration) {
        self.inner
            .entry(key.clone())
            .and_modify(|current| *current = (*current).min(after))
            .or_insert(after);
    }
}

/// A per-node store of deadlines where the latest deadline wins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeadlineStore {
    inner: BTreeMap<String, DateTime<Utc>>,
}

impl DeadlineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a deadline for the given node, keeping the later of the stored and given deadlines.
    pub fn push(&mut self, node: &str, deadline: DateTime<Utc>) {
        self.inner
            .entry(node.to_string())
            .and_modify(|current| *current = (*current).max(deadline))
            .or_insert(deadline);
    }

    pub fn get(&self, node: &str) -> Option<DateTime<Utc>> {
        self.inner.get(node).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duration_store_shortest_wins() {
        let store = DurationStore::new();
        let key = ObjectKey::new("hpc", "gpu");
        store.push(&key, Duration::from_secs(30));
        store.push(&key, Duration::from_secs(5));
        store.push(&key, Duration::from_secs(10));
        assert!(store.peek(&key) == Some(Duration::from_secs(5)), "expected 5s, got {:?}", store.peek(&key));
        assert!(store.pop(&key) == Some(Duration::from_secs(5)), "expected pop to return 5s");
        assert!(store.pop(&key).is_none(), "expected pop to clear the entry");
    }

    #[test]
    fn duration_store_retain_drops_entries() {
        let store = DurationStore::new();
        let (live, gone) = (ObjectKey::new("hpc", "gpu"), ObjectKey::new("hpc", "cpu"));
        store.push(&live, Duration::from_secs(5));
        store.push(&gone, Duration::from_secs(5));
        store.retain(|key| key == &live);
        assert!(store.peek(&live).is_some(), "expected the live entry to be kept");
        assert!(store.peek(&gone).is_none(), "expected the gone entry to be dropped");
    }

    #[test]
    fn deadline_store_latest_wins() {
        let mut store = DeadlineStore::new();
        let early = Utc::now();
        let late = early + chrono::Duration::minutes(10);
        store.push("gpu-node-a", late);
        store.push("gpu-node-a", early);
        store.push("gpu-node-b", DateTime::<Utc>::MAX_UTC);
        assert!(store.get("gpu-node-a") == Some(late), "expected the later deadline to win");
        assert!(store.get("gpu-node-b") == Some(DateTime::<Utc>::MAX_UTC), "expected infinite deadline to be kept");
        assert!(store.get("gpu-node-c").is_none(), "expected no deadline for unknown nodes");
        assert!(store.len() == 2, "expected 2 entries, got {}", store.len());
    }
}
