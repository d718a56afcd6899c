use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use recon_model::{JobId, Target};

/// A queued job as seen by the dispatch planner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedEntry {
    pub job_id: JobId,
    pub target: Target,
    pub created_at: DateTime<Utc>,
    pub priority_weight: u32,
    pub sequence: u64,
}

type QueueKey = (DateTime<Utc>, Reverse<u32>, u64);

impl QueuedEntry {
    /// Oldest first, then heavier scan types, then creation order. The store
    /// never hands out a `created_at` earlier than a previous submission's, so
    /// this agrees with `sequence` except for weight ties at the same instant.
    fn key(&self) -> QueueKey {
        (self.created_at, Reverse(self.priority_weight), self.sequence)
    }
}

/// Slot accounting and FIFO selection for the control loop.
///
/// The planner is owned by a single task, so it needs no locking. It enforces
/// the global `max_concurrent` cap and the optional per-target cap: a freed
/// slot goes to the oldest queued job whose target still has budget, and
/// stays idle when none does.
pub struct DispatchPlanner {
    max_concurrent: usize,
    max_per_target: Option<usize>,
    queue: BTreeMap<QueueKey, QueuedEntry>,
    index: HashMap<JobId, QueueKey>,
    running: HashMap<JobId, Target>,
    per_target: HashMap<Target, usize>,
}

impl fmt::Debug for DispatchPlanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPlanner")
            .field("max_concurrent", &self.max_concurrent)
            .field("max_per_target", &self.max_per_target)
            .field("queued", &self.queue.len())
            .field("running", &self.running.len())
            .field("busy_targets", &self.per_target.len())
            .finish()
    }
}

impl DispatchPlanner {
    pub fn new(max_concurrent: usize, max_per_target: Option<usize>) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            max_per_target: max_per_target.map(|cap| cap.max(1)),
            queue: BTreeMap::new(),
            index: HashMap::new(),
            running: HashMap::new(),
            per_target: HashMap::new(),
        }
    }

    pub fn enqueue(&mut self, entry: QueuedEntry) {
        if self.index.contains_key(&entry.job_id) || self.running.contains_key(&entry.job_id) {
            return;
        }
        let key = entry.key();
        self.index.insert(entry.job_id, key);
        self.queue.insert(key, entry);
    }

    /// Drops a queued job. Returns `false` if it was not queued.
    pub fn remove_queued(&mut self, job_id: JobId) -> bool {
        match self.index.remove(&job_id) {
            Some(key) => self.queue.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn running_for(&self, target: &Target) -> usize {
        self.per_target.get(target).copied().unwrap_or_default()
    }

    fn target_has_budget(&self, target: &Target) -> bool {
        self.max_per_target
            .is_none_or(|cap| self.running_for(target) < cap)
    }

    /// Claims a slot for the next eligible job, if any.
    pub fn next_dispatch(&mut self) -> Option<QueuedEntry> {
        if self.running.len() >= self.max_concurrent {
            return None;
        }
        let key = self
            .queue
            .iter()
            .find(|(_, entry)| self.target_has_budget(&entry.target))
            .map(|(key, _)| *key)?;
        let entry = self.queue.remove(&key)?;
        self.index.remove(&entry.job_id);
        self.running.insert(entry.job_id, entry.target.clone());
        *self.per_target.entry(entry.target.clone()).or_default() += 1;
        Some(entry)
    }

    /// Frees the slot held by `job_id`.
    pub fn release(&mut self, job_id: JobId) -> bool {
        let Some(target) = self.running.remove(&job_id) else {
            return false;
        };
        if let Some(count) = self.per_target.get_mut(&target) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_target.remove(&target);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn entry(target: &str, created_at: DateTime<Utc>, weight: u32, sequence: u64) -> QueuedEntry {
        QueuedEntry {
            job_id: JobId::new(),
            target: Target::parse(target).unwrap(),
            created_at,
            priority_weight: weight,
            sequence,
        }
    }

    #[test]
    fn oldest_first_with_weight_tie_break() {
        let now = Utc::now();
        let mut planner = DispatchPlanner::new(10, None);
        let late = entry("10.0.0.1", now + Duration::seconds(1), 9, 0);
        let light = entry("10.0.0.2", now, 1, 1);
        let heavy = entry("10.0.0.3", now, 5, 2);
        for e in [late.clone(), light.clone(), heavy.clone()] {
            planner.enqueue(e);
        }

        let order: Vec<JobId> = std::iter::from_fn(|| planner.next_dispatch())
            .map(|e| e.job_id)
            .collect();
        assert_eq!(order, vec![heavy.job_id, light.job_id, late.job_id]);
    }

    #[test]
    fn global_cap_holds_until_release() {
        let now = Utc::now();
        let mut planner = DispatchPlanner::new(1, None);
        let a = entry("10.0.0.1", now, 1, 0);
        let b = entry("10.0.0.2", now, 1, 1);
        planner.enqueue(a.clone());
        planner.enqueue(b.clone());

        assert_eq!(planner.next_dispatch().map(|e| e.job_id), Some(a.job_id));
        assert!(planner.next_dispatch().is_none());
        assert!(planner.release(a.job_id));
        assert_eq!(planner.next_dispatch().map(|e| e.job_id), Some(b.job_id));
        assert!(!planner.release(a.job_id));
    }

    #[test]
    fn per_target_cap_skips_to_next_eligible() {
        let now = Utc::now();
        let mut planner = DispatchPlanner::new(4, Some(1));
        let first = entry("example.com", now, 1, 0);
        let same_target = entry("example.com", now, 1, 1);
        let other = entry("example.org", now, 1, 2);
        for e in [first.clone(), same_target.clone(), other.clone()] {
            planner.enqueue(e);
        }

        assert_eq!(planner.next_dispatch().map(|e| e.job_id), Some(first.job_id));
        assert_eq!(planner.next_dispatch().map(|e| e.job_id), Some(other.job_id));
        assert!(planner.next_dispatch().is_none());
        assert_eq!(planner.running_for(&first.target), 1);

        planner.release(first.job_id);
        assert_eq!(
            planner.next_dispatch().map(|e| e.job_id),
            Some(same_target.job_id)
        );
    }

    #[test]
    fn removed_entries_are_never_dispatched() {
        let now = Utc::now();
        let mut planner = DispatchPlanner::new(2, None);
        let a = entry("10.0.0.1", now, 1, 0);
        planner.enqueue(a.clone());
        assert!(planner.remove_queued(a.job_id));
        assert!(!planner.remove_queued(a.job_id));
        assert!(planner.next_dispatch().is_none());
    }
}
