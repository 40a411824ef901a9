//! Priority work queue.
//!
//! Tasks are ordered by stage tier (ENCODE, then PREPARE, then MERGE) with
//! strict FIFO inside a tier. The queue is not synchronized on its own; the
//! [`WorkerPool`](super::WorkerPool) keeps it behind its coordinating lock.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::task::{StageKind, Task};

struct QueuedTask {
    sequence: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: lower tier number and lower sequence rank higher.
        other
            .task
            .stage()
            .priority()
            .cmp(&self.task.stage().priority())
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Ready-to-run tasks ordered by priority tier, FIFO within a tier.
#[derive(Default)]
pub struct PriorityWorkQueue {
    heap: BinaryHeap<QueuedTask>,
    next_sequence: u64,
}

impl PriorityWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task in O(log n). Returns its submission sequence number.
    pub fn submit(&mut self, task: Task) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueuedTask { sequence, task });
        sequence
    }

    /// Remove the highest-priority, oldest task, if any.
    pub fn take_next(&mut self) -> Option<Task> {
        self.heap.pop().map(|queued| queued.task)
    }

    /// Stage of the task `take_next` would return.
    pub fn peek_stage(&self) -> Option<StageKind> {
        self.heap.peek().map(|queued| queued.task.stage())
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Number of queued tasks of one stage.
    pub fn count_stage(&self, stage: StageKind) -> usize {
        self.heap
            .iter()
            .filter(|queued| queued.task.stage() == stage)
            .count()
    }
}

impl std::fmt::Debug for PriorityWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityWorkQueue")
            .field("len", &self.heap.len())
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::task::StageOutput;
    use std::path::PathBuf;

    fn task(stage: StageKind, asin: &str) -> Task {
        Task::new(stage, "job", asin, || async {
            Ok(StageOutput::Merged(PathBuf::new()))
        })
    }

    #[test]
    fn test_encode_beats_prepare_beats_merge() {
        let mut queue = PriorityWorkQueue::new();
        queue.submit(task(StageKind::Merge, "m"));
        queue.submit(task(StageKind::Prepare, "p"));
        queue.submit(task(StageKind::Encode, "e"));

        assert_eq!(queue.peek_stage(), Some(StageKind::Encode));
        assert_eq!(queue.take_next().unwrap().asin(), "e");
        assert_eq!(queue.take_next().unwrap().asin(), "p");
        assert_eq!(queue.take_next().unwrap().asin(), "m");
        assert!(queue.take_next().is_none());
    }

    #[test]
    fn test_fifo_within_tier() {
        let mut queue = PriorityWorkQueue::new();
        for asin in ["a", "b", "c", "d"] {
            queue.submit(task(StageKind::Encode, asin));
        }
        // Interleave another tier to make sure it does not disturb ordering.
        queue.submit(task(StageKind::Merge, "z"));
        queue.submit(task(StageKind::Encode, "e"));

        let order: Vec<String> = std::iter::from_fn(|| queue.take_next())
            .map(|t| t.asin().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "c", "d", "e", "z"]);
    }

    #[test]
    fn test_counts() {
        let mut queue = PriorityWorkQueue::new();
        assert!(queue.is_empty());
        queue.submit(task(StageKind::Encode, "a"));
        queue.submit(task(StageKind::Encode, "b"));
        queue.submit(task(StageKind::Prepare, "c"));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.count_stage(StageKind::Encode), 2);
        assert_eq!(queue.count_stage(StageKind::Merge), 0);
    }
}
