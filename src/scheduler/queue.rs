//! Ready queue ordered by (priority weight DESC, enqueue time ASC).

use std::collections::BinaryHeap;
use std::cmp::Ordering;

use crate::model::TaskSpec;

struct QueueEntry {
    task: TaskSpec,
    /// Monotonic insertion counter; used as a tiebreak so FIFO order within
    /// a priority class is preserved even if two tasks share a timestamp.
    sequence: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_key() == other.cmp_key()
    }
}
impl Eq for QueueEntry {}

impl QueueEntry {
    /// Higher priority weight first; within a class, earlier enqueue_at
    /// wins (older `sequence` sorts "greater" so `BinaryHeap`, a max-heap,
    /// pops it first).
    fn cmp_key(&self) -> (u32, std::cmp::Reverse<u64>) {
        (self.task.priority_class.weight(), std::cmp::Reverse(self.sequence))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_key().cmp(&other.cmp_key())
    }
}

/// Priority-ordered ready queue. Strictly-higher-priority tasks never wait
/// behind strictly-lower ones once both are ready.
#[derive(Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueueEntry>,
    next_sequence: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: TaskSpec) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueueEntry { task, sequence });
    }

    /// Preempted tasks re-enter the queue ahead of fresh arrivals of equal
    /// class: reinsert with the original sequence number preserved by the
    /// caller via `push_with_sequence`.
    pub fn push_resumed(&mut self, task: TaskSpec, original_sequence: u64) {
        self.heap.push(QueueEntry { task, sequence: original_sequence });
    }

    pub fn pop(&mut self) -> Option<TaskSpec> {
        self.heap.pop().map(|entry| entry.task)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn peek(&self) -> Option<&TaskSpec> {
        self.heap.peek().map(|entry| &entry.task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Budget, PriorityClass, TaskType};
    use chrono::Utc;

    fn task(id: &str, priority: PriorityClass) -> TaskSpec {
        TaskSpec::new(
            id.into(),
            "intake".into(),
            TaskType::Agent,
            "agent.x".into(),
            serde_json::json!({}),
            Budget::new(1.0, 100, 3),
            vec![],
            Utc::now(),
        )
        .with_priority(priority)
    }

    #[test]
    fn higher_priority_always_pops_before_lower() {
        let mut queue = PriorityQueue::new();
        queue.push(task("t1", PriorityClass::P3));
        queue.push(task("t2", PriorityClass::P0));
        queue.push(task("t3", PriorityClass::P2));
        assert_eq!(queue.pop().unwrap().task_id, "t2");
        assert_eq!(queue.pop().unwrap().task_id, "t3");
        assert_eq!(queue.pop().unwrap().task_id, "t1");
    }

    #[test]
    fn same_priority_is_fifo_by_enqueue_order() {
        let mut queue = PriorityQueue::new();
        queue.push(task("first", PriorityClass::P2));
        queue.push(task("second", PriorityClass::P2));
        assert_eq!(queue.pop().unwrap().task_id, "first");
        assert_eq!(queue.pop().unwrap().task_id, "second");
    }

    #[test]
    fn empty_queue_pops_none() {
        let mut queue: PriorityQueue = PriorityQueue::new();
        assert!(queue.pop().is_none());
    }
}
