//! In-memory wait queue with priority ordering and staleness pruning.

use std::time::Duration;

use crate::core::admission::{QueuedRequest, TaskQueue};
use crate::core::SchedulerError;
use crate::util::types::GraphId;

/// In-memory queue kept sorted by priority (highest first), FIFO within a
/// priority.
///
/// Insertion is O(n); the queue is expected to stay small relative to the
/// cost of the work it gates.
pub struct InMemoryQueue {
    max_depth: usize,
    entries: Vec<QueuedRequest>,
}

impl InMemoryQueue {
    /// Create a new in-memory queue with a maximum depth.
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            entries: Vec::with_capacity(max_depth.min(1024)),
        }
    }
}

impl TaskQueue for InMemoryQueue {
    fn enqueue(&mut self, entry: QueuedRequest) -> Result<usize, SchedulerError> {
        if self.len() >= self.max_depth() {
            return Err(SchedulerError::QueueFull("max queue depth reached".into()));
        }
        // Behind every entry of equal or higher priority.
        let priority = entry.request.priority;
        let position = self
            .entries
            .partition_point(|queued| queued.request.priority >= priority);
        self.entries.insert(position, entry);
        Ok(position)
    }

    fn remove(&mut self, task_id: &str) -> Option<QueuedRequest> {
        let position = self.position(task_id)?;
        Some(self.entries.remove(position))
    }

    fn remove_graph(&mut self, graph_id: GraphId) -> Vec<QueuedRequest> {
        let (removed, kept) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|queued| queued.request.graph_id == Some(graph_id));
        self.entries = kept;
        removed
    }

    fn position(&self, task_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|queued| queued.request.task_id == task_id)
    }

    fn touch(&mut self, task_id: &str, now: Duration) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|queued| queued.request.task_id == task_id)
        {
            Some(queued) => {
                queued.last_seen = now;
                true
            }
            None => false,
        }
    }

    fn prune_expired(&mut self, cutoff: Duration) -> Vec<QueuedRequest> {
        let (expired, kept) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|queued| queued.last_seen < cutoff);
        self.entries = kept;
        expired
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &QueuedRequest> + '_> {
        Box::new(self.entries.iter())
    }

    fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
