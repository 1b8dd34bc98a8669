use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use super::entities::ActivityRecord;

/// In-memory FIFO of activities waiting for upload. Shared between the sampling task, which
/// appends, and the upload coordinator, which takes batches out and puts them back on failure.
///
/// Items that are never removed keep their relative order through every operation.
#[derive(Debug, Default)]
pub struct ActivityQueue {
    items: Mutex<VecDeque<ActivityRecord>>,
}

impl ActivityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ActivityRecord>> {
        // A panic while holding the lock can't leave the deque half-modified.
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, record: ActivityRecord) {
        self.lock().push_back(record);
    }

    /// Removes and returns at most `n` of the oldest records.
    pub fn drain_up_to(&self, n: usize) -> Vec<ActivityRecord> {
        let mut items = self.lock();
        let n = n.min(items.len());
        items.drain(..n).collect()
    }

    /// Atomically takes everything currently queued. Records enqueued afterwards belong to the
    /// next batch.
    pub fn take_all(&self) -> Vec<ActivityRecord> {
        std::mem::take(&mut *self.lock()).into()
    }

    /// Puts records back at the head of the queue, in the order given, ahead of anything queued
    /// in the meantime.
    pub fn requeue_front(&self, records: Vec<ActivityRecord>) {
        let mut items = self.lock();
        for record in records.into_iter().rev() {
            items.push_front(record);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// A batch taken out of an [ActivityQueue] for one upload attempt. Unless [InFlightBatch::commit]
/// is called the records go back to the front of the queue when the batch is dropped, which
/// covers errors, early returns and cancellation of the upload future alike.
pub struct InFlightBatch<'a> {
    queue: &'a ActivityQueue,
    records: Option<Vec<ActivityRecord>>,
}

impl<'a> InFlightBatch<'a> {
    pub fn take(queue: &'a ActivityQueue) -> Self {
        Self {
            records: Some(queue.take_all()),
            queue,
        }
    }

    pub fn records(&self) -> &[ActivityRecord] {
        self.records.as_deref().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Marks the batch as delivered. Returns the number of delivered records.
    pub fn commit(mut self) -> usize {
        self.records.take().map_or(0, |v| v.len())
    }
}

impl Drop for InFlightBatch<'_> {
    fn drop(&mut self) {
        if let Some(records) = self.records.take().filter(|v| !v.is_empty()) {
            self.queue.requeue_front(records);
        }
    }
}
