//! Thread-safe max-priority queue of warmup jobs.
//!
//! A binary heap stored in a `Vec`, guarded by a single `parking_lot::RwLock`.
//! Each [`QueueEntry`] carries its current heap position so an entry can be
//! removed by key without rebuilding the heap.
//!
//! Entries of equal priority come out in no particular order.

use parking_lot::RwLock;

use crate::job::WarmupJob;

/// A queued job and its position in the heap.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub job: WarmupJob,
    pub priority: i32,
    pub index: usize,
}

#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: RwLock<Vec<QueueEntry>>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// O(log n).
    pub fn push(&self, job: WarmupJob) {
        let mut heap = self.heap.write();
        let index = heap.len();
        heap.push(QueueEntry {
            priority: job.priority,
            job,
            index,
        });
        sift_up(&mut heap, index);
    }

    /// Remove and return the highest-priority job. O(log n).
    pub fn pop(&self) -> Option<WarmupJob> {
        let mut heap = self.heap.write();
        remove_at(&mut heap, 0).map(|entry| entry.job)
    }

    /// The highest-priority job without removing it. O(1).
    pub fn peek(&self) -> Option<WarmupJob> {
        self.heap.read().first().map(|entry| entry.job.clone())
    }

    /// O(1).
    pub fn len(&self) -> usize {
        self.heap.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.read().is_empty()
    }

    pub fn clear(&self) {
        self.heap.write().clear();
    }

    /// Copy of all queued jobs in heap order. The queue is left untouched.
    pub fn snapshot(&self) -> Vec<WarmupJob> {
        self.heap.read().iter().map(|e| e.job.clone()).collect()
    }

    /// Copy of all queued jobs, highest priority first.
    pub fn sorted_snapshot(&self) -> Vec<WarmupJob> {
        let mut jobs = self.snapshot();
        jobs.sort_by(|a, b| b.priority.cmp(&a.priority));
        jobs
    }

    /// Remove the first queued job with `key`. O(n) lookup, O(log n) removal.
    pub fn remove(&self, key: &str) -> Option<WarmupJob> {
        let mut heap = self.heap.write();
        let index = heap.iter().find(|e| e.job.key == key).map(|e| e.index)?;
        remove_at(&mut heap, index).map(|entry| entry.job)
    }
}

fn swap(heap: &mut [QueueEntry], a: usize, b: usize) {
    heap.swap(a, b);
    heap[a].index = a;
    heap[b].index = b;
}

fn sift_up(heap: &mut [QueueEntry], mut i: usize) {
    while i > 0 {
        let parent = (i - 1) / 2;
        if heap[i].priority <= heap[parent].priority {
            break;
        }
        swap(heap, i, parent);
        i = parent;
    }
}

fn sift_down(heap: &mut [QueueEntry], mut i: usize) {
    let n = heap.len();
    loop {
        let left = 2 * i + 1;
        let right = left + 1;
        let mut largest = i;
        if left < n && heap[left].priority > heap[largest].priority {
            largest = left;
        }
        if right < n && heap[right].priority > heap[largest].priority {
            largest = right;
        }
        if largest == i {
            break;
        }
        swap(heap, i, largest);
        i = largest;
    }
}

fn remove_at(heap: &mut Vec<QueueEntry>, i: usize) -> Option<QueueEntry> {
    if i >= heap.len() {
        return None;
    }
    let last = heap.len() - 1;
    if i != last {
        swap(heap, i, last);
    }
    let removed = heap.pop();
    if i < heap.len() {
        sift_down(heap, i);
        sift_up(heap, i);
    }
    removed
}
