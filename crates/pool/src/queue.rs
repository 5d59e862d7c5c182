//! Bounded priority queue of jobs waiting for a unit.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use offload_protocol::JobId;

use crate::job::{Job, JobState};

/// Heap entry: higher priority first, then lower (earlier) job id.
#[derive(Debug)]
struct Queued(Job);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

/// Jobs waiting for assignment.
///
/// Job ids are monotonic, so ordering by id inside a priority level is FIFO
/// by submission.
#[derive(Debug)]
pub struct JobQueue {
    heap: BinaryHeap<Queued>,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            capacity,
        }
    }

    /// Enqueue a new submission. Hands the job back when the queue is full.
    pub fn push(&mut self, job: Job) -> Result<(), Job> {
        if self.is_full() {
            return Err(job);
        }
        self.requeue(job);
        Ok(())
    }

    /// Enqueue a job that was already accepted (a retry). Not bounded.
    pub fn requeue(&mut self, mut job: Job) {
        job.state = JobState::Pending;
        job.queued_at = Some(Instant::now());
        self.heap.push(Queued(job));
    }

    /// Put back a job that was just popped, keeping its queue position.
    pub fn restore(&mut self, job: Job) {
        self.heap.push(Queued(job));
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.heap.pop().map(|q| q.0)
    }

    pub fn peek(&self) -> Option<&Job> {
        self.heap.peek().map(|q| &q.0)
    }

    /// Remove a specific job.
    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        let (mut hit, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.heap).into_iter().partition(|q| q.0.id == id);
        self.heap = rest.into();
        hit.pop().map(|q| q.0)
    }

    /// Remove every job that has been queued for at least `max_wait`.
    pub fn take_expired(&mut self, max_wait: Duration, now: Instant) -> Vec<Job> {
        let (expired, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.heap).into_iter().partition(|q| {
                q.0.queued_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= max_wait)
            });
        self.heap = rest.into();
        expired.into_iter().map(|q| q.0).collect()
    }

    /// Empty the queue, highest priority first.
    pub fn drain(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.heap)
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|q| q.0)
            .collect()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.heap.iter().any(|q| q.0.id == id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
