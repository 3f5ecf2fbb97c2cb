//! Bounded work queue with path-based deduplication.
//!
//! One queue feeds the whole process. Enqueueing a path that is already
//! pending replaces its payload instead of adding a second entry, so a
//! burst of saves for one note collapses into a single job. Producers
//! block only when the queue is full; `try_enqueue` fails fast instead.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tokio::sync::Notify;

use crate::error::NotebitErr;
use crate::error::Result;

/// Options carried with an indexing job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOptions {
    /// Bypass the needs-indexing skip test.
    pub force_reindex: bool,
    /// Create or update the file row only, no chunking or embedding.
    pub metadata_only: bool,
}

/// What to do for a path.
#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    /// Make `(path, content)` consistent in the index.
    Upsert {
        content: String,
        mtime: i64,
        size: i64,
    },
    /// Remove the path from the index.
    Remove,
}

/// A unit of indexing work.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexJob {
    pub kind: JobKind,
    pub options: IndexOptions,
    /// Whether this job counts toward the scan progress record.
    pub record_progress: bool,
}

impl IndexJob {
    pub fn upsert(content: impl Into<String>, mtime: i64, size: i64) -> Self {
        Self {
            kind: JobKind::Upsert {
                content: content.into(),
                mtime,
                size,
            },
            options: IndexOptions::default(),
            record_progress: false,
        }
    }

    pub fn remove() -> Self {
        Self {
            kind: JobKind::Remove,
            options: IndexOptions::default(),
            record_progress: false,
        }
    }

    pub fn with_options(mut self, options: IndexOptions) -> Self {
        self.options = options;
        self
    }
}

/// Merge a newer job into a pending one for the same path.
///
/// The newer payload wins; force flags accumulate so a forced job is never
/// downgraded by a later plain save.
fn merge_jobs(pending: &IndexJob, newer: &IndexJob) -> IndexJob {
    let mut merged = newer.clone();
    merged.options.force_reindex |= pending.options.force_reindex;
    merged.record_progress |= pending.record_progress;
    // A metadata-only job coalescing with a full job stays full.
    merged.options.metadata_only &= pending.options.metadata_only;
    merged
}

struct QueueInner {
    /// FIFO of pending paths.
    order: VecDeque<String>,
    /// Pending payload per path.
    pending: HashMap<String, IndexJob>,
}

/// The process-wide indexing queue.
pub struct IndexQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    /// Wakes workers when a job arrives.
    wake: broadcast::Sender<()>,
    /// Wakes producers waiting for capacity.
    space: Notify,
}

impl IndexQueue {
    pub fn new(capacity: usize) -> Self {
        let (wake, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Mutex::new(QueueInner {
                order: VecDeque::new(),
                pending: HashMap::new(),
            }),
            capacity: capacity.max(1),
            wake,
            space: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue without blocking. Coalesces into a pending entry for the
    /// same path; otherwise fails with `QueueFull` at capacity.
    pub fn try_enqueue(&self, path: &str, job: IndexJob) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(pending) = inner.pending.get(path) {
                let merged = merge_jobs(pending, &job);
                inner.pending.insert(path.to_string(), merged);
            } else {
                if inner.order.len() >= self.capacity {
                    return Err(NotebitErr::QueueFull {
                        capacity: self.capacity,
                    });
                }
                inner.order.push_back(path.to_string());
                inner.pending.insert(path.to_string(), job);
            }
        }
        let _ = self.wake.send(());
        Ok(())
    }

    /// Enqueue, waiting for capacity when the queue is full.
    pub async fn enqueue(&self, path: &str, job: IndexJob) {
        loop {
            match self.try_enqueue(path, job.clone()) {
                Ok(()) => return,
                Err(NotebitErr::QueueFull { .. }) => {
                    self.space.notified().await;
                }
                Err(_) => unreachable!("try_enqueue only fails with QueueFull"),
            }
        }
    }

    /// Pop the oldest pending job.
    pub fn pop(&self) -> Option<(String, IndexJob)> {
        let popped = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let path = inner.order.pop_front()?;
            let job = inner.pending.remove(&path)?;
            Some((path, job))
        };
        self.space.notify_one();
        popped
    }

    /// Subscribe to job-arrival notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.wake.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all pending jobs.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.order.clear();
        inner.pending.clear();
        self.space.notify_waiters();
    }
}
