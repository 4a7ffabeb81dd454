//! Deduplicating work queue
//!
//! Reconcile requests are keyed by definition identity. A request for an
//! identity that is already queued collapses into the pending one; a request
//! for an identity that a worker is processing marks it dirty, and it is
//! queued again once the worker releases its [`Lease`]. At most one worker
//! holds a given identity at any time.

use crate::crd::DefinitionId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct Entry {
    queued: bool,
    in_flight: bool,
    dirty: bool,
    /// Deadline of the pending delayed requeue, if any
    retry_at: Option<tokio::time::Instant>,
}

impl Entry {
    fn is_idle(&self) -> bool {
        !self.queued && !self.in_flight && !self.dirty && self.retry_at.is_none()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<DefinitionId, Entry>,
    ready: VecDeque<DefinitionId>,
    shutdown: bool,
}

impl QueueState {
    fn enqueue(&mut self, id: DefinitionId) -> bool {
        if self.shutdown {
            return false;
        }
        let entry = self.entries.entry(id.clone()).or_default();
        if entry.in_flight {
            entry.dirty = true;
            false
        } else if entry.queued {
            false
        } else {
            entry.queued = true;
            self.ready.push_back(id);
            true
        }
    }

    fn prune(&mut self, id: &DefinitionId) {
        if self.entries.get(id).is_some_and(Entry::is_idle) {
            self.entries.remove(id);
        }
    }
}

/// Shared queue of reconcile requests
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // the state stays consistent across a panicking holder
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request a reconcile of `id`
    pub fn enqueue(&self, id: DefinitionId) {
        let added = self.lock().enqueue(id);
        if added {
            self.notify.notify_one();
        }
    }

    /// Request a reconcile of `id` after `delay`
    ///
    /// Of several delayed requests for one identity only the earliest is kept.
    pub fn enqueue_after(self: &Arc<Self>, id: DefinitionId, delay: Duration) {
        let deadline = tokio::time::Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            let entry = state.entries.entry(id.clone()).or_default();
            match entry.retry_at {
                Some(existing) if existing <= deadline => return,
                _ => entry.retry_at = Some(deadline),
            }
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let added = {
                let mut state = queue.lock();
                let Some(entry) = state.entries.get_mut(&id) else {
                    return;
                };
                // superseded by an earlier deadline
                if entry.retry_at != Some(deadline) {
                    return;
                }
                entry.retry_at = None;
                state.enqueue(id)
            };
            if added {
                queue.notify.notify_one();
            }
        });
    }

    /// Wait for the next request, `None` once the queue is shut down
    pub async fn next(self: &Arc<Self>) -> Option<Lease> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(id) = state.ready.pop_front() {
                    if let Some(entry) = state.entries.get_mut(&id) {
                        entry.queued = false;
                        entry.in_flight = true;
                    }
                    let more = !state.ready.is_empty();
                    drop(state);
                    // pass the wakeup on so idle workers drain the backlog
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(Lease {
                        queue: Arc::clone(self),
                        id,
                    });
                }
            }

            notified.await;
        }
    }

    /// Stop handing out work and wake every waiting worker
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Number of requests waiting for a worker
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn finish(&self, id: &DefinitionId) {
        let requeue = {
            let mut state = self.lock();
            let dirty = match state.entries.get_mut(id) {
                Some(entry) => {
                    entry.in_flight = false;
                    std::mem::take(&mut entry.dirty)
                }
                None => false,
            };
            let requeued = dirty && state.enqueue(id.clone());
            state.prune(id);
            requeued
        };
        if requeue {
            debug!(definition = %id, "Requeued after concurrent change");
            self.notify.notify_one();
        }
    }
}

/// Exclusive claim on one definition identity
///
/// Dropping the lease releases the identity; if a request arrived meanwhile
/// it is queued again.
#[derive(Debug)]
pub struct Lease {
    queue: Arc<WorkQueue>,
    id: DefinitionId,
}

impl Lease {
    pub fn id(&self) -> &DefinitionId {
        &self.id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.queue.finish(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> DefinitionId {
        DefinitionId::cluster(name)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_duplicate_requests_coalesce() {
        let queue = WorkQueue::new();
        queue.enqueue(id("a"));
        queue.enqueue(id("a"));
        queue.enqueue(id("b"));
        assert_eq!(queue.len(), 2);

        let first = queue.next().await.unwrap();
        assert_eq!(first.id(), &id("a"));
        let second = queue.next().await.unwrap();
        assert_eq!(second.id(), &id("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_identity_is_not_handed_out_twice() {
        let queue = WorkQueue::new();
        queue.enqueue(id("a"));
        let lease = queue.next().await.unwrap();

        // arrives while a worker holds the identity
        queue.enqueue(id("a"));
        queue.enqueue(id("a"));
        assert!(queue.is_empty());

        drop(lease);
        assert_eq!(queue.len(), 1);
        let again = queue.next().await.unwrap();
        assert_eq!(again.id(), &id("a"));
        drop(again);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_waiting_worker_is_woken() {
        let queue = WorkQueue::new();
        let worker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await.map(|l| l.id().clone()) })
        };
        tokio::task::yield_now().await;
        queue.enqueue(id("a"));
        assert_eq!(worker.await.unwrap(), Some(id("a")));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = WorkQueue::new();
        let worker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await.is_none() })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert!(worker.await.unwrap());

        queue.enqueue(id("a"));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_after_keeps_earliest_deadline() {
        let queue = WorkQueue::new();
        queue.enqueue_after(id("a"), Duration::from_secs(30));
        queue.enqueue_after(id("a"), Duration::from_secs(5));
        queue.enqueue_after(id("a"), Duration::from_secs(60));
        settle().await;

        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(queue.len(), 1);
        drop(queue.next().await.unwrap());

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(queue.is_empty());
    }
}
