//! FIFO admission queue with a global concurrency cap.
//!
//! All queue state (waiting ids, running ids, the cap) sits behind one lock,
//! separate from any per-execution lock, so the admission check and the
//! running-count increment happen at a single point of mutation.

use std::collections::{HashSet, VecDeque};

use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

#[derive(Debug)]
struct QueueState {
    waiting: VecDeque<Uuid>,
    running: HashSet<Uuid>,
    max_concurrent: usize,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub waiting: Vec<Uuid>,
    pub running: usize,
    pub max_concurrent: usize,
}

/// Bounded-concurrency FIFO of execution ids awaiting admission.
#[derive(Debug)]
pub struct ExecutionQueue {
    state: Mutex<QueueState>,
    wakeup: Notify,
}

impl ExecutionQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                waiting: VecDeque::new(),
                running: HashSet::new(),
                max_concurrent: max_concurrent.max(1),
            }),
            wakeup: Notify::new(),
        }
    }

    /// Append `id` to the back of the queue. Returns `false` if the id is
    /// already waiting or running.
    pub async fn enqueue(&self, id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        if state.running.contains(&id) || state.waiting.contains(&id) {
            return false;
        }
        state.waiting.push_back(id);
        drop(state);
        self.wakeup.notify_one();
        true
    }

    /// Admit the oldest waiting id if a slot is free, marking it running.
    pub async fn try_admit(&self) -> Option<Uuid> {
        let mut state = self.state.lock().await;
        if state.running.len() >= state.max_concurrent {
            return None;
        }
        let id = state.waiting.pop_front()?;
        state.running.insert(id);
        Some(id)
    }

    /// Free the slot held by `id`. Returns `false` if it was not running.
    pub async fn release(&self, id: Uuid) -> bool {
        let released = self.state.lock().await.running.remove(&id);
        if released {
            self.wakeup.notify_one();
        }
        released
    }

    /// Drop `id` from the waiting list. Returns `false` if it was not waiting.
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        match state.waiting.iter().position(|w| *w == id) {
            Some(pos) => {
                state.waiting.remove(pos);
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        QueueSnapshot {
            waiting: state.waiting.iter().copied().collect(),
            running: state.running.len(),
            max_concurrent: state.max_concurrent,
        }
    }

    /// Resolves after the next `enqueue` or `release` (or immediately if one
    /// happened since the last wait).
    pub async fn changed(&self) {
        self.wakeup.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::now_v7()).collect()
    }

    #[tokio::test]
    async fn test_admits_in_fifo_order_up_to_cap() {
        let queue = ExecutionQueue::new(2);
        let ids = ids(3);
        for id in &ids {
            assert!(queue.enqueue(*id).await);
        }

        assert_eq!(queue.try_admit().await, Some(ids[0]));
        assert_eq!(queue.try_admit().await, Some(ids[1]));
        assert_eq!(queue.try_admit().await, None, "cap reached");

        assert!(queue.release(ids[0]).await);
        assert_eq!(queue.try_admit().await, Some(ids[2]));
        assert_eq!(queue.try_admit().await, None, "queue drained");
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_rejected() {
        let queue = ExecutionQueue::new(1);
        let id = Uuid::now_v7();
        assert!(queue.enqueue(id).await);
        assert!(!queue.enqueue(id).await, "already waiting");

        assert_eq!(queue.try_admit().await, Some(id));
        assert!(!queue.enqueue(id).await, "already running");
        assert!(queue.snapshot().await.waiting.is_empty());
    }

    #[tokio::test]
    async fn test_remove_waiting() {
        let queue = ExecutionQueue::new(1);
        let ids = ids(2);
        queue.enqueue(ids[0]).await;
        queue.enqueue(ids[1]).await;

        assert!(queue.remove(ids[0]).await);
        assert!(!queue.remove(ids[0]).await);
        assert_eq!(queue.try_admit().await, Some(ids[1]));
    }

    #[tokio::test]
    async fn test_release_unknown_is_false() {
        let queue = ExecutionQueue::new(1);
        assert!(!queue.release(Uuid::now_v7()).await);
    }

    #[tokio::test]
    async fn test_zero_cap_is_clamped() {
        let queue = ExecutionQueue::new(0);
        let id = Uuid::now_v7();
        queue.enqueue(id).await;
        assert_eq!(queue.try_admit().await, Some(id));
        assert_eq!(queue.snapshot().await.max_concurrent, 1);
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiter() {
        let queue = std::sync::Arc::new(ExecutionQueue::new(1));
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.changed().await })
        };
        queue.enqueue(Uuid::now_v7()).await;
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_admission_never_exceeds_cap() {
        let queue = std::sync::Arc::new(ExecutionQueue::new(3));
        for id in ids(50) {
            queue.enqueue(id).await;
        }

        let mut handles = Vec::new();
        for _ in 0..20 {
            let queue = std::sync::Arc::clone(&queue);
            handles.push(tokio::spawn(async move { queue.try_admit().await }));
        }
        let mut admitted = Vec::new();
        for h in handles {
            if let Some(id) = h.await.unwrap() {
                admitted.push(id);
            }
        }
        assert_eq!(admitted.len(), 3);
        assert_eq!(queue.snapshot().await.running, 3);
    }
}
