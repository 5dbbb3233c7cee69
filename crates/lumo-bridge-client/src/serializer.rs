//! The generation serializer: at most one in-flight backend generation.
//!
//! The backend is stateful and rate-sensitive, and every generation owns a
//! per-request encryption key plus detector state; interleaving two streams
//! would entangle both. All generations therefore pass through one
//! process-wide serializer with FIFO ordering.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, watch};

/// FIFO, concurrency-1 execution slot for backend generations.
///
/// Ordering relies on tokio's fair [`Mutex`]: waiters acquire the slot in
/// arrival order. Dropping a waiting or running caller (client disconnect)
/// releases its place immediately; counts are maintained through drop
/// guards so cancellation cannot leak a slot.
#[derive(Debug)]
pub struct GenerationSerializer {
    slot: Mutex<()>,
    pending: AtomicUsize,
    in_flight: AtomicUsize,
    occupancy: watch::Sender<usize>,
}

impl Default for GenerationSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationSerializer {
    /// Creates an idle serializer.
    #[must_use]
    pub fn new() -> Self {
        let (occupancy, _) = watch::channel(0);
        Self {
            slot: Mutex::new(()),
            pending: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            occupancy,
        }
    }

    /// Runs `task` once the slot is free, preserving submission order.
    ///
    /// The future is not polled until the slot is acquired, so a task
    /// cannot start before its predecessor completed. Cancelling the
    /// returned future while waiting gives up the queue position; while
    /// running it cancels `task` at its next suspension point.
    pub async fn run<F>(&self, task: F) -> F::Output
    where
        F: Future,
    {
        let mut entry = Entry::enqueue(self);
        let _guard = self.slot.lock().await;
        entry.promote();
        task.await
    }

    /// Tasks waiting for the slot.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Tasks currently holding the slot (0 or 1).
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Total occupancy: waiting plus running.
    #[must_use]
    pub fn size(&self) -> usize {
        self.pending() + self.in_flight()
    }

    /// Resolves once no task is waiting or running.
    pub async fn wait_idle(&self) {
        let mut rx = self.occupancy.subscribe();
        // Ignore a closed channel: the serializer outlives the wait in
        // practice, and a dropped sender means nothing will ever run again.
        let _ = rx.wait_for(|&occupancy| occupancy == 0).await;
    }

    fn publish(&self) {
        let total = self.pending() + self.in_flight();
        let _ = self.occupancy.send_replace(total);
    }
}

/// Count bookkeeping that survives cancellation at any await point.
struct Entry<'a> {
    serializer: &'a GenerationSerializer,
    running: bool,
}

impl<'a> Entry<'a> {
    fn enqueue(serializer: &'a GenerationSerializer) -> Self {
        serializer.pending.fetch_add(1, Ordering::SeqCst);
        serializer.publish();
        Self {
            serializer,
            running: false,
        }
    }

    fn promote(&mut self) {
        self.serializer.pending.fetch_sub(1, Ordering::SeqCst);
        self.serializer.in_flight.fetch_add(1, Ordering::SeqCst);
        self.running = true;
        self.serializer.publish();
    }
}

impl Drop for Entry<'_> {
    fn drop(&mut self) {
        if self.running {
            self.serializer.in_flight.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.serializer.pending.fetch_sub(1, Ordering::SeqCst);
        }
        self.serializer.publish();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test]
    async fn tasks_run_strictly_in_submission_order() {
        let serializer = Arc::new(GenerationSerializer::new());
        let log = Arc::new(AsyncMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 1..=3 {
            let serializer = Arc::clone(&serializer);
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                serializer
                    .run(async {
                        log.lock().await.push(format!("start{i}"));
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        log.lock().await.push(format!("end{i}"));
                    })
                    .await;
            }));
            // Give each submission time to reach the queue so arrival
            // order is deterministic.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let observed = log.lock().await.clone();
        assert_eq!(
            observed,
            vec!["start1", "end1", "start2", "end2", "start3", "end3"]
        );
    }

    #[tokio::test]
    async fn counts_track_queue_and_slot() {
        let serializer = Arc::new(GenerationSerializer::new());
        assert_eq!(serializer.size(), 0);

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let first = {
            let serializer = Arc::clone(&serializer);
            tokio::spawn(async move {
                serializer
                    .run(async {
                        let _ = release_rx.await;
                    })
                    .await;
            })
        };

        // Wait for the first task to take the slot.
        tokio::time::timeout(Duration::from_secs(1), async {
            while serializer.in_flight() != 1 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        let second = {
            let serializer = Arc::clone(&serializer);
            tokio::spawn(async move {
                serializer.run(async {}).await;
            })
        };

        tokio::time::timeout(Duration::from_secs(1), async {
            while serializer.pending() != 1 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(serializer.size(), 2);

        release_tx.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(serializer.size(), 0);
    }

    #[tokio::test]
    async fn wait_idle_resolves_after_all_tasks() {
        let serializer = Arc::new(GenerationSerializer::new());

        let worker = {
            let serializer = Arc::clone(&serializer);
            tokio::spawn(async move {
                serializer
                    .run(async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    })
                    .await;
            })
        };

        // Let the task enter the queue first.
        tokio::time::sleep(Duration::from_millis(5)).await;
        serializer.wait_idle().await;
        assert_eq!(serializer.size(), 0);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_waiter_releases_its_place() {
        let serializer = Arc::new(GenerationSerializer::new());

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let holder = {
            let serializer = Arc::clone(&serializer);
            tokio::spawn(async move {
                serializer
                    .run(async {
                        let _ = release_rx.await;
                    })
                    .await;
            })
        };

        tokio::time::timeout(Duration::from_secs(1), async {
            while serializer.in_flight() != 1 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        // A waiter that gets aborted mid-queue must not leak a count.
        let waiter = {
            let serializer = Arc::clone(&serializer);
            tokio::spawn(async move {
                serializer.run(async {}).await;
            })
        };
        tokio::time::timeout(Duration::from_secs(1), async {
            while serializer.pending() != 1 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        waiter.abort();
        let _ = waiter.await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while serializer.pending() != 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        release_tx.send(()).unwrap();
        holder.await.unwrap();
        assert_eq!(serializer.size(), 0);
    }

    #[tokio::test]
    async fn returns_task_output() {
        let serializer = GenerationSerializer::new();
        let value = serializer.run(async { 21 * 2 }).await;
        assert_eq!(value, 42);
    }
}
