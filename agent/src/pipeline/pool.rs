//! The data-collector pool (`spec.md` §4.3 "submit to a serialized pool
//! keyed by SNMP target GUID ... For local/Modbus items, submit to the
//! general pool.", §5 "small worker pool sized between min/max").
//!
//! No crate in the pack provides "N-wide concurrent pool, plus
//! serialize-by-key on top" as one primitive, so this is built directly on
//! `tokio::task::JoinSet` (for fire-and-forget task ownership) and a
//! `DashMap<key, Mutex<VecDeque<task>>>` for the per-key queues.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

type CollectTask = Pin<Box<dyn Future<Output = ()> + Send>>;

struct SerializedQueue {
    pending: VecDeque<CollectTask>,
    running: bool,
}

/// Bounds the general pool's concurrency and serializes submissions that
/// share a key (an SNMP target GUID), so the same target is never polled
/// by two tasks at once.
pub struct CollectorPool {
    general_permits: Arc<Semaphore>,
    serialized: Arc<DashMap<Uuid, Mutex<SerializedQueue>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl CollectorPool {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            general_permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            serialized: Arc::new(DashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// The general pool: bounded concurrency, no ordering between items.
    pub fn submit_general<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.general_permits.clone();
        self.tasks.lock().unwrap().spawn(async move {
            let _permit = permits.acquire_owned().await;
            fut.await;
        });
    }

    /// The serialized-by-key pool: tasks sharing `key` run strictly one
    /// after another, in submission order; different keys run concurrently
    /// (subject to the same `tasks` JoinSet, unbounded across keys).
    pub fn submit_serialized<F>(&self, key: Uuid, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let boxed: CollectTask = Box::pin(fut);
        let entry = self
            .serialized
            .entry(key)
            .or_insert_with(|| {
                Mutex::new(SerializedQueue {
                    pending: VecDeque::new(),
                    running: false,
                })
            });
        let should_spawn = {
            let mut queue = entry.lock().unwrap();
            queue.pending.push_back(boxed);
            if queue.running {
                false
            } else {
                queue.running = true;
                true
            }
        };
        drop(entry);

        if should_spawn {
            let serialized = self.serialized.clone();
            self.tasks.lock().unwrap().spawn(async move {
                loop {
                    let next = {
                        let Some(entry) = serialized.get(&key) else {
                            break;
                        };
                        let mut queue = entry.lock().unwrap();
                        match queue.pending.pop_front() {
                            Some(task) => Some(task),
                            None => {
                                queue.running = false;
                                None
                            }
                        }
                    };
                    match next {
                        Some(task) => task.await,
                        None => break,
                    }
                }
            });
        }
    }

    /// Aborts every outstanding task (supervisor shutdown, `spec.md` §4.7).
    pub fn shutdown(&self) {
        self.tasks.lock().unwrap().abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn serialized_tasks_for_the_same_key_run_in_order() {
        let pool = CollectorPool::new(8);
        let order = Arc::new(Mutex::new(Vec::new()));
        let key = Uuid::new_v4();

        for i in 0..5 {
            let order = order.clone();
            pool.submit_serialized(key, async move {
                tokio::time::sleep(Duration::from_millis(5 - i as u64)).await;
                order.lock().unwrap().push(i);
            });
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn general_pool_runs_submitted_work() {
        let pool = CollectorPool::new(2);
        let done = Arc::new(AtomicU32::new(0));
        for _ in 0..4 {
            let done = done.clone();
            pool.submit_general(async move {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }
}
