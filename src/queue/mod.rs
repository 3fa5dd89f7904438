use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::error::TransferResult;

/// One schedulable unit of work: a probe, a single block transfer, or a finalize/commit step
/// (spec §4.5: "work units may declare dependencies on other work units; a unit only becomes
/// eligible once all of its dependencies have completed successfully").
#[async_trait]
pub trait WorkUnit: Send + Sync {
    fn id(&self) -> &str;

    fn depends_on(&self) -> &[String];

    async fn execute(&self) -> TransferResult<()>;
}

pub type CompletionCallback =
    Arc<dyn Fn(&str, TransferResult<()>) + Send + Sync + 'static>;

struct Inner {
    pending: VecDeque<Arc<dyn WorkUnit>>,
    completed: HashSet<String>,
    in_flight: Vec<(String, JoinHandle<()>)>,
}

/// Bounded-concurrency scheduler for a single blob's decomposed work units. Units run as soon
/// as their dependencies are satisfied and a concurrency permit is free; `max_concurrent`
/// bounds how many units run at once (spec §4.3/§4.5).
pub struct WorkQueue {
    semaphore: Arc<Semaphore>,
    inner: Mutex<Inner>,
    on_complete: CompletionCallback,
}

impl WorkQueue {
    pub fn new(max_concurrent: usize, on_complete: CompletionCallback) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                completed: HashSet::new(),
                in_flight: Vec::new(),
            }),
            on_complete,
        }
    }

    pub async fn add(&self, unit: Arc<dyn WorkUnit>) {
        self.inner.lock().await.pending.push_back(unit);
    }

    /// Marks `id` as already satisfied without ever scheduling a unit for it — used when a
    /// resumed transfer's already-`Complete` blocks were filtered out of the unit list entirely,
    /// so a dependent (the finalize unit) must still see them as done (spec §4.2/§4.5 resume).
    pub async fn mark_completed(&self, id: impl Into<String>) {
        self.inner.lock().await.completed.insert(id.into());
    }

    /// Drains every unit whose dependencies are already satisfied and a permit is available,
    /// spawning each as an independent task. Call this after `add` and after every completion.
    pub async fn drain_ready(self: &Arc<Self>) {
        loop {
            let unit = {
                let mut inner = self.inner.lock().await;
                let ready_index = inner.pending.iter().position(|unit| {
                    unit.depends_on()
                        .iter()
                        .all(|dep| inner.completed.contains(dep))
                });
                match ready_index {
                    Some(index) => inner.pending.remove(index),
                    None => None,
                }
            };

            let Some(unit) = unit else { break };

            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.inner.lock().await.pending.push_front(unit);
                    break;
                }
            };

            let queue = Arc::clone(self);
            let unit_id = unit.id().to_string();
            let handle = tokio::spawn(async move {
                let result = unit.execute().await;
                let _permit = permit;
                {
                    let mut inner = queue.inner.lock().await;
                    if result.is_ok() {
                        inner.completed.insert(unit_id.clone());
                    }
                    inner.in_flight.retain(|(id, _)| id != &unit_id);
                }
                (queue.on_complete)(&unit_id, result);
            });

            self.inner
                .lock()
                .await
                .in_flight
                .push((unit.id().to_string(), handle));
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    /// Cancels every pending and in-flight unit, in reverse submission order so that a unit
    /// already past its dependency check can't complete after one it depends on was cancelled.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.pending.clear();
        for (_, handle) in inner.in_flight.drain(..).rev() {
            handle.abort();
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.try_lock() {
            for (_, handle) in inner.in_flight.drain(..).rev() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct RecordingUnit {
        id: String,
        depends_on: Vec<String>,
        order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl WorkUnit for RecordingUnit {
        fn id(&self) -> &str {
            &self.id
        }

        fn depends_on(&self) -> &[String] {
            &self.depends_on
        }

        async fn execute(&self) -> TransferResult<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.order.lock().await.push(self.id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_dependents_after_dependencies() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicUsize::new(0));
        let completed_counter = Arc::clone(&completed);

        let queue = Arc::new(WorkQueue::new(
            2,
            Arc::new(move |_id, _result| {
                completed_counter.fetch_add(1, Ordering::SeqCst);
            }),
        ));

        queue
            .add(Arc::new(RecordingUnit {
                id: "a".to_string(),
                depends_on: vec![],
                order: Arc::clone(&order),
            }))
            .await;
        queue
            .add(Arc::new(RecordingUnit {
                id: "b".to_string(),
                depends_on: vec!["a".to_string()],
                order: Arc::clone(&order),
            }))
            .await;

        queue.drain_ready().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.drain_ready().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let finished = order.lock().await.clone();
        assert_eq!(finished, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(completed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn respects_max_concurrency() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(WorkQueue::new(1, Arc::new(|_id, _result| {})));

        for id in ["x", "y"] {
            queue
                .add(Arc::new(RecordingUnit {
                    id: id.to_string(),
                    depends_on: vec![],
                    order: Arc::clone(&order),
                }))
                .await;
        }

        queue.drain_ready().await;
        assert!(queue.pending_count().await <= 1);
    }
}
