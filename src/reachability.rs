use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::runtime;

pub type ReachabilityCallback = Arc<dyn Fn(bool) + Send + Sync + 'static>;
pub type Unsubscribe = Box<dyn FnOnce() + Send + 'static>;

/// Reports whether the network is currently usable and notifies a single subscriber of
/// transitions (spec §4.2: publishes reachable/unreachable events; §4.6: the manager globally
/// pauses in-flight transfers when the network becomes unreachable and resumes them when it
/// returns).
#[async_trait]
pub trait ReachabilityMonitor: Send + Sync {
    fn is_reachable(&self) -> bool;

    /// Registers `callback` to be invoked on every reachability transition. Only one
    /// subscriber is supported at a time, matching the manager's single-subscriber use;
    /// subscribing again replaces the previous callback.
    fn subscribe(&self, callback: ReachabilityCallback) -> Unsubscribe;
}

struct Shared {
    reachable: AtomicBool,
    callback: Mutex<Option<ReachabilityCallback>>,
}

/// Polls an injected probe on a fixed interval and coalesces consecutive identical reports so
/// the subscriber only ever sees actual transitions, not every poll tick.
pub struct PollingReachabilityMonitor {
    shared: Arc<Shared>,
}

impl PollingReachabilityMonitor {
    pub fn spawn<F>(poll_interval: Duration, probe: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            reachable: AtomicBool::new(true),
            callback: Mutex::new(None),
        });

        let loop_shared = Arc::clone(&shared);
        runtime::spawn_detached(async move {
            loop {
                runtime::sleep(poll_interval).await;
                let observed = probe();
                let previous = loop_shared.reachable.swap(observed, Ordering::SeqCst);
                if previous != observed {
                    let callback = loop_shared.callback.lock().await.clone();
                    if let Some(callback) = callback {
                        callback(observed);
                    }
                }
            }
        });

        Self { shared }
    }
}

#[async_trait]
impl ReachabilityMonitor for PollingReachabilityMonitor {
    fn is_reachable(&self) -> bool {
        self.shared.reachable.load(Ordering::SeqCst)
    }

    fn subscribe(&self, callback: ReachabilityCallback) -> Unsubscribe {
        let shared = Arc::clone(&self.shared);
        let shared_for_set = Arc::clone(&shared);
        tokio::spawn(async move {
            *shared_for_set.callback.lock().await = Some(callback);
        });

        Box::new(move || {
            tokio::spawn(async move {
                *shared.callback.lock().await = None;
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn subscriber_sees_transitions() {
        let observed = Arc::new(AtomicBool::new(true));
        let probe_value = Arc::clone(&observed);

        let monitor = PollingReachabilityMonitor::spawn(Duration::from_millis(5), move || {
            probe_value.load(Ordering::SeqCst)
        });

        let transitions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&transitions);
        monitor.subscribe(Arc::new(move |_reachable| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        observed.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(transitions.load(Ordering::SeqCst) >= 1);
        assert!(!monitor.is_reachable());
    }
}
