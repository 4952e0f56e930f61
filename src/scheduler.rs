//! Deferred rule action scheduler
//!
//! Rule actions may request side effects to run after a delay. The scheduler
//! wraps tokio timers and tracks every in-flight handle per deployment so a
//! stopped or superseded deployment never leaks timers.
//!
//! Two critical sections exist per deployment key:
//! - the scheduled-action registry (insert on schedule, remove on fire or
//!   cancel), guarded by the registry map entry
//! - the act of firing, guarded by a per-key async mutex shared with
//!   cancellation, so firing and cancel never interleave on one handle
//!
//! A firing task removes its own handle from the registry before invoking
//! the action, so reentrant scheduling from inside the action is not double
//! counted. A firing already past that removal is allowed to complete even
//! when a cancellation races it.

use crate::error::Result;
use crate::types::Clock;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A deferred, side-effecting rule action
pub type ScheduledAction = Box<dyn FnOnce() -> Result<()> + Send>;

/// Handle of one scheduled action
struct ScheduledRuleAction {
    seq: u64,
    fire_at_millis: i64,
    handle: JoinHandle<()>,
}

/// Scheduler for deferred rule actions, shared across all deployments
pub struct RuleActionScheduler {
    clock: Arc<dyn Clock>,
    tasks: Arc<DashMap<String, Vec<ScheduledRuleAction>>>,
    fire_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    seq: AtomicU64,
}

impl RuleActionScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tasks: Arc::new(DashMap::new()),
            fire_locks: Arc::new(DashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Schedule `action` to run exactly once after `delay_millis`
    ///
    /// The handle is owned by the deployment identified by `deployment_key`
    /// and is cancelled by [`RuleActionScheduler::stop`]. An `Err` returned
    /// by the action is logged at the firing boundary and does not affect
    /// other pending handles.
    pub fn schedule(&self, deployment_key: &str, action: ScheduledAction, delay_millis: u64) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let fire_at_millis = self.clock.now_millis() + delay_millis as i64;
        let fire_lock = self.fire_lock(deployment_key);
        let tasks = Arc::clone(&self.tasks);
        let key = deployment_key.to_string();

        debug!(
            "Scheduling rule action for {} in {}ms (seq {})",
            deployment_key,
            delay_millis,
            seq
        );

        // Hold the registry entry across spawn so the timer task cannot
        // observe the registry before its own handle is inserted.
        let mut entry = self.tasks.entry(deployment_key.to_string()).or_default();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_millis)).await;
            let _firing = fire_lock.lock().await;

            // Remove our own handle before invoking the action; reentrant
            // scheduling from inside the action must not double count.
            let armed = match tasks.get_mut(&key) {
                Some(mut pending) => {
                    let before = pending.len();
                    pending.retain(|t| t.seq != seq);
                    before != pending.len()
                },
                None => false,
            };

            if !armed {
                // Cancelled while we waited for the firing lock
                return;
            }

            if let Err(e) = action() {
                error!("Scheduled rule action for {} failed: {}", key, e);
            }
        });

        entry.push(ScheduledRuleAction {
            seq,
            fire_at_millis,
            handle,
        });
    }

    /// Cancel every outstanding scheduled action of a deployment
    ///
    /// Holds the firing lock, so a concurrent firing either completes first
    /// or never runs its action.
    pub async fn stop(&self, deployment_key: &str) {
        let lock = self.fire_lock(deployment_key);
        let _guard = lock.lock().await;

        if let Some((_, pending)) = self.tasks.remove(deployment_key) {
            let count = pending.len();
            for task in pending {
                task.handle.abort();
            }
            if count > 0 {
                info!(
                    "Cancelled {} scheduled rule actions for {}",
                    count,
                    deployment_key
                );
            }
        }

        self.fire_locks.remove(deployment_key);
    }

    /// Number of scheduled actions currently pending for a deployment
    pub fn pending_count(&self, deployment_key: &str) -> usize {
        self.tasks
            .get(deployment_key)
            .map(|pending| pending.len())
            .unwrap_or(0)
    }

    /// Earliest target fire time (epoch millis) among pending actions
    pub fn next_fire_at_millis(&self, deployment_key: &str) -> Option<i64> {
        self.tasks
            .get(deployment_key)
            .and_then(|pending| pending.iter().map(|t| t.fire_at_millis).min())
    }

    fn fire_lock(&self, deployment_key: &str) -> Arc<Mutex<()>> {
        self.fire_locks
            .entry(deployment_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
