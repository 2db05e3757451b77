//! Keepalive scheduler and the per-session task group.
//!
//! The scheduler ticks immediately, then once per interval, up to a fixed
//! budget. Each tick goes through a [`KeepaliveTarget`], which checks under
//! the endpoint lock that the session is still the same one and still
//! connected before publishing. The scheduler only holds a weak reference to
//! the target, so a dropped endpoint ends it as well.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::EndpointError;
use crate::rtc_config::DEFAULT_KEEPALIVE_INTERVAL;

/// Tick budget per session.
pub const DEFAULT_MAX_TICKS: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepaliveSettings {
    /// Used when the session configuration carries no interval
    pub default_interval: Duration,
    pub max_ticks: u32,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            default_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_ticks: DEFAULT_MAX_TICKS,
        }
    }
}

/// What a tick found when it looked at the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Both keepalives were published
    Sent,
    /// The session is closed
    Closed,
    /// Another session replaced it
    Replaced,
    /// The session exists but is not connected
    NotConnected,
}

/// Why the scheduler stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeepaliveExit {
    BudgetExhausted,
    SessionClosed,
    SessionReplaced,
    NotConnected,
    Cancelled,
    EndpointDropped,
    PublishFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepaliveReport {
    pub ticks_sent: u32,
    pub exit: KeepaliveExit,
}

/// Something that can send one keepalive tick for a session.
#[async_trait]
pub trait KeepaliveTarget: Send + Sync {
    async fn tick(&self, session_id: &str, sequence: u64) -> Result<TickOutcome, EndpointError>;
}

/// Run the scheduler until the budget is spent, the session goes away, or
/// `cancel` fires.
pub async fn run_keepalive<T>(
    target: Weak<T>,
    session_id: String,
    interval: Duration,
    max_ticks: u32,
    mut cancel: watch::Receiver<bool>,
) -> KeepaliveReport
where
    T: KeepaliveTarget + ?Sized,
{
    info!(session_id = %session_id, interval_ms = interval.as_millis() as u64, max_ticks, "keepalive started");

    let mut ticks_sent = 0;
    let mut exit = KeepaliveExit::BudgetExhausted;

    for sequence in 1..=u64::from(max_ticks) {
        if *cancel.borrow() {
            exit = KeepaliveExit::Cancelled;
            break;
        }

        let Some(target) = target.upgrade() else {
            exit = KeepaliveExit::EndpointDropped;
            break;
        };
        match target.tick(&session_id, sequence).await {
            Ok(TickOutcome::Sent) => {
                ticks_sent += 1;
                debug!(session_id = %session_id, sequence, "keepalive tick");
            }
            Ok(TickOutcome::Closed) => {
                exit = KeepaliveExit::SessionClosed;
                break;
            }
            Ok(TickOutcome::Replaced) => {
                exit = KeepaliveExit::SessionReplaced;
                break;
            }
            Ok(TickOutcome::NotConnected) => {
                exit = KeepaliveExit::NotConnected;
                break;
            }
            Err(e) => {
                warn!(session_id = %session_id, sequence, error = %e, "keepalive publish failed");
                exit = KeepaliveExit::PublishFailed;
                break;
            }
        }
        drop(target);

        if sequence == u64::from(max_ticks) {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.changed() => {
                exit = KeepaliveExit::Cancelled;
                break;
            }
        }
    }

    info!(session_id = %session_id, ticks_sent, exit = ?exit, "keepalive stopped");
    KeepaliveReport { ticks_sent, exit }
}

// ============================================================================
// Task group
// ============================================================================

/// Background tasks belonging to one session, cancelled together.
pub struct TaskGroup {
    cancel: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            cancel,
            handles: Vec::new(),
        }
    }

    /// Receiver that fires when the group is cancelled.
    pub fn token(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn spawn<F>(&mut self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handles.retain(|h| !h.is_finished());
        self.handles.push(tokio::spawn(fut));
    }

    /// Number of tasks still running.
    pub fn active(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Signal every task to stop and start a fresh group for the next
    /// session. Tasks observe cancellation at their next wait.
    pub fn cancel(&mut self) {
        let _ = self.cancel.send(true);
        let (cancel, _) = watch::channel(false);
        self.cancel = cancel;
        self.handles.clear();
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    /// Counts ticks; reports `Closed` once `closed` is set.
    #[derive(Default)]
    struct Counter {
        ticks: AtomicU64,
        last_sequence: AtomicU64,
        closed: AtomicBool,
    }

    #[async_trait]
    impl KeepaliveTarget for Counter {
        async fn tick(&self, _session_id: &str, sequence: u64) -> Result<TickOutcome, EndpointError> {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(TickOutcome::Closed);
            }
            self.ticks.fetch_add(1, Ordering::SeqCst);
            self.last_sequence.store(sequence, Ordering::SeqCst);
            Ok(TickOutcome::Sent)
        }
    }

    const INTERVAL: Duration = Duration::from_millis(100);

    fn spawn(counter: &Arc<Counter>, max_ticks: u32, group: &TaskGroup) -> JoinHandle<KeepaliveReport> {
        tokio::spawn(run_keepalive(
            Arc::downgrade(counter),
            "s1".to_string(),
            INTERVAL,
            max_ticks,
            group.token(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_caps_ticks() {
        let counter = Arc::new(Counter::default());
        let group = TaskGroup::new();
        let started = Instant::now();
        let report = spawn(&counter, DEFAULT_MAX_TICKS, &group).await.unwrap();

        assert_eq!(report.ticks_sent, 10);
        assert_eq!(report.exit, KeepaliveExit::BudgetExhausted);
        assert_eq!(counter.ticks.load(Ordering::SeqCst), 10);
        assert_eq!(counter.last_sequence.load(Ordering::SeqCst), 10);
        // first tick is immediate, no sleep after the last one
        assert_eq!(started.elapsed(), INTERVAL * 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_min_of_connected_time_and_budget() {
        for n in [1u32, 3, 7, 10, 14] {
            let counter = Arc::new(Counter::default());
            let group = TaskGroup::new();
            let handle = spawn(&counter, DEFAULT_MAX_TICKS, &group);

            // connected for n intervals: close halfway through the n-th one
            tokio::time::sleep(INTERVAL * (n - 1) + INTERVAL / 2).await;
            counter.closed.store(true, Ordering::SeqCst);

            let report = handle.await.unwrap();
            assert_eq!(report.ticks_sent, n.min(10), "n = {n}");
            let expected_exit = if n >= 10 {
                KeepaliveExit::BudgetExhausted
            } else {
                KeepaliveExit::SessionClosed
            };
            assert_eq!(report.exit, expected_exit, "n = {n}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let counter = Arc::new(Counter::default());
        let mut group = TaskGroup::new();
        let handle = spawn(&counter, DEFAULT_MAX_TICKS, &group);

        tokio::time::sleep(INTERVAL / 2).await;
        group.cancel();

        let report = handle.await.unwrap();
        assert_eq!(report.ticks_sent, 1);
        assert_eq!(report.exit, KeepaliveExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_target_ends_scheduler() {
        let counter = Arc::new(Counter::default());
        let group = TaskGroup::new();
        let handle = spawn(&counter, DEFAULT_MAX_TICKS, &group);

        tokio::time::sleep(INTERVAL / 2).await;
        drop(counter);

        let report = handle.await.unwrap();
        assert_eq!(report.ticks_sent, 1);
        assert_eq!(report.exit, KeepaliveExit::EndpointDropped);
    }

    #[tokio::test]
    async fn test_task_group_cancel_resets() {
        let mut group = TaskGroup::new();
        let token = group.token();
        group.spawn(async {});
        group.cancel();
        assert!(*token.borrow());
        assert!(!group.is_cancelled());
        assert_eq!(group.active(), 0);
    }
}
