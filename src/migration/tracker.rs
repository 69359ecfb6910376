//! Rendezvous between the code that schedules work and the tasks doing it
//!
//! The producer calls [`TaskTracker::add_task`] before dispatching each task
//! and [`TaskTracker::finished_scheduling_tasks`] once nothing more will be
//! added. Tasks call [`TaskTracker::finished_task`]. Waiters are released
//! when scheduling is finished and no task remains, or immediately on abort.

use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct TrackerState {
    scheduling_finished: bool,
    aborted: Option<String>,
}

/// Outstanding-task counter with a broadcast release and abort
#[derive(Debug, Default)]
pub struct TaskTracker {
    state: RwLock<TrackerState>,
    /// Mutated only under the write lock; read without it for reporting
    remaining: AtomicUsize,
    released: Notify,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&self) {
        let _state = self.state.write();
        self.remaining.fetch_add(1, Ordering::AcqRel);
    }

    /// Declare that no further tasks will be added
    pub fn finished_scheduling_tasks(&self) {
        let mut state = self.state.write();
        state.scheduling_finished = true;
        if self.remaining.load(Ordering::Acquire) == 0 {
            self.released.notify_waiters();
        }
    }

    pub fn finished_task(&self) {
        let state = self.state.write();
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        if state.scheduling_finished && previous <= 1 {
            self.released.notify_waiters();
        }
    }

    /// Abort all current and future waiters with `message`
    pub fn abort(&self, message: impl Into<String>) {
        let mut state = self.state.write();
        if state.aborted.is_none() {
            state.aborted = Some(message.into());
        }
        self.released.notify_waiters();
    }

    /// Outstanding tasks. Lock-free and possibly stale.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Relaxed)
    }

    pub fn is_aborted(&self) -> bool {
        self.state.read().aborted.is_some()
    }

    pub fn is_finished(&self) -> bool {
        let state = self.state.read();
        state.scheduling_finished && self.remaining.load(Ordering::Acquire) == 0
    }

    /// Block until released or aborted.
    ///
    /// Waiting before [`finished_scheduling_tasks`](Self::finished_scheduling_tasks)
    /// has been called can block forever.
    pub async fn wait_for_tasks_to_finish(&self) -> Result<()> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(done) = self.check() {
                return done;
            }
            notified.await;
        }
    }

    fn check(&self) -> Option<Result<()>> {
        let state = self.state.read();
        if let Some(message) = &state.aborted {
            return Some(Err(Error::Aborted(message.clone())));
        }
        if state.scheduling_finished && self.remaining.load(Ordering::Acquire) == 0 {
            return Some(Ok(()));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn releases_when_scheduling_done_and_tasks_finish() {
        let tracker = Arc::new(TaskTracker::new());
        tracker.add_task();
        tracker.add_task();

        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_for_tasks_to_finish().await }
        });

        tracker.finished_task();
        tracker.finished_scheduling_tasks();
        assert_eq!(tracker.remaining(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tracker.finished_task();
        waiter.await.unwrap().unwrap();
        assert!(tracker.is_finished());
    }

    #[tokio::test]
    async fn zero_tasks_released_by_finished_scheduling() {
        let tracker = TaskTracker::new();
        tracker.finished_scheduling_tasks();
        tracker.wait_for_tasks_to_finish().await.unwrap();
    }

    #[tokio::test]
    async fn abort_wins_over_completion() {
        let tracker = TaskTracker::new();
        tracker.abort("index scan failed");
        tracker.finished_scheduling_tasks();
        let err = tracker.wait_for_tasks_to_finish().await.unwrap_err();
        assert!(matches!(err, Error::Aborted(ref m) if m == "index scan failed"));
    }

    #[test]
    fn first_abort_message_is_kept() {
        let tracker = TaskTracker::new();
        tracker.abort("first");
        tracker.abort("second");
        assert!(tracker.is_aborted());
        assert!(matches!(tracker.check(), Some(Err(Error::Aborted(m))) if m == "first"));
    }

    #[test]
    fn finished_task_never_underflows() {
        let tracker = TaskTracker::new();
        tracker.finished_task();
        assert_eq!(tracker.remaining(), 0);
    }
}
