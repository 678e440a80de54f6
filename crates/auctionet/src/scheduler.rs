// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timer tasks owned by auctions, requests and sessions.
//!
//! Every task belongs to an owner key. Two kinds exist:
//!
//! - **one-shot**: sleeps until a wall-clock target, runs its body once;
//! - **periodic**: runs at a fixed rate until cancelled or its body returns
//!   [`TaskControl::Stop`].
//!
//! Cancellation waits for an in-flight body to finish, so once
//! [`Scheduler::cancel_owner`] returns no timer of that owner touches state
//! again. A body that cancels its own task only signals it.
//!
//! ```text
//!   schedule_* ──▶ [sleep] ──▶ body ──▶ Completed
//!                     │          │
//!     cancel ─────────┴──────────┴──(join)──▶ Cancelled
//! ```

use crate::interval::now_ms;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Identifier of a scheduled task, unique per scheduler.
pub type TaskId = u64;

const EVENT_CAPACITY: usize = 256;

tokio::task_local! {
    static CURRENT_TASK: TaskId;
}

/// What a periodic body wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    Stop,
}

/// Lifecycle notification broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// The task ran to completion (one-shot fired, or periodic body stopped).
    Completed { id: TaskId, owner: String },
    /// The task was cancelled before completing.
    Cancelled { id: TaskId, owner: String },
}

struct TaskEntry {
    id: TaskId,
    cancel: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

struct Inner {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<String, Vec<TaskEntry>>>,
    events: broadcast::Sender<TaskEvent>,
}

impl Inner {
    /// Drop a task that finished on its own. Returns false when a canceller
    /// already took it.
    fn finish(&self, owner: &str, id: TaskId) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(list) = tasks.get_mut(owner) else {
            return false;
        };
        let Some(pos) = list.iter().position(|t| t.id == id) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            tasks.remove(owner);
        }
        drop(tasks);
        let _ = self.events.send(TaskEvent::Completed {
            id,
            owner: owner.to_string(),
        });
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for entry in self.tasks.get_mut().values().flatten() {
            let _ = entry.cancel.send(true);
        }
    }
}

/// Sleep until `at` (ms since epoch) unless cancelled first.
///
/// Returns false when cancelled.
async fn sleep_until(at: u64, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return false;
    }
    let delay = Duration::from_millis(at.saturating_sub(now_ms()));
    let fired = tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.changed() => false,
    };
    fired && !*cancel.borrow()
}

/// Timer task engine. Cheap to clone; clones share the same task table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                tasks: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Observe task completions and cancellations.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    fn spawn_entry<F>(&self, owner: String, make: F) -> TaskId
    where
        F: FnOnce(TaskId, watch::Receiver<bool>, Weak<Inner>) -> JoinHandle<()>,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancel_rx) = watch::channel(false);
        let mut tasks = self.inner.tasks.lock();
        let join = make(id, cancel_rx, Arc::downgrade(&self.inner));
        tasks.entry(owner).or_default().push(TaskEntry {
            id,
            cancel,
            join: Some(join),
        });
        id
    }

    /// Run `body` once at wall-clock time `at` (immediately if already past).
    pub fn schedule_once<F, Fut>(&self, owner: impl Into<String>, at: u64, body: F) -> TaskId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let owner = owner.into();
        let task_owner = owner.clone();
        self.spawn_entry(owner, move |id, mut cancel, inner| {
            tokio::spawn(async move {
                if !sleep_until(at, &mut cancel).await {
                    return;
                }
                CURRENT_TASK.scope(id, body()).await;
                if let Some(inner) = inner.upgrade() {
                    inner.finish(&task_owner, id);
                }
            })
        })
    }

    /// Run `body` once after `delay`.
    pub fn schedule_after<F, Fut>(&self, owner: impl Into<String>, delay: Duration, body: F) -> TaskId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let at = now_ms().saturating_add(delay.as_millis() as u64);
        self.schedule_once(owner, at, body)
    }

    /// Run `body` at `first_at` and then every `period_ms` milliseconds.
    ///
    /// The body receives its scheduled fire time. Firing is fixed-rate: a
    /// slow body delays the next run but does not shift later ones.
    pub fn schedule_periodic<F, Fut>(
        &self,
        owner: impl Into<String>,
        first_at: u64,
        period_ms: u64,
        mut body: F,
    ) -> TaskId
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = TaskControl> + Send + 'static,
    {
        let owner = owner.into();
        let task_owner = owner.clone();
        let period = period_ms.max(1);
        self.spawn_entry(owner, move |id, mut cancel, inner| {
            tokio::spawn(async move {
                let mut fire_at = first_at;
                loop {
                    if !sleep_until(fire_at, &mut cancel).await {
                        return;
                    }
                    let control = CURRENT_TASK.scope(id, body(fire_at)).await;
                    if control == TaskControl::Stop || *cancel.borrow() {
                        break;
                    }
                    fire_at = fire_at.saturating_add(period);
                }
                if let Some(inner) = inner.upgrade() {
                    inner.finish(&task_owner, id);
                }
            })
        })
    }

    /// Cancel every task in `taken` and wait for the ones not running the
    /// caller.
    async fn cancel_entries(&self, owner: &str, taken: Vec<TaskEntry>) {
        let current = CURRENT_TASK.try_with(|id| *id).ok();
        for mut entry in taken {
            let _ = entry.cancel.send(true);
            if current != Some(entry.id) {
                if let Some(join) = entry.join.take() {
                    let _ = join.await;
                }
            }
            tracing::trace!("Task {} of '{}' cancelled", entry.id, owner);
            let _ = self.inner.events.send(TaskEvent::Cancelled {
                id: entry.id,
                owner: owner.to_string(),
            });
        }
    }

    /// Cancel one task. Idempotent; returns false if it was not scheduled.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let found = {
            let mut tasks = self.inner.tasks.lock();
            let mut found = None;
            for (owner, list) in tasks.iter_mut() {
                if let Some(pos) = list.iter().position(|t| t.id == id) {
                    found = Some((owner.clone(), list.remove(pos)));
                    break;
                }
            }
            if let Some((owner, _)) = &found {
                if tasks.get(owner).is_some_and(|l| l.is_empty()) {
                    tasks.remove(owner);
                }
            }
            found
        };
        match found {
            Some((owner, entry)) => {
                self.cancel_entries(&owner, vec![entry]).await;
                true
            }
            None => false,
        }
    }

    /// Cancel every task of `owner`. Returns the number cancelled.
    pub async fn cancel_owner(&self, owner: &str) -> usize {
        let taken = self.inner.tasks.lock().remove(owner).unwrap_or_default();
        let count = taken.len();
        self.cancel_entries(owner, taken).await;
        count
    }

    /// Cancel everything.
    pub async fn shutdown(&self) {
        let all: Vec<(String, Vec<TaskEntry>)> = self.inner.tasks.lock().drain().collect();
        for (owner, taken) in all {
            self.cancel_entries(&owner, taken).await;
        }
    }

    pub fn tasks_for(&self, owner: &str) -> Vec<TaskId> {
        self.inner
            .tasks
            .lock()
            .get(owner)
            .map(|l| l.iter().map(|t| t.id).collect())
            .unwrap_or_default()
    }

    /// Number of scheduled (not yet finished) tasks.
    pub fn pending(&self) -> usize {
        self.inner.tasks.lock().values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn one_shot_fires_and_reports_completion() {
        let sched = Scheduler::new();
        let mut events = sched.subscribe();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = sched.schedule_after("auctions.a1", Duration::from_millis(10), move || async move {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            TaskEvent::Completed {
                id,
                owner: "auctions.a1".into()
            }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sched.pending(), 0);
        assert!(!sched.cancel(id).await);
    }

    #[tokio::test]
    async fn cancelled_one_shot_never_runs() {
        let sched = Scheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        sched.schedule_after("auctions.a1", Duration::from_millis(50), move || async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(sched.tasks_for("auctions.a1").len(), 1);

        assert_eq!(sched.cancel_owner("auctions.a1").await, 1);
        assert_eq!(sched.cancel_owner("auctions.a1").await, 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn periodic_runs_until_stopped() {
        let sched = Scheduler::new();
        let mut events = sched.subscribe();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let start = now_ms();
        sched.schedule_periodic("req", start, 5, move |_at| {
            let r = Arc::clone(&r);
            async move {
                if r.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    TaskControl::Stop
                } else {
                    TaskControl::Continue
                }
            }
        });

        assert!(matches!(events.recv().await.unwrap(), TaskEvent::Completed { .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancel_waits_for_running_body() {
        let sched = Scheduler::new();
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        sched.schedule_once("s", now_ms(), move || async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_millis(30)).await;
            d.fetch_add(1, Ordering::SeqCst);
        });

        started_rx.await.unwrap();
        sched.cancel_owner("s").await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn body_may_cancel_its_own_owner() {
        let sched = Scheduler::new();
        let mut events = sched.subscribe();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        sched.schedule_periodic("auctions.a1", now_ms() + 1_000, 1_000, move |_| {
            let t = Arc::clone(&t);
            async move {
                t.fetch_add(1, Ordering::SeqCst);
                TaskControl::Continue
            }
        });
        let s = sched.clone();
        sched.schedule_once("auctions.a1", now_ms(), move || async move {
            s.cancel_owner("auctions.a1").await;
        });

        let mut cancelled = 0;
        while cancelled < 2 {
            if let TaskEvent::Cancelled { .. } = events.recv().await.unwrap() {
                cancelled += 1;
            }
        }
        assert_eq!(sched.pending(), 0);
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
