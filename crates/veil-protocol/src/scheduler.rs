//! Cooperative task scheduler.
//!
//! Tasks are closures held in a bounded registry and polled by a pool of
//! worker threads. A worker pops a task, runs it if its delay has
//! elapsed, then requeues or drops it based on the returned
//! [`TaskOutcome`]. Pop-to-run gives each task natural exclusivity: no
//! task ever runs on two workers at once.
//!
//! Workers park on a condvar bounded by the nearest task deadline
//! instead of spinning, and wake early on [`Scheduler::notify`] or
//! shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::registry::{Registry, RegistryError};

/// What a task wants to happen after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Remove the task from the scheduler.
    Done,
    /// Requeue immediately; the next poll runs it without waiting out
    /// its delay.
    Continue,
    /// Requeue and sleep out the task's delay before the next run.
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

struct Task {
    id: TaskId,
    name: &'static str,
    func: Box<dyn FnMut() -> TaskOutcome + Send>,
    /// When false the task runs on the very next poll regardless of delay.
    delayable: bool,
    delay: Duration,
    last_run: Instant,
}

impl Task {
    fn remaining(&self, now: Instant) -> Duration {
        if !self.delayable {
            return Duration::ZERO;
        }
        self.delay.saturating_sub(now.duration_since(self.last_run))
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("delayable", &self.delayable)
            .field("delay", &self.delay)
            .finish()
    }
}

pub struct Scheduler {
    tasks: Registry<Task>,
    shutting_down: AtomicBool,
    parked: Mutex<()>,
    wakeup: Condvar,
    next_id: AtomicU64,
}

impl Scheduler {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: Registry::new("tasks", capacity),
            shutting_down: AtomicBool::new(false),
            parked: Mutex::new(()),
            wakeup: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a task that first runs after `delay` and then per its
    /// returned [`TaskOutcome`].
    pub fn add_task(
        &self,
        name: &'static str,
        delay: Duration,
        func: impl FnMut() -> TaskOutcome + Send + 'static,
    ) -> Result<TaskId, RegistryError> {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.tasks.push_back(Task {
            id,
            name,
            func: Box::new(func),
            delayable: true,
            delay,
            last_run: Instant::now(),
        })?;
        debug!(%id, name, ?delay, "task registered");
        self.notify();
        Ok(id)
    }

    /// Remove a task by id. Returns false when the id is unknown, which
    /// includes a task currently mid-run on a worker.
    pub fn remove_task(&self, id: TaskId) -> bool {
        let removed = self.tasks.remove_where(|task| task.id == id).is_some();
        if removed {
            debug!(%id, "task removed");
        }
        removed
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.contains(|task| task.name == name)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Wake parked workers early, e.g. when new input arrived for a
    /// polling task.
    pub fn notify(&self) {
        self.wakeup.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Signal all workers to exit after their current task.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.wakeup.notify_all();
    }

    /// Drain tasks on the calling thread until [`Scheduler::shutdown`].
    pub fn run(&self) {
        self.run_worker();
    }

    /// Spawn `count` worker threads draining this scheduler.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|n| {
                let scheduler = Arc::clone(self);
                std::thread::Builder::new()
                    .name(format!("veil-worker-{n}"))
                    .spawn(move || scheduler.run_worker())
                    .unwrap_or_else(|e| panic!("failed to spawn worker thread: {e}"))
            })
            .collect()
    }

    fn run_worker(&self) {
        // Upper bound on parking so shutdown and freshly added tasks are
        // never missed for long.
        const IDLE_PARK: Duration = Duration::from_millis(50);

        let mut skipped = 0usize;
        let mut nearest = IDLE_PARK;

        while !self.is_shutting_down() {
            let Some(mut task) = self.tasks.pop_front() else {
                self.park(IDLE_PARK);
                continue;
            };

            let now = Instant::now();
            let remaining = task.remaining(now);
            if !remaining.is_zero() {
                skipped += 1;
                nearest = nearest.min(remaining);
                let backlog = self.tasks.len();
                if self.tasks.push_back(task).is_err() {
                    // Cannot happen: we just popped, so there is room.
                    warn!("task registry rejected requeue");
                }
                // A full lap found nothing runnable; park until the
                // nearest deadline.
                if skipped > backlog {
                    self.park(nearest);
                    skipped = 0;
                    nearest = IDLE_PARK;
                }
                continue;
            }
            skipped = 0;
            nearest = IDLE_PARK;

            trace!(id = %task.id, name = task.name, "running task");
            let outcome = (task.func)();
            match outcome {
                TaskOutcome::Done => {
                    debug!(id = %task.id, name = task.name, "task finished");
                }
                TaskOutcome::Continue => {
                    task.delayable = false;
                    if let Err(e) = self.tasks.push_back(task) {
                        warn!(error = %e, "dropping task: requeue failed");
                    }
                }
                TaskOutcome::Wait => {
                    task.delayable = true;
                    task.last_run = Instant::now();
                    if let Err(e) = self.tasks.push_back(task) {
                        warn!(error = %e, "dropping task: requeue failed");
                    }
                }
            }
        }
        trace!("worker exiting");
    }

    fn park(&self, timeout: Duration) {
        if self.is_shutting_down() {
            return;
        }
        let guard = match self.parked.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = self.wakeup.wait_timeout(guard, timeout);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
