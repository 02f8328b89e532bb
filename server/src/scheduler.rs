//! General-purpose task scheduler.
//!
//! Two OS threads drive every registered task: a fast loop that runs
//! time-sensitive callbacks inline, and a background loop fed by the fast loop
//! for work that may block. Both poll at a fixed quantum and read the live
//! task set through a copy-on-write snapshot, so stopping a task from any
//! thread never blocks iteration.
//!
//! ```rust,no_run
//! use server::scheduler::{Scheduler, Task};
//! use std::time::Duration;
//!
//! let scheduler = Scheduler::new(Duration::from_millis(10));
//! scheduler.start().unwrap();
//!
//! let heartbeat = Task::new("heartbeat", |_| {
//!     println!("tick");
//!     Ok(())
//! });
//! scheduler
//!     .run_forever(&heartbeat, Duration::from_secs(1), Duration::ZERO)
//!     .unwrap();
//! ```

use crate::error::SchedulerError;
use crate::utils::lock;
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Interval used by manual tasks, long enough that they only fire when
/// explicitly triggered.
pub const MANUAL_INTERVAL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Default polling quantum of both loops.
pub const DEFAULT_QUANTUM: Duration = Duration::from_millis(10);

type Callback = Box<dyn FnMut(&Task) -> anyhow::Result<()> + Send>;

fn far_future(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .unwrap_or_else(|| from + Duration::from_secs(365 * 24 * 60 * 60))
}

/// When a task fires again after executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Once,
    Forever { interval: Duration },
    Repeating { interval: Duration, remaining: u32 },
    Manual,
}

impl Schedule {
    pub fn interval(&self) -> Duration {
        match self {
            Schedule::Once => Duration::ZERO,
            Schedule::Forever { interval } | Schedule::Repeating { interval, .. } => *interval,
            Schedule::Manual => MANUAL_INTERVAL,
        }
    }
}

#[derive(Debug)]
struct Timing {
    schedule: Schedule,
    next_fire: Instant,
}

impl Timing {
    /// Next fire time measured from the originally scheduled instant, so time
    /// spent executing eats into the interval. A task that fell a whole
    /// interval behind fires once on the next pass instead of bursting.
    fn advance_from_schedule(&mut self, now: Instant) {
        let next = far_future(self.next_fire, self.schedule.interval());
        self.next_fire = next.max(now);
    }

    fn advance_from(&mut self, finished: Instant) {
        self.next_fire = far_future(finished, self.schedule.interval());
    }

    /// Repeat-count bookkeeping after one execution. Returns true when the
    /// task has run its course.
    fn complete_run(&mut self) -> bool {
        match &mut self.schedule {
            Schedule::Once => true,
            Schedule::Repeating { remaining, .. } => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            Schedule::Forever { .. } | Schedule::Manual => false,
        }
    }
}

struct TaskInner {
    name: String,
    callback: Mutex<Callback>,
    timing: Mutex<Timing>,
    payload: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    background: AtomicBool,
    adjust_for_execution_time: AtomicBool,
    stopped: AtomicBool,
    executing: AtomicBool,
    executions: AtomicU64,
}

/// A unit of deferred or recurring work. Cloning yields another handle to
/// the same task, and options set through any handle apply to all of them.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub fn new<F>(name: &str, callback: F) -> Self
    where
        F: FnMut(&Task) -> anyhow::Result<()> + Send + 'static,
    {
        Task {
            inner: Arc::new(TaskInner {
                name: name.to_string(),
                callback: Mutex::new(Box::new(callback)),
                timing: Mutex::new(Timing {
                    schedule: Schedule::Once,
                    next_fire: Instant::now(),
                }),
                payload: Mutex::new(None),
                background: AtomicBool::new(false),
                adjust_for_execution_time: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                executing: AtomicBool::new(false),
                executions: AtomicU64::new(0),
            }),
        }
    }

    /// Runs the callback on the background loop instead of the fast loop.
    pub fn background(self) -> Self {
        self.inner.background.store(true, Ordering::Release);
        self
    }

    /// Whether time spent executing counts against the next interval
    /// (default) or the interval restarts once the callback returns.
    pub fn adjust_for_execution_time(self, adjust: bool) -> Self {
        self.inner
            .adjust_for_execution_time
            .store(adjust, Ordering::Release);
        self
    }

    pub fn with_payload<T: Any + Send + Sync>(self, payload: T) -> Self {
        *lock(&self.inner.payload) = Some(Arc::new(payload));
        self
    }

    pub fn payload<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let payload = lock(&self.inner.payload).clone()?;
        payload.downcast::<T>().ok()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_background(&self) -> bool {
        self.inner.background.load(Ordering::Acquire)
    }

    fn adjusts_for_execution_time(&self) -> bool {
        self.inner.adjust_for_execution_time.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn is_executing(&self) -> bool {
        self.inner.executing.load(Ordering::Acquire)
    }

    /// Number of completed executions, successful or not.
    pub fn executions(&self) -> u64 {
        self.inner.executions.load(Ordering::Acquire)
    }

    pub fn schedule(&self) -> Schedule {
        lock(&self.inner.timing).schedule
    }

    pub fn next_fire(&self) -> Instant {
        lock(&self.inner.timing).next_fire
    }

    /// Moves the next firing to `at`. This is how manual tasks are driven.
    pub fn fire_at(&self, at: Instant) {
        lock(&self.inner.timing).next_fire = at;
    }

    /// Makes the task due on the next pass of the fast loop.
    pub fn trigger(&self) {
        self.fire_at(Instant::now());
    }

    /// Marks the task stopped. It is removed from the live set on the next
    /// rebuild and never fires again.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
    }

    fn configure(&self, schedule: Schedule, first_fire: Instant) {
        let mut timing = lock(&self.inner.timing);
        timing.schedule = schedule;
        timing.next_fire = first_fire;
    }

    fn is_due(&self, now: Instant) -> bool {
        !self.is_stopped() && lock(&self.inner.timing).next_fire <= now
    }

    fn same_as(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runs the callback once with full bookkeeping. Callback errors and
    /// panics are logged and do not affect the schedule.
    fn execute(&self) {
        if self.adjusts_for_execution_time() {
            lock(&self.inner.timing).advance_from_schedule(Instant::now());
        }

        self.inner.executing.store(true, Ordering::Release);
        let outcome = {
            let mut callback = lock(&self.inner.callback);
            panic::catch_unwind(AssertUnwindSafe(|| (&mut **callback)(self)))
        };
        let finished = Instant::now();

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("Task '{}' failed: {:#}", self.name(), err),
            Err(panic) => error!(
                "Task '{}' panicked: {}",
                self.name(),
                panic_message(panic.as_ref())
            ),
        }

        {
            let mut timing = lock(&self.inner.timing);
            if timing.complete_run() {
                self.stop();
            } else if !self.adjusts_for_execution_time()
                || timing.schedule == Schedule::Manual
            {
                timing.advance_from(finished);
            }
        }

        self.inner.executions.fetch_add(1, Ordering::AcqRel);
        self.inner.executing.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("background", &self.is_background())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct SchedulerInner {
    quantum: Duration,
    tasks: Mutex<Vec<Task>>,
    live: ArcSwap<Vec<Task>>,
    shutting_down: AtomicBool,
    background_tx: Sender<Task>,
    background_rx: Receiver<Task>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a scheduler; clones share the same loops and task set.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(quantum: Duration) -> Self {
        let (background_tx, background_rx) = crossbeam_channel::unbounded();
        Scheduler {
            inner: Arc::new(SchedulerInner {
                quantum,
                tasks: Mutex::new(Vec::new()),
                live: ArcSwap::from_pointee(Vec::new()),
                shutting_down: AtomicBool::new(false),
                background_tx,
                background_rx,
                threads: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawns the fast and background loop threads.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let fast = {
            let scheduler = self.clone();
            thread::Builder::new()
                .name("scheduler-fast".to_string())
                .spawn(move || scheduler.fast_loop())
                .map_err(SchedulerError::Spawn)?
        };
        let background = {
            let scheduler = self.clone();
            thread::Builder::new()
                .name("scheduler-background".to_string())
                .spawn(move || scheduler.background_loop())
                .map_err(SchedulerError::Spawn)?
        };

        let mut threads = lock(&self.inner.threads);
        threads.push(fast);
        threads.push(background);
        debug!("Scheduler started with a {:?} quantum", self.inner.quantum);
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Registers a task. Adding a task that is already registered is a no-op.
    pub fn add(&self, task: &Task) -> Result<(), SchedulerError> {
        if self.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }

        let mut tasks = lock(&self.inner.tasks);
        // A stopped task may still sit in the set until the next purge.
        task.inner.stopped.store(false, Ordering::Release);
        if tasks.iter().any(|existing| existing.same_as(task)) {
            debug!("Task '{}' is already scheduled", task.name());
            return Ok(());
        }

        tasks.push(task.clone());
        self.rebuild(&mut tasks);
        Ok(())
    }

    pub fn run_once(&self, task: &Task, delay: Duration) -> Result<(), SchedulerError> {
        self.run_once_at(task, Instant::now() + delay)
    }

    pub fn run_once_at(&self, task: &Task, at: Instant) -> Result<(), SchedulerError> {
        task.configure(Schedule::Once, at);
        self.add(task)
    }

    pub fn run_forever(
        &self,
        task: &Task,
        interval: Duration,
        delay: Duration,
    ) -> Result<(), SchedulerError> {
        task.configure(Schedule::Forever { interval }, Instant::now() + delay);
        self.add(task)
    }

    pub fn run_repeating(
        &self,
        task: &Task,
        delay: Duration,
        interval: Duration,
        times: u32,
    ) -> Result<(), SchedulerError> {
        if times == 0 {
            return Err(SchedulerError::InvalidRepeatCount(times));
        }
        let schedule = if times == 1 {
            Schedule::Once
        } else {
            Schedule::Repeating {
                interval,
                remaining: times,
            }
        };
        task.configure(schedule, Instant::now() + delay);
        self.add(task)
    }

    /// Registers a task that only fires when triggered, or once after
    /// `delay` if one is given.
    pub fn run_manual(&self, task: &Task, delay: Option<Duration>) -> Result<(), SchedulerError> {
        let now = Instant::now();
        let first = match delay {
            Some(delay) => now + delay,
            None => far_future(now, MANUAL_INTERVAL),
        };
        task.configure(Schedule::Manual, first);
        self.add(task)
    }

    /// Stops a task; removal from the live set is deferred to the next rebuild.
    pub fn stop(&self, task: &Task) {
        task.stop();
    }

    /// Number of tasks in the live set, including stopped ones not yet purged.
    pub fn task_count(&self) -> usize {
        self.inner.live.load().len()
    }

    /// Stops every task and refuses new ones. The loops exit on their next
    /// quantum.
    pub fn begin_shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let mut tasks = lock(&self.inner.tasks);
        for task in tasks.iter() {
            task.stop();
        }
        self.rebuild(&mut tasks);
        info!("Scheduler shutting down");
    }

    /// Joins both loop threads.
    pub fn end_shutdown(&self) {
        let threads: Vec<JoinHandle<()>> = lock(&self.inner.threads).drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("Scheduler thread panicked during shutdown");
            }
        }
        debug!("Scheduler stopped");
    }

    fn rebuild(&self, tasks: &mut Vec<Task>) {
        tasks.retain(|task| !task.is_stopped());
        self.inner.live.store(Arc::new(tasks.clone()));
    }

    fn purge(&self) {
        let mut tasks = lock(&self.inner.tasks);
        self.rebuild(&mut tasks);
    }

    fn fast_loop(&self) {
        while !self.is_shutting_down() {
            let snapshot = self.inner.live.load_full();
            let mut saw_stopped = false;

            for task in snapshot.iter() {
                if task.is_stopped() {
                    saw_stopped = true;
                    continue;
                }
                if !task.is_due(Instant::now()) {
                    continue;
                }

                if task.is_background() {
                    // Skip tasks still queued or running from an earlier pass.
                    if task.inner.executing.swap(true, Ordering::AcqRel) {
                        continue;
                    }
                    if self.inner.background_tx.send(task.clone()).is_err() {
                        task.inner.executing.store(false, Ordering::Release);
                    }
                } else {
                    task.execute();
                }
                saw_stopped |= task.is_stopped();
            }

            if saw_stopped {
                self.purge();
            }
            thread::sleep(self.inner.quantum);
        }
    }

    fn background_loop(&self) {
        while !self.is_shutting_down() {
            match self.inner.background_rx.recv_timeout(self.inner.quantum) {
                Ok(task) => {
                    if !task.is_stopped() {
                        task.execute();
                    }
                    task.inner.executing.store(false, Ordering::Release);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}
