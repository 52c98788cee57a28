// src/dispatch.rs
//
// Per-unit FIFO dispatch over an elastic worker pool. One mutex guards the
// scheduling state (unit table, ready queue, worker slab); a second,
// independent mutex guards the result registry so long waits never
// serialize posting.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::clock::now_ms;
use crate::error::{Error, Result};
use crate::types::{Handle, MsgId, UnitId};
use crate::unit::Unit;

/// Result value recorded when a task panics or its unit is gone.
pub const TASK_FAILED: i32 = i32::MIN;

/// The registry keeps this many most-recent result slots; older slots are
/// evicted silently, ready or not.
const MAX_RESULTS: usize = 100;

/// Nudge interval for `wait_result`, tolerating the race between slot
/// registration and the first wait.
const WAIT_NUDGE_MS: u64 = 33;

const MONITOR_SWEEP_MS: u64 = 5_000;
const HUNG_TASK_MS: i64 = 15_000;
const IDLE_RETIRE_MS: i64 = 60_000;

/// Worker pool bounds.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Workers kept alive at all times. Must be at least 1.
    pub min_workers: usize,
    /// Upper bound for elastic growth.
    pub max_workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            min_workers: 2,
            max_workers: 8,
        }
    }
}

enum TaskCall {
    Message { msg: MsgId, payload: Box<[u8]> },
    Event { msg: MsgId },
    Raw(Box<dyn FnOnce() + Send>),
}

struct Task {
    call: TaskCall,
    /// Result slot to publish into. Raw tasks have none.
    handle: Option<Handle>,
    posted_ms: i64,
    src: &'static Location<'static>,
}

struct UnitEntry {
    unit: Weak<dyn Unit>,
    queue: VecDeque<Task>,
    running: bool,
}

struct WorkerSlot {
    live: bool,
    last_active_ms: i64,
    task_started_ms: Option<i64>,
    task_src: Option<&'static Location<'static>>,
}

struct DispatchState {
    stop: bool,
    units: HashMap<u64, UnitEntry>,
    ready: VecDeque<UnitId>,
    workers: Vec<WorkerSlot>,
    live_workers: usize,
    /// Idle workers the monitor has cleared for retirement.
    retire_budget: usize,
    next_unit: u64,
}

struct ResultSlot {
    value: i32,
    ready: bool,
}

struct ResultRegistry {
    slots: HashMap<u64, ResultSlot>,
    order: VecDeque<u64>,
    counter: Handle,
}

struct Inner {
    config: DispatchConfig,
    state: Mutex<DispatchState>,
    cv: Condvar,
    monitor_cv: Condvar,
    results: Mutex<ResultRegistry>,
    result_cv: Condvar,
}

/// The dispatch runtime: a process-wide service handle.
///
/// Construct once with [`Dispatcher::new`] and share the `Arc`. Dropping
/// the last clone stops and joins every worker and the monitor.
pub struct Dispatcher {
    inner: Arc<Inner>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Result<Arc<Dispatcher>> {
        if config.min_workers < 1 {
            return Err(Error::invalid_argument("min_workers must be at least 1"));
        }
        if config.max_workers < config.min_workers {
            return Err(Error::invalid_argument(format!(
                "max_workers {} below min_workers {}",
                config.max_workers, config.min_workers
            )));
        }

        let inner = Arc::new(Inner {
            config: config.clone(),
            state: Mutex::new(DispatchState {
                stop: false,
                units: HashMap::new(),
                ready: VecDeque::new(),
                workers: Vec::new(),
                live_workers: 0,
                retire_budget: 0,
                next_unit: 0,
            }),
            cv: Condvar::new(),
            monitor_cv: Condvar::new(),
            results: Mutex::new(ResultRegistry {
                slots: HashMap::new(),
                order: VecDeque::new(),
                counter: Handle(0),
            }),
            result_cv: Condvar::new(),
        });

        let dispatcher = Arc::new(Dispatcher {
            inner: Arc::clone(&inner),
            worker_handles: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
        });

        {
            let mut st = inner.state.lock();
            let mut handles = dispatcher.worker_handles.lock();
            for _ in 0..config.min_workers {
                handles.push(spawn_worker(&inner, &mut st));
            }
        }
        *dispatcher.monitor.lock() = Some(std::thread::spawn({
            let inner = Arc::clone(&inner);
            move || monitor_loop(inner)
        }));

        Ok(dispatcher)
    }

    /// Register a unit and mint its id. The dispatcher holds a weak
    /// reference only; the caller keeps the unit alive for as long as
    /// dispatches may target it.
    pub fn register(&self, unit: &Arc<dyn Unit>) -> UnitId {
        let mut st = self.inner.state.lock();
        st.next_unit += 1;
        let id = UnitId(st.next_unit);
        st.units.insert(
            id.0,
            UnitEntry {
                unit: Arc::downgrade(unit),
                queue: VecDeque::new(),
                running: false,
            },
        );
        id
    }

    /// Forget a unit. Queued tasks for it are dropped.
    pub fn deregister(&self, unit: UnitId) -> bool {
        self.inner.state.lock().units.remove(&unit.0).is_some()
    }

    /// Post a message with a payload. The payload is copied into the task;
    /// the caller's buffer is free the moment this returns.
    ///
    /// With `sequential` the unit runs at most one task at a time and
    /// completion order equals post order. Without it a second worker may
    /// run another task for the same unit concurrently — the caller is
    /// then responsible for mutual exclusion inside the unit.
    ///
    /// Returns the handle of the reserved result slot. Only the most
    /// recent 100 slots are kept: posting more than that before waiting
    /// makes the oldest handles unobservable.
    #[track_caller]
    pub fn post_message(
        &self,
        unit: UnitId,
        msg: MsgId,
        payload: &[u8],
        sequential: bool,
    ) -> Result<Handle> {
        let src = Location::caller();
        let handle = self.reserve_result();
        let task = Task {
            call: TaskCall::Message {
                msg,
                payload: payload.into(),
            },
            handle: Some(handle),
            posted_ms: now_ms(),
            src,
        };
        if let Err(err) = self.enqueue(unit, task, sequential) {
            self.discard_result(handle);
            return Err(err);
        }
        Ok(handle)
    }

    /// Post a payload-less event. Sequential mode is implied.
    #[track_caller]
    pub fn post_event(&self, unit: UnitId, msg: MsgId) -> Result<Handle> {
        let src = Location::caller();
        let handle = self.reserve_result();
        let task = Task {
            call: TaskCall::Event { msg },
            handle: Some(handle),
            posted_ms: now_ms(),
            src,
        };
        if let Err(err) = self.enqueue(unit, task, true) {
            self.discard_result(handle);
            return Err(err);
        }
        Ok(handle)
    }

    /// Enqueue a pre-built nullary task bound to a unit. No result slot is
    /// created; the returned handle is minted only.
    #[track_caller]
    pub fn enqueue_raw(&self, unit: UnitId, f: Box<dyn FnOnce() + Send>) -> Result<Handle> {
        let src = Location::caller();
        let handle = self.mint_handle();
        let task = Task {
            call: TaskCall::Raw(f),
            handle: None,
            posted_ms: now_ms(),
            src,
        };
        self.enqueue(unit, task, true)?;
        Ok(handle)
    }

    /// Wait up to `timeout_ms` for the slot's value.
    ///
    /// `None` when the handle is unknown (never minted, or evicted) or the
    /// timeout elapses. An unknown handle is indistinguishable from a slow
    /// task until the timeout: the wait nudges every ~33 ms to tolerate
    /// the race between registration and waiting.
    pub fn wait_result(&self, handle: Handle, timeout_ms: u64) -> Option<i32> {
        let deadline = now_ms() + timeout_ms as i64;
        let mut reg = self.inner.results.lock();
        loop {
            if let Some(slot) = reg.slots.get(&handle.0) {
                if slot.ready {
                    return Some(slot.value);
                }
            }
            let now = now_ms();
            if now >= deadline {
                return None;
            }
            let nudge = ((deadline - now) as u64).min(WAIT_NUDGE_MS);
            self.inner
                .result_cv
                .wait_for(&mut reg, Duration::from_millis(nudge));
        }
    }

    /// Reserve a fresh handle not tied to any slot. Used by the timer.
    pub fn mint_handle(&self) -> Handle {
        let mut reg = self.inner.results.lock();
        reg.counter = reg.counter.next();
        reg.counter
    }

    /// Current number of live workers.
    pub fn worker_count(&self) -> usize {
        self.inner.state.lock().live_workers
    }

    fn reserve_result(&self) -> Handle {
        let mut reg = self.inner.results.lock();
        reg.counter = reg.counter.next();
        let handle = reg.counter;
        reg.slots.insert(
            handle.0,
            ResultSlot {
                value: 0,
                ready: false,
            },
        );
        reg.order.push_back(handle.0);
        if reg.order.len() > MAX_RESULTS {
            if let Some(old) = reg.order.pop_front() {
                reg.slots.remove(&old);
            }
        }
        self.inner.result_cv.notify_all();
        handle
    }

    fn discard_result(&self, handle: Handle) {
        let mut reg = self.inner.results.lock();
        reg.slots.remove(&handle.0);
        reg.order.retain(|&h| h != handle.0);
    }

    fn enqueue(&self, unit: UnitId, task: Task, sequential: bool) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if st.stop {
            return Err(Error::stopped("dispatcher is shutting down"));
        }
        let entry = st
            .units
            .get_mut(&unit.0)
            .ok_or_else(|| Error::not_found(format!("unit {}", unit.0)))?;
        entry.queue.push_back(task);

        let make_ready = if sequential { !entry.running } else { true };
        if make_ready {
            entry.running = true;
            st.ready.push_back(unit);
            if st.ready.len() > st.live_workers && st.live_workers < inner.config.max_workers {
                let handle = spawn_worker(inner, &mut st);
                self.worker_handles.lock().push(handle);
                debug!(workers = st.live_workers, "grew worker pool");
            }
            inner.cv.notify_one();
        }
        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.inner.state.lock().stop = true;
        self.inner.cv.notify_all();
        self.inner.monitor_cv.notify_all();
        self.inner.result_cv.notify_all();
        if let Some(monitor) = self.monitor.lock().take() {
            let _ = monitor.join();
        }
        for handle in self.worker_handles.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn spawn_worker(inner: &Arc<Inner>, st: &mut DispatchState) -> JoinHandle<()> {
    let idx = st.workers.len();
    st.workers.push(WorkerSlot {
        live: true,
        last_active_ms: now_ms(),
        task_started_ms: None,
        task_src: None,
    });
    st.live_workers += 1;
    let inner = Arc::clone(inner);
    std::thread::spawn(move || worker_loop(inner, idx))
}

fn worker_loop(inner: Arc<Inner>, idx: usize) {
    let mut st = inner.state.lock();
    loop {
        loop {
            if st.stop {
                st.workers[idx].live = false;
                st.live_workers -= 1;
                return;
            }
            if !st.ready.is_empty() {
                break;
            }
            if st.retire_budget > 0
                && st.live_workers > inner.config.min_workers
                && now_ms() - st.workers[idx].last_active_ms >= IDLE_RETIRE_MS
            {
                st.retire_budget -= 1;
                st.workers[idx].live = false;
                st.live_workers -= 1;
                debug!(worker = idx, "retired idle worker");
                return;
            }
            inner.cv.wait(&mut st);
        }

        let uid = match st.ready.pop_front() {
            Some(uid) => uid,
            None => continue,
        };
        let (task, weak) = {
            let entry = match st.units.get_mut(&uid.0) {
                Some(entry) => entry,
                // deregistered while queued
                None => continue,
            };
            match entry.queue.pop_front() {
                Some(task) => {
                    entry.running = true;
                    (task, entry.unit.clone())
                }
                None => {
                    entry.running = false;
                    continue;
                }
            }
        };

        st.workers[idx].task_started_ms = Some(now_ms());
        st.workers[idx].task_src = Some(task.src);
        drop(st);

        run_task(&inner, uid, task, weak);

        st = inner.state.lock();
        st.workers[idx].task_started_ms = None;
        st.workers[idx].task_src = None;
        st.workers[idx].last_active_ms = now_ms();
        if let Some(entry) = st.units.get_mut(&uid.0) {
            if !entry.queue.is_empty() {
                st.ready.push_back(uid);
                inner.cv.notify_one();
            } else {
                entry.running = false;
            }
        }
    }
}

fn run_task(inner: &Inner, uid: UnitId, task: Task, weak: Weak<dyn Unit>) {
    let Task {
        call,
        handle,
        posted_ms,
        src,
    } = task;

    let delay = now_ms() - posted_ms;
    if delay > 200 {
        warn!(
            unit = uid.0,
            delay_ms = delay,
            file = src.file(),
            line = src.line(),
            "task execution is delayed"
        );
    }

    let value = match call {
        TaskCall::Raw(f) => {
            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                warn!(
                    unit = uid.0,
                    file = src.file(),
                    line = src.line(),
                    "raw task panicked"
                );
            }
            None
        }
        TaskCall::Message { msg, payload } => Some(match weak.upgrade() {
            Some(unit) => catch_unwind(AssertUnwindSafe(|| unit.on_message(msg, &payload)))
                .unwrap_or_else(|_| {
                    warn!(
                        unit = uid.0,
                        msg = msg.get(),
                        file = src.file(),
                        line = src.line(),
                        "message task panicked"
                    );
                    TASK_FAILED
                }),
            None => {
                debug!(unit = uid.0, msg = msg.get(), "unit gone before dispatch");
                TASK_FAILED
            }
        }),
        TaskCall::Event { msg } => Some(match weak.upgrade() {
            Some(unit) => {
                catch_unwind(AssertUnwindSafe(|| unit.on_event(msg))).unwrap_or_else(|_| {
                    warn!(
                        unit = uid.0,
                        msg = msg.get(),
                        file = src.file(),
                        line = src.line(),
                        "event task panicked"
                    );
                    TASK_FAILED
                })
            }
            None => {
                debug!(unit = uid.0, msg = msg.get(), "unit gone before dispatch");
                TASK_FAILED
            }
        }),
    };

    if let (Some(handle), Some(value)) = (handle, value) {
        let mut reg = inner.results.lock();
        // the slot may have been evicted under posting pressure
        if let Some(slot) = reg.slots.get_mut(&handle.0) {
            slot.value = value;
            slot.ready = true;
        }
        drop(reg);
        inner.result_cv.notify_all();
    }
}

fn monitor_loop(inner: Arc<Inner>) {
    let mut st = inner.state.lock();
    loop {
        if st.stop {
            return;
        }
        inner
            .monitor_cv
            .wait_for(&mut st, Duration::from_millis(MONITOR_SWEEP_MS));
        if st.stop {
            return;
        }

        let now = now_ms();
        let mut idle = 0usize;
        for (idx, worker) in st.workers.iter().enumerate() {
            if !worker.live {
                continue;
            }
            match worker.task_started_ms {
                Some(started) if now - started >= HUNG_TASK_MS => {
                    let (file, line) = worker
                        .task_src
                        .map(|src| (src.file(), src.line()))
                        .unwrap_or(("?", 0));
                    warn!(
                        worker = idx,
                        elapsed_ms = now - started,
                        file,
                        line,
                        "worker stuck on the same task"
                    );
                }
                None if now - worker.last_active_ms >= IDLE_RETIRE_MS => idle += 1,
                _ => {}
            }
        }

        let excess = st.live_workers.saturating_sub(inner.config.min_workers);
        st.retire_budget = idle.min(excess);
        if st.retire_budget > 0 {
            inner.cv.notify_all();
        }
    }
}
