// src/timer.rs
//
// Single-thread periodic scheduler. One thread drives every timer; the
// callback's return value is its liveness verdict (negative = stop). The
// timer performs no intra-unit arbitration against the dispatcher: a
// callback that needs to touch unit state should post an event to the
// unit and return.

use std::collections::BTreeMap;
use std::panic::Location;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::clock::now_ms;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::types::Handle;
use crate::unit::Unit;

/// Timers below this interval are rejected; the loop never waits less.
pub const MIN_TICK_MS: u64 = 15;
/// Idle wait when no timer is due.
pub const MAX_TICK_MS: u64 = 2_000;

struct TimerEntry {
    unit: Weak<dyn Unit>,
    interval_ms: u64,
    next_fire_ms: i64,
    active: bool,
    registered_ms: i64,
    src: &'static Location<'static>,
}

struct TimerState {
    stop: bool,
    /// True while the thread is inside a callback; `remove_all` spins on it.
    in_callback: bool,
    base_wait_ms: u64,
    /// Round-robin cursor: the last handle visited.
    cursor: u64,
    entries: BTreeMap<u64, TimerEntry>,
}

struct Inner {
    state: Mutex<TimerState>,
    cv: Condvar,
}

/// The periodic scheduler. Handles are minted from the dispatcher's
/// counter so timer and result handles never collide.
pub struct Timer {
    inner: Arc<Inner>,
    dispatcher: Arc<Dispatcher>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Timer {
        let inner = Arc::new(Inner {
            state: Mutex::new(TimerState {
                stop: false,
                in_callback: false,
                base_wait_ms: MAX_TICK_MS,
                cursor: 0,
                entries: BTreeMap::new(),
            }),
            cv: Condvar::new(),
        });
        let thread = std::thread::spawn({
            let inner = Arc::clone(&inner);
            move || timer_loop(inner)
        });
        Timer {
            inner,
            dispatcher,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Register a periodic callback on `unit`. Rejects intervals below
    /// [`MIN_TICK_MS`]. Tightens the base wait to `interval / 5` when that
    /// is finer than the current one.
    #[track_caller]
    pub fn create(&self, unit: &Arc<dyn Unit>, interval_ms: u64) -> Result<Handle> {
        if interval_ms < MIN_TICK_MS {
            return Err(Error::invalid_argument(format!(
                "interval {interval_ms}ms below minimum {MIN_TICK_MS}ms"
            )));
        }
        let src = Location::caller();
        let handle = self.dispatcher.mint_handle();
        let now = now_ms();

        let mut st = self.inner.state.lock();
        st.entries.insert(
            handle.get(),
            TimerEntry {
                unit: Arc::downgrade(unit),
                interval_ms,
                next_fire_ms: now + interval_ms as i64,
                active: true,
                registered_ms: now,
                src,
            },
        );
        let fine = (interval_ms / 5).max(MIN_TICK_MS);
        if st.base_wait_ms > fine {
            st.base_wait_ms = fine;
            self.inner.cv.notify_one();
        }
        Ok(handle)
    }

    /// Deactivate one timer. Safe from outside the callback; from inside
    /// the callback return a negative value instead.
    pub fn remove(&self, handle: Handle) -> bool {
        let mut st = self.inner.state.lock();
        match st.entries.get_mut(&handle.get()) {
            Some(entry) => {
                entry.active = false;
                true
            }
            None => false,
        }
    }

    /// Drain every timer. Spins until the thread is outside any callback
    /// before clearing, so no callback observes a cleared table.
    pub fn remove_all(&self) {
        loop {
            let mut st = self.inner.state.lock();
            if !st.in_callback {
                st.entries.clear();
                st.base_wait_ms = MAX_TICK_MS;
                return;
            }
            drop(st);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn is_active(&self, handle: Handle) -> bool {
        self.inner
            .state
            .lock()
            .entries
            .get(&handle.get())
            .map(|entry| entry.active)
            .unwrap_or(false)
    }

    /// Override the base wait. Valid in `[MIN_TICK_MS, MAX_TICK_MS]`.
    pub fn set_base_interval_ms(&self, ms: u64) -> bool {
        if !(MIN_TICK_MS..=MAX_TICK_MS).contains(&ms) {
            return false;
        }
        let mut st = self.inner.state.lock();
        st.base_wait_ms = ms;
        self.inner.cv.notify_one();
        true
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        {
            let mut st = self.inner.state.lock();
            st.entries.clear();
            st.base_wait_ms = MAX_TICK_MS;
            st.stop = true;
        }
        self.inner.cv.notify_one();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn timer_loop(inner: Arc<Inner>) {
    let mut st = inner.state.lock();
    loop {
        if st.stop {
            return;
        }
        // earliest deadline among active entries bounds the wait
        let now = now_ms();
        let mut next_fire = now + MAX_TICK_MS as i64;
        for entry in st.entries.values() {
            if entry.active && entry.next_fire_ms < next_fire {
                next_fire = entry.next_fire_ms;
            }
        }
        let wait = ((next_fire - now).max(MIN_TICK_MS as i64) as u64).min(st.base_wait_ms.max(MIN_TICK_MS));
        inner.cv.wait_for(&mut st, Duration::from_millis(wait));

        if st.stop {
            return;
        }

        // round-robin: one entry per tick
        let key = match st
            .entries
            .range((st.cursor + 1)..)
            .next()
            .or_else(|| st.entries.iter().next())
            .map(|(k, _)| *k)
        {
            Some(key) => key,
            None => {
                st.base_wait_ms = MAX_TICK_MS;
                st.cursor = 0;
                continue;
            }
        };
        st.cursor = key;

        let now = now_ms();
        let (weak, handle, registered_ms, src) = {
            let entry = match st.entries.get_mut(&key) {
                Some(entry) => entry,
                None => continue,
            };
            if !entry.active || now < entry.next_fire_ms {
                continue;
            }
            entry.next_fire_ms = now + entry.interval_ms as i64;
            (entry.unit.clone(), Handle(key), entry.registered_ms, entry.src)
        };

        let unit = match weak.upgrade() {
            Some(unit) => unit,
            None => {
                debug!(
                    timer = key,
                    file = src.file(),
                    line = src.line(),
                    "timer unit gone, deactivating"
                );
                if let Some(entry) = st.entries.get_mut(&key) {
                    entry.active = false;
                }
                continue;
            }
        };

        st.in_callback = true;
        drop(st);

        let started = now_ms();
        let verdict = unit.on_tick(handle, started);
        let elapsed = now_ms() - started;
        if elapsed as u64 > MIN_TICK_MS {
            warn!(
                timer = key,
                elapsed_ms = elapsed,
                age_ms = started - registered_ms,
                file = src.file(),
                line = src.line(),
                "slow timer callback"
            );
        }

        st = inner.state.lock();
        st.in_callback = false;
        if verdict < 0 {
            if let Some(entry) = st.entries.get_mut(&key) {
                entry.active = false;
            }
        }
    }
}
