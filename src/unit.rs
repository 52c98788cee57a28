// src/unit.rs

use crate::types::{Handle, MsgId, UnitId};

/// Sender identity of a bus notification: the `(pid, unit)` tuple.
///
/// Unit ids are process-local, so the tuple is the only valid identity
/// across processes — never compare unit ids alone.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Source {
    pub pid: i32,
    pub unit: UnitId,
}

/// An application component that receives dispatched work.
///
/// The runtime never owns a unit: registration stores a weak reference and
/// dispatch targeting a dropped unit is skipped. All methods default to
/// no-ops returning 0 so a unit only implements the capabilities it uses.
///
/// Return values land in the poster's result slot (see
/// [`crate::Dispatcher::wait_result`]). A timer callback's return value is
/// its liveness verdict: negative deactivates the timer.
pub trait Unit: Send + Sync {
    /// A message with a task-owned payload copy, posted via
    /// [`crate::Dispatcher::post_message`].
    fn on_message(&self, msg: MsgId, payload: &[u8]) -> i32 {
        let _ = (msg, payload);
        0
    }

    /// A payload-less event, posted via [`crate::Dispatcher::post_event`].
    fn on_event(&self, msg: MsgId) -> i32 {
        let _ = msg;
        0
    }

    /// A periodic tick from [`crate::Timer`], on the timer thread.
    ///
    /// Runs with no intra-unit arbitration against the dispatcher; the
    /// recommended pattern is to post an event to yourself and return.
    fn on_tick(&self, timer: Handle, now_ms: i64) -> i32 {
        let _ = (timer, now_ms);
        0
    }
}

/// A bus participant that receives cross-process notifications.
///
/// Delivered on the per-process bus worker thread.
pub trait BusListener: Send + Sync {
    /// A notification without payload.
    fn update(&self, from: Source, msg: MsgId);

    /// A notification carrying a payload (≤ 512 bytes). Falls back to
    /// [`BusListener::update`], dropping the payload, when not overridden.
    fn update_with_payload(&self, from: Source, msg: MsgId, payload: &[u8]) {
        let _ = payload;
        self.update(from, msg);
    }
}
