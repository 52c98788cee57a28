// src/bus.rs
//
// Inter-process notification bus over one fixed-layout POSIX shared-memory
// region. Every participating process maps the region; subscribers
// register message ids in a sorted listener table and a per-process worker
// thread delivers queued rows (with optional ≤512-byte payloads from a
// slot arena) to local listeners.
//
// Lock order, outermost first: process-local state → region mutex →
// per-process row mutex. The delivery worker only ever holds one of them
// at a time.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::clock::now_ms;
use crate::error::{Error, Result};
use crate::fixed::{FixMap, FixVec, MapEntry};
use crate::shm::ShmRegion;
use crate::sync::{SharedCondvar, SharedMutex};
use crate::types::{MsgId, UnitId};
use crate::unit::{BusListener, Source};

/// OS-global name of the bus control region.
pub const REGION_NAME: &str = "/fjsharedmem";

/// Listener table capacity.
pub const LISTEN_MAX: usize = 256;
/// Delivery queue capacity.
pub const QUEUE_MAX: usize = 512;
/// Process table capacity.
pub const PROCESS_MAX: usize = 50;
/// Payload arena slot count.
pub const PAYLOAD_SLOTS: usize = 200;
/// Maximum payload size per notification.
pub const PAYLOAD_MAX: usize = 512;

/// A processed payload slot may be recycled once this old.
const PAYLOAD_RECYCLE_MS: i64 = 5_000;
/// Attachers spin this long for the creator to finish initializing.
const INIT_SPIN_MS: u32 = 100;
/// Bounded wait of the delivery worker; bounds the window in which a
/// wakeup sent before the worker started waiting would otherwise be lost.
const WORKER_POLL_MS: u64 = 100;

/// One listener or delivery row. `msg == 0` marks a tombstone.
#[repr(C)]
#[derive(Clone, Copy)]
struct MailRow {
    msg: u32,
    /// Destination unit (the listener's id).
    unit: u64,
    /// Destination pid.
    pid: i32,
    /// Arena slot carrying this row's payload, or -1.
    payload_idx: i16,
    /// Sender identity, so deliveries can report their source.
    from_pid: i32,
    from_unit: u64,
}

const _: () = assert!(std::mem::size_of::<MailRow>() == 40);

const TOMBSTONE: MailRow = MailRow {
    msg: 0,
    unit: 0,
    pid: 0,
    payload_idx: -1,
    from_pid: 0,
    from_unit: 0,
};

/// Per-process control block. Keyed by pid in the process table; the
/// worker's join handle lives in process-local state, not here.
#[repr(C)]
struct ProcRow {
    mutex: SharedMutex,
    cond: SharedCondvar,
    refcount: u64,
    running: u8,
    done: u8,
}

/// One fixed payload slot.
#[repr(C)]
struct PayloadSlot {
    in_use: u8,
    processed: u8,
    size: u16,
    msg: u32,
    from_pid: i32,
    to_pid: i32,
    sent_ms: i64,
    processed_ms: i64,
    data: [u8; PAYLOAD_MAX],
}

const _: () = assert!(std::mem::size_of::<PayloadSlot>() == 544);

/// The whole control region. Zero-filled at creation; only the mutex and
/// the per-process rows need explicit initialization.
#[repr(C)]
struct BusRegion {
    /// Participant count across all processes; non-zero means ready.
    initialized: AtomicU32,
    mutex: SharedMutex,
    procs: [MapEntry<ProcRow>; PROCESS_MAX],
    proc_count: u64,
    listeners: [MailRow; LISTEN_MAX],
    listener_count: u64,
    queue: [MailRow; QUEUE_MAX],
    queue_count: u64,
    payloads: [PayloadSlot; PAYLOAD_SLOTS],
    payload_cursor: u64,
}

// -- region views ------------------------------------------------------

// All of these require the region mutex (except the atomic `initialized`).

unsafe fn listeners_view(r: *mut BusRegion) -> FixVec<MailRow> {
    FixVec::from_raw(
        addr_of_mut!((*r).listeners) as *mut MailRow,
        LISTEN_MAX,
        addr_of_mut!((*r).listener_count),
    )
}

unsafe fn queue_view(r: *mut BusRegion) -> FixVec<MailRow> {
    FixVec::from_raw(
        addr_of_mut!((*r).queue) as *mut MailRow,
        QUEUE_MAX,
        addr_of_mut!((*r).queue_count),
    )
}

unsafe fn procs_view(r: *mut BusRegion) -> FixMap<ProcRow> {
    FixMap::from_raw(
        addr_of_mut!((*r).procs) as *mut MapEntry<ProcRow>,
        PROCESS_MAX,
        addr_of_mut!((*r).proc_count),
    )
}

unsafe fn payload_ptr(r: *mut BusRegion, idx: usize) -> *mut PayloadSlot {
    (addr_of_mut!((*r).payloads) as *mut PayloadSlot).add(idx)
}

/// Scoped region lock.
struct RegionLock<'a> {
    mutex: &'a SharedMutex,
}

impl<'a> RegionLock<'a> {
    fn lock(r: *mut BusRegion) -> Self {
        let mutex = unsafe { &*addr_of_mut!((*r).mutex) };
        mutex.lock();
        RegionLock { mutex }
    }
}

impl Drop for RegionLock<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Sort tombstones (msg 0) to the front and drop them.
fn compact(rows: &mut FixVec<MailRow>) {
    rows.sort_by(|a, b| a.msg.cmp(&b.msg));
    let mut lead = 0;
    while lead < rows.len() && rows.get(lead).map(|m| m.msg == 0).unwrap_or(false) {
        lead += 1;
    }
    rows.splice(0, lead);
}

// -- process-local state -----------------------------------------------

struct ProcessState {
    next_unit: u64,
    listeners: HashMap<u64, Weak<dyn BusListener>>,
    worker: Option<JoinHandle<()>>,
}

static PROCESS: Lazy<Mutex<ProcessState>> = Lazy::new(|| {
    Mutex::new(ProcessState {
        next_unit: 0,
        listeners: HashMap::new(),
        worker: None,
    })
});

// -- public surface ----------------------------------------------------

/// Attach parameters for [`Bus::attach`].
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Name of this participant's auxiliary region; must start with `/`.
    pub aux_name: String,
    /// Size of the auxiliary region in bytes.
    pub aux_size: usize,
    /// Message ids to subscribe to. Empty for publish-only participants.
    pub listen: Vec<MsgId>,
}

/// Arena occupancy reported by [`Bus::profile_and_gc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaStats {
    /// Slots currently allocated.
    pub in_use: u32,
    /// Allocated slots not yet delivered.
    pub pending: u32,
}

/// One participant's attachment to the bus.
///
/// Dropping detaches: listener and delivery rows are removed, the
/// per-process worker is stopped and joined when this was the last
/// listening participant of the process, and both shared regions are
/// unlinked when the global participant count reaches zero.
pub struct Bus {
    region: ShmRegion,
    aux: ShmRegion,
    aux_name: String,
    pid: i32,
    unit: UnitId,
    listening: bool,
}

impl Bus {
    /// Attach to the bus, creating the control region when absent.
    ///
    /// A non-empty `listen` list requires a `listener`; it also ensures
    /// this process has a delivery worker (shared by all participants of
    /// the process, reference-counted).
    pub fn attach(
        config: BusConfig,
        listener: Option<&Arc<dyn BusListener>>,
    ) -> Result<Bus> {
        if !config.listen.is_empty() && listener.is_none() {
            return Err(Error::invalid_argument(
                "a listen list requires a listener",
            ));
        }

        let mut ps = PROCESS.lock();

        let (region, created) =
            ShmRegion::open_or_create(REGION_NAME, std::mem::size_of::<BusRegion>())?;
        let r = region.as_ptr() as *mut BusRegion;
        let pid = unsafe { libc::getpid() };

        if created {
            unsafe {
                SharedMutex::init(addr_of_mut!((*r).mutex))?;
            }
            debug!(pid, "created bus control region");
        } else {
            // wait for the creator to finish initializing
            let mut spun = 0;
            while spun < INIT_SPIN_MS {
                if unsafe { &(*r).initialized }.load(Ordering::Acquire) > 0 {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
                spun += 1;
            }
            if spun == INIT_SPIN_MS {
                warn!(pid, "timed out waiting for bus initialization");
            }
        }

        let (aux, _) = ShmRegion::open_or_create(&config.aux_name, config.aux_size.max(1))?;

        ps.next_unit += 1;
        let unit = UnitId(ps.next_unit);

        let listening = {
            let _guard = RegionLock::lock(r);

            let mut registered = 0;
            for msg in &config.listen {
                match add_listener_row(r, *msg, unit, pid) {
                    Ok(()) => registered += 1,
                    Err(err) => warn!(pid, msg = msg.get(), %err, "listener not registered"),
                }
            }

            if registered > 0 {
                ensure_worker(r, pid, &mut ps)?;
                if let Some(listener) = listener {
                    ps.listeners.insert(unit.0, Arc::downgrade(listener));
                }
            }

            unsafe { &(*r).initialized }.fetch_add(1, Ordering::AcqRel);
            registered > 0
        };

        Ok(Bus {
            region,
            aux,
            aux_name: config.aux_name,
            pid,
            unit,
            listening,
        })
    }

    fn region_ptr(&self) -> *mut BusRegion {
        self.region.as_ptr() as *mut BusRegion
    }

    /// This participant's identity on the bus.
    pub fn source(&self) -> Source {
        Source {
            pid: self.pid,
            unit: self.unit,
        }
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit
    }

    /// Subscribe to one more message id after attach. Only listening
    /// participants (attached with a non-empty list) may grow their
    /// subscription, since only they have a delivery worker.
    pub fn listen(&self, msg: MsgId) -> Result<()> {
        if !self.listening {
            return Err(Error::invalid_argument(
                "participant attached without listeners cannot subscribe",
            ));
        }
        let r = self.region_ptr();
        let _guard = RegionLock::lock(r);
        add_listener_row(r, msg, self.unit, self.pid)
    }

    /// Publish `msg` to every subscriber except this participant.
    ///
    /// A missing listener is a no-op success. Returns the number of rows
    /// queued for delivery.
    pub fn notify(&self, msg: MsgId) -> Result<usize> {
        let r = self.region_ptr();
        let _guard = RegionLock::lock(r);
        self.notify_rows(msg, None)
    }

    /// Publish `msg` with a payload of at most [`PAYLOAD_MAX`] bytes.
    ///
    /// Each destination row gets its own arena slot; a row whose slot
    /// cannot be allocated is still delivered payload-less.
    pub fn notify_with(&self, msg: MsgId, payload: &[u8]) -> Result<usize> {
        if payload.len() > PAYLOAD_MAX {
            return Err(Error::invalid_argument(format!(
                "payload of {} bytes exceeds {PAYLOAD_MAX}",
                payload.len()
            )));
        }
        let r = self.region_ptr();
        let _guard = RegionLock::lock(r);
        self.notify_rows(msg, if payload.is_empty() { None } else { Some(payload) })
    }

    /// [`Bus::notify`] for callers already holding the region lock.
    pub fn notify_locked(&self, guard: &BusGuard<'_>, msg: MsgId) -> Result<usize> {
        if !guard.locked() {
            return Err(Error::invalid_argument("guard does not hold the bus lock"));
        }
        self.notify_rows(msg, None)
    }

    /// [`Bus::notify_with`] for callers already holding the region lock.
    pub fn notify_with_locked(
        &self,
        guard: &BusGuard<'_>,
        msg: MsgId,
        payload: &[u8],
    ) -> Result<usize> {
        if !guard.locked() {
            return Err(Error::invalid_argument("guard does not hold the bus lock"));
        }
        if payload.len() > PAYLOAD_MAX {
            return Err(Error::invalid_argument(format!(
                "payload of {} bytes exceeds {PAYLOAD_MAX}",
                payload.len()
            )));
        }
        self.notify_rows(msg, if payload.is_empty() { None } else { Some(payload) })
    }

    /// Base pointer of this participant's auxiliary region, taken under
    /// the region mutex. Interpretation is up to the caller; use
    /// [`BusGuard`] to pause the bus while mutating shared state in it.
    pub fn aux_ptr(&self) -> *mut u8 {
        let _guard = RegionLock::lock(self.region_ptr());
        self.aux.as_ptr()
    }

    pub fn aux_len(&self) -> usize {
        self.aux.len()
    }

    /// Enumerate the payload arena and reclaim processed slots older than
    /// `threshold_ms`. Safe to call at any time; idempotent when no new
    /// traffic arrives between calls. Stats reflect the state after
    /// reclamation.
    pub fn profile_and_gc(&self, verbose: bool, threshold_ms: i64) -> ArenaStats {
        let r = self.region_ptr();
        let _guard = RegionLock::lock(r);
        let now = now_ms();
        let mut stats = ArenaStats {
            in_use: 0,
            pending: 0,
        };
        let mut reclaimed = 0u32;
        for idx in 0..PAYLOAD_SLOTS {
            let slot = unsafe { payload_ptr(r, idx) };
            unsafe {
                if (*slot).in_use == 0 {
                    continue;
                }
                if (*slot).processed == 1 && now - (*slot).sent_ms >= threshold_ms {
                    (*slot).in_use = 0;
                    reclaimed += 1;
                    continue;
                }
                stats.in_use += 1;
                if (*slot).processed == 0 {
                    stats.pending += 1;
                }
                if verbose {
                    debug!(
                        idx,
                        msg = (*slot).msg,
                        from_pid = (*slot).from_pid,
                        to_pid = (*slot).to_pid,
                        age_ms = now - (*slot).sent_ms,
                        processed = (*slot).processed,
                        "payload slot"
                    );
                }
            }
        }
        if reclaimed > 0 {
            debug!(reclaimed, "reclaimed payload slots");
        }
        stats
    }

    /// Requires the region mutex.
    fn notify_rows(&self, msg: MsgId, payload: Option<&[u8]>) -> Result<usize> {
        let r = self.region_ptr();
        let listeners = unsafe { listeners_view(r) };
        let n = listeners.len();

        // lower bound on the sorted table
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if listeners.get(mid).map(|m| m.msg).unwrap_or(u32::MAX) < msg.get() {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo >= n || listeners.get(lo).map(|m| m.msg) != Some(msg.get()) {
            debug!(msg = msg.get(), "notify with no listeners");
            return Ok(0);
        }

        let mut queued = 0usize;
        let mut dest_pids = BTreeSet::new();
        for i in lo..n {
            let row = match listeners.get(i) {
                Some(row) => row,
                None => break,
            };
            if row.msg != msg.get() {
                break;
            }
            if row.unit == self.unit.0 && row.pid == self.pid {
                continue;
            }

            let mut payload_idx: i16 = -1;
            if let Some(bytes) = payload {
                match unsafe { alloc_payload(r, bytes, msg, self.pid, row.pid) } {
                    Some(idx) => payload_idx = idx,
                    None => error!(
                        msg = msg.get(),
                        to_pid = row.pid,
                        "payload arena exhausted, delivering without payload"
                    ),
                }
            }

            let mut queue = unsafe { queue_view(r) };
            let pushed = queue.push_back(MailRow {
                msg: msg.get(),
                unit: row.unit,
                pid: row.pid,
                payload_idx,
                from_pid: self.pid,
                from_unit: self.unit.0,
            });
            if pushed {
                queued += 1;
                dest_pids.insert(row.pid);
            } else {
                error!(msg = msg.get(), to_pid = row.pid, "delivery queue full, row dropped");
                if payload_idx >= 0 {
                    unsafe {
                        (*payload_ptr(r, payload_idx as usize)).in_use = 0;
                    }
                }
            }
        }

        if queued > 0 {
            let procs = unsafe { procs_view(r) };
            for pid in dest_pids {
                if let Some(p) = procs.find(pid as u32) {
                    unsafe {
                        if (*p).running == 1 && (*p).done == 0 {
                            (*p).mutex.lock();
                            (*p).cond.broadcast();
                            (*p).mutex.unlock();
                        }
                    }
                }
            }
        }
        Ok(queued)
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        let r = self.region_ptr();

        // remove our rows and decide whether the worker must stop
        let mut stop_worker = false;
        {
            let _guard = RegionLock::lock(r);
            if self.listening {
                let mut listeners = unsafe { listeners_view(r) };
                for i in 0..listeners.len() {
                    if let Some(row) = listeners.get(i) {
                        if row.unit == self.unit.0 && row.pid == self.pid {
                            listeners.update(i, |m| *m = TOMBSTONE);
                        }
                    }
                }
                compact(&mut listeners);

                let mut queue = unsafe { queue_view(r) };
                for i in 0..queue.len() {
                    if let Some(row) = queue.get(i) {
                        if row.unit == self.unit.0 && row.pid == self.pid {
                            if row.payload_idx >= 0 {
                                // nobody will ever mark this one processed
                                unsafe {
                                    (*payload_ptr(r, row.payload_idx as usize)).in_use = 0;
                                }
                            }
                            queue.update(i, |m| *m = TOMBSTONE);
                        }
                    }
                }
                compact(&mut queue);

                let procs = unsafe { procs_view(r) };
                if let Some(p) = procs.find(self.pid as u32) {
                    unsafe {
                        (*p).refcount -= 1;
                        if (*p).refcount == 0 {
                            (*p).running = 0;
                            stop_worker = true;
                        }
                    }
                }
            }
        }

        // stop and join the worker outside every lock it may need
        let worker = {
            let mut ps = PROCESS.lock();
            ps.listeners.remove(&self.unit.0);
            if stop_worker {
                ps.worker.take()
            } else {
                None
            }
        };
        if stop_worker {
            {
                let _guard = RegionLock::lock(r);
                let procs = unsafe { procs_view(r) };
                if let Some(p) = procs.find(self.pid as u32) {
                    unsafe {
                        (*p).mutex.lock();
                        (*p).cond.broadcast();
                        (*p).mutex.unlock();
                    }
                }
            }
            if let Some(handle) = worker {
                let _ = handle.join();
            }
            let _guard = RegionLock::lock(r);
            let mut procs = unsafe { procs_view(r) };
            if let Some(p) = procs.find(self.pid as u32) {
                unsafe {
                    SharedCondvar::destroy(addr_of_mut!((*p).cond));
                    SharedMutex::destroy(addr_of_mut!((*p).mutex));
                }
                procs.unset(self.pid as u32);
            }
        }

        // last participant unlinks both region names
        let unlink = {
            let _guard = RegionLock::lock(r);
            unsafe { &(*r).initialized }.fetch_sub(1, Ordering::AcqRel) == 1
        };
        if unlink {
            debug!(pid = self.pid, "last participant detached, unlinking bus regions");
            let _ = ShmRegion::unlink(&self.aux_name);
            let _ = ShmRegion::unlink(REGION_NAME);
        }
    }
}

/// Requires the region mutex.
fn add_listener_row(r: *mut BusRegion, msg: MsgId, unit: UnitId, pid: i32) -> Result<()> {
    let mut listeners = unsafe { listeners_view(r) };
    for i in 0..listeners.len() {
        if let Some(row) = listeners.get(i) {
            if row.msg == msg.get() && row.unit == unit.0 && row.pid == pid {
                return Err(Error::already_registered(format!(
                    "msg {} already registered by this unit",
                    msg.get()
                )));
            }
        }
    }
    let pushed = listeners.push_back(MailRow {
        msg: msg.get(),
        unit: unit.0,
        pid,
        payload_idx: -1,
        from_pid: 0,
        from_unit: 0,
    });
    if !pushed {
        return Err(Error::resource_exhausted("listener table full"));
    }
    listeners.sort_by(|a, b| a.msg.cmp(&b.msg));
    Ok(())
}

/// Requires the region mutex and the process-local lock.
fn ensure_worker(r: *mut BusRegion, pid: i32, ps: &mut ProcessState) -> Result<()> {
    let mut procs = unsafe { procs_view(r) };
    let row = match procs.find(pid as u32) {
        Some(row) => row,
        None => {
            let row = procs
                .insert(pid as u32)
                .ok_or_else(|| Error::resource_exhausted("process table full"))?;
            unsafe {
                SharedMutex::init(addr_of_mut!((*row).mutex))?;
                SharedCondvar::init(addr_of_mut!((*row).cond))?;
                (*row).refcount = 0;
                (*row).running = 1;
                (*row).done = 0;
            }
            row
        }
    };
    unsafe {
        (*row).refcount += 1;
        if (*row).refcount == 1 {
            (*row).running = 1;
            (*row).done = 0;
            // the worker owns its own mapping of the control region, so it
            // never depends on any particular participant staying attached
            let (worker_region, _) =
                ShmRegion::open_or_create(REGION_NAME, std::mem::size_of::<BusRegion>())?;
            ps.worker = Some(std::thread::spawn(move || {
                delivery_worker(worker_region, pid)
            }));
            debug!(pid, "started bus delivery worker");
        }
    }
    Ok(())
}

/// Row data captured under the region mutex for delivery outside it.
struct Delivery {
    msg: u32,
    unit: u64,
    from: Source,
    payload: Option<(i16, Vec<u8>)>,
}

/// Requires the region mutex.
unsafe fn drain_for_pid(r: *mut BusRegion, pid: i32) -> Vec<Delivery> {
    let mut queue = queue_view(r);
    let mut out = Vec::new();
    for i in 0..queue.len() {
        let row = match queue.get(i) {
            Some(row) => row,
            None => break,
        };
        if row.msg == 0 || row.pid != pid {
            continue;
        }
        let payload = if row.payload_idx >= 0 {
            let slot = payload_ptr(r, row.payload_idx as usize);
            if (*slot).in_use == 1 && (*slot).msg == row.msg && (*slot).to_pid == pid {
                let size = ((*slot).size as usize).min(PAYLOAD_MAX);
                Some((row.payload_idx, (&(*slot).data)[..size].to_vec()))
            } else {
                None
            }
        } else {
            None
        };
        out.push(Delivery {
            msg: row.msg,
            unit: row.unit,
            from: Source {
                pid: row.from_pid,
                unit: UnitId(row.from_unit),
            },
            payload,
        });
        queue.update(i, |m| *m = TOMBSTONE);
    }
    compact(&mut queue);
    out
}

/// Requires the region mutex.
unsafe fn alloc_payload(
    r: *mut BusRegion,
    bytes: &[u8],
    msg: MsgId,
    from_pid: i32,
    to_pid: i32,
) -> Option<i16> {
    let now = now_ms();
    let cursor = *addr_of_mut!((*r).payload_cursor) as usize % PAYLOAD_SLOTS;
    for off in 0..PAYLOAD_SLOTS {
        let idx = (cursor + off) % PAYLOAD_SLOTS;
        let slot = payload_ptr(r, idx);
        let usable = (*slot).in_use == 0
            || ((*slot).processed == 1 && now - (*slot).sent_ms >= PAYLOAD_RECYCLE_MS);
        if !usable {
            continue;
        }
        (*slot).in_use = 1;
        (*slot).processed = 0;
        (*slot).size = bytes.len() as u16;
        (*slot).msg = msg.get();
        (*slot).from_pid = from_pid;
        (*slot).to_pid = to_pid;
        (*slot).sent_ms = now;
        (*slot).processed_ms = 0;
        (&mut (*slot).data)[..bytes.len()].copy_from_slice(bytes);
        *addr_of_mut!((*r).payload_cursor) = ((idx + 1) % PAYLOAD_SLOTS) as u64;
        return Some(idx as i16);
    }
    None
}

fn delivery_worker(region: ShmRegion, pid: i32) {
    let r = region.as_ptr() as *mut BusRegion;
    loop {
        // rows can relocate on attach/detach, so re-resolve every pass
        let row = {
            let _guard = RegionLock::lock(r);
            unsafe { procs_view(r) }.find(pid as u32)
        };
        let row = match row {
            Some(row) => row,
            None => break,
        };

        let running = unsafe {
            (*row).mutex.lock();
            let mut running = (*row).running;
            if running == 1 {
                (*row).cond.timedwait_ms(&(*row).mutex, WORKER_POLL_MS);
                running = (*row).running;
            }
            (*row).mutex.unlock();
            running
        };
        if running == 0 {
            break;
        }

        let deliveries = {
            let _guard = RegionLock::lock(r);
            unsafe { drain_for_pid(r, pid) }
        };

        for delivery in deliveries {
            let msg = match MsgId::new(delivery.msg) {
                Some(msg) => msg,
                None => continue,
            };
            let listener = {
                let ps = PROCESS.lock();
                ps.listeners.get(&delivery.unit).and_then(Weak::upgrade)
            };
            match delivery.payload {
                Some((idx, bytes)) => {
                    if let Some(listener) = &listener {
                        listener.update_with_payload(delivery.from, msg, &bytes);
                    } else {
                        debug!(unit = delivery.unit, msg = msg.get(), "listener gone");
                    }
                    // mark processed either way so the slot can recycle
                    let _guard = RegionLock::lock(r);
                    unsafe {
                        let slot = payload_ptr(r, idx as usize);
                        if (*slot).in_use == 1 {
                            (*slot).processed = 1;
                            (*slot).processed_ms = now_ms();
                        }
                    }
                }
                None => {
                    if let Some(listener) = &listener {
                        listener.update(delivery.from, msg);
                    } else {
                        debug!(unit = delivery.unit, msg = msg.get(), "listener gone");
                    }
                }
            }
        }
    }

    let _guard = RegionLock::lock(r);
    if let Some(row) = unsafe { procs_view(r) }.find(pid as u32) {
        unsafe {
            (*row).mutex.lock();
            (*row).done = 1;
            (*row).mutex.unlock();
        }
    }
    debug!(pid, "bus delivery worker exited");
}

/// Scoped cross-process lock over the bus region.
///
/// Try-locks on construction; [`BusGuard::locked`] reports whether the
/// lock was acquired. Released on every exit path. Used to briefly pause
/// the bus while mutating the auxiliary region.
pub struct BusGuard<'a> {
    bus: &'a Bus,
    locked: bool,
}

impl<'a> BusGuard<'a> {
    pub fn new(bus: &'a Bus) -> Self {
        let r = bus.region_ptr();
        let ready = unsafe { &(*r).initialized }.load(Ordering::Acquire) > 0;
        let locked = ready && unsafe { &*addr_of_mut!((*r).mutex) }.try_lock();
        BusGuard { bus, locked }
    }

    pub fn locked(&self) -> bool {
        self.locked
    }
}

impl Drop for BusGuard<'_> {
    fn drop(&mut self) {
        if self.locked {
            let r = self.bus.region_ptr();
            unsafe { &*addr_of_mut!((*r).mutex) }.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_layouts_are_stable() {
        assert_eq!(std::mem::size_of::<MailRow>(), 40);
        assert_eq!(std::mem::size_of::<PayloadSlot>(), 544);
        // the control region must stay well under a few hundred KiB
        assert!(std::mem::size_of::<BusRegion>() < 256 * 1024);
    }

    #[test]
    fn tombstone_is_empty() {
        assert_eq!(TOMBSTONE.msg, 0);
        assert_eq!(TOMBSTONE.payload_idx, -1);
    }
}
