// src/media.rs
//
// Bounded shared-memory ring for media-like streaming: fixed-max-size
// byte frames with 64-bit timestamps, single producer and single consumer
// across processes. Two counting semaphores carry the correctness story
// (never more than elem_count outstanding, never a read of empty); the
// condition variable is only an advisory notifier for `timedwait`.

use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::clock::now_ms;
use crate::error::{Error, Result};
use crate::shm::ShmRegion;
use crate::sync::{SharedCondvar, SharedMutex, SharedSem};

#[repr(C)]
struct RingHeader {
    rptr: AtomicI32,
    wptr: AtomicI32,
    /// Producer gate; the consumer still drains when off.
    control: AtomicU8,
    rsem: SharedSem,
    wsem: SharedSem,
    mutex: SharedMutex,
    cond: SharedCondvar,
}

/// Slot descriptor. `buf` holds the creator's mapping address of the
/// slot's data and exists for layout agreement only — peers address data
/// by index from their own mapping and never dereference it.
#[repr(C)]
#[derive(Clone, Copy)]
struct RingSlot {
    buf: u64,
    size: u32,
    timestamp: u64,
}

const _: () = assert!(std::mem::size_of::<RingSlot>() == 24);

/// A bounded SPSC ring over a caller-named shared region.
///
/// The first opener creates and initializes; later openers map the same
/// name with the same geometry. One process should write and one read;
/// the ring does not police that.
pub struct MediaRing {
    region: ShmRegion,
    name: String,
    elem_size: u32,
    elem_count: u32,
}

impl MediaRing {
    pub fn open(name: &str, elem_size: u32, elem_count: u32) -> Result<MediaRing> {
        if elem_size == 0 || elem_count == 0 {
            return Err(Error::invalid_argument(
                "element size and count must be non-zero",
            ));
        }
        let total = Self::region_size(elem_size, elem_count);
        let (region, created) = ShmRegion::open_or_create(name, total)?;
        let ring = MediaRing {
            region,
            name: name.to_owned(),
            elem_size,
            elem_count,
        };
        if created {
            let h = ring.header();
            unsafe {
                (*h).rptr.store(0, Ordering::Release);
                (*h).wptr.store(0, Ordering::Release);
                (*h).control.store(1, Ordering::Release);
                SharedSem::init(addr_of_mut!((*h).rsem), 0)?;
                SharedSem::init(addr_of_mut!((*h).wsem), elem_count)?;
                SharedMutex::init(addr_of_mut!((*h).mutex))?;
                SharedCondvar::init(addr_of_mut!((*h).cond))?;
                for i in 0..elem_count {
                    let slot = ring.slot_ptr(i);
                    (*slot).buf = ring.data_ptr(i) as u64;
                    (*slot).size = 0;
                    (*slot).timestamp = 0;
                }
            }
            debug!(name, elem_size, elem_count, "created media ring");
        }
        Ok(ring)
    }

    fn region_size(elem_size: u32, elem_count: u32) -> usize {
        std::mem::size_of::<RingHeader>()
            + std::mem::size_of::<RingSlot>() * elem_count as usize
            + (elem_size as usize) * (elem_count as usize)
    }

    fn header(&self) -> *mut RingHeader {
        self.region.as_ptr() as *mut RingHeader
    }

    /// # Safety
    /// `idx` must be below `elem_count`.
    unsafe fn slot_ptr(&self, idx: u32) -> *mut RingSlot {
        let base = self.region.as_ptr().add(std::mem::size_of::<RingHeader>()) as *mut RingSlot;
        base.add(idx as usize)
    }

    /// # Safety
    /// `idx` must be below `elem_count`.
    unsafe fn data_ptr(&self, idx: u32) -> *mut u8 {
        self.region
            .as_ptr()
            .add(std::mem::size_of::<RingHeader>())
            .add(std::mem::size_of::<RingSlot>() * self.elem_count as usize)
            .add(self.elem_size as usize * idx as usize)
    }

    pub fn elem_size(&self) -> u32 {
        self.elem_size
    }

    pub fn elem_count(&self) -> u32 {
        self.elem_count
    }

    /// Append one frame, waiting up to `wait_ms` for a free slot.
    ///
    /// Errors: `Stopped` while the control flag is off, `InvalidArgument`
    /// for frames above `elem_size`, `Timeout` when no slot freed in time.
    pub fn write(&self, buf: &[u8], timestamp: u64, wait_ms: u64) -> Result<()> {
        let h = self.header();
        if unsafe { &(*h).control }.load(Ordering::Acquire) == 0 {
            return Err(Error::stopped("media ring is stopped"));
        }
        if buf.len() > self.elem_size as usize {
            return Err(Error::invalid_argument(format!(
                "frame of {} bytes exceeds element size {}",
                buf.len(),
                self.elem_size
            )));
        }

        let deadline = now_ms() + wait_ms as i64;
        let mut step = 1u64;
        while now_ms() < deadline {
            if unsafe { &(*h).wsem }.try_wait() {
                unsafe {
                    let idx = (*h).wptr.load(Ordering::Acquire) as u32 % self.elem_count;
                    std::ptr::copy_nonoverlapping(buf.as_ptr(), self.data_ptr(idx), buf.len());
                    let slot = self.slot_ptr(idx);
                    (*slot).size = buf.len() as u32;
                    (*slot).timestamp = timestamp;
                    (*h).wptr
                        .store(((idx + 1) % self.elem_count) as i32, Ordering::Release);
                    (*h).rsem.post();
                    (*h).mutex.lock();
                    (*h).cond.signal();
                    (*h).mutex.unlock();
                }
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(step));
            step += 1;
        }
        Err(Error::timeout(format!("no free slot within {wait_ms}ms")))
    }

    /// Take one frame, waiting up to `wait_ms` for data. `buf` must hold
    /// at least `elem_size` bytes. Returns the frame's size and timestamp.
    pub fn read(&self, buf: &mut [u8], wait_ms: u64) -> Result<(u32, u64)> {
        if buf.len() < self.elem_size as usize {
            return Err(Error::invalid_argument(format!(
                "read buffer of {} bytes below element size {}",
                buf.len(),
                self.elem_size
            )));
        }
        let h = self.header();
        let deadline = now_ms() + wait_ms as i64;
        let mut step = 1u64;
        while now_ms() < deadline {
            if unsafe { &(*h).rsem }.try_wait() {
                let (size, timestamp) = unsafe {
                    let idx = (*h).rptr.load(Ordering::Acquire) as u32 % self.elem_count;
                    let slot = self.slot_ptr(idx);
                    let size = (*slot).size.min(self.elem_size);
                    let timestamp = (*slot).timestamp;
                    std::ptr::copy_nonoverlapping(
                        self.data_ptr(idx),
                        buf.as_mut_ptr(),
                        size as usize,
                    );
                    (*h).rptr
                        .store(((idx + 1) % self.elem_count) as i32, Ordering::Release);
                    (*h).wsem.post();
                    (size, timestamp)
                };
                return Ok((size, timestamp));
            }
            std::thread::sleep(Duration::from_millis(step));
            step += 1;
        }
        Err(Error::timeout(format!("no frame within {wait_ms}ms")))
    }

    /// Block on the advisory condition up to `wait_ms` without consuming.
    /// True when signalled, false on timeout.
    pub fn timedwait(&self, wait_ms: u64) -> bool {
        let h = self.header();
        unsafe {
            (*h).mutex.lock();
            let signalled = (*h).cond.timedwait_ms(&(*h).mutex, wait_ms);
            (*h).mutex.unlock();
            signalled
        }
    }

    /// Enable or disable the producer. The consumer still drains while
    /// disabled.
    pub fn control(&self, start: bool) {
        let h = self.header();
        unsafe { &(*h).control }.store(start as u8, Ordering::Release);
    }

    /// Remove the region name. Existing mappings stay valid.
    pub fn unlink(&self) -> Result<()> {
        ShmRegion::unlink(&self.name)
    }
}
