// src/sync.rs
//
// Process-shared pthread primitives, laid out so they can live inside a
// mapped region. Each wrapper is `#[repr(C)]` over the raw libc type;
// `init` runs once in the creating process with PTHREAD_PROCESS_SHARED
// set, every other process just uses the mapped bytes.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use crate::clock::realtime_deadline;
use crate::error::{Error, Result};

/// Process-shared mutex living in a mapped region.
#[repr(C)]
pub struct SharedMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

// Safety: pthread process-shared mutexes are made for concurrent use from
// any thread of any process that maps them.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initialize the mutex in place with PTHREAD_PROCESS_SHARED.
    ///
    /// # Safety
    /// `this` must point into a mapped region; only the creating process
    /// may call this, exactly once, before any other process touches it.
    pub unsafe fn init(this: *mut SharedMutex) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        libc::pthread_mutexattr_init(attr.as_mut_ptr());
        libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        let rc = libc::pthread_mutex_init((*this).raw.get(), attr.as_ptr());
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        if rc != 0 {
            return Err(Error::internal(format!("pthread_mutex_init: rc={rc}")));
        }
        Ok(())
    }

    /// # Safety
    /// No thread of any process may be holding or waiting on the mutex.
    pub unsafe fn destroy(this: *mut SharedMutex) {
        libc::pthread_mutex_destroy((*this).raw.get());
    }

    pub fn lock(&self) {
        unsafe {
            libc::pthread_mutex_lock(self.raw.get());
        }
    }

    pub fn try_lock(&self) -> bool {
        unsafe { libc::pthread_mutex_trylock(self.raw.get()) == 0 }
    }

    pub fn unlock(&self) {
        unsafe {
            libc::pthread_mutex_unlock(self.raw.get());
        }
    }

    pub(crate) fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.raw.get()
    }
}

/// Process-shared condition variable living in a mapped region.
///
/// Keeps the default (realtime) clock; deadlines for `timedwait_ms` are
/// computed by [`crate::clock::realtime_deadline`].
#[repr(C)]
pub struct SharedCondvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// # Safety
    /// Same contract as [`SharedMutex::init`].
    pub unsafe fn init(this: *mut SharedCondvar) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        libc::pthread_condattr_init(attr.as_mut_ptr());
        libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        let rc = libc::pthread_cond_init((*this).raw.get(), attr.as_ptr());
        libc::pthread_condattr_destroy(attr.as_mut_ptr());
        if rc != 0 {
            return Err(Error::internal(format!("pthread_cond_init: rc={rc}")));
        }
        Ok(())
    }

    /// # Safety
    /// No thread of any process may be waiting on the condvar.
    pub unsafe fn destroy(this: *mut SharedCondvar) {
        libc::pthread_cond_destroy((*this).raw.get());
    }

    /// Wait until signalled. The caller must hold `mutex`.
    pub fn wait(&self, mutex: &SharedMutex) {
        unsafe {
            libc::pthread_cond_wait(self.raw.get(), mutex.raw());
        }
    }

    /// Wait up to `timeout_ms`. Returns false on timeout. The caller must
    /// hold `mutex`.
    pub fn timedwait_ms(&self, mutex: &SharedMutex, timeout_ms: u64) -> bool {
        let deadline = realtime_deadline(timeout_ms);
        let rc = unsafe { libc::pthread_cond_timedwait(self.raw.get(), mutex.raw(), &deadline) };
        rc != libc::ETIMEDOUT
    }

    pub fn signal(&self) {
        unsafe {
            libc::pthread_cond_signal(self.raw.get());
        }
    }

    pub fn broadcast(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.raw.get());
        }
    }
}

/// Process-shared counting semaphore living in a mapped region.
#[repr(C)]
pub struct SharedSem {
    raw: UnsafeCell<libc::sem_t>,
}

unsafe impl Send for SharedSem {}
unsafe impl Sync for SharedSem {}

impl SharedSem {
    /// # Safety
    /// Same contract as [`SharedMutex::init`].
    pub unsafe fn init(this: *mut SharedSem, value: u32) -> Result<()> {
        if libc::sem_init((*this).raw.get(), 1, value) != 0 {
            return Err(Error::last_os("sem_init"));
        }
        Ok(())
    }

    /// # Safety
    /// No thread of any process may be waiting on the semaphore.
    pub unsafe fn destroy(this: *mut SharedSem) {
        libc::sem_destroy((*this).raw.get());
    }

    /// Non-blocking decrement. Returns false when the count is zero.
    pub fn try_wait(&self) -> bool {
        unsafe { libc::sem_trywait(self.raw.get()) == 0 }
    }

    pub fn post(&self) {
        unsafe {
            libc::sem_post(self.raw.get());
        }
    }
}
