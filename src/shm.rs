// src/shm.rs

use std::ffi::CString;
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// A named POSIX shared-memory region mapped into this process.
///
/// Each instance owns one mapping; several instances (in one process or
/// many) may map the same name. Dropping unmaps but never unlinks — the
/// name outlives any single mapping and is removed explicitly by the last
/// participant via [`ShmRegion::unlink`].
pub struct ShmRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the mapping stays valid until munmap; concurrent access is the
// responsibility of the process-shared primitives placed inside it.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

fn c_name(name: &str) -> Result<CString> {
    if !name.starts_with('/') || name.len() < 2 {
        return Err(Error::invalid_argument(format!(
            "shm name must start with '/': {name:?}"
        )));
    }
    CString::new(name).map_err(|_| Error::invalid_argument("shm name contains NUL"))
}

impl ShmRegion {
    /// Open the named region, creating and sizing it when it does not
    /// exist yet. Returns the mapping and whether this call created it.
    ///
    /// Creator election uses `O_CREAT | O_EXCL`, so exactly one opener
    /// observes `created == true` and is responsible for initializing the
    /// region's contents (the kernel zero-fills the pages).
    pub fn open_or_create(name: &str, len: usize) -> Result<(ShmRegion, bool)> {
        let cname = c_name(name)?;
        let mut created = true;
        let mut fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o666,
            )
        };
        if fd >= 0 {
            if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
                let err = Error::last_os(format!("ftruncate {name}"));
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(cname.as_ptr());
                }
                return Err(err);
            }
        } else {
            created = false;
            fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o666) };
            if fd < 0 {
                return Err(Error::last_os(format!("shm_open {name}")));
            }
        }

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe {
            libc::close(fd);
        }
        if base == libc::MAP_FAILED {
            return Err(Error::last_os(format!("mmap {name}")));
        }

        let ptr = NonNull::new(base as *mut u8)
            .ok_or_else(|| Error::internal(format!("mmap {name} returned null")))?;
        Ok((ShmRegion { ptr, len }, created))
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove the region name. Existing mappings stay valid until unmapped.
    pub fn unlink(name: &str) -> Result<()> {
        let cname = c_name(name)?;
        unsafe {
            libc::shm_unlink(cname.as_ptr());
        }
        Ok(())
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}
