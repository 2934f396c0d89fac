//! Thin wrapper around a POSIX shared memory object mapped into this process

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

use tracing::{debug, warn};


pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    c_name: CString,
    /// the handle that created the object removes its name when it is dropped
    unlink_on_drop: bool,
}

// SAFETY: the mapping is plain shared memory, access is synchronized by the segment's lock
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Creates a new shared memory object of `len` zero bytes and maps it. Returns `None` if an
    ///  object of that name exists already.
    pub fn create(c_name: &CString, len: usize) -> io::Result<Option<Mapping>> {
        // SAFETY: c_name is a valid null-terminated string, and the result is checked below
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::AlreadyExists {
                return Ok(None);
            }
            return Err(err);
        }

        let len_as_off_t = match libc::off_t::try_from(len) {
            Ok(l) => l,
            Err(_) => {
                close_and_unlink(fd, c_name);
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "segment size exceeds the platform limit"));
            }
        };

        // SAFETY: fd is valid from the successful shm_open above. ftruncate zero-fills.
        if unsafe { libc::ftruncate(fd, len_as_off_t) } < 0 {
            let err = io::Error::last_os_error();
            close_and_unlink(fd, c_name);
            return Err(err);
        }

        match map(fd, len) {
            Ok(ptr) => Ok(Some(Mapping {
                ptr,
                len,
                c_name: c_name.clone(),
                unlink_on_drop: true,
            })),
            Err(e) => {
                // SAFETY: c_name is a valid null-terminated string
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                Err(e)
            }
        }
    }

    /// Maps an existing shared memory object in its entirety
    pub fn open(c_name: &CString) -> io::Result<Mapping> {
        // SAFETY: c_name is a valid null-terminated string, and the result is checked below
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `stat` is plain old data, so all zero bits is a valid value
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fd is valid, and `stat` is a properly sized, writable struct
        if unsafe { libc::fstat(fd, &mut stat) } < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used afterwards
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let len = match usize::try_from(stat.st_size) {
            Ok(len) if len > 0 => len,
            _ => {
                // SAFETY: fd is valid and not used afterwards
                unsafe { libc::close(fd) };
                return Err(io::Error::new(io::ErrorKind::InvalidData, "shared memory object has no content"));
            }
        };

        let ptr = map(fd, len)?;
        Ok(Mapping {
            ptr,
            len,
            c_name: c_name.clone(),
            unlink_on_drop: false,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr and len are exactly what mmap returned / was called with, and the mapping is
        //  not accessed after this
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }

        if self.unlink_on_drop {
            // SAFETY: c_name is a valid null-terminated string
            if unsafe { libc::shm_unlink(self.c_name.as_ptr()) } < 0 {
                warn!(error = ?io::Error::last_os_error(), "could not unlink shared memory segment {:?}", self.c_name);
            }
            else {
                debug!("unlinked shared memory segment {:?}", self.c_name);
            }
        }
    }
}

/// maps `len` bytes of the object, closing the file descriptor in any case
fn map(fd: libc::c_int, len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: fd is a valid shared memory object of at least `len` bytes, the kernel chooses the
    //  address, and the result is checked for MAP_FAILED below
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    let err = io::Error::last_os_error();

    // SAFETY: fd is valid; the mapping keeps its own reference to the object
    unsafe { libc::close(fd) };

    if ptr == libc::MAP_FAILED {
        return Err(err);
    }
    NonNull::new(ptr as *mut u8)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned a null pointer"))
}

fn close_and_unlink(fd: libc::c_int, c_name: &CString) {
    // SAFETY: fd is valid and not used afterwards, c_name is a valid null-terminated string
    unsafe {
        libc::close(fd);
        libc::shm_unlink(c_name.as_ptr());
    }
}
