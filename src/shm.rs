//! Named shared memory segments for exchanging bulk data between processes on the same host.
//!
//! A [SharedMemorySegment] is a fixed-size data region with an associated [TimeStamp], protected
//!  by a lock that is mutually exclusive across all handles and processes. Data and timestamp can
//!  only be accessed while holding the lock. Independently of the lock, handles can block in
//!  [SharedMemorySegment::wait] until some handle calls [SharedMemorySegment::notify_all].
//!
//! A typical producer locks the segment, writes data and timestamp, unlocks it and notifies all
//!  consumers. Consumers wait, then lock the segment to read.
//!
//! NB: wakeups can be spurious, and a notification that happens before a handle starts waiting is
//!  not seen by that handle. Consumers should check a timestamp or sequence number in the data.

mod futex;
mod mapping;
mod segment_header;

use std::ffi::CString;
use std::io;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::shm::mapping::Mapping;
use crate::shm::segment_header::{SegmentHeader, HEADER_LEN};
use crate::time::TimeStamp;
use crate::util::safe_converter::PrecheckedCast;

/// how often opening retries while a concurrent creator initializes the segment
const OPEN_ATTEMPTS: usize = 100;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(1);
const MAX_NAME_LEN: usize = 255;


#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("the shared memory segment is invalid")]
    Invalid,
    #[error("this handle does not hold the segment's lock")]
    NotLocked,
    #[error("this handle holds the segment's lock already")]
    AlreadyLocked,
    #[error("{len} bytes do not fit into a segment of {size} bytes")]
    TooLarge { len: usize, size: usize },
    #[error("invalid segment name {0:?}")]
    InvalidName(String),
    #[error("segment {0} has an invalid or uninitialized header")]
    BadHeader(String),
    #[error(transparent)]
    Os(#[from] io::Error),
}


/// A handle to a named shared memory segment.
///
/// The handle that creates a segment removes its name when it is dropped. Handles that attached
///  to the segment keep their mapping until they are dropped.
pub struct SharedMemorySegment {
    name: String,
    mapping: Option<Mapping>,
    locked: bool,
}

impl SharedMemorySegment {
    /// Creates a segment with `size` bytes of data, or attaches to an existing segment of that
    ///  name if `size` is 0.
    ///
    /// This never fails: if the segment can not be created or attached to, the result is an
    ///  invalid handle (see [SharedMemorySegment::valid]). Use [SharedMemorySegment::create] or
    ///  [SharedMemorySegment::open] to get at the error.
    pub fn new(name: &str, size: usize) -> SharedMemorySegment {
        let result = if size > 0 {
            Self::create(name, size)
        }
        else {
            Self::open(name)
        };

        match result {
            Ok(segment) => segment,
            Err(e) => {
                warn!(error = %e, "shared memory segment {:?} is invalid", name);
                SharedMemorySegment {
                    name: normalize_name(name),
                    mapping: None,
                    locked: false,
                }
            }
        }
    }

    /// Creates a segment with `size` bytes of data. If a segment of that name exists already,
    ///  this attaches to it instead, and the existing segment's size takes precedence.
    pub fn create(name: &str, size: usize) -> Result<SharedMemorySegment, SegmentError> {
        let (name, c_name) = checked_name(name)?;
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "segment size must be positive").into());
        }

        match Mapping::create(&c_name, HEADER_LEN + size)? {
            Some(mapping) => {
                let segment = SharedMemorySegment {
                    name,
                    mapping: Some(mapping),
                    locked: false,
                };
                segment.header()?.init(size.prechecked_cast());
                info!("created shared memory segment {} with {} bytes", segment.name, size);
                Ok(segment)
            }
            None => {
                debug!("shared memory segment {} exists already, attaching", name);
                Self::open_checked(name, &c_name)
            }
        }
    }

    /// Attaches to an existing segment
    pub fn open(name: &str) -> Result<SharedMemorySegment, SegmentError> {
        let (name, c_name) = checked_name(name)?;
        Self::open_checked(name, &c_name)
    }

    fn open_checked(name: String, c_name: &CString) -> Result<SharedMemorySegment, SegmentError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::try_open(&name, c_name) {
                Err(SegmentError::BadHeader(_)) if attempt < OPEN_ATTEMPTS => std::thread::sleep(OPEN_RETRY_DELAY),
                Err(SegmentError::Os(e)) if e.kind() == io::ErrorKind::InvalidData && attempt < OPEN_ATTEMPTS => std::thread::sleep(OPEN_RETRY_DELAY),
                result => return result,
            }
        }
    }

    fn try_open(name: &str, c_name: &CString) -> Result<SharedMemorySegment, SegmentError> {
        let mapping = Mapping::open(c_name)?;
        if mapping.len() < HEADER_LEN {
            return Err(SegmentError::BadHeader(name.to_string()));
        }

        let segment = SharedMemorySegment {
            name: name.to_string(),
            mapping: Some(mapping),
            locked: false,
        };

        let header = segment.header()?;
        if !header.is_initialized() || header.data_size() != (segment.mapped_len() - HEADER_LEN) as u64 {
            return Err(SegmentError::BadHeader(name.to_string()));
        }

        info!("attached to shared memory segment {} with {} bytes", segment.name, segment.size());
        Ok(segment)
    }

    pub fn valid(&self) -> bool {
        self.mapping.is_some()
    }

    /// the segment's name, including the leading `/`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// the size of the data region, 0 for an invalid handle
    pub fn size(&self) -> usize {
        self.mapped_len().saturating_sub(HEADER_LEN)
    }

    /// whether this handle holds the lock
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Acquires the segment's lock, blocking while any other handle holds it. The lock is not
    ///  reentrant.
    pub fn lock(&mut self) -> Result<(), SegmentError> {
        let header = self.header()?;
        if self.locked {
            return Err(SegmentError::AlreadyLocked);
        }
        header.lock();
        self.locked = true;
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<(), SegmentError> {
        let header = self.header()?;
        if !self.locked {
            return Err(SegmentError::NotLocked);
        }
        header.unlock();
        self.locked = false;
        Ok(())
    }

    /// Blocks until some handle calls [SharedMemorySegment::notify_all]. This neither requires nor
    ///  acquires the lock. Calling it while holding the lock keeps other handles from accessing
    ///  the data for the entire wait.
    pub fn wait(&self) -> Result<(), SegmentError> {
        self.header()?.wait();
        Ok(())
    }

    /// Returns `false` if there was no notification before the timeout expired
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, SegmentError> {
        Ok(self.header()?.wait_timeout(timeout))
    }

    /// Wakes all handles blocked in [SharedMemorySegment::wait], in all processes
    pub fn notify_all(&self) -> Result<(), SegmentError> {
        self.header()?.notify_all();
        Ok(())
    }

    pub fn data(&self) -> Result<&[u8], SegmentError> {
        let data_ptr = self.checked_data_ptr()?;
        // SAFETY: the data region lies entirely inside the mapping, and holding the lock excludes
        //  concurrent writers. The slice borrows `self`, so it can not outlive the lock, which
        //  requires `&mut self` to release.
        Ok(unsafe { std::slice::from_raw_parts(data_ptr, self.size()) })
    }

    /// Writes `data` to the start of the data region, leaving the rest unchanged
    pub fn set_data(&mut self, data: &[u8]) -> Result<(), SegmentError> {
        if data.len() > self.size() && self.valid() {
            return Err(SegmentError::TooLarge {
                len: data.len(),
                size: self.size(),
            });
        }
        self.with_data_mut(|buf| buf[..data.len()].copy_from_slice(data))
    }

    pub fn with_data_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, SegmentError> {
        let data_ptr = self.checked_data_ptr()?;
        // SAFETY: see `data()`; the exclusive borrow of `self` prevents aliasing through this handle
        let data = unsafe { std::slice::from_raw_parts_mut(data_ptr, self.size()) };
        Ok(f(data))
    }

    pub fn timestamp(&self) -> Result<TimeStamp, SegmentError> {
        let header = self.header()?;
        self.check_locked()?;
        Ok(header.timestamp())
    }

    pub fn set_timestamp(&mut self, ts: TimeStamp) -> Result<(), SegmentError> {
        let header = self.header()?;
        self.check_locked()?;
        header.set_timestamp(ts);
        Ok(())
    }

    fn header(&self) -> Result<&SegmentHeader, SegmentError> {
        match &self.mapping {
            // SAFETY: the mapping is page aligned and at least HEADER_LEN bytes long (checked when
            //  creating / opening), and the header consists of atomics only
            Some(mapping) => Ok(unsafe { &*(mapping.as_ptr() as *const SegmentHeader) }),
            None => Err(SegmentError::Invalid),
        }
    }

    fn check_locked(&self) -> Result<(), SegmentError> {
        if self.locked {
            Ok(())
        }
        else {
            Err(SegmentError::NotLocked)
        }
    }

    fn checked_data_ptr(&self) -> Result<*mut u8, SegmentError> {
        match &self.mapping {
            Some(mapping) => {
                self.check_locked()?;
                // SAFETY: HEADER_LEN is inside the mapping
                Ok(unsafe { mapping.as_ptr().add(HEADER_LEN) })
            }
            None => Err(SegmentError::Invalid),
        }
    }

    fn mapped_len(&self) -> usize {
        self.mapping.as_ref()
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        if self.locked {
            debug!("releasing lock on shared memory segment {} held by dropped handle", self.name);
            if let Ok(header) = self.header() {
                header.unlock();
            }
            self.locked = false;
        }
    }
}

fn normalize_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    }
    else {
        format!("/{}", name)
    }
}

fn checked_name(name: &str) -> Result<(String, CString), SegmentError> {
    let name = normalize_name(name);
    if name.len() < 2 || name.len() > MAX_NAME_LEN || name[1..].contains('/') {
        return Err(SegmentError::InvalidName(name));
    }
    match CString::new(name.as_bytes()) {
        Ok(c_name) => Ok((name, c_name)),
        Err(_) => Err(SegmentError::InvalidName(name)),
    }
}

#[cfg(test)]
mod test {
    use std::sync::mpsc;
    use std::thread;

    use rstest::rstest;

    use super::*;
    use crate::test_util::unique_segment_name;

    #[test]
    fn test_visibility_across_handles() {
        let name = unique_segment_name();
        let mut producer = SharedMemorySegment::new(&name, 64);
        let mut consumer = SharedMemorySegment::new(&name, 0);
        assert!(producer.valid());
        assert!(consumer.valid());
        assert_eq!(producer.size(), 64);
        assert_eq!(consumer.size(), 64);
        assert_eq!(consumer.name(), name);

        let ts = TimeStamp { seconds: 1234, microseconds: 5678 };
        producer.lock().unwrap();
        producer.set_data(b"hello").unwrap();
        producer.set_timestamp(ts).unwrap();
        producer.unlock().unwrap();

        consumer.lock().unwrap();
        assert_eq!(&consumer.data().unwrap()[..6], b"hello\0");
        assert_eq!(consumer.timestamp().unwrap(), ts);
        consumer.with_data_mut(|data| data[0] = b'j').unwrap();
        consumer.unlock().unwrap();

        producer.lock().unwrap();
        assert_eq!(&producer.data().unwrap()[..5], b"jello");
        producer.unlock().unwrap();
    }

    #[test]
    fn test_create_attaches_to_existing() {
        let name = unique_segment_name();
        let first = SharedMemorySegment::create(&name, 32).unwrap();
        let second = SharedMemorySegment::create(&name, 100).unwrap();
        assert_eq!(first.size(), 32);
        assert_eq!(second.size(), 32);
    }

    #[test]
    fn test_name_is_normalized() {
        let name = unique_segment_name();
        let segment = SharedMemorySegment::new(&name[1..], 16);
        assert!(segment.valid());
        assert_eq!(segment.name(), name);
    }

    #[test]
    fn test_is_locked_per_handle() {
        let name = unique_segment_name();
        let mut a = SharedMemorySegment::new(&name, 16);
        let b = SharedMemorySegment::new(&name, 0);

        assert!(!a.is_locked());
        a.lock().unwrap();
        assert!(a.is_locked());
        assert!(!b.is_locked());
        a.unlock().unwrap();
        assert!(!a.is_locked());
    }

    #[test]
    fn test_lock_is_exclusive_across_handles() {
        let name = unique_segment_name();
        let mut a = SharedMemorySegment::new(&name, 16);
        let mut b = SharedMemorySegment::new(&name, 0);

        a.lock().unwrap();

        let (locked_sender, locked_receiver) = mpsc::channel();
        let handle = thread::spawn(move || {
            b.lock().unwrap();
            locked_sender.send(()).unwrap();
            b.unlock().unwrap();
        });

        assert!(locked_receiver.recv_timeout(Duration::from_millis(100)).is_err());
        a.unlock().unwrap();
        locked_receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_notify_across_threads() {
        let name = unique_segment_name();
        let a = SharedMemorySegment::new(&name, 16);
        let b = SharedMemorySegment::new(&name, 0);

        let handle = thread::spawn(move || {
            b.wait().unwrap();
        });

        // a notification before the waiter blocks is lost, so keep notifying until it returns
        while !handle.is_finished() {
            a.notify_all().unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let segment = SharedMemorySegment::new(&unique_segment_name(), 16);
        assert!(!segment.wait_timeout(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn test_misuse() {
        let mut segment = SharedMemorySegment::new(&unique_segment_name(), 4);

        assert!(matches!(segment.data(), Err(SegmentError::NotLocked)));
        assert!(matches!(segment.set_data(b"x"), Err(SegmentError::NotLocked)));
        assert!(matches!(segment.timestamp(), Err(SegmentError::NotLocked)));
        assert!(matches!(segment.set_timestamp(TimeStamp::EPOCH), Err(SegmentError::NotLocked)));
        assert!(matches!(segment.unlock(), Err(SegmentError::NotLocked)));

        segment.lock().unwrap();
        assert!(matches!(segment.lock(), Err(SegmentError::AlreadyLocked)));
        assert!(matches!(segment.set_data(b"12345"), Err(SegmentError::TooLarge { len: 5, size: 4 })));
        segment.set_data(b"1234").unwrap();
        segment.unlock().unwrap();
    }

    #[test]
    fn test_attach_to_missing_segment_is_invalid() {
        let mut segment = SharedMemorySegment::new(&unique_segment_name(), 0);
        assert!(!segment.valid());
        assert_eq!(segment.size(), 0);

        assert!(matches!(segment.lock(), Err(SegmentError::Invalid)));
        assert!(matches!(segment.unlock(), Err(SegmentError::Invalid)));
        assert!(matches!(segment.data(), Err(SegmentError::Invalid)));
        assert!(matches!(segment.set_data(b"x"), Err(SegmentError::Invalid)));
        assert!(matches!(segment.wait_timeout(Duration::from_millis(1)), Err(SegmentError::Invalid)));
        assert!(matches!(segment.notify_all(), Err(SegmentError::Invalid)));
        assert!(matches!(segment.timestamp(), Err(SegmentError::Invalid)));
    }

    #[rstest]
    #[case::empty("")]
    #[case::only_slash("/")]
    #[case::inner_slash("/a/b")]
    #[case::nul("/a\0b")]
    fn test_invalid_name(#[case] name: &str) {
        assert!(matches!(SharedMemorySegment::create(name, 16), Err(SegmentError::InvalidName(_))));
        assert!(!SharedMemorySegment::new(name, 16).valid());
    }

    #[test]
    fn test_name_too_long() {
        let name = format!("/{}", "x".repeat(MAX_NAME_LEN));
        assert!(matches!(SharedMemorySegment::open(&name), Err(SegmentError::InvalidName(_))));
    }

    #[test]
    fn test_create_with_size_zero() {
        assert!(matches!(SharedMemorySegment::create(&unique_segment_name(), 0), Err(SegmentError::Os(_))));
    }

    #[test]
    fn test_drop_releases_lock() {
        let name = unique_segment_name();
        let mut creator = SharedMemorySegment::new(&name, 16);
        let mut other = SharedMemorySegment::new(&name, 0);

        other.lock().unwrap();
        drop(other);

        let (locked_sender, locked_receiver) = mpsc::channel();
        let handle = thread::spawn(move || {
            creator.lock().unwrap();
            locked_sender.send(()).unwrap();
        });
        locked_receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_creator_unlinks_on_drop() {
        let name = unique_segment_name();
        let creator = SharedMemorySegment::new(&name, 16);
        let attached = SharedMemorySegment::new(&name, 0);
        assert!(attached.valid());

        drop(creator);
        assert!(matches!(SharedMemorySegment::open(&name), Err(SegmentError::Os(_))));

        // the mapping of the attached handle stays usable
        assert!(attached.notify_all().is_ok());
    }
}
