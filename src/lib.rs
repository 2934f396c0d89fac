//! Brokerless, timestamped publish / subscribe messaging between processes, plus shared memory
//!  segments for exchanging bulk data on a single host.
//!
//! * [session::OD4Session] exchanges [envelope::Envelope]s with all other sessions of the same
//!    group via UDP multicast, dispatching received envelopes to callbacks by their data type.
//! * [transport] has the raw UDP and TCP building blocks, usable on their own.
//! * [shm::SharedMemorySegment] is a named shared memory region with a cross-process lock and
//!    wait / notify.
//!
//! Envelopes are encoded in a wire format that is compatible with the `libcluon` ecosystem, see
//!  [envelope] for details.

pub mod envelope;
pub mod proto;
pub mod session;
#[cfg(unix)]
pub mod shm;
pub mod time;
pub mod transport;
pub mod util;

#[cfg(test)]
pub mod test_util;

pub use envelope::Envelope;
pub use session::{OD4Session, SessionConfig, SessionError, TriggerControl, TriggerId};
#[cfg(unix)]
pub use shm::{SegmentError, SharedMemorySegment};
pub use time::TimeStamp;
pub use transport::{SendStatus, TransportError};
