//! Raw network I/O: UDP datagrams (unicast or multicast) and length prefixed TCP messages.
//!
//! Nothing in here knows about envelopes. Each receiving component owns a background task that
//!  invokes the application's callback synchronously, one payload at a time and in arrival order.
//!  The task is stopped by a broadcast 'cancel' signal when the component is dropped.

pub mod tcp_connection;
pub mod tcp_server;
pub mod udp_receiver;
pub mod udp_sender;

pub use tcp_connection::{TcpConfig, TcpConnection};
pub use tcp_server::TcpServer;
pub use udp_receiver::{UdpReceiver, UdpReceiverConfig};
pub use udp_sender::{UdpSender, UdpSenderConfig};

use std::io;


#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint {endpoint} is unavailable: {source}")]
    Unavailable {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("message of {len} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },
    #[error("connection is closed")]
    ConnectionClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    pub(crate) fn unavailable(endpoint: impl ToString, source: io::Error) -> TransportError {
        TransportError::Unavailable {
            endpoint: endpoint.to_string(),
            source,
        }
    }

    /// the numeric OS error code corresponding to this error
    pub fn error_code(&self) -> i32 {
        match self {
            TransportError::Unavailable { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            TransportError::MessageTooLarge { .. } => libc::E2BIG,
            TransportError::ConnectionClosed => libc::ENOTCONN,
            TransportError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}


/// The outcome of a send operation: the number of bytes written and the OS error code, `0`
///  meaning success.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SendStatus {
    pub bytes_sent: usize,
    pub error_code: i32,
}

impl SendStatus {
    pub fn ok(bytes_sent: usize) -> SendStatus {
        SendStatus {
            bytes_sent,
            error_code: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }
}

impl From<Result<usize, TransportError>> for SendStatus {
    fn from(value: Result<usize, TransportError>) -> Self {
        match value {
            Ok(bytes_sent) => SendStatus::ok(bytes_sent),
            Err(e) => SendStatus {
                bytes_sent: 0,
                error_code: e.error_code(),
            },
        }
    }
}
