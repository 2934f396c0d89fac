use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;

use anyhow::bail;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::transport::{SendStatus, TransportError};
use crate::util::callback::invoke_guarded;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};


#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Messages longer than this are rejected when sending. Receiving a longer message is treated
    ///  as a protocol violation and terminates the connection.
    pub max_message_len: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            max_message_len: 16*1024*1024,
        }
    }
}

impl TcpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_len == 0 {
            bail!("max message length must be positive");
        }
        if self.max_message_len > u32::MAX as usize {
            bail!("max message length {} does not fit into the four byte length prefix", self.max_message_len);
        }
        Ok(())
    }
}


type OnMessage = Arc<dyn Fn(&[u8], SystemTime) + Send + Sync>;
type OnConnectionLost = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ConnectionHandlers {
    on_message: RwLock<Option<OnMessage>>,
    on_connection_lost: Mutex<Option<OnConnectionLost>>,
}

impl ConnectionHandlers {
    fn on_message(&self, msg: &[u8], receive_time: SystemTime) {
        // cloned so the callback runs without holding the lock, allowing it to replace itself
        let handler = self.on_message.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match handler {
            Some(handler) => {
                invoke_guarded("tcp on_message", || handler(msg, receive_time));
            }
            None => trace!("no message handler installed, dropping message of {} bytes", msg.len()),
        }
    }

    /// Drops the message handler, which may hold a reference to the connection itself
    fn clear_on_message(&self) {
        let handler = self.on_message.write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(handler);
    }

    fn on_connection_lost(&self) {
        // taken out, so it can fire at most once
        let handler = self.on_connection_lost.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handler) = handler {
            invoke_guarded("tcp on_connection_lost", handler);
        }
    }
}


/// A TCP connection exchanging discrete messages. Each message is framed by a four byte big
///  endian length prefix.
///
/// Incoming messages are passed to the `on_message` handler on the connection's reader task, one
///  at a time. When the peer closes the connection or an I/O error occurs, `on_connection_lost`
///  is called exactly once. Dropping the connection closes it without calling `on_connection_lost`.
///
/// Connections accepted by a [crate::transport::TcpServer] are handed to the application before
///  their reader task starts, so handlers installed with [TcpConnection::set_on_message] and
///  [TcpConnection::set_on_connection_lost] during the server's callback see every message.
pub struct TcpConnection {
    peer_addr: SocketAddr,
    config: TcpConfig,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// present until the reader task is started
    reader: Mutex<Option<OwnedReadHalf>>,
    handlers: Arc<ConnectionHandlers>,
    running: Arc<AtomicBool>,
    cancel_sender: broadcast::Sender<()>,
}

impl TcpConnection {
    pub async fn connect<M, L>(address: &str, port: u16, on_message: M, on_connection_lost: L) -> Result<TcpConnection, TransportError>
    where
        M: Fn(&[u8], SystemTime) + Send + Sync + 'static,
        L: FnOnce() + Send + 'static,
    {
        Self::connect_with_config(address, port, TcpConfig::default(), on_message, on_connection_lost).await
    }

    pub async fn connect_with_config<M, L>(address: &str, port: u16, config: TcpConfig, on_message: M, on_connection_lost: L) -> Result<TcpConnection, TransportError>
    where
        M: Fn(&[u8], SystemTime) + Send + Sync + 'static,
        L: FnOnce() + Send + 'static,
    {
        config.validate()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{:#}", e)))?;

        let endpoint = format!("{}:{}", address, port);
        let stream = TcpStream::connect((address, port)).await
            .map_err(|e| TransportError::unavailable(&endpoint, e))?;
        let peer_addr = stream.peer_addr()?;
        info!("connected to {:?}", peer_addr);

        let connection = TcpConnection::from_stream(stream, peer_addr, config);
        connection.set_on_message(on_message);
        connection.set_on_connection_lost(on_connection_lost);
        connection.start_reading();
        Ok(connection)
    }

    /// Wraps a connected stream. Nothing is read from it before [TcpConnection::start_reading].
    pub(crate) fn from_stream(stream: TcpStream, peer_addr: SocketAddr, config: TcpConfig) -> TcpConnection {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = ?e, "could not set TCP_NODELAY for connection to {:?}", peer_addr);
        }

        let (read_half, write_half) = stream.into_split();
        let (cancel_sender, _) = broadcast::channel(1);

        TcpConnection {
            peer_addr,
            config,
            writer: tokio::sync::Mutex::new(write_half),
            reader: Mutex::new(Some(read_half)),
            handlers: Default::default(),
            running: Arc::new(AtomicBool::new(true)),
            cancel_sender,
        }
    }

    pub(crate) fn start_reading(&self) {
        let read_half = self.reader.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match read_half {
            Some(read_half) => {
                tokio::spawn(receive_loop(
                    read_half,
                    self.peer_addr,
                    self.config.max_message_len,
                    self.handlers.clone(),
                    self.running.clone(),
                    self.cancel_sender.subscribe(),
                ));
            }
            None => debug!("reader task for {:?} was started already", self.peer_addr),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn set_on_message(&self, on_message: impl Fn(&[u8], SystemTime) + Send + Sync + 'static) {
        *self.handlers.on_message.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(on_message));
    }

    pub fn set_on_connection_lost(&self, on_connection_lost: impl FnOnce() + Send + 'static) {
        *self.handlers.on_connection_lost.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(on_connection_lost));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn send(&self, data: &[u8]) -> SendStatus {
        self.try_send(data).await.into()
    }

    pub async fn try_send(&self, data: &[u8]) -> Result<usize, TransportError> {
        if data.len() > self.config.max_message_len {
            return Err(TransportError::MessageTooLarge {
                len: data.len(),
                max: self.config.max_message_len,
            });
        }
        if !self.is_running() {
            return Err(TransportError::ConnectionClosed);
        }

        let len: u32 = data.len().prechecked_cast();

        let mut writer = self.writer.lock().await;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(data).await?;
        trace!("sent message of {} bytes to {:?}", data.len(), self.peer_addr);
        Ok(data.len())
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if self.cancel_sender.send(()).is_err() {
            trace!("reader task for {:?} had terminated already", self.peer_addr);
        }
    }
}

#[tracing::instrument(name = "tcp_receive_loop", skip_all, fields(peer_addr = ?peer_addr))]
async fn receive_loop(
    mut read_half: OwnedReadHalf,
    peer_addr: SocketAddr,
    max_message_len: usize,
    handlers: Arc<ConnectionHandlers>,
    running: Arc<AtomicBool>,
    mut cancel_receiver: broadcast::Receiver<()>,
) {
    let result = select! {
        r = read_messages(&mut read_half, max_message_len, &handlers) => r,
        _ = cancel_receiver.recv() => {
            running.store(false, Ordering::Release);
            handlers.clear_on_message();
            debug!("connection closed locally");
            return;
        }
    };

    running.store(false, Ordering::Release);
    handlers.clear_on_message();
    match result {
        Ok(()) => info!("connection closed by peer"),
        Err(e) => warn!(error = ?e, "connection lost"),
    }
    handlers.on_connection_lost();
}

async fn read_messages(read_half: &mut OwnedReadHalf, max_message_len: usize, handlers: &ConnectionHandlers) -> anyhow::Result<()> {
    let mut len_buf = [0u8; 4];

    loop {
        match read_half.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let msg_len: usize = u32::from_be_bytes(len_buf).safe_cast();
        if msg_len > max_message_len {
            bail!("received a message that was longer than the configured maximum ({} > {}) - closing connection", msg_len, max_message_len);
        }

        let mut msg_buf = vec![0u8; msg_len];
        read_half.read_exact(&mut msg_buf).await?;
        let receive_time = SystemTime::now();

        trace!("received message of {} bytes", msg_len);
        handlers.on_message(&msg_buf, receive_time);
    }
}
