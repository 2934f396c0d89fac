use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::transport::{TcpConfig, TcpConnection, TransportError};
use crate::util::callback::invoke_guarded;


/// Accepts TCP connections on a background task, handing each one to the `on_connection`
///  callback together with a description of the peer (`ip:port`).
///
/// Dropping the server stops accepting new connections. Connections that were accepted already
///  live on for as long as the application holds on to them.
pub struct TcpServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    cancel_sender: broadcast::Sender<()>,
}

impl TcpServer {
    pub async fn new<F>(port: u16, on_connection: F) -> Result<TcpServer, TransportError>
    where F: FnMut(String, Arc<TcpConnection>) + Send + 'static
    {
        Self::with_config(port, TcpConfig::default(), on_connection).await
    }

    pub async fn with_config<F>(port: u16, config: TcpConfig, on_connection: F) -> Result<TcpServer, TransportError>
    where F: FnMut(String, Arc<TcpConnection>) + Send + 'static
    {
        config.validate()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{:#}", e)))?;

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = TcpListener::bind(bind_addr).await
            .map_err(|e| TransportError::unavailable(bind_addr, e))?;
        let local_addr = listener.local_addr()?;
        info!("listening for TCP connections on {:?}", local_addr);

        let running = Arc::new(AtomicBool::new(true));
        let (cancel_sender, cancel_receiver) = broadcast::channel(1);

        tokio::spawn(accept_loop(listener, config, on_connection, running.clone(), cancel_receiver));

        Ok(TcpServer {
            local_addr,
            running,
            cancel_sender,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if self.cancel_sender.send(()).is_err() {
            trace!("accept loop on {:?} had terminated already", self.local_addr);
        }
    }
}

#[tracing::instrument(name = "tcp_accept_loop", skip_all, fields(local_addr = ?listener.local_addr().ok()))]
async fn accept_loop<F>(
    listener: TcpListener,
    config: TcpConfig,
    mut on_connection: F,
    running: Arc<AtomicBool>,
    mut cancel_receiver: broadcast::Receiver<()>,
)
where F: FnMut(String, Arc<TcpConnection>) + Send + 'static
{
    loop {
        select! {
            r = listener.accept() => {
                match r {
                    Ok((stream, peer_addr)) => {
                        debug!("accepted connection from {:?}", peer_addr);
                        let connection = Arc::new(TcpConnection::from_stream(stream, peer_addr, config.clone()));

                        invoke_guarded("tcp on_connection", || on_connection(peer_addr.to_string(), connection.clone()));
                        connection.start_reading();
                    }
                    Err(e) => {
                        warn!(error = ?e, "error accepting TCP connection");
                    }
                }
            }
            _ = cancel_receiver.recv() => break,
        }
    }

    running.store(false, Ordering::Release);
    debug!("TCP accept loop terminated");
}
