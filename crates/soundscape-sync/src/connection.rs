//! UDP endpoint to the device
//!
//! Outbound traffic goes through a [`Transport`] owned by the controller.
//! Inbound datagrams are read on a dedicated receive thread
//! ([`OscReceiver`]) which hands every decoded message to a callback.

use crate::protocol::{self, MAX_DATAGRAM_SIZE};
use rosc::OscMessage;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Read timeout of the receive socket; bounds shutdown latency
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Error type for endpoint operations
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Not an IP address: {0}")]
    InvalidAddress(String),

    #[error("Failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to connect UDP socket to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn receive thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Outbound half of the device connection
///
/// `send` is best-effort: failures are reported as `false` and never
/// retried.
pub trait Transport: Send {
    /// Connect (or reconnect) to the device at `address`
    ///
    /// Called with the controller lock held, so implementations must not
    /// block on name resolution.
    fn connect(&mut self, address: &str) -> Result<(), EndpointError>;

    /// Drop the current connection, if any
    fn disconnect(&mut self);

    /// Send one message; true if it was handed to the network
    fn send(&mut self, message: OscMessage) -> bool;
}

/// [`Transport`] over a connected UDP socket
pub struct UdpTransport {
    device_port: u16,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    /// Create an unconnected transport targeting `device_port`
    pub fn new(device_port: u16) -> Self {
        Self {
            device_port,
            socket: None,
        }
    }

    /// Remote address of the current connection
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.peer_addr().ok())
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self, address: &str) -> Result<(), EndpointError> {
        self.disconnect();

        // IP literals only: a DNS lookup here would stall ticks and receipts
        let ip: IpAddr = address
            .trim()
            .parse()
            .map_err(|_| EndpointError::InvalidAddress(address.to_string()))?;
        let target = SocketAddr::new(ip, self.device_port);

        let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).map_err(|source| EndpointError::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;
        socket
            .connect(target)
            .map_err(|source| EndpointError::Connect { addr: target, source })?;

        log::info!("OSC: Sending to {}", target);
        self.socket = Some(socket);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.socket.take().is_some() {
            log::debug!("OSC: Sender disconnected");
        }
    }

    fn send(&mut self, message: OscMessage) -> bool {
        let Some(socket) = self.socket.as_ref() else {
            return false;
        };
        let bytes = match protocol::encode_message(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::debug!("OSC: {}", e);
                return false;
            }
        };
        match socket.send(&bytes) {
            Ok(_) => true,
            Err(e) => {
                log::debug!("OSC: Send failed: {}", e);
                false
            }
        }
    }
}

/// Receive thread handle
///
/// Owns the thread join handle and a shutdown flag.
/// When dropped, signals the thread to stop and waits for it.
pub struct OscReceiver {
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl OscReceiver {
    /// Bind `0.0.0.0:port` and start delivering decoded messages to `on_message`
    ///
    /// Port 0 binds an ephemeral port; see [`OscReceiver::local_addr`].
    pub fn bind<F>(port: u16, on_message: F) -> Result<Self, EndpointError>
    where
        F: FnMut(OscMessage) + Send + 'static,
    {
        let addr = format!("0.0.0.0:{}", port);
        let socket = UdpSocket::bind(&addr).map_err(|source| EndpointError::Bind {
            addr: addr.clone(),
            source,
        })?;
        let local_addr = socket
            .set_read_timeout(Some(RECEIVE_POLL_INTERVAL))
            .and_then(|_| socket.local_addr())
            .map_err(|source| EndpointError::Bind { addr, source })?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("osc-rx".to_string())
            .spawn(move || Self::receive_loop(socket, on_message, shutdown_clone))
            .map_err(EndpointError::Spawn)?;

        log::info!("OSC: Listening on {}", local_addr);
        Ok(Self {
            shutdown,
            handle: Some(handle),
            local_addr,
        })
    }

    /// Address the receive socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn receive_loop<F>(socket: UdpSocket, mut on_message: F, shutdown: Arc<AtomicBool>)
    where
        F: FnMut(OscMessage),
    {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        while !shutdown.load(Ordering::Relaxed) {
            let n = match socket.recv_from(&mut buf) {
                Ok((n, _)) => n,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => {
                    log::debug!("OSC: Receive error: {}", e);
                    continue;
                }
            };

            match protocol::decode_datagram(&buf[..n]) {
                Ok(messages) => {
                    for message in messages {
                        on_message(message);
                    }
                }
                Err(e) => log::trace!("OSC: Dropping datagram: {}", e),
            }
        }

        log::debug!("OSC: Receive thread stopped");
    }
}

impl Drop for OscReceiver {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
