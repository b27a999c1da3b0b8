//! Socket binding layer — the only code that touches TCP sockets.
//!
//! A [`SocketLayer`] binds the driver's receiving listener at construction
//! and spawns an accept loop. Every accepted connection gets its own reader
//! task that decodes frames and pushes them into the driver's inbox. On the
//! outbound side it keeps one [`OutboundLink`] per registered peer; a link
//! holds at most one TCP stream and serializes writes to it, which is what
//! preserves per-peer ordering.

use crate::message::{encode_frame, read_frame};
use dashmap::DashMap;
use peerlink_types::{DriverConfig, SessionMessage, WireError, WireResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Address scheme advertised and accepted by this transport.
pub const SCHEME: &str = "tcp";

/// What inbound readers hand to the dispatch engine.
pub(crate) type Inbound = WireResult<SessionMessage>;

/// Resolve a peer address to a dialable `host:port`.
///
/// Accepts `tcp://host:port` and bare `host:port`.
pub fn parse_endpoint(address: &str) -> WireResult<&str> {
    let endpoint = match address.split_once("://") {
        Some((SCHEME, rest)) => rest,
        Some(_) => return Err(WireError::UnsupportedAddress(address.to_string())),
        None => address,
    };
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(endpoint),
        _ => Err(WireError::UnsupportedAddress(address.to_string())),
    }
}

fn advertised_address(advertise_host: Option<&str>, local_addr: SocketAddr) -> String {
    match advertise_host {
        Some(host) => format!("{SCHEME}://{host}:{}", local_addr.port()),
        None => format!("{SCHEME}://{local_addr}"),
    }
}

async fn open(address: &str, timeout: Duration) -> WireResult<TcpStream> {
    let endpoint = parse_endpoint(address)?;
    let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| WireError::ConnectTimeout {
            address: address.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// The outbound connection to one peer.
#[derive(Debug)]
pub struct OutboundLink {
    peer: String,
    address: String,
    stream: Mutex<Option<TcpStream>>,
}

impl OutboundLink {
    fn new(peer: &str, address: &str) -> Self {
        Self {
            peer: peer.to_string(),
            address: address.to_string(),
            stream: Mutex::new(None),
        }
    }

    /// Peer name this link serves.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Address this link dials.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether a TCP stream is currently open.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Open the TCP stream if it is not open yet.
    pub async fn dial(&self, timeout: Duration) -> WireResult<()> {
        let mut stream = self.stream.lock().await;
        if stream.is_none() {
            *stream = Some(open(&self.address, timeout).await?);
            debug!(peer = %self.peer, address = %self.address, "outbound connection established");
        }
        Ok(())
    }

    /// Write one frame, dialling first if needed.
    ///
    /// A failed write drops the stream; the next call redials.
    pub async fn transmit(
        &self,
        message: &SessionMessage,
        max_size: usize,
        timeout: Duration,
    ) -> WireResult<()> {
        let bytes = encode_frame(message, max_size)?;

        let mut guard = self.stream.lock().await;
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => {
                debug!(peer = %self.peer, address = %self.address, "dialling peer");
                open(&self.address, timeout).await?
            }
        };
        stream.write_all(&bytes).await?;
        stream.flush().await?;
        *guard = Some(stream);
        Ok(())
    }
}

/// Listener plus per-peer outbound links.
pub struct SocketLayer {
    local_addr: SocketAddr,
    address: String,
    max_message_size: usize,
    connect_timeout: Duration,
    links: DashMap<String, Arc<OutboundLink>>,
    shutdown: watch::Sender<bool>,
}

impl SocketLayer {
    /// Bind the receiving listener and start accepting peers.
    ///
    /// Inbound messages (and terminating read errors) are pushed into `inbox`.
    pub async fn bind(config: &DriverConfig, inbox: mpsc::Sender<Inbound>) -> WireResult<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| WireError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let address = advertised_address(config.advertise_host.as_deref(), local_addr);

        if local_addr.ip().is_unspecified() && config.advertise_host.is_none() {
            warn!(
                %address,
                "listening on a wildcard interface without advertise_host; peers may not reach this address"
            );
        }
        info!(%address, "listening for inbound peers");

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(
            listener,
            inbox,
            shutdown_rx,
            config.max_message_size,
        ));

        Ok(Self {
            local_addr,
            address,
            max_message_size: config.max_message_size,
            connect_timeout: config.connect_timeout(),
            links: DashMap::new(),
            shutdown,
        })
    }

    /// The bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address advertised to peers.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Dial timeout used for outbound links.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Install a fresh link for `peer`, dropping (and so closing) any previous one.
    pub fn attach(&self, peer: &str, address: &str) -> Arc<OutboundLink> {
        let link = Arc::new(OutboundLink::new(peer, address));
        if let Some(old) = self.links.insert(peer.to_string(), Arc::clone(&link)) {
            debug!(peer, previous = %old.address(), %address, "replaced outbound link");
        }
        link
    }

    /// Remove the link for `peer`.
    pub fn detach(&self, peer: &str) -> bool {
        self.links.remove(peer).is_some()
    }

    /// The current link for `peer`.
    pub fn link(&self, peer: &str) -> Option<Arc<OutboundLink>> {
        self.links.get(peer).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of outbound links.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Send one frame to `peer` over its link.
    pub async fn transmit(&self, peer: &str, message: &SessionMessage) -> WireResult<()> {
        let link = self
            .link(peer)
            .ok_or_else(|| WireError::UnknownPeer(peer.to_string()))?;
        link.transmit(message, self.max_message_size, self.connect_timeout)
            .await
    }

    /// Stop accepting and reading. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!(address = %self.address, "socket layer shutting down");
        }
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl Drop for SocketLayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Internal accept loop, run in a spawned task.
async fn accept_loop(
    listener: TcpListener,
    inbox: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
    max_message_size: usize,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "accepted inbound connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%addr, error = %e, "failed to set TCP_NODELAY");
                    }
                    tokio::spawn(read_loop(
                        stream,
                        addr,
                        inbox.clone(),
                        shutdown.clone(),
                        max_message_size,
                    ));
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("accept loop stopped");
}

/// Whether an I/O error means the peer went away.
///
/// These end the connection's reader but leave the inbox open for the
/// remaining peers.
fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
    )
}

/// Read frames from one inbound connection until it closes or fails.
async fn read_loop(
    mut stream: TcpStream,
    addr: SocketAddr,
    inbox: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
    max_message_size: usize,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return,
            frame = read_frame(&mut stream, max_message_size) => frame,
        };
        match frame {
            Ok(message) => {
                debug!(
                    %addr,
                    tag = %message.tag,
                    source = %message.source,
                    "received message"
                );
                if inbox.send(Ok(message)).await.is_err() {
                    return;
                }
            }
            Err(WireError::ConnectionClosed) => {
                debug!(%addr, "inbound connection closed");
                return;
            }
            Err(WireError::Io(e)) if is_disconnect(&e) => {
                warn!(%addr, error = %e, "inbound connection dropped by peer");
                return;
            }
            Err(e) => {
                warn!(%addr, error = %e, "inbound connection failed");
                let _ = inbox.send(Err(e)).await;
                return;
            }
        }
    }
}
