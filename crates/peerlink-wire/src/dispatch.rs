//! Dispatch engine — unicast, broadcast and the pull-style receive loop.
//!
//! Sends resolve the destination through the [`AddressRegistry`] and hand the
//! message to the peer's outbound link. Broadcast fans one copy out to every
//! registered peer concurrently, each copy addressed to the wildcard.
//!
//! Receive is a lazy [`Stream`] over the driver's single inbox. A single-shot
//! stream yields at most one message, a continuous one never ends on its own.
//! Either ends right after yielding an error.

use crate::registry::AddressRegistry;
use crate::socket::{Inbound, SocketLayer};
use futures::future::join_all;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use peerlink_types::{DriverConfig, SessionMessage, WireError, WireResult, WILDCARD};
use std::borrow::Cow;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// How a receive stream pulls from the inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Yield at most one message, waiting up to `timeout` (forever if `None`).
    SingleShot {
        /// Upper bound on the wait.
        timeout: Option<Duration>,
    },
    /// Yield messages as they arrive, indefinitely.
    Continuous,
}

impl ReceiveMode {
    /// Map the `(is_continuous, timeout)` pair onto a mode.
    ///
    /// Continuous receives ignore the timeout.
    pub fn new(is_continuous: bool, timeout: Option<Duration>) -> Self {
        if is_continuous {
            Self::Continuous
        } else {
            Self::SingleShot { timeout }
        }
    }

    /// Whether the stream keeps going after a message.
    pub fn is_continuous(&self) -> bool {
        matches!(self, Self::Continuous)
    }
}

/// The receiving end of the driver's inbound channel.
struct Inbox {
    rx: Mutex<mpsc::Receiver<Inbound>>,
}

impl Inbox {
    async fn next(&self) -> WireResult<SessionMessage> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.unwrap_or(Err(WireError::ChannelClosed))
    }

    /// `Ok(None)` means the wait timed out.
    async fn next_within(&self, timeout: Option<Duration>) -> WireResult<Option<SessionMessage>> {
        match timeout {
            None => self.next().await.map(Some),
            Some(limit) => match tokio::time::timeout(limit, self.next()).await {
                Ok(next) => next.map(Some),
                Err(_) => Ok(None),
            },
        }
    }
}

/// Address registry, sockets and inbox of one driver.
pub struct Dispatcher {
    registry: AddressRegistry,
    sockets: SocketLayer,
    inbox: Inbox,
}

impl Dispatcher {
    /// Bind the socket layer and wire its readers to a fresh inbox.
    pub async fn bind(config: &DriverConfig) -> WireResult<Self> {
        let (tx, rx) = mpsc::channel(config.inbox_capacity);
        let sockets = SocketLayer::bind(config, tx).await?;
        Ok(Self {
            registry: AddressRegistry::new(),
            sockets,
            inbox: Inbox {
                rx: Mutex::new(rx),
            },
        })
    }

    /// The driver's address registry.
    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    /// The driver's socket layer.
    pub fn sockets(&self) -> &SocketLayer {
        &self.sockets
    }

    /// Transmit to `message.destination`. See [`Driver::send`](peerlink_types::Driver::send).
    pub async fn send(&self, message: &SessionMessage) -> bool {
        let peer = message.destination.as_str();
        let Some(address) = self.registry.address_of(peer) else {
            warn!(peer, tag = %message.tag, "send to unknown destination dropped");
            return false;
        };

        match self.sockets.transmit(peer, message).await {
            Ok(()) => {
                debug!(peer, %address, tag = %message.tag, "message sent");
                true
            }
            Err(e) => {
                warn!(peer, %address, tag = %message.tag, error = %e, "send failed");
                false
            }
        }
    }

    /// Transmit one copy to every registered peer.
    ///
    /// Every copy is addressed to [`WILDCARD`], whatever the caller put in
    /// `destination`.
    pub async fn broadcast(&self, message: &SessionMessage) -> bool {
        let outgoing: Cow<'_, SessionMessage> = if message.is_broadcast() {
            Cow::Borrowed(message)
        } else {
            let mut copy = message.clone();
            copy.destination = WILDCARD.to_string();
            Cow::Owned(copy)
        };
        let message = &*outgoing;

        let peers = self.registry.names();
        let outcomes = join_all(peers.iter().map(|peer| self.sockets.transmit(peer, message))).await;

        let mut delivered = 0;
        for (peer, outcome) in peers.iter().zip(outcomes) {
            match outcome {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    peer = %peer,
                    tag = %message.tag,
                    error = %e,
                    "broadcast copy failed"
                ),
            }
        }
        debug!(
            tag = %message.tag,
            delivered,
            total = peers.len(),
            "broadcast finished"
        );
        delivered == peers.len()
    }

    /// Pull inbound messages.
    pub fn receive(&self, mode: ReceiveMode) -> BoxStream<'_, WireResult<SessionMessage>> {
        pull(&self.inbox, mode).boxed()
    }
}

fn pull(
    inbox: &Inbox,
    mode: ReceiveMode,
) -> impl Stream<Item = WireResult<SessionMessage>> + '_ {
    stream::unfold(Some(inbox), move |state| async move {
        let inbox = state?;
        let next = match mode {
            ReceiveMode::SingleShot { timeout } => inbox.next_within(timeout).await,
            ReceiveMode::Continuous => inbox.next().await.map(Some),
        };
        match next {
            Ok(Some(message)) => Some((Ok(message), mode.is_continuous().then_some(inbox))),
            Ok(None) => {
                debug!("single-shot receive timed out");
                None
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}
