//! The driver seam.
//!
//! Higher layers (actor frameworks, orchestration) only ever talk to a
//! messaging driver through this trait, so they can hold an
//! `Arc<dyn Driver>` without caring which transport sits underneath.

use crate::error::WireResult;
use crate::message::SessionMessage;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

/// A peer-to-peer messaging driver.
#[async_trait]
pub trait Driver: Send + Sync {
    /// This driver's own receiving address, to be handed to peers out-of-band.
    fn address(&self) -> &str;

    /// Register peers by name and open outbound connections to them.
    ///
    /// Re-registering a name with the same address is a no-op; a changed
    /// address tears down the old connection. Connection failures are not
    /// reported here.
    async fn connect(&self, peer_addresses: HashMap<String, String>);

    /// Transmit a message to `message.destination`.
    ///
    /// Returns `false` if the destination is unknown or the transport
    /// reported an error. Never retries.
    async fn send(&self, message: &SessionMessage) -> bool;

    /// Transmit a copy of the message to every registered peer.
    ///
    /// Each copy is addressed to [`WILDCARD`](crate::message::WILDCARD).
    /// Returns `true` only if every copy was transmitted.
    async fn broadcast(&self, message: &SessionMessage) -> bool;

    /// Pull inbound messages.
    ///
    /// With `is_continuous == false` the stream yields at most one message
    /// (waiting up to `timeout`) and ends. Otherwise it yields messages as
    /// they arrive and never ends on its own. An `Err` item is always last.
    fn receive(
        &self,
        is_continuous: bool,
        timeout: Option<Duration>,
    ) -> BoxStream<'_, WireResult<SessionMessage>>;
}
