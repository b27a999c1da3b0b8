//! PeerDriver — the public messaging driver.
//!
//! A [`PeerDriver`] binds its receiving address on construction, so it can
//! accept inbound peers before it knows any of them. The hosting process
//! hands [`PeerDriver::address`] to the other peers out-of-band; each side
//! then calls [`PeerDriver::connect`] with the name→address map it learned
//! and can start sending and receiving.

use crate::dispatch::{Dispatcher, ReceiveMode};
use crate::registry::Registration;
use crate::socket::parse_endpoint;
use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::BoxStream;
use peerlink_types::{Driver, DriverConfig, SessionMessage, WireResult, WILDCARD};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A TCP messaging driver for a statically known set of named peers.
pub struct PeerDriver {
    config: DriverConfig,
    dispatcher: Dispatcher,
}

impl PeerDriver {
    /// Bind a driver on an ephemeral loopback port.
    pub async fn new() -> WireResult<Self> {
        Self::bind(DriverConfig::default()).await
    }

    /// Bind a driver with an explicit configuration.
    ///
    /// Fails if the configuration is invalid or the listener cannot be bound;
    /// a driver without a receiving address is never returned.
    pub async fn bind(config: DriverConfig) -> WireResult<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::bind(&config).await?;
        Ok(Self { config, dispatcher })
    }

    /// This driver's receiving address, e.g. `tcp://127.0.0.1:40123`.
    pub fn address(&self) -> &str {
        self.dispatcher.sockets().address()
    }

    /// The bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.dispatcher.sockets().local_addr()
    }

    /// The configuration this driver was bound with.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Registered peer names, sorted.
    pub fn peers(&self) -> Vec<String> {
        self.dispatcher.registry().names()
    }

    /// Register peers and open outbound connections to them.
    ///
    /// Entries with the wildcard (or empty) name or an undialable address are
    /// skipped with a warning. Dial failures are logged only; the link is
    /// dialled again on the next send.
    pub async fn connect<I, K, V>(&self, peer_addresses: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let registry = self.dispatcher.registry();
        let sockets = self.dispatcher.sockets();

        let mut links = Vec::new();
        for (name, address) in peer_addresses {
            let name: String = name.into();
            let address: String = address.into();

            if name.is_empty() || name == WILDCARD {
                warn!(peer = %name, "reserved peer name ignored");
                continue;
            }
            if let Err(e) = parse_endpoint(&address) {
                warn!(peer = %name, %address, error = %e, "peer not registered");
                continue;
            }

            match registry.register(&name, &address) {
                Registration::Unchanged => {
                    debug!(peer = %name, %address, "peer already registered");
                    continue;
                }
                Registration::Replaced { previous } => {
                    info!(peer = %name, %previous, %address, "peer address changed, rebinding");
                }
                Registration::Added => {
                    info!(peer = %name, %address, "peer registered");
                }
            }
            links.push(sockets.attach(&name, &address));
        }

        let timeout = self.config.connect_timeout();
        let dials = join_all(links.iter().map(|link| link.dial(timeout))).await;
        for (link, outcome) in links.iter().zip(dials) {
            if let Err(e) = outcome {
                warn!(
                    peer = %link.peer(),
                    address = %link.address(),
                    error = %e,
                    "outbound connection not established, will dial on next send"
                );
            }
        }
    }

    /// Forget peers and close their outbound connections.
    ///
    /// Returns how many of the names were registered.
    pub fn disconnect<I, S>(&self, names: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = 0;
        for name in names {
            let name = name.as_ref();
            self.dispatcher.sockets().detach(name);
            if let Some(peer) = self.dispatcher.registry().remove(name) {
                info!(peer = name, address = %peer.address, "peer disconnected");
                removed += 1;
            }
        }
        removed
    }

    /// Transmit to `message.destination`; `false` on unknown peer or transport error.
    pub async fn send(&self, message: &SessionMessage) -> bool {
        self.dispatcher.send(message).await
    }

    /// Transmit a copy to every registered peer; `true` only if all succeed.
    pub async fn broadcast(&self, message: &SessionMessage) -> bool {
        self.dispatcher.broadcast(message).await
    }

    /// Pull inbound messages; see [`ReceiveMode`].
    pub fn receive(
        &self,
        is_continuous: bool,
        timeout: Option<Duration>,
    ) -> BoxStream<'_, WireResult<SessionMessage>> {
        self.dispatcher.receive(ReceiveMode::new(is_continuous, timeout))
    }

    /// Stop accepting inbound connections and reading from existing ones.
    ///
    /// Messages already queued can still be received; after that the receive
    /// stream ends with [`WireError::ChannelClosed`](peerlink_types::WireError::ChannelClosed).
    pub fn close(&self) {
        self.dispatcher.sockets().shutdown();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.dispatcher.sockets().is_shut_down()
    }
}

#[async_trait]
impl Driver for PeerDriver {
    fn address(&self) -> &str {
        PeerDriver::address(self)
    }

    async fn connect(&self, peer_addresses: HashMap<String, String>) {
        PeerDriver::connect(self, peer_addresses).await
    }

    async fn send(&self, message: &SessionMessage) -> bool {
        PeerDriver::send(self, message).await
    }

    async fn broadcast(&self, message: &SessionMessage) -> bool {
        PeerDriver::broadcast(self, message).await
    }

    fn receive(
        &self,
        is_continuous: bool,
        timeout: Option<Duration>,
    ) -> BoxStream<'_, WireResult<SessionMessage>> {
        PeerDriver::receive(self, is_continuous, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{encode_frame, HEADER_LEN};
    use futures::StreamExt;
    use peerlink_types::config::DEFAULT_MAX_MESSAGE_SIZE;
    use peerlink_types::WireError;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));
    const SHORT: Option<Duration> = Some(Duration::from_millis(200));

    async fn driver() -> PeerDriver {
        PeerDriver::bind(DriverConfig::local_network()).await.unwrap()
    }

    async fn receive_one(
        driver: &PeerDriver,
        timeout: Option<Duration>,
    ) -> Option<SessionMessage> {
        let mut stream = driver.receive(false, timeout);
        stream.next().await.map(|item| item.unwrap())
    }

    async fn dead_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("tcp://{}", listener.local_addr().unwrap())
    }

    #[tokio::test]
    async fn test_new_driver_is_bound() {
        let d = PeerDriver::new().await.unwrap();
        assert!(d.address().starts_with("tcp://127.0.0.1:"));
        assert_ne!(d.local_addr().port(), 0);
        assert!(d.peers().is_empty());
        assert!(!d.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_construction() {
        let config = DriverConfig {
            inbox_capacity: 0,
            ..DriverConfig::default()
        };
        let err = PeerDriver::bind(config).await.err().unwrap();
        assert!(matches!(err, WireError::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_skips_invalid_entries() {
        let d = driver().await;
        let other = driver().await;
        d.connect([
            ("good", other.address()),
            ("*", other.address()),
            ("", other.address()),
            ("bad", "ipc:///tmp/peer"),
        ])
        .await;
        assert_eq!(d.peers(), vec!["good"]);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let a = driver().await;
        let b = driver().await;
        a.connect([("b", b.address())]).await;

        let mut nested = json!("leaf");
        for depth in 0..32 {
            nested = json!({ format!("level_{depth}"): nested, "items": [depth, null] });
        }

        let cases = [
            SessionMessage::new("unit_test", "a", "b", json!({"obs": [1.0, 2.5], "done": false})),
            SessionMessage::new("unit_test", "a", "b", json!(null)),
            SessionMessage::new("unit_test", "a", "b", ""),
            SessionMessage::new("unit_test", "a", "b", "héllo wörld, こんにちは 🦀"),
            SessionMessage::new("unit_test", "a", "b", nested),
            SessionMessage::new("", "", "b", json!([])),
        ];

        for msg in cases {
            assert!(a.send(&msg).await, "send failed for {msg}");
            let received = receive_one(&b, WAIT).await.unwrap();
            assert_eq!(received.tag, msg.tag);
            assert_eq!(received.source, msg.source);
            assert_eq!(received.destination, msg.destination);
            assert_eq!(received.payload, msg.payload);
            assert_eq!(received, msg);
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_is_false() {
        let a = driver().await;
        let b = driver().await;
        a.connect([("b", b.address())]).await;

        let msg = SessionMessage::new("unit_test", "a", "c", "hello_world");
        assert!(!a.send(&msg).await);
        assert!(receive_one(&b, SHORT).await.is_none());
    }

    #[tokio::test]
    async fn test_send_to_wildcard_is_false() {
        let a = driver().await;
        let b = driver().await;
        a.connect([("b", b.address())]).await;
        assert!(!a.send(&SessionMessage::to_all("t", "a", json!(1))).await);
    }

    #[tokio::test]
    async fn test_single_shot_yields_one_even_when_more_queued() {
        let a = driver().await;
        let b = driver().await;
        a.connect([("b", b.address())]).await;

        for i in 0..3 {
            assert!(a.send(&SessionMessage::new("seq", "a", "b", json!(i))).await);
        }

        let first: Vec<_> = b.receive(false, WAIT).collect().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].as_ref().unwrap().payload, json!(0));

        let second = receive_one(&b, WAIT).await.unwrap();
        assert_eq!(second.payload, json!(1));
    }

    #[tokio::test]
    async fn test_continuous_preserves_order() {
        let a = driver().await;
        let b = driver().await;
        a.connect([("b", b.address())]).await;

        const N: i64 = 50;
        for i in 0..N {
            assert!(a.send(&SessionMessage::new("seq", "a", "b", json!(i))).await);
        }

        let received: Vec<i64> = b
            .receive(true, None)
            .take(N as usize)
            .map(|item| item.unwrap().payload_as::<i64>().unwrap())
            .collect()
            .await;
        assert_eq!(received, (0..N).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_reconnect_same_address_is_noop() {
        let a = driver().await;
        let b = driver().await;
        a.connect([("b", b.address())]).await;
        let link = a.dispatcher.sockets().link("b").unwrap();

        a.connect([("b", b.address())]).await;
        let again = a.dispatcher.sockets().link("b").unwrap();
        assert!(Arc::ptr_eq(&link, &again));
    }

    #[tokio::test]
    async fn test_changed_address_rebinds() {
        let a = driver().await;
        let old = driver().await;
        let new = driver().await;
        a.connect([("b", old.address())]).await;
        a.connect([("b", new.address())]).await;
        assert_eq!(a.peers(), vec!["b"]);

        assert!(a.send(&SessionMessage::new("t", "a", "b", "moved")).await);
        let received = receive_one(&new, WAIT).await.unwrap();
        assert_eq!(received.payload, json!("moved"));
        assert!(receive_one(&old, SHORT).await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect() {
        let a = driver().await;
        let b = driver().await;
        a.connect([("b", b.address())]).await;

        assert_eq!(a.disconnect(["b", "never-known"]), 1);
        assert!(a.peers().is_empty());
        assert!(!a.send(&SessionMessage::new("t", "a", "b", json!(null))).await);
    }

    #[tokio::test]
    async fn test_unreachable_peer_registered_but_send_fails() {
        let a = driver().await;
        a.connect([("ghost", dead_address().await)]).await;
        assert_eq!(a.peers(), vec!["ghost"]);
        assert!(!a.send(&SessionMessage::new("t", "a", "ghost", json!(null))).await);
    }

    #[tokio::test]
    async fn test_peer_started_after_connect_is_dialled_lazily() {
        let a = driver().await;
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        a.connect([("late", format!("tcp://{port}"))]).await;
        let link = a.dispatcher.sockets().link("late").unwrap();
        assert!(!link.is_connected().await);

        let b = PeerDriver::bind(DriverConfig {
            listen_addr: port,
            ..DriverConfig::local_network()
        })
        .await
        .unwrap();
        assert!(a.send(&SessionMessage::new("t", "a", "late", "hi")).await);
        assert!(link.is_connected().await);
        assert_eq!(receive_one(&b, WAIT).await.unwrap().payload, json!("hi"));
    }

    #[tokio::test]
    async fn test_broadcast_keeps_wildcard_destination() {
        let a = driver().await;
        let b = driver().await;
        let c = driver().await;
        a.connect([("b", b.address()), ("c", c.address())]).await;

        let msg = SessionMessage::to_all("sync", "a", json!({"weights": [0.1, 0.2]}));
        assert!(a.broadcast(&msg).await);

        for peer in [&b, &c] {
            let received = receive_one(peer, WAIT).await.unwrap();
            assert_eq!(received.destination, WILDCARD);
            assert_eq!(received.payload, msg.payload);
            assert_eq!(received.message_id, msg.message_id);
        }
    }

    #[tokio::test]
    async fn test_broadcast_readdresses_named_destination() {
        let s = driver().await;
        let r1 = driver().await;
        let r2 = driver().await;
        s.connect([("r1", r1.address()), ("r2", r2.address())]).await;

        let msg = SessionMessage::new("unit_test", "sender", "r1", "hello_world");
        assert!(s.broadcast(&msg).await);

        for peer in [&r1, &r2] {
            let received = receive_one(peer, WAIT).await.unwrap();
            assert_eq!(received.destination, WILDCARD);
            assert!(received.is_broadcast());
            assert_eq!(received.payload, json!("hello_world"));
            assert_eq!(received.message_id, msg.message_id);
        }
        // The caller's message is left alone.
        assert_eq!(msg.destination, "r1");
    }

    #[tokio::test]
    async fn test_broadcast_partial_failure() {
        let a = driver().await;
        let b = driver().await;
        a.connect([("b", b.address().to_string()), ("ghost", dead_address().await)])
            .await;

        let msg = SessionMessage::to_all("sync", "a", "partial");
        assert!(!a.broadcast(&msg).await);
        // The reachable copy is not retracted.
        assert_eq!(receive_one(&b, WAIT).await.unwrap().payload, json!("partial"));
    }

    async fn bounded_driver(max_message_size: usize) -> PeerDriver {
        PeerDriver::bind(DriverConfig {
            max_message_size,
            ..DriverConfig::local_network()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_oversize_send_fails_and_link_survives() {
        let a = bounded_driver(400).await;
        let b = bounded_driver(400).await;
        a.connect([("b", b.address())]).await;
        let link = a.dispatcher.sockets().link("b").unwrap();
        assert!(link.is_connected().await);

        let big = SessionMessage::new("t", "a", "b", "x".repeat(1000));
        assert!(!a.send(&big).await);
        assert!(link.is_connected().await);

        assert!(a.send(&SessionMessage::new("t", "a", "b", "small")).await);
        let received = receive_one(&b, WAIT).await.unwrap();
        assert_eq!(received.payload, json!("small"));
    }

    #[tokio::test]
    async fn test_frame_exactly_at_limit_is_accepted() {
        let msg = SessionMessage::new("t", "a", "b", "y".repeat(300));
        let limit = encode_frame(&msg, DEFAULT_MAX_MESSAGE_SIZE).unwrap().len() - HEADER_LEN;

        let a = bounded_driver(limit).await;
        let b = bounded_driver(limit).await;
        a.connect([("b", b.address())]).await;
        assert!(a.send(&msg).await);
        assert_eq!(receive_one(&b, WAIT).await.unwrap(), msg);

        let tight = bounded_driver(limit - 1).await;
        tight.connect([("b", b.address())]).await;
        assert!(!tight.send(&msg).await);
        assert!(receive_one(&b, SHORT).await.is_none());
    }

    #[tokio::test]
    async fn test_oversize_inbound_frame_terminates_receive() {
        let b = bounded_driver(1024).await;
        let mut raw = TcpStream::connect(b.local_addr()).await.unwrap();
        raw.write_all(&4096u32.to_be_bytes()).await.unwrap();

        let mut stream = b.receive(true, None);
        let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        match first {
            Some(Err(WireError::MessageTooLarge { size, max })) => {
                assert_eq!(size, 4096);
                assert_eq!(max, 1024);
            }
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_transport_error_terminates_receive() {
        let b = driver().await;
        let mut raw = TcpStream::connect(b.local_addr()).await.unwrap();
        raw.write_all(&3u32.to_be_bytes()).await.unwrap();
        raw.write_all(b"???").await.unwrap();

        let mut stream = b.receive(true, None);
        let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(matches!(first, Some(Err(WireError::Json(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_ends_receive() {
        let a = driver().await;
        let b = driver().await;
        a.connect([("b", b.address())]).await;
        assert!(a.send(&SessionMessage::new("t", "a", "b", "before close")).await);
        let first = receive_one(&b, WAIT).await.unwrap();
        assert_eq!(first.payload, json!("before close"));

        b.close();
        assert!(b.is_closed());
        let mut stream = b.receive(true, None);
        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(matches!(next, Some(Err(WireError::ChannelClosed))));
    }

    #[tokio::test]
    async fn test_usable_as_trait_object() {
        let a: Arc<dyn Driver> = Arc::new(driver().await);
        let b: Arc<dyn Driver> = Arc::new(driver().await);
        let mut peers = HashMap::new();
        peers.insert("b".to_string(), b.address().to_string());
        a.connect(peers).await;

        assert!(a.send(&SessionMessage::new("t", "a", "b", json!(42))).await);
        let got = b.receive(false, WAIT).next().await.unwrap().unwrap();
        assert_eq!(got.payload, json!(42));
    }
}
