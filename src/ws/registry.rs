use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{Sink, SinkExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique id of one live connection. A reconnect always gets a fresh id.
pub type ConnectionId = Uuid;

/// Outbound half of a connection, erased to a text sink.
pub type TextSink = Pin<Box<dyn Sink<String, Error = DeliveryError> + Send>>;

/// Failure to hand a frame to a connection's transport
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),
    #[error("connection closed")]
    Closed,
}

/// Handle to one client's live bidirectional text channel.
///
/// Only the outbound half lives here. The inbound half is owned by the session loop.
/// Sends are serialized, so the owner's own replies and other sessions' broadcasts
/// never interleave on the wire.
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    sink: Mutex<TextSink>,
}

impl Connection {
    pub fn new<S>(peer: SocketAddr, sink: S) -> Arc<Self>
    where
        S: Sink<String, Error = DeliveryError> + Send + 'static,
    {
        let sink: TextSink = Box::pin(sink);
        Arc::new(Self {
            id: Uuid::new_v4(),
            peer,
            sink: Mutex::new(sink),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address observed when the connection was opened. Informational only.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&self, message: String) -> Result<(), DeliveryError> {
        self.sink.lock().await.send(message).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Result of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub evicted: usize,
}

/// Lifetime counters of a registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub registered_total: u64,
    pub evicted_total: u64,
}

/// The live set of connections and the delivery primitives over it.
///
/// The set lock is only held to mutate it or to copy it. It is never held across a send.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    registered_total: AtomicU64,
    evicted_total: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `connection` a broadcast target.
    pub async fn register(&self, connection: Arc<Connection>) {
        let id = connection.id();
        let peer = connection.peer();
        let mut conns = self.connections.write().await;
        if conns.insert(id, connection).is_none() {
            self.registered_total.fetch_add(1, Ordering::Relaxed);
        }
        debug!(conn_id = %id, %peer, live = conns.len(), "connection registered");
    }

    /// Remove `connection` from the live set. Returns false if it was not there.
    pub async fn unregister(&self, connection: &Connection) -> bool {
        let mut conns = self.connections.write().await;
        let removed = conns.remove(&connection.id()).is_some();
        if removed {
            debug!(conn_id = %connection.id(), live = conns.len(), "connection unregistered");
        }
        removed
    }

    /// Deliver to exactly one connection. Failures go back to the caller.
    pub async fn send_to(&self, connection: &Connection, message: impl Into<String>) -> Result<(), DeliveryError> {
        connection.send(message.into()).await
    }

    /// Deliver `message` to every live connection.
    ///
    /// Targets are a point-in-time copy of the live set. A target whose delivery fails is
    /// unregistered on the spot and the fan-out carries on with the rest.
    ///
    /// Targets are sent to one at a time, so a client that stops reading holds up the
    /// rest of this fan-out until its send completes or fails.
    pub async fn broadcast(&self, message: &str) -> BroadcastOutcome {
        let targets = self.snapshot().await;
        let mut outcome = BroadcastOutcome::default();

        for conn in targets {
            match conn.send(message.to_owned()).await {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    warn!(conn_id = %conn.id(), peer = %conn.peer(), error = %e, "broadcast delivery failed, evicting connection");
                    // Racing broadcasts may both fail on the same target; only one removal counts.
                    if self.unregister(&conn).await {
                        self.evicted_total.fetch_add(1, Ordering::Relaxed);
                        outcome.evicted += 1;
                    }
                }
            }
        }

        debug!(delivered = outcome.delivered, evicted = outcome.evicted, "broadcast done");
        outcome
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            registered_total: self.registered_total.load(Ordering::Relaxed),
            evicted_total: self.evicted_total.load(Ordering::Relaxed),
        }
    }

    async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::atomic::AtomicUsize;
    use std::task::{ready, Context, Poll};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// In-memory connection whose frames land in the returned receiver.
    /// Dropping the receiver makes every later send fail.
    pub(crate) fn channel_connection(port: u16) -> (Arc<Connection>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let sink = futures_util::sink::unfold(tx, |tx, frame: String| async move {
            tx.send(frame).map_err(|_| DeliveryError::Closed)?;
            Ok::<_, DeliveryError>(tx)
        });
        let peer = SocketAddr::from(([127, 0, 0, 1], port));
        (Connection::new(peer, sink), rx)
    }

    /// Like [`channel_connection`], but only the first `accept` frames go through.
    /// Every later send fails.
    pub(crate) fn connection_failing_after(
        port: u16,
        accept: usize,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let sink = futures_util::sink::unfold((tx, accept), |(tx, left), frame: String| async move {
            if left == 0 {
                return Err(DeliveryError::Closed);
            }
            tx.send(frame).map_err(|_| DeliveryError::Closed)?;
            Ok::<_, DeliveryError>((tx, left - 1))
        });
        let peer = SocketAddr::from(([127, 0, 0, 1], port));
        (Connection::new(peer, sink), rx)
    }

    /// Sink that stalls for `delay` on every send and then fails.
    struct SlowFailingSink {
        delay: Duration,
        attempts: Arc<AtomicUsize>,
        stall: Option<Pin<Box<tokio::time::Sleep>>>,
    }

    impl Sink<String> for SlowFailingSink {
        type Error = DeliveryError;

        fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), DeliveryError>> {
            if self.stall.is_none() {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                let delay = self.delay;
                self.stall = Some(Box::pin(tokio::time::sleep(delay)));
            }
            if let Some(stall) = self.stall.as_mut() {
                ready!(stall.as_mut().poll(cx));
            }
            self.stall = None;
            Poll::Ready(Err(DeliveryError::Closed))
        }

        fn start_send(self: Pin<&mut Self>, _frame: String) -> Result<(), DeliveryError> {
            Err(DeliveryError::Closed)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), DeliveryError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), DeliveryError>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Connection that always fails after a delay. The counter tracks send attempts.
    fn slow_failing_connection(port: u16, delay: Duration) -> (Arc<Connection>, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let sink = SlowFailingSink {
            delay,
            attempts: attempts.clone(),
            stall: None,
        };
        let peer = SocketAddr::from(([127, 0, 0, 1], port));
        (Connection::new(peer, sink), attempts)
    }

    pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn register_connection() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = channel_connection(1);
        registry.register(conn.clone()).await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(conn.id()).await);
    }

    #[tokio::test]
    async fn register_twice_keeps_one_entry() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = channel_connection(1);
        registry.register(conn.clone()).await;
        registry.register(conn).await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.stats().registered_total, 1);

        registry.broadcast("once").await;
        assert_eq!(drain(&mut rx), vec!["once"]);
    }

    #[tokio::test]
    async fn unregister_absent_connection_is_noop() {
        let registry = ConnectionRegistry::new();
        let (present, _rx1) = channel_connection(1);
        let (absent, _rx2) = channel_connection(2);
        registry.register(present.clone()).await;

        assert!(!registry.unregister(&absent).await);
        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(present.id()).await);
    }

    #[tokio::test]
    async fn unregister_twice() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = channel_connection(1);
        registry.register(conn.clone()).await;
        assert!(registry.unregister(&conn).await);
        assert!(!registry.unregister(&conn).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn broadcast_to_empty_registry() {
        let registry = ConnectionRegistry::new();
        let outcome = registry.broadcast("nobody home").await;
        assert_eq!(outcome, BroadcastOutcome::default());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection() {
        let registry = ConnectionRegistry::new();
        let (c1, mut rx1) = channel_connection(1);
        let (c2, mut rx2) = channel_connection(2);
        registry.register(c1).await;
        registry.register(c2).await;

        let outcome = registry.broadcast("hi").await;
        assert_eq!(outcome.delivered, 2);
        assert_eq!(drain(&mut rx1), vec!["hi"]);
        assert_eq!(drain(&mut rx2), vec!["hi"]);
    }

    #[tokio::test]
    async fn broadcast_isolates_failed_connection() {
        let registry = ConnectionRegistry::new();
        let (c1, mut rx1) = channel_connection(1);
        let (c2, rx2) = channel_connection(2);
        let (c3, mut rx3) = channel_connection(3);
        registry.register(c1).await;
        registry.register(c2.clone()).await;
        registry.register(c3).await;
        drop(rx2);

        let outcome = registry.broadcast("m").await;

        assert_eq!(outcome, BroadcastOutcome { delivered: 2, evicted: 1 });
        assert_eq!(drain(&mut rx1), vec!["m"]);
        assert_eq!(drain(&mut rx3), vec!["m"]);
        assert!(!registry.contains(c2.id()).await);
        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.stats().evicted_total, 1);
    }

    #[tokio::test]
    async fn evicted_connection_is_not_targeted_again() {
        let registry = ConnectionRegistry::new();
        let (healthy, mut rx) = channel_connection(1);
        let (broken, broken_rx) = channel_connection(2);
        registry.register(healthy).await;
        registry.register(broken).await;
        drop(broken_rx);

        registry.broadcast("first").await;
        let outcome = registry.broadcast("second").await;

        assert_eq!(outcome, BroadcastOutcome { delivered: 1, evicted: 0 });
        assert_eq!(drain(&mut rx), vec!["first", "second"]);
        assert_eq!(registry.stats().evicted_total, 1);
    }

    #[tokio::test]
    async fn unregistered_connection_gets_no_broadcast() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = channel_connection(1);
        registry.register(conn.clone()).await;
        registry.unregister(&conn).await;

        registry.broadcast("after").await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_broadcasts_evict_once() {
        for _ in 0..10 {
            let registry = Arc::new(ConnectionRegistry::new());
            let (broken, attempts) = slow_failing_connection(1, Duration::from_millis(50));
            let (healthy, mut rx) = channel_connection(2);
            registry.register(broken).await;
            registry.register(healthy).await;

            let a = tokio::spawn({
                let registry = registry.clone();
                async move { registry.broadcast("a").await }
            });
            let b = tokio::spawn({
                let registry = registry.clone();
                async move { registry.broadcast("b").await }
            });
            let (a, b) = (a.await.unwrap(), b.await.unwrap());

            // Both snapshots held the broken target, yet only one removal counts.
            assert_eq!(attempts.load(Ordering::SeqCst), 2);
            assert_eq!(a.evicted + b.evicted, 1);
            assert_eq!(a.delivered + b.delivered, 2);
            assert_eq!(registry.stats().evicted_total, 1);
            assert_eq!(registry.len().await, 1);
            let mut frames = drain(&mut rx);
            frames.sort();
            assert_eq!(frames, vec!["a", "b"]);
        }
    }

    #[tokio::test]
    async fn send_to_surfaces_failure() {
        let registry = ConnectionRegistry::new();
        let (conn, rx) = channel_connection(1);
        registry.register(conn.clone()).await;
        drop(rx);

        let result = registry.send_to(&conn, "direct").await;
        assert!(matches!(result, Err(DeliveryError::Closed)));
        // A targeted failure leaves membership to the caller.
        assert!(registry.contains(conn.id()).await);
    }

    #[tokio::test]
    async fn send_to_only_reaches_target() {
        let registry = ConnectionRegistry::new();
        let (c1, mut rx1) = channel_connection(1);
        let (c2, mut rx2) = channel_connection(2);
        registry.register(c1.clone()).await;
        registry.register(c2).await;

        registry.send_to(&c1, "just you").await.unwrap();
        assert_eq!(drain(&mut rx1), vec!["just you"]);
        assert!(drain(&mut rx2).is_empty());
    }
}
