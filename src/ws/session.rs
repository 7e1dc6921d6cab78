use std::fmt;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use super::registry::{Connection, ConnectionRegistry, DeliveryError};

/// Caller-supplied label for a session. Display only, never validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub i64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("delivery to own connection failed: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("receive failed: {0}")]
    Receive(axum::Error),
    #[error("binary frames are not supported")]
    UnsupportedFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

pub fn greeting(connection: &Connection) -> String {
    format!("[server_sent_ip] {}", connection.peer().ip())
}

pub fn echo(text: &str) -> String {
    format!("You wrote: {text}")
}

pub fn relay(client_id: ClientId, text: &str) -> String {
    format!("Client #{client_id} says: {text}")
}

pub fn departure(client_id: ClientId) -> String {
    format!("Client #{client_id} left the chat")
}

/// Drives one accepted connection from registration to its departure notice.
pub struct Session {
    client_id: ClientId,
    connection: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    state: SessionState,
}

impl Session {
    pub fn new(client_id: ClientId, connection: Arc<Connection>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            client_id,
            connection,
            registry,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session until the peer goes away or something breaks.
    ///
    /// `Ok` means the peer disconnected. Either way the connection is unregistered and
    /// the remaining clients are told before this returns.
    pub async fn run<S>(&mut self, mut inbound: S) -> Result<(), SessionError>
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let result = match self.activate().await {
            Ok(()) => self.relay_loop(&mut inbound).await,
            Err(e) => Err(e),
        };
        self.close().await;
        result
    }

    async fn activate(&mut self) -> Result<(), SessionError> {
        self.registry.register(self.connection.clone()).await;
        self.state = SessionState::Active;
        info!(client_id = %self.client_id, conn_id = %self.connection.id(), "session active");

        self.registry.send_to(&self.connection, greeting(&self.connection)).await?;
        Ok(())
    }

    async fn relay_loop<S>(&self, inbound: &mut S) -> Result<(), SessionError>
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        while let Some(frame) = inbound.next().await {
            match frame.map_err(SessionError::Receive)? {
                Message::Text(text) => self.relay(&text).await?,
                Message::Binary(_) => return Err(SessionError::UnsupportedFrame),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(close) => {
                    debug!(
                        client_id = %self.client_id,
                        code = close.as_ref().map(|c| c.code),
                        "peer sent close frame"
                    );
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn relay(&self, text: &str) -> Result<(), SessionError> {
        // Echo strictly before fan-out.
        self.registry.send_to(&self.connection, echo(text)).await?;
        self.registry.broadcast(&relay(self.client_id, text)).await;
        Ok(())
    }

    async fn close(&mut self) {
        self.registry.unregister(&self.connection).await;
        self.state = SessionState::Closed;
        let outcome = self.registry.broadcast(&departure(self.client_id)).await;
        debug!(client_id = %self.client_id, notified = outcome.delivered, "departure announced");
    }
}
