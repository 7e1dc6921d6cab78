use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    response::Response,
};
use futures_util::{future, SinkExt, StreamExt};
use tracing::{info, warn};

use crate::ws::{ClientId, Connection, ConnectionRegistry, DeliveryError, Session, SessionError};
use crate::AppState;

/// WebSocket handler
pub async fn websocket_handler(
    Path(client_id): Path<ClientId>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
) -> Response {
    info!(%client_id, %peer, "New WebSocket connection attempt");
    ws.on_failed_upgrade(move |e| warn!(%client_id, %peer, error = %e, "WebSocket handshake failed"))
        .on_upgrade(move |socket| handle_socket(socket, client_id, peer, app_state.registry))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, client_id: ClientId, peer: SocketAddr, registry: Arc<ConnectionRegistry>) {
    // Outbound half goes to the registry, inbound half stays with the session loop.
    let (sender, receiver) = socket.split();
    let sender = sender
        .sink_map_err(DeliveryError::from)
        .with(|text: String| future::ready(Ok::<_, DeliveryError>(Message::Text(text))));
    let connection = Connection::new(peer, sender);
    let conn_id = connection.id();

    let mut session = Session::new(client_id, connection, registry);
    match session.run(receiver).await {
        Ok(()) => info!(%client_id, %conn_id, "WebSocket connection terminated"),
        Err(SessionError::Delivery(e)) => {
            warn!(%client_id, %conn_id, error = %e, "WebSocket connection dropped: reply failed")
        }
        Err(e) => warn!(%client_id, %conn_id, error = %e, "WebSocket connection dropped"),
    }
}
