//! Socket adapter: one task per WebSocket.
//!
//! The task owns both directions of its socket. Outbound frames arrive on an
//! unbounded channel whose sender is registered with the server (and cloned
//! into the session on handshake); inbound text is validated into commands
//! and dispatched. The socket never touches server state directly, so a slow
//! or dead socket cannot stall anything but itself.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use tokio::sync::mpsc;
use tracing::debug;

use uplink_core::{ClientCommand, Frame, ServerFrame};

use crate::error::UplinkError;
use crate::server::UplinkServer;
use crate::session::FrameSender;

/// Registry entry for one live socket.
pub(crate) struct ConnectionHandle {
    /// Guid of the handshaken session, None until then.
    pub(crate) guid: Option<String>,
    pub(crate) tx: FrameSender,
}

/// Unregisters the connection when its task ends, unwind included. Dispatch
/// can panic inside the task (development-mode contract checks), and the
/// session must still detach so it expires instead of staying bound to a
/// dead task.
struct DisconnectGuard {
    server: Arc<UplinkServer>,
    id: u64,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.server.handle_disconnect(self.id);
        debug!(connection = self.id, "socket closed");
    }
}

/// Drive one socket until it closes.
pub(crate) async fn connection_task(server: Arc<UplinkServer>, mut socket: WebSocket) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = server.register_connection(tx);
    let _cleanup = DisconnectGuard {
        server: Arc::clone(&server),
        id,
    };
    debug!(connection = id, "socket open");

    loop {
        tokio::select! {
            // Frames from the server side (session flushes, broadcasts, acks)
            outbound = rx.recv() => {
                let Some(frame) = outbound else { break };
                debug!(connection = id, name = frame.name(), ">>> frame");
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if socket.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            // Frames from this client
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(WsMessage::Text(txt))) => {
                        handle_text(&server, id, &txt).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(connection = id, %err, "socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn handle_text(server: &Arc<UplinkServer>, id: u64, text: &str) {
    let frame = match serde_json::from_str::<Frame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(connection = id, %err, "ignoring non-frame payload");
            return;
        }
    };
    debug!(connection = id, name = %frame.name, "<<< frame");

    let command = match ClientCommand::from_frame(&frame) {
        Ok(command) => command,
        Err(err) => {
            server.send_to_connection(id, ServerFrame::Err { err });
            return;
        }
    };
    if let Err(err) = dispatch(server, id, command).await {
        server.send_to_connection(
            id,
            ServerFrame::Err {
                err: err.to_string(),
            },
        );
    }
}

async fn dispatch(
    server: &Arc<UplinkServer>,
    id: u64,
    command: ClientCommand,
) -> Result<(), UplinkError> {
    match command {
        ClientCommand::Handshake { guid } => server.handshake(id, guid).await,
        ClientCommand::Unhandshake => server.unhandshake(id).await,
        ClientCommand::SubscribeTo { key } => server.subscribe(id, &key),
        ClientCommand::UnsubscribeFrom { key } => server.unsubscribe(id, &key),
        ClientCommand::ListenTo { event_name } => server.listen(id, &event_name),
        ClientCommand::UnlistenFrom { event_name } => server.unlisten(id, &event_name),
    }
}
