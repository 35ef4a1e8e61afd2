use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use super::EditorState;
use crate::session::{Channel, ChannelFrame, CLOSE_PERSISTENCE_FAILURE};

/// Bridges one WebSocket connection to the actor of its document
pub struct WebSocketHandler {
    socket: WebSocket,
    state: EditorState,
    document_id: String,
}

impl WebSocketHandler {
    /// Create a new WebSocket handler for a connection opened on `document_id`
    pub fn new(socket: WebSocket, state: EditorState, document_id: String) -> Self {
        Self {
            socket,
            state,
            document_id,
        }
    }

    /// Handle the WebSocket connection
    pub async fn handle(self) {
        let Self {
            mut socket,
            state,
            document_id,
        } = self;

        let (channel, mut rx) = Channel::pair(document_id.clone());
        let (handle, session) = match state.registry().attach(channel).await {
            Ok(attached) => attached,
            Err(e) => {
                error!("Failed to attach to document '{}': {}", document_id, e);
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_PERSISTENCE_FAILURE,
                        reason: "Document unavailable".into(),
                    })))
                    .await;
                return;
            }
        };

        info!(
            "New WebSocket connection for document '{}' (session {})",
            document_id, session
        );

        let (mut ws_sender, mut ws_receiver) = socket.split();

        // Forward actor frames to the socket
        let mut sender_task = {
            let document_id = document_id.clone();
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    match frame {
                        ChannelFrame::Binary(data) => {
                            if let Err(e) = ws_sender.send(Message::Binary(data.into())).await {
                                error!(
                                    "Failed to send to session {} of document '{}': {}",
                                    session, document_id, e
                                );
                                break;
                            }
                        }
                        ChannelFrame::Close { code, reason } => {
                            debug!(
                                "Closing session {} of document '{}' ({}: {})",
                                session, document_id, code, reason
                            );
                            let _ = ws_sender
                                .send(Message::Close(Some(CloseFrame {
                                    code,
                                    reason: reason.into(),
                                })))
                                .await;
                            break;
                        }
                    }
                }
                debug!("Sender task ended for session {}", session);
            })
        };

        // Hand incoming frames to the actor
        let mut receiver_task = {
            let handle = handle.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_receiver.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            if let Err(e) = handle.receive(session, data.to_vec()).await {
                                if e.is_persistence() {
                                    // the actor has already closed this session
                                    break;
                                }
                                warn!("Dropped frame from session {}: {}", session, e);
                            }
                        }
                        Ok(Message::Text(text)) => {
                            warn!(
                                "Received unexpected text message from session {}: {}",
                                session, text
                            );
                        }
                        Ok(Message::Close(_)) => {
                            info!("Session {} closed connection normally", session);
                            break;
                        }
                        Ok(Message::Ping(_)) => {
                            debug!("Received ping from session {}", session);
                        }
                        Ok(Message::Pong(_)) => {
                            debug!("Received pong from session {}", session);
                        }
                        Err(e) => {
                            warn!("WebSocket error for session {}: {}", session, e);
                            break;
                        }
                    }
                }
                debug!("Receiver task ended for session {}", session);
            })
        };

        let completion_reason = tokio::select! {
            _ = &mut sender_task => {
                receiver_task.abort();
                "sender task completed"
            }
            _ = &mut receiver_task => {
                sender_task.abort();
                "receiver task completed"
            }
        };

        info!(
            "WebSocket connection ending for session {} of document '{}' ({})",
            session, document_id, completion_reason
        );

        if let Err(e) = handle.detach(session).await {
            debug!("Detach after disconnect failed: {}", e);
        }
    }
}
