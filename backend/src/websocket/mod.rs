//! # WebSocket Module
//!
//! Pushes user notifications to connected clients. The registry is the
//! broker's [`MessageSink`]: every `notify_user` call becomes one frame on
//! each of the user's open connections.
//!
//! ## Connection Flow
//!
//! ```text
//! 1. Client connects to /ws/{user_id}
//!              ↓
//! 2. Server registers a broadcast receiver for the user
//!              ↓
//! 3. Services call notify_user(...)
//!              ↓
//! 4. Frames are pushed to every connection of that user:
//!    - notification
//!    - connected / pong
//! ```
//!
//! ## Message Format
//!
//! ```json
//! {
//!     "event": "notification",
//!     "data": {
//!         "kind": "provisioned",
//!         "title": "VPS Ready",
//!         "content": "Order ORD-7-1714521600 is active."
//!     },
//!     "timestamp": "2024-01-15T12:00:00Z"
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::Message;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::db::Id;
use crate::services::MessageSink;
use crate::AppState;

/// WebSocket event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsEventType {
    /// A user notification from the order flows.
    Notification,
    /// Sent once after the handshake.
    Connected,
    /// Reply to a client text frame.
    Pong,
}

/// WebSocket message wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMessage<T> {
    pub event: WsEventType,
    pub data: T,
    pub timestamp: chrono::DateTime<Utc>,
}

impl<T: Serialize> WsMessage<T> {
    pub fn new(event: WsEventType, data: T) -> Self {
        Self {
            event,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Payload of a [`WsEventType::Notification`] frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    pub kind: String,
    pub title: String,
    pub content: String,
}

/// WebSocket connection registry.
///
/// Tracks active sessions per user; a user may hold several connections
/// (tabs, devices), each with its own broadcast channel.
#[derive(Clone, Default)]
pub struct WsRegistry {
    sessions: Arc<Mutex<HashMap<Id, Vec<broadcast::Sender<String>>>>>,
}

impl WsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; the receiver yields frames for this user.
    pub async fn register(&self, user_id: Id) -> broadcast::Receiver<String> {
        let mut sessions = self.sessions.lock().await;
        let (tx, rx) = broadcast::channel(100);
        let senders = sessions.entry(user_id).or_default();
        senders.push(tx);
        info!(
            "Registered WebSocket for user {} (total connections: {})",
            user_id,
            senders.len()
        );
        rx
    }

    /// Drop senders whose receivers are gone.
    pub async fn unregister(&self, user_id: Id) {
        let mut sessions = self.sessions.lock().await;
        if let Some(senders) = sessions.get_mut(&user_id) {
            senders.retain(|tx| tx.receiver_count() > 0);
            if senders.is_empty() {
                sessions.remove(&user_id);
                info!("Unregistered all WebSocket connections for user {}", user_id);
            }
        }
    }

    /// Send one frame to every live connection of `user_id`.
    ///
    /// A user without connections is not an error; returns the number of
    /// connections reached.
    pub async fn send_to_user<T: Serialize>(&self, user_id: Id, event: WsEventType, data: T) -> Result<usize, String> {
        let json = WsMessage::new(event, data)
            .to_json()
            .map_err(|e| format!("Failed to serialize message: {}", e))?;

        let mut sessions = self.sessions.lock().await;
        let Some(senders) = sessions.get_mut(&user_id) else {
            debug!("No active WebSocket connections for user {}", user_id);
            return Ok(0);
        };
        senders.retain(|tx| tx.receiver_count() > 0 && tx.send(json.clone()).is_ok());
        let sent = senders.len();
        if senders.is_empty() {
            sessions.remove(&user_id);
        }
        if sent > 0 {
            debug!("Sent message to user {} ({} connections)", user_id, sent);
        }
        Ok(sent)
    }

    pub async fn connection_count(&self, user_id: Id) -> usize {
        self.sessions.lock().await.get(&user_id).map(Vec::len).unwrap_or(0)
    }

    pub async fn total_connections(&self) -> usize {
        self.sessions.lock().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl MessageSink for WsRegistry {
    async fn notify_user(&self, user_id: Id, kind: &str, title: &str, content: &str) {
        info!("📨 notify user {} [{}] {}", user_id, kind, title);
        let data = NotificationData {
            kind: kind.to_string(),
            title: title.to_string(),
            content: content.to_string(),
        };
        if let Err(e) = self.send_to_user(user_id, WsEventType::Notification, data).await {
            warn!("Failed to push notification to user {}: {}", user_id, e);
        }
    }
}

/// Configure WebSocket routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/{user_id}", web::get().to(websocket_handler));
}

/// `GET /ws/{user_id}`: upgrade and stream the user's notifications.
///
/// ## Example (JavaScript)
///
/// ```javascript
/// const ws = new WebSocket('ws://localhost:8080/ws/7');
/// ws.onmessage = (event) => console.log(JSON.parse(event.data));
/// ```
pub async fn websocket_handler(
    req: HttpRequest,
    path: web::Path<Id>,
    body: web::Payload,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse, actix_web::Error> {
    let user_id = path.into_inner();
    info!("WebSocket connection request for user {}", user_id);

    let (response, mut session, mut msg_stream) = actix_ws::handle(&req, body)?;
    let registry = state.ws_registry.clone();
    let mut rx = registry.register(user_id).await;

    actix_rt::spawn(async move {
        let welcome = WsMessage::new(
            WsEventType::Connected,
            serde_json::json!({ "status": "connected", "userId": user_id }),
        );
        if let Ok(json) = welcome.to_json() {
            if let Err(e) = session.text(json).await {
                error!("Failed to send welcome message: {}", e);
            }
        }

        // registry → socket
        let mut outbound = session.clone();
        let cleanup = registry.clone();
        actix_rt::spawn(async move {
            while let Ok(frame) = rx.recv().await {
                if let Err(e) = outbound.text(frame).await {
                    debug!("WebSocket session closed for user {}: {}", user_id, e);
                    cleanup.unregister(user_id).await;
                    break;
                }
            }
        });

        while let Some(Ok(msg)) = msg_stream.next().await {
            match msg {
                Message::Ping(bytes) => {
                    let _ = session.pong(&bytes).await;
                }
                Message::Text(text) => {
                    let reply = WsMessage::new(WsEventType::Pong, serde_json::json!({ "received": text.to_string() }));
                    if let Ok(json) = reply.to_json() {
                        let _ = session.text(json).await;
                    }
                }
                Message::Binary(_) => {
                    warn!("Received unexpected binary message from user {}", user_id);
                }
                Message::Close(reason) => {
                    info!("WebSocket closed for user {}: {:?}", user_id, reason);
                    break;
                }
                _ => {}
            }
        }

        registry.unregister(user_id).await;
        info!("WebSocket disconnected for user {}", user_id);
    });

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notification_reaches_every_connection() {
        let registry = WsRegistry::new();
        let mut first = registry.register(7).await;
        let mut second = registry.register(7).await;
        let mut other = registry.register(8).await;

        registry.notify_user(7, "provisioned", "VPS Ready", "done").await;

        for rx in [&mut first, &mut second] {
            let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame["event"], "notification");
            assert_eq!(frame["data"]["kind"], "provisioned");
            assert_eq!(frame["data"]["title"], "VPS Ready");
        }
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let registry = WsRegistry::new();
        let rx = registry.register(3).await;
        assert_eq!(registry.connection_count(3).await, 1);
        drop(rx);

        assert_eq!(registry.send_to_user(3, WsEventType::Pong, "x").await.unwrap(), 0);
        assert_eq!(registry.total_connections().await, 0);
        assert_eq!(registry.send_to_user(42, WsEventType::Pong, "x").await.unwrap(), 0);
    }
}
