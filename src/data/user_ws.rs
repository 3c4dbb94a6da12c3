//! User-data stream bound to a listen-key.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::error::Result;

use super::frames::{AccountUpdateFrame, OrderUpdateFrame, UserFrame};

/// Events surfaced by a user-data stream.
#[derive(Debug, Clone)]
pub enum UserWsEvent {
    Order(OrderUpdateFrame),
    Account(AccountUpdateFrame),
    ListenKeyExpired,
    Disconnected { reason: String },
}

/// Transport seam for the user-data stream.
#[async_trait]
pub trait UserStream: Send {
    async fn connect(&mut self, listen_key: &str) -> Result<()>;

    async fn next_event(&mut self) -> Option<UserWsEvent>;
}

/// Live user-data stream over tokio-tungstenite.
pub struct WsUserStream {
    base_url: String,
    ws: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl WsUserStream {
    pub fn new(base_url: String) -> Self {
        Self { base_url, ws: None }
    }
}

#[async_trait]
impl UserStream for WsUserStream {
    async fn connect(&mut self, listen_key: &str) -> Result<()> {
        let url = format!("{}/ws/{listen_key}", self.base_url.trim_end_matches('/'));
        info!("connecting user-data stream");
        let (ws, response) = connect_async(&url).await?;
        info!(status = %response.status(), "user-data stream connected");
        self.ws = Some(ws);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<UserWsEvent> {
        let ws = self.ws.as_mut()?;
        loop {
            match ws.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str::<UserFrame>(&text) {
                    Ok(UserFrame::OrderTradeUpdate { order }) => {
                        return Some(UserWsEvent::Order(order));
                    }
                    Ok(UserFrame::AccountUpdate { account }) => {
                        return Some(UserWsEvent::Account(account));
                    }
                    Ok(UserFrame::ListenKeyExpired) => return Some(UserWsEvent::ListenKeyExpired),
                    Ok(UserFrame::Unknown) => continue,
                    Err(e) => {
                        warn!(error = %e, raw = %text, "failed to parse user frame");
                        continue;
                    }
                },
                Ok(Message::Ping(payload)) => {
                    if ws.send(Message::Pong(payload)).await.is_err() {
                        return Some(UserWsEvent::Disconnected {
                            reason: "failed to answer ping".into(),
                        });
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!(frame = ?frame, "user-data stream closed by server");
                    return Some(UserWsEvent::Disconnected {
                        reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                    });
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "user-data stream error");
                    return Some(UserWsEvent::Disconnected { reason: e.to_string() });
                }
            }
        }
    }
}
