//! Market K-line stream: one multiplexed socket per account.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::frames::MarketFrame;

/// One market subscription: a symbol at an interval.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamSub {
    pub symbol: String,
    pub interval: String,
}

impl StreamSub {
    /// Stream name in the exchange's `symbol@kline_interval` form.
    pub fn stream_name(&self) -> String {
        format!("{}@kline_{}", self.symbol.to_lowercase(), self.interval)
    }
}

/// Events surfaced by a market stream.
#[derive(Debug, Clone)]
pub enum MarketWsEvent {
    /// A candle closed for a subscribed symbol/interval.
    ClosedKline { symbol: String, interval: String },
    Disconnected { reason: String },
}

/// Transport seam for the market stream; tests substitute scripted
/// implementations.
#[async_trait]
pub trait MarketStream: Send {
    async fn connect(&mut self) -> Result<()>;

    /// Subscribe (or re-subscribe after reconnect) to the given set.
    async fn subscribe(&mut self, subs: &[StreamSub]) -> Result<()>;

    /// Next event, or `None` when the stream is exhausted.
    async fn next_event(&mut self) -> Option<MarketWsEvent>;
}

/// Live market stream over tokio-tungstenite.
pub struct WsMarketStream {
    url: String,
    ws: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    next_request_id: u64,
}

impl WsMarketStream {
    pub fn new(url: String) -> Self {
        Self { url, ws: None, next_request_id: 1 }
    }
}

#[async_trait]
impl MarketStream for WsMarketStream {
    async fn connect(&mut self) -> Result<()> {
        info!(url = %self.url, "connecting market stream");
        let (ws, response) = connect_async(&self.url).await?;
        info!(status = %response.status(), "market stream connected");
        self.ws = Some(ws);
        Ok(())
    }

    async fn subscribe(&mut self, subs: &[StreamSub]) -> Result<()> {
        let ws = self
            .ws
            .as_mut()
            .ok_or_else(|| Error::Connection("market stream not connected".into()))?;
        let params: Vec<String> = subs.iter().map(StreamSub::stream_name).collect();
        let request = json!({
            "method": "SUBSCRIBE",
            "params": params,
            "id": self.next_request_id,
        });
        self.next_request_id += 1;
        info!(streams = ?params, "subscribing market streams");
        ws.send(Message::Text(request.to_string())).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<MarketWsEvent> {
        let ws = self.ws.as_mut()?;
        loop {
            match ws.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str::<MarketFrame>(&text) {
                    Ok(MarketFrame::Kline { symbol, kline }) if kline.is_closed => {
                        return Some(MarketWsEvent::ClosedKline {
                            symbol,
                            interval: kline.interval,
                        });
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        // Subscription acks and list responses land here.
                        debug!(error = %e, raw = %text, "ignoring non-kline frame");
                        continue;
                    }
                },
                Ok(Message::Ping(payload)) => {
                    if ws.send(Message::Pong(payload)).await.is_err() {
                        return Some(MarketWsEvent::Disconnected {
                            reason: "failed to answer ping".into(),
                        });
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!(frame = ?frame, "market stream closed by server");
                    return Some(MarketWsEvent::Disconnected {
                        reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                    });
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "market stream error");
                    return Some(MarketWsEvent::Disconnected { reason: e.to_string() });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_name_is_lowercased() {
        let sub = StreamSub { symbol: "XRPUSDC".into(), interval: "15m".into() };
        assert_eq!(sub.stream_name(), "xrpusdc@kline_15m");
    }
}
