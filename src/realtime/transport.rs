//! # Transport
//!
//! The socket seam under the connection manager. A [`Connector`] opens one
//! transport and hands back a text-frame sink and stream; the manager owns
//! everything above that (timeouts, heartbeat, reconnect).

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::errors::{RealtimeError, RealtimeResult};

/// Outbound half: text frames
pub type FrameSink = Pin<Box<dyn Sink<String, Error = RealtimeError> + Send>>;

/// Inbound half: text frames until the peer closes
pub type FrameStream = Pin<Box<dyn Stream<Item = RealtimeResult<String>> + Send>>;

/// An open transport
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens transports. Resolving means the socket reported "open".
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, protocols: &[String]) -> RealtimeResult<Transport>;
}

/// WebSocket connector over tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str, protocols: &[String]) -> RealtimeResult<Transport> {
        let mut request = url.into_client_request()?;
        if !protocols.is_empty() {
            let value = HeaderValue::from_str(&protocols.join(", "))
                .map_err(|e| RealtimeError::Config(format!("Invalid sub-protocol list: {}", e)))?;
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }

        let (ws_stream, _response) = connect_async(request).await?;
        let (ws_sender, ws_receiver) = ws_stream.split();

        let sink = ws_sender.with(|text: String| async move {
            Ok::<_, RealtimeError>(Message::Text(text))
        });

        let stream = ws_receiver.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => Some(Err(RealtimeError::Parse(
                        "binary frame is not valid UTF-8".to_string(),
                    ))),
                },
                // Ping/pong are answered by tungstenite; close ends the stream
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            }
        });

        Ok(Transport::new(Box::pin(sink), Box::pin(stream)))
    }
}
