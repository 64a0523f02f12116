//! Session transport
//!
//! The duplex session talks to the live service through a [`LiveConnector`],
//! which yields a split transport: a [`FrameSink`] owned by the send loop and
//! a [`MessageSource`] owned by the receive loop.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::LiveConfig;
use crate::error::ConnectionError;
use crate::session::protocol::{parse_events, ClientMessage, InboundEvent, SessionSetup};

/// Outbound half of an open session
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, message: ClientMessage) -> Result<(), ConnectionError>;

    /// Close the transport; errors are not interesting at this point
    async fn close(&mut self);
}

/// Inbound half of an open session
#[async_trait]
pub trait MessageSource: Send {
    /// Events of the next inbound message. `None` once the service closed
    /// the session.
    async fn next_events(&mut self) -> Option<Result<Vec<InboundEvent>, ConnectionError>>;
}

/// Both halves of an open session
pub struct LiveTransport {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn MessageSource>,
}

/// Opens sessions with the live service
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Open a session and complete the setup exchange
    async fn open(&self, setup: &SessionSetup) -> Result<LiveTransport, ConnectionError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket connection to the live service
pub struct WebSocketConnector {
    endpoint: String,
    /// Resolved key, or the error every `open` reports without one
    api_key: Result<String, ConnectionError>,
    timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: Ok(api_key.into()),
            timeout,
        }
    }

    /// Build from config. A missing API key is reported when a session is
    /// opened, so peer links work without one.
    pub fn from_config(config: &LiveConfig) -> Self {
        let api_key = config.resolve_api_key();
        if let Err(e) = &api_key {
            tracing::warn!("Live service disabled: {}", e);
        }
        Self {
            endpoint: config.endpoint.clone(),
            api_key,
            timeout: config.connect_timeout(),
        }
    }

    fn url(&self) -> Result<Url, ConnectionError> {
        let api_key = self.api_key.as_ref().map_err(Clone::clone)?;
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| ConnectionError::Handshake(format!("invalid endpoint: {}", e)))?;
        url.query_pairs_mut().append_pair("key", api_key);
        Ok(url)
    }

    async fn handshake(&self, setup: &SessionSetup) -> Result<LiveTransport, ConnectionError> {
        let url = self.url()?;
        tracing::info!("Connecting to {}", self.endpoint);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        let (write, read) = ws_stream.split();
        let mut sink = WsSink { write };
        let mut source = WsSource { read };

        sink.send(ClientMessage::setup(setup)).await?;

        loop {
            match source.next_events().await {
                Some(Ok(events)) => {
                    if events.contains(&InboundEvent::SetupComplete) {
                        break;
                    }
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ConnectionError::Handshake(
                        "closed before setup completed".to_string(),
                    ))
                }
            }
        }

        tracing::info!("Live session ready (model {}, voice {})", setup.model, setup.voice);
        Ok(LiveTransport {
            sink: Box::new(sink),
            source: Box::new(source),
        })
    }
}

#[async_trait]
impl LiveConnector for WebSocketConnector {
    async fn open(&self, setup: &SessionSetup) -> Result<LiveTransport, ConnectionError> {
        tokio::time::timeout(self.timeout, self.handshake(setup))
            .await
            .map_err(|_| ConnectionError::Handshake("timed out".to_string()))?
    }
}

struct WsSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, message: ClientMessage) -> Result<(), ConnectionError> {
        let json = message
            .to_json()
            .map_err(|e| ConnectionError::Protocol(e.to_string()))?;
        self.write
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.write.close().await;
    }
}

struct WsSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl MessageSource for WsSource {
    async fn next_events(&mut self) -> Option<Result<Vec<InboundEvent>, ConnectionError>> {
        loop {
            let message = match self.read.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(ConnectionError::Transport(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(parse_events(text.as_str()))),
                // The service sends JSON in binary frames as well
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => return Some(Ok(parse_events(text))),
                    Err(_) => {
                        tracing::warn!("Ignoring non-UTF-8 binary frame ({} bytes)", data.len());
                    }
                },
                Message::Close(frame) => {
                    tracing::info!("Live service closed the session: {:?}", frame);
                    return None;
                }
                _ => {}
            }
        }
    }
}
