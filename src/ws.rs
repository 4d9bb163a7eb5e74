//! WebSocket [`Connector`] and [`Transport`] for [`crate::channel::SessionChannel`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::channel::{Connector, Frame, Received, Transport, TransportError};

/// Opens WebSocket connections for [`crate::channel::SessionChannel`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, endpoint: &str) -> Result<WsTransport, TransportError> {
        let (stream, response) =
            connect_async(endpoint)
                .await
                .map_err(|e| TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;
        debug!(endpoint, status = %response.status(), "WebSocket handshake complete");
        Ok(WsTransport { stream })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::text(text),
            Frame::Binary(data) => Message::binary(data),
        };
        self.stream.send(message).await.map_err(io_error)
    }

    async fn recv(&mut self) -> Result<Received, TransportError> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                None | Some(Err(tungstenite::Error::ConnectionClosed)) => {
                    return Ok(Received::Closed {
                        code: None,
                        reason: String::new(),
                    })
                }
                Some(Err(e)) => return Err(io_error(e)),
            };

            match message {
                Message::Text(text) => {
                    return Ok(Received::Frame(Frame::Text(text.as_str().to_owned())))
                }
                Message::Binary(data) => return Ok(Received::Frame(Frame::Binary(data))),
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_owned()))
                        .unwrap_or((None, String::new()));
                    return Ok(Received::Closed { code, reason });
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }
}

fn io_error(e: tungstenite::Error) -> TransportError {
    TransportError::Io(e.to_string())
}
