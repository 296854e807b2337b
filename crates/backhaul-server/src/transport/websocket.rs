//! WebSocket front door using tokio-tungstenite.
//!
//! Accepts upgrades, remembers the `Host` the client asked for, and adapts
//! each connection to the relay's frame source and sink traits.

use backhaul_core::{
    BoxFuture, Frame, FrameSink, FrameSource, MessageType, RelayError, RelayResult,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// An upgraded connection and the host it addressed.
pub struct AcceptedSocket {
    pub ws_stream: WebSocketStream<TcpStream>,
    /// `Host` request header, lowercased, port included when sent.
    pub host: String,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields accepted connections. Handshakes that do
/// not finish within `handshake_timeout` are dropped.
pub async fn start_listener(
    bind_addr: SocketAddr,
    handshake_timeout: Duration,
) -> RelayResult<mpsc::Receiver<AcceptedSocket>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %bind_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<AcceptedSocket>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio::time::timeout(handshake_timeout, accept(stream)).await {
                            Ok(Ok((ws_stream, host))) => {
                                debug!(remote = %addr, host = %host, "WebSocket connection accepted");
                                let socket = AcceptedSocket {
                                    ws_stream,
                                    host,
                                    remote_addr: addr,
                                };
                                if tx.send(socket).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Ok(Err(e)) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                            Err(_) => {
                                warn!(remote = %addr, "WebSocket handshake timed out");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

/// Complete the upgrade, capturing the `Host` header.
async fn accept(stream: TcpStream) -> RelayResult<(WebSocketStream<TcpStream>, String)> {
    let mut host = String::new();
    let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if let Some(value) = request
            .headers()
            .get("host")
            .and_then(|v| v.to_str().ok())
        {
            host = value.trim().to_ascii_lowercase();
        }
        Ok(response)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture)
        .await
        .map_err(|e| RelayError::Transport(format!("WS handshake: {e}")))?;
    Ok((ws_stream, host))
}

/// Close a connection the relay will not serve.
pub async fn reject<S>(mut ws_stream: WebSocketStream<S>, reason: &'static str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Policy,
        reason: reason.into(),
    };
    if let Err(e) = ws_stream.close(Some(frame)).await {
        debug!(error = %e, "close after reject failed");
    }
}

/// Split a connection into the relay's frame source and sink.
pub fn split<S>(ws_stream: WebSocketStream<S>) -> (WsSource<S>, WsSink<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws_stream.split();
    (
        WsSource { stream },
        WsSink {
            state: Mutex::new(SinkState {
                sink,
                partial: None,
            }),
        },
    )
}

/// Receiving half. Control frames are answered by the protocol layer and
/// never surface as relay frames.
pub struct WsSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn recv_frame(&mut self) -> BoxFuture<'_, RelayResult<Option<Frame>>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(Some(Frame::text(&text))),
                    Some(Ok(Message::Binary(data))) => {
                        return Ok(Some(Frame::binary(data.to_vec())))
                    }
                    Some(Ok(Message::Close(_))) => return Ok(Some(Frame::close())),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(RelayError::Transport(format!("WS recv failed: {e}")))
                    }
                    None => return Ok(None),
                }
            }
        })
    }
}

struct SinkState<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    /// Fragments of a message whose last frame has not arrived yet.
    partial: Option<(MessageType, Vec<u8>)>,
}

/// Sending half, shared by every consumer that writes to this socket.
pub struct WsSink<S> {
    state: Mutex<SinkState<S>>,
}

impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn send_frame(&self, frame: Frame) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let message = match frame.message_type {
                MessageType::Close => {
                    state.partial = None;
                    Message::Close(None)
                }
                kind => {
                    let (kind, mut payload) = match state.partial.take() {
                        Some((started_as, buffered)) => (started_as, buffered),
                        None => (kind, Vec::new()),
                    };
                    payload.extend_from_slice(&frame.payload);
                    if !frame.end_of_message {
                        state.partial = Some((kind, payload));
                        return Ok(());
                    }
                    to_message(kind, payload)?
                }
            };
            state
                .sink
                .send(message)
                .await
                .map_err(|e| RelayError::Transport(format!("WS send failed: {e}")))
        })
    }
}

fn to_message(kind: MessageType, payload: Vec<u8>) -> RelayResult<Message> {
    match kind {
        MessageType::Text => {
            let text = String::from_utf8(payload)
                .map_err(|_| RelayError::MalformedEnvelope("text frame is not UTF-8".into()))?;
            Ok(Message::Text(text.into()))
        }
        _ => Ok(Message::Binary(payload.into())),
    }
}
