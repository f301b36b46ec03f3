//! WebSocket transport: one JSON-RPC message per text frame.
//!
//! Inbound text frames are decoded individually. Binary, ping and pong
//! frames are logged and discarded. Closing drains the outbound queue, then
//! sends a close frame whose code tells a cooperative shutdown apart from a
//! failure.

use std::sync::{Arc, Mutex};

use fastacp_core::log_transport;
use fastacp_core::logging::targets;
use fastacp_protocol::JsonRpcMessage;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::state::{DrainClock, ReaderGuard, TransportState, WriterGuard, lock};
use crate::{CloseObserver, CloseReason, Codec, ErrorObserver, Transport, TransportError};

/// Default path segment the frame transport is mounted at.
pub const DEFAULT_ACP_PATH: &str = "acp";

/// Frame transport over any WebSocket message stream.
pub struct FrameTransport<S> {
    state: Arc<TransportState>,
    socket: Mutex<Option<S>>,
}

impl<S> FrameTransport<S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    /// Wraps an established WebSocket.
    #[must_use]
    pub fn new(socket: S) -> Self {
        Self {
            state: TransportState::new("websocket"),
            socket: Mutex::new(Some(socket)),
        }
    }

    /// Sets the maximum size of one frame payload in bytes.
    ///
    /// An engine wrapping the transport applies its own configured limit.
    #[must_use]
    pub fn with_max_message_size(self, size: usize) -> Self {
        self.state.set_max_message_size(size);
        self
    }
}

impl<S> Transport for FrameTransport<S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    fn start(&self) -> Result<(), TransportError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let pumps = self.state.begin()?;
        let Some(socket) = lock(&self.socket).take() else {
            return Err(TransportError::AlreadyStarted);
        };
        let (sink, stream) = socket.split();
        let max_message_size = self.state.max_message_size();

        runtime.spawn(read_loop(
            Arc::clone(&self.state),
            stream,
            pumps.incoming,
            Codec::new(max_message_size),
        ));
        runtime.spawn(write_loop(
            Arc::clone(&self.state),
            sink,
            pumps.outbound,
            Codec::new(max_message_size),
        ));
        log_transport!("websocket transport started");
        Ok(())
    }

    fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.state.send(message)
    }

    fn incoming(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>> {
        self.state.take_incoming()
    }

    fn on_error(&self, observer: ErrorObserver) {
        self.state.add_error_observer(observer);
    }

    fn on_close(&self, observer: CloseObserver) {
        self.state.add_close_observer(observer);
    }

    fn set_max_message_size(&self, size: usize) {
        self.state.set_max_message_size(size);
    }

    fn close(&self) {
        self.state.begin_close(CloseReason::Local);
        if !self.state.is_started() {
            lock(&self.socket).take();
            self.state.finish();
        }
    }

    fn is_closed(&self) -> bool {
        self.state.is_finished()
    }
}

async fn read_loop<S>(
    state: Arc<TransportState>,
    mut stream: SplitStream<S>,
    incoming: mpsc::UnboundedSender<JsonRpcMessage>,
    codec: Codec,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let _guard = ReaderGuard(Arc::clone(&state));

    let reason = loop {
        let frame = tokio::select! {
            () = state.shutdown_token().cancelled() => break None,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match codec.decode_text(text.as_str()) {
                Ok(message) => {
                    log::trace!(target: targets::TRANSPORT, "<- {}", text.as_str());
                    if incoming.send(message).is_err() {
                        log_transport!("incoming receiver dropped; discarding frame");
                    }
                }
                Err(err) => state.report_error(&TransportError::Codec(err)),
            },
            Some(Ok(Message::Close(frame))) => {
                log_transport!("peer sent close frame: {:?}", frame);
                break Some(CloseReason::Eof);
            }
            Some(Ok(other)) => {
                log_transport!("discarding non-text frame ({} bytes)", other.len());
            }
            Some(Err(err)) => {
                let reason = CloseReason::Failed(err.to_string());
                state.report_error(&TransportError::from(err));
                break Some(reason);
            }
            None => break Some(CloseReason::Eof),
        }
    };

    if let Some(reason) = reason {
        log_transport!("websocket reader stopped: {}", reason);
        state.begin_close(reason);
    }
}

async fn write_loop<S>(
    state: Arc<TransportState>,
    mut sink: SplitSink<S, Message>,
    mut outbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
    codec: Codec,
) where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let _guard = WriterGuard(Arc::clone(&state));
    let mut clock = DrainClock::new(&state);

    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => message,
            () = state.shutdown_token().cancelled() => None,
        };
        let Some(message) = message else { break };
        if !write_frame(&state, &mut clock, &mut sink, &codec, &message).await {
            return;
        }
    }

    clock.start_draining();
    while let Ok(message) = outbound.try_recv() {
        if !write_frame(&state, &mut clock, &mut sink, &codec, &message).await {
            return;
        }
    }

    let frame = match state.close_reason() {
        Some(CloseReason::Failed(_)) => CloseFrame {
            code: CloseCode::Error,
            reason: Utf8Bytes::from_static("transport failure"),
        },
        _ => CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::from_static("closing"),
        },
    };
    match clock.run(sink.send(Message::Close(Some(frame)))).await {
        Some(Ok(())) => {}
        Some(Err(err)) => log_transport!("close frame not sent: {}", err),
        None => log_transport!("close frame timed out"),
    }
    if let Some(Err(err)) = clock.run(sink.close()).await {
        log_transport!("websocket close failed: {}", err);
    }
}

/// Sends one text frame. Returns false if the socket is broken.
async fn write_frame<S>(
    state: &TransportState,
    clock: &mut DrainClock<'_>,
    sink: &mut SplitSink<S, Message>,
    codec: &Codec,
    message: &JsonRpcMessage,
) -> bool
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let text = match codec.encode_text(message) {
        Ok(text) => text,
        Err(err) => {
            state.report_error(&TransportError::Codec(err));
            return true;
        }
    };
    log::trace!(target: targets::TRANSPORT, "-> {}", text);

    match clock.run(sink.send(Message::Text(text.into()))).await {
        Some(Ok(())) => true,
        Some(Err(err)) => {
            state.begin_close(CloseReason::Failed(err.to_string()));
            state.report_error(&TransportError::from(err));
            false
        }
        None => {
            log::warn!(target: targets::TRANSPORT, "peer stopped reading; dropping unsent frames");
            false
        }
    }
}

/// Returns the URL of the ACP endpoint under `base`.
///
/// ```
/// assert_eq!(
///     fastacp_transport::websocket::acp_url("ws://localhost:8080/"),
///     "ws://localhost:8080/acp"
/// );
/// ```
#[must_use]
pub fn acp_url(base: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), DEFAULT_ACP_PATH)
}

/// Connects to a WebSocket endpoint and wraps it in a frame transport.
///
/// # Errors
///
/// Returns an error if the TCP connection or the handshake fails.
pub async fn connect(
    url: &str,
) -> Result<FrameTransport<WebSocketStream<MaybeTlsStream<TcpStream>>>, TransportError> {
    let (socket, _response) = tokio_tungstenite::connect_async(url).await?;
    log_transport!("connected to {}", url);
    Ok(FrameTransport::new(socket))
}

/// Performs the server side of the handshake on an accepted stream.
///
/// Requests for any path other than `/{path}` are answered with 404.
///
/// # Errors
///
/// Returns an error if the handshake fails or the path does not match.
pub async fn accept<T>(
    stream: T,
    path: &str,
) -> Result<FrameTransport<WebSocketStream<T>>, TransportError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let expected = format!("/{}", path.trim_start_matches('/'));
    let check_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if request.uri().path() == expected {
            Ok(response)
        } else {
            log_transport!("rejecting websocket upgrade for {}", request.uri().path());
            let body = format!("no ACP endpoint at {}", request.uri().path());
            let mut rejection = ErrorResponse::new(Some(body));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };
    let socket = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
    Ok(FrameTransport::new(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastacp_protocol::{JsonRpcNotification, JsonRpcRequest, RequestId};
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn raw_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, server)
    }

    #[test]
    fn test_acp_url() {
        assert_eq!(acp_url("ws://h:1"), "ws://h:1/acp");
        assert_eq!(acp_url("ws://h:1//"), "ws://h:1/acp");
    }

    #[tokio::test]
    async fn test_text_frames_roundtrip() {
        let (client, server) = raw_pair().await;
        let client = FrameTransport::new(client);
        let server = FrameTransport::new(server);
        client.start().unwrap();
        server.start().unwrap();
        let mut incoming = server.incoming().unwrap();

        client
            .send(JsonRpcRequest::new(5i64, "test/testRequest", None).into())
            .unwrap();
        let Some(JsonRpcMessage::Request(req)) = incoming.recv().await else {
            panic!("Expected request");
        };
        assert_eq!(req.id, RequestId::Number(5));
    }

    #[tokio::test]
    async fn test_non_text_frames_are_discarded() {
        let (mut raw, server) = raw_pair().await;
        let server = FrameTransport::new(server);
        let errors = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let errors = Arc::clone(&errors);
            server.on_error(Box::new(move |_| {
                errors.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        server.start().unwrap();
        let mut incoming = server.incoming().unwrap();

        raw.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
        raw.send(Message::Text(String::from(r#"{"jsonrpc":"2.0","method":"after"}"#).into()))
            .await
            .unwrap();

        let msg = incoming.recv().await.unwrap();
        assert_eq!(msg.method(), Some("after"));
        assert_eq!(errors.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_drains_then_sends_normal_close() {
        let (client, mut raw) = raw_pair().await;
        let client = FrameTransport::new(client);
        client.start().unwrap();
        for i in 0..3 {
            client
                .send(JsonRpcNotification::new(format!("n{i}"), None).into())
                .unwrap();
        }
        client.close();

        let mut methods = Vec::new();
        let close = loop {
            match raw.next().await {
                Some(Ok(Message::Text(text))) => {
                    let msg = fastacp_protocol::decode(text.as_str()).unwrap();
                    methods.push(msg.method().unwrap().to_owned());
                }
                Some(Ok(Message::Close(frame))) => break frame,
                other => panic!("unexpected frame: {other:?}"),
            }
        };
        assert_eq!(methods, vec!["n0", "n1", "n2"]);
        assert_eq!(close.unwrap().code, CloseCode::Normal);
    }

    #[tokio::test]
    async fn test_peer_close_ends_incoming() {
        let (mut raw, server) = raw_pair().await;
        let server = FrameTransport::new(server);
        server.start().unwrap();
        let mut incoming = server.incoming().unwrap();

        raw.close(None).await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(2), incoming.recv())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_accept_rejects_other_paths() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut results = Vec::new();
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                results.push(accept(stream, DEFAULT_ACP_PATH).await.is_ok());
            }
            results
        });

        let base = format!("ws://{addr}");
        assert!(connect(&format!("{base}/other")).await.is_err());
        let transport = connect(&acp_url(&base)).await.unwrap();
        transport.start().unwrap();

        assert_eq!(server.await.unwrap(), vec![false, true]);
    }
}
