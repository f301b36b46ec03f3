//! Newline-delimited JSON transport over async byte streams.
//!
//! # Wire Format
//!
//! - Each message is serialized as a single line of JSON
//! - Lines are terminated by `\n` (a trailing `\r` is tolerated on input)
//! - Empty lines are ignored
//! - UTF-8 encoding is required
//!
//! A line that fails to decode is reported to the error observers and
//! skipped; the read loop keeps going.

use std::sync::{Arc, Mutex};

use fastacp_core::config::ProtocolConfig;
use fastacp_core::log_transport;
use fastacp_core::logging::{Level, is_enabled, targets};
use fastacp_protocol::JsonRpcMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::state::{DrainClock, ReaderGuard, TransportState, WriterGuard, lock};
use crate::{CloseObserver, CloseReason, Codec, ErrorObserver, Transport, TransportError};

const READ_CHUNK: usize = 8 * 1024;

/// Line-delimited transport over an async reader/writer pair.
pub struct LineTransport<R, W> {
    state: Arc<TransportState>,
    io: Mutex<Option<(R, W)>>,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a transport over the given reader and writer.
    #[must_use]
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            state: TransportState::new("line"),
            io: Mutex::new(Some((reader, writer))),
        }
    }

    /// Sets the maximum size of one line in bytes.
    ///
    /// An engine wrapping the transport applies its own configured limit.
    #[must_use]
    pub fn with_max_message_size(self, size: usize) -> Self {
        self.state.set_max_message_size(size);
        self
    }
}

impl LineTransport<tokio::io::Stdin, tokio::io::Stdout> {
    /// Creates a transport over the process stdin/stdout.
    ///
    /// This is the usual setup for an agent launched as a subprocess. The
    /// line size limit comes from `FASTACP_MAX_MESSAGE_SIZE`.
    #[must_use]
    pub fn stdio() -> Self {
        let config = ProtocolConfig::from_env();
        Self::new(tokio::io::stdin(), tokio::io::stdout())
            .with_max_message_size(config.max_message_size)
    }
}

impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn start(&self) -> Result<(), TransportError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let pumps = self.state.begin()?;
        let Some((reader, writer)) = lock(&self.io).take() else {
            return Err(TransportError::AlreadyStarted);
        };
        let max_message_size = self.state.max_message_size();

        runtime.spawn(read_loop(
            Arc::clone(&self.state),
            reader,
            pumps.incoming,
            Codec::new(max_message_size),
        ));
        runtime.spawn(write_loop(
            Arc::clone(&self.state),
            writer,
            pumps.outbound,
            Codec::new(max_message_size),
        ));
        log_transport!("line transport started");
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
            lock(&self.io).take();
            self.state.finish();
        }
    }

    fn is_closed(&self) -> bool {
        self.state.is_finished()
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    state: Arc<TransportState>,
    mut reader: R,
    incoming: mpsc::UnboundedSender<JsonRpcMessage>,
    mut codec: Codec,
) {
    let _guard = ReaderGuard(Arc::clone(&state));
    let mut buf = vec![0u8; READ_CHUNK];

    let reason = loop {
        let read = tokio::select! {
            () = state.shutdown_token().cancelled() => break None,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                if let Some(result) = codec.finish() {
                    deliver(&state, &incoming, result);
                }
                break Some(CloseReason::Eof);
            }
            Ok(n) => {
                for result in codec.decode(&buf[..n]) {
                    deliver(&state, &incoming, result);
                }
            }
            Err(err) => {
                let reason = CloseReason::Failed(err.to_string());
                state.report_error(&TransportError::Io(err));
                break Some(reason);
            }
        }
    };

    if let Some(reason) = reason {
        log_transport!("line reader stopped: {}", reason);
        state.begin_close(reason);
    }
}

fn deliver(
    state: &TransportState,
    incoming: &mpsc::UnboundedSender<JsonRpcMessage>,
    result: Result<JsonRpcMessage, crate::CodecError>,
) {
    match result {
        Ok(message) => {
            log::trace!(target: targets::TRANSPORT, "<- {:?}", message);
            if incoming.send(message).is_err() {
                log_transport!("incoming receiver dropped; discarding message");
            }
        }
        Err(err) => state.report_error(&TransportError::Codec(err)),
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    state: Arc<TransportState>,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
    codec: Codec,
) {
    let _guard = WriterGuard(Arc::clone(&state));
    let mut clock = DrainClock::new(&state);

    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => message,
            () = state.shutdown_token().cancelled() => None,
        };
        let Some(message) = message else { break };
        if !write_message(&state, &mut clock, &mut writer, &codec, &message).await {
            return;
        }
    }

    // Drain what was queued before shutdown began.
    clock.start_draining();
    while let Ok(message) = outbound.try_recv() {
        if !write_message(&state, &mut clock, &mut writer, &codec, &message).await {
            return;
        }
    }
    match clock.run(writer.shutdown()).await {
        Some(Ok(())) => {}
        Some(Err(err)) => log_transport!("writer shutdown failed: {}", err),
        None => log_transport!("writer shutdown timed out"),
    }
}

/// Writes one line and flushes. Returns false if the writer is broken.
async fn write_message<W: AsyncWrite + Unpin>(
    state: &TransportState,
    clock: &mut DrainClock<'_>,
    writer: &mut W,
    codec: &Codec,
    message: &JsonRpcMessage,
) -> bool {
    let bytes = match codec.encode_line(message) {
        Ok(bytes) => bytes,
        Err(err) => {
            state.report_error(&TransportError::Codec(err));
            return true;
        }
    };
    if is_enabled(Level::Trace, targets::TRANSPORT) {
        log::trace!(target: targets::TRANSPORT, "-> {}", String::from_utf8_lossy(&bytes).trim_end());
    }

    let written = clock
        .run(async {
            match writer.write_all(&bytes).await {
                Ok(()) => writer.flush().await,
                Err(err) => Err(err),
            }
        })
        .await;
    match written {
        Some(Ok(())) => true,
        Some(Err(err)) => {
            state.begin_close(CloseReason::Failed(err.to_string()));
            state.report_error(&TransportError::Io(err));
            false
        }
        None => {
            log::warn!(target: targets::TRANSPORT, "peer stopped reading; dropping unsent messages");
            false
        }
    }
}
