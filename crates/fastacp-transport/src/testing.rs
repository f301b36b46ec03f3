//! In-memory pipes for exercising transports and the engines built on them.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
};

use crate::LineTransport;

/// Buffer size of the in-memory pipe, per direction.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// A line transport over one end of an in-memory pipe.
pub type DuplexLineTransport = LineTransport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

fn line_transport(stream: DuplexStream) -> DuplexLineTransport {
    let (read, write) = tokio::io::split(stream);
    LineTransport::new(read, write)
}

/// Two unstarted line transports connected to each other.
#[must_use]
pub fn connected_pair() -> (DuplexLineTransport, DuplexLineTransport) {
    connected_pair_with_capacity(DEFAULT_PIPE_CAPACITY)
}

/// Like [`connected_pair`] with an explicit pipe capacity.
#[must_use]
pub fn connected_pair_with_capacity(capacity: usize) -> (DuplexLineTransport, DuplexLineTransport) {
    let (a, b) = tokio::io::duplex(capacity);
    (line_transport(a), line_transport(b))
}

/// An unstarted line transport plus the raw peer at the other end of its
/// pipe.
#[must_use]
pub fn line_peer(capacity: usize) -> (DuplexLineTransport, LinePeer) {
    let (ours, theirs) = tokio::io::duplex(capacity);
    let (read, writer) = tokio::io::split(theirs);
    let peer = LinePeer {
        lines: BufReader::new(read).lines(),
        writer,
    };
    (line_transport(ours), peer)
}

/// The far end of a transport's pipe, spoken to line by line.
#[derive(Debug)]
pub struct LinePeer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl LinePeer {
    /// Reads the next message, waiting at most `wait`.
    ///
    /// Returns `None` on timeout, end of stream, or an unparsable line.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Value> {
        match tokio::time::timeout(wait, self.lines.next_line()).await {
            Ok(Ok(Some(line))) => serde_json::from_str(&line).ok(),
            _ => None,
        }
    }

    /// Reads the next message, waiting up to five seconds.
    pub async fn recv(&mut self) -> Option<Value> {
        self.recv_within(Duration::from_secs(5)).await
    }

    /// Writes one message as a line.
    pub async fn send(&mut self, message: &Value) -> std::io::Result<()> {
        self.send_raw(&message.to_string()).await
    }

    /// Writes raw text followed by a newline.
    pub async fn send_raw(&mut self, text: &str) -> std::io::Result<()> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Ends the stream towards the transport.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.writer.shutdown().await
    }
}
