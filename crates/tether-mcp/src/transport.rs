//! Transport abstraction: raw message delivery with no protocol semantics.
//!
//! A transport pushes everything it receives into an unbounded channel owned
//! by the client. Loss of the remote side is reported on the same channel as
//! [`TransportEvent::Closed`], so the client sees messages and disconnects in
//! arrival order.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::config::{ServerConfig, TransportKind};
use crate::error::McpError;
use crate::http::HttpTransport;
use crate::stdio::StdioTransport;

/// Boxed future returned by transport trait methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Channel a transport reports incoming traffic on.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Something that happened on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete raw message (a line, or an HTTP body).
    Message(String),
    /// The remote side is gone. No further events follow.
    Closed { reason: String },
}

/// A bidirectional message pipe to one provider.
pub trait Transport: Send + Sync {
    /// Deliver one serialized message to the provider.
    fn send(&self, message: String) -> TransportFuture<'_, Result<(), McpError>>;

    /// Tear down the underlying process or endpoint. Safe to call repeatedly.
    fn close(&self) -> TransportFuture<'_, ()>;
}

/// Opens transports for provider configurations.
///
/// The connection manager goes through a factory so that providers can be
/// reached over something other than a process or socket.
pub trait TransportFactory: Send + Sync {
    fn open<'a>(
        &'a self,
        config: &'a ServerConfig,
        events: EventSender,
    ) -> TransportFuture<'a, Result<Box<dyn Transport>, McpError>>;
}

/// Opens stdio and http transports according to [`ServerConfig::transport`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn open<'a>(
        &'a self,
        config: &'a ServerConfig,
        events: EventSender,
    ) -> TransportFuture<'a, Result<Box<dyn Transport>, McpError>> {
        Box::pin(async move {
            config.validate()?;
            let transport: Box<dyn Transport> = match config.transport {
                TransportKind::Stdio => Box::new(StdioTransport::spawn(config, events).await?),
                TransportKind::Http => Box::new(HttpTransport::new(config, events)?),
            };
            Ok(transport)
        })
    }
}

/// Splits a byte stream into lines, holding back a trailing partial line
/// until the rest of it arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed. Blank lines are
    /// skipped and a trailing `\r` is stripped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn rebuffers_partial_line() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"id\":1,\"res").is_empty());
        assert_eq!(buf.pending(), 12);
        let lines = buf.push(b"ult\":{}}\n{\"id\":2");
        assert_eq!(lines, vec!["{\"id\":1,\"result\":{}}"]);
        let lines = buf.push(b"}\n");
        assert_eq!(lines, vec!["{\"id\":2}"]);
    }

    #[test]
    fn skips_blank_lines_and_carriage_returns() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"\n\r\n{\"x\":true}\r\n");
        assert_eq!(lines, vec!["{\"x\":true}"]);
    }

    #[tokio::test]
    async fn default_factory_rejects_incomplete_config() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = ServerConfig {
            command: None,
            ..ServerConfig::stdio("broken", "", vec![])
        };
        let result = DefaultTransportFactory.open(&config, tx).await;
        assert!(matches!(result, Err(McpError::InvalidConfig { .. })));
    }
}
