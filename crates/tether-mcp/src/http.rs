//! HTTP transport: one POST per outbound message.
//!
//! The response body of a successful POST, when present, is the provider's
//! reply and is fed back to the client like a line read from a pipe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderValue};

use crate::config::ServerConfig;
use crate::error::McpError;
use crate::transport::{EventSender, Transport, TransportEvent, TransportFuture};

/// Posts each message to a fixed endpoint.
pub struct HttpTransport {
    name: String,
    url: String,
    http: reqwest::Client,
    events: EventSender,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(config: &ServerConfig, events: EventSender) -> Result<Self, McpError> {
        let url = config.url.clone().ok_or_else(|| McpError::InvalidConfig {
            name: config.name.clone(),
            message: "http transport requires `url`".into(),
        })?;
        // Whole-exchange deadlines belong to the client, per request.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| McpError::Transport {
                name: config.name.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            name: config.name.clone(),
            url,
            http,
            events,
            closed: AtomicBool::new(false),
        })
    }

    fn transport_error(&self, message: impl Into<String>) -> McpError {
        McpError::Transport {
            name: self.name.clone(),
            message: message.into(),
        }
    }

    async fn post(&self, message: String) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.transport_error("transport closed"));
        }

        tracing::debug!("POST {} ({} bytes)", self.url, message.len());
        let result = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(message)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let reason = format!("POST {} failed: {e}", self.url);
                // Only an unreachable endpoint means the connection is gone; a
                // slow or failed exchange fails this message alone.
                if e.is_connect() {
                    let _ = self.events.send(TransportEvent::Closed {
                        reason: reason.clone(),
                    });
                }
                return Err(self.transport_error(reason));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(self.transport_error(format!("HTTP {status} from {}", self.url)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(format!("failed to read response body: {e}")))?;
        for message in split_body(&body) {
            if self.events.send(TransportEvent::Message(message)).is_err() {
                break;
            }
        }
        Ok(())
    }
}

impl Transport for HttpTransport {
    fn send(&self, message: String) -> TransportFuture<'_, Result<(), McpError>> {
        Box::pin(self.post(message))
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
        })
    }
}

/// A body is empty (notification accepted), one message, or a JSON array
/// batch of messages.
fn split_body(body: &str) -> Vec<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') {
        if let Ok(batch) = serde_json::from_str::<Vec<serde_json::Value>>(trimmed) {
            return batch.iter().map(|m| m.to_string()).collect();
        }
    }
    vec![trimmed.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serve one canned HTTP response per incoming connection.
    async fn start_test_server(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/rpc")
    }

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {body}",
            body.len()
        )
    }

    #[test]
    fn split_body_variants() {
        assert!(split_body("  ").is_empty());
        assert_eq!(split_body(r#"{"id":1}"#), vec![r#"{"id":1}"#]);
        assert_eq!(
            split_body(r#"[{"id":1},{"id":2}]"#),
            vec![r#"{"id":1}"#, r#"{"id":2}"#]
        );
    }

    #[tokio::test]
    async fn success_body_is_delivered() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        let url = start_test_server(vec![http_response("200 OK", body)]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = HttpTransport::new(&ServerConfig::http("web", url), tx).unwrap();

        transport.send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.into()).await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::Message(body.to_string())));
    }

    #[tokio::test]
    async fn non_2xx_is_a_transport_failure_not_a_disconnect() {
        let url = start_test_server(vec![http_response("500 Internal Server Error", "oops")]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = HttpTransport::new(&ServerConfig::http("web", url), tx).unwrap();

        let result = transport.send("{}".into()).await;
        assert!(matches!(result, Err(McpError::Transport { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_closed() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport =
            HttpTransport::new(&ServerConfig::http("web", format!("http://{addr}/")), tx).unwrap();

        assert!(transport.send("{}".into()).await.is_err());
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed { .. })));
    }

    #[tokio::test]
    async fn dropped_reply_fails_the_message_without_closing() {
        // Accepts the request, then hangs up without answering
        let url = start_test_server(vec![String::new()]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = HttpTransport::new(&ServerConfig::http("web", url), tx).unwrap();

        assert!(matches!(
            transport.send("{}".into()).await,
            Err(McpError::Transport { .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport =
            HttpTransport::new(&ServerConfig::http("web", "http://127.0.0.1:9/"), tx).unwrap();
        transport.close().await;
        assert!(transport.send("{}".into()).await.is_err());
    }
}
