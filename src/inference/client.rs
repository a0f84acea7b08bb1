//! Messages API completion client.
//!
//! Sends the conversation history to the completion endpoint with streaming
//! enabled and hands the live body to the SSE decoder. One call, one HTTP
//! request; nothing is retried here.

use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::Client as HttpClient;

use crate::chat_core::types::Message;

use super::config::RemyConfig;
use super::errors::InferenceError;
use super::secrets::SecretSource;
use super::streaming::{spawn_decoder, TextStream};
use super::types::{ApiMessage, MessagesRequest};

// ─── CompletionSource ────────────────────────────────────────────────────────

/// Anything that can turn a history into a stream of reply fragments.
///
/// [`CompletionClient`] is the production implementation; the controller is
/// generic over this so turns can be driven by scripted streams in tests.
pub trait CompletionSource: Send + Sync {
    /// Request a reply to `history`. The history must not contain the
    /// placeholder message the reply will be written into.
    fn stream_reply(&self, history: Vec<Message>)
        -> BoxFuture<'_, Result<TextStream, InferenceError>>;
}

// ─── CompletionClient ────────────────────────────────────────────────────────

/// Client for the streaming Messages endpoint.
///
/// Holds the API key obtained at construction. The key is sent in the
/// `x-api-key` header and nowhere else; `Debug` output redacts it.
pub struct CompletionClient {
    http: HttpClient,
    config: RemyConfig,
    api_key: String,
}

impl std::fmt::Debug for CompletionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionClient")
            .field("endpoint", &self.config.endpoint)
            .field("model", &self.config.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl CompletionClient {
    /// Create a client, fetching the API key from `secrets` once.
    ///
    /// Does NOT check connectivity or the endpoint URL. Both are checked on
    /// each request.
    pub fn new(config: RemyConfig, secrets: &dyn SecretSource) -> Result<Self, InferenceError> {
        let api_key = secrets.api_key()?;

        let http = HttpClient::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: config.endpoint.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            config,
            api_key,
        })
    }

    pub fn config(&self) -> &RemyConfig {
        &self.config
    }

    /// Build the request body for `history`, preserving its order.
    pub fn build_request(&self, history: &[Message]) -> MessagesRequest {
        MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            stream: true,
            messages: history
                .iter()
                .map(|m| ApiMessage {
                    role: m.role(),
                    content: m.content().to_string(),
                })
                .collect(),
        }
    }

    /// Send a streaming completion request.
    ///
    /// On a 2xx response, returns a [`TextStream`] fed by a background decode
    /// task. On any other status the body is drained first and returned in
    /// the error along with the status code.
    pub async fn send(&self, history: &[Message]) -> Result<TextStream, InferenceError> {
        let url = reqwest::Url::parse(&self.config.endpoint).map_err(|e| {
            InferenceError::InvalidEndpoint {
                endpoint: self.config.endpoint.clone(),
                reason: e.to_string(),
            }
        })?;

        let body = self.build_request(history);

        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            max_tokens = body.max_tokens,
            "=== LLM REQUEST ==="
        );

        let response = self
            .http
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.config.api_version)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = drain_error_body(response).await;
            tracing::warn!(status = status.as_u16(), "completion request rejected");
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        tracing::debug!(status = status.as_u16(), "streaming reply");
        Ok(spawn_decoder(response.bytes_stream()))
    }

    fn map_send_error(&self, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                duration_secs: self.config.request_timeout_secs,
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: self.config.endpoint.clone(),
                reason: e.to_string(),
            }
        }
    }
}

/// Read a rejected response's body to the end.
///
/// A read failure keeps whatever arrived before it and names the failure, so
/// the recorded error never loses the server's diagnostic text.
async fn drain_error_body(response: reqwest::Response) -> String {
    let mut body = Vec::new();
    let mut chunks = response.bytes_stream();

    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(bytes) => body.extend_from_slice(&bytes),
            Err(e) => {
                tracing::warn!(error = %e, received = body.len(), "error body read failed");
                let mut text = String::from_utf8_lossy(&body).into_owned();
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(&format!("<error body truncated: {e}>"));
                return text;
            }
        }
    }

    String::from_utf8_lossy(&body).into_owned()
}

impl CompletionSource for CompletionClient {
    fn stream_reply(
        &self,
        history: Vec<Message>,
    ) -> BoxFuture<'_, Result<TextStream, InferenceError>> {
        Box::pin(async move { self.send(&history).await })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_core::types::Message;
    use crate::inference::secrets::StaticSecret;
    use crate::inference::types::Role;

    fn test_client(endpoint: &str) -> CompletionClient {
        let config = RemyConfig {
            endpoint: endpoint.to_string(),
            model: "claude-test".to_string(),
            max_tokens: 256,
            ..RemyConfig::default()
        };
        CompletionClient::new(config, &StaticSecret::new("sk-test-key")).unwrap()
    }

    #[test]
    fn test_build_request_preserves_order() {
        let client = test_client("http://localhost:1/v1/messages");
        let history = vec![
            Message::user("first"),
            Message::assistant("second"),
            Message::user("third"),
        ];
        let req = client.build_request(&history);

        assert_eq!(req.model, "claude-test");
        assert_eq!(req.max_tokens, 256);
        assert!(req.stream);
        let roles: Vec<Role> = req.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        let contents: Vec<&str> = req.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_new_requires_credential() {
        let result = CompletionClient::new(RemyConfig::default(), &StaticSecret::new(""));
        assert!(matches!(result, Err(InferenceError::MissingCredential { .. })));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let client = test_client("http://localhost:1/v1/messages");
        let debug = format!("{client:?}");
        assert!(!debug.contains("sk-test-key"));
        assert!(debug.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_malformed_endpoint_is_config_error() {
        let client = test_client("not a url");
        let err = client.send(&[Message::user("Hi")]).await.unwrap_err();
        assert!(matches!(err, InferenceError::InvalidEndpoint { .. }));
    }

    /// Accept one connection, read the full request, write `response` raw and
    /// close. Returns the endpoint URL to point the client at.
    async fn serve_once(response: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_ascii_lowercase();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
        });

        format!("http://{addr}/v1/messages")
    }

    #[tokio::test]
    async fn test_rejected_status_keeps_body() {
        let endpoint = serve_once(
            "HTTP/1.1 429 Too Many Requests\r\nContent-Length: 12\r\nConnection: close\r\n\r\nrate limited",
        )
        .await;
        let err = test_client(&endpoint)
            .send(&[Message::user("Hi")])
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(429));
        assert_eq!(err.to_string(), "HTTP 429: rate limited");
    }

    #[tokio::test]
    async fn test_truncated_error_body_keeps_partial_text() {
        // Declares more body than it sends, then hangs up.
        let endpoint = serve_once(
            "HTTP/1.1 429 Too Many Requests\r\nContent-Length: 100\r\nConnection: close\r\n\r\nrate limited",
        )
        .await;
        let err = test_client(&endpoint)
            .send(&[Message::user("Hi")])
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(429));
        let message = err.to_string();
        assert!(message.contains("429"), "unexpected error: {message}");
        assert!(message.contains("rate limited"), "body lost: {message}");
        assert!(message.contains("error body truncated"), "failure hidden: {message}");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_error() {
        // Port 9 (discard) on loopback is closed on any sane test machine.
        let client = test_client("http://127.0.0.1:9/v1/messages");
        let err = client.send(&[Message::user("Hi")]).await.unwrap_err();
        assert!(err.is_transport(), "expected transport error, got {err:?}");
    }
}
