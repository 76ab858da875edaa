//! HTTP transport strategy.
//!
//! Each REST backend implements [`HttpBackend`]: it builds the wire request,
//! parses a non-streaming response, names its endpoint, attaches
//! authentication, and supplies the [`StreamReducer`] for its SSE format.
//! [`HttpProvider`] is the shared driver that sends requests and dispatches
//! to those hooks.

pub mod anthropic;
pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderSettings;
use crate::error::{LlmError, Result};
use crate::provider::{Provider, ProviderIdentity, ProviderKind, StreamCallback, StreamSink};
use crate::streaming::{Flow, SseDecoder, StreamReducer};
use crate::types::{ChatRequest, Response};

pub use anthropic::AnthropicBackend;
pub use openai::OpenAiBackend;

// ---------------------------------------------------------------------------
// Backend hooks
// ---------------------------------------------------------------------------

/// Per-backend plug points called by [`HttpProvider`].
pub trait HttpBackend: Send + Sync + 'static {
    /// The reducer that folds this backend's SSE stream.
    type Reducer: StreamReducer;

    fn kind(&self) -> ProviderKind;

    fn display_name(&self) -> &'static str;

    /// Static model catalog.
    fn models(&self) -> Vec<String>;

    /// Whether a request without an API key should be refused up front.
    fn requires_api_key(&self) -> bool {
        true
    }

    /// The full endpoint URL for chat requests.
    fn endpoint_url(&self, base_url: &str) -> String;

    /// Build the JSON request body.
    fn build_request(
        &self,
        request: &ChatRequest,
        model: &str,
        max_tokens: u32,
        stream: bool,
    ) -> Value;

    /// Parse a non-streaming success body.
    fn parse_response(&self, body: &Value) -> Result<Response>;

    /// Attach authentication headers.
    fn add_auth(&self, headers: &mut HeaderMap, api_key: &str) -> Result<()>;

    /// Extract a structured error from a non-2xx body, if the backend
    /// reports one.
    fn parse_error(&self, _status: StatusCode, _body: &str) -> Option<LlmError> {
        None
    }

    /// A fresh reducer for one streaming response.
    fn stream_reducer(&self) -> Self::Reducer;
}

/// What an error body says went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorHint {
    Auth,
    RateLimit,
    Server,
    /// The body did not say; the status code decides.
    Unknown,
}

/// Build an error from an HTTP status and an optional body classification.
///
/// 401/403 are invalid credentials, 429 is rate limiting, anything else is
/// a network/server error.
pub(crate) fn status_error(
    provider: &str,
    status: Option<u16>,
    hint: ErrorHint,
    message: String,
) -> LlmError {
    let hint = match (hint, status) {
        (ErrorHint::Unknown, Some(401 | 403)) => ErrorHint::Auth,
        (ErrorHint::Unknown, Some(429)) => ErrorHint::RateLimit,
        (hint, _) => hint,
    };
    match hint {
        ErrorHint::Auth => LlmError::InvalidCredentials {
            provider: provider.to_owned(),
            message,
        },
        ErrorHint::RateLimit => LlmError::RateLimited {
            provider: provider.to_owned(),
            message,
        },
        ErrorHint::Server | ErrorHint::Unknown => LlmError::Network {
            status,
            reason: match status {
                Some(code) => format!("API returned {code}: {message}"),
                None => message,
            },
        },
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Drives any [`HttpBackend`] through the [`Provider`] contract.
///
/// The inner `reqwest::Client` is a cheap handle onto a shared connection
/// pool; clone it into several providers with [`HttpProvider::with_client`].
#[derive(Debug, Clone)]
pub struct HttpProvider<B> {
    backend: B,
    settings: ProviderSettings,
    http: reqwest::Client,
}

impl<B: HttpBackend> HttpProvider<B> {
    /// Create a provider with its own HTTP client.
    pub fn new(backend: B, settings: ProviderSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| LlmError::network(format!("failed to build HTTP client: {e}")))?;
        Self::with_client(backend, settings, http)
    }

    /// Create a provider on an existing (shared) HTTP client.
    pub fn with_client(backend: B, settings: ProviderSettings, http: reqwest::Client) -> Result<Self> {
        if backend.requires_api_key() && settings.api_key.is_empty() {
            return Err(LlmError::InvalidCredentials {
                provider: backend.kind().to_string(),
                message: "missing api key".into(),
            });
        }
        Ok(Self {
            backend,
            settings,
            http,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// Build the JSON body exactly as it would be sent.
    pub fn request_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let model = request.effective_model(&self.settings.default_model);
        let max_tokens = request.effective_max_tokens(self.settings.max_tokens);
        self.backend.build_request(request, model, max_tokens, stream)
    }

    /// Send the request and check the status.  Non-2xx bodies are never
    /// parsed as a success payload.
    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        validate(request)?;

        let body = self.request_body(request, stream);
        let url = self.backend.endpoint_url(&self.settings.base_url);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        self.backend.add_auth(&mut headers, &self.settings.api_key)?;

        tracing::debug!(
            url = %url,
            model = %body["model"],
            provider = %self.backend.kind(),
            stream,
            "sending LLM request"
        );

        let pending = self.http.post(&url).headers(headers).json(&body).send();
        let resp = cancellable(&request.cancel, pending)
            .await?
            .map_err(|e| LlmError::network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = cancellable(&request.cancel, resp.text())
                .await?
                .unwrap_or_default();
            tracing::debug!(status = status.as_u16(), "LLM request failed");
            return Err(self.error_for_status(status, &text));
        }

        Ok(resp)
    }

    fn error_for_status(&self, status: StatusCode, body: &str) -> LlmError {
        if let Some(err) = self.backend.parse_error(status, body) {
            return err;
        }
        status_error(
            self.backend.kind().as_str(),
            Some(status.as_u16()),
            ErrorHint::Unknown,
            body.to_owned(),
        )
    }

    /// Fold an SSE body into a response.
    async fn consume_stream(
        &self,
        resp: reqwest::Response,
        cancel: &CancellationToken,
        sink: &mut StreamSink<'_, '_>,
    ) -> Result<Response> {
        let mut reducer = self.backend.stream_reducer();
        let mut decoder = SseDecoder::new();
        let mut byte_stream = resp.bytes_stream();

        while let Some(chunk_result) = cancellable(cancel, byte_stream.next()).await? {
            let chunk =
                chunk_result.map_err(|e| LlmError::network(format!("stream read error: {e}")))?;

            for frame in decoder.feed(&chunk)? {
                if reducer.apply(&frame, sink)? == Flow::Done {
                    return finish_stream(reducer, sink);
                }
            }
        }

        if let Some(frame) = decoder.finish()? {
            reducer.apply(&frame, sink)?;
        }
        finish_stream(reducer, sink)
    }
}

fn finish_stream<R: StreamReducer>(reducer: R, sink: &mut StreamSink<'_, '_>) -> Result<Response> {
    let response = reducer.finish()?;
    sink.end(&response);
    Ok(response)
}

/// Reject requests that no backend could serve.
fn validate(request: &ChatRequest) -> Result<()> {
    if request.messages.is_empty() {
        return Err(LlmError::InvalidRequest {
            reason: "conversation has no messages".into(),
        });
    }
    Ok(())
}

/// Race a future against cancellation.
pub(crate) async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LlmError::Cancelled),
        out = fut => Ok(out),
    }
}

#[async_trait]
impl<B: HttpBackend> Provider for HttpProvider<B> {
    async fn chat(&self, request: &ChatRequest) -> Result<Response> {
        let resp = self.send(request, false).await?;
        let text = cancellable(&request.cancel, resp.text())
            .await?
            .map_err(|e| LlmError::network(format!("failed to read response body: {e}")))?;

        let v: Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::invalid_response(format!("invalid JSON response: {e}")))?;

        let mut response = self.backend.parse_response(&v)?;
        response.resolve_stop_reason();
        Ok(response)
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        on_event: &mut StreamCallback<'_>,
    ) -> Result<Response> {
        let resp = self.send(request, true).await?;
        let mut sink = StreamSink::new(on_event, &request.cancel);
        self.consume_stream(resp, &request.cancel, &mut sink).await
    }

    fn identity(&self) -> ProviderIdentity {
        ProviderIdentity {
            kind: self.backend.kind(),
            display_name: self.backend.display_name().to_owned(),
            default_model: self.settings.default_model.clone(),
        }
    }

    fn list_models(&self) -> Vec<String> {
        self.backend.models()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn status_codes_map_to_kinds() {
        let kind = |code| status_error("p", Some(code), ErrorHint::Unknown, String::new()).kind();
        assert_eq!(kind(401), ErrorKind::InvalidCredentials);
        assert_eq!(kind(403), ErrorKind::InvalidCredentials);
        assert_eq!(kind(429), ErrorKind::RateLimited);
        assert_eq!(kind(500), ErrorKind::Network);
        assert_eq!(kind(404), ErrorKind::Network);
    }

    #[test]
    fn body_hint_overrides_status() {
        let err = status_error("p", Some(400), ErrorHint::Auth, "bad key".into());
        assert_eq!(err.kind(), ErrorKind::InvalidCredentials);

        let err = status_error("p", Some(529), ErrorHint::Server, "overloaded".into());
        match err {
            LlmError::Network { status, reason } => {
                assert_eq!(status, Some(529));
                assert!(reason.contains("overloaded"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_api_key_returns_error() {
        let settings = ProviderSettings::for_kind(ProviderKind::Anthropic);
        let result = HttpProvider::new(AnthropicBackend, settings);
        assert!(matches!(
            result,
            Err(LlmError::InvalidCredentials { .. })
        ));
    }

    #[test]
    fn ollama_does_not_need_a_key() {
        let settings = ProviderSettings::for_kind(ProviderKind::Ollama);
        assert!(HttpProvider::new(OpenAiBackend::ollama(), settings).is_ok());
    }

    #[tokio::test]
    async fn empty_conversation_is_rejected_before_sending() {
        let settings = ProviderSettings::for_kind(ProviderKind::Ollama);
        let provider = HttpProvider::new(OpenAiBackend::ollama(), settings).unwrap();
        let err = provider.chat(&ChatRequest::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn cancelled_request_never_sends() {
        let mut settings = ProviderSettings::for_kind(ProviderKind::Ollama);
        // Unroutable: would hang or fail if actually contacted.
        settings.base_url = "http://10.255.255.1:9".into();
        let provider = HttpProvider::new(OpenAiBackend::ollama(), settings).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = ChatRequest::new(vec![crate::Message::user("hi")]).with_cancel(cancel);
        let err = provider.chat(&request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
