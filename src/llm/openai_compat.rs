//! Streaming client for OpenAI-compatible chat completion APIs.
//!
//! Serves both `OpenAI` and `DeepSeek`: the wire protocol is identical, only
//! the base URL, credential and model differ.

use std::future::ready;
use std::time::Duration;

use futures::{Stream, StreamExt, stream};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER};
use tracing::{debug, warn};

use crate::chat::core::{ProviderConfig, ProviderKind};
use crate::llm::endpoint::{
    ApiErrorEnvelope, CompletionEndpoint, CompletionRequest, EndpointFuture, FragmentStream,
    fragment_from_payload,
};
use crate::llm::error::EndpointError;
use crate::llm::sse::{SseDecoder, SseEvent};

/// Max characters of an error body kept in `EndpointError::Status`.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Chat completion client over HTTP + SSE.
#[derive(Clone, Debug)]
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    chat_url: String,
    provider: ProviderKind,
}

impl OpenAiCompatClient {
    /// Build a client from provider settings.
    ///
    /// # Errors
    /// Returns an error if the credential is not a valid header value or the
    /// HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self, EndpointError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key.trim()))
            .map_err(|e| EndpointError::InvalidConfig(format!("api key: {e}")))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            chat_url: format!("{}/chat/completions", config.base_url()),
            provider: config.kind,
        })
    }

    /// Full completion URL.
    #[must_use]
    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }

    /// Provider this client talks to.
    #[must_use]
    pub const fn provider(&self) -> ProviderKind {
        self.provider
    }
}

impl CompletionEndpoint for OpenAiCompatClient {
    fn stream_completion<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> EndpointFuture<'a, Result<FragmentStream, EndpointError>> {
        Box::pin(async move {
            debug!(
                provider = %self.provider,
                model = %request.model,
                messages = request.messages.len(),
                "opening completion stream"
            );

            let response = self.http.post(&self.chat_url).json(request).send().await?;
            let status = response.status();
            if !status.is_success() {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok());
                let body = response.text().await.unwrap_or_default();
                let err = classify_status(status, retry_after, &body);
                warn!(provider = %self.provider, status = status.as_u16(), "completion request rejected: {err}");
                return Err(err);
            }

            let fragments: FragmentStream = Box::pin(fragments(response.bytes_stream()));
            Ok(fragments)
        })
    }
}

/// Map a non-success status to an endpoint error.
#[must_use]
pub fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> EndpointError {
    let message = error_message(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EndpointError::Authentication(message),
        StatusCode::TOO_MANY_REQUESTS => EndpointError::RateLimited { retry_after },
        other => EndpointError::Status {
            status: other.as_u16(),
            body: message,
        },
    }
}

/// Prefer the `error.message` of a JSON body, else the raw body (truncated).
fn error_message(body: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<ApiErrorEnvelope>(body) {
        if !envelope.error.message.is_empty() {
            return envelope.error.message;
        }
    }
    body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect()
}

#[derive(Default)]
struct StreamState {
    decoder: SseDecoder,
    finished: bool,
}

impl StreamState {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Result<String, EndpointError>> {
        let events = self.decoder.push(bytes);
        self.emit(events)
    }

    /// End of body: a last line without a trailing newline still counts.
    fn flush(&mut self) -> Vec<Result<String, EndpointError>> {
        let events: Vec<SseEvent> = self.decoder.finish().into_iter().collect();
        let out = self.emit(events);
        self.finished = true;
        out
    }

    fn emit(&mut self, events: Vec<SseEvent>) -> Vec<Result<String, EndpointError>> {
        let mut out = Vec::new();
        for event in events {
            match event {
                SseEvent::Done => {
                    self.finished = true;
                    break;
                }
                SseEvent::Data(payload) => match fragment_from_payload(&payload) {
                    Ok(Some(fragment)) => out.push(Ok(fragment)),
                    Ok(None) => {}
                    Err(err) => {
                        self.finished = true;
                        out.push(Err(err));
                        break;
                    }
                },
            }
        }
        out
    }
}

/// Turn a raw SSE byte stream into text fragments.
///
/// Ends at `[DONE]`, at end of body, or right after the first error.
pub fn fragments<S, B, E>(body: S) -> impl Stream<Item = Result<String, EndpointError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<EndpointError> + Send,
{
    body.map(Some)
        .chain(stream::once(ready(None)))
        .scan(StreamState::default(), |state, chunk| {
            if state.finished {
                return ready(None);
            }
            let items = match chunk {
                Some(Ok(bytes)) => state.feed(bytes.as_ref()),
                Some(Err(err)) => {
                    state.finished = true;
                    vec![Err(err.into())]
                }
                None => state.flush(),
            };
            ready(Some(items))
        })
        .flat_map(stream::iter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"content\":{}}}}}]}}\n\n",
            serde_json::to_string(text).unwrap()
        )
    }

    async fn collect(
        parts: Vec<Result<Vec<u8>, EndpointError>>,
    ) -> Vec<Result<String, EndpointError>> {
        fragments(stream::iter(parts)).collect().await
    }

    #[tokio::test]
    async fn test_fragments_until_done() {
        let body = format!("{}{}data: [DONE]\n\n{}", chunk("Hel"), chunk("lo"), chunk("ignored"));
        let out = collect(vec![Ok(body.into_bytes())]).await;
        let texts: Vec<String> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(texts, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn test_fragments_split_across_chunks() {
        let body = format!("{}{}", chunk("Hello"), chunk(" world"));
        let bytes = body.into_bytes();
        let parts: Vec<Result<Vec<u8>, EndpointError>> =
            bytes.chunks(7).map(|c| Ok(c.to_vec())).collect();
        let texts: Vec<String> = collect(parts).await.into_iter().map(Result::unwrap).collect();
        assert_eq!(texts.concat(), "Hello world");
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let out = collect(vec![
            Ok(chunk("partial").into_bytes()),
            Err(EndpointError::Api("connection reset".to_string())),
            Ok(chunk("never").into_bytes()),
        ])
        .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), "partial");
        assert!(out[1].is_err());
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_kept() {
        let body = format!(
            "{}data: {{\"choices\":[{{\"delta\":{{\"content\":\"tail\"}}}}]}}",
            chunk("head ")
        );
        let texts: Vec<String> = collect(vec![Ok(body.into_bytes())])
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(texts, vec!["head ".to_string(), "tail".to_string()]);
    }

    #[tokio::test]
    async fn test_unterminated_done_after_fragment() {
        let body = format!("{}data: [DONE]", chunk("only"));
        let texts: Vec<String> = collect(vec![Ok(body.into_bytes())])
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(texts, vec!["only".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_chunk_ends_stream() {
        let body = format!("data: {{oops\n\n{}", chunk("after"));
        let out = collect(vec![Ok(body.into_bytes())]).await;
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(EndpointError::MalformedChunk(_))));
    }

    #[test]
    fn test_status_classification() {
        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#;
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, body),
            EndpointError::Authentication(msg) if msg == "Incorrect API key provided"
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(20), ""),
            EndpointError::RateLimited { retry_after: Some(20) }
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, None, "upstream down"),
            EndpointError::Status { status: 500, body } if body == "upstream down"
        ));
    }

    #[test]
    fn test_chat_url_from_config() {
        let config = ProviderConfig {
            kind: ProviderKind::DeepSeek,
            base_url: Some("http://localhost:9000/v1/".to_string()),
            api_key: "k".to_string(),
            ..ProviderConfig::default()
        };
        let client = OpenAiCompatClient::new(&config).unwrap();
        assert_eq!(client.chat_url(), "http://localhost:9000/v1/chat/completions");
        assert_eq!(client.provider(), ProviderKind::DeepSeek);
    }

    #[test]
    fn test_invalid_api_key_header() {
        let config = ProviderConfig {
            api_key: "bad\nkey".to_string(),
            ..ProviderConfig::default()
        };
        assert!(matches!(
            OpenAiCompatClient::new(&config),
            Err(EndpointError::InvalidConfig(_))
        ));
    }
}
