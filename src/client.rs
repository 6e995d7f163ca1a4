use crate::error::ClientError;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client as HttpClient;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::future::Future;

const EVENT_STREAM: &str = "text/event-stream";

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub method: Method,
    pub body: serde_json::Value,
    pub bearer: Option<String>,
}

impl OutboundRequest {
    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            url: url.into(),
            method: Method::POST,
            body,
            bearer: None,
        }
    }

    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }
}

pub type BodyStream = BoxStream<'static, Result<Bytes, ClientError>>;

pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|value| value.to_ascii_lowercase().contains(EVENT_STREAM))
    }

    pub async fn read_to_end(self) -> Result<Vec<u8>, ClientError> {
        let mut body = self.body;
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

/// Sends a prepared request and exposes status, content type and body stream.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: OutboundRequest,
    ) -> impl Future<Output = Result<TransportResponse, ClientError>> + Send;
}

#[derive(Clone, Default)]
pub struct HttpTransport {
    http: HttpClient,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }
}

impl Transport for HttpTransport {
    fn send(
        &self,
        request: OutboundRequest,
    ) -> impl Future<Output = Result<TransportResponse, ClientError>> + Send {
        let http = self.http.clone();
        async move {
            let mut builder = http
                .request(request.method, normalize_url(&request.url))
                .header(ACCEPT, "text/event-stream, application/json")
                .json(&request.body);
            if let Some(token) = &request.bearer {
                builder = builder.bearer_auth(token);
            }

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            tracing::debug!(status, content_type = ?content_type, "response received");

            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(ClientError::from))
                .boxed();

            Ok(TransportResponse {
                status,
                content_type,
                body,
            })
        }
    }
}

fn normalize_url(value: &str) -> &str {
    value.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn http_transport_exposes_event_stream_body() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({"message": "hi"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(
                    "event: delta\ndata: {\"delta\":\"A\"}\n\n",
                    "text/event-stream",
                ),
            )
            .mount(&server)
            .await;

        let request = OutboundRequest::post_json(
            format!("{}/api/chat/", server.uri()),
            serde_json::json!({"message": "hi"}),
        )
        .with_bearer(Some("secret".to_string()));

        let response = HttpTransport::new().send(request).await.unwrap();
        assert!(response.is_success());
        assert!(response.is_event_stream());
        let body = response.read_to_end().await.unwrap();
        assert_eq!(body, b"event: delta\ndata: {\"delta\":\"A\"}\n\n");
    }

    #[tokio::test]
    async fn http_transport_reports_json_fallback() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(500).set_body_json(serde_json::json!({"error": "nope"})),
            )
            .mount(&server)
            .await;

        let request = OutboundRequest::post_json(server.uri(), serde_json::json!({}));
        let response = HttpTransport::new().send(request).await.unwrap();
        assert_eq!(response.status, 500);
        assert!(!response.is_success());
        assert!(!response.is_event_stream());
    }

    #[tokio::test]
    async fn body_read_error_propagates() {
        let chunks: Vec<Result<Bytes, ClientError>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(ClientError::Io(std::io::Error::other("reset"))),
        ];
        let response = TransportResponse {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: futures::stream::iter(chunks).boxed(),
        };

        let err = response.read_to_end().await.unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
        assert_eq!(err.to_string(), "io error: reset");
    }

    #[tokio::test]
    async fn unreachable_host_is_an_error() {
        let request = OutboundRequest::post_json("http://127.0.0.1:1/api/chat", serde_json::json!({}));
        assert!(HttpTransport::new().send(request).await.is_err());
    }
}
