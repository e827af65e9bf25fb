//! HTTP transport for the broker's partition-list and event-stream resources.
//!
//! Channels talk to the broker through [`HttpTransport`] so the streaming
//! logic is independent of the client library. [`ReqwestTransport`] is the
//! production implementation; it yields the response body chunk by chunk and
//! releases the connection as soon as the body stream is dropped.

use crate::auth::AccessTokenProvider;
use crate::config::StreamParameters;
use crate::error::{ConsumerError, ConsumerResult};
use crate::model::{EventType, EventTypeCursor, NakadiPartition};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const CURSORS_HEADER: &str = "X-Nakadi-Cursors";
const AUTHORIZATION: &str = "Authorization";

/// One GET request against a broker resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
}

impl ResourceRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_query(mut self, pairs: Vec<(String, String)>) -> Self {
        self.query.extend(pairs);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub type BodyStream = BoxStream<'static, ConsumerResult<Bytes>>;

/// Status line plus a lazily read body
pub struct TransportResponse {
    pub status: u16,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the full body into a string.
    pub async fn text(mut self) -> ConsumerResult<String> {
        let mut buffer = Vec::new();
        while let Some(chunk) = self.body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        String::from_utf8(buffer).map_err(|e| ConsumerError::Serialization(e.to_string()))
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: ResourceRequest) -> ConsumerResult<TransportResponse>;
}

/// reqwest-backed transport with a fixed per-read timeout.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    token_provider: Option<Arc<dyn AccessTokenProvider>>,
}

impl ReqwestTransport {
    pub fn new(read_timeout: Duration) -> ConsumerResult<Self> {
        let client = reqwest::Client::builder()
            .read_timeout(read_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            token_provider: None,
        })
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn AccessTokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: ResourceRequest) -> ConsumerResult<TransportResponse> {
        let mut builder = self.client.get(&request.url).query(&request.query);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if request.header(AUTHORIZATION).is_none() {
            if let Some(provider) = &self.token_provider {
                if let Some(token) = provider.token().await? {
                    builder = builder.bearer_auth(token);
                }
            }
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        debug!(url = %request.url, status, "Broker responded");

        let body = stream::unfold(Some(response), |state| async move {
            let mut response = state?;
            match response.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(response))),
                Ok(None) => None,
                Err(e) => Some((Err(ConsumerError::from(e)), None)),
            }
        })
        .boxed();

        Ok(TransportResponse { status, body })
    }
}

fn event_type_url(base_url: &str, event_type: &EventType, resource: &str) -> String {
    format!(
        "{}/event-types/{}/{}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(event_type.name()),
        resource
    )
}

/// `GET {base}/event-types/{name}/partitions`
pub fn partitions_request(base_url: &str, event_type: &EventType) -> ResourceRequest {
    ResourceRequest::get(event_type_url(base_url, event_type, "partitions"))
        .with_header("Accept", "application/json")
}

/// `GET {base}/event-types/{name}/events` positioned at `cursor`
pub fn events_request(
    base_url: &str,
    cursor: &EventTypeCursor,
    params: &StreamParameters,
) -> ConsumerResult<ResourceRequest> {
    let cursors = serde_json::to_string(&[cursor.to_wire()])?;

    Ok(
        ResourceRequest::get(event_type_url(base_url, cursor.event_type(), "events"))
            .with_header("Accept", "application/x-json-stream")
            .with_header(CURSORS_HEADER, cursors)
            .with_query(params.query_pairs()),
    )
}

/// One-shot partition listing, outside of any channel.
pub async fn fetch_partitions(
    transport: &dyn HttpTransport,
    base_url: &str,
    event_type: &EventType,
) -> ConsumerResult<Vec<NakadiPartition>> {
    let response = transport
        .execute(partitions_request(base_url, event_type))
        .await?;

    let status = response.status;
    let body = response.text().await?;
    if !(200..300).contains(&status) {
        return Err(ConsumerError::Transport(format!(
            "partition list for {event_type} returned {status}: {body}"
        )));
    }

    Ok(serde_json::from_str(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::model::{EventTypePartition, Offset};
    use crate::testing::ScriptedTransport;

    fn cursor(offset: &str) -> EventTypeCursor {
        EventTypeCursor::new(
            EventTypePartition::new(EventType::new("order.created"), "2"),
            Offset::parse(offset),
        )
    }

    #[test]
    fn test_events_request_shape() {
        let params = StreamParameters {
            stream_timeout: Some(30),
            ..Default::default()
        };
        let request = events_request("http://nakadi/", &cursor("41"), &params).unwrap();

        assert_eq!(request.url, "http://nakadi/event-types/order.created/events");
        assert_eq!(
            request.header("x-nakadi-cursors"),
            Some(r#"[{"partition":"2","offset":"41"}]"#)
        );
        assert_eq!(
            request.query,
            vec![("stream_timeout".to_string(), "30".to_string())]
        );
    }

    #[test]
    fn test_partitions_request_encodes_name() {
        let request = partitions_request("http://nakadi", &EventType::new("a b"));
        assert_eq!(request.url, "http://nakadi/event-types/a%20b/partitions");
    }

    #[tokio::test]
    async fn test_fetch_partitions() {
        let transport = ScriptedTransport::new();
        transport.push_body(
            200,
            r#"[{"partition":"0","oldest_available_offset":"0","newest_available_offset":"5"}]"#,
        );

        let partitions = fetch_partitions(&transport, "http://nakadi", &EventType::new("x"))
            .await
            .unwrap();

        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].newest(), Offset::parse("5"));
    }

    /// Local server answering with the Authorization header it received.
    async fn authorization_echo() -> String {
        use axum::http::HeaderMap;
        use axum::{Router, routing::get};

        async fn echo(headers: HeaderMap) -> String {
            headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .unwrap_or("none")
                .to_string()
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/echo", get(echo)))
                .await
                .unwrap();
        });
        format!("http://{address}/echo")
    }

    #[tokio::test]
    async fn test_token_provider_fills_missing_authorization() {
        let url = authorization_echo().await;
        let transport = ReqwestTransport::new(Duration::from_secs(5))
            .unwrap()
            .with_token_provider(Arc::new(StaticTokenProvider::new("provided")));

        let response = transport.execute(ResourceRequest::get(&url)).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.text().await.unwrap(), "Bearer provided");
    }

    #[tokio::test]
    async fn test_preset_authorization_is_preserved() {
        let url = authorization_echo().await;
        let transport = ReqwestTransport::new(Duration::from_secs(5))
            .unwrap()
            .with_token_provider(Arc::new(StaticTokenProvider::new("provided")));

        let request = ResourceRequest::get(&url).with_header("authorization", "Bearer caller");
        let response = transport.execute(request).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "Bearer caller");
    }

    #[tokio::test]
    async fn test_fetch_partitions_error_status() {
        let transport = ScriptedTransport::new();
        transport.push_body(404, r#"{"detail":"not found"}"#);

        let err = fetch_partitions(&transport, "http://nakadi", &EventType::new("x"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("404"));
    }
}
