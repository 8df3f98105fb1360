//! The `EventSender` contract: the pluggable boundary to the physical
//! transport. This crate ships one concrete implementation over `reqwest`;
//! hosts may supply their own.

use async_trait::async_trait;
use std::time::Duration;

use crate::event::Timestamp;

#[derive(Debug, Clone, Default)]
pub struct SendResult {
    pub success: bool,
    pub must_shut_down: bool,
    pub time_from_server: Option<Timestamp>,
}

pub type SenderError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send_analytics_events(&self, body: Vec<u8>, event_count: usize, uri: &str) -> SendResult;
    async fn send_diagnostic_event(&self, body: Vec<u8>, uri: &str) -> SendResult;
    /// Releases any held transport resources. Called once, from
    /// `Processor::close`.
    async fn close(&self) -> Result<(), SenderError>;
}

/// Default `EventSender`, backed by a shared `reqwest::Client`.
///
/// Status-code policy: {400, 408, 429} and all 5xx and connection errors
/// are retryable (one internal retry); {401, 403, other 4xx} disable the
/// pipeline permanently via `must_shut_down`.
pub struct HttpEventSender {
    client: reqwest::Client,
    sdk_key: String,
}

impl HttpEventSender {
    pub fn new(sdk_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client builds with default TLS config");
        Self { client, sdk_key: sdk_key.into() }
    }

    async fn post(&self, uri: &str, body: Vec<u8>, event_count: Option<usize>) -> SendResult {
        let send_once = |body: Vec<u8>| {
            let client = &self.client;
            let sdk_key = &self.sdk_key;
            async move {
                let mut req = client
                    .post(uri)
                    .header("Content-Type", "application/json")
                    .header("Authorization", sdk_key.as_str());
                if let Some(count) = event_count {
                    req = req
                        .header("X-LaunchDarkly-Event-Schema", "4")
                        .header("X-LaunchDarkly-Payload-Count", count.to_string());
                }
                req.body(body).send().await
            }
        };

        match send_once(body.clone()).await {
            Ok(resp) if !is_retryable_status(resp.status().as_u16()) => Self::interpret(resp).await,
            Ok(_) | Err(_) => match send_once(body).await {
                Ok(resp) => Self::interpret(resp).await,
                Err(_) => SendResult { success: false, must_shut_down: false, time_from_server: None },
            },
        }
    }

    async fn interpret(resp: reqwest::Response) -> SendResult {
        let status = resp.status().as_u16();
        let time_from_server = resp
            .headers()
            .get("Date")
            .and_then(|v| v.to_str().ok())
            .and_then(httpdate_to_millis);

        if status < 300 {
            return SendResult { success: true, must_shut_down: false, time_from_server };
        }

        // After the single retry, a still-retryable response is just a
        // failure; only a non-retryable 4xx permanently disables the
        // pipeline.
        let must_shut_down = !is_retryable_status(status) && (400..500).contains(&status);
        SendResult { success: false, must_shut_down, time_from_server }
    }
}

#[async_trait]
impl EventSender for HttpEventSender {
    async fn send_analytics_events(&self, body: Vec<u8>, event_count: usize, uri: &str) -> SendResult {
        self.post(uri, body, Some(event_count)).await
    }

    async fn send_diagnostic_event(&self, body: Vec<u8>, uri: &str) -> SendResult {
        self.post(uri, body, None).await
    }

    async fn close(&self) -> Result<(), SenderError> {
        Ok(())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 400 | 408 | 429) || (500..600).contains(&status)
}

/// Best-effort RFC 7231 `Date` header parse down to epoch millis. Returns
/// `None` on anything unexpected rather than failing the send.
fn httpdate_to_millis(s: &str) -> Option<Timestamp> {
    let when = httpdate::parse_http_date(s).ok()?;
    let millis = when.duration_since(std::time::UNIX_EPOCH).ok()?.as_millis();
    Timestamp::try_from(millis).ok()
}
