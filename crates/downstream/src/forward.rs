use reqwest::{header::CONTENT_TYPE, Client, Response, StatusCode};
use thiserror::Error;
use url::Url;

pub const EVENT_ID_HEADER: &str = "X-Hookrelay-Event-Id";
pub const ATTEMPT_HEADER: &str = "X-Hookrelay-Attempt";

const MAX_ERROR_BODY: usize = 512;

/// Client that relays verified webhook payloads to a downstream HTTP endpoint.
#[derive(Clone)]
pub struct ForwardClient {
    http: Client,
    endpoint: Url,
}

impl ForwardClient {
    /// Creates a forwarding client posting to `endpoint`.
    pub fn new(endpoint: Url, http: Client) -> Self {
        Self { http, endpoint }
    }

    /// Parses `endpoint` and builds a client around it.
    pub fn from_url(endpoint: &str, http: Client) -> Result<Self, ForwardError> {
        Ok(Self::new(Url::parse(endpoint)?, http))
    }

    /// POSTs the raw payload unchanged. Any 2xx response counts as delivered.
    pub async fn forward(&self, request: &ForwardRequest<'_>) -> Result<(), ForwardError> {
        let mut builder = self
            .http
            .post(self.endpoint.clone())
            .header(EVENT_ID_HEADER, request.event_id)
            .header(ATTEMPT_HEADER, request.attempt.to_string())
            .body(request.body.to_vec());
        if let Some(content_type) = request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }

        let response = builder.send().await?;
        ensure_success(response).await
    }
}

/// One delivery attempt.
#[derive(Debug, Clone, Copy)]
pub struct ForwardRequest<'a> {
    pub event_id: &'a str,
    /// 1-based attempt number.
    pub attempt: u32,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

/// Errors produced by the forwarding client.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl ForwardError {
    /// Whether a later attempt may succeed.
    ///
    /// Transport failures, timeouts, 408, 425, 429 and 5xx are transient; any
    /// other rejection by the downstream is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Url(_) => false,
            Self::Http(err) => !err.is_builder(),
            Self::Status { status, .. } => {
                status.is_server_error() || matches!(status.as_u16(), 408 | 425 | 429)
            }
        }
    }
}

async fn ensure_success(response: Response) -> Result<(), ForwardError> {
    let status = response.status();
    if !status.is_success() {
        let mut body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        return Err(ForwardError::Status { status, body });
    }
    Ok(())
}
