use std::future::Future;
use std::time::Duration;

use hookrelay_core::{Event, EventHandler, HandlerOutcome};
use hookrelay_downstream::{ForwardClient, ForwardError, ForwardRequest};
use hookrelay_util::AppConfig;
use serde_json::Value;
use tracing::{info, warn};

/// Handler that records each event in the log and always succeeds.
///
/// Used when no downstream URL is configured.
#[derive(Debug, Clone, Default)]
pub struct LogHandler;

impl EventHandler for LogHandler {
    fn handle(&self, event: &Event) -> impl Future<Output = HandlerOutcome> + Send {
        async move {
            let keys = serde_json::from_slice::<Value>(&event.raw_payload)
                .ok()
                .and_then(|value| {
                    value
                        .as_object()
                        .map(|object| object.keys().cloned().collect::<Vec<_>>().join(","))
                });
            info!(
                stage = "dispatch",
                event_id = %event.id,
                attempt = event.attempt_count + 1,
                size_bytes = event.raw_payload.len(),
                content_type = event.content_type.as_deref().unwrap_or("-"),
                top_level_keys = keys.as_deref().unwrap_or("-"),
                "event handled"
            );
            HandlerOutcome::Success
        }
    }
}

/// Handler that relays the raw payload to a downstream HTTP endpoint.
#[derive(Clone)]
pub struct ForwardingHandler {
    client: ForwardClient,
}

impl ForwardingHandler {
    pub fn new(client: ForwardClient) -> Self {
        Self { client }
    }
}

impl EventHandler for ForwardingHandler {
    fn handle(&self, event: &Event) -> impl Future<Output = HandlerOutcome> + Send {
        async move {
            let request = ForwardRequest {
                event_id: &event.id,
                attempt: event.attempt_count + 1,
                content_type: event.content_type.as_deref(),
                body: &event.raw_payload,
            };
            match self.client.forward(&request).await {
                Ok(()) => HandlerOutcome::Success,
                Err(err) => classify(&event.id, err),
            }
        }
    }
}

fn classify(event_id: &str, err: ForwardError) -> HandlerOutcome {
    let retryable = err.is_retryable();
    warn!(stage = "dispatch", %event_id, retryable, error = %err, "downstream delivery failed");
    if retryable {
        HandlerOutcome::RetryableFailure(err.to_string())
    } else {
        HandlerOutcome::PermanentFailure(err.to_string())
    }
}

/// Handler selected from configuration at startup.
#[derive(Clone)]
pub enum Downstream {
    Log(LogHandler),
    Forward(ForwardingHandler),
}

impl Downstream {
    /// `DOWNSTREAM_URL` selects forwarding; otherwise events are only logged.
    ///
    /// The HTTP client timeout matches the handler timeout so a hung socket is
    /// torn down together with the attempt.
    pub fn from_config(config: &AppConfig) -> Result<Self, ForwardError> {
        let Some(url) = config.downstream_url.as_deref() else {
            return Ok(Self::Log(LogHandler));
        };
        let http = reqwest::Client::builder()
            .timeout(config.dispatch.handler_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        let client = ForwardClient::from_url(url, http)?;
        Ok(Self::Forward(ForwardingHandler::new(client)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Log(_) => "log",
            Self::Forward(_) => "forward",
        }
    }
}

impl EventHandler for Downstream {
    fn handle(&self, event: &Event) -> impl Future<Output = HandlerOutcome> + Send {
        async move {
            match self {
                Self::Log(handler) => handler.handle(event).await,
                Self::Forward(handler) => handler.handle(event).await,
            }
        }
    }
}
