use std::{collections::HashSet, time::Duration};

use axum::response::sse::{Event, KeepAlive};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Ingress,
    Dedupe,
    Queue,
    Dispatch,
    Storage,
    Status,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Ingress => "ingress",
            StageKind::Dedupe => "dedupe",
            StageKind::Queue => "queue",
            StageKind::Dispatch => "dispatch",
            StageKind::Storage => "storage",
            StageKind::Status => "status",
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct StageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StageMetadata {
    fn is_empty(&self) -> bool {
        self.event_id.is_none()
            && self.attempt.is_none()
            && self.size_bytes.is_none()
            && self.latency_ms.is_none()
            && self.worker.is_none()
            && self.message.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StagePayload {
    pub redacted: bool,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
}

impl StagePayload {
    /// Marks a payload that was deliberately left out of the tap.
    pub fn redacted() -> Self {
        Self {
            redacted: true,
            payload: Value::Null,
            truncated: None,
        }
    }

    pub fn visible(payload: Value) -> Self {
        Self {
            redacted: false,
            payload,
            truncated: None,
        }
    }
}

impl Default for StagePayload {
    fn default() -> Self {
        Self::visible(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub stage: StageKind,
    #[serde(default, skip_serializing_if = "StageMetadata::is_empty")]
    pub meta: StageMetadata,
    pub r#in: StagePayload,
    pub out: StagePayload,
}

impl StageEvent {
    pub fn new(ts: chrono::DateTime<chrono::Utc>, stage: StageKind, meta: StageMetadata) -> Self {
        Self {
            ts,
            stage,
            meta,
            r#in: StagePayload::default(),
            out: StagePayload::default(),
        }
    }

    pub fn with_input(mut self, input: StagePayload) -> Self {
        self.r#in = input;
        self
    }

    pub fn with_output(mut self, payload: Value) -> Self {
        self.out = StagePayload::visible(payload);
        self
    }

    pub fn event_name(&self) -> &'static str {
        self.stage.as_str()
    }

    pub fn into_sse_event(self) -> Result<Event, serde_json::Error> {
        let event = Event::default().event(self.event_name());
        let data = serde_json::to_string(&self)?;
        Ok(event.data(data))
    }

    pub fn heartbeat(message: &str) -> Self {
        Self::new(
            chrono::Utc::now(),
            StageKind::Status,
            StageMetadata {
                message: Some(message.to_string()),
                ..StageMetadata::default()
            },
        )
        .with_output(serde_json::json!({ "message": message }))
    }
}

/// Fan-out of stage events to `/_debug/tap` subscribers.
#[derive(Clone)]
pub struct TapHub {
    sender: broadcast::Sender<StageEvent>,
}

impl TapHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(128);
        Self { sender }
    }

    /// Publishing without subscribers is normal and only traced at debug level.
    pub fn publish(&self, event: StageEvent) {
        if let Err(err) = self.sender.send(event) {
            debug!(stage = "status", error = %err, "no tap subscribers for stage event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.sender.subscribe()
    }

    pub fn spawn_heartbeat(&self) {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                hub.publish(StageEvent::heartbeat("tap.dev.heartbeat"));
            }
        });
    }
}

impl Default for TapHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TapFilter {
    stages: Option<HashSet<StageKind>>,
}

impl TapFilter {
    pub fn from_stages(stages: Option<HashSet<StageKind>>) -> Self {
        Self { stages }
    }

    pub fn matches(&self, event: &StageEvent) -> bool {
        match &self.stages {
            Some(stages) => stages.contains(&event.stage),
            None => true,
        }
    }
}

pub fn tap_stream(
    hub: TapHub,
    filter: TapFilter,
) -> impl Stream<Item = Result<Event, serde_json::Error>> + Send + 'static {
    BroadcastStream::new(hub.subscribe()).filter_map(move |result| match result {
        Ok(event) if filter.matches(&event) => Some(event.into_sse_event()),
        Ok(_) => None,
        Err(_) => None,
    })
}

pub fn tap_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(20))
        .text("heartbeat")
}

pub fn parse_stage_list(value: Option<String>) -> Result<Option<HashSet<StageKind>>, String> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let mut set = HashSet::new();
    for item in raw.split(',').filter(|s| !s.is_empty()) {
        let stage = match item.trim().to_lowercase().as_str() {
            "ingress" => StageKind::Ingress,
            "dedupe" => StageKind::Dedupe,
            "queue" => StageKind::Queue,
            "dispatch" => StageKind::Dispatch,
            "storage" => StageKind::Storage,
            "status" => StageKind::Status,
            other => {
                return Err(format!("unknown stage '{other}'"));
            }
        };
        set.insert(stage);
    }

    if set.is_empty() {
        Ok(None)
    } else {
        Ok(Some(set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_stages() {
        let stages = parse_stage_list(Some("ingress, dispatch,".to_string()))
            .expect("parse")
            .expect("set");
        assert!(stages.contains(&StageKind::Ingress));
        assert!(stages.contains(&StageKind::Dispatch));
        assert_eq!(stages.len(), 2);

        assert_eq!(parse_stage_list(None), Ok(None));
        assert_eq!(parse_stage_list(Some(String::new())), Ok(None));
        assert!(parse_stage_list(Some("normalizer".to_string())).is_err());
    }

    #[test]
    fn filter_matches_selected_stages() {
        let filter = TapFilter::from_stages(Some(HashSet::from([StageKind::Storage])));
        let storage = StageEvent::new(chrono::Utc::now(), StageKind::Storage, StageMetadata::default());
        let ingress = StageEvent::new(chrono::Utc::now(), StageKind::Ingress, StageMetadata::default());
        assert!(filter.matches(&storage));
        assert!(!filter.matches(&ingress));
        assert!(TapFilter::default().matches(&ingress));
    }

    #[test]
    fn metadata_is_omitted_when_empty() {
        let event = StageEvent::new(chrono::Utc::now(), StageKind::Queue, StageMetadata::default());
        let json = serde_json::to_value(&event).expect("serialize");
        assert!(json.get("meta").is_none());
        assert_eq!(json["stage"], "queue");
    }
}
