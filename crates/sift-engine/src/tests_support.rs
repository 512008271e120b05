use crate::{
    CorrelationEngine, EngineConfig, ExtractError, ExtractedSignals, GatewayError,
    SignalExtractor, TicketGateway,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sift_core::incident_contracts::{InboundMessage, Incident, MessageRef};
use sift_storage::CorrelationStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

pub(crate) fn signals(vector: Vec<f32>, words: &[&str]) -> ExtractedSignals {
    ExtractedSignals {
        vector,
        keywords: words.iter().map(|word| word.to_string()).collect(),
    }
}

pub(crate) struct MapExtractor {
    map: HashMap<String, ExtractedSignals>,
}

impl MapExtractor {
    pub(crate) fn new(entries: Vec<(&str, ExtractedSignals)>) -> Self {
        Self {
            map: entries
                .into_iter()
                .map(|(text, signals)| (text.to_string(), signals))
                .collect(),
        }
    }
}

#[async_trait]
impl SignalExtractor for MapExtractor {
    async fn extract(&self, text: &str) -> Result<ExtractedSignals, ExtractError> {
        self.map
            .get(text)
            .cloned()
            .ok_or_else(|| ExtractError::Unavailable(format!("no signals for: {text}")))
    }
}

pub(crate) struct FailingExtractor;

#[async_trait]
impl SignalExtractor for FailingExtractor {
    async fn extract(&self, _text: &str) -> Result<ExtractedSignals, ExtractError> {
        Err(ExtractError::Unavailable(
            "embedding service down".to_string(),
        ))
    }
}

#[derive(Default)]
pub(crate) struct RecordingGateway {
    fail_creates: bool,
    fail_comments: bool,
    tickets: StdMutex<Vec<String>>,
    comments: StdMutex<Vec<(String, String)>>,
}

impl RecordingGateway {
    pub(crate) fn failing_creates() -> Self {
        Self {
            fail_creates: true,
            ..Self::default()
        }
    }

    pub(crate) fn failing_comments() -> Self {
        Self {
            fail_comments: true,
            ..Self::default()
        }
    }

    pub(crate) fn ticket_count(&self) -> usize {
        self.tickets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub(crate) fn comment_log(&self) -> Vec<(String, String)> {
        self.comments
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl TicketGateway for RecordingGateway {
    async fn create_ticket(&self, incident: &Incident) -> Result<String, GatewayError> {
        if self.fail_creates {
            return Err(GatewayError::Unavailable("tracker down".to_string()));
        }
        let mut tickets = self
            .tickets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tickets.push(incident.id.clone());
        Ok(format!("TCK-{}", tickets.len()))
    }

    async fn add_comment(&self, ticket_id: &str, message: &MessageRef) -> Result<(), GatewayError> {
        if self.fail_comments {
            return Err(GatewayError::Unavailable("tracker down".to_string()));
        }
        self.comments
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((ticket_id.to_string(), message.id.clone()));
        Ok(())
    }
}

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        extract_retries: 1,
        gateway_retries: 1,
        retry_base_delay_ms: 1,
        ..EngineConfig::default()
    }
}

pub(crate) fn engine_with_parts(
    store: CorrelationStore,
    extractor: impl SignalExtractor + 'static,
    gateway: RecordingGateway,
) -> (CorrelationEngine, Arc<RecordingGateway>) {
    let gateway = Arc::new(gateway);
    let engine = CorrelationEngine::new(
        store,
        Arc::new(extractor),
        gateway.clone(),
        test_config(),
    )
    .expect("valid engine config");
    (engine, gateway)
}

pub(crate) fn engine_on_store(
    store: CorrelationStore,
    extractor: impl SignalExtractor + 'static,
) -> (CorrelationEngine, Arc<RecordingGateway>) {
    engine_with_parts(store, extractor, RecordingGateway::default())
}

pub(crate) fn stub_outage_extractor() -> MapExtractor {
    MapExtractor::new(vec![
        (
            "500 errors on checkout API",
            signals(vec![1.0, 0.0], &["500", "checkout", "api", "errors"]),
        ),
        (
            "looking into it",
            signals(vec![0.88, 0.475], &["500", "checkout", "api", "errors"]),
        ),
        (
            "hey is checkout down?",
            signals(vec![0.6, 0.8], &["checkout", "down"]),
        ),
    ])
}

pub(crate) fn outage_inbound(id: &str, at: DateTime<Utc>) -> InboundMessage {
    InboundMessage {
        id: id.to_string(),
        channel: "#eng-alerts".to_string(),
        author: "sam".to_string(),
        text: "500 errors on checkout API".to_string(),
        timestamp: at,
        priority_score: 92,
    }
}

pub(crate) fn uncertain_inbound(id: &str, at: DateTime<Utc>) -> InboundMessage {
    InboundMessage {
        id: id.to_string(),
        channel: "#general".to_string(),
        author: "jo".to_string(),
        text: "hey is checkout down?".to_string(),
        timestamp: at,
        priority_score: 45,
    }
}
