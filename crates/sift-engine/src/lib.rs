use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sift_core::incident_contracts::{
    ContractError, InboundMessage, Incident, MessageRef, ReviewDecision, ReviewItem, RoutedAction,
    DEFAULT_KEYWORD_CAP,
};
use sift_matching::{match_candidates, MatchCandidate, MatchError, MatcherConfig};
use sift_storage::{CorrelationStore, StorageError};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration as StdDuration;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

pub mod reaper;
#[cfg(test)]
pub(crate) mod tests_support;

pub use reaper::{spawn_reaper, ReaperHandle, ReaperReport};

const EXTRACTION_SKIPPED_NOTE: &str = "automated matching skipped: signal extraction failed";
const CRITICAL_ALERT_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extraction provider unavailable: {0}")]
    Unavailable(String),
    #[error("extraction timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("ticket gateway unavailable: {0}")]
    Unavailable(String),
    #[error("ticket gateway timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("matcher error: {0}")]
    Match(#[from] MatchError),
    #[error("invalid engine config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedSignals {
    pub vector: Vec<f32>,
    pub keywords: BTreeSet<String>,
}

#[async_trait]
pub trait SignalExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<ExtractedSignals, ExtractError>;
}

#[async_trait]
pub trait TicketGateway: Send + Sync {
    async fn create_ticket(&self, incident: &Incident) -> Result<String, GatewayError>;
    async fn add_comment(&self, ticket_id: &str, message: &MessageRef)
        -> Result<(), GatewayError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub matcher: MatcherConfig,
    pub auto_link_threshold: f64,
    pub near_tie_delta: f64,
    pub new_incident_threshold: u8,
    pub reap_interval_secs: u64,
    pub keyword_cap: usize,
    pub extract_retries: u32,
    pub gateway_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            matcher: MatcherConfig::default(),
            auto_link_threshold: 0.90,
            near_tie_delta: 0.02,
            new_incident_threshold: 70,
            reap_interval_secs: 60,
            keyword_cap: DEFAULT_KEYWORD_CAP,
            extract_retries: 3,
            gateway_retries: 3,
            retry_base_delay_ms: 200,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.matcher.validate()?;

        if !(0.0..=1.0).contains(&self.auto_link_threshold) || self.auto_link_threshold.is_nan() {
            return Err(EngineError::InvalidConfig(format!(
                "auto_link_threshold must be within [0, 1], got {}",
                self.auto_link_threshold
            )));
        }
        if self.auto_link_threshold < self.matcher.min_confidence {
            return Err(EngineError::InvalidConfig(
                "auto_link_threshold must be >= matcher.min_confidence".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.near_tie_delta) || self.near_tie_delta.is_nan() {
            return Err(EngineError::InvalidConfig(format!(
                "near_tie_delta must be within [0, 1], got {}",
                self.near_tie_delta
            )));
        }
        if self.new_incident_threshold > 100 {
            return Err(EngineError::InvalidConfig(format!(
                "new_incident_threshold must be within [0, 100], got {}",
                self.new_incident_threshold
            )));
        }
        if self.reap_interval_secs == 0 {
            return Err(EngineError::InvalidConfig(
                "reap_interval_secs must be > 0".to_string(),
            ));
        }
        if self.keyword_cap == 0 {
            return Err(EngineError::InvalidConfig(
                "keyword_cap must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    AutoLink {
        incident_id: String,
        confidence: f64,
    },
    CreateIncident,
    EnqueueReview {
        incident_id: Option<String>,
        confidence: f64,
        note: Option<String>,
    },
    Skip,
}

pub fn route(
    message: &MessageRef,
    candidates: &[MatchCandidate],
    config: &EngineConfig,
) -> RouteDecision {
    let Some(best) = candidates.first() else {
        return if message.priority_score >= config.new_incident_threshold {
            RouteDecision::CreateIncident
        } else {
            RouteDecision::Skip
        };
    };

    if best.confidence >= config.auto_link_threshold {
        if let Some(second) = candidates.get(1) {
            if best.confidence - second.confidence <= config.near_tie_delta {
                return RouteDecision::EnqueueReview {
                    incident_id: Some(best.incident_id.clone()),
                    confidence: best.confidence,
                    note: Some(format!(
                        "ambiguous near-tie with {} ({:.2} vs {:.2})",
                        second.incident_id, best.confidence, second.confidence
                    )),
                };
            }
        }
        return RouteDecision::AutoLink {
            incident_id: best.incident_id.clone(),
            confidence: best.confidence,
        };
    }

    RouteDecision::EnqueueReview {
        incident_id: Some(best.incident_id.clone()),
        confidence: best.confidence,
        note: None,
    }
}

#[derive(Default)]
struct LockRegistry {
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockRegistry {
    fn for_incident(&self, incident_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(incident_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

pub struct CorrelationEngine {
    store: StdMutex<CorrelationStore>,
    extractor: Arc<dyn SignalExtractor>,
    gateway: Arc<dyn TicketGateway>,
    config: EngineConfig,
    locks: LockRegistry,
}

impl CorrelationEngine {
    pub fn new(
        store: CorrelationStore,
        extractor: Arc<dyn SignalExtractor>,
        gateway: Arc<dyn TicketGateway>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            store: StdMutex::new(store.with_keyword_cap(config.keyword_cap)),
            extractor,
            gateway,
            config,
            locks: LockRegistry::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn ingest(&self, message: InboundMessage) -> Result<RoutedAction, EngineError> {
        self.ingest_at(message, Utc::now()).await
    }

    pub async fn ingest_at(
        &self,
        message: InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<RoutedAction, EngineError> {
        message.validate()?;

        if let Some(action) = self.with_store(|store| store.recorded_action(&message.id))? {
            debug!(event = "ingest_replay", message_id = %message.id, kind = action.kind());
            return Ok(action);
        }

        let message = match self.extract_with_retry(&message.text).await {
            Ok(signals) => MessageRef::assemble(message, signals.vector, signals.keywords)?,
            Err(err) => {
                warn!(event = "extraction_exhausted", message_id = %message.id, error = %err);
                let message = MessageRef::assemble(message, Vec::new(), BTreeSet::new())?;
                self.with_store_mut(|store| {
                    store.apply_enqueue_review(
                        &message,
                        None,
                        0.0,
                        Some(EXTRACTION_SKIPPED_NOTE),
                        now,
                    )
                })?;
                return Ok(RoutedAction::EnqueueReview {
                    incident_id: None,
                    confidence: 0.0,
                });
            }
        };

        let active = self.with_store(|store| store.snapshot_active())?;
        let candidates = match_candidates(&message, &active, &self.config.matcher, now);
        let decision = route(&message, &candidates, &self.config);
        self.apply_decision(message, decision, now).await
    }

    pub async fn resolve_review(
        &self,
        message_ref_id: &str,
        decision: ReviewDecision,
    ) -> Result<(), EngineError> {
        self.resolve_review_at(message_ref_id, decision, Utc::now())
            .await
    }

    pub async fn resolve_review_at(
        &self,
        message_ref_id: &str,
        decision: ReviewDecision,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        match decision {
            ReviewDecision::Link => {
                let item = self
                    .with_store(|store| store.review_item(message_ref_id))?
                    .ok_or_else(|| StorageError::ReviewNotFound(message_ref_id.to_string()))?;
                let incident_id = item
                    .proposed_incident_id
                    .ok_or_else(|| StorageError::NoProposedIncident(message_ref_id.to_string()))?;

                let lock = self.locks.for_incident(&incident_id);
                let guard = lock.lock().await;
                let (incident_id, confidence) =
                    self.with_store_mut(|store| store.apply_review_link(message_ref_id, now))?;
                drop(guard);
                info!(
                    event = "review_linked",
                    message_id = message_ref_id,
                    incident_id = %incident_id,
                    confidence
                );

                let (ticket_id, message) = self.with_store(|store| {
                    let ticket_id = store
                        .incident(&incident_id)?
                        .and_then(|incident| incident.external_ticket_id);
                    let message = store.message_ref(message_ref_id)?;
                    Ok((ticket_id, message))
                })?;
                if let (Some(ticket_id), Some(message)) = (ticket_id, message) {
                    self.comment_with_retry(&incident_id, &ticket_id, &message)
                        .await?;
                }
                Ok(())
            }
            ReviewDecision::CreateNew => {
                let incident =
                    self.with_store_mut(|store| store.apply_review_create(message_ref_id, now))?;
                info!(
                    event = "review_created_incident",
                    message_id = message_ref_id,
                    incident_id = %incident.id
                );
                self.create_ticket_with_retry(&incident).await?;
                Ok(())
            }
            ReviewDecision::Ignore => {
                self.with_store_mut(|store| store.apply_review_ignore(message_ref_id, now))?;
                info!(event = "review_ignored", message_id = message_ref_id);
                Ok(())
            }
        }
    }

    pub fn list_pending_reviews(&self) -> Result<Vec<ReviewItem>, EngineError> {
        self.with_store(|store| store.list_pending_reviews())
    }

    pub fn list_critical_alerts(&self) -> Result<Vec<MessageRef>, EngineError> {
        self.with_store(|store| store.list_critical_alerts(CRITICAL_ALERT_LIMIT))
    }

    pub fn list_ticket_sync_pending(&self) -> Result<Vec<Incident>, EngineError> {
        self.with_store(|store| store.list_ticket_sync_pending())
    }

    pub fn incident(&self, incident_id: &str) -> Result<Option<Incident>, EngineError> {
        self.with_store(|store| store.incident(incident_id))
    }

    async fn apply_decision(
        &self,
        message: MessageRef,
        decision: RouteDecision,
        now: DateTime<Utc>,
    ) -> Result<RoutedAction, EngineError> {
        match decision {
            RouteDecision::AutoLink {
                incident_id,
                confidence,
            } => {
                let lock = self.locks.for_incident(&incident_id);
                let guard = lock.lock().await;
                let linked = self.with_store_mut(|store| {
                    store.apply_auto_link(&incident_id, &message, confidence, now)
                });
                drop(guard);

                match linked {
                    Ok(appended) => {
                        info!(
                            event = "auto_link",
                            message_id = %message.id,
                            incident_id = %incident_id,
                            confidence
                        );
                        // A losing duplicate delivery must not comment twice.
                        if appended {
                            let ticket_id = self.with_store(|store| {
                                Ok(store
                                    .incident(&incident_id)?
                                    .and_then(|incident| incident.external_ticket_id))
                            })?;
                            if let Some(ticket_id) = ticket_id {
                                self.comment_with_retry(&incident_id, &ticket_id, &message)
                                    .await?;
                            }
                        }
                        Ok(RoutedAction::AutoLink {
                            incident_id,
                            confidence,
                        })
                    }
                    Err(EngineError::Storage(StorageError::InvalidTransition { .. })) => {
                        // The incident closed between snapshot and mutation.
                        warn!(
                            event = "auto_link_raced_close",
                            message_id = %message.id,
                            incident_id = %incident_id
                        );
                        self.with_store_mut(|store| {
                            store.apply_enqueue_review(
                                &message,
                                Some(&incident_id),
                                confidence,
                                Some("matched incident closed during routing"),
                                now,
                            )
                        })?;
                        Ok(RoutedAction::EnqueueReview {
                            incident_id: Some(incident_id),
                            confidence,
                        })
                    }
                    Err(err) => Err(err),
                }
            }
            RouteDecision::CreateIncident => {
                let (incident, created) =
                    self.with_store_mut(|store| store.apply_create(&message, now))?;
                let incident_id = incident.id.clone();
                if created {
                    info!(
                        event = "incident_created",
                        message_id = %message.id,
                        incident_id = %incident_id,
                        title = %incident.title
                    );
                    self.create_ticket_with_retry(&incident).await?;
                } else {
                    // Duplicate delivery; the incident keeps its one ticket.
                    debug!(
                        event = "create_converged",
                        message_id = %message.id,
                        incident_id = %incident_id
                    );
                }
                Ok(RoutedAction::CreateIncident { incident_id })
            }
            RouteDecision::EnqueueReview {
                incident_id,
                confidence,
                note,
            } => {
                self.with_store_mut(|store| {
                    store.apply_enqueue_review(
                        &message,
                        incident_id.as_deref(),
                        confidence,
                        note.as_deref(),
                        now,
                    )
                })?;
                info!(
                    event = "review_enqueued",
                    message_id = %message.id,
                    incident_id = incident_id.as_deref().unwrap_or("none"),
                    confidence
                );
                Ok(RoutedAction::EnqueueReview {
                    incident_id,
                    confidence,
                })
            }
            RouteDecision::Skip => {
                self.with_store_mut(|store| store.apply_skip(&message, now))?;
                debug!(event = "message_skipped", message_id = %message.id);
                Ok(RoutedAction::Skip)
            }
        }
    }

    async fn extract_with_retry(&self, text: &str) -> Result<ExtractedSignals, ExtractError> {
        let mut attempt = 0_u32;
        loop {
            match self.extractor.extract(text).await {
                Ok(signals) => return Ok(signals),
                Err(err) if attempt < self.config.extract_retries => {
                    attempt += 1;
                    debug!(event = "extract_retry", attempt, error = %err);
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn create_ticket_with_retry(&self, incident: &Incident) -> Result<(), EngineError> {
        let mut attempt = 0_u32;
        loop {
            match self.gateway.create_ticket(incident).await {
                Ok(ticket_id) => {
                    info!(
                        event = "ticket_created",
                        incident_id = %incident.id,
                        ticket_id = %ticket_id
                    );
                    self.with_store_mut(|store| {
                        store.set_external_ticket_id(&incident.id, &ticket_id)
                    })?;
                    return Ok(());
                }
                Err(err) if attempt < self.config.gateway_retries => {
                    attempt += 1;
                    warn!(
                        event = "ticket_create_retry",
                        incident_id = %incident.id,
                        attempt,
                        error = %err
                    );
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                }
                Err(err) => {
                    warn!(
                        event = "ticket_sync_pending",
                        incident_id = %incident.id,
                        error = %err
                    );
                    self.with_store_mut(|store| store.set_ticket_sync_pending(&incident.id, true))?;
                    return Ok(());
                }
            }
        }
    }

    async fn comment_with_retry(
        &self,
        incident_id: &str,
        ticket_id: &str,
        message: &MessageRef,
    ) -> Result<(), EngineError> {
        let mut attempt = 0_u32;
        loop {
            match self.gateway.add_comment(ticket_id, message).await {
                Ok(()) => {
                    debug!(
                        event = "ticket_comment_added",
                        incident_id = incident_id,
                        ticket_id = ticket_id,
                        message_id = %message.id
                    );
                    return Ok(());
                }
                Err(err) if attempt < self.config.gateway_retries => {
                    attempt += 1;
                    warn!(
                        event = "ticket_comment_retry",
                        incident_id = incident_id,
                        attempt,
                        error = %err
                    );
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                }
                Err(err) => {
                    warn!(
                        event = "ticket_sync_pending",
                        incident_id = incident_id,
                        error = %err
                    );
                    self.with_store_mut(|store| store.set_ticket_sync_pending(incident_id, true))?;
                    return Ok(());
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> StdDuration {
        let multiplier = 1_u64 << attempt.min(6);
        StdDuration::from_millis(self.config.retry_base_delay_ms.saturating_mul(multiplier))
    }

    fn with_store<T>(
        &self,
        op: impl FnOnce(&CorrelationStore) -> Result<T, StorageError>,
    ) -> Result<T, EngineError> {
        let store = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        op(&store).map_err(EngineError::from)
    }

    fn with_store_mut<T>(
        &self,
        op: impl FnOnce(&mut CorrelationStore) -> Result<T, StorageError>,
    ) -> Result<T, EngineError> {
        let mut store = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        op(&mut store).map_err(EngineError::from)
    }
}
