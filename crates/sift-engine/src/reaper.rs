use crate::{CorrelationEngine, EngineError};
use chrono::{DateTime, Duration, Utc};
use sift_storage::StorageError;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaperReport {
    pub swept: usize,
    pub closed: usize,
    pub skipped_pending: usize,
}

impl CorrelationEngine {
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<ReaperReport, EngineError> {
        let timeout = Duration::seconds(self.config.matcher.inactivity_timeout_secs as i64);
        let active = self.with_store(|store| store.snapshot_active())?;

        let mut report = ReaperReport::default();
        for incident in active {
            report.swept += 1;
            if now - incident.last_activity_at <= timeout {
                continue;
            }

            let lock = self.locks.for_incident(&incident.id);
            let _guard = lock.lock().await;
            match self.with_store_mut(|store| store.close_incident(&incident.id)) {
                Ok(()) => {
                    report.closed += 1;
                    info!(
                        event = "incident_reaped",
                        incident_id = %incident.id,
                        last_activity_at = %incident.last_activity_at
                    );
                }
                Err(EngineError::Storage(StorageError::InvalidTransition { reason, .. })) => {
                    // Pending reviews (or a concurrent close) keep it open.
                    report.skipped_pending += 1;
                    debug!(event = "reap_skipped", incident_id = %incident.id, reason = %reason);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(report)
    }
}

pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

pub fn spawn_reaper(engine: Arc<CorrelationEngine>) -> ReaperHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let interval = StdDuration::from_secs(engine.config.reap_interval_secs.max(1));

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match engine.sweep_once(Utc::now()).await {
                        Ok(report) if report.closed > 0 => {
                            info!(
                                event = "reaper_sweep",
                                swept = report.swept,
                                closed = report.closed,
                                skipped_pending = report.skipped_pending
                            );
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(event = "reaper_sweep_failed", error = %err);
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    ReaperHandle { shutdown_tx, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{engine_on_store, outage_inbound, stub_outage_extractor};
    use crate::RoutedAction;
    use chrono::TimeZone;
    use sift_core::incident_contracts::{IncidentStatus, ReviewDecision};
    use sift_storage::CorrelationStore;

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::minutes(min)
    }

    #[tokio::test]
    async fn sweep_closes_stale_incident_and_keeps_fresh_one() {
        let store = CorrelationStore::open_in_memory().expect("open store");
        let (engine, _gateway) = engine_on_store(store, stub_outage_extractor());

        let stale = engine
            .ingest_at(outage_inbound("msg-a", ts(0)), ts(0))
            .await
            .expect("ingest stale");
        let RoutedAction::CreateIncident { incident_id: stale_id } = stale else {
            panic!("expected create");
        };

        let report = engine.sweep_once(ts(121)).await.expect("sweep");
        assert_eq!(report.swept, 1);
        assert_eq!(report.closed, 1);
        assert_eq!(
            engine
                .incident(&stale_id)
                .expect("load")
                .expect("exists")
                .status,
            IncidentStatus::Closed
        );

        // Exactly at the timeout boundary nothing closes.
        let fresh = engine
            .ingest_at(outage_inbound("msg-b", ts(10)), ts(10))
            .await
            .expect("ingest fresh");
        let RoutedAction::CreateIncident { incident_id: fresh_id } = fresh else {
            panic!("expected create");
        };
        let report = engine.sweep_once(ts(130)).await.expect("boundary sweep");
        assert_eq!(report.closed, 0);
        assert_eq!(
            engine
                .incident(&fresh_id)
                .expect("load")
                .expect("exists")
                .status,
            IncidentStatus::Active
        );
    }

    #[tokio::test]
    async fn sweep_leaves_incident_with_pending_review_active() {
        let store = CorrelationStore::open_in_memory().expect("open store");
        let (engine, _gateway) = engine_on_store(store, stub_outage_extractor());

        let action = engine
            .ingest_at(outage_inbound("msg-a", ts(0)), ts(0))
            .await
            .expect("ingest");
        let RoutedAction::CreateIncident { incident_id } = action else {
            panic!("expected create");
        };

        engine
            .ingest_at(crate::tests_support::uncertain_inbound("msg-c", ts(3)), ts(3))
            .await
            .expect("ingest uncertain");

        let report = engine.sweep_once(ts(300)).await.expect("sweep");
        assert_eq!(report.closed, 0);
        assert_eq!(report.skipped_pending, 1);
        assert_eq!(
            engine
                .incident(&incident_id)
                .expect("load")
                .expect("exists")
                .status,
            IncidentStatus::Active
        );

        engine
            .resolve_review_at("msg-c", ReviewDecision::Ignore, ts(301))
            .await
            .expect("resolve");
        let report = engine.sweep_once(ts(302)).await.expect("second sweep");
        assert_eq!(report.closed, 1);
    }

    #[tokio::test]
    async fn background_reaper_runs_and_shuts_down() {
        let store = CorrelationStore::open_in_memory().expect("open store");
        let (engine, _gateway) = engine_on_store(store, stub_outage_extractor());
        let engine = Arc::new(engine);

        // The test timeline is far in the past, so the first wall-clock sweep
        // already sees the incident as stale.
        let action = engine
            .ingest_at(outage_inbound("msg-a", ts(0)), ts(0))
            .await
            .expect("ingest");
        let RoutedAction::CreateIncident { incident_id } = action else {
            panic!("expected create");
        };

        let handle = spawn_reaper(engine.clone());
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        handle.shutdown().await;

        assert_eq!(
            engine
                .incident(&incident_id)
                .expect("load")
                .expect("exists")
                .status,
            IncidentStatus::Closed
        );
    }
}
