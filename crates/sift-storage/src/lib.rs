use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use sift_core::incident_contracts::{
    derive_title, incident_id_for, Incident, IncidentMember, IncidentStatus, MemberStatus,
    MessageRef, PriorityBand, ReviewDecision, ReviewItem, ReviewStatus, RoutedAction,
    DEFAULT_KEYWORD_CAP,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub const CORRELATION_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("incident not found: {0}")]
    IncidentNotFound(String),
    #[error("message ref not found: {0}")]
    MessageNotFound(String),
    #[error("review item not found for {0}")]
    ReviewNotFound(String),
    #[error("review item for {0} already resolved")]
    AlreadyResolved(String),
    #[error("review item for {0} has no proposed incident to link")]
    NoProposedIncident(String),
    #[error("invalid transition for incident {incident_id}: {reason}")]
    InvalidTransition {
        incident_id: String,
        reason: String,
    },
}

struct IncidentState {
    status: IncidentStatus,
    last_activity_at: DateTime<Utc>,
    centroid: Vec<f32>,
    centroid_count: i64,
    keywords: BTreeSet<String>,
    channels: BTreeSet<String>,
}

pub struct CorrelationStore {
    conn: Connection,
    keyword_cap: usize,
}

impl CorrelationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn,
            keyword_cap: DEFAULT_KEYWORD_CAP,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn,
            keyword_cap: DEFAULT_KEYWORD_CAP,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn with_keyword_cap(mut self, keyword_cap: usize) -> Self {
        self.keyword_cap = keyword_cap.max(1);
        self
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > CORRELATION_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CORRELATION_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_correlation_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn apply_create(
        &mut self,
        founding: &MessageRef,
        now: DateTime<Utc>,
    ) -> Result<(Incident, bool), StorageError> {
        let incident_id = incident_id_for(founding);
        let keyword_cap = self.keyword_cap;

        let tx = self.conn.transaction()?;
        insert_message_ref(&tx, founding)?;
        let created = insert_incident(&tx, &incident_id, founding, keyword_cap)?;
        insert_member(&tx, &incident_id, founding, 1.0, MemberStatus::Original)?;
        record_action(
            &tx,
            &founding.id,
            &RoutedAction::CreateIncident {
                incident_id: incident_id.clone(),
            },
            now,
        )?;
        tx.commit()?;

        let incident = self
            .incident(&incident_id)?
            .ok_or_else(|| StorageError::IncidentNotFound(incident_id))?;
        Ok((incident, created))
    }

    pub fn apply_auto_link(
        &mut self,
        incident_id: &str,
        message: &MessageRef,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let keyword_cap = self.keyword_cap;
        let tx = self.conn.transaction()?;
        let appended = append_member(
            &tx,
            incident_id,
            message,
            confidence,
            MemberStatus::AutoLinked,
            keyword_cap,
        )?;
        record_action(
            &tx,
            &message.id,
            &RoutedAction::AutoLink {
                incident_id: incident_id.to_string(),
                confidence,
            },
            now,
        )?;
        tx.commit()?;
        Ok(appended)
    }

    pub fn apply_skip(
        &mut self,
        message: &MessageRef,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        insert_message_ref(&tx, message)?;
        record_action(&tx, &message.id, &RoutedAction::Skip, now)?;
        tx.commit()?;
        Ok(())
    }

    pub fn apply_enqueue_review(
        &mut self,
        message: &MessageRef,
        proposed_incident_id: Option<&str>,
        confidence: f64,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        insert_message_ref(&tx, message)?;
        tx.execute(
            "
            INSERT OR IGNORE INTO review_items (
                message_ref_id,
                proposed_incident_id,
                confidence,
                status,
                resolution,
                note,
                enqueued_at,
                resolved_at
            ) VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, NULL)
            ",
            params![
                message.id,
                proposed_incident_id,
                confidence,
                ReviewStatus::Pending.as_str(),
                note,
                now.to_rfc3339(),
            ],
        )?;
        record_action(
            &tx,
            &message.id,
            &RoutedAction::EnqueueReview {
                incident_id: proposed_incident_id.map(str::to_string),
                confidence,
            },
            now,
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn apply_review_link(
        &mut self,
        message_ref_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(String, f64), StorageError> {
        let keyword_cap = self.keyword_cap;
        let tx = self.conn.transaction()?;

        let item = pending_review(&tx, message_ref_id)?;
        let incident_id = item
            .proposed_incident_id
            .ok_or_else(|| StorageError::NoProposedIncident(message_ref_id.to_string()))?;
        let message = load_message_ref(&tx, message_ref_id)?
            .ok_or_else(|| StorageError::MessageNotFound(message_ref_id.to_string()))?;

        append_member(
            &tx,
            &incident_id,
            &message,
            item.confidence,
            MemberStatus::Confirmed,
            keyword_cap,
        )?;
        resolve_review_row(&tx, message_ref_id, ReviewDecision::Link, now)?;
        tx.commit()?;
        Ok((incident_id, item.confidence))
    }

    pub fn apply_review_create(
        &mut self,
        message_ref_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Incident, StorageError> {
        let keyword_cap = self.keyword_cap;
        let tx = self.conn.transaction()?;

        pending_review(&tx, message_ref_id)?;
        let message = load_message_ref(&tx, message_ref_id)?
            .ok_or_else(|| StorageError::MessageNotFound(message_ref_id.to_string()))?;

        let incident_id = incident_id_for(&message);
        insert_incident(&tx, &incident_id, &message, keyword_cap)?;
        insert_member(&tx, &incident_id, &message, 1.0, MemberStatus::Original)?;
        resolve_review_row(&tx, message_ref_id, ReviewDecision::CreateNew, now)?;
        tx.commit()?;

        self.incident(&incident_id)?
            .ok_or_else(|| StorageError::IncidentNotFound(incident_id))
    }

    pub fn apply_review_ignore(
        &mut self,
        message_ref_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;

        let item = pending_review(&tx, message_ref_id)?;
        if let Some(incident_id) = item.proposed_incident_id.as_deref() {
            if load_incident_state(&tx, incident_id)?.is_some() {
                let message = load_message_ref(&tx, message_ref_id)?
                    .ok_or_else(|| StorageError::MessageNotFound(message_ref_id.to_string()))?;
                insert_member(
                    &tx,
                    incident_id,
                    &message,
                    item.confidence,
                    MemberStatus::Rejected,
                )?;
            }
        }
        resolve_review_row(&tx, message_ref_id, ReviewDecision::Ignore, now)?;
        tx.commit()?;
        Ok(())
    }

    pub fn close_incident(&mut self, incident_id: &str) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;

        let state = load_incident_state(&tx, incident_id)?
            .ok_or_else(|| StorageError::IncidentNotFound(incident_id.to_string()))?;
        if state.status == IncidentStatus::Closed {
            return Err(StorageError::InvalidTransition {
                incident_id: incident_id.to_string(),
                reason: "incident is already closed".to_string(),
            });
        }

        let pending = pending_review_count_tx(&tx, incident_id)?;
        if pending > 0 {
            return Err(StorageError::InvalidTransition {
                incident_id: incident_id.to_string(),
                reason: format!("{pending} pending review item(s) reference it"),
            });
        }

        tx.execute(
            "UPDATE incidents SET status = ?1 WHERE incident_id = ?2",
            params![IncidentStatus::Closed.as_str(), incident_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn snapshot_active(&self) -> Result<Vec<Incident>, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let incidents = load_incidents_where(&tx, "status = 'active'", &[])?;
        tx.commit()?;
        Ok(incidents)
    }

    pub fn incident(&self, incident_id: &str) -> Result<Option<Incident>, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut incidents = load_incidents_where(&tx, "incident_id = ?1", &[&incident_id])?;
        tx.commit()?;
        Ok(incidents.pop())
    }

    pub fn message_ref(&self, message_ref_id: &str) -> Result<Option<MessageRef>, StorageError> {
        load_message_ref(&self.conn, message_ref_id)
    }

    pub fn recorded_action(
        &self,
        message_ref_id: &str,
    ) -> Result<Option<RoutedAction>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT kind, incident_id, confidence
                FROM routed_actions
                WHERE message_ref_id = ?1
                ",
                [message_ref_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((kind, incident_id, confidence)) = row else {
            return Ok(None);
        };

        let action = match kind.as_str() {
            "auto_link" => RoutedAction::AutoLink {
                incident_id: incident_id.ok_or_else(|| {
                    StorageError::Serialization("auto_link action missing incident id".to_string())
                })?,
                confidence: confidence.ok_or_else(|| {
                    StorageError::Serialization("auto_link action missing confidence".to_string())
                })?,
            },
            "create_incident" => RoutedAction::CreateIncident {
                incident_id: incident_id.ok_or_else(|| {
                    StorageError::Serialization(
                        "create_incident action missing incident id".to_string(),
                    )
                })?,
            },
            "enqueue_review" => RoutedAction::EnqueueReview {
                incident_id,
                confidence: confidence.unwrap_or(0.0),
            },
            "skip" => RoutedAction::Skip,
            other => {
                return Err(StorageError::Serialization(format!(
                    "unknown routed action kind: {other}"
                )))
            }
        };
        Ok(Some(action))
    }

    pub fn review_item(&self, message_ref_id: &str) -> Result<Option<ReviewItem>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT message_ref_id, proposed_incident_id, confidence, status, resolution, note,
                   enqueued_at, resolved_at
            FROM review_items
            WHERE message_ref_id = ?1
            ",
        )?;
        let item = statement
            .query_row([message_ref_id], review_item_from_row)
            .optional()?;
        Ok(item)
    }

    pub fn list_pending_reviews(&self) -> Result<Vec<ReviewItem>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT message_ref_id, proposed_incident_id, confidence, status, resolution, note,
                   enqueued_at, resolved_at
            FROM review_items
            WHERE status = 'pending'
            ORDER BY confidence DESC, enqueued_at ASC, message_ref_id ASC
            ",
        )?;

        let rows = statement.query_map([], review_item_from_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    pub fn pending_review_count(&self, incident_id: &str) -> Result<i64, StorageError> {
        pending_review_count_tx(&self.conn, incident_id)
    }

    pub fn set_external_ticket_id(
        &mut self,
        incident_id: &str,
        ticket_id: &str,
    ) -> Result<(), StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE incidents
            SET external_ticket_id = ?1, ticket_sync_pending = 0
            WHERE incident_id = ?2
            ",
            params![ticket_id, incident_id],
        )?;
        if changes == 0 {
            return Err(StorageError::IncidentNotFound(incident_id.to_string()));
        }
        Ok(())
    }

    pub fn set_ticket_sync_pending(
        &mut self,
        incident_id: &str,
        pending: bool,
    ) -> Result<(), StorageError> {
        let changes = self.conn.execute(
            "UPDATE incidents SET ticket_sync_pending = ?1 WHERE incident_id = ?2",
            params![if pending { 1_i64 } else { 0_i64 }, incident_id],
        )?;
        if changes == 0 {
            return Err(StorageError::IncidentNotFound(incident_id.to_string()));
        }
        Ok(())
    }

    pub fn list_ticket_sync_pending(&self) -> Result<Vec<Incident>, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let incidents = load_incidents_where(&tx, "ticket_sync_pending = 1", &[])?;
        tx.commit()?;
        Ok(incidents)
    }

    pub fn list_critical_alerts(&self, limit: usize) -> Result<Vec<MessageRef>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT message_id, channel, author, text, text_hash, ts, priority_score, category,
                   vector_json, keywords_json
            FROM message_refs
            WHERE category = 'urgent'
            ORDER BY ts DESC, message_id ASC
            LIMIT ?1
            ",
        )?;

        let rows = statement.query_map([limit as i64], message_ref_from_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

fn insert_message_ref(conn: &Connection, message: &MessageRef) -> Result<(), StorageError> {
    let vector_json = serde_json::to_string(&message.vector)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let keywords_json = serde_json::to_string(&message.keywords)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;

    conn.execute(
        "
        INSERT OR IGNORE INTO message_refs (
            message_id,
            channel,
            author,
            text,
            text_hash,
            ts,
            priority_score,
            category,
            vector_json,
            keywords_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ",
        params![
            message.id,
            message.channel,
            message.author,
            message.text,
            message.text_hash,
            message.timestamp.to_rfc3339(),
            i64::from(message.priority_score),
            message.category.as_str(),
            vector_json,
            keywords_json,
        ],
    )?;
    Ok(())
}

fn insert_incident(
    conn: &Connection,
    incident_id: &str,
    founding: &MessageRef,
    keyword_cap: usize,
) -> Result<bool, StorageError> {
    let centroid_json = serde_json::to_string(&founding.vector)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let keywords = cap_keywords(founding.keywords.clone(), keyword_cap);
    let keywords_json = serde_json::to_string(&keywords)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let channels_json = serde_json::to_string(&[founding.channel.clone()])
        .map_err(|err| StorageError::Serialization(err.to_string()))?;

    let changes = conn.execute(
        "
        INSERT OR IGNORE INTO incidents (
            incident_id,
            external_ticket_id,
            ticket_sync_pending,
            title,
            status,
            started_at,
            last_activity_at,
            centroid_json,
            centroid_count,
            keywords_json,
            channels_json
        ) VALUES (?1, NULL, 0, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)
        ",
        params![
            incident_id,
            derive_title(&founding.text),
            IncidentStatus::Active.as_str(),
            founding.timestamp.to_rfc3339(),
            founding.timestamp.to_rfc3339(),
            centroid_json,
            keywords_json,
            channels_json,
        ],
    )?;
    Ok(changes > 0)
}

fn insert_member(
    conn: &Connection,
    incident_id: &str,
    message: &MessageRef,
    confidence: f64,
    status: MemberStatus,
) -> Result<bool, StorageError> {
    let changes = conn.execute(
        "
        INSERT OR IGNORE INTO incident_members (
            incident_id,
            message_ref_id,
            confidence,
            status,
            added_at
        ) VALUES (?1, ?2, ?3, ?4, ?5)
        ",
        params![
            incident_id,
            message.id,
            confidence,
            status.as_str(),
            message.timestamp.to_rfc3339(),
        ],
    )?;
    Ok(changes > 0)
}

fn append_member(
    tx: &Transaction,
    incident_id: &str,
    message: &MessageRef,
    confidence: f64,
    status: MemberStatus,
    keyword_cap: usize,
) -> Result<bool, StorageError> {
    let state = load_incident_state(tx, incident_id)?
        .ok_or_else(|| StorageError::IncidentNotFound(incident_id.to_string()))?;
    if state.status == IncidentStatus::Closed {
        return Err(StorageError::InvalidTransition {
            incident_id: incident_id.to_string(),
            reason: "cannot append a member to a closed incident".to_string(),
        });
    }

    insert_message_ref(tx, message)?;
    let inserted = insert_member(tx, incident_id, message, confidence, status)?;
    if !inserted {
        return Ok(false);
    }
    if !status.counts_toward_centroid() {
        return Ok(true);
    }

    let (centroid, centroid_count) =
        fold_centroid(&state.centroid, state.centroid_count, &message.vector);
    let mut keywords = state.keywords;
    keywords.extend(message.keywords.iter().cloned());
    let keywords = cap_keywords(keywords, keyword_cap);
    let mut channels = state.channels;
    channels.insert(message.channel.clone());
    let last_activity_at = state.last_activity_at.max(message.timestamp);

    let centroid_json = serde_json::to_string(&centroid)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let keywords_json = serde_json::to_string(&keywords)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let channels_json = serde_json::to_string(&channels)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;

    tx.execute(
        "
        UPDATE incidents
        SET centroid_json = ?1,
            centroid_count = ?2,
            keywords_json = ?3,
            channels_json = ?4,
            last_activity_at = ?5
        WHERE incident_id = ?6
        ",
        params![
            centroid_json,
            centroid_count,
            keywords_json,
            channels_json,
            last_activity_at.to_rfc3339(),
            incident_id,
        ],
    )?;
    Ok(true)
}

// Running average over counted members; a mismatched vector length leaves it untouched.
fn fold_centroid(centroid: &[f32], count: i64, vector: &[f32]) -> (Vec<f32>, i64) {
    if count <= 0 || centroid.is_empty() {
        return (vector.to_vec(), 1);
    }
    if vector.len() != centroid.len() {
        return (centroid.to_vec(), count);
    }

    let next_count = count + 1;
    let folded = centroid
        .iter()
        .zip(vector.iter())
        .map(|(old, new)| {
            ((f64::from(*old) * count as f64 + f64::from(*new)) / next_count as f64) as f32
        })
        .collect();
    (folded, next_count)
}

fn cap_keywords(keywords: BTreeSet<String>, keyword_cap: usize) -> BTreeSet<String> {
    if keywords.len() <= keyword_cap {
        return keywords;
    }
    keywords.into_iter().take(keyword_cap).collect()
}

fn record_action(
    conn: &Connection,
    message_ref_id: &str,
    action: &RoutedAction,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    let (incident_id, confidence): (Option<&str>, Option<f64>) = match action {
        RoutedAction::AutoLink {
            incident_id,
            confidence,
        } => (Some(incident_id), Some(*confidence)),
        RoutedAction::CreateIncident { incident_id } => (Some(incident_id), None),
        RoutedAction::EnqueueReview {
            incident_id,
            confidence,
        } => (incident_id.as_deref(), Some(*confidence)),
        RoutedAction::Skip => (None, None),
    };

    conn.execute(
        "
        INSERT OR IGNORE INTO routed_actions (
            message_ref_id,
            kind,
            incident_id,
            confidence,
            routed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5)
        ",
        params![
            message_ref_id,
            action.kind(),
            incident_id,
            confidence,
            now.to_rfc3339(),
        ],
    )?;
    Ok(())
}

struct PendingReview {
    proposed_incident_id: Option<String>,
    confidence: f64,
}

fn pending_review(
    conn: &Connection,
    message_ref_id: &str,
) -> Result<PendingReview, StorageError> {
    let row = conn
        .query_row(
            "
            SELECT proposed_incident_id, confidence, status
            FROM review_items
            WHERE message_ref_id = ?1
            ",
            [message_ref_id],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((proposed_incident_id, confidence, status)) = row else {
        return Err(StorageError::ReviewNotFound(message_ref_id.to_string()));
    };
    if status != ReviewStatus::Pending.as_str() {
        return Err(StorageError::AlreadyResolved(message_ref_id.to_string()));
    }

    Ok(PendingReview {
        proposed_incident_id,
        confidence,
    })
}

fn resolve_review_row(
    conn: &Connection,
    message_ref_id: &str,
    decision: ReviewDecision,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    let changes = conn.execute(
        "
        UPDATE review_items
        SET status = ?1, resolution = ?2, resolved_at = ?3
        WHERE message_ref_id = ?4 AND status = ?5
        ",
        params![
            ReviewStatus::Resolved.as_str(),
            decision.as_str(),
            now.to_rfc3339(),
            message_ref_id,
            ReviewStatus::Pending.as_str(),
        ],
    )?;
    if changes == 0 {
        return Err(StorageError::AlreadyResolved(message_ref_id.to_string()));
    }
    Ok(())
}

fn pending_review_count_tx(conn: &Connection, incident_id: &str) -> Result<i64, StorageError> {
    let count = conn.query_row(
        "
        SELECT COUNT(*)
        FROM review_items
        WHERE proposed_incident_id = ?1 AND status = 'pending'
        ",
        [incident_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn load_incident_state(
    conn: &Connection,
    incident_id: &str,
) -> Result<Option<IncidentState>, StorageError> {
    let row = conn
        .query_row(
            "
            SELECT status, last_activity_at, centroid_json, centroid_count, keywords_json,
                   channels_json
            FROM incidents
            WHERE incident_id = ?1
            ",
            [incident_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((status, last_activity_at, centroid_json, centroid_count, keywords_json, channels_json)) =
        row
    else {
        return Ok(None);
    };

    Ok(Some(IncidentState {
        status: IncidentStatus::from_str(&status)
            .map_err(|err| StorageError::Serialization(err.to_string()))?,
        last_activity_at: parse_timestamp(last_activity_at)?,
        centroid: serde_json::from_str(&centroid_json)
            .map_err(|err| StorageError::Serialization(err.to_string()))?,
        centroid_count,
        keywords: serde_json::from_str(&keywords_json)
            .map_err(|err| StorageError::Serialization(err.to_string()))?,
        channels: serde_json::from_str(&channels_json)
            .map_err(|err| StorageError::Serialization(err.to_string()))?,
    }))
}

fn load_incidents_where(
    conn: &Connection,
    where_clause: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Incident>, StorageError> {
    let sql = format!(
        "
        SELECT incident_id, external_ticket_id, ticket_sync_pending, title, status,
               started_at, last_activity_at, centroid_json, keywords_json, channels_json
        FROM incidents
        WHERE {where_clause}
        ORDER BY started_at ASC, incident_id ASC
        "
    );
    let mut statement = conn.prepare(&sql)?;

    let rows = statement.query_map(params, |row| {
        let status_raw: String = row.get(4)?;
        let status = IncidentStatus::from_str(&status_raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(err))
        })?;
        let started_at = parse_timestamp_row(row.get::<_, String>(5)?, 5)?;
        let last_activity_at = parse_timestamp_row(row.get::<_, String>(6)?, 6)?;
        let centroid_json: String = row.get(7)?;
        let centroid_vector: Vec<f32> = serde_json::from_str(&centroid_json).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(err))
        })?;
        let keywords_json: String = row.get(8)?;
        let keyword_set: BTreeSet<String> = serde_json::from_str(&keywords_json).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(err))
        })?;
        let channels_json: String = row.get(9)?;
        let channels: BTreeSet<String> = serde_json::from_str(&channels_json).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(err))
        })?;

        Ok(Incident {
            id: row.get(0)?,
            external_ticket_id: row.get(1)?,
            ticket_sync_pending: row.get::<_, i64>(2)? != 0,
            title: row.get(3)?,
            status,
            started_at,
            last_activity_at,
            centroid_vector,
            keyword_set,
            channels,
            members: Vec::new(),
        })
    })?;

    let mut incidents = Vec::new();
    for row in rows {
        incidents.push(row?);
    }

    for incident in &mut incidents {
        incident.members = load_members(conn, &incident.id)?;
    }
    Ok(incidents)
}

fn load_members(conn: &Connection, incident_id: &str) -> Result<Vec<IncidentMember>, StorageError> {
    let mut statement = conn.prepare(
        "
        SELECT message_ref_id, confidence, status
        FROM incident_members
        WHERE incident_id = ?1
        ORDER BY rowid ASC
        ",
    )?;

    let rows = statement.query_map([incident_id], |row| {
        let status_raw: String = row.get(2)?;
        let status = MemberStatus::from_str(&status_raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(err))
        })?;
        Ok(IncidentMember {
            message_ref_id: row.get(0)?,
            confidence: row.get(1)?,
            status,
        })
    })?;

    let mut members = Vec::new();
    for row in rows {
        members.push(row?);
    }
    Ok(members)
}

fn load_message_ref(
    conn: &Connection,
    message_ref_id: &str,
) -> Result<Option<MessageRef>, StorageError> {
    let mut statement = conn.prepare(
        "
        SELECT message_id, channel, author, text, text_hash, ts, priority_score, category,
               vector_json, keywords_json
        FROM message_refs
        WHERE message_id = ?1
        ",
    )?;
    let message = statement
        .query_row([message_ref_id], message_ref_from_row)
        .optional()?;
    Ok(message)
}

fn message_ref_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRef> {
    let ts = parse_timestamp_row(row.get::<_, String>(5)?, 5)?;
    let category_raw: String = row.get(7)?;
    let category = PriorityBand::from_str(&category_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let vector_json: String = row.get(8)?;
    let vector: Vec<f32> = serde_json::from_str(&vector_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let keywords_json: String = row.get(9)?;
    let keywords: BTreeSet<String> = serde_json::from_str(&keywords_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(err))
    })?;

    Ok(MessageRef {
        id: row.get(0)?,
        channel: row.get(1)?,
        author: row.get(2)?,
        text: row.get(3)?,
        text_hash: row.get(4)?,
        timestamp: ts,
        priority_score: row.get::<_, i64>(6)? as u8,
        category,
        vector,
        keywords,
    })
}

fn review_item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewItem> {
    let status_raw: String = row.get(3)?;
    let status = ReviewStatus::from_str(&status_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let resolution = row
        .get::<_, Option<String>>(4)?
        .map(|value| {
            ReviewDecision::from_str(&value).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })
        })
        .transpose()?;
    let enqueued_at = parse_timestamp_row(row.get::<_, String>(6)?, 6)?;
    let resolved_at = row
        .get::<_, Option<String>>(7)?
        .map(|value| parse_timestamp_row(value, 7))
        .transpose()?;

    Ok(ReviewItem {
        message_ref_id: row.get(0)?,
        proposed_incident_id: row.get(1)?,
        confidence: row.get(2)?,
        status,
        resolution,
        note: row.get(5)?,
        enqueued_at,
        resolved_at,
    })
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

fn parse_timestamp_row(value: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}
