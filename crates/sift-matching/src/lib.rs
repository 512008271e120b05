use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sift_core::incident_contracts::{Incident, MessageRef};
use std::collections::BTreeSet;
use thiserror::Error;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("invalid matcher weights: {reason}")]
    InvalidWeights { reason: String },
    #[error("invalid threshold {field}: {value}")]
    InvalidThreshold { field: &'static str, value: f64 },
    #[error("inactivity timeout must be > 0")]
    InvalidTimeout,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MatcherWeights {
    pub semantic: f64,
    pub keyword: f64,
    pub time: f64,
}

impl Default for MatcherWeights {
    fn default() -> Self {
        Self {
            semantic: 0.5,
            keyword: 0.3,
            time: 0.2,
        }
    }
}

impl MatcherWeights {
    pub fn validate(&self) -> Result<(), MatchError> {
        for (label, value) in [
            ("semantic", self.semantic),
            ("keyword", self.keyword),
            ("time", self.time),
        ] {
            if value.is_nan() || value < 0.0 {
                return Err(MatchError::InvalidWeights {
                    reason: format!("{label} weight must be >= 0, got {value}"),
                });
            }
        }

        let sum = self.semantic + self.keyword + self.time;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(MatchError::InvalidWeights {
                reason: format!("weights must sum to 1.0, got {sum}"),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatcherConfig {
    pub weights: MatcherWeights,
    pub min_confidence: f64,
    pub inactivity_timeout_secs: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            weights: MatcherWeights::default(),
            min_confidence: 0.50,
            inactivity_timeout_secs: 7_200,
        }
    }
}

impl MatcherConfig {
    pub fn validate(&self) -> Result<(), MatchError> {
        self.weights.validate()?;
        if !(0.0..=1.0).contains(&self.min_confidence) || self.min_confidence.is_nan() {
            return Err(MatchError::InvalidThreshold {
                field: "min_confidence",
                value: self.min_confidence,
            });
        }
        if self.inactivity_timeout_secs == 0 {
            return Err(MatchError::InvalidTimeout);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub incident_id: String,
    pub confidence: f64,
    pub semantic: f64,
    pub keyword: f64,
    pub time_proximity: f64,
    pub last_activity_at: DateTime<Utc>,
}

pub fn match_candidates(
    message: &MessageRef,
    active: &[Incident],
    config: &MatcherConfig,
    now: DateTime<Utc>,
) -> Vec<MatchCandidate> {
    let mut candidates = Vec::new();

    for incident in active {
        let semantic = cosine_unit(&message.vector, &incident.centroid_vector);
        let keyword = jaccard(&message.keywords, &incident.keyword_set);
        let time_proximity = time_proximity(
            incident.last_activity_at,
            now,
            config.inactivity_timeout_secs,
        );

        let confidence = config.weights.semantic * semantic
            + config.weights.keyword * keyword
            + config.weights.time * time_proximity;

        if !confidence.is_finite() || confidence <= 0.0 || confidence < config.min_confidence {
            continue;
        }

        candidates.push(MatchCandidate {
            incident_id: incident.id.clone(),
            confidence,
            semantic,
            keyword,
            time_proximity,
            last_activity_at: incident.last_activity_at,
        });
    }

    candidates.sort_by(|left, right| {
        confidence_key(right.confidence)
            .cmp(&confidence_key(left.confidence))
            .then(right.last_activity_at.cmp(&left.last_activity_at))
            .then(left.incident_id.cmp(&right.incident_id))
    });
    candidates
}

// Two-decimal bucket; candidates equal at this precision tie-break on recency.
fn confidence_key(confidence: f64) -> i64 {
    (confidence * 100.0).round() as i64
}

fn cosine_unit(left: &[f32], right: &[f32]) -> f64 {
    if left.is_empty() || left.len() != right.len() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut left_norm = 0.0_f64;
    let mut right_norm = 0.0_f64;
    for (a, b) in left.iter().zip(right.iter()) {
        dot += f64::from(*a) * f64::from(*b);
        left_norm += f64::from(*a) * f64::from(*a);
        right_norm += f64::from(*b) * f64::from(*b);
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }

    (dot / (left_norm.sqrt() * right_norm.sqrt())).clamp(0.0, 1.0)
}

fn jaccard(left: &BTreeSet<String>, right: &BTreeSet<String>) -> f64 {
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let intersection = left.intersection(right).count();
    let union = left.union(right).count();
    intersection as f64 / union as f64
}

fn time_proximity(last_activity_at: DateTime<Utc>, now: DateTime<Utc>, timeout_secs: u64) -> f64 {
    if timeout_secs == 0 {
        return 0.0;
    }

    let elapsed = (now - last_activity_at).num_seconds();
    if elapsed <= 0 {
        return 1.0;
    }

    (1.0 - elapsed as f64 / timeout_secs as f64).clamp(0.0, 1.0)
}
