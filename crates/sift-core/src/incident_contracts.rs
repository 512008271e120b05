use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_KEYWORD_CAP: usize = 64;
pub const INCIDENT_TITLE_MAX_CHARS: usize = 80;

pub const URGENT_BAND_THRESHOLD: u8 = 90;
pub const HIGH_BAND_THRESHOLD: u8 = 70;
pub const MEDIUM_BAND_THRESHOLD: u8 = 50;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("priority score out of range: {0}")]
    InvalidPriorityScore(u16),
    #[error("confidence out of range for {field}: {value}")]
    InvalidConfidence { field: &'static str, value: f64 },
    #[error("message id cannot be empty")]
    EmptyMessageId,
    #[error("message text cannot be empty")]
    EmptyMessageText,
    #[error("unknown {field}: {value}")]
    UnknownVariant { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PriorityBand {
    Low,
    Medium,
    High,
    Urgent,
}

impl PriorityBand {
    pub fn from_score(score: u8) -> Self {
        if score >= URGENT_BAND_THRESHOLD {
            Self::Urgent
        } else if score >= HIGH_BAND_THRESHOLD {
            Self::High
        } else if score >= MEDIUM_BAND_THRESHOLD {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityBand::Low => "low",
            PriorityBand::Medium => "medium",
            PriorityBand::High => "high",
            PriorityBand::Urgent => "urgent",
        }
    }
}

impl fmt::Display for PriorityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityBand {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "low" => Ok(PriorityBand::Low),
            "medium" => Ok(PriorityBand::Medium),
            "high" => Ok(PriorityBand::High),
            "urgent" => Ok(PriorityBand::Urgent),
            other => Err(ContractError::UnknownVariant {
                field: "priority band",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundMessage {
    pub id: String,
    pub channel: String,
    pub author: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub priority_score: u8,
}

impl InboundMessage {
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.id.trim().is_empty() {
            return Err(ContractError::EmptyMessageId);
        }
        if self.text.trim().is_empty() {
            return Err(ContractError::EmptyMessageText);
        }
        if self.priority_score > 100 {
            return Err(ContractError::InvalidPriorityScore(u16::from(
                self.priority_score,
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRef {
    pub id: String,
    pub channel: String,
    pub author: String,
    pub text: String,
    pub text_hash: String,
    pub timestamp: DateTime<Utc>,
    pub priority_score: u8,
    pub category: PriorityBand,
    pub vector: Vec<f32>,
    pub keywords: BTreeSet<String>,
}

impl MessageRef {
    pub fn assemble(
        inbound: InboundMessage,
        vector: Vec<f32>,
        keywords: BTreeSet<String>,
    ) -> Result<Self, ContractError> {
        inbound.validate()?;
        Ok(Self {
            text_hash: text_hash(&inbound.text),
            category: PriorityBand::from_score(inbound.priority_score),
            id: inbound.id,
            channel: inbound.channel,
            author: inbound.author,
            text: inbound.text,
            timestamp: inbound.timestamp,
            priority_score: inbound.priority_score,
            vector,
            keywords,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Active,
    Closed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Active => "active",
            IncidentStatus::Closed => "closed",
        }
    }
}

impl FromStr for IncidentStatus {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "active" => Ok(IncidentStatus::Active),
            "closed" => Ok(IncidentStatus::Closed),
            other => Err(ContractError::UnknownVariant {
                field: "incident status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Original,
    AutoLinked,
    Confirmed,
    Rejected,
}

impl MemberStatus {
    pub fn counts_toward_centroid(&self) -> bool {
        !matches!(self, MemberStatus::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Original => "original",
            MemberStatus::AutoLinked => "auto_linked",
            MemberStatus::Confirmed => "confirmed",
            MemberStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for MemberStatus {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "original" => Ok(MemberStatus::Original),
            "auto_linked" => Ok(MemberStatus::AutoLinked),
            "confirmed" => Ok(MemberStatus::Confirmed),
            "rejected" => Ok(MemberStatus::Rejected),
            other => Err(ContractError::UnknownVariant {
                field: "member status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncidentMember {
    pub message_ref_id: String,
    pub confidence: f64,
    pub status: MemberStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    pub id: String,
    pub external_ticket_id: Option<String>,
    pub ticket_sync_pending: bool,
    pub title: String,
    pub status: IncidentStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub centroid_vector: Vec<f32>,
    pub keyword_set: BTreeSet<String>,
    pub channels: BTreeSet<String>,
    pub members: Vec<IncidentMember>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Link,
    CreateNew,
    Ignore,
}

impl ReviewDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewDecision::Link => "link",
            ReviewDecision::CreateNew => "create_new",
            ReviewDecision::Ignore => "ignore",
        }
    }
}

impl FromStr for ReviewDecision {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "link" => Ok(ReviewDecision::Link),
            "create_new" => Ok(ReviewDecision::CreateNew),
            "ignore" => Ok(ReviewDecision::Ignore),
            other => Err(ContractError::UnknownVariant {
                field: "review decision",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Resolved,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for ReviewStatus {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "pending" => Ok(ReviewStatus::Pending),
            "resolved" => Ok(ReviewStatus::Resolved),
            other => Err(ContractError::UnknownVariant {
                field: "review status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewItem {
    pub message_ref_id: String,
    pub proposed_incident_id: Option<String>,
    pub confidence: f64,
    pub status: ReviewStatus,
    pub resolution: Option<ReviewDecision>,
    pub note: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReviewItem {
    pub fn alternatives(&self) -> &'static [ReviewDecision] {
        if self.proposed_incident_id.is_some() {
            &[
                ReviewDecision::Link,
                ReviewDecision::CreateNew,
                ReviewDecision::Ignore,
            ]
        } else {
            &[ReviewDecision::CreateNew, ReviewDecision::Ignore]
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutedAction {
    AutoLink {
        incident_id: String,
        confidence: f64,
    },
    CreateIncident {
        incident_id: String,
    },
    EnqueueReview {
        incident_id: Option<String>,
        confidence: f64,
    },
    Skip,
}

impl RoutedAction {
    pub fn kind(&self) -> &'static str {
        match self {
            RoutedAction::AutoLink { .. } => "auto_link",
            RoutedAction::CreateIncident { .. } => "create_incident",
            RoutedAction::EnqueueReview { .. } => "enqueue_review",
            RoutedAction::Skip => "skip",
        }
    }
}

pub fn validate_confidence(field: &'static str, value: f64) -> Result<(), ContractError> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return Err(ContractError::InvalidConfidence { field, value });
    }
    Ok(())
}

pub fn text_hash(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex_prefix(&hasher.finalize(), 32)
}

pub fn incident_id_for(founding: &MessageRef) -> String {
    let mut hasher = Sha256::new();
    hasher.update(founding.id.as_bytes());
    hasher.update(b"|");
    hasher.update(founding.text_hash.as_bytes());
    format!("inc:{}", hex_prefix(&hasher.finalize(), 16))
}

pub fn derive_title(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(normalized, INCIDENT_TITLE_MAX_CHARS)
}

fn hex_prefix(digest: &[u8], bytes: usize) -> String {
    let mut output = String::with_capacity(bytes * 2);
    for byte in digest.iter().take(bytes) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn truncate_chars(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }

    let mut out = text
        .chars()
        .take(max_chars.saturating_sub(3))
        .collect::<String>();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn inbound(id: &str, text: &str, score: u8) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            channel: "#eng-alerts".to_string(),
            author: "sam".to_string(),
            text: text.to_string(),
            timestamp: ts(),
            priority_score: score,
        }
    }

    #[test]
    fn priority_bands_follow_documented_thresholds() {
        assert_eq!(PriorityBand::from_score(92), PriorityBand::Urgent);
        assert_eq!(PriorityBand::from_score(90), PriorityBand::Urgent);
        assert_eq!(PriorityBand::from_score(89), PriorityBand::High);
        assert_eq!(PriorityBand::from_score(70), PriorityBand::High);
        assert_eq!(PriorityBand::from_score(69), PriorityBand::Medium);
        assert_eq!(PriorityBand::from_score(50), PriorityBand::Medium);
        assert_eq!(PriorityBand::from_score(49), PriorityBand::Low);
        assert_eq!(PriorityBand::from_score(0), PriorityBand::Low);
    }

    #[test]
    fn assemble_derives_hash_and_band() {
        let message = MessageRef::assemble(
            inbound("msg-1", "500 errors on   checkout API", 92),
            vec![1.0, 0.0],
            ["checkout".to_string(), "errors".to_string()].into(),
        )
        .expect("assemble");

        assert_eq!(message.category, PriorityBand::Urgent);
        assert_eq!(message.text_hash, text_hash("500 errors on checkout API"));
        assert_eq!(message.text_hash.len(), 64);
    }

    #[test]
    fn assemble_rejects_invalid_inbound() {
        let err = MessageRef::assemble(inbound("", "text", 10), vec![], BTreeSet::new())
            .expect_err("empty id must fail");
        assert!(matches!(err, ContractError::EmptyMessageId));

        let err = MessageRef::assemble(inbound("msg-2", "  ", 10), vec![], BTreeSet::new())
            .expect_err("blank text must fail");
        assert!(matches!(err, ContractError::EmptyMessageText));

        let err = MessageRef::assemble(inbound("msg-3", "text", 101), vec![], BTreeSet::new())
            .expect_err("score over 100 must fail");
        assert!(matches!(err, ContractError::InvalidPriorityScore(101)));
    }

    #[test]
    fn incident_id_is_stable_for_same_founding_message() {
        let message = MessageRef::assemble(
            inbound("msg-1", "checkout is down", 80),
            vec![1.0],
            BTreeSet::new(),
        )
        .expect("assemble");

        let first = incident_id_for(&message);
        let second = incident_id_for(&message);
        assert_eq!(first, second);
        assert!(first.starts_with("inc:"));
        assert_eq!(first.len(), "inc:".len() + 32);
    }

    #[test]
    fn title_is_normalized_and_truncated() {
        assert_eq!(derive_title("checkout   is\ndown"), "checkout is down");

        let long = "x".repeat(200);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), INCIDENT_TITLE_MAX_CHARS);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn review_alternatives_depend_on_proposed_incident() {
        let with_proposal = ReviewItem {
            message_ref_id: "msg-1".to_string(),
            proposed_incident_id: Some("inc:abc".to_string()),
            confidence: 0.7,
            status: ReviewStatus::Pending,
            resolution: None,
            note: None,
            enqueued_at: ts(),
            resolved_at: None,
        };
        assert_eq!(with_proposal.alternatives().len(), 3);

        let without_proposal = ReviewItem {
            proposed_incident_id: None,
            ..with_proposal
        };
        assert_eq!(
            without_proposal.alternatives(),
            &[ReviewDecision::CreateNew, ReviewDecision::Ignore]
        );
    }

    #[test]
    fn rejected_members_do_not_count_toward_centroid() {
        assert!(MemberStatus::Original.counts_toward_centroid());
        assert!(MemberStatus::AutoLinked.counts_toward_centroid());
        assert!(MemberStatus::Confirmed.counts_toward_centroid());
        assert!(!MemberStatus::Rejected.counts_toward_centroid());
    }

    #[test]
    fn routed_action_kind_labels_are_stable() {
        assert_eq!(
            RoutedAction::AutoLink {
                incident_id: "inc:1".to_string(),
                confidence: 0.95,
            }
            .kind(),
            "auto_link"
        );
        assert_eq!(RoutedAction::Skip.kind(), "skip");
    }

    #[test]
    fn confidence_validation_bounds() {
        assert!(validate_confidence("test", 0.0).is_ok());
        assert!(validate_confidence("test", 1.0).is_ok());
        assert!(validate_confidence("test", -0.01).is_err());
        assert!(validate_confidence("test", 1.01).is_err());
        assert!(validate_confidence("test", f64::NAN).is_err());
    }
}
