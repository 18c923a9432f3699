// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Conflict Resolution Types
//!
//! Ballots, decisions and review policies for work items that several agents
//! review independently. Resolution walks the policy's tiers in order:
//!
//! ```text
//! COLLECTING ──quorum──▶ RESOLVING ──┬─▶ RESOLVED     (majority / arbiter)
//!                                    ├─▶ ESCALATED ──▶ RESOLVED | next tier
//!                                    └─▶ FALLEN_BACK  (human queue)
//! ```
//!
//! `RESOLVED` and `FALLEN_BACK` are final.

use bazaar_core::domain::agent::AgentId;
use bazaar_core::domain::engine::WorkItemId;
use bazaar_core::domain::error::ErrorClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionTier {
    MajorityVote,
    Escalate,
    HumanFallback,
}

impl ResolutionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionTier::MajorityVote => "MAJORITY_VOTE",
            ResolutionTier::Escalate => "ESCALATE",
            ResolutionTier::HumanFallback => "HUMAN_FALLBACK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictState {
    Collecting,
    Resolving,
    Resolved,
    Escalated,
    FallenBack,
}

impl ConflictState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConflictState::Resolved | ConflictState::FallenBack)
    }

    /// Whether new ballots are still counted.
    pub fn accepts_ballots(&self) -> bool {
        matches!(self, ConflictState::Collecting)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictBallot {
    pub work_item_id: WorkItemId,
    pub voter_agent_id: AgentId,
    pub decision_payload: serde_json::Value,
    pub cast_at: DateTime<Utc>,
    /// Voter's self-reported certainty in `[0, 1]`. Only breaks plurality ties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl ConflictBallot {
    pub fn new(work_item_id: impl Into<WorkItemId>, voter: impl Into<AgentId>, payload: serde_json::Value) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            voter_agent_id: voter.into(),
            decision_payload: payload,
            cast_at: Utc::now(),
            confidence: None,
        }
    }

    pub fn cast_at(mut self, cast_at: DateTime<Utc>) -> Self {
        self.cast_at = cast_at;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Confidence clamped to `[0, 1]`; missing or non-finite values count as none.
    fn weight(&self) -> Option<f64> {
        self.confidence
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0))
    }
}

/// Mean winner confidence below which an agreement is logged as weak.
pub const LOW_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDecision {
    pub work_item_id: WorkItemId,
    pub resolution_tier: ResolutionTier,
    pub winning_payload: serde_json::Value,
    pub resolved_at: DateTime<Utc>,
    /// Mean confidence of the winning ballots that reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// The arbiter for escalated decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<AgentId>,
    pub ballots_counted: usize,
}

/// Per-item review configuration, supplied when a conflict case is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewPolicy {
    /// Ballots required before resolution starts. Must exceed 1.
    pub quorum: usize,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<ResolutionTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arbiter: Option<AgentId>,
    /// Minimum share of ballots (0, 1] the plurality winner needs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub majority_threshold: Option<f64>,
    /// How long an escalated case waits for its arbiter.
    #[serde(default = "default_escalation_timeout", with = "humantime_serde")]
    pub escalation_timeout: Duration,
    /// When set, a case still short of quorum after this long is resolved
    /// with the ballots it has.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub collection_timeout: Option<Duration>,
}

fn default_tiers() -> Vec<ResolutionTier> {
    vec![ResolutionTier::MajorityVote, ResolutionTier::HumanFallback]
}

fn default_escalation_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self {
            quorum: 3,
            tiers: default_tiers(),
            arbiter: None,
            majority_threshold: None,
            escalation_timeout: default_escalation_timeout(),
            collection_timeout: None,
        }
    }
}

impl ReviewPolicy {
    pub fn validate(&self) -> Result<(), ConflictError> {
        if self.quorum < 2 {
            return Err(ConflictError::InvalidPolicy(format!(
                "quorum must be greater than 1, got {}",
                self.quorum
            )));
        }
        if self.tiers.is_empty() {
            return Err(ConflictError::InvalidPolicy("at least one tier is required".to_string()));
        }
        if self.tiers.contains(&ResolutionTier::Escalate) && self.arbiter.is_none() {
            return Err(ConflictError::InvalidPolicy("ESCALATE tier requires an arbiter".to_string()));
        }
        if let Some(threshold) = self.majority_threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(ConflictError::InvalidPolicy(format!(
                    "majority threshold must be in (0, 1], got {threshold}"
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of a plurality count.
#[derive(Debug, Clone, PartialEq)]
pub struct Tally {
    pub winning_payload: serde_json::Value,
    pub votes: usize,
    pub total: usize,
    pub confidence: Option<f64>,
}

impl Tally {
    pub fn is_low_confidence(&self) -> bool {
        self.confidence.is_some_and(|c| c < LOW_CONFIDENCE)
    }

    pub fn share(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.votes as f64 / self.total as f64
        }
    }
}

/// Plurality over payloads compared by canonical JSON. Ties go to the payload
/// with the higher summed confidence, then to the one whose earliest ballot
/// was cast first, then to the lowest voter id.
pub fn tally(ballots: &[ConflictBallot]) -> Option<Tally> {
    struct Group<'a> {
        payload: &'a serde_json::Value,
        votes: usize,
        confidence_sum: f64,
        confidence_reports: usize,
        first: (DateTime<Utc>, &'a AgentId),
    }

    let mut groups: HashMap<String, Group<'_>> = HashMap::new();
    for ballot in ballots {
        let key = ballot.decision_payload.to_string();
        let first = (ballot.cast_at, &ballot.voter_agent_id);
        let weight = ballot.weight();
        let group = groups.entry(key).or_insert(Group {
            payload: &ballot.decision_payload,
            votes: 0,
            confidence_sum: 0.0,
            confidence_reports: 0,
            first,
        });
        group.votes += 1;
        if let Some(weight) = weight {
            group.confidence_sum += weight;
            group.confidence_reports += 1;
        }
        if first < group.first {
            group.first = first;
        }
    }

    groups
        .into_values()
        .max_by(|a, b| {
            a.votes
                .cmp(&b.votes)
                .then_with(|| a.confidence_sum.total_cmp(&b.confidence_sum))
                .then_with(|| b.first.cmp(&a.first))
        })
        .map(|winner| Tally {
            winning_payload: winner.payload.clone(),
            votes: winner.votes,
            total: ballots.len(),
            confidence: (winner.confidence_reports > 0)
                .then(|| winner.confidence_sum / winner.confidence_reports as f64),
        })
}

/// Item handed to the human-assignable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackItem {
    pub work_item_id: WorkItemId,
    pub reason: String,
    pub ballots: Vec<ConflictBallot>,
    pub queued_at: DateTime<Utc>,
}

/// Read model of one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictStatus {
    pub work_item_id: WorkItemId,
    pub state: ConflictState,
    pub quorum: usize,
    pub ballots: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tier: Option<ResolutionTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ConflictDecision>,
    pub opened_at: DateTime<Utc>,
}

/// Result of casting a ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BallotOutcome {
    /// Counted; the case is now in `state`.
    Accepted { state: ConflictState },
    /// Arrived after collection closed; logged and ignored.
    Discarded { state: ConflictState },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error("no conflict case for work item {0}")]
    NotFound(WorkItemId),

    #[error("conflict case for work item {0} is already open")]
    AlreadyOpen(WorkItemId),

    #[error("conflict case for work item {0} is already closed")]
    Closed(WorkItemId),

    #[error("agent {voter} already voted on work item {item}")]
    DuplicateBallot { item: WorkItemId, voter: AgentId },

    #[error("agent {agent} is not the arbiter for work item {item}")]
    NotArbiter { item: WorkItemId, agent: AgentId },

    #[error("work item {0} is not awaiting arbitration")]
    NotEscalated(WorkItemId),

    #[error("invalid review policy: {0}")]
    InvalidPolicy(String),
}

impl ConflictError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ConflictError::NotFound(_) => ErrorClass::Expired,
            ConflictError::AlreadyOpen(_)
            | ConflictError::Closed(_)
            | ConflictError::DuplicateBallot { .. }
            | ConflictError::NotEscalated(_) => ErrorClass::Conflict,
            ConflictError::NotArbiter { .. } | ConflictError::InvalidPolicy(_) => ErrorClass::Fatal,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ConflictError::NotFound(_) => "conflict_not_found",
            ConflictError::AlreadyOpen(_) => "conflict_already_open",
            ConflictError::Closed(_) => "conflict_closed",
            ConflictError::DuplicateBallot { .. } => "duplicate_ballot",
            ConflictError::NotArbiter { .. } => "not_arbiter",
            ConflictError::NotEscalated(_) => "not_escalated",
            ConflictError::InvalidPolicy(_) => "invalid_policy",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_plurality_wins() {
        let ballots = vec![
            ConflictBallot::new("wi-1", "a1", json!({"approve": true})).cast_at(at(0)),
            ConflictBallot::new("wi-1", "a2", json!({"approve": false})).cast_at(at(1)),
            ConflictBallot::new("wi-1", "a3", json!({"approve": true})).cast_at(at(2)),
        ];
        let result = tally(&ballots).unwrap();
        assert_eq!(result.winning_payload, json!({"approve": true}));
        assert_eq!(result.votes, 2);
        assert!((result.share() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_tie_breaks_on_earliest_cast() {
        let ballots = vec![
            ConflictBallot::new("wi-1", "a1", json!("reject")).cast_at(at(5)),
            ConflictBallot::new("wi-1", "a2", json!("approve")).cast_at(at(3)),
            ConflictBallot::new("wi-1", "a3", json!("reject")).cast_at(at(9)),
            ConflictBallot::new("wi-1", "a4", json!("approve")).cast_at(at(7)),
        ];
        assert_eq!(tally(&ballots).unwrap().winning_payload, json!("approve"));

        // Same instant: lowest voter id wins
        let same_time = vec![
            ConflictBallot::new("wi-1", "b", json!("x")).cast_at(at(0)),
            ConflictBallot::new("wi-1", "a", json!("y")).cast_at(at(0)),
        ];
        assert_eq!(tally(&same_time).unwrap().winning_payload, json!("y"));
    }

    #[test]
    fn test_confidence_breaks_ties_only() {
        // Equal votes: the more confident side wins despite casting later
        let tied = vec![
            ConflictBallot::new("wi-1", "a1", json!("reject")).cast_at(at(1)).with_confidence(0.3),
            ConflictBallot::new("wi-1", "a2", json!("approve")).cast_at(at(2)).with_confidence(0.9),
        ];
        let result = tally(&tied).unwrap();
        assert_eq!(result.winning_payload, json!("approve"));
        assert_eq!(result.confidence, Some(0.9));
        assert!(!result.is_low_confidence());

        // More votes always beat more confidence
        let outvoted = vec![
            ConflictBallot::new("wi-1", "a1", json!("reject")).with_confidence(0.2),
            ConflictBallot::new("wi-1", "a2", json!("reject")).with_confidence(0.3),
            ConflictBallot::new("wi-1", "a3", json!("approve")).with_confidence(1.0),
        ];
        let result = tally(&outvoted).unwrap();
        assert_eq!(result.winning_payload, json!("reject"));
        assert_eq!(result.votes, 2);
        assert!(result.is_low_confidence());

        // Out-of-range values are clamped, NaN is ignored
        let odd = vec![
            ConflictBallot::new("wi-1", "a1", json!("x")).with_confidence(7.0),
            ConflictBallot::new("wi-1", "a2", json!("x")).with_confidence(f64::NAN),
        ];
        assert_eq!(tally(&odd).unwrap().confidence, Some(1.0));
    }

    #[test]
    fn test_payloads_compare_canonically() {
        let ballots = vec![
            ConflictBallot::new("wi-1", "a1", json!({"a": 1, "b": 2})),
            ConflictBallot::new("wi-1", "a2", json!({"b": 2, "a": 1})),
        ];
        assert_eq!(tally(&ballots).unwrap().votes, 2);
        assert!(tally(&[]).is_none());
    }

    #[test]
    fn test_policy_validation() {
        assert!(ReviewPolicy::default().validate().is_ok());
        let single = ReviewPolicy {
            quorum: 1,
            ..ReviewPolicy::default()
        };
        assert!(matches!(single.validate(), Err(ConflictError::InvalidPolicy(_))));

        let no_arbiter = ReviewPolicy {
            tiers: vec![ResolutionTier::Escalate],
            ..ReviewPolicy::default()
        };
        assert!(no_arbiter.validate().is_err());

        let bad_threshold = ReviewPolicy {
            majority_threshold: Some(1.5),
            ..ReviewPolicy::default()
        };
        assert!(bad_threshold.validate().is_err());
    }

    #[test]
    fn test_policy_wire_shape() {
        let policy: ReviewPolicy = serde_json::from_value(json!({
            "quorum": 3,
            "tiers": ["MAJORITY_VOTE", "ESCALATE", "HUMAN_FALLBACK"],
            "arbiter": "judge",
            "majorityThreshold": 0.6,
            "escalationTimeout": "2m"
        }))
        .unwrap();
        assert_eq!(policy.tiers.len(), 3);
        assert_eq!(policy.escalation_timeout, Duration::from_secs(120));
        assert_eq!(policy.arbiter, Some(AgentId::new("judge")));
        assert!(policy.validate().is_ok());
    }
}
