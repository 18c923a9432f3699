// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Conflict Resolver - reconciles divergent agent decisions on one work item
//!
//! Collects ballots up to the policy quorum, then walks the policy tiers:
//! majority vote, escalation to an arbiter agent, and finally the human
//! fallback queue. Final cases are archived and cannot be reopened while they
//! stay in the archive window; `tick` prunes older archive entries.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bazaar_core::domain::agent::AgentId;
use bazaar_core::domain::engine::WorkItemId;

use crate::domain::conflict::{
    tally, BallotOutcome, ConflictBallot, ConflictDecision, ConflictError, ConflictState, ConflictStatus,
    FallbackItem, ResolutionTier, ReviewPolicy,
};

#[derive(Debug, Clone)]
struct ConflictCase {
    policy: ReviewPolicy,
    state: ConflictState,
    ballots: Vec<ConflictBallot>,
    /// Index into `policy.tiers` of the tier being tried.
    tier_index: usize,
    opened_at: DateTime<Utc>,
    escalated_at: Option<DateTime<Utc>>,
    decision: Option<ConflictDecision>,
}

impl ConflictCase {
    fn status(&self, work_item_id: &WorkItemId) -> ConflictStatus {
        ConflictStatus {
            work_item_id: work_item_id.clone(),
            state: self.state,
            quorum: self.policy.quorum,
            ballots: self.ballots.len(),
            current_tier: match self.state {
                ConflictState::Collecting => None,
                _ => self.policy.tiers.get(self.tier_index).copied(),
            },
            decision: self.decision.clone(),
            opened_at: self.opened_at,
        }
    }
}

/// How long a final case keeps rejecting reopen and discarding late ballots.
pub const DEFAULT_ARCHIVE_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct ArchivedCase {
    status: ConflictStatus,
    archived_at: DateTime<Utc>,
}

/// What a tier walk produced, applied after the case lock is released.
enum Settled {
    Pending,
    Resolved,
    FallenBack(FallbackItem),
}

pub struct ConflictResolver {
    active: DashMap<WorkItemId, ConflictCase>,
    archived: DashMap<WorkItemId, ArchivedCase>,
    archive_retention: Duration,
    fallback: Mutex<VecDeque<FallbackItem>>,
    discarded: AtomicU64,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::with_archive_retention(DEFAULT_ARCHIVE_RETENTION)
    }

    pub fn with_archive_retention(archive_retention: Duration) -> Self {
        Self {
            active: DashMap::new(),
            archived: DashMap::new(),
            archive_retention,
            fallback: Mutex::new(VecDeque::new()),
            discarded: AtomicU64::new(0),
        }
    }

    /// Start collecting ballots for a work item.
    pub fn open(&self, work_item_id: WorkItemId, policy: ReviewPolicy) -> Result<ConflictStatus, ConflictError> {
        policy.validate()?;
        if self.archived.contains_key(&work_item_id) {
            return Err(ConflictError::Closed(work_item_id));
        }

        let case = ConflictCase {
            policy,
            state: ConflictState::Collecting,
            ballots: Vec::new(),
            tier_index: 0,
            opened_at: Utc::now(),
            escalated_at: None,
            decision: None,
        };
        let status = case.status(&work_item_id);
        match self.active.entry(work_item_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(ConflictError::AlreadyOpen(work_item_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(case);
            }
        }
        info!(work_item_id = %work_item_id, quorum = status.quorum, "Conflict case opened");
        metrics::gauge!("bazaar_conflicts_open").increment(1.0);
        Ok(status)
    }

    /// Record a ballot. Reaching quorum triggers resolution. Ballots arriving
    /// once collection has closed are discarded without touching the outcome.
    ///
    /// # Errors
    ///
    /// - [`ConflictError::NotFound`] if no case was ever opened for the item
    /// - [`ConflictError::DuplicateBallot`] if the voter already voted
    pub fn cast(&self, ballot: ConflictBallot) -> Result<BallotOutcome, ConflictError> {
        let work_item_id = ballot.work_item_id.clone();
        let settled = {
            let Some(mut case) = self.active.get_mut(&work_item_id) else {
                return match self.archived.get(&work_item_id) {
                    Some(archived) => Ok(self.discard(&ballot, archived.status.state)),
                    None => Err(ConflictError::NotFound(work_item_id)),
                };
            };

            if !case.state.accepts_ballots() {
                return Ok(self.discard(&ballot, case.state));
            }
            if case.ballots.iter().any(|b| b.voter_agent_id == ballot.voter_agent_id) {
                return Err(ConflictError::DuplicateBallot {
                    item: work_item_id,
                    voter: ballot.voter_agent_id,
                });
            }

            debug!(work_item_id = %work_item_id, voter = %ballot.voter_agent_id, "Ballot accepted");
            case.ballots.push(ballot);
            if case.ballots.len() >= case.policy.quorum {
                case.state = ConflictState::Resolving;
                Self::walk_tiers(&work_item_id, &mut case, Utc::now())
            } else {
                Settled::Pending
            }
        };

        let state = self.settle(&work_item_id, settled);
        Ok(BallotOutcome::Accepted { state })
    }

    /// Authoritative decision from the arbiter of an escalated case.
    pub fn arbitrate(
        &self,
        work_item_id: &WorkItemId,
        arbiter: &AgentId,
        payload: serde_json::Value,
    ) -> Result<ConflictDecision, ConflictError> {
        let decision = {
            let Some(mut case) = self.active.get_mut(work_item_id) else {
                return Err(if self.archived.contains_key(work_item_id) {
                    ConflictError::Closed(work_item_id.clone())
                } else {
                    ConflictError::NotFound(work_item_id.clone())
                });
            };
            if case.state != ConflictState::Escalated {
                return Err(ConflictError::NotEscalated(work_item_id.clone()));
            }
            if case.policy.arbiter.as_ref() != Some(arbiter) {
                return Err(ConflictError::NotArbiter {
                    item: work_item_id.clone(),
                    agent: arbiter.clone(),
                });
            }

            let decision = ConflictDecision {
                work_item_id: work_item_id.clone(),
                resolution_tier: ResolutionTier::Escalate,
                winning_payload: payload,
                resolved_at: Utc::now(),
                confidence: None,
                decided_by: Some(arbiter.clone()),
                ballots_counted: case.ballots.len(),
            };
            case.state = ConflictState::Resolved;
            case.decision = Some(decision.clone());
            decision
        };

        self.settle(work_item_id, Settled::Resolved);
        Ok(decision)
    }

    /// Apply timeouts as of `now`: cases short of quorum past their collection
    /// timeout are resolved with the ballots they hold, escalated cases past
    /// the escalation timeout move on to the next tier, and archive entries
    /// older than the retention window are dropped. Returns the number of
    /// cases that changed state.
    pub fn tick(&self, now: DateTime<Utc>) -> usize {
        self.prune_archive(now);

        let mut changed = Vec::new();
        for mut entry in self.active.iter_mut() {
            let work_item_id = entry.key().clone();
            let case = entry.value_mut();
            let settled = match case.state {
                ConflictState::Collecting => {
                    let Some(timeout) = case.policy.collection_timeout else {
                        continue;
                    };
                    if !elapsed(case.opened_at, now, timeout) {
                        continue;
                    }
                    info!(work_item_id = %work_item_id, ballots = case.ballots.len(), "Collection timed out, resolving short of quorum");
                    case.state = ConflictState::Resolving;
                    Self::walk_tiers(&work_item_id, case, now)
                }
                ConflictState::Escalated => {
                    let escalated_at = case.escalated_at.unwrap_or(case.opened_at);
                    if !elapsed(escalated_at, now, case.policy.escalation_timeout) {
                        continue;
                    }
                    warn!(work_item_id = %work_item_id, "Arbiter did not decide in time, moving to next tier");
                    case.tier_index += 1;
                    case.state = ConflictState::Resolving;
                    Self::walk_tiers(&work_item_id, case, now)
                }
                _ => continue,
            };
            changed.push((work_item_id, settled));
        }

        let count = changed.len();
        for (work_item_id, settled) in changed {
            self.settle(&work_item_id, settled);
        }
        count
    }

    pub fn decision(&self, work_item_id: &WorkItemId) -> Option<ConflictDecision> {
        if let Some(archived) = self.archived.get(work_item_id) {
            return archived.status.decision.clone();
        }
        self.active.get(work_item_id).and_then(|case| case.decision.clone())
    }

    pub fn state(&self, work_item_id: &WorkItemId) -> Option<ConflictState> {
        self.status(work_item_id).map(|s| s.state)
    }

    pub fn status(&self, work_item_id: &WorkItemId) -> Option<ConflictStatus> {
        if let Some(case) = self.active.get(work_item_id) {
            return Some(case.status(work_item_id));
        }
        self.archived.get(work_item_id).map(|archived| archived.status.clone())
    }

    /// Snapshot of the human queue, oldest first.
    pub fn pending_fallback(&self) -> Vec<FallbackItem> {
        self.fallback.lock().iter().cloned().collect()
    }

    /// Take everything off the human queue.
    pub fn drain_fallback(&self) -> Vec<FallbackItem> {
        self.fallback.lock().drain(..).collect()
    }

    pub fn open_count(&self) -> usize {
        self.active.len()
    }

    pub fn archived_count(&self) -> usize {
        self.archived.len()
    }

    pub fn discarded_count(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Periodically apply timeouts until cancelled.
    pub fn spawn_ticker(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let changed = resolver.tick(Utc::now());
                        if changed > 0 {
                            debug!(changed, "Conflict timeouts applied");
                        }
                    }
                }
            }
        })
    }

    fn discard(&self, ballot: &ConflictBallot, state: ConflictState) -> BallotOutcome {
        warn!(
            work_item_id = %ballot.work_item_id,
            voter = %ballot.voter_agent_id,
            state = ?state,
            "Late ballot discarded"
        );
        self.discarded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("bazaar_conflict_ballots_discarded_total").increment(1);
        BallotOutcome::Discarded { state }
    }

    /// Try tiers from `case.tier_index` until one settles or waits.
    fn walk_tiers(work_item_id: &WorkItemId, case: &mut ConflictCase, now: DateTime<Utc>) -> Settled {
        while let Some(tier) = case.policy.tiers.get(case.tier_index).copied() {
            match tier {
                ResolutionTier::MajorityVote => {
                    if let Some(result) = tally(&case.ballots) {
                        let meets_threshold = case
                            .policy
                            .majority_threshold
                            .map(|threshold| result.share() >= threshold)
                            .unwrap_or(true);
                        if meets_threshold {
                            if result.is_low_confidence() {
                                warn!(
                                    work_item_id = %work_item_id,
                                    confidence = result.confidence,
                                    "Conflict resolved on low-confidence agreement"
                                );
                            }
                            case.state = ConflictState::Resolved;
                            case.decision = Some(ConflictDecision {
                                work_item_id: work_item_id.clone(),
                                resolution_tier: ResolutionTier::MajorityVote,
                                winning_payload: result.winning_payload,
                                resolved_at: now,
                                confidence: result.confidence,
                                decided_by: None,
                                ballots_counted: result.total,
                            });
                            return Settled::Resolved;
                        }
                        debug!(
                            work_item_id = %work_item_id,
                            share = result.share(),
                            "Plurality below threshold, trying next tier"
                        );
                    }
                }
                ResolutionTier::Escalate => {
                    if case.policy.arbiter.is_some() {
                        case.state = ConflictState::Escalated;
                        case.escalated_at = Some(now);
                        info!(work_item_id = %work_item_id, arbiter = ?case.policy.arbiter, "Conflict escalated");
                        return Settled::Pending;
                    }
                }
                ResolutionTier::HumanFallback => {
                    return Self::fall_back(work_item_id, case, "routed to human review", now);
                }
            }
            case.tier_index += 1;
        }
        Self::fall_back(work_item_id, case, "all resolution tiers exhausted", now)
    }

    fn fall_back(work_item_id: &WorkItemId, case: &mut ConflictCase, reason: &str, now: DateTime<Utc>) -> Settled {
        case.state = ConflictState::FallenBack;
        Settled::FallenBack(FallbackItem {
            work_item_id: work_item_id.clone(),
            reason: reason.to_string(),
            ballots: case.ballots.clone(),
            queued_at: now,
        })
    }

    /// Archive final cases and enqueue fallbacks. Must run without holding a
    /// guard on `active`.
    fn settle(&self, work_item_id: &WorkItemId, settled: Settled) -> ConflictState {
        match settled {
            Settled::Pending => self.state(work_item_id).unwrap_or(ConflictState::Collecting),
            Settled::Resolved => {
                self.archive(work_item_id);
                metrics::counter!("bazaar_conflicts_resolved_total").increment(1);
                if let Some(decision) = self.decision(work_item_id) {
                    info!(
                        work_item_id = %work_item_id,
                        tier = decision.resolution_tier.as_str(),
                        "Conflict resolved"
                    );
                }
                ConflictState::Resolved
            }
            Settled::FallenBack(item) => {
                warn!(work_item_id = %work_item_id, reason = %item.reason, "Conflict routed to human fallback");
                self.fallback.lock().push_back(item);
                self.archive(work_item_id);
                metrics::counter!("bazaar_conflicts_fallen_back_total").increment(1);
                ConflictState::FallenBack
            }
        }
    }

    fn archive(&self, work_item_id: &WorkItemId) {
        let Some(status) = self.active.get(work_item_id).map(|case| case.status(work_item_id)) else {
            return;
        };
        self.archived.insert(
            work_item_id.clone(),
            ArchivedCase {
                status,
                archived_at: Utc::now(),
            },
        );
        if self.active.remove(work_item_id).is_some() {
            metrics::gauge!("bazaar_conflicts_open").decrement(1.0);
        }
    }
}

impl ConflictResolver {
    fn prune_archive(&self, now: DateTime<Utc>) {
        let before = self.archived.len();
        self.archived
            .retain(|_, archived| !elapsed(archived.archived_at, now, self.archive_retention));
        let pruned = before.saturating_sub(self.archived.len());
        if pruned > 0 {
            debug!(pruned, "Pruned archived conflict cases");
        }
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    match chrono::Duration::from_std(timeout) {
        Ok(timeout) => now - since >= timeout,
        Err(_) => false,
    }
}
