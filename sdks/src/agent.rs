// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Agent Runtime
//!
//! Supervisor task driving one agent through its lifecycle:
//!
//! 1. **INITIALIZING** publishes the listing (transient failures retried up
//!    to `max_reconnect_attempts`).
//! 2. **DISCOVERING** polls the engine for enabled items the partition
//!    assigns here, with exponential backoff between empty cycles.
//! 3. **PROCESSING** runs the [`WorkHandler`] on a checked-out item, then
//!    completes, rolls back, or hands it to another capable agent.
//! 4. **RECONNECTING** is entered when a heartbeat fails or the registry is
//!    unreachable; each attempt renews (or republishes) and probes discovery.
//! 5. **STOPPING** always unpublishes best-effort before **STOPPED**.
//!
//! Heartbeats run on their own task so a slow handler never lets the lease
//! lapse. The supervisor learns about heartbeat failures over a channel and
//! wakes from its backoff sleep to handle them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bazaar_core::application::registry::RegistryApi;
use bazaar_core::domain::agent::{AgentId, AgentRecord, Capability, DiscoveryQuery, PublishRequest};
use bazaar_core::domain::engine::{EngineError, WorkItemId, WorkItemRecord, WorkflowEngine};
use bazaar_core::domain::error::MarketplaceError;
use bazaar_core::domain::handoff::HandoffRequest;
use bazaar_core::domain::lease::LeaseId;
use bazaar_core::domain::node_config::{AgentDefaults, BackoffSettings};
use bazaar_swarm::domain::partition::{PartitionRefresher, PartitionView};

use crate::backoff::BackoffController;
use crate::delivery::{HandoffDelivery, HandoffInbox};
use crate::types::{with_deadline, AgentError, AgentState, HandoffEnvelope, WorkOutcome};

const DISCOVERY_PAGE_SIZE: usize = 1000;
const HEARTBEAT_SIGNAL_CAPACITY: usize = 16;

/// Application logic run on every item the agent checks out.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, item: &WorkItemRecord) -> WorkOutcome;
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: AgentId,
    pub capabilities: BTreeSet<Capability>,
    pub endpoint: String,
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffSettings,
    pub partition_refresh_cycles: u32,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub operation_timeout: Duration,
    pub orphan_after: Duration,
}

impl AgentConfig {
    pub fn new<I, C>(agent_id: impl Into<String>, capabilities: I, endpoint: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        let defaults = AgentDefaults::default();
        Self {
            agent_id: AgentId::new(agent_id),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            endpoint: endpoint.into(),
            lease_ttl: defaults.lease_ttl,
            heartbeat_interval: defaults.heartbeat_interval,
            backoff: defaults.backoff,
            partition_refresh_cycles: defaults.partition_refresh_cycles,
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            reconnect_delay: defaults.reconnect_delay,
            operation_timeout: defaults.operation_timeout,
            orphan_after: defaults.orphan_after,
        }
    }

    /// Take timing and backoff settings from a node's `agent_defaults` block.
    pub fn with_defaults(mut self, defaults: &AgentDefaults) -> Self {
        self.lease_ttl = defaults.lease_ttl;
        self.heartbeat_interval = defaults.heartbeat_interval;
        self.backoff = defaults.backoff.clone();
        self.partition_refresh_cycles = defaults.partition_refresh_cycles;
        self.max_reconnect_attempts = defaults.max_reconnect_attempts;
        self.reconnect_delay = defaults.reconnect_delay;
        self.operation_timeout = defaults.operation_timeout;
        self.orphan_after = defaults.orphan_after;
        self
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        self.agent_id
            .validate()
            .map_err(|e| AgentError::Config(e.to_string()))?;
        if self.capabilities.is_empty() {
            return Err(AgentError::Config("an agent needs at least one capability".to_string()));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.lease_ttl {
            return Err(AgentError::Config(format!(
                "heartbeat interval {:?} must be non-zero and shorter than the lease TTL {:?}",
                self.heartbeat_interval, self.lease_ttl
            )));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(AgentError::Config("max_reconnect_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    fn publish_request(&self) -> PublishRequest {
        PublishRequest {
            agent_id: self.agent_id.clone(),
            capabilities: self.capabilities.clone(),
            endpoint: self.endpoint.clone(),
            ttl: Some(self.lease_ttl.as_secs().max(1)),
        }
    }
}

pub struct Agent {
    config: AgentConfig,
    registry: Arc<dyn RegistryApi>,
    engine: Arc<dyn WorkflowEngine>,
    handler: Arc<dyn WorkHandler>,
    delivery: Arc<dyn HandoffDelivery>,
    inbox: Option<HandoffInbox>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        registry: Arc<dyn RegistryApi>,
        engine: Arc<dyn WorkflowEngine>,
        handler: Arc<dyn WorkHandler>,
        delivery: Arc<dyn HandoffDelivery>,
    ) -> Self {
        Self {
            config,
            registry,
            engine,
            handler,
            delivery,
            inbox: None,
        }
    }

    /// Receive handoff tokens addressed to this agent.
    pub fn with_inbox(mut self, inbox: HandoffInbox) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Start the supervisor task.
    pub fn spawn(self) -> AgentHandle {
        let (state_tx, state_rx) = watch::channel(AgentState::Initializing);
        let (lease_tx, _) = watch::channel(None);
        let cancel = CancellationToken::new();
        let agent_id = self.config.agent_id.clone();

        let runtime = Runtime {
            backoff: BackoffController::from_settings(&self.config.backoff),
            refresher: PartitionRefresher::new(self.config.partition_refresh_cycles),
            config: self.config,
            registry: self.registry,
            engine: self.engine,
            handler: self.handler,
            delivery: self.delivery,
            inbox: self.inbox,
            state_tx,
            lease_tx,
            cancel: cancel.clone(),
            listed: false,
            heartbeat: None,
            views: HashMap::new(),
            takeovers: Vec::new(),
            handed_off: HashMap::new(),
        };
        let join = tokio::spawn(runtime.run());

        AgentHandle {
            agent_id,
            state: state_rx,
            cancel,
            join,
        }
    }
}

/// Control handle for a running agent.
pub struct AgentHandle {
    agent_id: AgentId,
    state: watch::Receiver<AgentState>,
    cancel: CancellationToken,
    join: JoinHandle<Result<(), AgentError>>,
}

impl AgentHandle {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.clone()
    }

    /// Wait until the agent reaches `target`. Returns `false` if it stopped first.
    pub async fn wait_for(&self, target: AgentState) -> bool {
        let mut state = self.state.clone();
        let reached = match state.wait_for(|s| *s == target || *s == AgentState::Stopped).await {
            Ok(reached) => *reached == target,
            Err(_) => false,
        };
        reached
    }

    /// Ask the agent to stop and wait for it to unpublish.
    pub async fn stop(self) -> Result<(), AgentError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the agent to exit on its own.
    pub async fn join(self) -> Result<(), AgentError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(AgentError::Aborted(e.to_string())),
        }
    }
}

enum HeartbeatSignal {
    Failed(AgentError),
}

/// A handoff this agent accepted and still has to check out.
#[derive(Debug)]
struct Takeover {
    work_item_id: WorkItemId,
    source_agent_id: AgentId,
    expires_at: DateTime<Utc>,
}

enum Wake {
    Elapsed,
    Cancelled,
    Heartbeat(HeartbeatSignal),
    Handoff(HandoffEnvelope),
}

struct Runtime {
    config: AgentConfig,
    registry: Arc<dyn RegistryApi>,
    engine: Arc<dyn WorkflowEngine>,
    handler: Arc<dyn WorkHandler>,
    delivery: Arc<dyn HandoffDelivery>,
    inbox: Option<HandoffInbox>,
    state_tx: watch::Sender<AgentState>,
    lease_tx: watch::Sender<Option<LeaseId>>,
    cancel: CancellationToken,
    /// Set once a publish may have created our listing; an agent whose
    /// publish was refused must not delete another instance's listing.
    listed: bool,
    heartbeat: Option<(CancellationToken, JoinHandle<()>)>,
    backoff: BackoffController,
    refresher: PartitionRefresher,
    views: HashMap<Capability, PartitionView>,
    takeovers: Vec<Takeover>,
    /// Items this agent handed away, kept until the token expires so the
    /// agent does not grab them back before the target does.
    handed_off: HashMap<WorkItemId, DateTime<Utc>>,
}

impl Runtime {
    async fn run(mut self) -> Result<(), AgentError> {
        let result = self.lifecycle().await;
        if let Err(e) = &result {
            warn!(agent_id = %self.config.agent_id, error = %e, "Agent stopping on error");
        }
        self.shutdown().await;
        result
    }

    fn transition(&self, next: AgentState) {
        let previous = self.state_tx.send_replace(next);
        if previous == next {
            return;
        }
        metrics::counter!("bazaar_agent_transitions_total", "state" => next.as_str()).increment(1);
        match next {
            AgentState::Discovering | AgentState::Processing => {
                debug!(agent_id = %self.config.agent_id, from = previous.as_str(), to = next.as_str(), "Agent state changed")
            }
            _ => info!(agent_id = %self.config.agent_id, from = previous.as_str(), to = next.as_str(), "Agent state changed"),
        }
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn timeout(&self) -> Duration {
        self.config.operation_timeout
    }

    async fn lifecycle(&mut self) -> Result<(), AgentError> {
        self.transition(AgentState::Initializing);
        self.config.validate()?;

        let Some(lease) = self.initial_publish().await? else {
            return Ok(());
        };
        self.lease_tx.send_replace(Some(lease));

        let (signal_tx, mut signals) = mpsc::channel(HEARTBEAT_SIGNAL_CAPACITY);
        let heartbeat_cancel = self.cancel.child_token();
        let heartbeat = spawn_heartbeat(
            self.registry.clone(),
            self.config.agent_id.clone(),
            self.config.heartbeat_interval,
            self.timeout(),
            self.lease_tx.subscribe(),
            signal_tx,
            heartbeat_cancel.clone(),
        );
        self.heartbeat = Some((heartbeat_cancel, heartbeat));
        self.transition(AgentState::Discovering);

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let mut failure = None;
            while let Ok(HeartbeatSignal::Failed(e)) = signals.try_recv() {
                failure = Some(e);
            }
            if let Some(e) = failure {
                self.reconnect(e, &mut signals).await?;
                continue;
            }

            self.drain_inbox().await;

            let worked = match self.cycle().await {
                Ok(worked) => worked,
                Err(e) if e.is_registry_outage() => {
                    self.reconnect(e, &mut signals).await?;
                    continue;
                }
                Err(e) => {
                    warn!(agent_id = %self.config.agent_id, error = %e, class = ?e.class(), "Discovery cycle failed");
                    false
                }
            };

            let sleep = self.backoff.advance_duration(!worked);
            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Cancelled,
                _ = tokio::time::sleep(sleep) => Wake::Elapsed,
                Some(signal) = signals.recv() => Wake::Heartbeat(signal),
                Some(envelope) = next_envelope(&mut self.inbox) => Wake::Handoff(envelope),
            };
            match wake {
                Wake::Elapsed => {}
                Wake::Cancelled => return Ok(()),
                Wake::Heartbeat(HeartbeatSignal::Failed(e)) => self.reconnect(e, &mut signals).await?,
                Wake::Handoff(envelope) => {
                    self.accept_handoff(envelope).await;
                    self.backoff.reset();
                }
            }
        }
    }

    async fn initial_publish(&mut self) -> Result<Option<LeaseId>, AgentError> {
        let mut attempts = 0u32;
        // Set once an attempt went unanswered: the registry may have applied it.
        let mut unanswered = false;
        loop {
            self.listed = true;
            let published = with_deadline(
                "publish",
                self.timeout(),
                self.registry.publish(self.config.publish_request()),
            )
            .await;
            match published {
                Ok(lease) => {
                    info!(
                        agent_id = %self.config.agent_id,
                        lease_id = %lease,
                        capabilities = self.config.capabilities.len(),
                        "Agent published"
                    );
                    return Ok(Some(lease));
                }
                Err(e) if e.is_registry_outage() => {
                    attempts += 1;
                    unanswered = true;
                    warn!(
                        agent_id = %self.config.agent_id,
                        attempt = attempts,
                        max_attempts = self.config.max_reconnect_attempts,
                        error = %e,
                        "Publish failed"
                    );
                    if attempts >= self.config.max_reconnect_attempts {
                        return Err(AgentError::ReconnectExhausted { attempts });
                    }
                    if !self.pause(self.config.reconnect_delay).await {
                        return Ok(None);
                    }
                }
                Err(e) => {
                    let maybe_ours =
                        unanswered && matches!(e, AgentError::Registry(MarketplaceError::DuplicateAgentId(_)));
                    if maybe_ours {
                        warn!(
                            agent_id = %self.config.agent_id,
                            "Publish refused as duplicate after an unanswered attempt; unpublishing on stop"
                        );
                    }
                    self.listed = maybe_ours;
                    return Err(e);
                }
            }
        }
    }

    /// RECONNECTING. Returns once the registry answers again, or with
    /// [`AgentError::ReconnectExhausted`] after too many failed attempts.
    async fn reconnect(
        &mut self,
        cause: AgentError,
        signals: &mut mpsc::Receiver<HeartbeatSignal>,
    ) -> Result<(), AgentError> {
        self.transition(AgentState::Reconnecting);
        warn!(agent_id = %self.config.agent_id, cause = %cause, "Lost contact with the registry");
        if cause.is_lease_lost() {
            self.lease_tx.send_replace(None);
        }

        let entered = Instant::now();
        metrics::gauge!("bazaar_agents_reconnecting").increment(1.0);

        let mut attempts = 0u32;
        let outcome = loop {
            match self.try_recover().await {
                Ok(()) => break Ok(()),
                Err(e) => {
                    attempts += 1;
                    warn!(
                        agent_id = %self.config.agent_id,
                        attempt = attempts,
                        max_attempts = self.config.max_reconnect_attempts,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    if attempts >= self.config.max_reconnect_attempts {
                        break Err(AgentError::ReconnectExhausted { attempts });
                    }
                    if !self.pause(self.config.reconnect_delay).await {
                        break Ok(());
                    }
                }
            }
        };

        // Failures queued during the outage are stale now
        while signals.try_recv().is_ok() {}

        metrics::gauge!("bazaar_agents_reconnecting").decrement(1.0);
        metrics::histogram!("bazaar_agent_reconnecting_seconds").record(entered.elapsed().as_secs_f64());

        if outcome.is_ok() && !self.cancel.is_cancelled() {
            info!(
                agent_id = %self.config.agent_id,
                attempts = attempts + 1,
                "Reconnected to the registry"
            );
            self.refresher.invalidate();
            self.transition(AgentState::Discovering);
        }
        outcome
    }

    /// One reconnect attempt: renew (republishing if the lease is gone), then
    /// confirm discovery answers.
    async fn try_recover(&mut self) -> Result<(), AgentError> {
        let current = *self.lease_tx.borrow();
        let renewed = match current {
            Some(lease) => {
                with_deadline(
                    "renew",
                    self.timeout(),
                    self.registry.renew(&self.config.agent_id, lease),
                )
                .await
            }
            None => Err(AgentError::Registry(MarketplaceError::LeaseNotFound(
                self.config.agent_id.clone(),
            ))),
        };
        match renewed {
            Ok(()) => {}
            Err(e) if e.is_lease_lost() => {
                self.lease_tx.send_replace(None);
                let lease = with_deadline(
                    "publish",
                    self.timeout(),
                    self.registry.publish(self.config.publish_request()),
                )
                .await?;
                info!(agent_id = %self.config.agent_id, lease_id = %lease, "Re-published under a new lease");
                self.lease_tx.send_replace(Some(lease));
            }
            Err(e) => return Err(e),
        }

        if let Some(capability) = self.config.capabilities.iter().next() {
            with_deadline(
                "discover",
                self.timeout(),
                self.registry.discover(DiscoveryQuery::new(capability.clone()).page(1, 0)),
            )
            .await?;
        }
        Ok(())
    }

    /// One DISCOVERING pass. Returns whether an item was processed.
    async fn cycle(&mut self) -> Result<bool, AgentError> {
        let now = Utc::now();
        self.handed_off.retain(|_, expires_at| *expires_at > now);

        if let Some(record) = self.claim_takeover().await {
            self.process(record).await;
            return Ok(true);
        }

        let refresh = self.refresher.tick();
        let capabilities: Vec<Capability> = self.config.capabilities.iter().cloned().collect();
        for capability in capabilities {
            if refresh || !self.views.contains_key(&capability) {
                let view = self.snapshot(&capability).await?;
                debug!(
                    agent_id = %self.config.agent_id,
                    capability = %capability,
                    members = view.total(),
                    slot = ?view.self_index(),
                    "Partition snapshot refreshed"
                );
                self.views.insert(capability.clone(), view);
            }

            let items = with_deadline(
                "list_enabled_work_items",
                self.timeout(),
                self.engine.list_enabled_work_items(&capability),
            )
            .await?;

            let now = Utc::now();
            let candidates: Vec<WorkItemId> = match self.views.get(&capability) {
                Some(view) => items
                    .iter()
                    .filter(|item| !self.handed_off.contains_key(&item.work_item_id))
                    .filter(|item| view.should_attempt(item, now, self.config.orphan_after))
                    .map(|item| item.work_item_id.clone())
                    .collect(),
                None => Vec::new(),
            };

            for item in candidates {
                let checked_out = with_deadline(
                    "checkout",
                    self.timeout(),
                    self.engine.checkout(&item, &self.config.agent_id),
                )
                .await;
                match checked_out {
                    Ok(record) => {
                        self.process(record).await;
                        return Ok(true);
                    }
                    Err(AgentError::Engine(EngineError::AlreadyOwned { owner, .. })) => {
                        // Our snapshot disagrees with someone else's
                        debug!(agent_id = %self.config.agent_id, work_item_id = %item, owner = %owner, "Checkout lost");
                        metrics::counter!("bazaar_checkout_conflicts_total").increment(1);
                        self.refresher.invalidate();
                    }
                    Err(AgentError::Engine(EngineError::NotFound(_) | EngineError::AlreadyTerminal(_))) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(false)
    }

    async fn snapshot(&self, capability: &Capability) -> Result<PartitionView, AgentError> {
        let mut members = Vec::new();
        let mut offset = 0;
        loop {
            let query = DiscoveryQuery::new(capability.clone()).page(DISCOVERY_PAGE_SIZE, offset);
            let page = with_deadline("discover", self.timeout(), self.registry.discover(query)).await?;
            let fetched = page.agents.len();
            members.extend(page.agents.into_iter().map(|record| record.agent_id));
            offset += fetched;
            if fetched == 0 || offset >= page.total {
                break;
            }
        }
        Ok(PartitionView::new(capability.clone(), &self.config.agent_id, members))
    }

    async fn process(&mut self, record: WorkItemRecord) {
        self.transition(AgentState::Processing);
        let item = record.work_item_id.clone();
        debug!(agent_id = %self.config.agent_id, work_item_id = %item, "Processing work item");

        match self.handler.handle(&record).await {
            WorkOutcome::Completed(payload) => {
                let completed = with_deadline(
                    "complete",
                    self.timeout(),
                    self.engine.complete(&item, &self.config.agent_id, payload),
                )
                .await;
                match completed {
                    Ok(()) => {
                        metrics::counter!("bazaar_work_items_completed_total").increment(1);
                        info!(agent_id = %self.config.agent_id, work_item_id = %item, "Work item completed");
                    }
                    Err(e) => {
                        warn!(agent_id = %self.config.agent_id, work_item_id = %item, error = %e, "Completion rejected")
                    }
                }
            }
            WorkOutcome::HandOff { reason } => self.hand_off(&record, &reason).await,
            WorkOutcome::Failed { reason } => {
                warn!(agent_id = %self.config.agent_id, work_item_id = %item, reason = %reason, "Handler failed");
                self.rollback(&item).await;
            }
        }

        self.transition(AgentState::Discovering);
    }

    async fn rollback(&self, item: &WorkItemId) {
        if let Err(e) = with_deadline(
            "rollback",
            self.timeout(),
            self.engine.rollback(item, &self.config.agent_id),
        )
        .await
        {
            warn!(agent_id = %self.config.agent_id, work_item_id = %item, error = %e, "Rollback failed");
        }
    }

    /// Mint a token for another capable agent, deliver it, then release the
    /// checkout. Any failure along the way just releases the item.
    async fn hand_off(&mut self, record: &WorkItemRecord, reason: &str) {
        let item = &record.work_item_id;
        let target = match self.pick_target(record).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                warn!(agent_id = %self.config.agent_id, work_item_id = %item, "No live target for handoff");
                self.rollback(item).await;
                return;
            }
            Err(e) => {
                warn!(agent_id = %self.config.agent_id, work_item_id = %item, error = %e, "Handoff target lookup failed");
                self.rollback(item).await;
                return;
            }
        };

        let request = HandoffRequest {
            work_item_id: item.clone(),
            source_agent_id: self.config.agent_id.clone(),
            target_agent_id: target.agent_id.clone(),
            capability: Some(record.required_capability.clone()),
        };
        let granted = with_deadline(
            "request_handoff",
            self.timeout(),
            self.registry.request_handoff(request),
        )
        .await;
        match granted {
            Ok(grant) => {
                let envelope = HandoffEnvelope {
                    token: grant.token,
                    work_item_id: item.clone(),
                    source_agent_id: self.config.agent_id.clone(),
                    expires_at: grant.expires_at,
                };
                let delivered = with_deadline(
                    "deliver_handoff",
                    self.timeout(),
                    self.delivery.deliver(&target, envelope),
                )
                .await;
                match delivered {
                    Ok(()) => {
                        self.handed_off.insert(item.clone(), grant.expires_at);
                        metrics::counter!("bazaar_handoffs_sent_total").increment(1);
                        info!(
                            agent_id = %self.config.agent_id,
                            work_item_id = %item,
                            target = %target.agent_id,
                            reason = %reason,
                            "Work item handed off"
                        );
                    }
                    Err(e) => {
                        warn!(agent_id = %self.config.agent_id, work_item_id = %item, error = %e, "Handoff delivery failed")
                    }
                }
            }
            Err(e) => {
                warn!(agent_id = %self.config.agent_id, work_item_id = %item, error = %e, "Handoff refused")
            }
        }

        self.rollback(item).await;
    }

    /// Another live agent advertising the item's capability, chosen by the
    /// partition hash over the candidates so handoffs spread out.
    async fn pick_target(&self, record: &WorkItemRecord) -> Result<Option<AgentRecord>, AgentError> {
        let query = DiscoveryQuery::new(record.required_capability.clone()).page(DISCOVERY_PAGE_SIZE, 0);
        let page = with_deadline("discover", self.timeout(), self.registry.discover(query)).await?;
        let others: Vec<AgentRecord> = page
            .agents
            .into_iter()
            .filter(|candidate| candidate.agent_id != self.config.agent_id)
            .collect();

        let view = PartitionView::new(
            record.required_capability.clone(),
            &self.config.agent_id,
            others.iter().map(|candidate| candidate.agent_id.clone()),
        );
        let Some(owner) = view.owner_of(&record.work_item_id).cloned() else {
            return Ok(None);
        };
        Ok(others.into_iter().find(|candidate| candidate.agent_id == owner))
    }

    async fn drain_inbox(&mut self) {
        let mut received = Vec::new();
        if let Some(inbox) = self.inbox.as_mut() {
            while let Ok(envelope) = inbox.try_recv() {
                received.push(envelope);
            }
        }
        for envelope in received {
            self.accept_handoff(envelope).await;
        }
    }

    async fn accept_handoff(&mut self, envelope: HandoffEnvelope) {
        let acked = with_deadline(
            "acknowledge_handoff",
            self.timeout(),
            self.registry
                .acknowledge_handoff(&envelope.token, Some(&self.config.agent_id)),
        )
        .await;
        match acked {
            Ok(ack) => {
                info!(
                    agent_id = %self.config.agent_id,
                    work_item_id = %ack.work_item_id,
                    source = %ack.source_agent_id,
                    "Handoff accepted"
                );
                self.takeovers.push(Takeover {
                    work_item_id: ack.work_item_id,
                    source_agent_id: ack.source_agent_id,
                    expires_at: ack.expires_at,
                });
            }
            Err(e) => {
                warn!(
                    agent_id = %self.config.agent_id,
                    work_item_id = %envelope.work_item_id,
                    source = %envelope.source_agent_id,
                    error = %e,
                    "Handoff token rejected"
                );
            }
        }
    }

    /// Check out the first accepted handoff whose source has released it.
    /// Takeovers still held by their source are retried next cycle until the
    /// token would have expired.
    async fn claim_takeover(&mut self) -> Option<WorkItemRecord> {
        let now = Utc::now();
        let pending = std::mem::take(&mut self.takeovers);
        let mut remaining = Vec::with_capacity(pending.len());
        let mut claimed = None;

        for takeover in pending {
            if claimed.is_some() {
                remaining.push(takeover);
                continue;
            }
            if takeover.expires_at <= now {
                debug!(
                    agent_id = %self.config.agent_id,
                    work_item_id = %takeover.work_item_id,
                    "Handoff window closed before checkout"
                );
                continue;
            }
            let checked_out = with_deadline(
                "checkout",
                self.timeout(),
                self.engine.checkout(&takeover.work_item_id, &self.config.agent_id),
            )
            .await;
            match checked_out {
                Ok(record) => {
                    metrics::counter!("bazaar_handoffs_taken_over_total").increment(1);
                    debug!(
                        agent_id = %self.config.agent_id,
                        work_item_id = %takeover.work_item_id,
                        source = %takeover.source_agent_id,
                        "Handed-off item checked out"
                    );
                    claimed = Some(record);
                }
                Err(AgentError::Engine(EngineError::NotFound(_) | EngineError::AlreadyTerminal(_))) => {}
                Err(e) => {
                    debug!(agent_id = %self.config.agent_id, work_item_id = %takeover.work_item_id, error = %e, "Takeover not ready");
                    remaining.push(takeover);
                }
            }
        }

        self.takeovers = remaining;
        claimed
    }

    async fn shutdown(&mut self) {
        self.transition(AgentState::Stopping);
        if let Some((cancel, handle)) = self.heartbeat.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(agent_id = %self.config.agent_id, "Heartbeat task ended abnormally: {}", e);
            }
        }

        if self.listed {
            match with_deadline(
                "unpublish",
                self.timeout(),
                self.registry.unpublish(&self.config.agent_id),
            )
            .await
            {
                Ok(()) => info!(agent_id = %self.config.agent_id, "Agent unpublished"),
                Err(e) => warn!(agent_id = %self.config.agent_id, error = %e, "Unpublish on shutdown failed"),
            }
        }
        self.lease_tx.send_replace(None);
        self.transition(AgentState::Stopped);
    }
}

async fn next_envelope(inbox: &mut Option<HandoffInbox>) -> Option<HandoffEnvelope> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Renew every `interval` for as long as a lease is held. Failures are
/// reported to the supervisor, which owns recovery; while no lease is held
/// the task waits for the supervisor to publish a new one.
fn spawn_heartbeat(
    registry: Arc<dyn RegistryApi>,
    agent_id: AgentId,
    interval: Duration,
    timeout: Duration,
    mut lease: watch::Receiver<Option<LeaseId>>,
    signals: mpsc::Sender<HeartbeatSignal>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let current = *lease.borrow_and_update();
            let Some(lease_id) = current else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = lease.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            };

            match with_deadline("renew", timeout, registry.renew(&agent_id, lease_id)).await {
                Ok(()) => debug!(agent_id = %agent_id, lease_id = %lease_id, "Heartbeat"),
                Err(e) => {
                    warn!(agent_id = %agent_id, lease_id = %lease_id, error = %e, "Heartbeat failed");
                    // A full channel already carries a failure for the supervisor
                    let _ = signals.try_send(HeartbeatSignal::Failed(e));
                }
            }
        }
        debug!(agent_id = %agent_id, "Heartbeat task stopped");
    })
}
