// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Registry daemon: wires the lease store, liveness index, marketplace,
//! handoff coordinator and conflict resolver together and serves them.

use anyhow::{Context, Result};
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use bazaar_core::application::{AgentMarketplace, HandoffCoordinator, RegistryService};
use bazaar_core::domain::lease::LeaseStore;
use bazaar_core::domain::node_config::MarketplaceConfigManifest;
use bazaar_core::infrastructure::event_bus::{DomainEvent, EventBus, EventBusError, EventReceiver};
use bazaar_core::infrastructure::handoff_signer::HandoffSigner;
use bazaar_core::infrastructure::lease_store::InMemoryLeaseStore;
use bazaar_core::infrastructure::liveness_index::LivenessIndex;
use bazaar_core::presentation::api::registry_router;
use bazaar_swarm::application::ConflictResolver;
use bazaar_swarm::presentation::api::conflict_router;

const EVENT_BUS_CAPACITY: usize = 4096;
const CONFLICT_TICK: Duration = Duration::from_secs(1);

/// Everything a running registry owns. Background tasks stop when
/// [`Daemon::shutdown`] is called.
pub struct Daemon {
    pub registry: RegistryService,
    pub conflicts: Arc<ConflictResolver>,
    pub store: Arc<InMemoryLeaseStore>,
    pub events: EventBus,
    router: Router,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Build the service graph and start its background tasks. Must be called
    /// inside a Tokio runtime.
    pub fn build(config: &MarketplaceConfigManifest) -> Result<Self> {
        let spec = &config.spec;
        let cancel = CancellationToken::new();
        let events = EventBus::new(EVENT_BUS_CAPACITY);
        let mut tasks = Vec::new();

        tasks.push(spawn_audit_log(events.subscribe(), cancel.clone()));

        let store = Arc::new(InMemoryLeaseStore::new(&spec.lease_store));
        tasks.push(
            store
                .clone()
                .spawn_reaper(spec.lease_store.reaper_interval, cancel.child_token()),
        );

        let index = Arc::new(LivenessIndex::new(
            spec.registry.key_prefix.clone(),
            spec.liveness.clone(),
            events.clone(),
        ));
        let dyn_store: Arc<dyn LeaseStore> = store.clone();
        tasks.push(index.spawn(dyn_store.clone(), cancel.child_token()));

        let schema = config.capability_schema().context("Invalid capability schema")?;
        let marketplace = Arc::new(AgentMarketplace::new(
            dyn_store,
            index,
            schema,
            spec.registry.clone(),
            events.clone(),
        ));

        let signer = match config.resolve_signing_secret()? {
            Some(secret) => HandoffSigner::new(&secret),
            None => HandoffSigner::ephemeral(),
        };
        let handoff = Arc::new(HandoffCoordinator::new(
            marketplace.clone(),
            signer,
            spec.handoff.token_ttl,
            events.clone(),
        ));
        tasks.push(handoff.spawn_sweeper(spec.handoff.sweep_interval, cancel.child_token()));

        let conflicts = Arc::new(ConflictResolver::new());
        tasks.push(conflicts.spawn_ticker(CONFLICT_TICK, cancel.child_token()));

        let registry = RegistryService::new(marketplace, handoff);
        let router = registry_router(registry.clone())
            .merge(conflict_router(conflicts.clone()).layer(TraceLayer::new_for_http()));

        Ok(Self {
            registry,
            conflicts,
            store,
            events,
            router,
            cancel,
            tasks,
        })
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

/// `bazaar serve`: run the registry in the foreground until Ctrl+C or SIGTERM.
pub async fn start_daemon(config_path: Option<PathBuf>, host: Option<String>, port: Option<u16>) -> Result<()> {
    let config = MarketplaceConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    info!(
        name = %config.metadata.name,
        capabilities = config.spec.registry.capabilities.len(),
        "Bazaar registry starting (PID: {})",
        std::process::id()
    );

    let addr = format!(
        "{}:{}",
        host.unwrap_or_else(|| config.spec.network.bind_address.clone()),
        port.unwrap_or(config.spec.network.port)
    );

    let daemon = Daemon::build(&config)?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Registry listening on {}", addr);

    let served = axum::serve(listener, daemon.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed");

    info!("Registry shutting down");
    daemon.shutdown().await;
    served
}

/// Log every domain event as an audit record.
fn spawn_audit_log(mut events: EventReceiver, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => audit(&event),
                Err(EventBusError::Lagged(n)) => warn!(dropped = n, "Audit log fell behind"),
                Err(EventBusError::Closed) => break,
                Err(EventBusError::Empty) => {}
            }
        }
    })
}

fn audit(event: &DomainEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(target: "bazaar::audit", event = %json, "Audit"),
        Err(e) => error!("Failed to encode audit event: {}", e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
