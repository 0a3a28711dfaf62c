//! Gateway assembly: builds every component from a [`GateConfig`] and runs
//! the HTTP surface alongside the expiry sweeper.

use crate::api::{self, ApiState};
use crate::authority::{CapabilityAuthority, DiscordAuthority, DiscordClient};
use crate::config::GateConfig;
use crate::entitlement::{EngineSettings, EntitlementEngine};
use crate::error::{Error, Result};
use crate::event::{create_event_channel, GateEvent, GateEventsChannel, GateEventsSender};
use crate::invoice::InvoiceService;
use crate::network::{is_valid_address, NetworkFamily, NetworkRegistry};
use crate::payment::{Facilitator, HttpFacilitator, PaymentGateway};
use crate::store::{LocalStore, Store};
use crate::sweeper::ExpirySweeper;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Builder for constructing a gateway.
pub struct GateBuilder {
    config: GateConfig,
    authority: Option<Arc<dyn CapabilityAuthority>>,
    facilitator: Option<Arc<dyn Facilitator>>,
    families: Vec<Arc<dyn NetworkFamily>>,
}

impl GateBuilder {
    /// Create a new builder with the given configuration.
    #[must_use]
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            authority: None,
            facilitator: None,
            families: Vec::new(),
        }
    }

    /// Use `authority` instead of the Discord client.
    #[must_use]
    pub fn with_authority(mut self, authority: Arc<dyn CapabilityAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Use `facilitator` instead of the HTTP facilitator.
    #[must_use]
    pub fn with_facilitator(mut self, facilitator: Arc<dyn Facilitator>) -> Self {
        self.facilitator = Some(facilitator);
        self
    }

    /// Replace the JSON-RPC implementation of one network family.
    #[must_use]
    pub fn with_family(mut self, family: Arc<dyn NetworkFamily>) -> Self {
        self.families.push(family);
        self
    }

    /// Build the gateway: open the store, seed the catalog and wire the
    /// services.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the store cannot
    /// be opened or no authority is available.
    pub async fn build(self) -> Result<RunningGate> {
        let config = self.config;
        config.validate()?;
        info!(
            "Building rolegate: {} networks, {} groups, default network {}",
            config.networks.len(),
            config.groups.len(),
            config.default_network
        );

        let store = match config.storage_path() {
            Some(path) => {
                std::fs::create_dir_all(&config.root_dir)?;
                Arc::new(LocalStore::open(path).await?)
            }
            None => {
                warn!("Persistence disabled, grants will not survive a restart");
                Arc::new(LocalStore::in_memory())
            }
        };
        seed_catalog(&config, store.as_ref()).await?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("rolegate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("HTTP client: {e}")))?;

        let mut registry = NetworkRegistry::with_rpc(config.networks.clone(), http.clone());
        for family in self.families {
            registry = registry.with_family(family);
        }

        let facilitator: Arc<dyn Facilitator> = match self.facilitator {
            Some(facilitator) => facilitator,
            None => Arc::new(HttpFacilitator::new(
                http.clone(),
                config.facilitator.url.clone(),
            )),
        };
        let gateway = PaymentGateway::new(facilitator, &config.facilitator);

        let authority: Arc<dyn CapabilityAuthority> = match self.authority {
            Some(authority) => authority,
            None => {
                let client = DiscordClient::from_config(&config.authority, http)?;
                Arc::new(DiscordAuthority::new(Arc::new(client)))
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = create_event_channel();

        let engine = EntitlementEngine::new(
            store.clone(),
            registry,
            gateway,
            Arc::clone(&authority),
            events_tx.clone(),
            EngineSettings::from_config(&config),
        );
        let invoices = InvoiceService::new(
            store.clone(),
            engine.accounts().clone(),
            Arc::clone(&authority),
            events_tx.clone(),
            config.default_network.clone(),
        );
        let sweeper = Arc::new(ExpirySweeper::new(
            store.clone(),
            authority,
            events_tx.clone(),
            config.sweep_interval(),
        ));

        Ok(RunningGate {
            config,
            store,
            engine,
            invoices,
            sweeper,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            events_tx,
            events_rx: Some(events_rx),
        })
    }
}

/// Write the configured groups and resources into the store.
///
/// Receivers are checked against their network's address format. A
/// resource whose terms cannot change because grants reference it keeps its
/// stored terms.
async fn seed_catalog(config: &GateConfig, store: &dyn Store) -> Result<()> {
    for group in &config.groups {
        for (network, address) in &group.receivers {
            let Some(network_config) = config.network(network) else {
                return Err(Error::Config(format!(
                    "group '{}' names unknown network '{network}'",
                    group.id
                )));
            };
            if !is_valid_address(network_config.kind, address) {
                return Err(Error::Config(format!(
                    "group '{}': '{address}' is not a valid {network} address",
                    group.id
                )));
            }
        }

        let (record, resources) = group.to_records();
        store.upsert_group(record).await?;
        for resource in resources {
            let id = resource.id.clone();
            match store.upsert_resource(resource).await {
                Ok(()) => {}
                Err(Error::Conflict(reason)) => {
                    warn!("Keeping stored terms for resource '{id}': {reason}");
                }
                Err(e) => return Err(e),
            }
        }
    }
    info!("Catalog seeded with {} groups", config.groups.len());
    Ok(())
}

/// A built gateway.
pub struct RunningGate {
    config: GateConfig,
    store: Arc<LocalStore>,
    engine: EntitlementEngine,
    invoices: InvoiceService,
    sweeper: Arc<ExpirySweeper>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: GateEventsSender,
    events_rx: Option<GateEventsChannel>,
}

impl RunningGate {
    /// The configuration the gateway was built from.
    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// The store.
    #[must_use]
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// The entitlement engine.
    #[must_use]
    pub fn engine(&self) -> &EntitlementEngine {
        &self.engine
    }

    /// The invoice service.
    #[must_use]
    pub fn invoices(&self) -> &InvoiceService {
        &self.invoices
    }

    /// The expiry sweeper.
    #[must_use]
    pub fn sweeper(&self) -> &Arc<ExpirySweeper> {
        &self.sweeper
    }

    /// The HTTP router over this gateway's services.
    pub fn router(&self) -> axum::Router {
        api::router(ApiState::new(
            self.engine.clone(),
            self.invoices.clone(),
            self.store.clone(),
            self.config.api_key.clone(),
        ))
    }

    /// Get a receiver for gateway events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<GateEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to gateway events.
    #[must_use]
    pub fn subscribe_events(&self) -> GateEventsChannel {
        self.events_tx.subscribe()
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or the server fails.
    pub async fn run(&mut self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.serve(listener).await
    }

    /// Serve on `listener` until shutdown is requested or Ctrl-C arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails.
    pub async fn serve(&mut self, listener: TcpListener) -> Result<()> {
        let addr: SocketAddr = listener.local_addr()?;
        info!("Starting rolegate on {addr}");
        let _ = self.events_tx.send(GateEvent::Started);

        let sweeper = if self.config.sweeper.enabled {
            Some(tokio::spawn(
                Arc::clone(&self.sweeper).run(self.shutdown_rx.clone()),
            ))
        } else {
            info!("Expiry sweeper disabled");
            None
        };

        let signal = wait_for_shutdown(self.shutdown_rx.clone(), Arc::clone(&self.shutdown_tx));
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await;

        // Stops the sweeper when the server exits on its own.
        self.shutdown();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!("Sweeper task ended abnormally: {e}");
            }
        }

        let _ = self.events_tx.send(GateEvent::ShuttingDown);
        info!("Gateway shutdown complete");
        served.map_err(Error::from)
    }

    /// Request the gateway to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Handle that requests shutdown from another task.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown_tx))
    }
}

/// Requests shutdown of a [`RunningGate`].
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    /// Request shutdown.
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

async fn wait_for_shutdown(
    mut shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, initiating shutdown");
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }
}
