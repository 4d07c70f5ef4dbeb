//! Broker startup and shutdown orchestration
//!
//! Startup order matters: the store must be reachable before anything
//! else, and restoration must publish its listeners before the control
//! listener opens, so agents reconnecting into a restored port find an
//! existing tunnel instead of racing a fresh bind.

use std::net::SocketAddr;
use std::sync::Arc;

use burrow_broker_db::{Store, StoreError};
use burrow_control::{ConnGauge, ControlHandler, PendingConns, Restorer, TunnelRegistry};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;

/// Broker lifecycle errors; all of these are fatal at startup
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("failed to bind control listener on {addr}: {source}")]
    BindControl {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running broker
pub struct Broker {
    config: BrokerConfig,
    store: Store,
    registry: TunnelRegistry,
    gauge: Arc<ConnGauge>,
    control_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Broker {
    /// Open the store, restore listeners, open the control listener.
    pub async fn start(config: BrokerConfig) -> Result<Self, BrokerError> {
        let db = burrow_broker_db::connect(&config.database_url)
            .await
            .map_err(StoreError::from)?;
        burrow_broker_db::migrate(&db)
            .await
            .map_err(StoreError::from)?;
        let store = Store::new(db);
        store.health_check().await?;
        info!("✅ Store connection established");

        let registry = TunnelRegistry::new();
        let pending = Arc::new(PendingConns::new());
        let gauge = Arc::new(ConnGauge::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let restorer = Restorer::new(
            store.clone(),
            registry.clone(),
            pending.clone(),
            gauge.clone(),
            config.bind_addr,
            config.tunnel.clone(),
        );
        let restored = restorer.run().await?;
        if restored > 0 {
            info!("🎉 Restored {} tunnel listener(s)", restored);
        }

        let control_bind = SocketAddr::new(config.bind_addr, config.control_port);
        let control_listener =
            TcpListener::bind(control_bind)
                .await
                .map_err(|source| BrokerError::BindControl {
                    addr: control_bind,
                    source,
                })?;
        let control_addr = control_listener.local_addr()?;
        info!("🚀 burrow broker listening on {}", control_addr);

        let handler = Arc::new(ControlHandler::new(
            store.clone(),
            registry.clone(),
            pending,
            gauge.clone(),
            config.bind_addr,
            config.tunnel.clone(),
            shutdown_rx.clone(),
        ));

        let accept_task = tokio::spawn(Self::accept_loop(
            control_listener,
            handler,
            shutdown_rx,
        ));

        Ok(Self {
            config,
            store,
            registry,
            gauge,
            control_addr,
            shutdown_tx,
            accept_task,
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        handler: Arc<ControlHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept control connection: {}", e);
                    }
                },
            }
        }
        debug!("Control accept loop stopped");
    }

    /// Address the control listener actually bound (resolves port 0).
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    /// Stop accepting, close every tunnel, and drain in-flight
    /// connections up to the configured deadline.
    pub async fn shutdown(self) {
        info!("Shutting down broker...");
        let _ = self.shutdown_tx.send(true);
        self.accept_task.abort();
        let _ = self.accept_task.await;

        for tunnel in self.registry.list() {
            tunnel.close().await;
        }

        if tokio::time::timeout(self.config.drain_timeout, self.gauge.drained())
            .await
            .is_err()
        {
            warn!(
                "Drain deadline reached with {} connection(s) still open",
                self.gauge.active()
            );
        }

        info!("✅ burrow broker stopped");
    }

    /// Terminate immediately without finalizing sessions, as if the
    /// process had been killed. Active sessions stay active in the store
    /// and are picked up by restoration on the next start.
    pub async fn abort(self) {
        let _ = self.shutdown_tx.send(true);
        self.accept_task.abort();
        let _ = self.accept_task.await;
        for tunnel in self.registry.list() {
            tunnel.abort().await;
        }
    }

    /// Run until `signal` resolves (typically ctrl-c), then shut down.
    pub async fn run_until<F>(self, signal: F)
    where
        F: std::future::Future<Output = ()>,
    {
        signal.await;
        self.shutdown().await;
    }
}
