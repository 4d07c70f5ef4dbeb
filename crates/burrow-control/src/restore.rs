//! Startup restoration of public listeners
//!
//! Runs exactly once, before the control listener opens, so agents that
//! reconnect right after a broker restart find their tunnel already in the
//! registry. Restoration is best-effort: one port failing does not stop
//! the others.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use burrow_broker_db::{Store, StoreError};
use chrono::Duration;
use tracing::{info, warn};

use crate::gauge::ConnGauge;
use crate::net::bind_public_listener;
use crate::pairing::PendingConns;
use crate::registry::TunnelRegistry;
use crate::tunnel::{Tunnel, TunnelConfig, TunnelSpec};

/// Sessions quiet for longer than this are swept before restoration
const STALE_SESSION_MINUTES: i64 = 5;

/// Rebuilds listeners for sessions that were active when the broker died
pub struct Restorer {
    store: Store,
    registry: TunnelRegistry,
    pending: Arc<PendingConns>,
    gauge: Arc<ConnGauge>,
    bind_ip: IpAddr,
    tunnel_config: TunnelConfig,
}

impl Restorer {
    pub fn new(
        store: Store,
        registry: TunnelRegistry,
        pending: Arc<PendingConns>,
        gauge: Arc<ConnGauge>,
        bind_ip: IpAddr,
        tunnel_config: TunnelConfig,
    ) -> Self {
        Self {
            store,
            registry,
            pending,
            gauge,
            bind_ip,
            tunnel_config,
        }
    }

    /// Sweep stale sessions, then reopen a listener per still-active port.
    /// Returns how many listeners were restored.
    pub async fn run(&self) -> Result<usize, StoreError> {
        info!("🔄 Checking for active sessions to restore...");

        match self
            .store
            .sweep_stale(Duration::minutes(STALE_SESSION_MINUTES))
            .await
        {
            Ok(0) => {}
            Ok(swept) => info!("🧹 Swept {} stale session(s)", swept),
            Err(e) => warn!("Failed to sweep stale sessions: {}", e),
        }

        let by_port = self.store.restore_active().await?;
        if by_port.is_empty() {
            info!("No active sessions to restore");
            return Ok(0);
        }

        let mut restored = 0;
        for (port, sessions) in by_port {
            // A port is owned by one token, so the first session per port
            // is authoritative
            let Some(first) = sessions.first() else {
                continue;
            };

            let details = match self.store.session_details(first.id).await {
                Ok(details) => details,
                Err(e) => {
                    warn!(port, "Failed to load session details: {}", e);
                    self.give_up_session(first.id).await;
                    continue;
                }
            };

            let addr = SocketAddr::new(self.bind_ip, port);
            let listener = match bind_public_listener(addr) {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(port, "Failed to restore listener: {}", e);
                    self.give_up_session(first.id).await;
                    continue;
                }
            };

            let tunnel = Tunnel::new(
                TunnelSpec {
                    token_id: details.token.id,
                    public_port: port,
                    session_id: Some(details.session.id),
                    session_record_id: None,
                },
                self.store.clone(),
                self.pending.clone(),
                self.registry.clone(),
                self.gauge.clone(),
                self.tunnel_config.clone(),
            );

            if let Err(e) = self.registry.insert(tunnel.clone()) {
                warn!(port, "Skipping restored port: {}", e);
                continue;
            }
            tunnel.spawn_accept_loop(listener);

            restored += 1;
            info!(
                port,
                sessions = sessions.len(),
                tunnel_id = %tunnel.id,
                "✅ Restored tunnel listener (waiting for agent)"
            );
        }

        Ok(restored)
    }

    /// A session that cannot be restored is flipped to inactive so the
    /// next startup does not retry it forever.
    async fn give_up_session(&self, session_id: uuid::Uuid) {
        if let Err(e) = self.store.end_session(session_id).await {
            warn!(session_id = %session_id, "Failed to end unrestorable session: {}", e);
        }
    }
}
