//! Tunnel registry
//!
//! Process-wide mapping from tunnel id to [`Tunnel`], with a secondary
//! index by (token, public port). One lock guards both maps, so lookups
//! and mutations are linearizable; the lock is never held across I/O.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use uuid::Uuid;

use crate::tunnel::Tunnel;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a tunnel already exists for token {token_id} on port {port}")]
    DuplicateTunnel { token_id: Uuid, port: u16 },
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Arc<Tunnel>>,
    by_token_port: HashMap<(Uuid, u16), String>,
}

/// Registry of active tunnels, at most one per (token, public port)
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    /// Insert a tunnel; fails if its (token, port) key is already taken.
    pub fn insert(&self, tunnel: Arc<Tunnel>) -> Result<(), RegistryError> {
        let key = (tunnel.token_id, tunnel.public_port);
        let mut inner = self.inner.write().unwrap();

        if inner.by_token_port.contains_key(&key) {
            return Err(RegistryError::DuplicateTunnel {
                token_id: key.0,
                port: key.1,
            });
        }

        inner.by_token_port.insert(key, tunnel.id.clone());
        inner.by_id.insert(tunnel.id.clone(), tunnel);
        Ok(())
    }

    pub fn get(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.inner.read().unwrap().by_id.get(tunnel_id).cloned()
    }

    pub fn find_by_token_and_port(&self, token_id: Uuid, port: u16) -> Option<Arc<Tunnel>> {
        let inner = self.inner.read().unwrap();
        let tunnel_id = inner.by_token_port.get(&(token_id, port))?;
        inner.by_id.get(tunnel_id).cloned()
    }

    /// Remove a tunnel by id, dropping the registry's strong reference.
    pub fn remove(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        let mut inner = self.inner.write().unwrap();
        let tunnel = inner.by_id.remove(tunnel_id)?;
        inner
            .by_token_port
            .remove(&(tunnel.token_id, tunnel.public_port));
        Some(tunnel)
    }

    pub fn list(&self) -> Vec<Arc<Tunnel>> {
        self.inner.read().unwrap().by_id.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gauge::ConnGauge;
    use crate::pairing::PendingConns;
    use crate::tunnel::{Tunnel, TunnelConfig, TunnelSpec, TunnelState};
    use burrow_broker_db::{connect, migrate, Store};

    async fn make_tunnel(registry: &TunnelRegistry, token_id: Uuid, port: u16) -> Arc<Tunnel> {
        let db = connect("sqlite::memory:").await.unwrap();
        migrate(&db).await.unwrap();
        Tunnel::new(
            TunnelSpec {
                token_id,
                public_port: port,
                session_id: None,
                session_record_id: None,
            },
            Store::new(db),
            Arc::new(PendingConns::new()),
            registry.clone(),
            Arc::new(ConnGauge::default()),
            TunnelConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_insert_and_find_by_token_and_port() {
        let registry = TunnelRegistry::new();
        let token_id = Uuid::new_v4();
        let tunnel = make_tunnel(&registry, token_id, 12345).await;

        registry.insert(tunnel.clone()).unwrap();
        assert_eq!(registry.count(), 1);

        let found = registry.find_by_token_and_port(token_id, 12345).unwrap();
        assert_eq!(found.id, tunnel.id);
        assert!(registry.find_by_token_and_port(token_id, 12346).is_none());
        assert!(registry
            .find_by_token_and_port(Uuid::new_v4(), 12345)
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let registry = TunnelRegistry::new();
        let token_id = Uuid::new_v4();
        let first = make_tunnel(&registry, token_id, 12345).await;
        let second = make_tunnel(&registry, token_id, 12345).await;

        registry.insert(first).unwrap();
        let result = registry.insert(second);
        assert!(matches!(
            result,
            Err(RegistryError::DuplicateTunnel { port: 12345, .. })
        ));
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_remove_clears_both_indexes() {
        let registry = TunnelRegistry::new();
        let token_id = Uuid::new_v4();
        let tunnel = make_tunnel(&registry, token_id, 12345).await;

        registry.insert(tunnel.clone()).unwrap();
        let removed = registry.remove(&tunnel.id).unwrap();
        assert_eq!(removed.id, tunnel.id);

        assert_eq!(registry.count(), 0);
        assert!(registry.find_by_token_and_port(token_id, 12345).is_none());
        assert!(registry.remove(&tunnel.id).is_none());

        // The key is free again
        let replacement = make_tunnel(&registry, token_id, 12345).await;
        registry.insert(replacement).unwrap();
    }

    #[tokio::test]
    async fn test_close_removes_tunnel_from_registry() {
        let registry = TunnelRegistry::new();
        let tunnel = make_tunnel(&registry, Uuid::new_v4(), 12345).await;

        registry.insert(tunnel.clone()).unwrap();
        tunnel.close().await;

        assert_eq!(registry.count(), 0);
        assert_eq!(tunnel.state(), TunnelState::Closed);
    }
}
