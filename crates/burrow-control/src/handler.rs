//! Control connection handler
//!
//! Every inbound socket on the control port is either an agent data
//! connection (`DATA:<conn_id>` first line, handed to the pairing table)
//! or an agent authentication (token secret + reported local port, which
//! opens, reattaches, or replaces a tunnel).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use burrow_broker_db::{Store, StoreError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::framing::{self, AUTH_FAILED_REPLY, DATA_PREFIX, ERROR_PREFIX, SUCCESS_PREFIX};
use crate::gauge::ConnGauge;
use crate::net::bind_public_listener;
use crate::pairing::{DataConn, PendingConns};
use crate::registry::TunnelRegistry;
use crate::tunnel::{Tunnel, TunnelConfig, TunnelSpec};

/// Handles inbound connections on the broker control port
pub struct ControlHandler {
    store: Store,
    registry: TunnelRegistry,
    pending: Arc<PendingConns>,
    gauge: Arc<ConnGauge>,
    bind_ip: IpAddr,
    tunnel_config: TunnelConfig,
    shutdown: watch::Receiver<bool>,
}

impl ControlHandler {
    pub fn new(
        store: Store,
        registry: TunnelRegistry,
        pending: Arc<PendingConns>,
        gauge: Arc<ConnGauge>,
        bind_ip: IpAddr,
        tunnel_config: TunnelConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            registry,
            pending,
            gauge,
            bind_ip,
            tunnel_config,
            shutdown,
        }
    }

    /// Serve one control-port connection to completion.
    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "New control connection");

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let first_line = match framing::read_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                // Malformed framing closes the connection with no reply
                debug!(peer = %peer, "Dropping control connection: {}", e);
                return;
            }
        };

        if let Some(conn_id) = first_line.strip_prefix(DATA_PREFIX) {
            self.route_data_connection(conn_id, reader, write_half, peer);
            return;
        }

        self.authenticate_agent(first_line, reader, write_half, peer)
            .await;
    }

    /// Reassemble the socket and hand it to the pairing slot. Bytes the
    /// reader buffered past the `DATA:` line travel with it.
    fn route_data_connection(
        &self,
        conn_id: &str,
        reader: BufReader<OwnedReadHalf>,
        write_half: OwnedWriteHalf,
        peer: SocketAddr,
    ) {
        debug!(peer = %peer, conn_id, "Data connection received");

        let residual = reader.buffer().to_vec();
        let read_half = reader.into_inner();
        match read_half.reunite(write_half) {
            Ok(stream) => {
                if !self
                    .pending
                    .deliver(conn_id, DataConn::with_residual(stream, residual))
                {
                    debug!(conn_id, "Unmatched data connection closed");
                }
            }
            Err(e) => error!(conn_id, "Failed to reunite data socket halves: {}", e),
        }
    }

    /// Token authentication and tunnel setup, then the agent reader loop.
    async fn authenticate_agent(
        &self,
        secret: String,
        mut reader: BufReader<OwnedReadHalf>,
        mut write_half: OwnedWriteHalf,
        peer: SocketAddr,
    ) {
        // Second line: the agent's local service port, informational only
        let reported_local_port = match framing::read_line(&mut reader).await {
            Ok(Some(line)) => line.parse::<u16>().unwrap_or(0),
            Ok(None) => return,
            Err(e) => {
                debug!(peer = %peer, "Dropping control connection: {}", e);
                return;
            }
        };

        let grant = match self.store.authenticate(&secret).await {
            Ok(grant) => grant,
            Err(e) => {
                match e {
                    StoreError::TokenNotFound | StoreError::TokenExpired(_) => {
                        // Audit line: rejected authentication attempt
                        warn!(peer = %peer, "❌ Authentication failed: {}", e);
                    }
                    _ => error!(peer = %peer, "Authentication query failed: {}", e),
                }
                let _ = write_half.write_all(AUTH_FAILED_REPLY).await;
                return;
            }
        };

        let token_id = grant.token.id;
        let public_port = u16::try_from(grant.port_assignment.port).unwrap_or(0);
        info!(
            peer = %peer,
            token = %grant.token.name,
            port = public_port,
            "✅ Token authenticated"
        );

        let existing = self.registry.find_by_token_and_port(token_id, public_port);
        let (tunnel, epoch, closed) = match existing {
            Some(tunnel) => {
                // Reattach to a restored tunnel, or replace the agent on a
                // live one; the public listener stays as it is.
                let greeting = success_line(&tunnel.id, public_port);
                let (epoch, closed) =
                    match tunnel.attach_agent(write_half, greeting.as_bytes()).await {
                        Ok(attached) => attached,
                        Err(e) => {
                            debug!(peer = %peer, "Agent gone before attach: {}", e);
                            return;
                        }
                    };

                if let Some(session_id) = tunnel.session_id {
                    // The session is live again; keep it out of the sweep
                    if let Err(e) = self.store.touch_session(session_id).await {
                        warn!(session_id = %session_id, "Failed to touch session: {}", e);
                    }
                }

                info!(
                    tunnel_id = %tunnel.id,
                    port = public_port,
                    local_port = reported_local_port,
                    "🔄 Agent reconnected to tunnel"
                );
                (tunnel, epoch, closed)
            }
            None => {
                match self
                    .open_tunnel(&grant, public_port, write_half, reported_local_port, peer)
                    .await
                {
                    Some(opened) => opened,
                    None => return,
                }
            }
        };

        self.agent_read_loop(reader, tunnel, epoch, closed).await;
    }

    /// Bind the assigned port, start the session, build and register the
    /// tunnel, greet the agent.
    async fn open_tunnel(
        &self,
        grant: &burrow_broker_db::AuthGrant,
        public_port: u16,
        mut write_half: OwnedWriteHalf,
        reported_local_port: u16,
        peer: SocketAddr,
    ) -> Option<(Arc<Tunnel>, u64, Arc<Notify>)> {
        let bind_addr = SocketAddr::new(self.bind_ip, public_port);
        let listener = match bind_public_listener(bind_addr) {
            Ok(listener) => listener,
            Err(e) => {
                warn!(port = public_port, "Failed to bind public listener: {}", e);
                let reply = format!("{ERROR_PREFIX}failed to bind port {public_port}: {e}\n");
                let _ = write_half.write_all(reply.as_bytes()).await;
                return None;
            }
        };

        // A session failure is logged and the tunnel runs unrecorded; the
        // store must never take a tunnel down.
        let (session_id, session_record_id) = match self
            .store
            .start_session(
                grant.token.team_id,
                grant.token.id,
                grant.port_assignment.id,
                &peer.ip().to_string(),
                public_port,
                "tcp",
            )
            .await
        {
            Ok((session, record)) => (Some(session.id), Some(record.id)),
            Err(e) => {
                warn!(port = public_port, "Failed to start session: {}", e);
                (None, None)
            }
        };

        let tunnel = Tunnel::new(
            TunnelSpec {
                token_id: grant.token.id,
                public_port,
                session_id,
                session_record_id,
            },
            self.store.clone(),
            self.pending.clone(),
            self.registry.clone(),
            self.gauge.clone(),
            self.tunnel_config.clone(),
        );

        if let Err(e) = self.registry.insert(tunnel.clone()) {
            // Should be unreachable: the lookup above ran moments ago.
            // Treat as an assertion failure, drop this tunnel, carry on.
            error!(port = public_port, "Registry insert failed: {}", e);
            tunnel.close().await;
            let reply = format!("{ERROR_PREFIX}tunnel already registered\n");
            let _ = write_half.write_all(reply.as_bytes()).await;
            return None;
        }

        tunnel.spawn_accept_loop(listener);

        let greeting = success_line(&tunnel.id, public_port);
        let (epoch, closed) = match tunnel.attach_agent(write_half, greeting.as_bytes()).await {
            Ok(attached) => attached,
            Err(e) => {
                debug!(peer = %peer, "Agent gone before attach: {}", e);
                // Leave the tunnel registered and detached; the agent can
                // reconnect into it like a restored one.
                return None;
            }
        };

        info!(
            tunnel_id = %tunnel.id,
            port = public_port,
            local_port = reported_local_port,
            "🎯 Tunnel created"
        );

        Some((tunnel, epoch, closed))
    }

    /// Sit on the agent control socket until it goes away.
    ///
    /// No agent-to-broker framing exists today beyond clean close, so the
    /// loop only watches for EOF/errors (detach), replacement, and broker
    /// shutdown.
    async fn agent_read_loop(
        &self,
        mut reader: BufReader<OwnedReadHalf>,
        tunnel: Arc<Tunnel>,
        epoch: u64,
        closed: Arc<Notify>,
    ) {
        let mut shutdown = self.shutdown.clone();
        let mut buf = [0u8; 1024];

        loop {
            if tunnel.agent_epoch() != epoch {
                // Replaced while we were processing; stop reading so the
                // old socket is fully released
                break;
            }

            tokio::select! {
                _ = closed.notified() => break,
                _ = shutdown.changed() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        if tunnel.detach_agent(epoch).await {
                            info!(tunnel_id = %tunnel.id, "Agent control connection closed");
                        }
                        break;
                    }
                    Ok(_) => {
                        // Unexpected bytes from the agent; ignore
                    }
                    Err(e) => {
                        if tunnel.detach_agent(epoch).await {
                            warn!(tunnel_id = %tunnel.id, "Agent control read failed: {}", e);
                        }
                        break;
                    }
                },
            }
        }
    }
}

fn success_line(tunnel_id: &str, public_port: u16) -> String {
    format!("{SUCCESS_PREFIX}{tunnel_id}:{public_port}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_line_format() {
        assert_eq!(success_line("abc123", 12345), "SUCCESS:abc123:12345\n");
    }
}
