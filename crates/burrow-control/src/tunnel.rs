//! Tunnel: owner of one public listener and one agent control channel
//!
//! A tunnel accepts external connections on its public port, asks the
//! agent for a data channel per connection, and bridges the two sockets
//! byte-for-byte. The agent channel may be absent (restored tunnel or
//! temporary agent loss); external connections then get a canned 503 and
//! close. Replacing the agent channel never touches the listener or
//! in-flight pairings.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use burrow_broker_db::entities::connection_record::RecordStatus;
use burrow_broker_db::Store;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::framing::{CONNECT_LINE, CONN_ID_PREFIX};
use crate::gauge::ConnGauge;
use crate::pairing::{DataConn, PendingConns};
use crate::registry::TunnelRegistry;

/// Tunable timeouts; the broker always runs the defaults
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// How long an external connection waits for the agent's data channel
    pub pairing_timeout: Duration,

    /// How often a live bridge commits its byte counters to the store
    pub bytes_flush_interval: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            pairing_timeout: Duration::from_secs(10),
            bytes_flush_interval: Duration::from_secs(5),
        }
    }
}

/// Observable tunnel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Listener open, agent channel present
    AttachedAgent,

    /// Listener open, no agent channel (restored, or agent lost)
    DetachedAgent,

    /// Listener and agent channel released
    Closed,
}

/// Identity of a tunnel, resolved by the control handler or the restorer
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub token_id: Uuid,
    pub public_port: u16,
    pub session_id: Option<Uuid>,
    pub session_record_id: Option<Uuid>,
}

/// The agent control channel's write side.
///
/// The matching read half stays with the control handler's reader task;
/// `closed` wakes that task when the channel is replaced or the tunnel
/// closes, so the whole socket is released, not just the write side.
struct AgentChannel {
    writer: OwnedWriteHalf,
    epoch: u64,
    closed: Arc<Notify>,
}

pub struct Tunnel {
    pub id: String,
    pub token_id: Uuid,
    pub public_port: u16,
    pub session_id: Option<Uuid>,

    /// Companion record created with the session; finalized on close
    session_record_id: Option<Uuid>,

    agent: Mutex<Option<AgentChannel>>,
    agent_epoch: AtomicU64,
    attached: AtomicBool,
    closed: AtomicBool,
    last_conn_nanos: AtomicI64,

    shutdown_tx: watch::Sender<bool>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,

    store: Store,
    pending: Arc<PendingConns>,
    registry: TunnelRegistry,
    gauge: Arc<ConnGauge>,
    config: TunnelConfig,
}

impl Tunnel {
    /// Build a tunnel with no agent channel (DetachedAgent).
    ///
    /// The caller inserts it into the registry and then starts the accept
    /// loop with [`spawn_accept_loop`](Self::spawn_accept_loop); a fresh
    /// tunnel attaches its agent with [`attach_agent`](Self::attach_agent).
    pub fn new(
        spec: TunnelSpec,
        store: Store,
        pending: Arc<PendingConns>,
        registry: TunnelRegistry,
        gauge: Arc<ConnGauge>,
        config: TunnelConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            id: Uuid::new_v4().simple().to_string(),
            token_id: spec.token_id,
            public_port: spec.public_port,
            session_id: spec.session_id,
            session_record_id: spec.session_record_id,
            agent: Mutex::new(None),
            agent_epoch: AtomicU64::new(0),
            attached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_conn_nanos: AtomicI64::new(0),
            shutdown_tx,
            accept_task: StdMutex::new(None),
            store,
            pending,
            registry,
            gauge,
            config,
        })
    }

    pub fn state(&self) -> TunnelState {
        if self.closed.load(Ordering::SeqCst) {
            TunnelState::Closed
        } else if self.attached.load(Ordering::SeqCst) {
            TunnelState::AttachedAgent
        } else {
            TunnelState::DetachedAgent
        }
    }

    /// Epoch of the current agent channel; 0 when none was ever attached.
    pub fn agent_epoch(&self) -> u64 {
        self.agent_epoch.load(Ordering::SeqCst)
    }

    /// Install (or replace) the agent channel.
    ///
    /// `greeting` (the `SUCCESS:` reply) is written on the new channel
    /// while the agent write lock is held, so no `CONNECT` can precede it.
    /// A previous channel is dropped and its reader task woken; the public
    /// listener and in-flight pairings are untouched. Returns the new
    /// epoch and the notifier the caller's reader task must watch.
    pub async fn attach_agent(
        &self,
        mut writer: OwnedWriteHalf,
        greeting: &[u8],
    ) -> std::io::Result<(u64, Arc<Notify>)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "tunnel is closed",
            ));
        }

        let mut agent = self.agent.lock().await;

        writer.write_all(greeting).await?;
        writer.flush().await?;

        let epoch = self.agent_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let closed = Arc::new(Notify::new());
        let replaced = agent.replace(AgentChannel {
            writer,
            epoch,
            closed: closed.clone(),
        });
        self.attached.store(true, Ordering::SeqCst);
        drop(agent);

        if let Some(old) = replaced {
            // Wake the old reader task so the read half is dropped too
            old.closed.notify_waiters();
            info!(
                tunnel_id = %self.id,
                old_epoch = old.epoch,
                "Replaced agent control channel"
            );
        } else {
            info!(tunnel_id = %self.id, epoch, "Agent attached");
        }

        Ok((epoch, closed))
    }

    /// Drop the agent channel if `epoch` still names the current one.
    ///
    /// The epoch guard keeps a stale reader task (whose agent was already
    /// replaced) from detaching the replacement. Returns whether a detach
    /// happened.
    pub async fn detach_agent(&self, epoch: u64) -> bool {
        let mut agent = self.agent.lock().await;
        let is_current = matches!(agent.as_ref(), Some(chan) if chan.epoch == epoch);
        if !is_current {
            return false;
        }

        if let Some(chan) = agent.take() {
            self.attached.store(false, Ordering::SeqCst);
            chan.closed.notify_waiters();
        }
        info!(tunnel_id = %self.id, epoch, "Agent detached");
        true
    }

    /// Start accepting external connections on the public listener.
    pub fn spawn_accept_loop(self: &Arc<Self>, listener: TcpListener) {
        let tunnel = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut shutdown = tunnel.shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let tunnel = Arc::clone(&tunnel);
                            tokio::spawn(async move {
                                tunnel.handle_external(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            error!(
                                tunnel_id = %tunnel.id,
                                "Failed to accept external connection: {}", e
                            );
                        }
                    },
                }
            }
            // Loop exit drops the listener and frees the public port
            debug!(tunnel_id = %tunnel.id, "Accept loop stopped");
        });

        *self.accept_task.lock().unwrap() = Some(handle);
    }

    /// Serve one external connection end to end.
    async fn handle_external(self: Arc<Self>, external: TcpStream, peer: std::net::SocketAddr) {
        let _guard = self.gauge.enter();

        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        debug!(
            tunnel_id = %self.id,
            peer = %peer,
            "New external connection on port {}", self.public_port
        );

        let record_id = self.open_record(&peer).await;

        if !self.attached.load(Ordering::SeqCst) {
            self.reply_unavailable(external, record_id).await;
            return;
        }

        // Strict order: allocate id, reserve slot, notify agent, wait.
        let conn_id = self.next_conn_id();
        let rx = match self.pending.reserve(&conn_id) {
            Ok(rx) => rx,
            Err(e) => {
                // Ids are unique per tunnel; a collision is a bug
                error!(tunnel_id = %self.id, "Pairing reservation failed: {}", e);
                self.finish_record(record_id, RecordStatus::Error, Some(&e.to_string()))
                    .await;
                return;
            }
        };

        if let Err(e) = self.notify_agent(&conn_id).await {
            self.pending.cancel(&conn_id);
            self.finish_record(
                record_id,
                RecordStatus::Error,
                Some(&format!("agent notification failed: {e}")),
            )
            .await;
            return;
        }

        match tokio::time::timeout(self.config.pairing_timeout, rx).await {
            Ok(Ok(data_conn)) => {
                debug!(%conn_id, "Data connection established");
                self.bridge(external, data_conn, record_id).await;
            }
            Ok(Err(_cancelled)) => {
                // Slot cancelled under us: the tunnel is closing
                self.finish_record(
                    record_id,
                    RecordStatus::Closed,
                    Some("tunnel closed before pairing completed"),
                )
                .await;
            }
            Err(_elapsed) => {
                warn!(
                    tunnel_id = %self.id,
                    %conn_id,
                    "Timeout waiting for agent data connection"
                );
                self.pending.cancel(&conn_id);
                self.finish_record(record_id, RecordStatus::Timeout, None).await;
            }
        }
    }

    /// Send `CONNECT` + `CONN_ID` contiguously under the agent write lock,
    /// so concurrent external handlers cannot interleave their lines.
    async fn notify_agent(&self, conn_id: &str) -> std::io::Result<()> {
        let mut agent = self.agent.lock().await;
        let Some(chan) = agent.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no agent attached",
            ));
        };

        let result = async {
            chan.writer.write_all(CONNECT_LINE).await?;
            chan.writer
                .write_all(format!("{CONN_ID_PREFIX}{conn_id}\n").as_bytes())
                .await?;
            chan.writer.flush().await
        }
        .await;

        if let Err(ref e) = result {
            // The agent is gone; drop the channel but keep the listener so
            // a reconnecting agent finds the tunnel in place.
            warn!(
                tunnel_id = %self.id,
                "Agent control write failed ({}), detaching agent", e
            );
            let chan = agent.take().expect("checked above");
            self.attached.store(false, Ordering::SeqCst);
            chan.closed.notify_waiters();
        }

        result
    }

    /// Bridge the external socket and the agent data socket until both
    /// directions complete, then finalize the connection record.
    async fn bridge(&self, external: TcpStream, data: DataConn, record_id: Option<Uuid>) {
        let DataConn { stream, residual } = data;
        let (ext_read, ext_write) = external.into_split();
        let (data_read, data_write) = stream.into_split();

        let bytes_in = Arc::new(AtomicU64::new(0));
        let bytes_out = Arc::new(AtomicU64::new(0));

        let mut inbound = tokio::spawn(copy_half(
            ext_read,
            data_write,
            Vec::new(),
            bytes_in.clone(),
            self.shutdown_tx.subscribe(),
        ));
        let mut outbound = tokio::spawn(copy_half(
            data_read,
            ext_write,
            residual,
            bytes_out.clone(),
            self.shutdown_tx.subscribe(),
        ));

        let flusher = record_id.map(|rid| {
            let store = self.store.clone();
            let interval = self.config.bytes_flush_interval;
            let bytes_in = bytes_in.clone();
            let bytes_out = bytes_out.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // skip the immediate tick
                loop {
                    ticker.tick().await;
                    let bin = bytes_in.load(Ordering::Relaxed) as i64;
                    let bout = bytes_out.load(Ordering::Relaxed) as i64;
                    if let Err(e) = store.update_bytes(rid, bin, bout).await {
                        warn!(record_id = %rid, "Failed to flush byte counters: {}", e);
                    }
                }
            })
        });

        // A clean EOF half-closes and lets the other direction run to its
        // own EOF; an errored or panicked half takes the peer down with it.
        let (inbound_res, outbound_res) = tokio::select! {
            res = &mut inbound => {
                if !matches!(res, Ok(Ok(()))) {
                    outbound.abort();
                }
                let other = outbound.await;
                (res, other)
            }
            res = &mut outbound => {
                if !matches!(res, Ok(Ok(()))) {
                    inbound.abort();
                }
                let other = inbound.await;
                (other, res)
            }
        };
        if let Some(flusher) = flusher {
            flusher.abort();
        }

        let bin = bytes_in.load(Ordering::SeqCst) as i64;
        let bout = bytes_out.load(Ordering::SeqCst) as i64;

        let failure = match (&inbound_res, &outbound_res) {
            (Ok(Err(e)), _) => Some(e.to_string()),
            (_, Ok(Err(e))) => Some(e.to_string()),
            // A panicked half must not take the tunnel down; it becomes an
            // error on the record.
            (Err(join_err), _) | (_, Err(join_err)) => {
                error!(tunnel_id = %self.id, "Bridge half aborted: {}", join_err);
                Some(format!("bridge half aborted: {join_err}"))
            }
            _ => None,
        };

        if let Some(rid) = record_id {
            if let Err(e) = self.store.update_bytes(rid, bin, bout).await {
                warn!(record_id = %rid, "Failed to commit byte counters: {}", e);
            }
        }

        match failure {
            Some(message) => {
                self.finish_record(record_id, RecordStatus::Error, Some(&message))
                    .await;
            }
            None => {
                self.finish_record(record_id, RecordStatus::Closed, None).await;
                if let Some(session_id) = self.session_id {
                    if let Err(e) = self.store.touch_session(session_id).await {
                        warn!(session_id = %session_id, "Failed to touch session: {}", e);
                    }
                }
            }
        }

        debug!(
            tunnel_id = %self.id,
            bytes_in = bin,
            bytes_out = bout,
            "Bridge finished"
        );
    }

    /// Answer an external connection while no agent is attached: a canned
    /// 503 written before any read, so non-HTTP clients just see a short
    /// reply and EOF.
    async fn reply_unavailable(&self, mut external: TcpStream, record_id: Option<Uuid>) {
        let response = unavailable_response(self.public_port);
        if let Err(e) = external.write_all(response.as_bytes()).await {
            debug!(tunnel_id = %self.id, "Failed to write 503 reply: {}", e);
        }
        let _ = external.shutdown().await;

        self.finish_record(
            record_id,
            RecordStatus::Closed,
            Some("external connection to restored port; no agent attached"),
        )
        .await;
    }

    /// Connection ids are `<tunnel_id>-<nanos>` with strictly increasing
    /// nanos per tunnel, so simultaneous accepts cannot collide.
    fn next_conn_id(&self) -> String {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let nanos = next_monotonic_nanos(&self.last_conn_nanos, now);
        format!("{}-{}", self.id, nanos)
    }

    async fn open_record(&self, peer: &std::net::SocketAddr) -> Option<Uuid> {
        let session_id = self.session_id?;
        match self
            .store
            .start_connection_record(
                session_id,
                &peer.ip().to_string(),
                peer.port(),
                self.public_port,
            )
            .await
        {
            Ok(record) => Some(record.id),
            Err(e) => {
                // Store trouble never blocks the bridge
                warn!(tunnel_id = %self.id, "Failed to create connection record: {}", e);
                None
            }
        }
    }

    async fn finish_record(
        &self,
        record_id: Option<Uuid>,
        status: RecordStatus,
        message: Option<&str>,
    ) {
        let Some(rid) = record_id else { return };
        if let Err(e) = self.store.end_connection_record(rid, status, message).await {
            warn!(record_id = %rid, "Failed to end connection record: {}", e);
        }
    }

    /// Release everything: listener, agent channel, pending pairings,
    /// registry entry, session. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(true);

        if let Some(chan) = self.agent.lock().await.take() {
            self.attached.store(false, Ordering::SeqCst);
            chan.closed.notify_waiters();
        }

        self.pending.cancel_tunnel(&self.id);
        self.stop_accepting().await;
        self.registry.remove(&self.id);

        if let Some(record_id) = self.session_record_id {
            if let Err(e) = self
                .store
                .end_connection_record(record_id, RecordStatus::Closed, None)
                .await
            {
                warn!(tunnel_id = %self.id, "Failed to end session record: {}", e);
            }
        }
        if let Some(session_id) = self.session_id {
            if let Err(e) = self.store.end_session(session_id).await {
                warn!(tunnel_id = %self.id, "Failed to end session: {}", e);
            }
        }

        info!(tunnel_id = %self.id, port = self.public_port, "🔚 Tunnel closed");
    }

    /// Immediate termination without store writes; the session stays
    /// active so a later broker start restores this port. Used when the
    /// process must go down as if killed.
    pub async fn abort(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(true);
        if let Some(chan) = self.agent.lock().await.take() {
            self.attached.store(false, Ordering::SeqCst);
            chan.closed.notify_waiters();
        }
        self.pending.cancel_tunnel(&self.id);
        self.stop_accepting().await;
        self.registry.remove(&self.id);
    }

    /// Stop the accept loop and wait for it to drop the listener, so the
    /// public port is actually free when this returns.
    async fn stop_accepting(&self) {
        let handle = self.accept_task.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// Copy one direction of a bridge.
///
/// `initial` is written before anything read from `reader` (the residual
/// bytes the control handler buffered past the `DATA:` line). On EOF the
/// write side is shut down (half-close) so write-shutdown-signalling
/// protocols survive; the other direction keeps running until its own EOF.
/// One 8 KiB buffer per direction; TCP provides the backpressure.
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    initial: Vec<u8>,
    counter: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !initial.is_empty() {
        counter.fetch_add(initial.len() as u64, Ordering::Relaxed);
        writer.write_all(&initial).await?;
    }

    let mut buf = vec![0u8; 8192];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
                Ok(n) => {
                    counter.fetch_add(n as u64, Ordering::Relaxed);
                    writer.write_all(&buf[..n]).await?;
                }
                Err(e) => {
                    let _ = writer.shutdown().await;
                    return Err(e);
                }
            },
        }
    }
}

/// Strictly-increasing nano timestamps per tunnel
fn next_monotonic_nanos(last: &AtomicI64, now: i64) -> i64 {
    let mut prev = last.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(prev + 1);
        match last.compare_exchange_weak(prev, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return candidate,
            Err(observed) => prev = observed,
        }
    }
}

/// The reply for external connections while no agent is attached
fn unavailable_response(port: u16) -> String {
    let body = format!(
        "Public port {port} was restored after a broker restart.\n\
         The tunnel agent is not currently connected.\n\
         Reconnect the agent with the same token to resume service.\n"
    );
    format!(
        "HTTP/1.1 503 Service Unavailable\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
}
