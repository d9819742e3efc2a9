//! The routing core between inbound protocol handlers and the outbound
//! transport of a Point.
//!
//! TCP sessions are keyed by connection: every accepted stream gets its own
//! outbound connection and relay tasks. UDP sessions are keyed by
//! destination and return channel, so repeated datagrams from one client
//! association to one destination share a single outbound socket, while two
//! associations never see each other's responses.

use crate::buffer::{Buffer, BufferPool, MAX_DATAGRAM_SIZE};
use crate::destination::{Destination, Packet};
use crate::error::{ProxyError, Result};
use crate::inbound::PacketSink;
use crate::outbound::{DatagramConn, OutboundHandler};
use crate::relay::{lock, spawn_session, BoxedStream, SessionHandle, SessionTable};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// API the inbound handlers use to submit traffic.
#[async_trait]
pub trait PacketDispatcher: Send + Sync {
    /// Connects to `destination` without starting the relay, so the inbound
    /// protocol can report success or failure to its client first.
    async fn establish(&self, destination: Destination) -> Result<OutboundLink>;

    /// Connects to `destination` and relays `inbound` through it. Returns once
    /// the relay tasks are running.
    async fn dispatch_to_outbound(
        &self,
        destination: Destination,
        inbound: BoxedStream,
    ) -> Result<SessionHandle> {
        let link = self.establish(destination).await?;
        Ok(link.relay(inbound))
    }

    /// Forwards one datagram. Responses come back through `reply`. Never waits
    /// on the network.
    fn dispatch(&self, packet: Packet, reply: Arc<dyn PacketSink>);

    fn stats(&self) -> DispatcherStats;

    /// Signals every live session to stop and rejects new traffic.
    fn close(&self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub tcp_sessions: usize,
    pub udp_sessions: usize,
}

/// An established outbound stream waiting for its inbound counterpart.
pub struct OutboundLink {
    destination: Destination,
    stream: BoxedStream,
    sessions: Arc<SessionTable>,
    pool: Arc<BufferPool>,
}

impl OutboundLink {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Starts relaying between `inbound` and the outbound stream.
    pub fn relay(self, inbound: BoxedStream) -> SessionHandle {
        spawn_session(self.sessions, self.pool, self.destination, inbound, self.stream)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Outbound connect deadline
    pub connect_timeout: Duration,
    /// A UDP session with no traffic in either direction for this long is dropped
    pub udp_idle_timeout: Duration,
    /// Datagrams queued per UDP session before new ones are dropped
    pub udp_queue_depth: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            udp_idle_timeout: Duration::from_secs(60),
            udp_queue_depth: 64,
        }
    }
}

struct UdpEntry {
    id: u64,
    reply: Arc<dyn PacketSink>,
    queue: mpsc::Sender<Buffer>,
}

/// Dispatcher serving every session of a Point through one outbound handler.
pub struct DefaultDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    outbound: Arc<dyn OutboundHandler>,
    pool: Arc<BufferPool>,
    options: DispatcherOptions,
    sessions: Arc<SessionTable>,
    udp: Mutex<HashMap<Destination, Vec<UdpEntry>>>,
    next_udp_id: AtomicU64,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

fn same_sink(a: &Arc<dyn PacketSink>, b: &Arc<dyn PacketSink>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl DefaultDispatcher {
    pub fn new(outbound: Arc<dyn OutboundHandler>, pool: Arc<BufferPool>, options: DispatcherOptions) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            inner: Arc::new(Inner {
                outbound,
                pool,
                options,
                sessions: Arc::new(SessionTable::new(shutdown.clone())),
                udp: Mutex::new(HashMap::new()),
                next_udp_id: AtomicU64::new(1),
                shutdown,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn outbound_name(&self) -> &str {
        self.inner.outbound.name()
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.inner.pool
    }
}

#[async_trait]
impl PacketDispatcher for DefaultDispatcher {
    async fn establish(&self, destination: Destination) -> Result<OutboundLink> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(ProxyError::Closed);
        }

        debug!("Connecting to {} via {}", destination, inner.outbound.name());
        let stream = timeout(inner.options.connect_timeout, inner.outbound.connect_stream(&destination))
            .await
            .map_err(|_| ProxyError::ConnectionFailed("Connection timeout".to_string()))
            .and_then(|connected| connected)
            .map_err(|e| {
                warn!("Failed to connect to {}: {}", destination, e);
                e
            })?;
        info!("Connected to {}", destination);

        Ok(OutboundLink {
            destination,
            stream,
            sessions: inner.sessions.clone(),
            pool: inner.pool.clone(),
        })
    }

    fn dispatch(&self, packet: Packet, reply: Arc<dyn PacketSink>) {
        let (destination, payload) = packet.into_parts();
        let inner = &self.inner;

        if inner.closed.load(Ordering::Acquire) {
            inner.pool.release(payload);
            reply.report_error(&destination, &ProxyError::Closed);
            return;
        }

        let mut payload = payload;
        // A stale queue is replaced once; a second failure means the session
        // is being torn down concurrently and the datagram is dropped.
        for _ in 0..2 {
            let queue = inner.udp_queue(&destination, &reply);
            match queue.try_send(payload) {
                Ok(()) => return,
                Err(TrySendError::Full(buffer)) => {
                    warn!("UDP queue to {} full, dropping datagram", destination);
                    inner.pool.release(buffer);
                    return;
                }
                Err(TrySendError::Closed(buffer)) => {
                    inner.forget_closed_queue(&destination, &queue);
                    payload = buffer;
                }
            }
        }
        debug!("UDP session to {} closing, dropping datagram", destination);
        inner.pool.release(payload);
    }

    fn stats(&self) -> DispatcherStats {
        let udp_sessions = lock(&self.inner.udp).values().map(Vec::len).sum();
        DispatcherStats {
            tcp_sessions: self.inner.sessions.len(),
            udp_sessions,
        }
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Dispatcher closing, signalling {} live sessions", self.stats().tcp_sessions);
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    /// Queue of the UDP session for (destination, reply), created on first use.
    fn udp_queue(self: &Arc<Self>, destination: &Destination, reply: &Arc<dyn PacketSink>) -> mpsc::Sender<Buffer> {
        let mut table = lock(&self.udp);
        let entries = table.entry(destination.clone()).or_default();
        if let Some(entry) = entries.iter().find(|e| same_sink(&e.reply, reply)) {
            return entry.queue.clone();
        }

        let id = self.next_udp_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.options.udp_queue_depth.max(1));
        entries.push(UdpEntry {
            id,
            reply: reply.clone(),
            queue: tx.clone(),
        });
        debug!("UDP session {} to {} created", id, destination);

        tokio::spawn(self.clone().run_udp_session(id, destination.clone(), reply.clone(), rx));
        tx
    }

    fn forget_closed_queue(&self, destination: &Destination, queue: &mpsc::Sender<Buffer>) {
        let mut table = lock(&self.udp);
        if let Some(entries) = table.get_mut(destination) {
            entries.retain(|e| !e.queue.same_channel(queue));
            if entries.is_empty() {
                table.remove(destination);
            }
        }
    }

    fn remove_udp_session(&self, destination: &Destination, id: u64) {
        let mut table = lock(&self.udp);
        if let Some(entries) = table.get_mut(destination) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                table.remove(destination);
            }
        }
    }

    async fn run_udp_session(
        self: Arc<Self>,
        id: u64,
        destination: Destination,
        reply: Arc<dyn PacketSink>,
        mut queue: mpsc::Receiver<Buffer>,
    ) {
        let conn = match self.outbound.open_datagram(&destination).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("UDP session {} to {} failed to open: {}", id, destination, e);
                self.remove_udp_session(&destination, id);
                queue.close();
                while let Some(buffer) = queue.recv().await {
                    self.pool.release(buffer);
                }
                reply.report_error(&destination, &e);
                return;
            }
        };

        let started = Instant::now();
        let last_active = Arc::new(AtomicU64::new(0));
        let cancel = self.shutdown.child_token();

        let sender = tokio::spawn(send_datagrams(
            conn.clone(),
            queue,
            self.pool.clone(),
            started,
            last_active.clone(),
        ));

        self.receive_datagrams(id, &destination, conn, &reply, &cancel, started, &last_active).await;

        self.remove_udp_session(&destination, id);
        // Dropping the table entry closes the queue; the sender drains what is left.
        let _ = sender.await;
        debug!("UDP session {} to {} closed", id, destination);
    }

    #[allow(clippy::too_many_arguments)]
    async fn receive_datagrams(
        &self,
        id: u64,
        destination: &Destination,
        conn: Arc<dyn DatagramConn>,
        reply: &Arc<dyn PacketSink>,
        cancel: &CancellationToken,
        started: Instant,
        last_active: &AtomicU64,
    ) {
        let idle = self.options.udp_idle_timeout;
        // Replies are received whole, then copied into a buffer sized to fit.
        let mut scratch = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = tokio::time::timeout(idle, conn.recv(&mut scratch)) => Some(result),
            };

            match received {
                None => break,
                Some(Err(_elapsed)) => {
                    let quiet = started.elapsed().saturating_sub(Duration::from_millis(last_active.load(Ordering::Relaxed)));
                    if quiet >= idle {
                        debug!("UDP session {} to {} idle for {:?}", id, destination, quiet);
                        break;
                    }
                }
                Some(Ok(Err(e))) => {
                    let error = ProxyError::ConnectionFailed(e.to_string());
                    reply.report_error(destination, &error);
                    break;
                }
                Some(Ok(Ok(n))) => {
                    let mut buffer = self.pool.acquire_at_least(n);
                    buffer.append(&scratch[..n]);
                    touch(last_active, started);
                    let packet = Packet::new(destination.clone(), buffer, false);
                    if let Err(e) = reply.communicate(packet).await {
                        debug!("UDP session {}: return channel rejected response: {}", id, e);
                    }
                }
            }
        }
    }
}

fn touch(last_active: &AtomicU64, started: Instant) {
    last_active.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
}

async fn send_datagrams(
    conn: Arc<dyn DatagramConn>,
    mut queue: mpsc::Receiver<Buffer>,
    pool: Arc<BufferPool>,
    started: Instant,
    last_active: Arc<AtomicU64>,
) {
    while let Some(buffer) = queue.recv().await {
        let sent = conn.send(&buffer).await;
        pool.release(buffer);
        match sent {
            Ok(_) => touch(&last_active, started),
            Err(e) => debug!("UDP send failed: {}", e),
        }
    }
}
