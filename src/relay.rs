//! Duplex relay between an inbound stream and an outbound stream.
//!
//! Every TCP session runs two independent tasks, one per direction. A task
//! reads into a pooled buffer, hands the filled buffer to the writer, releases
//! it, and on end of stream or a read error half-closes its write side so the
//! peer sees EOF while the opposite direction keeps flowing. The session is
//! removed from the [`SessionTable`] by whichever task finishes last.

use crate::buffer::BufferPool;
use crate::destination::Destination;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Any duplex byte stream an inbound or outbound handler can hand over.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn ProxyStream>;

pub type SessionId = u64;

/// Bytes moved by a finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// client -> remote
    pub uplink: u64,
    /// remote -> client
    pub downlink: u64,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub destination: Destination,
    pub started: Instant,
}

/// Live TCP sessions, addressed by id.
pub struct SessionTable {
    next_id: AtomicU64,
    live: Mutex<HashMap<SessionId, SessionInfo>>,
    shutdown: CancellationToken,
}

impl SessionTable {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    fn insert(&self, destination: Destination) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = SessionInfo {
            destination,
            started: Instant::now(),
        };
        lock(&self.live).insert(id, info);
        id
    }

    fn remove(&self, id: SessionId) -> Option<SessionInfo> {
        lock(&self.live).remove(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.live).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: SessionId) -> Option<SessionInfo> {
        lock(&self.live).get(&id).cloned()
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lets the originator of a session learn when it has ended.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    done: oneshot::Receiver<RelayStats>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Waits until both relay directions have terminated.
    pub async fn finished(self) -> RelayStats {
        self.done.await.unwrap_or_default()
    }
}

/// Shared by the two direction tasks of one session; the task that brings
/// `remaining` to zero tears the session down.
struct Completion {
    id: SessionId,
    remaining: AtomicUsize,
    uplink: AtomicU64,
    downlink: AtomicU64,
    table: Arc<SessionTable>,
    done: Mutex<Option<oneshot::Sender<RelayStats>>>,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Uplink,
    Downlink,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Uplink => "client -> remote",
            Direction::Downlink => "remote -> client",
        }
    }
}

impl Completion {
    fn finish(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Uplink => self.uplink.store(bytes, Ordering::Release),
            Direction::Downlink => self.downlink.store(bytes, Ordering::Release),
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let stats = RelayStats {
            uplink: self.uplink.load(Ordering::Acquire),
            downlink: self.downlink.load(Ordering::Acquire),
        };
        if let Some(info) = self.table.remove(self.id) {
            info!(
                "Session {} to {} closed after {:?} (up {} bytes, down {} bytes)",
                self.id,
                info.destination,
                info.started.elapsed(),
                stats.uplink,
                stats.downlink
            );
        }
        if let Some(tx) = lock(&self.done).take() {
            let _ = tx.send(stats);
        }
    }
}

/// Registers a session for `destination` and spawns its two relay tasks.
/// Returns as soon as the tasks are running.
pub fn spawn_session(
    table: Arc<SessionTable>,
    pool: Arc<BufferPool>,
    destination: Destination,
    inbound: BoxedStream,
    outbound: BoxedStream,
) -> SessionHandle {
    let id = table.insert(destination);
    let cancel = table.shutdown.child_token();
    let (done_tx, done_rx) = oneshot::channel();
    let completion = Arc::new(Completion {
        id,
        remaining: AtomicUsize::new(2),
        uplink: AtomicU64::new(0),
        downlink: AtomicU64::new(0),
        table,
        done: Mutex::new(Some(done_tx)),
    });

    let (inbound_read, inbound_write) = split(inbound);
    let (outbound_read, outbound_write) = split(outbound);

    {
        let completion = completion.clone();
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let bytes = relay_direction(inbound_read, outbound_write, &pool, &cancel, Direction::Uplink).await;
            completion.finish(Direction::Uplink, bytes);
        });
    }
    tokio::spawn(async move {
        let bytes = relay_direction(outbound_read, inbound_write, &pool, &cancel, Direction::Downlink).await;
        completion.finish(Direction::Downlink, bytes);
    });

    debug!("Session {} relay started", id);
    SessionHandle { id, done: done_rx }
}

/// Copies `reader` into `writer` until end of stream, a read error or
/// cancellation, then half-closes `writer`. Returns the bytes forwarded.
async fn relay_direction<R, W>(
    mut reader: R,
    mut writer: W,
    pool: &BufferPool,
    cancel: &CancellationToken,
    direction: Direction,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;

    loop {
        let mut buffer = pool.acquire();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = buffer.read_from(&mut reader) => Some(result),
        };

        let n = match read {
            None => {
                pool.release(buffer);
                debug!("{}: cancelled after {} bytes", direction.label(), total);
                break;
            }
            Some(Ok(0)) => {
                pool.release(buffer);
                debug!("{}: source closed, total bytes: {}", direction.label(), total);
                break;
            }
            Some(Err(e)) => {
                pool.release(buffer);
                debug!("{}: read error after {} bytes: {}", direction.label(), total, e);
                break;
            }
            Some(Ok(n)) => n,
        };

        // A pending write is never cancelled; it completes or fails on its own.
        let written = writer.write_all(&buffer).await;
        pool.release(buffer);
        if let Err(e) = written {
            debug!("{}: write error after {} bytes: {}", direction.label(), total, e);
            break;
        }
        total += n as u64;
    }

    if let Err(e) = writer.shutdown().await {
        debug!("{}: half-close failed: {}", direction.label(), e);
    }
    total
}
