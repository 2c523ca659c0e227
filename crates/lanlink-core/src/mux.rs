//! TCP tunnel multiplexer
//!
//! One endpoint per tunnel peer. Local TCP sockets are keyed by opaque
//! 6-character ids; their bytes are framed and pushed over the reliable
//! channel. Flow control is watermark-driven: when the substrate's
//! pending-reliable backlog crosses the high watermark, sends are
//! refused, frames queue per session, local reads pause, and a flush
//! task drains the queues with exponential backoff until the backlog
//! falls under the low watermark.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lanlink_net::substrate::{Delivery, SendError, Substrate};
use lanlink_proto::mux::{
    build_frame, parse_frame, MuxFrameType, SessionId, BACKOFF_INIT_MS, BACKOFF_MAX_MS, MUX_CHUNK,
    MUX_HIGH_WATER, MUX_LOW_WATER,
};
use lanlink_proto::UserId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, trace, warn};

/// Local read buffer per session
const READ_BUFFER: usize = 1024 * 1024;

/// Backoff ceiling applied when the substrate itself refuses a send
const SEND_REFUSED_BACKOFF_MAX_MS: u64 = 100;

struct ClientHandle {
    writer: mpsc::UnboundedSender<Bytes>,
    reader_task: tokio::task::JoinHandle<()>,
    writer_task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct Pending {
    queues: HashMap<SessionId, VecDeque<Bytes>>,
}

impl Pending {
    fn total_frames(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }
}

struct MuxShared {
    substrate: Arc<dyn Substrate>,
    peer: UserId,
    is_host: bool,
    local_port: u16,

    clients: Mutex<HashMap<SessionId, ClientHandle>>,
    pending: Mutex<Pending>,
    paused: Mutex<HashSet<SessionId>>,
    missing: Mutex<HashSet<SessionId>>,

    blocked: watch::Sender<bool>,
    backoff_ms: AtomicU64,
    last_blocked: Mutex<Option<Instant>>,

    flush_notify: Notify,
    running: AtomicBool,
}

/// Id-framed TCP tunnel endpoint for one peer
pub struct MuxEndpoint {
    shared: Arc<MuxShared>,
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MuxEndpoint {
    /// Create an endpoint and start its flush task
    pub fn new(substrate: Arc<dyn Substrate>, peer: UserId, is_host: bool, local_port: u16) -> Arc<Self> {
        let (blocked, _) = watch::channel(false);
        let shared = Arc::new(MuxShared {
            substrate,
            peer,
            is_host,
            local_port,
            clients: Mutex::new(HashMap::new()),
            pending: Mutex::new(Pending::default()),
            paused: Mutex::new(HashSet::new()),
            missing: Mutex::new(HashSet::new()),
            blocked,
            backoff_ms: AtomicU64::new(BACKOFF_INIT_MS),
            last_blocked: Mutex::new(None),
            flush_notify: Notify::new(),
            running: AtomicBool::new(true),
        });

        let endpoint = Arc::new(Self {
            shared: Arc::clone(&shared),
            flush_task: Mutex::new(None),
        });
        let task = tokio::spawn(flush_loop(shared));
        *endpoint.flush_task.lock().unwrap() = Some(task);
        endpoint
    }

    /// Register an accepted local socket under a fresh id
    pub fn add_client(&self, stream: TcpStream) -> SessionId {
        let id = {
            let clients = self.shared.clients.lock().unwrap();
            let mut id = SessionId::random();
            while clients.contains_key(&id) {
                id = SessionId::random();
            }
            id
        };
        self.install_client(id, stream);
        info!(target: "network", %id, "added tunnel client");
        id
    }

    /// Remove a session: close the socket, drop queued frames
    ///
    /// Idempotent. When this leaves every queue empty the blocked flag
    /// clears and paused reads resume.
    pub fn remove_client(&self, id: SessionId) -> bool {
        let removed = {
            let mut clients = self.shared.clients.lock().unwrap();
            match clients.remove(&id) {
                Some(handle) => {
                    handle.reader_task.abort();
                    handle.writer_task.abort();
                    true
                }
                None => false,
            }
        };
        self.shared.paused.lock().unwrap().remove(&id);
        self.shared.missing.lock().unwrap().remove(&id);

        let now_empty = {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.queues.remove(&id);
            pending.queues.is_empty()
        };
        if now_empty {
            set_blocked(&self.shared, false);
            resume_paused_reads(&self.shared);
        }
        if removed {
            info!(target: "network", %id, "removed tunnel client");
        }
        removed
    }

    /// Whether a session exists
    pub fn has_client(&self, id: SessionId) -> bool {
        self.shared.clients.lock().unwrap().contains_key(&id)
    }

    /// Number of live sessions
    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().unwrap().len()
    }

    /// Whether sends are currently refused
    pub fn is_blocked(&self) -> bool {
        *self.shared.blocked.borrow()
    }

    /// Sessions whose local reads are paused
    pub fn paused_count(&self) -> usize {
        self.shared.paused.lock().unwrap().len()
    }

    /// Frames waiting in per-session queues
    pub fn pending_frames(&self) -> usize {
        self.shared.pending.lock().unwrap().total_frames()
    }

    /// Current flush backoff in milliseconds
    pub fn backoff_ms(&self) -> u64 {
        self.shared.backoff_ms.load(Ordering::Relaxed)
    }

    /// Frame local bytes and push them toward the peer
    ///
    /// Payloads over the chunk limit are split into consecutive data
    /// frames with the same id, preserving order.
    pub fn send_tunnel(&self, id: SessionId, data: &[u8], kind: MuxFrameType) {
        send_tunnel(&self.shared, id, data, kind);
    }

    /// Dispatch one frame received from the tunnel
    pub async fn handle_frame(&self, bytes: &[u8]) {
        let frame = match parse_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "network", error = %e, "bad tunnel frame");
                return;
            }
        };

        match frame.kind {
            MuxFrameType::Data => self.handle_data_frame(frame.id, frame.payload).await,
            MuxFrameType::Disconnect => {
                if self.remove_client(frame.id) {
                    debug!(target: "network", id = %frame.id, "remote closed session");
                }
            }
        }
    }

    async fn handle_data_frame(&self, id: SessionId, payload: Bytes) {
        let writer = self
            .shared
            .clients
            .lock()
            .unwrap()
            .get(&id)
            .map(|c| c.writer.clone());

        if let Some(writer) = writer {
            self.shared.missing.lock().unwrap().remove(&id);
            if writer.send(payload).is_err() {
                self.remove_client(id);
            }
            return;
        }

        // Host side re-originates unknown sessions toward the local
        // service port.
        if self.shared.is_host && self.shared.local_port > 0 {
            debug!(
                target: "network",
                %id,
                port = self.shared.local_port,
                "opening local connection for new tunnel session"
            );
            match TcpStream::connect(("127.0.0.1", self.shared.local_port)).await {
                Ok(stream) => {
                    self.install_client(id, stream);
                    let writer = self
                        .shared
                        .clients
                        .lock()
                        .unwrap()
                        .get(&id)
                        .map(|c| c.writer.clone());
                    if let Some(writer) = writer {
                        let _ = writer.send(payload);
                    }
                    return;
                }
                Err(e) => {
                    warn!(target: "network", %id, error = %e, "failed to open local connection");
                    self.send_tunnel(id, &[], MuxFrameType::Disconnect);
                    return;
                }
            }
        }

        // Unknown session we cannot create: log once, tell the peer.
        if self.shared.missing.lock().unwrap().insert(id) {
            warn!(target: "network", %id, "no client for tunnel session");
        }
        self.send_tunnel(id, &[], MuxFrameType::Disconnect);
    }

    /// Tear the endpoint down, closing every session
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.flush_task.lock().unwrap().take() {
            task.abort();
        }
        let ids: Vec<SessionId> = self.shared.clients.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.remove_client(id);
        }
    }

    fn install_client(&self, id: SessionId, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(target: "network", %id, error = %e, "failed to set TCP_NODELAY");
        }
        let (mut read_half, mut write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Bytes>();

        let shared = Arc::clone(&self.shared);
        let reader_task = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER];
            let mut blocked_rx = shared.blocked.subscribe();
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        send_tunnel(&shared, id, &[], MuxFrameType::Disconnect);
                        remove_client_inner(&shared, id);
                        break;
                    }
                    Ok(n) => {
                        trace!(target: "network", %id, bytes = n, "local read");
                        send_tunnel(&shared, id, &buf[..n], MuxFrameType::Data);

                        // Back off from the socket while the tunnel is
                        // saturated; resume_paused_reads flips the watch.
                        if *blocked_rx.borrow() {
                            shared.paused.lock().unwrap().insert(id);
                            loop {
                                if !*blocked_rx.borrow_and_update() {
                                    break;
                                }
                                if blocked_rx.changed().await.is_err() {
                                    break;
                                }
                            }
                            shared.paused.lock().unwrap().remove(&id);
                        }
                    }
                }
            }
        });

        let shared = Arc::clone(&self.shared);
        let writer_task = tokio::spawn(async move {
            while let Some(chunk) = writer_rx.recv().await {
                if let Err(e) = write_half.write_all(&chunk).await {
                    debug!(target: "network", %id, error = %e, "local write failed");
                    send_tunnel(&shared, id, &[], MuxFrameType::Disconnect);
                    remove_client_inner(&shared, id);
                    break;
                }
            }
        });

        self.shared.clients.lock().unwrap().insert(
            id,
            ClientHandle {
                writer: writer_tx,
                reader_task,
                writer_task,
            },
        );
        self.shared.missing.lock().unwrap().remove(&id);
    }
}

impl Drop for MuxEndpoint {
    fn drop(&mut self) {
        if let Some(task) = self.flush_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

fn send_tunnel(shared: &Arc<MuxShared>, id: SessionId, data: &[u8], kind: MuxFrameType) {
    let mut refused = false;
    let mut push = |chunk: &[u8], kind: MuxFrameType| {
        let frame = build_frame(id, kind, chunk);
        if refused || is_send_saturated(shared) {
            refused = true;
            enqueue(shared, id, frame);
            return;
        }
        if !try_send(shared, &frame) {
            refused = true;
            enqueue(shared, id, frame);
        }
    };

    if kind == MuxFrameType::Data && data.len() > MUX_CHUNK {
        for chunk in data.chunks(MUX_CHUNK) {
            push(chunk, MuxFrameType::Data);
        }
    } else {
        push(data, kind);
    }

    if refused {
        set_blocked(shared, true);
        *shared.last_blocked.lock().unwrap() = Some(Instant::now());
        shared.flush_notify.notify_one();
    }
}

/// Attempt one reliable send; `false` means the frame must be queued
fn try_send(shared: &Arc<MuxShared>, frame: &[u8]) -> bool {
    match shared.substrate.send(shared.peer, frame, Delivery::Reliable) {
        Ok(()) => {
            shared.backoff_ms.store(BACKOFF_INIT_MS, Ordering::Relaxed);
            true
        }
        Err(SendError::LimitExceeded) => {
            *shared.last_blocked.lock().unwrap() = Some(Instant::now());
            grow_backoff(shared, SEND_REFUSED_BACKOFF_MAX_MS);
            set_blocked(shared, true);
            false
        }
        Err(SendError::NoSession) | Err(SendError::InvalidParameter) => true,
        Err(e) => {
            warn!(target: "substrate", error = %e, "tunnel send failed");
            true
        }
    }
}

/// Watermark-and-backoff saturation check
fn is_send_saturated(shared: &Arc<MuxShared>) -> bool {
    if *shared.blocked.borrow() {
        let within_backoff = shared
            .last_blocked
            .lock()
            .unwrap()
            .map(|t| t.elapsed() < Duration::from_millis(shared.backoff_ms.load(Ordering::Relaxed)))
            .unwrap_or(false);
        if within_backoff {
            return true;
        }
        // Backoff elapsed; probe the real backlog but keep the flag
        // until a send actually succeeds.
    }

    if let Some(status) = shared.substrate.status(shared.peer) {
        if status.pending_reliable >= MUX_HIGH_WATER {
            *shared.last_blocked.lock().unwrap() = Some(Instant::now());
            grow_backoff(shared, BACKOFF_MAX_MS);
            set_blocked(shared, true);
            return true;
        }
        if status.pending_reliable <= MUX_LOW_WATER {
            set_blocked(shared, false);
            shared.backoff_ms.store(BACKOFF_INIT_MS, Ordering::Relaxed);
            return false;
        }
    }

    *shared.blocked.borrow()
}

fn grow_backoff(shared: &Arc<MuxShared>, ceiling_ms: u64) {
    let current = shared.backoff_ms.load(Ordering::Relaxed);
    shared
        .backoff_ms
        .store((current * 2).min(ceiling_ms), Ordering::Relaxed);
}

fn set_blocked(shared: &Arc<MuxShared>, value: bool) {
    shared.blocked.send_replace(value);
}

fn enqueue(shared: &Arc<MuxShared>, id: SessionId, frame: Bytes) {
    shared
        .pending
        .lock()
        .unwrap()
        .queues
        .entry(id)
        .or_default()
        .push_back(frame);
}

fn resume_paused_reads(shared: &Arc<MuxShared>) {
    // Readers watch the blocked flag; flipping it false wakes them.
    shared.blocked.send_replace(false);
    shared.paused.lock().unwrap().clear();
}

fn remove_client_inner(shared: &Arc<MuxShared>, id: SessionId) {
    let handle = shared.clients.lock().unwrap().remove(&id);
    if let Some(handle) = handle {
        handle.reader_task.abort();
        handle.writer_task.abort();
    }
    shared.paused.lock().unwrap().remove(&id);
    shared.missing.lock().unwrap().remove(&id);
    let now_empty = {
        let mut pending = shared.pending.lock().unwrap();
        pending.queues.remove(&id);
        pending.queues.is_empty()
    };
    if now_empty {
        set_blocked(shared, false);
        resume_paused_reads(shared);
    }
}

/// Drain pending queues whenever sends were refused
async fn flush_loop(shared: Arc<MuxShared>) {
    loop {
        shared.flush_notify.notified().await;
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        loop {
            let delay = if *shared.blocked.borrow() {
                Duration::from_millis(
                    shared
                        .backoff_ms
                        .load(Ordering::Relaxed)
                        .max(BACKOFF_INIT_MS),
                )
            } else {
                Duration::from_millis(BACKOFF_INIT_MS)
            };
            tokio::time::sleep(delay).await;
            if !shared.running.load(Ordering::SeqCst) {
                return;
            }

            flush_pending(&shared);

            if shared.pending.lock().unwrap().queues.is_empty() {
                break;
            }
        }
    }
}

/// One flush pass: per-session FIFO, stop at the first refusal
fn flush_pending(shared: &Arc<MuxShared>) {
    if is_send_saturated(shared) {
        return;
    }

    loop {
        let next = {
            let pending = shared.pending.lock().unwrap();
            pending
                .queues
                .iter()
                .find(|(_, q)| !q.is_empty())
                .map(|(id, q)| (*id, q.front().cloned().unwrap_or_default()))
        };
        let Some((id, frame)) = next else { break };

        if !try_send(shared, &frame) {
            set_blocked(shared, true);
            return;
        }

        let mut pending = shared.pending.lock().unwrap();
        if let Some(queue) = pending.queues.get_mut(&id) {
            queue.pop_front();
            if queue.is_empty() {
                pending.queues.remove(&id);
            }
        }
    }

    set_blocked(shared, false);
    resume_paused_reads(shared);
}
