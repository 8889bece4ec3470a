//! Multiplexed connection implementation
//!
//! A connection owns one transport and runs two tasks over it:
//!
//! ```text
//! Stream 1 ─┐                                   ┌─► Stream 1 buffer
//! Stream 2 ─┼─► outbound queue ─► writer task   │
//! Stream N ─┘                     │             ├─► Stream 2 buffer
//!                                 ▼             │
//!                             transport ──► reader task ──► "stream" observers
//! ```
//!
//! The reader is the only place inbound frames are decoded and dispatched, so
//! per-stream delivery order matches wire order. The writer is the only place
//! frames are written, so frames never interleave on the wire.

use crate::config::MuxConfig;
use crate::error::{ConnectionError, ConnectionResult, ProtocolError, StreamError};
use crate::registry::{Registry, Role};
use crate::stream::{Delivery, Stream, StreamShared};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use mplex_proto::{Frame, FrameCodec, FrameError, FrameType, StreamId};
use std::collections::VecDeque;
use std::fmt;
use std::pin::{pin, Pin};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Maximum frames written before the writer flushes the transport
const MAX_BATCH_SIZE: usize = 64;

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An item queued for the writer task
pub(crate) enum Outbound {
    Frame {
        frame: Frame,
        /// Write-backlog reservation, released once the frame is flushed
        permit: Option<OwnedSemaphorePermit>,
        /// Fired once the frame has been flushed to the transport
        written: Option<oneshot::Sender<()>>,
    },
    /// Flush and shut down the transport write half
    Shutdown(oneshot::Sender<()>),
}

impl Outbound {
    pub fn frame(frame: Frame) -> Self {
        Outbound::Frame {
            frame,
            permit: None,
            written: None,
        }
    }

    pub fn with_permit(mut self, reserved: OwnedSemaphorePermit) -> Self {
        if let Outbound::Frame { permit, .. } = &mut self {
            *permit = Some(reserved);
        }
        self
    }

    pub fn notify(mut self, done: oneshot::Sender<()>) -> Self {
        if let Outbound::Frame { written, .. } = &mut self {
            *written = Some(done);
        }
        self
    }
}

/// Statistics about a connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Number of bytes sent
    pub bytes_sent: u64,

    /// Number of bytes received
    pub bytes_received: u64,

    /// Number of frames sent
    pub frames_sent: u64,

    /// Number of frames received
    pub frames_received: u64,

    /// Number of streams in the registry
    pub active_streams: usize,

    /// Connection uptime (seconds)
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
}

type StreamHandler = Arc<dyn Fn(Stream) + Send + Sync>;

/// Inbound-stream observers
#[derive(Default)]
struct Observers {
    handlers: Vec<StreamHandler>,
    /// Streams not yet handed to the observers, in arrival order
    pending: VecDeque<Stream>,
    /// Some caller is currently running handlers
    delivering: bool,
    closed: bool,
}

struct ConnState {
    registry: Registry<Arc<StreamShared>>,
    /// `close()` was called; no new streams
    closing: bool,
    /// Terminal cause, set exactly once
    cause: Option<ConnectionError>,
}

/// State shared by the connection handles, both tasks and every stream
pub(crate) struct ConnShared {
    connection_id: String,
    role: Role,
    config: MuxConfig,
    state: Mutex<ConnState>,
    observers: Mutex<Observers>,
    outbound: mpsc::UnboundedSender<Outbound>,
    write_budget: Arc<Semaphore>,
    /// Stops both tasks once the connection has terminated
    cancel: CancellationToken,
    /// Notified when the registry becomes empty or the connection terminates
    drained: Notify,
    terminated: watch::Sender<Option<ConnectionError>>,
    counters: Counters,
    created_at: Instant,
}

impl ConnShared {
    pub fn id(&self) -> &str {
        &self.connection_id
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Terminal cause, or `Closed` if the connection is still alive
    pub fn cause(&self) -> ConnectionError {
        lock(&self.state)
            .cause
            .clone()
            .unwrap_or(ConnectionError::Closed)
    }

    /// Queue an item for the writer task
    pub fn send(&self, item: Outbound) -> ConnectionResult<()> {
        self.outbound
            .send(item)
            .map_err(|_| ConnectionError::Closed)
    }

    /// Reserve `len` bytes of the outbound backlog
    pub async fn reserve_write(&self, len: usize) -> ConnectionResult<OwnedSemaphorePermit> {
        // chunks never exceed max_frame_size, which is validated to fit a u32
        let permits = u32::try_from(len).map_err(|_| {
            ConnectionError::Configuration("write chunk exceeds u32 permits".to_string())
        })?;
        match self.write_budget.clone().acquire_many_owned(permits).await {
            Ok(permit) => Ok(permit),
            Err(_) => Err(self.cause()),
        }
    }

    pub fn remove_stream(&self, id: StreamId) {
        let mut state = lock(&self.state);
        if state.registry.remove(id).is_some() {
            debug!("[{}] Stream {} removed", self.connection_id, id);
        }
        if state.registry.is_empty() {
            drop(state);
            self.drained.notify_waiters();
        }
    }

    fn lookup(&self, id: StreamId) -> Option<Arc<StreamShared>> {
        lock(&self.state).registry.get(id).cloned()
    }

    /// Run the close/abort cascade. Only the first call has any effect.
    pub fn terminate(&self, cause: ConnectionError) {
        let streams = {
            let mut state = lock(&self.state);
            if state.cause.is_some() {
                return;
            }
            state.cause = Some(cause.clone());
            state.registry.drain()
        };

        match &cause {
            ConnectionError::Closed => debug!("[{}] Connection closed", self.connection_id),
            ConnectionError::TransportClosed => {
                debug!("[{}] Transport closed", self.connection_id)
            }
            ConnectionError::Aborted(reason) => {
                warn!("[{}] Connection aborted: {}", self.connection_id, reason)
            }
            other => error!("[{}] Connection terminated: {}", self.connection_id, other),
        }
        if !streams.is_empty() {
            debug!(
                "[{}] Cascading to {} live streams",
                self.connection_id,
                streams.len()
            );
        }

        let stream_error = StreamError::Connection(cause.clone());
        for (_, stream) in streams {
            if cause.is_transport_failure() {
                stream.fail(stream_error.clone());
            } else {
                stream.reset(stream_error.clone());
            }
        }

        // dropped outside the lock: dropping a stream handle calls back in
        let (handlers, pending) = {
            let mut observers = lock(&self.observers);
            observers.closed = true;
            (
                std::mem::take(&mut observers.handlers),
                std::mem::take(&mut observers.pending),
            )
        };
        drop(handlers);
        drop(pending);

        self.write_budget.close();
        self.cancel.cancel();
        self.terminated.send_replace(Some(cause));
        self.drained.notify_waiters();
    }

    /// Queue an inbound stream for the observers and deliver it
    fn notify_observers(&self, stream: Stream) {
        {
            let mut observers = lock(&self.observers);
            if observers.closed {
                return;
            }
            observers.pending.push_back(stream);
        }
        self.deliver_pending();
    }

    /// Run handlers for queued streams, oldest first.
    ///
    /// Handlers run without the observers lock held, so they may call back
    /// into the connection. Only one caller delivers at a time; the others
    /// leave their streams queued for it.
    fn deliver_pending(&self) {
        {
            let mut observers = lock(&self.observers);
            if observers.delivering {
                return;
            }
            observers.delivering = true;
        }

        loop {
            let (stream, handlers) = {
                let mut observers = lock(&self.observers);
                let next = if observers.closed || observers.handlers.is_empty() {
                    None
                } else {
                    observers.pending.pop_front()
                };
                match next {
                    Some(stream) => (stream, observers.handlers.clone()),
                    None => {
                        observers.delivering = false;
                        return;
                    }
                }
            };

            for handler in handlers {
                handler(stream.clone());
            }
        }
    }

    /// Dispatch one inbound frame
    async fn dispatch(self: &Arc<Self>, frame: Frame) -> Result<(), ProtocolError> {
        let id = frame.stream_id;

        if frame.frame_type == FrameType::New {
            return self.accept_new(frame);
        }

        // The sender of the frame is the opener exactly when the id is not ours
        let local = lock(&self.state).registry.is_local(id);
        if local == frame.initiator {
            return Err(ProtocolError::InitiatorMismatch(id));
        }

        let Some(stream) = self.lookup(id) else {
            trace!(
                "[{}] Dropping {:?} for unknown stream {}",
                self.connection_id,
                frame.frame_type,
                id
            );
            return Ok(());
        };

        match frame.frame_type {
            FrameType::Message => {
                match stream.deliver(frame.payload, self.config.high_water_mark) {
                    Delivery::Pause => {
                        trace!(
                            "[{}] Stream {} above high-water mark, pausing reader",
                            self.connection_id,
                            id
                        );
                        stream.wait_for_drain(self.config.low_water_mark).await;
                    }
                    Delivery::Dropped => {
                        trace!("[{}] Discarded data for stream {}", self.connection_id, id)
                    }
                    Delivery::Buffered => {}
                }
            }
            FrameType::Close => {
                debug!("[{}] Stream {} closed by remote", self.connection_id, id);
                if stream.remote_close() {
                    self.remove_stream(id);
                }
                stream.wake_all();
            }
            FrameType::Reset => {
                debug!("[{}] Stream {} reset by remote", self.connection_id, id);
                self.remove_stream(id);
                stream.reset(StreamError::RemoteReset);
            }
            FrameType::New => unreachable!("handled above"),
        }

        Ok(())
    }

    fn accept_new(self: &Arc<Self>, frame: Frame) -> Result<(), ProtocolError> {
        let id = frame.stream_id;
        if !frame.initiator {
            return Err(ProtocolError::UnexpectedNew(id));
        }

        let name = if frame.payload.is_empty() {
            id.to_string()
        } else {
            String::from_utf8_lossy(&frame.payload).into_owned()
        };

        let shared = {
            let mut state = lock(&self.state);
            if state.cause.is_some() {
                return Ok(());
            }
            state.registry.accept_remote(id)?;
            if state.closing {
                None
            } else {
                let shared = StreamShared::new(id, false, name);
                state.registry.insert(id, shared.clone());
                Some(shared)
            }
        };

        let Some(shared) = shared else {
            warn!(
                "[{}] Refusing stream {} while closing",
                self.connection_id, id
            );
            if let Err(e) = self.send(Outbound::frame(Frame::reset(id, false))) {
                debug!("[{}] Failed to refuse stream {}: {}", self.connection_id, id, e);
            }
            return Ok(());
        };

        debug!("[{}] Accepted stream {}", self.connection_id, id);
        self.notify_observers(Stream::new(shared, self.clone()));
        Ok(())
    }
}

/// What the writer does after a batch
enum BatchOutcome {
    Continue,
    Shutdown,
}

/// Write one batch of queued items starting with `first`, then flush.
///
/// Acknowledgements fire and backlog reservations are released only after the
/// flush succeeded.
async fn write_batch<W>(
    sink: &mut FramedWrite<WriteHalf<W>, FrameCodec>,
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
    first: Outbound,
    counters: &Counters,
) -> Result<BatchOutcome, FrameError>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut acks = Vec::new();
    let mut permits = Vec::new();
    let mut shutdown = None;
    let mut next = Some(first);
    let mut batched = 0;

    while let Some(item) = next.take() {
        match item {
            Outbound::Frame {
                frame,
                permit,
                written,
            } => {
                let len = frame.encoded_len() as u64;
                sink.feed(frame).await?;
                counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
                counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                acks.extend(written);
                permits.extend(permit);
            }
            Outbound::Shutdown(done) => {
                shutdown = Some(done);
                break;
            }
        }

        batched += 1;
        if batched < MAX_BATCH_SIZE {
            next = rx.try_recv().ok();
        }
    }

    sink.flush().await?;
    drop(permits);
    for ack in acks {
        let _ = ack.send(());
    }

    match shutdown {
        Some(done) => {
            sink.close().await?;
            let _ = done.send(());
            Ok(BatchOutcome::Shutdown)
        }
        None => Ok(BatchOutcome::Continue),
    }
}

/// Writer task - serializes every outbound frame onto the transport
async fn writer_task<W>(
    mut sink: FramedWrite<WriteHalf<W>, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<ConnShared>,
) where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn_id = shared.connection_id.clone();

    loop {
        let first = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let outcome = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            outcome = write_batch(&mut sink, &mut rx, first, &shared.counters) => outcome,
        };

        match outcome {
            Ok(BatchOutcome::Continue) => {}
            Ok(BatchOutcome::Shutdown) => {
                debug!("[{}] Transport write half shut down", conn_id);
                break;
            }
            Err(e) => {
                error!("[{}] Transport write error: {}", conn_id, e);
                shared.terminate(ConnectionError::Transport(e.to_string()));
                break;
            }
        }
    }

    debug!("[{}] Writer task ended", conn_id);
}

/// Reader task - decodes frames and dispatches them to streams
async fn reader_task<R>(mut frames: FramedRead<ReadHalf<R>, FrameCodec>, shared: Arc<ConnShared>)
where
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn_id = shared.connection_id.clone();

    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            next = frames.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(FrameError::Io(e))) => {
                error!("[{}] Transport read error: {}", conn_id, e);
                shared.terminate(ConnectionError::Transport(e.to_string()));
                break;
            }
            Some(Err(e)) => {
                error!("[{}] Invalid frame received: {}", conn_id, e);
                shared.terminate(ConnectionError::Protocol(e.into()));
                break;
            }
            None => {
                shared.terminate(ConnectionError::TransportClosed);
                break;
            }
        };

        shared
            .counters
            .bytes_received
            .fetch_add(frame.encoded_len() as u64, Ordering::Relaxed);
        shared.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        trace!(
            "[{}] Received frame: stream={}, type={:?}, len={}",
            conn_id,
            frame.stream_id,
            frame.frame_type,
            frame.payload.len()
        );

        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            result = shared.dispatch(frame) => result,
        };
        if let Err(e) = result {
            error!("[{}] Protocol violation: {}", conn_id, e);
            shared.terminate(ConnectionError::Protocol(e));
            break;
        }
    }

    debug!("[{}] Reader task ended", conn_id);
}

/// Multiplexed connection
///
/// Cheap to clone; all clones drive the same underlying transport.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnShared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connection_id", &self.shared.connection_id)
            .field("role", &self.shared.role)
            .finish()
    }
}

impl Connection {
    /// Establish the dialing side of a connection (even stream ids)
    pub fn dial<T>(transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(transport, Role::Initiator, MuxConfig::default())
    }

    /// Establish the listening side of a connection (odd stream ids)
    pub fn listen<T>(transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(transport, Role::Responder, MuxConfig::default())
    }

    /// Establish a connection with explicit role and tuning
    pub fn with_config<T>(transport: T, role: Role, config: MuxConfig) -> ConnectionResult<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        Ok(Self::start(transport, role, config))
    }

    fn start<T>(transport: T, role: Role, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection_id = format!("mux-{}", uuid::Uuid::new_v4());
        let (read_half, write_half) = tokio::io::split(transport);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (terminated, _) = watch::channel(None);

        let shared = Arc::new(ConnShared {
            connection_id: connection_id.clone(),
            role,
            state: Mutex::new(ConnState {
                registry: Registry::new(role),
                closing: false,
                cause: None,
            }),
            observers: Mutex::new(Observers::default()),
            outbound: outbound_tx,
            write_budget: Arc::new(Semaphore::new(config.write_backlog)),
            cancel: CancellationToken::new(),
            drained: Notify::new(),
            terminated,
            counters: Counters::default(),
            created_at: Instant::now(),
            config,
        });

        debug!("[{}] Connection established as {:?}", connection_id, role);

        let max_payload = shared.config.max_payload_size;
        tokio::spawn(writer_task(
            FramedWrite::new(write_half, FrameCodec::new(max_payload)),
            outbound_rx,
            shared.clone(),
        ));
        tokio::spawn(reader_task(
            FramedRead::new(read_half, FrameCodec::new(max_payload)),
            shared.clone(),
        ));

        Self { shared }
    }

    /// Open a new stream.
    ///
    /// The stream is registered and its NEW frame queued for the writer, then
    /// the handle is returned without waiting for the transport or the remote.
    /// Data written to it is queued behind the NEW frame.
    pub async fn new_stream(&self) -> ConnectionResult<Stream> {
        self.open(None).await
    }

    /// Open a new stream announcing `name` in its NEW frame
    pub async fn new_named_stream(&self, name: impl Into<String>) -> ConnectionResult<Stream> {
        self.open(Some(name.into())).await
    }

    async fn open(&self, name: Option<String>) -> ConnectionResult<Stream> {
        let stream = {
            let mut state = lock(&self.shared.state);
            if state.cause.is_some() || state.closing {
                return Err(ConnectionError::Closed);
            }
            let id = state
                .registry
                .allocate()
                .ok_or(ConnectionError::StreamIdsExhausted)?;
            let name = name.unwrap_or_else(|| id.to_string());
            if name.len() > self.shared.config.max_frame_size {
                return Err(ConnectionError::Configuration(
                    "stream name exceeds max_frame_size".to_string(),
                ));
            }

            let frame = Frame::new_stream(id, Bytes::from(name.clone().into_bytes()));
            self.shared.send(Outbound::frame(frame))?;

            let shared = StreamShared::new(id, true, name);
            state.registry.insert(id, shared.clone());
            Stream::new(shared, self.shared.clone())
        };

        debug!("[{}] Opened stream {}", self.shared.connection_id, stream.id());
        Ok(stream)
    }

    /// Observe streams opened by the remote peer.
    ///
    /// `handler` runs on the reader task, once per inbound NEW frame, in
    /// arrival order. Streams that arrived before the first observer was
    /// registered are replayed to it, oldest first.
    pub fn on_stream<F>(&self, handler: F)
    where
        F: Fn(Stream) + Send + Sync + 'static,
    {
        {
            let mut observers = lock(&self.shared.observers);
            if observers.closed {
                return;
            }
            observers.handlers.push(Arc::new(handler));
        }
        self.shared.deliver_pending();
    }

    /// Channel of streams opened by the remote peer
    pub fn incoming(&self) -> Incoming {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_stream(move |stream| {
            let _ = tx.send(stream);
        });
        Incoming { rx }
    }

    /// Close gracefully.
    ///
    /// New local streams are refused and inbound NEW frames are answered with
    /// RESET. Once every live stream has finished, the transport write half
    /// is flushed and shut down.
    pub async fn close(&self) {
        let live = {
            let mut state = lock(&self.shared.state);
            if state.cause.is_some() {
                return;
            }
            state.closing = true;
            state.registry.len()
        };
        debug!(
            "[{}] Closing connection, waiting for {} streams",
            self.shared.connection_id, live
        );

        loop {
            let mut notified = pin!(self.shared.drained.notified());
            notified.as_mut().enable();
            {
                let state = lock(&self.shared.state);
                if state.cause.is_some() {
                    return;
                }
                if state.registry.is_empty() {
                    break;
                }
            }
            notified.await;
        }

        let (done_tx, done_rx) = oneshot::channel();
        if self.shared.send(Outbound::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        self.shared.terminate(ConnectionError::Closed);
    }

    /// Abort immediately.
    ///
    /// Every live stream is reset with `ConnectionError::Aborted(reason)`,
    /// later `new_stream` calls fail with
    /// `ConnectionError::Closed`. Calling it again has no effect.
    pub fn abort(&self, reason: impl Into<String>) {
        self.shared
            .terminate(ConnectionError::Aborted(reason.into()));
    }

    /// Whether the connection has terminated
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).cause.is_some()
    }

    /// Wait for the connection to terminate and return the cause
    pub async fn closed(&self) -> ConnectionError {
        let mut rx = self.shared.terminated.subscribe();
        let result = rx.wait_for(|cause| cause.is_some()).await;
        match result {
            Ok(cause) => cause.clone().unwrap_or(ConnectionError::Closed),
            Err(_) => ConnectionError::Closed,
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Unique identifier used in logs
    pub fn connection_id(&self) -> String {
        self.shared.connection_id.clone()
    }

    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        let counters = &self.shared.counters;
        ConnectionStats {
            bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: counters.bytes_received.load(Ordering::Relaxed),
            frames_sent: counters.frames_sent.load(Ordering::Relaxed),
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            active_streams: lock(&self.shared.state).registry.len(),
            uptime_secs: self.shared.created_at.elapsed().as_secs(),
        }
    }
}

/// Streams opened by the remote peer, in arrival order
#[derive(Debug)]
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<Stream>,
}

impl Incoming {
    /// Wait for the next inbound stream.
    ///
    /// Returns `None` once the connection has terminated.
    pub async fn accept(&mut self) -> Option<Stream> {
        self.rx.recv().await
    }
}

impl futures::Stream for Incoming {
    type Item = Stream;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Stream>> {
        self.rx.poll_recv(cx)
    }
}
