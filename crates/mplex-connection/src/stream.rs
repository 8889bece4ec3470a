//! Logical duplex streams multiplexed over one connection
//!
//! Each direction of a stream moves through its own small state machine:
//!
//! ```text
//! Open ──close──► HalfClosed ──other side closes──► Closed
//!   │                 │
//!   └──────reset──────┴──────────────────────────► Reset
//! ```
//!
//! Closed and Reset are terminal. A reset always terminates both directions.

use crate::connection::{lock, ConnShared, Outbound};
use crate::error::{StreamError, StreamResult};
use bytes::Bytes;
use mplex_proto::{Frame, StreamId};
use std::collections::VecDeque;
use std::fmt;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

/// State of the inbound direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Open,
    HalfClosedByRemote,
    Closed,
    Reset,
}

/// State of the outbound direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Open,
    HalfClosedByLocal,
    Closed,
    Reset,
}

/// What the reader should do after buffering a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Buffered,
    /// Buffer is above the high-water mark
    Pause,
    Dropped,
}

/// Mutable per-stream state, guarded by `StreamShared::inner`
#[derive(Debug)]
pub(crate) struct StreamInner {
    read: ReadState,
    write: WriteState,
    buffer: VecDeque<Bytes>,
    buffered: usize,
    error: Option<StreamError>,
    /// Every handle was dropped; inbound data is discarded
    abandoned: bool,
}

impl StreamInner {
    fn new() -> Self {
        Self {
            read: ReadState::Open,
            write: WriteState::Open,
            buffer: VecDeque::new(),
            buffered: 0,
            error: None,
            abandoned: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.read, ReadState::Closed | ReadState::Reset)
            && matches!(self.write, WriteState::Closed | WriteState::Reset)
    }

    fn reset_error(&self) -> StreamError {
        self.error.clone().unwrap_or(StreamError::RemoteReset)
    }

    /// Error for a write attempted in the current state, if any
    fn write_error(&self) -> Option<StreamError> {
        match self.write {
            WriteState::Open => None,
            WriteState::HalfClosedByLocal | WriteState::Closed => Some(StreamError::WriteClosed),
            WriteState::Reset => Some(self.reset_error()),
        }
    }

    /// Half-close the write side. Returns true if a CLOSE frame must be sent.
    fn local_close(&mut self) -> StreamResult<bool> {
        match self.write {
            WriteState::Open => {
                self.write = WriteState::HalfClosedByLocal;
                if self.read == ReadState::HalfClosedByRemote {
                    self.read = ReadState::Closed;
                    self.write = WriteState::Closed;
                }
                Ok(true)
            }
            WriteState::HalfClosedByLocal | WriteState::Closed => Ok(false),
            WriteState::Reset => Err(self.reset_error()),
        }
    }

    fn remote_close(&mut self) {
        if self.read != ReadState::Open {
            return;
        }
        self.read = ReadState::HalfClosedByRemote;
        if self.write == WriteState::HalfClosedByLocal {
            self.read = ReadState::Closed;
            self.write = WriteState::Closed;
        }
    }

    /// Terminate both directions and discard unread data
    fn reset(&mut self, error: StreamError) {
        if self.read == ReadState::Reset {
            return;
        }
        self.read = ReadState::Reset;
        self.write = WriteState::Reset;
        self.error = Some(error);
        self.buffer.clear();
        self.buffered = 0;
    }

    /// Transport went away: directions already ended by the remote finish
    /// cleanly, everything else is reset.
    fn fail(&mut self, error: StreamError) {
        if self.is_terminal() {
            return;
        }
        if self.read == ReadState::HalfClosedByRemote {
            self.read = ReadState::Closed;
            self.write = WriteState::Reset;
            self.error = Some(error);
        } else {
            self.reset(error);
        }
    }

    fn push(&mut self, payload: Bytes, high_water_mark: usize) -> Delivery {
        if self.abandoned || self.read != ReadState::Open {
            return Delivery::Dropped;
        }
        if payload.is_empty() {
            return Delivery::Buffered;
        }
        self.buffered += payload.len();
        self.buffer.push_back(payload);
        if self.buffered > high_water_mark {
            Delivery::Pause
        } else {
            Delivery::Buffered
        }
    }

    fn pop(&mut self) -> Option<Bytes> {
        let chunk = self.buffer.pop_front()?;
        self.buffered -= chunk.len();
        Some(chunk)
    }

    fn abandon(&mut self) {
        self.abandoned = true;
        self.buffer.clear();
        self.buffered = 0;
    }
}

/// Stream state shared between the registry and every handle
pub(crate) struct StreamShared {
    id: StreamId,
    /// This peer opened the stream
    initiator: bool,
    name: String,
    inner: Mutex<StreamInner>,
    /// Data or a state change is available to readers
    readable: Notify,
    /// The buffer shrank, or the stream no longer accepts data
    drained: Notify,
    /// The write side was reset; wakes writers waiting for backlog
    write_stopped: Notify,
}

impl StreamShared {
    pub fn new(id: StreamId, initiator: bool, name: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            initiator,
            name,
            inner: Mutex::new(StreamInner::new()),
            readable: Notify::new(),
            drained: Notify::new(),
            write_stopped: Notify::new(),
        })
    }

    /// Append an inbound MESSAGE payload
    pub fn deliver(&self, payload: Bytes, high_water_mark: usize) -> Delivery {
        let mut inner = lock(&self.inner);
        if inner.read == ReadState::HalfClosedByRemote {
            warn!("Stream {} received data after remote close", self.id);
        }
        let delivery = inner.push(payload, high_water_mark);
        drop(inner);

        if delivery != Delivery::Dropped {
            self.readable.notify_waiters();
        }
        delivery
    }

    /// Apply an inbound CLOSE. Returns true once the stream is fully terminated.
    ///
    /// Waiters are not woken; call `wake_all` once the registry is updated.
    pub fn remote_close(&self) -> bool {
        let mut inner = lock(&self.inner);
        inner.remote_close();
        inner.is_terminal()
    }

    pub fn reset(&self, error: StreamError) {
        lock(&self.inner).reset(error);
        self.write_stopped.notify_waiters();
        self.wake_all();
    }

    pub fn fail(&self, error: StreamError) {
        lock(&self.inner).fail(error);
        self.write_stopped.notify_waiters();
        self.wake_all();
    }

    pub fn wake_all(&self) {
        self.readable.notify_waiters();
        self.drained.notify_waiters();
    }

    /// Whether the reader must keep waiting before decoding more frames
    fn needs_drain(&self, low_water_mark: usize) -> bool {
        let inner = lock(&self.inner);
        inner.read == ReadState::Open && !inner.abandoned && inner.buffered > low_water_mark
    }

    /// Wait until this stream's buffer has drained to the low-water mark
    pub async fn wait_for_drain(&self, low_water_mark: usize) {
        loop {
            let mut notified = pin!(self.drained.notified());
            notified.as_mut().enable();
            if !self.needs_drain(low_water_mark) {
                return;
            }
            notified.await;
        }
    }

    async fn read(&self, low_water_mark: usize) -> StreamResult<Option<Bytes>> {
        loop {
            let mut notified = pin!(self.readable.notified());
            notified.as_mut().enable();

            {
                let mut inner = lock(&self.inner);
                if inner.read == ReadState::Reset {
                    return Err(inner.reset_error());
                }
                if let Some(chunk) = inner.pop() {
                    let drained = inner.buffered <= low_water_mark;
                    drop(inner);
                    if drained {
                        self.drained.notify_waiters();
                    }
                    return Ok(Some(chunk));
                }
                if matches!(inner.read, ReadState::HalfClosedByRemote | ReadState::Closed) {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }
}

impl fmt::Debug for StreamShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamShared")
            .field("id", &self.id)
            .field("initiator", &self.initiator)
            .finish()
    }
}

/// Owner of a stream on behalf of the application; abandons the stream when
/// the last `Stream` clone is dropped.
struct StreamHandle {
    shared: Arc<StreamShared>,
    conn: Arc<ConnShared>,
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let id = self.shared.id;
        let terminal = {
            let mut inner = lock(&self.shared.inner);
            if inner.is_terminal() {
                return;
            }
            if let Ok(true) = inner.local_close() {
                let _ = self
                    .conn
                    .send(Outbound::frame(Frame::close(id, self.shared.initiator)));
            }
            inner.abandon();
            inner.is_terminal()
        };
        self.shared.drained.notify_waiters();

        trace!("[{}] Stream {} abandoned", self.conn.id(), id);
        if terminal {
            self.conn.remove_stream(id);
        }
    }
}

/// A multiplexed stream
///
/// Cheap to clone; all clones refer to the same logical stream. Reads return
/// inbound chunks in wire order, writes are split into MESSAGE frames of at
/// most `max_frame_size` bytes.
#[derive(Clone)]
pub struct Stream {
    handle: Arc<StreamHandle>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.handle.shared.id)
            .field("name", &self.handle.shared.name)
            .field("initiator", &self.handle.shared.initiator)
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, conn: Arc<ConnShared>) -> Self {
        Self {
            handle: Arc::new(StreamHandle { shared, conn }),
        }
    }

    fn shared(&self) -> &StreamShared {
        &self.handle.shared
    }

    fn conn(&self) -> &ConnShared {
        &self.handle.conn
    }

    /// Stream id, unique within the connection
    pub fn id(&self) -> StreamId {
        self.shared().id
    }

    /// Name announced in the NEW frame
    pub fn name(&self) -> &str {
        &self.shared().name
    }

    /// Whether this peer opened the stream
    pub fn is_initiator(&self) -> bool {
        self.shared().initiator
    }

    pub fn read_state(&self) -> ReadState {
        lock(&self.shared().inner).read
    }

    pub fn write_state(&self) -> WriteState {
        lock(&self.shared().inner).write
    }

    /// Write `data`, splitting it into frames of at most `max_frame_size`.
    ///
    /// Suspends while the connection's write backlog is full. A reset of the
    /// stream wakes a suspended write, which then fails with the reset error.
    pub async fn write(&self, data: impl Into<Bytes>) -> StreamResult<()> {
        let mut data = data.into();
        let max_frame_size = self.conn().config().max_frame_size;

        if let Some(err) = lock(&self.shared().inner).write_error() {
            return Err(err);
        }

        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(max_frame_size));
            let reserved = loop {
                let mut stopped = pin!(self.shared().write_stopped.notified());
                stopped.as_mut().enable();
                if let Some(err) = lock(&self.shared().inner).write_error() {
                    return Err(err);
                }

                tokio::select! {
                    biased;
                    _ = stopped.as_mut() => continue,
                    reserved = self.conn().reserve_write(chunk.len()) => break reserved,
                }
            };
            let permit = match reserved {
                Ok(permit) => permit,
                Err(cause) => {
                    let inner = lock(&self.shared().inner);
                    return Err(inner.write_error().unwrap_or(StreamError::Connection(cause)));
                }
            };

            let inner = lock(&self.shared().inner);
            if let Some(err) = inner.write_error() {
                return Err(err);
            }
            trace!("Writing {} bytes on stream {}", chunk.len(), self.id());
            let frame = Frame::message(self.id(), self.is_initiator(), chunk);
            self.conn()
                .send(Outbound::frame(frame).with_permit(permit))
                .map_err(StreamError::Connection)?;
        }

        Ok(())
    }

    /// Read the next chunk.
    ///
    /// Returns `Ok(None)` once the remote has closed its side and all buffered
    /// data was consumed. Fails if the stream is reset, even with data still
    /// buffered.
    pub async fn read(&self) -> StreamResult<Option<Bytes>> {
        self.shared()
            .read(self.conn().config().low_water_mark)
            .await
    }

    /// Read until end-of-stream
    pub async fn read_to_end(&self) -> StreamResult<Vec<Bytes>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.read().await? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// Consume the stream as a lazy sequence of chunks.
    ///
    /// The sequence ends after end-of-stream or after yielding one error.
    pub fn into_chunks(self) -> impl futures::Stream<Item = StreamResult<Bytes>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let stream = state?;
            match stream.read().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(stream))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Half-close the write side.
    ///
    /// Resolves once the CLOSE frame has been handed to the transport. Closing
    /// an already closed write side is a no-op.
    pub async fn close(&self) -> StreamResult<()> {
        let (written_tx, written_rx) = oneshot::channel();
        let terminal = {
            let mut inner = lock(&self.shared().inner);
            if !inner.local_close()? {
                return Ok(());
            }
            let frame = Frame::close(self.id(), self.is_initiator());
            self.conn()
                .send(Outbound::frame(frame).notify(written_tx))
                .map_err(StreamError::Connection)?;
            inner.is_terminal()
        };
        debug!("[{}] Closed write side of stream {}", self.conn().id(), self.id());
        if terminal {
            self.conn().remove_stream(self.id());
        }
        self.shared().readable.notify_waiters();

        written_rx
            .await
            .map_err(|_| StreamError::Connection(self.conn().cause()))
    }

    /// Abruptly terminate both directions and notify the remote.
    ///
    /// Buffered data is discarded; pending and future reads and writes fail
    /// with `StreamError::LocalReset`. No-op on a fully terminated stream.
    pub fn reset(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut inner = lock(&self.shared().inner);
            if inner.is_terminal() {
                return;
            }
            inner.reset(StreamError::LocalReset(reason.clone()));
            let _ = self
                .conn()
                .send(Outbound::frame(Frame::reset(self.id(), self.is_initiator())));
        }
        debug!(
            "[{}] Reset stream {}: {}",
            self.conn().id(),
            self.id(),
            reason
        );
        self.conn().remove_stream(self.id());
        self.shared().write_stopped.notify_waiters();
        self.shared().wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionError;

    #[test]
    fn test_half_close_both_sides() {
        let mut inner = StreamInner::new();

        assert_eq!(inner.local_close(), Ok(true));
        assert_eq!(inner.write, WriteState::HalfClosedByLocal);
        assert_eq!(inner.read, ReadState::Open);
        assert!(!inner.is_terminal());

        inner.remote_close();
        assert_eq!(inner.read, ReadState::Closed);
        assert_eq!(inner.write, WriteState::Closed);
        assert!(inner.is_terminal());
    }

    #[test]
    fn test_remote_close_first() {
        let mut inner = StreamInner::new();
        inner.remote_close();
        assert_eq!(inner.read, ReadState::HalfClosedByRemote);
        assert_eq!(inner.write_error(), None);

        assert_eq!(inner.local_close(), Ok(true));
        assert!(inner.is_terminal());
        assert_eq!(inner.local_close(), Ok(false));
    }

    #[test]
    fn test_reset_discards_buffer() {
        let mut inner = StreamInner::new();
        assert_eq!(inner.push(Bytes::from("abc"), 16), Delivery::Buffered);
        inner.reset(StreamError::RemoteReset);

        assert_eq!(inner.buffered, 0);
        assert!(inner.pop().is_none());
        assert_eq!(inner.read, ReadState::Reset);
        assert_eq!(inner.write_error(), Some(StreamError::RemoteReset));
        assert_eq!(inner.local_close(), Err(StreamError::RemoteReset));
    }

    #[test]
    fn test_no_transition_out_of_reset() {
        let mut inner = StreamInner::new();
        inner.reset(StreamError::LocalReset("first".to_string()));
        inner.reset(StreamError::RemoteReset);
        inner.remote_close();
        inner.fail(StreamError::Connection(ConnectionError::TransportClosed));

        assert_eq!(inner.read, ReadState::Reset);
        assert_eq!(
            inner.reset_error(),
            StreamError::LocalReset("first".to_string())
        );
    }

    #[test]
    fn test_fail_keeps_clean_end_after_remote_close() {
        let mut inner = StreamInner::new();
        inner.push(Bytes::from("tail"), 16);
        inner.remote_close();
        inner.fail(StreamError::Connection(ConnectionError::TransportClosed));

        assert_eq!(inner.read, ReadState::Closed);
        assert_eq!(inner.write, WriteState::Reset);
        assert_eq!(inner.pop(), Some(Bytes::from("tail")));
        assert!(inner.write_error().is_some());
    }

    #[test]
    fn test_high_water_mark() {
        let mut inner = StreamInner::new();
        assert_eq!(inner.push(Bytes::from(vec![0; 8]), 10), Delivery::Buffered);
        assert_eq!(inner.push(Bytes::from(vec![0; 8]), 10), Delivery::Pause);
        inner.pop();
        assert_eq!(inner.buffered, 8);
    }

    #[test]
    fn test_data_after_close_or_abandon_dropped() {
        let mut inner = StreamInner::new();
        inner.remote_close();
        assert_eq!(inner.push(Bytes::from("late"), 16), Delivery::Dropped);

        let mut inner = StreamInner::new();
        inner.abandon();
        assert_eq!(inner.push(Bytes::from("late"), 16), Delivery::Dropped);
    }
}
