//! Logical stream multiplexing over a single ADB transport.
//!
//! Each [`Connection`](crate::transport::Connection) runs one dispatch task
//! that owns the write half of the socket and every stream's state. Callers
//! hold [`StreamHandle`]s and talk to the dispatch task by message passing;
//! replies come back on oneshot channels, so a read or write suspends the
//! calling task until the matching frame is delivered or acknowledged.
//!
//! # Stream Lifecycle
//!
//! ```text
//! Closed -> Opening --OKAY--> Open --CLSE--> Closing --CLSE--> Closed
//!              \--CLSE (service rejected)--> Closed
//! ```
//!
//! # Flow Control
//!
//! A stream holds at most one credit. Sending WRTE consumes it; the peer's
//! OKAY restores it. Inbound WRTEs are acknowledged only once a reader has
//! taken the payload, so the peer is held to the same one-in-flight rule.
//!
//! A stream the host closed stays `Closing` until the device answers with
//! CLSE. Streams still waiting after the linger period (the RPC timeout) are
//! dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::protocol::{write_frame, Command, Frame, WireError};
use crate::transport::ConnectionState;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Errors surfaced to stream users.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The device answered OPEN with CLSE.
    #[error("service rejected by device: {0}")]
    ServiceRejected(String),

    /// The owning connection went away while the operation was pending.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The stream has already been closed.
    #[error("stream closed")]
    Closed,

    /// The device did not answer within the RPC timeout.
    #[error("operation timed out")]
    Timeout,

    /// The device broke the stream protocol (e.g. unacknowledged WRTEs).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// State of one logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Point-in-time view of a logical stream, as tracked by the dispatch task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogicalStream {
    /// Host-assigned id, monotonic per connection.
    pub local_id: u32,
    /// Device-assigned id (0 until the OPEN is acknowledged).
    pub remote_id: u32,
    /// The service string sent with OPEN.
    pub service: String,
    pub state: StreamState,
    /// Write credit: 1 when a WRTE may be sent, 0 while one is in flight.
    pub credit: u8,
}

type Reply<T> = oneshot::Sender<Result<T, StreamError>>;

/// Requests sent from connection and stream handles to the dispatch task.
pub(crate) enum MuxRequest {
    Open {
        local_id: u32,
        service: String,
        state: watch::Sender<StreamState>,
        reply: Reply<u32>,
    },
    Write {
        local_id: u32,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    Read {
        local_id: u32,
        reply: Reply<Option<Vec<u8>>>,
    },
    Close {
        local_id: u32,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<LogicalStream>>,
    },
}

// ---------------------------------------------------------------------------
// StreamHandle
// ---------------------------------------------------------------------------

/// Caller-side handle to an open logical stream.
///
/// Dropping the handle closes the stream.
pub struct StreamHandle {
    local_id: u32,
    remote_id: u32,
    service: String,
    max_payload: usize,
    requests: mpsc::UnboundedSender<MuxRequest>,
    state: watch::Receiver<StreamState>,
    closed: AtomicBool,
}

impl StreamHandle {
    pub(crate) fn new(
        local_id: u32,
        remote_id: u32,
        service: String,
        max_payload: usize,
        requests: mpsc::UnboundedSender<MuxRequest>,
        state: watch::Receiver<StreamState>,
    ) -> Self {
        Self {
            local_id,
            remote_id,
            service,
            max_payload: max_payload.max(1),
            requests,
            state,
            closed: AtomicBool::new(false),
        }
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current state of the stream.
    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Send `data` to the device.
    ///
    /// Data larger than the negotiated max payload is split into several
    /// WRTE frames. Each frame waits for the stream's write credit, so this
    /// suspends while a previous WRTE is unacknowledged.
    pub async fn write(&self, data: &[u8]) -> Result<(), StreamError> {
        for chunk in data.chunks(self.max_payload) {
            let (reply, rx) = oneshot::channel();
            self.send(MuxRequest::Write {
                local_id: self.local_id,
                data: chunk.to_vec(),
                reply,
            })?;
            rx.await.map_err(|_| lost())??;
        }
        Ok(())
    }

    /// Receive the next payload from the device.
    ///
    /// Returns `Ok(None)` once the stream has ended.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.send(MuxRequest::Read {
            local_id: self.local_id,
            reply,
        })?;
        rx.await.map_err(|_| lost())?
    }

    /// Read until the device closes the stream.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Close the stream. Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // The dispatch task may already be gone; nothing left to close then.
        let _ = self.requests.send(MuxRequest::Close {
            local_id: self.local_id,
        });
    }

    fn send(&self, request: MuxRequest) -> Result<(), StreamError> {
        self.requests.send(request).map_err(|_| lost())
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("service", &self.service)
            .field("state", &self.state())
            .finish()
    }
}

fn lost() -> StreamError {
    StreamError::ConnectionLost("connection closed".to_string())
}

// ---------------------------------------------------------------------------
// Dispatch task
// ---------------------------------------------------------------------------

struct PendingWrite {
    data: Vec<u8>,
    reply: Reply<()>,
}

struct Slot {
    stream: LogicalStream,
    state_tx: watch::Sender<StreamState>,
    opener: Option<Reply<u32>>,
    writers: VecDeque<PendingWrite>,
    reader: Option<Reply<Option<Vec<u8>>>>,
    /// Inbound payload not yet handed to a reader (and so not yet OKAYed).
    inbound: Option<Vec<u8>>,
    failure: Option<StreamError>,
    /// When the host closed the stream; cleared once the device confirms.
    closing_since: Option<Instant>,
}

impl Slot {
    fn set_state(&mut self, state: StreamState) {
        self.stream.state = state;
        self.state_tx.send_replace(state);
    }

    fn begin_closing(&mut self) {
        self.set_state(StreamState::Closing);
        self.closing_since = Some(Instant::now());
    }

    fn fail_pending(&mut self, err: &StreamError) {
        if let Some(opener) = self.opener.take() {
            let _ = opener.send(Err(err.clone()));
        }
        for writer in self.writers.drain(..) {
            let _ = writer.reply.send(Err(err.clone()));
        }
    }
}

/// Why the dispatch loop stopped.
enum Stop {
    Lost(String),
    Idle,
}

/// Owns the socket's write half and all stream state for one connection.
pub(crate) struct Multiplexer<W> {
    writer: W,
    slots: HashMap<u32, Slot>,
    state: watch::Sender<ConnectionState>,
    /// How long a `Closing` stream waits for the device's CLSE.
    linger: Duration,
}

impl<W> Multiplexer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(writer: W, state: watch::Sender<ConnectionState>, linger: Duration) -> Self {
        Self {
            writer,
            slots: HashMap::new(),
            state,
            linger: linger.max(Duration::from_millis(1)),
        }
    }

    /// Run until the connection is lost, closed by the host, or every
    /// handle has been dropped.
    pub(crate) async fn run(
        mut self,
        mut frames: mpsc::Receiver<Result<Frame, WireError>>,
        mut requests: mpsc::UnboundedReceiver<MuxRequest>,
        cancel: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(self.linger);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stop = loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => Err(Stop::Lost("closed by host".to_string())),
                frame = frames.recv() => match frame {
                    Some(Ok(frame)) => self.on_frame(frame).await,
                    Some(Err(e)) => Err(Stop::Lost(e.to_string())),
                    None => Err(Stop::Lost("reader stopped".to_string())),
                },
                request = requests.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => Err(Stop::Idle),
                },
                _ = sweep.tick() => {
                    self.sweep_closing();
                    Ok(())
                }
            };
            if let Err(stop) = step {
                break stop;
            }
        };

        let reason = match stop {
            Stop::Lost(reason) => reason,
            Stop::Idle => "no remaining handles".to_string(),
        };
        info!(%reason, streams = self.slots.len(), "connection closed");
        self.teardown(&reason);

        requests.close();
        while let Ok(request) = requests.try_recv() {
            reject(request, &reason);
        }
        let _ = self.writer.shutdown().await;
    }

    fn teardown(&mut self, reason: &str) {
        let err = StreamError::ConnectionLost(reason.to_string());
        for (_, mut slot) in self.slots.drain() {
            slot.fail_pending(&err);
            if let Some(reader) = slot.reader.take() {
                let _ = reader.send(Err(err.clone()));
            }
            slot.set_state(StreamState::Closed);
        }
        self.state.send_replace(ConnectionState::Closed);
    }

    /// Drop streams whose CLSE went unanswered for longer than the linger.
    fn sweep_closing(&mut self) {
        let linger = self.linger;
        self.slots.retain(|&local_id, slot| {
            let expired = slot.stream.state == StreamState::Closing
                && slot.closing_since.is_some_and(|since| since.elapsed() >= linger);
            if expired {
                warn!(local_id, service = %slot.stream.service, "device never confirmed close, dropping stream");
                if let Some(reader) = slot.reader.take() {
                    let result = match slot.failure.take() {
                        Some(err) => Err(err),
                        None => Ok(None),
                    };
                    let _ = reader.send(result);
                }
                slot.set_state(StreamState::Closed);
            }
            !expired
        });
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), Stop> {
        trace!(
            command = %frame.command(),
            arg0 = frame.arg0(),
            arg1 = frame.arg1(),
            len = frame.payload().len(),
            "frame sent"
        );
        write_frame(&mut self.writer, &frame)
            .await
            .map_err(|e| Stop::Lost(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------------

    async fn on_frame(&mut self, frame: Frame) -> Result<(), Stop> {
        let (arg0, arg1) = (frame.arg0(), frame.arg1());
        trace!(
            command = %frame.command(),
            arg0,
            arg1,
            len = frame.payload().len(),
            "frame received"
        );

        match frame.command() {
            Command::Okay => self.on_okay(arg0, arg1).await,
            Command::Wrte => self.on_wrte(arg0, arg1, frame.into_payload()).await,
            Command::Clse if arg0 == 0 && arg1 == 0 => {
                Err(Stop::Lost("device closed the connection".to_string()))
            }
            Command::Clse => {
                self.on_clse(arg1);
                Ok(())
            }
            Command::Open => {
                warn!(remote_id = arg0, "refusing device-initiated stream");
                self.send_frame(Frame::new(Command::Clse, 0, arg0, Vec::new())).await
            }
            Command::Cnxn => {
                warn!("ignoring CNXN on an established connection");
                Ok(())
            }
            Command::Auth | Command::Sync => {
                debug!(command = %frame.command(), "ignoring frame");
                Ok(())
            }
        }
    }

    async fn on_okay(&mut self, remote_id: u32, local_id: u32) -> Result<(), Stop> {
        let Some(slot) = self.slots.get_mut(&local_id) else {
            warn!(local_id, "OKAY for unknown stream dropped");
            return Ok(());
        };

        match slot.stream.state {
            StreamState::Opening => {
                slot.stream.remote_id = remote_id;
                slot.stream.credit = 1;
                slot.set_state(StreamState::Open);
                debug!(local_id, remote_id, service = %slot.stream.service, "stream open");
                if let Some(opener) = slot.opener.take() {
                    if opener.send(Ok(remote_id)).is_err() {
                        // The opener gave up (timeout or cancellation).
                        self.close_local(local_id).await?;
                    }
                }
                Ok(())
            }
            StreamState::Open => {
                if slot.stream.credit == 1 {
                    trace!(local_id, "spurious OKAY");
                }
                slot.stream.credit = 1;
                self.pump_writes(local_id).await
            }
            StreamState::Closing if slot.stream.remote_id == 0 => {
                // Opened after the host abandoned it; close it on the device too.
                slot.stream.remote_id = remote_id;
                self.send_frame(Frame::new(Command::Clse, local_id, remote_id, Vec::new()))
                    .await
            }
            StreamState::Closing | StreamState::Closed => Ok(()),
        }
    }

    async fn on_wrte(&mut self, remote_id: u32, local_id: u32, data: Vec<u8>) -> Result<(), Stop> {
        let Some(slot) = self.slots.get_mut(&local_id) else {
            warn!(local_id, "WRTE for unknown stream dropped");
            return Ok(());
        };

        if slot.stream.state != StreamState::Open {
            trace!(local_id, state = ?slot.stream.state, "WRTE on inactive stream dropped");
            return Ok(());
        }

        if slot.inbound.is_some() {
            warn!(local_id, "device sent WRTE before previous one was acknowledged");
            let err = StreamError::ProtocolViolation(
                "WRTE received while previous payload unacknowledged".to_string(),
            );
            slot.inbound = None;
            if let Some(reader) = slot.reader.take() {
                let _ = reader.send(Err(err.clone()));
            }
            slot.failure = Some(err);
            return self.close_local(local_id).await;
        }

        match slot.reader.take() {
            Some(reader) => match reader.send(Ok(Some(data))) {
                Ok(()) => {
                    self.send_frame(Frame::new(Command::Okay, local_id, remote_id, Vec::new()))
                        .await
                }
                Err(Ok(Some(data))) => {
                    slot.inbound = Some(data);
                    Ok(())
                }
                Err(_) => Ok(()),
            },
            None => {
                slot.inbound = Some(data);
                Ok(())
            }
        }
    }

    fn on_clse(&mut self, local_id: u32) {
        let Some(slot) = self.slots.get_mut(&local_id) else {
            debug!(local_id, "CLSE for unknown stream dropped");
            return;
        };

        match slot.stream.state {
            StreamState::Opening => {
                let service = slot.stream.service.clone();
                debug!(local_id, %service, "service rejected");
                if let Some(opener) = slot.opener.take() {
                    let _ = opener.send(Err(StreamError::ServiceRejected(service)));
                }
                slot.set_state(StreamState::Closed);
                self.slots.remove(&local_id);
            }
            StreamState::Open => {
                debug!(local_id, "stream closed by device");
                slot.set_state(StreamState::Closed);
                slot.fail_pending(&StreamError::Closed);
                if slot.inbound.is_none() {
                    if let Some(reader) = slot.reader.take() {
                        let _ = reader.send(Ok(None));
                    }
                    self.slots.remove(&local_id);
                }
            }
            StreamState::Closing | StreamState::Closed => {
                slot.set_state(StreamState::Closed);
                if let Some(reader) = slot.reader.take() {
                    let result = match slot.failure.take() {
                        Some(err) => Err(err),
                        None => Ok(None),
                    };
                    let _ = reader.send(result);
                }
                self.slots.remove(&local_id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Requests from handles
    // -----------------------------------------------------------------------

    async fn on_request(&mut self, request: MuxRequest) -> Result<(), Stop> {
        match request {
            MuxRequest::Open {
                local_id,
                service,
                state,
                reply,
            } => {
                debug!(local_id, %service, "opening stream");
                let frame = Frame::text(Command::Open, local_id, 0, &service);
                let mut slot = Slot {
                    stream: LogicalStream {
                        local_id,
                        remote_id: 0,
                        service,
                        state: StreamState::Closed,
                        credit: 0,
                    },
                    state_tx: state,
                    opener: Some(reply),
                    writers: VecDeque::new(),
                    reader: None,
                    inbound: None,
                    failure: None,
                    closing_since: None,
                };
                slot.set_state(StreamState::Opening);
                self.slots.insert(local_id, slot);
                self.send_frame(frame).await
            }
            MuxRequest::Write {
                local_id,
                data,
                reply,
            } => {
                let Some(slot) = self.slots.get_mut(&local_id) else {
                    let _ = reply.send(Err(StreamError::Closed));
                    return Ok(());
                };
                if slot.stream.state != StreamState::Open {
                    let err = slot.failure.clone().unwrap_or(StreamError::Closed);
                    let _ = reply.send(Err(err));
                    return Ok(());
                }
                slot.writers.push_back(PendingWrite { data, reply });
                self.pump_writes(local_id).await
            }
            MuxRequest::Read { local_id, reply } => self.on_read(local_id, reply).await,
            MuxRequest::Close { local_id } => self.close_local(local_id).await,
            MuxRequest::Snapshot { reply } => {
                let mut streams: Vec<LogicalStream> =
                    self.slots.values().map(|s| s.stream.clone()).collect();
                streams.sort_by_key(|s| s.local_id);
                let _ = reply.send(streams);
                Ok(())
            }
        }
    }

    async fn on_read(&mut self, local_id: u32, reply: Reply<Option<Vec<u8>>>) -> Result<(), Stop> {
        let Some(slot) = self.slots.get_mut(&local_id) else {
            let _ = reply.send(Ok(None));
            return Ok(());
        };

        if let Some(err) = slot.failure.clone() {
            let _ = reply.send(Err(err));
            return Ok(());
        }

        match slot.inbound.take() {
            Some(data) => {
                let state = slot.stream.state;
                let remote_id = slot.stream.remote_id;
                if let Err(Ok(Some(data))) = reply.send(Ok(Some(data))) {
                    slot.inbound = Some(data);
                    return Ok(());
                }
                match state {
                    StreamState::Open => {
                        self.send_frame(Frame::new(Command::Okay, local_id, remote_id, Vec::new()))
                            .await
                    }
                    StreamState::Closed => {
                        // Last payload drained after the device closed.
                        self.slots.remove(&local_id);
                        Ok(())
                    }
                    StreamState::Opening | StreamState::Closing => Ok(()),
                }
            }
            None => {
                match slot.stream.state {
                    StreamState::Open | StreamState::Opening => slot.reader = Some(reply),
                    StreamState::Closing | StreamState::Closed => {
                        let _ = reply.send(Ok(None));
                    }
                }
                Ok(())
            }
        }
    }

    async fn close_local(&mut self, local_id: u32) -> Result<(), Stop> {
        let Some(slot) = self.slots.get_mut(&local_id) else {
            return Ok(());
        };

        match slot.stream.state {
            StreamState::Opening => {
                // remote_id is unknown until OKAY; CLSE is sent if it arrives.
                slot.fail_pending(&StreamError::Closed);
                slot.begin_closing();
                Ok(())
            }
            StreamState::Open => {
                debug!(local_id, "closing stream");
                let remote_id = slot.stream.remote_id;
                slot.fail_pending(&StreamError::Closed);
                slot.inbound = None;
                if slot.failure.is_none() {
                    if let Some(reader) = slot.reader.take() {
                        let _ = reader.send(Ok(None));
                    }
                }
                slot.stream.credit = 0;
                slot.begin_closing();
                self.send_frame(Frame::new(Command::Clse, local_id, remote_id, Vec::new()))
                    .await
            }
            StreamState::Closed => {
                self.slots.remove(&local_id);
                Ok(())
            }
            StreamState::Closing => Ok(()),
        }
    }

    /// Send the next queued write if the stream has credit.
    async fn pump_writes(&mut self, local_id: u32) -> Result<(), Stop> {
        let Some(slot) = self.slots.get_mut(&local_id) else {
            return Ok(());
        };
        if slot.stream.state != StreamState::Open || slot.stream.credit == 0 {
            return Ok(());
        }

        while let Some(write) = slot.writers.pop_front() {
            if write.reply.is_closed() {
                // Writer was cancelled while queued.
                continue;
            }
            slot.stream.credit = 0;
            let remote_id = slot.stream.remote_id;
            let frame = Frame::new(Command::Wrte, local_id, remote_id, write.data);
            let sent = self.send_frame(frame).await;
            let _ = write.reply.send(Ok(()));
            return sent;
        }
        Ok(())
    }
}

fn reject(request: MuxRequest, reason: &str) {
    let err = StreamError::ConnectionLost(reason.to_string());
    match request {
        MuxRequest::Open { state, reply, .. } => {
            state.send_replace(StreamState::Closed);
            let _ = reply.send(Err(err));
        }
        MuxRequest::Write { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        MuxRequest::Read { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        MuxRequest::Close { .. } => {}
        MuxRequest::Snapshot { reply } => {
            let _ = reply.send(Vec::new());
        }
    }
}

/// Wait for an open reply, closing the half-open stream on timeout.
pub(crate) async fn await_open(
    requests: &mpsc::UnboundedSender<MuxRequest>,
    local_id: u32,
    reply: oneshot::Receiver<Result<u32, StreamError>>,
    rpc_timeout: Duration,
) -> Result<u32, StreamError> {
    match tokio::time::timeout(rpc_timeout, reply).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(lost()),
        Err(_) => {
            warn!(local_id, "no answer to OPEN, giving up");
            let _ = requests.send(MuxRequest::Close { local_id });
            Err(StreamError::Timeout)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_error_display() {
        let err = StreamError::ServiceRejected("shell:nope".into());
        assert!(err.to_string().contains("shell:nope"));

        let err = StreamError::ConnectionLost("reset by peer".into());
        assert!(err.to_string().contains("reset by peer"));

        assert!(StreamError::Timeout.to_string().contains("timed out"));
        assert!(StreamError::Closed.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_state_tx, state_rx) = watch::channel(StreamState::Open);
        let handle = StreamHandle::new(1, 9, "shell:".into(), 4096, tx, state_rx);

        handle.close();
        handle.close();
        drop(handle);

        assert!(matches!(rx.recv().await, Some(MuxRequest::Close { local_id: 1 })));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn write_splits_at_max_payload() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_state_tx, state_rx) = watch::channel(StreamState::Open);
        let handle = StreamHandle::new(1, 9, "shell:".into(), 4, tx, state_rx);

        let responder = tokio::spawn(async move {
            let mut chunks = Vec::new();
            while let Some(request) = rx.recv().await {
                if let MuxRequest::Write { data, reply, .. } = request {
                    chunks.push(data);
                    let _ = reply.send(Ok(()));
                }
            }
            chunks
        });

        handle.write(b"abcdefghij").await.unwrap();
        drop(handle);

        let chunks = responder.await.unwrap();
        assert_eq!(chunks, vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]);
    }

    #[tokio::test]
    async fn handle_reports_connection_lost_when_dispatcher_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let (_state_tx, state_rx) = watch::channel(StreamState::Open);
        let mut handle = StreamHandle::new(1, 9, "shell:".into(), 4096, tx, state_rx);

        assert!(matches!(handle.read().await, Err(StreamError::ConnectionLost(_))));
        assert!(matches!(handle.write(b"x").await, Err(StreamError::ConnectionLost(_))));
    }
}
