use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex, watch},
};

use crate::tow::{
    telemetry,
    tunnel::{
        conn::{Conn, ConnOptions, OutboundError},
        protocol::{Frame, FrameBuffer, FrameError, LogicalId, OpenRequest, SessionId, StreamKind},
        transport::BoxedStream,
    },
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport detached")]
    Detached,
    #[error("transport closed by peer")]
    Eof,
    #[error("transport io: {0}")]
    Io(#[from] io::Error),
    #[error("transport desynchronized: {0}")]
    Desync(#[from] FrameError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{} conn(s) failed to close", .0.len())]
    Conns(Vec<OutboundError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    /// The transport failed; conns are kept until a new transport is attached.
    Stopped,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub keep_alive: Duration,
    pub read_buffer_bytes: usize,
    pub conn: ConnOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(1),
            read_buffer_bytes: 6 * 1024 + 10,
            conn: ConnOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnSnapshot {
    pub id: LogicalId,
    pub remote: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: SessionState,
    pub conns: Vec<ConnSnapshot>,
    pub started_at_unix_ms: u64,
    pub detached_at_unix_ms: Option<u64>,
}

/// One multiplexed transport and the sub-connections carried over it.
///
/// Reads and writes on the transport are each serialized by their own mutex. Anything that
/// needs both (swapping or closing the transport) takes the read lock first.
pub struct Session {
    id: SessionId,
    opts: SessionOptions,
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    conns: DashMap<LogicalId, Arc<Conn>>,
    state: watch::Sender<SessionState>,
    keep_alive_started: AtomicBool,
    started_at_unix_ms: u64,
    // 0 while a transport is attached.
    detached_at_unix_ms: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(id: SessionId, transport: BoxedStream, opts: SessionOptions) -> Arc<Self> {
        let (rd, wr) = tokio::io::split(transport);
        let (state, _rx) = watch::channel(SessionState::Created);
        Arc::new(Self {
            id,
            opts,
            reader: Mutex::new(Some(rd)),
            writer: Mutex::new(Some(wr)),
            conns: DashMap::new(),
            state,
            keep_alive_started: AtomicBool::new(false),
            started_at_unix_ms: telemetry::now_unix_ms(),
            detached_at_unix_ms: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn conn(&self, id: LogicalId) -> Option<Arc<Conn>> {
        self.conns.get(&id).map(|c| c.value().clone())
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// How long the session has been without a working transport.
    pub fn detached_for(&self) -> Option<Duration> {
        let at = self.detached_at_unix_ms.load(Ordering::Acquire);
        if at == 0 {
            return None;
        }
        Some(Duration::from_millis(
            telemetry::now_unix_ms().saturating_sub(at),
        ))
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut conns: Vec<ConnSnapshot> = self
            .conns
            .iter()
            .map(|c| ConnSnapshot {
                id: *c.key(),
                remote: c.value().remote().to_string(),
            })
            .collect();
        conns.sort_by_key(|c| c.id);
        let detached = self.detached_at_unix_ms.load(Ordering::Acquire);
        SessionSnapshot {
            id: self.id,
            state: self.state(),
            conns,
            started_at_unix_ms: self.started_at_unix_ms,
            detached_at_unix_ms: (detached != 0).then_some(detached),
        }
    }

    /// Starts the read loop, and the keep-alive emitter on first start.
    pub fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        let mut started = false;
        self.state.send_if_modified(|st| match st {
            SessionState::Created | SessionState::Stopped => {
                *st = SessionState::Running;
                started = true;
                true
            }
            _ => false,
        });
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if !started {
            return Ok(());
        }

        self.detached_at_unix_ms.store(0, Ordering::Release);
        let this = self.clone();
        tokio::spawn(async move { this.read_loop().await });

        if !self.keep_alive_started.swap(true, Ordering::AcqRel) && !self.opts.keep_alive.is_zero()
        {
            self.spawn_keep_alive();
        }
        tracing::debug!(sid = self.id, "session: started");
        Ok(())
    }

    /// Writes one encoded frame to the transport.
    pub async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut wr = self.writer.lock().await;
        let wr = wr.as_mut().ok_or(TransportError::Detached)?;
        wr.write_all(frame).await?;
        wr.flush().await?;
        metrics::counter!("tow_frames_out_total").increment(1);
        Ok(())
    }

    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.write(&frame.encode()).await
    }

    /// Replaces the transport and restarts the read loop. Open conns are kept.
    pub async fn set_transport(self: &Arc<Self>, transport: BoxedStream) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.state.send_if_modified(|st| {
            if *st == SessionState::Running {
                *st = SessionState::Stopped;
                true
            } else {
                false
            }
        });

        {
            let mut reader = self.reader.lock().await;
            let mut writer = self.writer.lock().await;
            if self.is_closed() {
                return Err(SessionError::Closed);
            }

            reader.take();
            if let Some(mut old) = writer.take() {
                if let Err(err) = old.shutdown().await {
                    tracing::debug!(sid = self.id, err = %err, "session: closing old transport failed");
                }
            }

            let (rd, wr) = tokio::io::split(transport);
            *reader = Some(rd);
            *writer = Some(wr);
        }

        tracing::info!(sid = self.id, conns = self.conns.len(), "session: transport replaced");
        self.start()
    }

    /// Closes the transport and every conn. Idempotent; per-conn failures are collected.
    pub async fn close(&self) -> Result<(), SessionError> {
        let mut first = false;
        self.state.send_if_modified(|st| {
            if *st == SessionState::Closed {
                false
            } else {
                *st = SessionState::Closed;
                first = true;
                true
            }
        });
        if !first {
            return Ok(());
        }

        {
            let mut reader = self.reader.lock().await;
            let mut writer = self.writer.lock().await;
            reader.take();
            if let Some(mut wr) = writer.take() {
                if let Err(err) = wr.shutdown().await {
                    tracing::debug!(sid = self.id, err = %err, "session: closing transport failed");
                }
            }
        }

        let ids: Vec<LogicalId> = self.conns.iter().map(|c| *c.key()).collect();
        let mut errs = Vec::new();
        for id in ids {
            let Some((_, conn)) = self.conns.remove(&id) else {
                continue;
            };
            if let Err(err) = conn.close().await {
                tracing::debug!(sid = self.id, cid = id, err = %err, "session: conn close failed");
                errs.push(err);
            }
        }

        tracing::info!(sid = self.id, "session: closed");
        if errs.is_empty() {
            Ok(())
        } else {
            Err(SessionError::Conns(errs))
        }
    }

    /// Adds an opened conn to the table. Returns false when the session is already closed.
    pub(crate) fn register(&self, conn: Arc<Conn>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.conns.insert(conn.id(), conn);
        true
    }

    /// Removes `conn` from the table unless another conn has taken its id since.
    pub(crate) fn forget(&self, conn: &Arc<Conn>) {
        self.conns.remove_if(&conn.id(), |_, c| Arc::ptr_eq(c, conn));
    }

    pub async fn dispatch(self: &Arc<Self>, frame: Frame) {
        metrics::counter!("tow_frames_in_total", "type" => frame.kind().as_str()).increment(1);
        tracing::trace!(sid = self.id, cid = ?frame.id(), kind = %frame.kind(), "session: frame");

        match frame {
            Frame::Open(req) => self.open_conn(req).await,
            Frame::Data { id, payload } => {
                let Some(conn) = self.conn(id) else {
                    tracing::debug!(sid = self.id, cid = id, "session: data for unknown conn dropped");
                    return;
                };
                if let Err(err) = conn.write(&payload).await {
                    tracing::debug!(sid = self.id, cid = id, err = %err, "session: write to remote failed");
                    conn.fail(format!("write remote stream: {err}")).await;
                }
            }
            // Teardown is driven by Error frames; Close is only ever sent to the peer.
            Frame::Close { .. } => {}
            Frame::Error { id, message } => {
                let Some((_, conn)) = self.conns.remove(&id) else {
                    return;
                };
                tracing::debug!(sid = self.id, cid = id, message = %message, "session: peer reported error");
                if let Err(err) = conn.close().await {
                    tracing::debug!(sid = self.id, cid = id, err = %err, "session: conn close failed");
                }
            }
            Frame::Alive => {}
            Frame::GetId { id } => {
                tracing::debug!(sid = self.id, announced = id, "session: peer announced id");
            }
        }
    }

    async fn open_conn(self: &Arc<Self>, req: OpenRequest) {
        if let Some((_, old)) = self.conns.remove(&req.id) {
            tracing::debug!(sid = self.id, cid = req.id, "session: replacing open conn");
            if let Err(err) = old.close().await {
                tracing::debug!(sid = self.id, cid = req.id, err = %err, "session: conn close failed");
            }
        }

        if req.kind == StreamKind::Udp {
            let frame = Frame::Error {
                id: req.id,
                message: "udp is not supported".into(),
            };
            if let Err(err) = self.send(&frame).await {
                tracing::debug!(sid = self.id, cid = req.id, err = %err, "session: failed to report error");
            }
            return;
        }

        let conn = Conn::new(
            req.id,
            req.remote,
            Arc::downgrade(self),
            self.opts.conn.clone(),
        );
        if let Err(err) = conn.open().await {
            tracing::debug!(sid = self.id, cid = req.id, err = %err, "session: open failed");
        }
    }

    async fn read_loop(self: Arc<Self>) {
        let mut state = self.state.subscribe();
        let mut reader = self.reader.lock().await;

        let res = match reader.as_mut() {
            Some(rd) => self.read_frames(rd, &mut state).await,
            None => Err(TransportError::Detached),
        };
        let Err(err) = res else {
            return;
        };

        tracing::debug!(sid = self.id, err = %err, "session: read loop stopped");
        reader.take();
        if let Some(mut wr) = self.writer.lock().await.take() {
            let _ = wr.shutdown().await;
        }
        let stopped = self.state.send_if_modified(|st| {
            if *st == SessionState::Running {
                *st = SessionState::Stopped;
                true
            } else {
                false
            }
        });
        if stopped {
            self.detached_at_unix_ms
                .store(telemetry::now_unix_ms().max(1), Ordering::Release);
            tracing::info!(sid = self.id, conns = self.conns.len(), "session: transport lost");
        }
    }

    /// Returns `Ok` when asked to stop, or the transport failure that ended reading.
    async fn read_frames(
        self: &Arc<Self>,
        rd: &mut ReadHalf<BoxedStream>,
        state: &mut watch::Receiver<SessionState>,
    ) -> Result<(), TransportError> {
        let mut buf = vec![0u8; self.opts.read_buffer_bytes.max(64)];
        let mut frames = FrameBuffer::new();

        loop {
            if *state.borrow_and_update() != SessionState::Running {
                return Ok(());
            }

            tokio::select! {
                res = state.changed() => {
                    if res.is_err() {
                        return Ok(());
                    }
                }
                res = rd.read(&mut buf) => {
                    let n = res?;
                    if n == 0 {
                        return Err(TransportError::Eof);
                    }
                    frames.extend(&buf[..n]);
                    self.drain_frames(&mut frames).await?;
                }
            }
        }
    }

    async fn drain_frames(self: &Arc<Self>, frames: &mut FrameBuffer) -> Result<(), FrameError> {
        loop {
            match frames.next_frame() {
                Ok(Some(frame)) => self.dispatch(frame).await,
                Ok(None) => return Ok(()),
                Err(err) => {
                    metrics::counter!("tow_frame_errors_total").increment(1);
                    if err.is_fatal() {
                        frames.clear();
                        return Err(err);
                    }
                    tracing::warn!(sid = self.id, err = %err, "session: dropped malformed frame");
                }
            }
        }
    }

    fn spawn_keep_alive(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut state = self.state.subscribe();
        let every = self.opts.keep_alive;
        let alive = Frame::Alive.encode();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;

            loop {
                tokio::select! {
                    res = state.changed() => {
                        if res.is_err() || *state.borrow() == SessionState::Closed {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        let Some(sess) = weak.upgrade() else {
                            break;
                        };
                        if sess.state() != SessionState::Running {
                            continue;
                        }
                        tracing::trace!(sid = sess.id, "session: keep alive");
                        if let Err(err) = sess.write(&alive).await {
                            tracing::debug!(sid = sess.id, err = %err, "session: keep alive failed");
                        }
                    }
                }
            }
        });
    }
}
