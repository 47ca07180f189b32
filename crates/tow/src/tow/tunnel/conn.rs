use std::{
    io,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, watch},
};

use crate::tow::tunnel::{
    protocol::{self, Frame, FrameType, LogicalId},
    session::{Session, SessionState},
};

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("dial {remote}: {source}")]
    Dial {
        remote: String,
        #[source]
        source: io::Error,
    },
    #[error("dial {remote}: timed out after {after:?}")]
    DialTimeout { remote: String, after: Duration },
    #[error("conn {0} is not open")]
    NotOpen(LogicalId),
    #[error("session is gone")]
    SessionGone,
    #[error("outbound io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ConnOptions {
    pub dial_timeout: Duration,
    pub read_buffer_bytes: usize,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            read_buffer_bytes: 1024,
        }
    }
}

/// Pumps bytes between one logical id of a session and a real outbound TCP socket.
pub struct Conn {
    id: LogicalId,
    remote: String,
    session: Weak<Session>,
    opts: ConnOptions,
    writer: Mutex<Option<OwnedWriteHalf>>,
    running: AtomicBool,
    stop: watch::Sender<bool>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl Conn {
    pub fn new(
        id: LogicalId,
        remote: impl Into<String>,
        session: Weak<Session>,
        opts: ConnOptions,
    ) -> Arc<Self> {
        let (stop, _rx) = watch::channel(false);
        Arc::new(Self {
            id,
            remote: remote.into(),
            session,
            opts,
            writer: Mutex::new(None),
            running: AtomicBool::new(false),
            stop,
        })
    }

    pub fn id(&self) -> LogicalId {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Dials the outbound address, registers with the owning session and starts the pump.
    ///
    /// On failure one Error frame for this id is sent and nothing is registered.
    pub async fn open(self: &Arc<Self>) -> Result<(), OutboundError> {
        tracing::debug!(cid = self.id, remote = %self.remote, "conn: dialing");

        let dial = TcpStream::connect(self.remote.as_str());
        let stream = match tokio::time::timeout(self.opts.dial_timeout, dial).await {
            Ok(Ok(s)) => s,
            Ok(Err(source)) => {
                return Err(self
                    .report_open_failure(OutboundError::Dial {
                        remote: self.remote.clone(),
                        source,
                    })
                    .await);
            }
            Err(_) => {
                return Err(self
                    .report_open_failure(OutboundError::DialTimeout {
                        remote: self.remote.clone(),
                        after: self.opts.dial_timeout,
                    })
                    .await);
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(cid = self.id, err = %err, "conn: set_nodelay failed");
        }

        let Some(sess) = self.session.upgrade() else {
            return Err(OutboundError::SessionGone);
        };

        let (rd, wr) = stream.into_split();
        *self.writer.lock().await = Some(wr);
        self.running.store(true, Ordering::Release);
        metrics::counter!("tow_conns_total").increment(1);
        metrics::gauge!("tow_active_conns").increment(1.0);

        if !sess.register(self.clone()) {
            let _ = self.close().await;
            return Err(OutboundError::SessionGone);
        }
        tracing::info!(sid = sess.id(), cid = self.id, remote = %self.remote, "conn: connected");

        let this = self.clone();
        tokio::spawn(async move { this.pump(rd).await });
        Ok(())
    }

    async fn report_open_failure(&self, err: OutboundError) -> OutboundError {
        tracing::debug!(cid = self.id, err = %err, "conn: remote failed");
        if let Some(sess) = self.session.upgrade() {
            let frame = Frame::Error {
                id: self.id,
                message: err.to_string(),
            };
            if let Err(send_err) = sess.send(&frame).await {
                tracing::debug!(cid = self.id, err = %send_err, "conn: failed to report error");
            }
        }
        err
    }

    /// Forwards multiplexed bytes to the outbound socket.
    pub async fn write(&self, data: &[u8]) -> Result<(), OutboundError> {
        let mut wr = self.writer.lock().await;
        let wr = wr.as_mut().ok_or(OutboundError::NotOpen(self.id))?;
        wr.write_all(data).await?;
        metrics::counter!("tow_bytes_egress_total").increment(data.len() as u64);
        Ok(())
    }

    /// Stops the pump, tells the peer and shuts the outbound socket. Idempotent.
    pub async fn close(&self) -> Result<(), OutboundError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop.send_replace(true);
        metrics::gauge!("tow_active_conns").decrement(1.0);

        if let Some(sess) = self.session.upgrade() {
            if let Err(err) = sess.send(&Frame::Close { id: self.id }).await {
                tracing::debug!(cid = self.id, err = %err, "conn: failed to send close");
            }
        }

        let wr = self.writer.lock().await.take();
        if let Some(mut wr) = wr {
            wr.shutdown().await?;
        }
        tracing::debug!(cid = self.id, remote = %self.remote, "conn: closed");
        Ok(())
    }

    /// Reports an outbound failure to the peer, closes and leaves the session table.
    pub(crate) async fn fail(self: &Arc<Self>, message: String) {
        let sess = self.session.upgrade();
        if self.is_running() {
            if let Some(sess) = &sess {
                let frame = Frame::Error {
                    id: self.id,
                    message,
                };
                if let Err(err) = sess.send(&frame).await {
                    tracing::debug!(cid = self.id, err = %err, "conn: failed to report error");
                }
            }
        }
        self.release(sess).await;
    }

    async fn release(self: &Arc<Self>, sess: Option<Arc<Session>>) {
        if let Err(err) = self.close().await {
            tracing::debug!(cid = self.id, err = %err, "conn: close failed");
        }
        if let Some(sess) = sess {
            sess.forget(self);
        }
    }

    async fn pump(self: Arc<Self>, mut rd: OwnedReadHalf) {
        let mut stop = self.stop.subscribe();
        let mut buf = vec![0u8; self.opts.read_buffer_bytes.max(1)];

        loop {
            if *stop.borrow_and_update() {
                return;
            }

            tokio::select! {
                res = stop.changed() => {
                    if res.is_err() {
                        return;
                    }
                }
                res = rd.read(&mut buf) => match res {
                    Ok(0) => {
                        tracing::debug!(cid = self.id, remote = %self.remote, "conn: remote closed");
                        let sess = self.session.upgrade();
                        self.release(sess).await;
                        return;
                    }
                    Ok(n) => {
                        if !self.forward(&buf[..n], &mut stop).await {
                            let sess = self.session.upgrade();
                            self.release(sess).await;
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(cid = self.id, err = %err, "conn: read remote failed");
                        self.fail(format!("read remote stream: {err}")).await;
                        return;
                    }
                },
            }
        }
    }

    /// Delivers one chunk as a Data frame. While the session has no usable transport the chunk
    /// is held and the pump stops reading until a transport is attached again.
    ///
    /// Returns false when the chunk can no longer be delivered: the conn was stopped or the
    /// session closed.
    async fn forward(&self, chunk: &[u8], stop: &mut watch::Receiver<bool>) -> bool {
        let Some(sess) = self.session.upgrade() else {
            return false;
        };
        metrics::counter!("tow_bytes_ingress_total").increment(chunk.len() as u64);
        let frame = protocol::encode(FrameType::Data, Some(self.id), chunk);
        let mut state = sess.subscribe_state();

        loop {
            // Mark the current state seen so a swap racing the write still wakes us below.
            let _ = state.borrow_and_update();
            let err = match sess.write(&frame).await {
                Ok(()) => return true,
                Err(err) => err,
            };
            tracing::debug!(sid = sess.id(), cid = self.id, err = %err, "conn: session write failed; holding data");

            loop {
                tokio::select! {
                    res = stop.changed() => {
                        if res.is_err() || *stop.borrow_and_update() {
                            return false;
                        }
                    }
                    res = state.changed() => {
                        if res.is_err() {
                            return false;
                        }
                        match *state.borrow_and_update() {
                            SessionState::Running => break,
                            SessionState::Closed => return false,
                            SessionState::Created | SessionState::Stopped => {}
                        }
                    }
                }
            }
        }
    }
}
