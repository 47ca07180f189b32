use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use axum::extract::ws::{Message, WebSocket};
use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// `AsyncRead + AsyncWrite` under one name so it can be boxed as a trait object.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

/// The transport a session owns: anything that reads and writes bytes.
pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Presents an upgraded WebSocket as a byte stream.
///
/// Every `poll_write` becomes one binary message, so a frame written with a single
/// `write_all` reaches the peer as one message. Incoming binary and text messages are
/// concatenated into the read side; ping/pong are handled by the socket itself.
pub struct WsStream {
    inner: WebSocket,
    pending: Bytes,
    eof: bool,
}

impl WsStream {
    pub fn new(inner: WebSocket) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            eof: false,
        }
    }

    pub fn boxed(self) -> BoxedStream {
        Box::new(self)
    }
}

fn ws_err(err: axum::Error) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, err)
}

impl AsyncRead for WsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if self.eof {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(b))) => self.pending = b,
                Some(Ok(Message::Text(t))) => {
                    self.pending = Bytes::copy_from_slice(t.as_str().as_bytes())
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => self.eof = true,
                Some(Err(err)) => return Poll::Ready(Err(ws_err(err))),
            }
        }
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(Pin::new(&mut self.inner).poll_ready(cx)).map_err(ws_err)?;
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(ws_err)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(ws_err)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(ws_err)
    }
}
