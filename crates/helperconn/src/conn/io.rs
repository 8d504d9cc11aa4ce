//! tokio `AsyncRead`/`AsyncWrite` adapter for [`CommandConn`]
//!
//! Lets hyper (or anything else speaking tokio I/O) use a helper connection
//! like a socket. `poll_shutdown` maps to `close_write`, so HTTP clients
//! that half-close after a request body still receive the response.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::CommandConn;
use crate::error::{ConnError, Result};

/// A [`CommandConn`] usable through tokio's I/O traits
pub struct ConnIo {
    conn: Arc<CommandConn>,
    pending_read: Option<BoxFuture<'static, Result<Bytes>>>,
    leftover: Bytes,
    pending_write: Option<BoxFuture<'static, Result<usize>>>,
    flushed_write: Option<usize>,
    pending_shutdown: Option<BoxFuture<'static, Result<()>>>,
}

impl ConnIo {
    pub(crate) fn new(conn: Arc<CommandConn>) -> Self {
        Self {
            conn,
            pending_read: None,
            leftover: Bytes::new(),
            pending_write: None,
            flushed_write: None,
            pending_shutdown: None,
        }
    }

    /// The underlying connection, e.g. to close it once the client is done
    pub fn conn(&self) -> &Arc<CommandConn> {
        &self.conn
    }
}

impl std::fmt::Debug for ConnIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnIo")
            .field("conn", &self.conn)
            .field("leftover", &self.leftover.len())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for ConnIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.leftover.is_empty() {
            let fut = this.pending_read.get_or_insert_with(|| {
                let conn = this.conn.clone();
                let len = buf.remaining();
                let read: BoxFuture<'static, Result<Bytes>> = Box::pin(async move {
                    let mut chunk = vec![0u8; len];
                    let n = conn.read(&mut chunk).await?;
                    chunk.truncate(n);
                    Ok::<_, ConnError>(Bytes::from(chunk))
                });
                read
            });
            let res = ready!(fut.as_mut().poll(cx));
            this.pending_read = None;
            this.leftover = res?;
        }

        let n = this.leftover.len().min(buf.remaining());
        buf.put_slice(&this.leftover.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl ConnIo {
    fn poll_pending_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Option<usize>>> {
        let Some(fut) = self.pending_write.as_mut() else {
            return Poll::Ready(Ok(None));
        };
        let res = ready!(fut.as_mut().poll(cx));
        self.pending_write = None;
        Poll::Ready(res.map(Some).map_err(Into::into))
    }
}

impl AsyncWrite for ConnIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if let Some(n) = this.flushed_write.take() {
            return Poll::Ready(Ok(n));
        }
        if this.pending_write.is_none() {
            let conn = this.conn.clone();
            let data = buf.to_vec();
            let write: BoxFuture<'static, Result<usize>> =
                Box::pin(async move { conn.write(&data).await });
            this.pending_write = Some(write);
        }
        match ready!(this.poll_pending_write(cx)) {
            Ok(Some(n)) => Poll::Ready(Ok(n)),
            Ok(None) => Poll::Ready(Ok(0)),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Every completed write has already been flushed to the pipe; only a
        // write still in flight needs driving. Its count is reported by the
        // next poll_write, which must retry the same buffer prefix.
        let this = &mut *self;
        if let Some(n) = ready!(this.poll_pending_write(cx))? {
            this.flushed_write = Some(n);
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        let this = &mut *self;
        // The write was accepted; no poll_write will come to collect it.
        this.flushed_write = None;
        let fut = this.pending_shutdown.get_or_insert_with(|| {
            let conn = this.conn.clone();
            let shutdown: BoxFuture<'static, Result<()>> =
                Box::pin(async move { conn.close_write().await });
            shutdown
        });
        let res = ready!(fut.as_mut().poll(cx));
        this.pending_shutdown = None;
        Poll::Ready(res.map_err(Into::into))
    }
}
