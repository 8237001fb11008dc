//! In process byte pipes connecting the backend's process I/O to the stream
//! pumps. Unlike an OS pipe the write side can be closed *with an error*:
//! a reader that has drained the buffer then observes that error instead of
//! EOF. A torn control connection must not look like end-of-input to the
//! process reading its stdin.

use bytes::{Buf, BytesMut};
use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Buffer capacity of a process pipe. Writers block once the reader lags by
/// this much; there is no buffering beyond it.
pub const CAPACITY: usize = 64 * 1024;

/// Create a connected pipe with the given buffer capacity.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let state = Arc::new(Mutex::new(State {
        buffer: BytesMut::new(),
        capacity,
        closed: None,
        reader_gone: false,
        read_waker: None,
        write_waker: None,
    }));
    (
        PipeWriter {
            state: state.clone(),
        },
        PipeReader { state },
    )
}

#[derive(Debug)]
enum Close {
    Eof,
    Error(io::ErrorKind, String),
}

#[derive(Debug)]
struct State {
    buffer: BytesMut,
    capacity: usize,
    closed: Option<Close>,
    reader_gone: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl State {
    fn close(&mut self, close: Close) {
        if self.closed.is_none() {
            self.closed = Some(close);
        }
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }
}

/// Write end of a [`pipe`]. Dropping it without a clean `shutdown` closes the
/// pipe with a broken-pipe error.
#[derive(Debug)]
pub struct PipeWriter {
    state: Arc<Mutex<State>>,
}

impl PipeWriter {
    /// Close the pipe so that the reader observes `error` once the buffered
    /// bytes are drained.
    pub fn close_with_error(&mut self, error: io::Error) {
        self.lock()
            .close(Close::Error(error.kind(), error.to_string()));
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("pipe lock poisoned")
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.lock();
        if state.closed.is_some() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write side closed",
            )));
        }
        if state.reader_gone {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "read side closed",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let available = state.capacity.saturating_sub(state.buffer.len());
        if available == 0 {
            state.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = available.min(buf.len());
        state.buffer.extend_from_slice(&buf[..n]);
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.lock().close(Close::Eof);
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.lock().close(Close::Error(
            io::ErrorKind::BrokenPipe,
            "write side dropped".to_string(),
        ));
    }
}

/// Read end of a [`pipe`].
#[derive(Debug)]
pub struct PipeReader {
    state: Arc<Mutex<State>>,
}

impl PipeReader {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("pipe lock poisoned")
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.lock();
        if !state.buffer.is_empty() {
            let n = state.buffer.len().min(buf.remaining());
            buf.put_slice(&state.buffer[..n]);
            state.buffer.advance(n);
            if let Some(waker) = state.write_waker.take() {
                waker.wake();
            }
            return Poll::Ready(Ok(()));
        }
        match &state.closed {
            Some(Close::Eof) => Poll::Ready(Ok(())),
            Some(Close::Error(kind, message)) => {
                Poll::Ready(Err(io::Error::new(*kind, message.clone())))
            }
            None => {
                state.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.lock();
        state.reader_gone = true;
        if let Some(waker) = state.write_waker.take() {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bytes_cross_the_pipe_in_order() {
        let (mut writer, mut reader) = pipe(CAPACITY);
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut read = Vec::new();
        reader.read_to_end(&mut read).await.unwrap();
        assert_eq!(read, b"hello world");
    }

    #[tokio::test]
    async fn shutdown_is_a_clean_eof() {
        let (mut writer, mut reader) = pipe(CAPACITY);
        writer.shutdown().await.unwrap();
        assert_eq!(reader.read(&mut [0u8; 8]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_with_error_is_not_eof() {
        let (mut writer, mut reader) = pipe(CAPACITY);
        writer.write_all(b"tail").await.unwrap();
        writer.close_with_error(io::Error::new(io::ErrorKind::ConnectionReset, "gone"));

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn dropping_the_writer_is_an_error_close() {
        let (writer, mut reader) = pipe(CAPACITY);
        drop(writer);
        assert!(reader.read(&mut [0u8; 8]).await.is_err());
    }

    #[tokio::test]
    async fn writes_fail_once_the_reader_is_gone() {
        let (mut writer, reader) = pipe(CAPACITY);
        drop(reader);
        assert!(writer.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn a_full_pipe_applies_back_pressure() {
        let (mut writer, mut reader) = pipe(4);
        writer.write_all(b"abcd").await.unwrap();

        let write = tokio::spawn(async move {
            writer.write_all(b"efgh").await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut read = Vec::new();
        reader.read_to_end(&mut read).await.unwrap();
        assert_eq!(read, b"abcdefgh");
        write.await.unwrap();
    }
}
