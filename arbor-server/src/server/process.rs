//! Server side of a hijacked process stream. After the response head the
//! connection carries framed `ProcessPayload` records in both directions:
//! stdin, tty and signal records inbound, output and the terminal record
//! outbound. Three pumps and a waiter share the connection; the outbound
//! half is serialized by a mutex so records never interleave.

use crate::{
    api::{
        codec::{self, Framed},
        model::{ProcessEvent, ProcessPayload, ResponseHead},
    },
    backend::{Container, Process, ProcessIo, ProcessSpec},
    server::{
        connection::respond_error,
        grace::GraceTimers,
        pipe::{self, PipeReader, PipeWriter},
    },
};
use bytes::Bytes;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use log::{debug, warn};
use std::{io, pin::Pin, sync::Arc, task::Poll};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    sync::Mutex,
    task,
};
use tokio_util::sync::CancellationToken;

/// Output is forwarded in reads of at most this size, one record per read.
const CHUNK_SIZE: usize = 16 * 1024;

type Sink<T> = Arc<Mutex<SplitSink<Framed<T>, Bytes>>>;

pub(crate) enum Start {
    Run(ProcessSpec),
    Attach(u32),
}

/// Start or attach to a process and stream it over `stream`. Returns the
/// transport for further keep-alive use if the exchange failed before the
/// hijack, `None` once the connection was consumed by the stream.
pub(crate) async fn handle<T>(
    mut stream: Framed<T>,
    container: Arc<dyn Container>,
    handle: String,
    start: Start,
    graces: Arc<GraceTimers>,
    stop: CancellationToken,
) -> io::Result<Option<Framed<T>>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut stdin_writer, stdin_reader) = pipe::pipe(pipe::CAPACITY);
    let (stdout_writer, stdout_reader) = pipe::pipe(pipe::CAPACITY);
    let (stderr_writer, stderr_reader) = pipe::pipe(pipe::CAPACITY);

    let io = ProcessIo {
        stdin: stdin_reader,
        stdout: stdout_writer,
        stderr: stderr_writer,
    };

    let process = match &start {
        Start::Run(spec) => container.run(spec.clone(), io).await,
        Start::Attach(pid) => container.attach(*pid, io).await,
    };

    let process = match process {
        Ok(process) => process,
        Err(e) => {
            // The process never consumed any input; its stdin ends cleanly.
            stdin_writer.shutdown().await.ok();
            respond_error(&mut stream, ResponseHead::INTERNAL, e.into()).await?;
            return Ok(Some(stream));
        }
    };

    graces.reset(&handle);

    codec::send(&mut stream, &ResponseHead::OK).await?;
    stream_process(
        stream,
        process,
        handle,
        stdin_writer,
        stdout_reader,
        stderr_reader,
        graces,
        stop,
    )
    .await;

    Ok(None)
}

#[allow(clippy::too_many_arguments)]
async fn stream_process<T>(
    stream: Framed<T>,
    process: Arc<dyn Process>,
    handle: String,
    stdin_writer: PipeWriter,
    stdout_reader: PipeReader,
    stderr_reader: PipeReader,
    graces: Arc<GraceTimers>,
    stop: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let pid = process.id();
    let (sink, mut source) = stream.split();
    let sink: Sink<T> = Arc::new(Mutex::new(sink));

    // Handshake record. The client learns the process id from it.
    if send(&sink, ProcessEvent::Hello(pid).into_payload(pid))
        .await
        .is_err()
    {
        return;
    }

    // Cancelled once wait returned: the pumps forward what is buffered and
    // stop, so the terminal record is the last one on the wire.
    let pumps_stop = CancellationToken::new();
    let stdout_pump = task::spawn(pump(
        stdout_reader,
        ProcessEvent::Stdout,
        pid,
        sink.clone(),
        pumps_stop.clone(),
    ));
    let stderr_pump = task::spawn(pump(
        stderr_reader,
        ProcessEvent::Stderr,
        pid,
        sink.clone(),
        pumps_stop.clone(),
    ));

    // Cancelled once the terminal record went out.
    let done = CancellationToken::new();

    let waiter = {
        let sink = sink.clone();
        let process = process.clone();
        let done = done.clone();
        async move {
            let result = process.wait().await;
            pumps_stop.cancel();
            stdout_pump.await.ok();
            stderr_pump.await.ok();

            let event = match result {
                Ok(status) => {
                    debug!("Process {} exited with status {}", pid, status);
                    ProcessEvent::Exited(status)
                }
                Err(e) => {
                    debug!("Process {} failed: {}", pid, e);
                    ProcessEvent::Failed(e.to_string())
                }
            };

            let mut sink = sink.lock().await;
            codec::send(&mut *sink, &event.into_payload(pid)).await.ok();
            sink.close().await.ok();
            drop(sink);
            done.cancel();
        }
    };

    let stdin_pump = async {
        let mut stdin_writer = Some(stdin_writer);
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = stop.cancelled() => {
                    // Shutdown must not look like end-of-input to the process.
                    if let Some(mut writer) = stdin_writer.take() {
                        writer.close_with_error(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "connection closed",
                        ));
                    }
                    break;
                }
                payload = codec::recv::<_, ProcessPayload>(&mut source) => {
                    let payload = match payload {
                        Ok(Some(payload)) => payload,
                        Ok(None) => break,
                        Err(e) => {
                            debug!("Process {} stream closed: {}", pid, e);
                            break;
                        }
                    };

                    graces.reset(&handle);

                    match ProcessEvent::try_from(payload) {
                        Ok(ProcessEvent::Stdin(data)) => {
                            if let Some(writer) = stdin_writer.as_mut() {
                                if let Err(e) = writer.write_all(&data).await {
                                    debug!("Stdin of process {} is closed: {}", pid, e);
                                    stdin_writer.take();
                                }
                            }
                        }
                        Ok(ProcessEvent::StdinClose) => {
                            if let Some(mut writer) = stdin_writer.take() {
                                writer.shutdown().await.ok();
                            }
                        }
                        Ok(ProcessEvent::Tty(tty)) => {
                            if let Err(e) = process.set_tty(tty).await {
                                warn!("Failed to resize tty of process {}: {}", pid, e);
                            }
                        }
                        Ok(ProcessEvent::Signal(signal)) => {
                            if let Err(e) = process.signal(signal).await {
                                warn!("Failed to signal process {}: {}", pid, e);
                            }
                        }
                        Ok(event) => {
                            warn!(
                                "Protocol violation on stream of process {}: unexpected {:?}",
                                pid, event
                            );
                            break;
                        }
                        Err(e) => {
                            warn!("Protocol violation on stream of process {}: {}", pid, e);
                            break;
                        }
                    }
                }
            }
        }
        // An open stdin writer is dropped here, which surfaces an error to
        // the reading process rather than a spurious EOF.
    };

    tokio::join!(waiter, stdin_pump);
}

/// Forward output from `reader` to the connection, one record per read. On
/// `stop` the remaining buffered bytes are flushed and the pump ends.
async fn pump<T>(
    mut reader: PipeReader,
    event: fn(Vec<u8>) -> ProcessEvent,
    pid: u32,
    sink: Sink<T>,
    stop: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(n) => n,
                Err(_) => break,
            },
            _ = stop.cancelled() => {
                drain(reader, event, pid, &sink).await;
                return;
            }
        };
        if n == 0 {
            break;
        }
        if send(&sink, event(buf[..n].to_vec()).into_payload(pid))
            .await
            .is_err()
        {
            break;
        }
    }
}

/// Forward what is already buffered in `reader` without waiting for more.
async fn drain<T>(mut reader: PipeReader, event: fn(Vec<u8>) -> ProcessEvent, pid: u32, sink: &Sink<T>)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = futures::future::poll_fn(|cx| {
            let mut read_buf = ReadBuf::new(&mut buf);
            match Pin::new(&mut reader).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => Poll::Ready(read_buf.filled().len()),
                Poll::Ready(Err(_)) | Poll::Pending => Poll::Ready(0),
            }
        })
        .await;
        if n == 0 {
            break;
        }
        if send(sink, event(buf[..n].to_vec()).into_payload(pid))
            .await
            .is_err()
        {
            break;
        }
    }
}

/// Send one whole record under the connection's write lock.
async fn send<T>(sink: &Sink<T>, payload: ProcessPayload) -> io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut sink = sink.lock().await;
    codec::send(&mut *sink, &payload).await
}
