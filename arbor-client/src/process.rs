//! Client side of a hijacked process stream: demultiplex inbound records to
//! the caller's stdout/stderr writers, copy the caller's stdin into stdin
//! records, deliver the terminal record to whoever waits on the process.

use crate::{
    connection::Transport,
    error::Error,
};
use arbor_server::{
    api::{
        codec,
        model::{ProcessEvent, ProcessPayload},
    },
    backend::{Signal, TtySpec},
};
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::{io, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{watch, Mutex},
    task,
};
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: usize = 16 * 1024;

/// The caller's ends of a process's stdio. A `None` stdin sends no input
/// records; `None` outputs are discarded.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

#[derive(Clone, Debug)]
enum ExitResult {
    Exited(u32),
    Failed(String),
    Torn(String),
}

/// Handle to a process running inside a container.
#[derive(Debug)]
pub struct Process {
    id: u32,
    sink: PayloadSink,
    exit: watch::Receiver<Option<ExitResult>>,
}

impl Process {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the process to exit. Resolves with the exit status from the
    /// terminal record, or with an error if the process failed or the stream
    /// broke.
    pub async fn wait(&self) -> Result<u32, Error> {
        let mut exit = self.exit.clone();
        loop {
            let current = exit.borrow().clone();
            match current {
                Some(ExitResult::Exited(status)) => break Ok(status),
                Some(ExitResult::Failed(message)) => break Err(Error::Process(message)),
                Some(ExitResult::Torn(message)) => break Err(Error::Stream(message)),
                None => {
                    if exit.changed().await.is_err() {
                        break Err(Error::ConnectionClosed);
                    }
                }
            }
        }
    }

    /// Reshape the process's tty.
    pub async fn set_tty(&self, tty: TtySpec) -> Result<(), Error> {
        self.sink.send(ProcessEvent::Tty(tty)).await?;
        Ok(())
    }

    /// Deliver the kill signal.
    pub async fn kill(&self) -> Result<(), Error> {
        self.sink.send(ProcessEvent::Signal(Signal::Kill)).await?;
        Ok(())
    }
}

/// Outbound half of the hijacked connection. Whole records only, serialized
/// by a mutex so concurrent senders never interleave.
#[derive(Clone, Debug)]
struct PayloadSink {
    id: u32,
    sink: Arc<Mutex<SplitSink<Transport, Bytes>>>,
}

impl PayloadSink {
    async fn send(&self, event: ProcessEvent) -> io::Result<()> {
        let payload = event.into_payload(self.id);
        let mut sink = self.sink.lock().await;
        codec::send(&mut *sink, &payload).await
    }

    async fn close(&self) {
        self.sink.lock().await.close().await.ok();
    }
}

/// Turn a hijacked transport into a process handle. The first record must be
/// the handshake carrying the process id.
pub(crate) async fn start(mut transport: Transport, mut io: ProcessIo) -> Result<Process, Error> {
    let hello: ProcessPayload = codec::recv(&mut transport)
        .await?
        .ok_or(Error::ConnectionClosed)?;
    let id = hello
        .process_id
        .ok_or_else(|| Error::Protocol("handshake without process id".to_string()))?;

    let (sink, source) = transport.split();
    let sink = PayloadSink {
        id,
        sink: Arc::new(Mutex::new(sink)),
    };

    let (exit_tx, exit_rx) = watch::channel(None);
    let abort = CancellationToken::new();

    if let Some(stdin) = io.stdin.take() {
        task::spawn(copy_stdin(stdin, sink.clone(), abort.clone()));
    }

    task::spawn(demux(source, io, exit_tx, sink.clone(), abort));

    Ok(Process {
        id,
        sink,
        exit: exit_rx,
    })
}

/// Dispatch inbound records until the terminal one, then tear the
/// connection down.
async fn demux(
    mut source: SplitStream<Transport>,
    mut io: ProcessIo,
    exit: watch::Sender<Option<ExitResult>>,
    sink: PayloadSink,
    abort: CancellationToken,
) {
    let result = loop {
        tokio::select! {
            _ = abort.cancelled() => break ExitResult::Torn("connection closed".to_string()),
            payload = codec::recv::<_, ProcessPayload>(&mut source) => {
                let payload = match payload {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break ExitResult::Torn("connection closed".to_string()),
                    Err(e) => break ExitResult::Torn(e.to_string()),
                };
                match ProcessEvent::try_from(payload) {
                    Ok(ProcessEvent::Stdout(data)) => {
                        if let Some(stdout) = io.stdout.as_mut() {
                            stdout.write_all(&data).await.ok();
                        }
                    }
                    Ok(ProcessEvent::Stderr(data)) => {
                        if let Some(stderr) = io.stderr.as_mut() {
                            stderr.write_all(&data).await.ok();
                        }
                    }
                    Ok(ProcessEvent::Exited(status)) => break ExitResult::Exited(status),
                    Ok(ProcessEvent::Failed(message)) => break ExitResult::Failed(message),
                    Ok(event) => {
                        break ExitResult::Torn(format!("unexpected record {:?}", event))
                    }
                    Err(e) => break ExitResult::Torn(e.to_string()),
                }
            }
        }
    };

    exit.send(Some(result)).ok();
    sink.close().await;
}

/// Copy the caller's stdin into stdin records. End of input sends the
/// stdin-close record; a read error hard-closes the connection.
async fn copy_stdin(
    mut stdin: Box<dyn AsyncRead + Send + Unpin>,
    sink: PayloadSink,
    abort: CancellationToken,
) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => {
                sink.send(ProcessEvent::StdinClose).await.ok();
                break;
            }
            Ok(n) => {
                if sink.send(ProcessEvent::Stdin(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(_) => {
                abort.cancel();
                break;
            }
        }
    }
}
