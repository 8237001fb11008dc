//! Transport plumbing. Unary requests reuse pooled keep-alive connections;
//! hijacked and body streaming exchanges always dial a fresh connection and
//! never return it to the pool.

use crate::error::Error;
use arbor_server::api::{
    codec::{self, Framed},
    model::{ContentType, Empty, RemoteError, RequestHead, ResponseHead},
    routes::{Operation, Params},
};
use bytes::Bytes;
use futures::{SinkExt, Stream};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, ReadBuf},
    net::{TcpStream, UnixStream},
    sync::Mutex,
    time,
};
use tokio_util::either::Either;
use url::Url;

/// Dial timeout shared by all connection attempts.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

const STREAM_CHUNK_SIZE: usize = 64 * 1024;

pub(crate) type Transport = Framed<Either<TcpStream, UnixStream>>;

#[derive(Debug)]
pub(crate) struct Connection {
    url: Url,
    pool: Mutex<Vec<Transport>>,
}

impl Connection {
    pub(crate) fn new(url: Url) -> Arc<Connection> {
        Arc::new(Connection {
            url,
            pool: Mutex::new(Vec::new()),
        })
    }

    /// Unary exchange without a request body.
    pub(crate) async fn request<Resp>(
        &self,
        operation: Operation,
        params: &Params,
        query: HashMap<String, String>,
    ) -> Result<Resp, Error>
    where
        Resp: DeserializeOwned,
    {
        self.request_with_body::<Empty, Resp>(operation, params, query, None)
            .await
    }

    /// Unary exchange, optionally with a json request body.
    pub(crate) async fn request_with_body<Req, Resp>(
        &self,
        operation: Operation,
        params: &Params,
        query: HashMap<String, String>,
        body: Option<&Req>,
    ) -> Result<Resp, Error>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut transport = self.checkout().await?;

        codec::send(&mut transport, &head(operation, params, query, body.map(|_| ContentType::Json))).await?;
        if let Some(body) = body {
            codec::send(&mut transport, body).await?;
        }

        let response: ResponseHead = codec::recv(&mut transport)
            .await?
            .ok_or(Error::ConnectionClosed)?;

        if response.ok() {
            let body = codec::recv(&mut transport)
                .await?
                .ok_or(Error::ConnectionClosed)?;
            self.checkin(transport).await;
            Ok(body)
        } else {
            let error = failure(&mut transport).await;
            // The exchange is complete; the connection stays usable.
            if matches!(error, Error::Remote(_)) {
                self.checkin(transport).await;
            }
            Err(error)
        }
    }

    /// Start a request on a fresh connection and hand the transport over to
    /// the caller once the server accepted it. Used by run and attach, whose
    /// connection turns into a process stream.
    pub(crate) async fn hijack<Req>(
        &self,
        operation: Operation,
        params: &Params,
        body: Option<&Req>,
    ) -> Result<Transport, Error>
    where
        Req: Serialize,
    {
        let mut transport = self.dial().await?;

        codec::send(&mut transport, &head(operation, params, HashMap::new(), body.map(|_| ContentType::Json))).await?;
        if let Some(body) = body {
            codec::send(&mut transport, body).await?;
        }

        let response: ResponseHead = codec::recv(&mut transport)
            .await?
            .ok_or(Error::ConnectionClosed)?;

        if response.ok() {
            Ok(transport)
        } else {
            Err(failure(&mut transport).await)
        }
    }

    /// Stream `src` as the request body, as a chunk sequence terminated by
    /// the empty frame. Resolves once the server acknowledged the upload.
    pub(crate) async fn stream_in(
        &self,
        params: &Params,
        destination: &str,
        mut src: impl AsyncRead + Unpin,
    ) -> Result<(), Error> {
        let mut transport = self.dial().await?;

        let query = [("destination".to_string(), destination.to_string())]
            .into_iter()
            .collect();
        codec::send(
            &mut transport,
            &head(Operation::StreamIn, params, query, Some(ContentType::Tar)),
        )
        .await?;

        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                transport.send(Bytes::new()).await?;
                break;
            }
            transport.send(Bytes::copy_from_slice(&buf[..n])).await?;
        }

        let response: ResponseHead = codec::recv(&mut transport)
            .await?
            .ok_or(Error::ConnectionClosed)?;
        if response.ok() {
            let _: Empty = codec::recv(&mut transport)
                .await?
                .ok_or(Error::ConnectionClosed)?;
            Ok(())
        } else {
            Err(failure(&mut transport).await)
        }
    }

    /// Request a stream of bytes out of the container. The returned reader
    /// is the live response body; dropping it closes the stream all the way
    /// to the backend.
    pub(crate) async fn stream_out(
        &self,
        params: &Params,
        source: &str,
    ) -> Result<StreamOut, Error> {
        let mut transport = self.dial().await?;

        let query = [("source".to_string(), source.to_string())]
            .into_iter()
            .collect();
        codec::send(
            &mut transport,
            &head(Operation::StreamOut, params, query, None),
        )
        .await?;

        let response: ResponseHead = codec::recv(&mut transport)
            .await?
            .ok_or(Error::ConnectionClosed)?;
        if response.ok() {
            Ok(StreamOut {
                transport: Some(transport),
                chunk: Bytes::new(),
            })
        } else {
            Err(failure(&mut transport).await)
        }
    }

    async fn checkout(&self) -> Result<Transport, Error> {
        if let Some(transport) = self.pool.lock().await.pop() {
            return Ok(transport);
        }
        self.dial().await
    }

    async fn checkin(&self, transport: Transport) {
        self.pool.lock().await.push(transport);
    }

    async fn dial(&self) -> Result<Transport, Error> {
        let io = match self.url.scheme() {
            "tcp" => {
                let address = self
                    .url
                    .socket_addrs(|| None)
                    .map_err(|e| Error::InvalidAddress(e.to_string()))?
                    .first()
                    .ok_or_else(|| Error::InvalidAddress(self.url.to_string()))?
                    .to_owned();
                let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
                    .await
                    .map_err(|_| connect_timeout())??;
                Either::Left(stream)
            }
            "unix" => {
                let stream = time::timeout(CONNECT_TIMEOUT, UnixStream::connect(self.url.path()))
                    .await
                    .map_err(|_| connect_timeout())??;
                Either::Right(stream)
            }
            scheme => return Err(Error::InvalidAddress(format!("unsupported scheme: {scheme}"))),
        };
        Ok(codec::framed(io))
    }
}

fn head(
    operation: Operation,
    params: &Params,
    query: HashMap<String, String>,
    content_type: Option<ContentType>,
) -> RequestHead {
    let (method, _) = operation.route();
    RequestHead {
        method,
        path: operation.path(params),
        query,
        content_type,
    }
}

fn connect_timeout() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connect timeout")
}

/// Read the error body of a non-2xx response.
async fn failure(transport: &mut Transport) -> Error {
    match codec::recv::<_, RemoteError>(transport).await {
        Ok(Some(error)) => Error::Remote(error.message),
        Ok(None) => Error::ConnectionClosed,
        Err(e) => Error::Io(e),
    }
}

/// Live response body of a stream-out request.
#[derive(Debug)]
pub struct StreamOut {
    transport: Option<Transport>,
    chunk: Bytes,
}

impl AsyncRead for StreamOut {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.chunk.is_empty() {
                let n = this.chunk.len().min(buf.remaining());
                buf.put_slice(&this.chunk[..n]);
                this.chunk = this.chunk.slice(n..);
                return Poll::Ready(Ok(()));
            }

            let Some(transport) = this.transport.as_mut() else {
                return Poll::Ready(Ok(()));
            };

            match Pin::new(transport).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    if chunk.is_empty() {
                        this.transport = None;
                        return Poll::Ready(Ok(()));
                    }
                    this.chunk = chunk;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream truncated",
                    )))
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
