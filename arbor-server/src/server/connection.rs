//! Per connection request loop: decode a request head, route it, decode the
//! body if the operation carries one, resolve the container, invoke the
//! backend and encode the response. Unary exchanges keep the connection
//! alive; run/attach hand it over to the process stream and stream-in/out
//! consume it for their body.

use crate::{
    api::{
        codec::{self, Framed},
        model::{
            CreateRequest, CreateResponse, DestroyResponse, Empty, GetPropertyResponse,
            ListResponse, NetInRequest, NetInResponse, NetOutRequest, RemoteError, RequestHead,
            ResponseHead, RunRequest, SetPropertyRequest, StopRequest,
        },
        routes::{self, Operation, Params},
    },
    backend::{BackendError, Container, ProcessSpec, Properties, Signal},
    server::{pipe, process, Context},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use serde::{de::DeserializeOwned, Serialize};
use std::{io, sync::Arc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Serve requests on `io` until the peer disconnects, the server stops or
/// the connection is consumed by a streaming operation.
pub(crate) async fn connection<T>(io: T, peer: String, context: Arc<Context>) -> io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!("Client {} connected", peer);

    let mut transport = codec::framed_with_max_length(io, context.config.max_frame_length);

    loop {
        let head = tokio::select! {
            _ = context.stop.cancelled() => break,
            head = codec::recv::<_, RequestHead>(&mut transport) => match head {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(e) => {
                    debug!("Client {} connection error: {}", peer, e);
                    break;
                }
            }
        };

        trace!("{}: --> {} {}", peer, head.method, head.path);

        transport = match request(head, transport, &context).await? {
            Some(transport) => transport,
            None => return Ok(()),
        };
    }

    debug!("Client {} disconnected", peer);
    Ok(())
}

/// Handle one request. Returns the transport for the next keep-alive
/// exchange, or `None` once the connection was consumed.
async fn request<T>(
    head: RequestHead,
    mut stream: Framed<T>,
    context: &Arc<Context>,
) -> io::Result<Option<Framed<T>>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some((operation, params)) = routes::resolve(head.method, &head.path) else {
        let error = RemoteError {
            message: format!("unknown route: {} {}", head.method, head.path),
            ..Default::default()
        };
        respond_error(&mut stream, ResponseHead::NOT_FOUND, error).await?;
        return Ok(Some(stream));
    };

    let backend = &context.backend;

    match operation {
        Operation::Ping => {
            let result = backend.ping().await.map(|_| Empty::default());
            reply(&mut stream, result).await?;
        }
        Operation::Capacity => {
            reply(&mut stream, backend.capacity().await).await?;
        }
        Operation::List => {
            let filter: Properties = head.query.clone();
            let result = backend.containers(filter).await.map(|containers| {
                let handles = containers
                    .iter()
                    .map(|container| container.handle().to_string())
                    .collect();
                ListResponse { handles }
            });
            reply(&mut stream, result).await?;
        }
        Operation::Create => {
            let request: CreateRequest = body(&mut stream).await?;
            let spec = request.into_spec(context.config.grace_time);
            match backend.create(spec).await {
                Ok(container) => {
                    let handle = container.handle().to_string();
                    let grace_time = backend.grace_time(container.as_ref());
                    context.graces.arm(handle.clone(), grace_time);
                    respond(
                        &mut stream,
                        &CreateResponse {
                            handle: Some(handle),
                        },
                    )
                    .await?;
                }
                Err(e) => respond_error(&mut stream, ResponseHead::INTERNAL, e.into()).await?,
            }
        }
        Operation::Destroy => {
            let handle = params.handle.clone().unwrap_or_default();

            // At most one destroy may be in flight per handle. Successful
            // destroys leave a tombstone; from then on lookups fail anyway.
            let destroying = context
                .destroying
                .lock()
                .expect("destroy lock poisoned")
                .insert(handle.clone());
            if !destroying {
                let error = RemoteError {
                    message: format!("already destroying handle: {}", handle),
                    ..Default::default()
                };
                respond_error(&mut stream, ResponseHead::INTERNAL, error).await?;
                return Ok(Some(stream));
            }

            context.graces.defuse(&handle);

            match backend.destroy(&handle).await {
                Ok(()) => respond(&mut stream, &DestroyResponse::default()).await?,
                Err(e) => {
                    // Allow a retry. The grace timer is gone for good; the
                    // client owns the container's fate now.
                    context
                        .destroying
                        .lock()
                        .expect("destroy lock poisoned")
                        .remove(&handle);
                    respond_error(&mut stream, ResponseHead::INTERNAL, e.into()).await?;
                }
            }
        }
        Operation::Info => {
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            touch(context, &handle, container.info().await, &mut stream).await?;
        }
        Operation::Stop => {
            let request: StopRequest = body(&mut stream).await?;
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            let result = container.stop(request.kill).await.map(|_| Empty::default());
            touch(context, &handle, result, &mut stream).await?;
        }
        Operation::LimitBandwidth => {
            let request = body(&mut stream).await?;
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            let result = match container.limit_bandwidth(request).await {
                Ok(()) => container.current_bandwidth_limits().await,
                Err(e) => Err(e),
            };
            touch(context, &handle, result, &mut stream).await?;
        }
        Operation::CurrentBandwidthLimits => {
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            touch(
                context,
                &handle,
                container.current_bandwidth_limits().await,
                &mut stream,
            )
            .await?;
        }
        Operation::LimitCpu => {
            let request = body(&mut stream).await?;
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            let result = match container.limit_cpu(request).await {
                Ok(()) => container.current_cpu_limits().await,
                Err(e) => Err(e),
            };
            touch(context, &handle, result, &mut stream).await?;
        }
        Operation::CurrentCpuLimits => {
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            touch(
                context,
                &handle,
                container.current_cpu_limits().await,
                &mut stream,
            )
            .await?;
        }
        Operation::LimitDisk => {
            let request = body(&mut stream).await?;
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            let result = match container.limit_disk(request).await {
                Ok(()) => container.current_disk_limits().await,
                Err(e) => Err(e),
            };
            touch(context, &handle, result, &mut stream).await?;
        }
        Operation::CurrentDiskLimits => {
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            touch(
                context,
                &handle,
                container.current_disk_limits().await,
                &mut stream,
            )
            .await?;
        }
        Operation::LimitMemory => {
            let request = body(&mut stream).await?;
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            let result = match container.limit_memory(request).await {
                Ok(()) => container.current_memory_limits().await,
                Err(e) => Err(e),
            };
            touch(context, &handle, result, &mut stream).await?;
        }
        Operation::CurrentMemoryLimits => {
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            touch(
                context,
                &handle,
                container.current_memory_limits().await,
                &mut stream,
            )
            .await?;
        }
        Operation::NetIn => {
            let request: NetInRequest = body(&mut stream).await?;
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            let result = container
                .net_in(request.host_port, request.container_port)
                .await
                .map(|(host_port, container_port)| NetInResponse {
                    host_port,
                    container_port,
                });
            touch(context, &handle, result, &mut stream).await?;
        }
        Operation::NetOut => {
            let request: NetOutRequest = body(&mut stream).await?;
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };

            let port_range = request.port_range.unwrap_or_default();
            if !port_range.is_empty() && parse_port_range(&port_range).is_none() {
                let error = RemoteError {
                    message: format!("invalid port range: {:?}", port_range),
                    ..Default::default()
                };
                respond_error(&mut stream, ResponseHead::BAD_REQUEST, error).await?;
                return Ok(Some(stream));
            }

            let result = container
                .net_out(
                    request.network.as_deref().unwrap_or_default(),
                    request.port,
                    &port_range,
                    request.protocol,
                )
                .await
                .map(|_| Empty::default());
            touch(context, &handle, result, &mut stream).await?;
        }
        Operation::GetProperty => {
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            let key = params.key.clone().unwrap_or_default();
            let result = container
                .property(&key)
                .await
                .map(|value| GetPropertyResponse { value });
            touch(context, &handle, result, &mut stream).await?;
        }
        Operation::SetProperty => {
            let request: SetPropertyRequest = body(&mut stream).await?;
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            let key = params.key.clone().unwrap_or_default();
            let result = container
                .set_property(&key, &request.value)
                .await
                .map(|_| Empty::default());
            touch(context, &handle, result, &mut stream).await?;
        }
        Operation::RemoveProperty => {
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            let key = params.key.clone().unwrap_or_default();
            let result = container
                .remove_property(&key)
                .await
                .map(|_| Empty::default());
            touch(context, &handle, result, &mut stream).await?;
        }
        Operation::StreamIn => {
            // On any refusal the body chunks still have to be consumed, or
            // the response would race the client's upload.
            let handle = params.handle.clone().unwrap_or_default();
            let destination = head.query.get("destination").cloned();
            let container = context.backend.lookup(&handle).await;

            let refusal = match (&destination, &container) {
                (None, _) => Some((
                    ResponseHead::BAD_REQUEST,
                    "missing destination".to_string(),
                )),
                (_, Err(_)) => Some((
                    ResponseHead::NOT_FOUND,
                    format!("unknown handle: {}", handle),
                )),
                _ => None,
            };
            if let Some((status, message)) = refusal {
                drain_chunks(&mut stream).await?;
                let error = RemoteError {
                    message,
                    ..Default::default()
                };
                respond_error(&mut stream, status, error).await?;
                return Ok(Some(stream));
            }

            let (destination, container) = match (destination, container) {
                (Some(destination), Ok(container)) => (destination, container),
                _ => unreachable!("refusals are answered above"),
            };
            return stream_in(stream, context, container, handle, destination).await;
        }
        Operation::StreamOut => {
            let Some(source) = head.query.get("source").cloned() else {
                let error = RemoteError {
                    message: "missing source".to_string(),
                    ..Default::default()
                };
                respond_error(&mut stream, ResponseHead::BAD_REQUEST, error).await?;
                return Ok(Some(stream));
            };
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            return stream_out(stream, context, container, handle, source).await;
        }
        Operation::Run => {
            let request: RunRequest = body(&mut stream).await?;
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            let spec = ProcessSpec::from(request);
            return process::handle(
                stream,
                container,
                handle,
                process::Start::Run(spec),
                context.graces.clone(),
                context.stop.clone(),
            )
            .await;
        }
        Operation::Attach => {
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            let pid = params.pid.unwrap_or_default();
            return process::handle(
                stream,
                container,
                handle,
                process::Start::Attach(pid),
                context.graces.clone(),
                context.stop.clone(),
            )
            .await;
        }
        Operation::Kill => {
            let Some((container, handle)) = lookup(&mut stream, context, &params).await? else {
                return Ok(Some(stream));
            };
            let pid = params.pid.unwrap_or_default();
            let result = container
                .signal(pid, Signal::Kill)
                .await
                .map(|_| Empty::default());
            touch(context, &handle, result, &mut stream).await?;
        }
    }

    Ok(Some(stream))
}

/// Pump the request body chunks into the backend while it consumes them.
async fn stream_in<T>(
    mut stream: Framed<T>,
    context: &Arc<Context>,
    container: Arc<dyn Container>,
    handle: String,
    destination: String,
) -> io::Result<Option<Framed<T>>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut writer, reader) = pipe::pipe(pipe::CAPACITY);

    let feed = async {
        loop {
            match stream.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => {
                    writer.shutdown().await.ok();
                    break true;
                }
                Some(Ok(chunk)) => {
                    // A backend that stopped reading just discards the rest.
                    writer.write_all(&chunk).await.ok();
                }
                Some(Err(e)) => {
                    writer.close_with_error(io::Error::new(e.kind(), "request body failed"));
                    break false;
                }
                None => {
                    writer.close_with_error(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "request body truncated",
                    ));
                    break false;
                }
            }
        }
    };

    let (complete, result) = tokio::join!(feed, container.stream_in(&destination, reader));

    if !complete {
        return Ok(None);
    }

    match result {
        Ok(()) => {
            context.graces.reset(&handle);
            respond(&mut stream, &Empty::default()).await?;
        }
        Err(e) => respond_error(&mut stream, ResponseHead::INTERNAL, e.into()).await?,
    }

    Ok(Some(stream))
}

/// Respond with the backend's stream as a chunk sequence terminated by the
/// empty frame. A client that closes its reader tears the connection, which
/// drops (closes) the backend's reader.
async fn stream_out<T>(
    mut stream: Framed<T>,
    context: &Arc<Context>,
    container: Arc<dyn Container>,
    handle: String,
    source: String,
) -> io::Result<Option<Framed<T>>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = match container.stream_out(&source).await {
        Ok(reader) => reader,
        Err(e) => {
            respond_error(&mut stream, ResponseHead::INTERNAL, e.into()).await?;
            return Ok(Some(stream));
        }
    };

    codec::send(&mut stream, &ResponseHead::OK).await?;

    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Stream out of container {} failed: {}", handle, e);
                return Ok(None);
            }
        };
        if n == 0 {
            stream.send(Bytes::new()).await?;
            break;
        }
        if stream.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
            return Ok(None);
        }
    }

    context.graces.reset(&handle);
    Ok(Some(stream))
}

/// Consume a chunk sequence up to and including the empty terminator frame.
async fn drain_chunks<T>(stream: &mut Framed<T>) -> io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(chunk)) if chunk.is_empty() => break Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Err(e),
            None => {
                break Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "request body truncated",
                ))
            }
        }
    }
}

/// Resolve the handle of a container scoped request. A miss answers the
/// request with a not-found error.
async fn lookup<T>(
    stream: &mut Framed<T>,
    context: &Arc<Context>,
    params: &Params,
) -> io::Result<Option<(Arc<dyn Container>, String)>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let handle = params.handle.clone().unwrap_or_default();
    match context.backend.lookup(&handle).await {
        Ok(container) => Ok(Some((container, handle))),
        Err(_) => {
            let error = RemoteError {
                message: format!("unknown handle: {}", handle),
                ..Default::default()
            };
            respond_error(stream, ResponseHead::NOT_FOUND, error).await?;
            Ok(None)
        }
    }
}

/// Send the response for a container scoped operation and reset the
/// container's grace timer on success.
async fn touch<T, M>(
    context: &Arc<Context>,
    handle: &str,
    result: Result<M, BackendError>,
    stream: &mut Framed<T>,
) -> io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    if result.is_ok() {
        context.graces.reset(handle);
    }
    reply(stream, result).await
}

async fn reply<T, M>(stream: &mut Framed<T>, result: Result<M, BackendError>) -> io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    match result {
        Ok(body) => respond(stream, &body).await,
        Err(e) => respond_error(stream, ResponseHead::INTERNAL, e.into()).await,
    }
}

pub(crate) async fn respond<T, M>(stream: &mut Framed<T>, body: &M) -> io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    codec::send(stream, &ResponseHead::OK).await?;
    codec::send(stream, body).await
}

pub(crate) async fn respond_error<T>(
    stream: &mut Framed<T>,
    head: ResponseHead,
    error: RemoteError,
) -> io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    codec::send(stream, &head).await?;
    codec::send(stream, &error).await
}

async fn body<T, M>(stream: &mut Framed<T>) -> io::Result<M>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: DeserializeOwned,
{
    codec::recv(stream).await?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::UnexpectedEof, "missing request body")
    })
}

/// Parse a `START:END` port range with both bounds in `[1, 65535]` and
/// `START <= END`. Anything else is rejected.
fn parse_port_range(range: &str) -> Option<(u16, u16)> {
    let (start, end) = range.split_once(':')?;
    let start = parse_port(start)?;
    let end = parse_port(end)?;
    (start <= end).then_some((start, end))
}

fn parse_port(port: &str) -> Option<u16> {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn valid_port_ranges_parse() {
        assert_eq!(parse_port_range("80:81"), Some((80, 81)));
        assert_eq!(parse_port_range("1:65535"), Some((1, 65535)));
        assert_eq!(parse_port_range("8080:8080"), Some((8080, 8080)));
    }

    #[test]
    fn malformed_port_ranges_are_rejected() {
        for range in [
            "8080-8081",
            "1:2:3",
            ":8081",
            "8080:",
            "x:8081",
            "8080:x",
            "0:8081",
            "8080:0",
            "-8080:8081",
            "8080:-8081",
            "+80:81",
            "65536:8081",
            "8080:65536",
            "200000000000000000000000000000000000000:8081",
            "8081:8080",
            "",
        ] {
            assert!(parse_port_range(range).is_none(), "{:?} parsed", range);
        }
    }

    proptest! {
        #[test]
        fn port_range_parsing_never_panics(range in "\\PC*") {
            parse_port_range(&range);
        }

        #[test]
        fn in_range_pairs_parse(start in 1u16.., end in 1u16..) {
            let range = format!("{}:{}", start, end);
            prop_assert_eq!(
                parse_port_range(&range),
                (start <= end).then_some((start, end))
            );
        }
    }
}
