//! The daemon side of the control plane: listener, per connection request
//! loop, grace timers and the process streaming core.

use crate::{backend::Backend, config::Config};
use anyhow::{Context as AnyhowContext, Result};
use futures::future::join_all;
use grace::GraceTimers;
use log::{debug, info, warn};
use std::{
    collections::HashSet,
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::{
    fs,
    net::{TcpListener, UnixListener, UnixStream},
    task,
};
use tokio_util::{either::Either, sync::CancellationToken};
use url::Url;

mod connection;
mod grace;
pub mod pipe;
mod process;

/// State shared by every connection of one server.
pub(crate) struct Context {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) graces: Arc<GraceTimers>,
    pub(crate) destroying: Mutex<HashSet<String>>,
    pub(crate) config: Config,
    pub(crate) stop: CancellationToken,
}

/// The control plane server. Listens on stream sockets supplied by the
/// embedder and dispatches requests to the backend.
pub struct Server {
    context: Arc<Context>,
    tasks: Vec<task::JoinHandle<()>>,
}

impl Server {
    pub fn new(config: Config, backend: Arc<dyn Backend>) -> Server {
        let graces = GraceTimers::new(backend.clone());
        Server {
            context: Arc::new(Context {
                backend,
                graces,
                destroying: Mutex::new(HashSet::new()),
                config,
                stop: CancellationToken::new(),
            }),
            tasks: Vec::new(),
        }
    }

    /// Bind `url` and serve connections until [`Server::shutdown`].
    pub async fn listen(&mut self, url: &Url) -> Result<()> {
        let listener = Listener::new(url)
            .await
            .with_context(|| format!("failed to listen on {}", url))?;

        info!("Listening on {}", url);

        let context = self.context.clone();
        self.tasks.push(task::spawn(serve(listener, context)));

        Ok(())
    }

    /// Stop accepting requests. In flight unary requests finish on their own;
    /// live process streams keep running until their peer goes away, and the
    /// stdin of their processes is never closed cleanly by shutdown.
    pub async fn shutdown(self) {
        self.context.stop.cancel();
        join_all(self.tasks).await;
    }
}

async fn serve(listener: Listener, context: Arc<Context>) {
    loop {
        tokio::select! {
            _ = context.stop.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let context = context.clone();
                        task::spawn(async move {
                            connection::connection(stream, peer, context).await.ok();
                        });
                    }
                    Err(e) => {
                        warn!("Error listening: {}", e);
                        break;
                    }
                }
            }
        }
    }
    debug!("Closed listener");
}

/// Types of listeners for control connections.
enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl Listener {
    async fn new(url: &Url) -> io::Result<Listener> {
        match url.scheme() {
            "tcp" => {
                let address = url
                    .socket_addrs(|| None)?
                    .first()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid url: {url}"))
                    })?
                    .to_owned();
                let listener = TcpListener::bind(&address).await?;
                Ok(Listener::Tcp(listener))
            }
            "unix" => {
                let path = PathBuf::from(url.path());
                if path.exists() {
                    fs::remove_file(&path).await?;
                }
                let listener = UnixListener::bind(&path)?;
                Ok(Listener::Unix(listener, path))
            }
            scheme => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported scheme: {scheme}"),
            )),
        }
    }

    async fn accept(&self) -> io::Result<(Either<tokio::net::TcpStream, UnixStream>, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Either::Left(stream), peer.to_string()))
            }
            Listener::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((Either::Right(stream), format!("unix://{}", path.display())))
            }
        }
    }
}
