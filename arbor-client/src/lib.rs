//! Client for the arbor container host. Speaks the control protocol over a
//! tcp or unix stream socket and exposes the containers and processes of the
//! host as typed handles.
//!
//! ```no_run
//! use arbor_client::{Client, ContainerSpec, ProcessIo, ProcessSpec};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let client = Client::new("unix:///run/arbor.sock".parse().unwrap());
//!     let container = client.create(ContainerSpec::default()).await.unwrap();
//!     let process = container
//!         .run(
//!             ProcessSpec {
//!                 path: "/bin/true".into(),
//!                 ..Default::default()
//!             },
//!             ProcessIo::default(),
//!         )
//!         .await
//!         .unwrap();
//!     let status = process.wait().await.unwrap();
//!     println!("exited with {}", status);
//! }
//! ```

use std::{collections::HashMap, sync::Arc};

use arbor_server::api::{
    model::{
        CreateRequest, CreateResponse, Empty, GetPropertyResponse, ListResponse, NetInRequest,
        NetInResponse, NetOutRequest, RunRequest, SetPropertyRequest, StopRequest,
    },
    routes::{Operation, Params},
};
use connection::Connection;
use tokio::io::AsyncRead;
use url::Url;

mod connection;
/// Client errors
pub mod error;
mod process;

pub use arbor_server::backend::{
    BandwidthLimits, BindMount, BindMountMode, BindMountOrigin, Capacity, ContainerInfo,
    ContainerSpec, CpuLimits, DiskLimits, MemoryLimits, PortMapping, ProcessSpec, Properties,
    Protocol, ResourceLimits, TtySpec, WindowSize,
};
pub use connection::StreamOut;
pub use error::Error;
pub use process::{Process, ProcessIo};

/// Client for an arbor server.
pub struct Client {
    connection: Arc<Connection>,
}

impl Client {
    /// Create a client for the server at `url` (`tcp://` or `unix://`).
    /// Connections are dialed on demand with a one second timeout.
    pub fn new(url: Url) -> Client {
        Client {
            connection: Connection::new(url),
        }
    }

    /// Check that the server and its backend are alive.
    pub async fn ping(&self) -> Result<(), Error> {
        self.connection
            .request::<Empty>(Operation::Ping, &Params::default(), HashMap::new())
            .await
            .map(|_| ())
    }

    /// The host's capacity.
    pub async fn capacity(&self) -> Result<Capacity, Error> {
        self.connection
            .request(Operation::Capacity, &Params::default(), HashMap::new())
            .await
    }

    /// Create a container and return a handle to it.
    pub async fn create(&self, spec: ContainerSpec) -> Result<Container, Error> {
        let request = CreateRequest::from(spec);
        let response: CreateResponse = self
            .connection
            .request_with_body(
                Operation::Create,
                &Params::default(),
                HashMap::new(),
                Some(&request),
            )
            .await?;
        let handle = response
            .handle
            .ok_or_else(|| Error::Protocol("create response without handle".to_string()))?;
        Ok(Container {
            handle,
            connection: self.connection.clone(),
        })
    }

    /// List the containers of the host, filtered by properties. An empty
    /// filter matches every container.
    pub async fn containers(&self, filter: Properties) -> Result<Vec<Container>, Error> {
        let response: ListResponse = self
            .connection
            .request(Operation::List, &Params::default(), filter)
            .await?;
        Ok(response
            .handles
            .into_iter()
            .map(|handle| Container {
                handle,
                connection: self.connection.clone(),
            })
            .collect())
    }

    /// Destroy the container with `handle`.
    pub async fn destroy(&self, handle: &str) -> Result<(), Error> {
        self.connection
            .request::<Empty>(Operation::Destroy, &Params::handle(handle), HashMap::new())
            .await
            .map(|_| ())
    }

    /// A handle object for a container that is expected to exist. Operations
    /// on a gone container fail with the server's unknown handle error.
    pub fn container(&self, handle: &str) -> Container {
        Container {
            handle: handle.to_string(),
            connection: self.connection.clone(),
        }
    }
}

/// Handle to a container on the host.
#[derive(Clone)]
#[derive(Debug)]
pub struct Container {
    handle: String,
    connection: Arc<Connection>,
}

impl Container {
    pub fn handle(&self) -> &str {
        &self.handle
    }

    fn params(&self) -> Params {
        Params::handle(&self.handle)
    }

    /// Stop all processes of the container. `kill` skips the graceful phase.
    pub async fn stop(&self, kill: bool) -> Result<(), Error> {
        self.connection
            .request_with_body::<_, Empty>(
                Operation::Stop,
                &self.params(),
                HashMap::new(),
                Some(&StopRequest { kill }),
            )
            .await
            .map(|_| ())
    }

    pub async fn info(&self) -> Result<ContainerInfo, Error> {
        self.connection
            .request(Operation::Info, &self.params(), HashMap::new())
            .await
    }

    /// Set bandwidth limits. Returns the effective limits, which may differ
    /// from the requested ones.
    pub async fn limit_bandwidth(&self, limits: BandwidthLimits) -> Result<BandwidthLimits, Error> {
        self.connection
            .request_with_body(
                Operation::LimitBandwidth,
                &self.params(),
                HashMap::new(),
                Some(&limits),
            )
            .await
    }

    pub async fn current_bandwidth_limits(&self) -> Result<BandwidthLimits, Error> {
        self.connection
            .request(
                Operation::CurrentBandwidthLimits,
                &self.params(),
                HashMap::new(),
            )
            .await
    }

    /// Set cpu limits. Returns the effective limits.
    pub async fn limit_cpu(&self, limits: CpuLimits) -> Result<CpuLimits, Error> {
        self.connection
            .request_with_body(
                Operation::LimitCpu,
                &self.params(),
                HashMap::new(),
                Some(&limits),
            )
            .await
    }

    pub async fn current_cpu_limits(&self) -> Result<CpuLimits, Error> {
        self.connection
            .request(Operation::CurrentCpuLimits, &self.params(), HashMap::new())
            .await
    }

    /// Set disk limits. Returns the effective limits.
    pub async fn limit_disk(&self, limits: DiskLimits) -> Result<DiskLimits, Error> {
        self.connection
            .request_with_body(
                Operation::LimitDisk,
                &self.params(),
                HashMap::new(),
                Some(&limits),
            )
            .await
    }

    pub async fn current_disk_limits(&self) -> Result<DiskLimits, Error> {
        self.connection
            .request(Operation::CurrentDiskLimits, &self.params(), HashMap::new())
            .await
    }

    /// Set memory limits. Returns the effective limits.
    pub async fn limit_memory(&self, limits: MemoryLimits) -> Result<MemoryLimits, Error> {
        self.connection
            .request_with_body(
                Operation::LimitMemory,
                &self.params(),
                HashMap::new(),
                Some(&limits),
            )
            .await
    }

    pub async fn current_memory_limits(&self) -> Result<MemoryLimits, Error> {
        self.connection
            .request(Operation::CurrentMemoryLimits, &self.params(), HashMap::new())
            .await
    }

    /// Map `host_port` to `container_port`. Zero lets the backend pick.
    /// Returns the effective mapping.
    pub async fn net_in(&self, host_port: u32, container_port: u32) -> Result<(u32, u32), Error> {
        let response: NetInResponse = self
            .connection
            .request_with_body(
                Operation::NetIn,
                &self.params(),
                HashMap::new(),
                Some(&NetInRequest {
                    host_port,
                    container_port,
                }),
            )
            .await?;
        Ok((response.host_port, response.container_port))
    }

    /// Whitelist outbound traffic to `network`, either to `port` or to a
    /// `"START:END"` port range.
    pub async fn net_out(
        &self,
        network: &str,
        port: u32,
        port_range: &str,
        protocol: Protocol,
    ) -> Result<(), Error> {
        let request = NetOutRequest {
            network: Some(network.to_string()).filter(|network| !network.is_empty()),
            port,
            port_range: Some(port_range.to_string()).filter(|range| !range.is_empty()),
            protocol,
        };
        self.connection
            .request_with_body::<_, Empty>(
                Operation::NetOut,
                &self.params(),
                HashMap::new(),
                Some(&request),
            )
            .await
            .map(|_| ())
    }

    pub async fn property(&self, name: &str) -> Result<String, Error> {
        let response: GetPropertyResponse = self
            .connection
            .request(
                Operation::GetProperty,
                &Params::property(&self.handle, name),
                HashMap::new(),
            )
            .await?;
        Ok(response.value)
    }

    pub async fn set_property(&self, name: &str, value: &str) -> Result<(), Error> {
        self.connection
            .request_with_body::<_, Empty>(
                Operation::SetProperty,
                &Params::property(&self.handle, name),
                HashMap::new(),
                Some(&SetPropertyRequest {
                    value: value.to_string(),
                }),
            )
            .await
            .map(|_| ())
    }

    pub async fn remove_property(&self, name: &str) -> Result<(), Error> {
        self.connection
            .request::<Empty>(
                Operation::RemoveProperty,
                &Params::property(&self.handle, name),
                HashMap::new(),
            )
            .await
            .map(|_| ())
    }

    /// Stream `src` (typically a tar stream) into the container at
    /// `dst_path`. Resolves once the server acknowledged the upload.
    pub async fn stream_in(
        &self,
        dst_path: &str,
        src: impl AsyncRead + Unpin,
    ) -> Result<(), Error> {
        self.connection
            .stream_in(&self.params(), dst_path, src)
            .await
    }

    /// Stream `src_path` out of the container. Dropping the returned reader
    /// closes the stream end to end.
    pub async fn stream_out(&self, src_path: &str) -> Result<StreamOut, Error> {
        self.connection.stream_out(&self.params(), src_path).await
    }

    /// Run a process inside the container, wired to `io`.
    pub async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Process, Error> {
        let request = RunRequest::from(spec);
        let transport = self
            .connection
            .hijack(Operation::Run, &self.params(), Some(&request))
            .await?;
        process::start(transport, io).await
    }

    /// Attach to a process that is already running inside the container.
    pub async fn attach(&self, pid: u32, io: ProcessIo) -> Result<Process, Error> {
        let transport = self
            .connection
            .hijack::<Empty>(
                Operation::Attach,
                &Params::process(&self.handle, pid),
                None,
            )
            .await?;
        process::start(transport, io).await
    }

    /// Deliver the kill signal to a process by id.
    pub async fn kill(&self, pid: u32) -> Result<(), Error> {
        self.connection
            .request::<Empty>(
                Operation::Kill,
                &Params::process(&self.handle, pid),
                HashMap::new(),
            )
            .await
            .map(|_| ())
    }
}
