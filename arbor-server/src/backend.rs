//! The seam between the control plane and the component that actually
//! materializes containers. The server consumes these traits; it never
//! implements isolation itself.

use crate::server::pipe::{PipeReader, PipeWriter};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use thiserror::Error;

/// Server side annotations on a container. String keyed, string valued, no
/// semantics imposed here.
pub type Properties = HashMap<String, String>;

/// Error returned by any backend operation. Crosses the wire as a
/// `RemoteError`; clients surface `message`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub data: String,
    pub backtrace: Vec<String>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> BackendError {
        BackendError {
            message: message.into(),
            ..Default::default()
        }
    }
}

impl From<String> for BackendError {
    fn from(message: String) -> BackendError {
        BackendError::new(message)
    }
}

impl From<&str> for BackendError {
    fn from(message: &str) -> BackendError {
        BackendError::new(message)
    }
}

/// Create time description of a container.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerSpec {
    /// Requested handle. Empty lets the backend assign one.
    pub handle: String,
    /// Path to the root filesystem.
    pub rootfs: String,
    /// Idle interval after which the container is destroyed. Zero means
    /// unspecified; the server substitutes its default.
    pub grace_time: Duration,
    /// Network in CIDR notation.
    pub network: String,
    pub bind_mounts: Vec<BindMount>,
    pub properties: Properties,
    /// `KEY=VALUE` pairs, in order.
    pub env: Vec<String>,
    pub privileged: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub src_path: String,
    pub dst_path: String,
    pub mode: BindMountMode,
    pub origin: BindMountOrigin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMountMode {
    Ro,
    Rw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMountOrigin {
    Host,
    Container,
}

/// Host capacity as reported by the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    #[serde(default)]
    pub memory_in_bytes: u64,
    #[serde(default)]
    pub disk_in_bytes: u64,
    #[serde(default)]
    pub max_containers: u64,
}

/// Snapshot of a container as reported by the backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub container_ip: String,
    #[serde(default)]
    pub external_ip: String,
    #[serde(default)]
    pub container_path: String,
    #[serde(default)]
    pub process_ids: Vec<u32>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub bandwidth_stat: BandwidthStat,
    #[serde(default)]
    pub cpu_stat: CpuStat,
    #[serde(default)]
    pub disk_stat: DiskStat,
    #[serde(default)]
    pub memory_stat: MemoryStat,
    #[serde(default)]
    pub mapped_ports: Vec<PortMapping>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u32,
    pub container_port: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthStat {
    pub in_rate: u64,
    pub in_burst: u64,
    pub out_rate: u64,
    pub out_burst: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuStat {
    pub usage: u64,
    pub user: u64,
    pub system: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskStat {
    pub bytes_used: u64,
    pub inodes_used: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStat {
    pub cache: u64,
    pub rss: u64,
    pub mapped_file: u64,
    pub pgpgin: u64,
    pub pgpgout: u64,
    pub swap: u64,
    pub pgfault: u64,
    pub pgmajfault: u64,
    pub inactive_anon: u64,
    pub active_anon: u64,
    pub inactive_file: u64,
    pub active_file: u64,
    pub unevictable: u64,
    pub hierarchical_memory_limit: u64,
    pub hierarchical_memsw_limit: u64,
    pub total_cache: u64,
    pub total_rss: u64,
    pub total_mapped_file: u64,
    pub total_pgpgin: u64,
    pub total_pgpgout: u64,
    pub total_swap: u64,
    pub total_pgfault: u64,
    pub total_pgmajfault: u64,
    pub total_inactive_anon: u64,
    pub total_active_anon: u64,
    pub total_inactive_file: u64,
    pub total_active_file: u64,
    pub total_unevictable: u64,
}

/// Bandwidth limits. Requests carry desired values, responses carry the
/// effective values after the backend clamped them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthLimits {
    pub rate_in_bytes_per_second: u64,
    pub burst_rate_in_bytes_per_second: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuLimits {
    pub limit_in_shares: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskLimits {
    pub block_soft: u64,
    pub block_hard: u64,
    pub inode_soft: u64,
    pub inode_hard: u64,
    pub byte_soft: u64,
    pub byte_hard: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLimits {
    pub limit_in_bytes: u64,
}

/// Per process resource limits. A missing value is inherited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#as: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fsize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memlock: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msgqueue: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nice: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nofile: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nproc: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtprio: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sigpending: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<u64>,
}

/// Description of a process to run inside a container.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    /// Working directory. `None` inherits the container default.
    pub dir: Option<String>,
    pub user: String,
    /// `KEY=VALUE` pairs, in order.
    pub env: Vec<String>,
    pub privileged: bool,
    pub tty: Option<TtySpec>,
    pub limits: ResourceLimits,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_size: Option<WindowSize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub columns: u32,
    pub rows: u32,
}

/// Signals deliverable to a process. Only kill is defined on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Kill,
}

/// Network protocols addressable by net-out rules.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    All,
    Tcp,
}

/// The byte pipes connecting a process to the control plane. The backend
/// reads stdin and writes stdout/stderr; the far ends are owned by the
/// server's stream pumps.
pub struct ProcessIo {
    pub stdin: PipeReader,
    pub stdout: PipeWriter,
    pub stderr: PipeWriter,
}

/// The component that materializes containers.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn ping(&self) -> Result<(), BackendError>;

    async fn capacity(&self) -> Result<Capacity, BackendError>;

    async fn create(&self, spec: ContainerSpec) -> Result<Arc<dyn Container>, BackendError>;

    async fn destroy(&self, handle: &str) -> Result<(), BackendError>;

    async fn containers(&self, filter: Properties)
        -> Result<Vec<Arc<dyn Container>>, BackendError>;

    async fn lookup(&self, handle: &str) -> Result<Arc<dyn Container>, BackendError>;

    /// Idle interval after which `container` is destroyed. Zero disables the
    /// timer.
    fn grace_time(&self, container: &dyn Container) -> Duration;
}

/// A live container.
#[async_trait]
pub trait Container: Send + Sync {
    fn handle(&self) -> &str;

    async fn stop(&self, kill: bool) -> Result<(), BackendError>;

    async fn info(&self) -> Result<ContainerInfo, BackendError>;

    async fn stream_in(&self, dst_path: &str, src: PipeReader) -> Result<(), BackendError>;

    async fn stream_out(
        &self,
        src_path: &str,
    ) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>, BackendError>;

    async fn limit_bandwidth(&self, limits: BandwidthLimits) -> Result<(), BackendError>;
    async fn current_bandwidth_limits(&self) -> Result<BandwidthLimits, BackendError>;

    async fn limit_cpu(&self, limits: CpuLimits) -> Result<(), BackendError>;
    async fn current_cpu_limits(&self) -> Result<CpuLimits, BackendError>;

    async fn limit_disk(&self, limits: DiskLimits) -> Result<(), BackendError>;
    async fn current_disk_limits(&self) -> Result<DiskLimits, BackendError>;

    async fn limit_memory(&self, limits: MemoryLimits) -> Result<(), BackendError>;
    async fn current_memory_limits(&self) -> Result<MemoryLimits, BackendError>;

    async fn net_in(&self, host_port: u32, container_port: u32)
        -> Result<(u32, u32), BackendError>;

    async fn net_out(
        &self,
        network: &str,
        port: u32,
        port_range: &str,
        protocol: Protocol,
    ) -> Result<(), BackendError>;

    async fn property(&self, name: &str) -> Result<String, BackendError>;
    async fn set_property(&self, name: &str, value: &str) -> Result<(), BackendError>;
    async fn remove_property(&self, name: &str) -> Result<(), BackendError>;

    async fn run(
        &self,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Arc<dyn Process>, BackendError>;

    async fn attach(&self, pid: u32, io: ProcessIo) -> Result<Arc<dyn Process>, BackendError>;

    async fn signal(&self, pid: u32, signal: Signal) -> Result<(), BackendError>;
}

/// A process running inside a container.
#[async_trait]
pub trait Process: Send + Sync {
    fn id(&self) -> u32;

    /// Resolves once with the exit status, or with an error if the process
    /// failed before exiting.
    async fn wait(&self) -> Result<u32, BackendError>;

    async fn set_tty(&self, tty: TtySpec) -> Result<(), BackendError>;

    async fn signal(&self, signal: Signal) -> Result<(), BackendError>;
}

impl fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessIo").finish_non_exhaustive()
    }
}
