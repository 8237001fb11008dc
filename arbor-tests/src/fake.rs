//! Programmable in-memory backend. Records every call and returns whatever
//! the test configured, without materializing anything.

use arbor_server::{
    backend::{
        Backend, BackendError, BandwidthLimits, Capacity, Container, ContainerInfo, ContainerSpec,
        CpuLimits, DiskLimits, MemoryLimits, Process, ProcessIo, ProcessSpec, Properties,
        Protocol, Signal, TtySpec,
    },
    server::pipe::PipeReader,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, ReadBuf},
    sync::watch,
    time,
};

type Hook = Box<dyn Fn(ProcessIo) -> Result<Arc<FakeProcess>, BackendError> + Send + Sync>;

/// Error knobs shared by the fakes: `fail("stop", "oh no!")` makes the next
/// `stop` calls fail with that message.
#[derive(Default)]
struct Failures(Mutex<HashMap<&'static str, String>>);

impl Failures {
    fn fail(&self, operation: &'static str, message: &str) {
        self.lock().insert(operation, message.to_string());
    }

    fn clear(&self, operation: &'static str) {
        self.lock().remove(operation);
    }

    fn check(&self, operation: &'static str) -> Result<(), BackendError> {
        match self.lock().get(operation) {
            Some(message) => Err(BackendError::new(message.clone())),
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<&'static str, String>> {
        self.0.lock().unwrap()
    }
}

#[derive(Default)]
pub struct FakeBackend {
    failures: Failures,
    /// Grace time reported for every container.
    pub grace_time: Mutex<Duration>,
    pub capacity: Mutex<Capacity>,
    /// Specs observed by create, in call order.
    pub created: Mutex<Vec<ContainerSpec>>,
    /// Container returned by create. When unset, create builds one from the
    /// spec's handle.
    pub create_result: Mutex<Option<Arc<FakeContainer>>>,
    /// Container returned by lookup. When unset, lookup fails.
    pub container: Mutex<Option<Arc<FakeContainer>>>,
    /// Containers returned by list.
    pub containers: Mutex<Vec<Arc<FakeContainer>>>,
    /// Property filters observed by list.
    pub list_filters: Mutex<Vec<Properties>>,
    /// Handles destroyed, recorded after a destroy completed successfully.
    pub destroyed: Mutex<Vec<String>>,
    /// Number of destroy calls entered, including unfinished ones.
    pub destroys_started: Mutex<u32>,
    /// Artificial time every destroy takes.
    pub destroy_delay: Mutex<Duration>,
}

impl FakeBackend {
    pub fn new() -> Arc<FakeBackend> {
        Arc::new(FakeBackend::default())
    }

    pub fn fail(&self, operation: &'static str, message: &str) {
        self.failures.fail(operation, message);
    }

    pub fn succeed(&self, operation: &'static str) {
        self.failures.clear(operation);
    }

    /// Make lookup (and create) hand out `container`.
    pub fn install(&self, container: Arc<FakeContainer>) {
        *self.create_result.lock().unwrap() = Some(container.clone());
        *self.container.lock().unwrap() = Some(container);
    }

    pub fn set_grace_time(&self, grace_time: Duration) {
        *self.grace_time.lock().unwrap() = grace_time;
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        self.failures.check("ping")
    }

    async fn capacity(&self) -> Result<Capacity, BackendError> {
        self.failures.check("capacity")?;
        Ok(*self.capacity.lock().unwrap())
    }

    async fn create(&self, spec: ContainerSpec) -> Result<Arc<dyn Container>, BackendError> {
        self.failures.check("create")?;
        let handle = spec.handle.clone();
        self.created.lock().unwrap().push(spec);
        let container = self
            .create_result
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| FakeContainer::new(&handle));
        Ok(container)
    }

    async fn destroy(&self, handle: &str) -> Result<(), BackendError> {
        *self.destroys_started.lock().unwrap() += 1;
        let delay = *self.destroy_delay.lock().unwrap();
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
        self.failures.check("destroy")?;
        self.destroyed.lock().unwrap().push(handle.to_string());
        Ok(())
    }

    async fn containers(
        &self,
        filter: Properties,
    ) -> Result<Vec<Arc<dyn Container>>, BackendError> {
        self.failures.check("containers")?;
        self.list_filters.lock().unwrap().push(filter);
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .map(|container| container.clone() as Arc<dyn Container>)
            .collect())
    }

    async fn lookup(&self, handle: &str) -> Result<Arc<dyn Container>, BackendError> {
        self.failures.check("lookup")?;
        self.container
            .lock()
            .unwrap()
            .clone()
            .map(|container| container as Arc<dyn Container>)
            .ok_or_else(|| BackendError::new(format!("not found: {}", handle)))
    }

    fn grace_time(&self, _: &dyn Container) -> Duration {
        *self.grace_time.lock().unwrap()
    }
}

pub struct FakeContainer {
    handle: String,
    failures: Failures,
    /// Kill flags observed by stop.
    pub stops: Mutex<Vec<bool>>,
    pub info: Mutex<ContainerInfo>,
    pub bandwidth_limits: Mutex<Vec<BandwidthLimits>>,
    pub current_bandwidth: Mutex<BandwidthLimits>,
    pub cpu_limits: Mutex<Vec<CpuLimits>>,
    pub current_cpu: Mutex<CpuLimits>,
    pub disk_limits: Mutex<Vec<DiskLimits>>,
    pub current_disk: Mutex<DiskLimits>,
    pub memory_limits: Mutex<Vec<MemoryLimits>>,
    pub current_memory: Mutex<MemoryLimits>,
    /// (host, container) pairs observed by net-in.
    pub net_ins: Mutex<Vec<(u32, u32)>>,
    /// Mapping returned by net-in.
    pub net_in_result: Mutex<(u32, u32)>,
    pub net_outs: Mutex<Vec<(String, u32, String, Protocol)>>,
    pub properties: Mutex<Properties>,
    pub property_gets: Mutex<Vec<String>>,
    pub property_sets: Mutex<Vec<(String, String)>>,
    pub property_removes: Mutex<Vec<String>>,
    /// (destination, content) pairs observed by stream-in.
    pub streamed_in: Mutex<Vec<(String, Vec<u8>)>>,
    /// Paths observed by stream-out.
    pub streamed_out: Mutex<Vec<String>>,
    /// Bytes served by stream-out when no reader override is set.
    pub stream_out_data: Mutex<Vec<u8>>,
    /// One-shot reader override for stream-out.
    pub stream_out_reader: Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    /// Specs observed by run.
    pub ran: Mutex<Vec<ProcessSpec>>,
    /// Pids observed by attach.
    pub attached: Mutex<Vec<u32>>,
    /// Behavior of run: receives the process io, returns the process.
    pub run_hook: Mutex<Option<Hook>>,
    /// Behavior of attach.
    pub attach_hook: Mutex<Option<Hook>>,
    /// Io captured when no hook consumed it (or the operation failed).
    pub captured_io: Mutex<Option<ProcessIo>>,
    /// (pid, signal) pairs observed by signal.
    pub signals: Mutex<Vec<(u32, Signal)>>,
}

impl FakeContainer {
    pub fn new(handle: &str) -> Arc<FakeContainer> {
        Arc::new(FakeContainer {
            handle: handle.to_string(),
            failures: Failures::default(),
            stops: Mutex::default(),
            info: Mutex::default(),
            bandwidth_limits: Mutex::default(),
            current_bandwidth: Mutex::default(),
            cpu_limits: Mutex::default(),
            current_cpu: Mutex::default(),
            disk_limits: Mutex::default(),
            current_disk: Mutex::default(),
            memory_limits: Mutex::default(),
            current_memory: Mutex::default(),
            net_ins: Mutex::default(),
            net_in_result: Mutex::default(),
            net_outs: Mutex::default(),
            properties: Mutex::default(),
            property_gets: Mutex::default(),
            property_sets: Mutex::default(),
            property_removes: Mutex::default(),
            streamed_in: Mutex::default(),
            streamed_out: Mutex::default(),
            stream_out_data: Mutex::default(),
            stream_out_reader: Mutex::default(),
            ran: Mutex::default(),
            attached: Mutex::default(),
            run_hook: Mutex::default(),
            attach_hook: Mutex::default(),
            captured_io: Mutex::default(),
            signals: Mutex::default(),
        })
    }

    pub fn fail(&self, operation: &'static str, message: &str) {
        self.failures.fail(operation, message);
    }

    pub fn on_run<F>(&self, hook: F)
    where
        F: Fn(ProcessIo) -> Result<Arc<FakeProcess>, BackendError> + Send + Sync + 'static,
    {
        *self.run_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn on_attach<F>(&self, hook: F)
    where
        F: Fn(ProcessIo) -> Result<Arc<FakeProcess>, BackendError> + Send + Sync + 'static,
    {
        *self.attach_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// The process io captured by the last hook-less run or attach.
    pub fn take_io(&self) -> Option<ProcessIo> {
        self.captured_io.lock().unwrap().take()
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    async fn stop(&self, kill: bool) -> Result<(), BackendError> {
        self.failures.check("stop")?;
        self.stops.lock().unwrap().push(kill);
        Ok(())
    }

    async fn info(&self) -> Result<ContainerInfo, BackendError> {
        self.failures.check("info")?;
        Ok(self.info.lock().unwrap().clone())
    }

    async fn stream_in(&self, dst_path: &str, mut src: PipeReader) -> Result<(), BackendError> {
        self.failures.check("stream_in")?;
        let mut content = Vec::new();
        src.read_to_end(&mut content)
            .await
            .map_err(|e| BackendError::new(e.to_string()))?;
        self.streamed_in
            .lock()
            .unwrap()
            .push((dst_path.to_string(), content));
        Ok(())
    }

    async fn stream_out(
        &self,
        src_path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, BackendError> {
        self.failures.check("stream_out")?;
        self.streamed_out.lock().unwrap().push(src_path.to_string());
        if let Some(reader) = self.stream_out_reader.lock().unwrap().take() {
            return Ok(reader);
        }
        let data = self.stream_out_data.lock().unwrap().clone();
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn limit_bandwidth(&self, limits: BandwidthLimits) -> Result<(), BackendError> {
        self.failures.check("limit_bandwidth")?;
        self.bandwidth_limits.lock().unwrap().push(limits);
        Ok(())
    }

    async fn current_bandwidth_limits(&self) -> Result<BandwidthLimits, BackendError> {
        self.failures.check("current_bandwidth_limits")?;
        Ok(*self.current_bandwidth.lock().unwrap())
    }

    async fn limit_cpu(&self, limits: CpuLimits) -> Result<(), BackendError> {
        self.failures.check("limit_cpu")?;
        self.cpu_limits.lock().unwrap().push(limits);
        Ok(())
    }

    async fn current_cpu_limits(&self) -> Result<CpuLimits, BackendError> {
        self.failures.check("current_cpu_limits")?;
        Ok(*self.current_cpu.lock().unwrap())
    }

    async fn limit_disk(&self, limits: DiskLimits) -> Result<(), BackendError> {
        self.failures.check("limit_disk")?;
        self.disk_limits.lock().unwrap().push(limits);
        Ok(())
    }

    async fn current_disk_limits(&self) -> Result<DiskLimits, BackendError> {
        self.failures.check("current_disk_limits")?;
        Ok(*self.current_disk.lock().unwrap())
    }

    async fn limit_memory(&self, limits: MemoryLimits) -> Result<(), BackendError> {
        self.failures.check("limit_memory")?;
        self.memory_limits.lock().unwrap().push(limits);
        Ok(())
    }

    async fn current_memory_limits(&self) -> Result<MemoryLimits, BackendError> {
        self.failures.check("current_memory_limits")?;
        Ok(*self.current_memory.lock().unwrap())
    }

    async fn net_in(
        &self,
        host_port: u32,
        container_port: u32,
    ) -> Result<(u32, u32), BackendError> {
        self.failures.check("net_in")?;
        self.net_ins.lock().unwrap().push((host_port, container_port));
        Ok(*self.net_in_result.lock().unwrap())
    }

    async fn net_out(
        &self,
        network: &str,
        port: u32,
        port_range: &str,
        protocol: Protocol,
    ) -> Result<(), BackendError> {
        self.failures.check("net_out")?;
        self.net_outs.lock().unwrap().push((
            network.to_string(),
            port,
            port_range.to_string(),
            protocol,
        ));
        Ok(())
    }

    async fn property(&self, name: &str) -> Result<String, BackendError> {
        self.failures.check("property")?;
        self.property_gets.lock().unwrap().push(name.to_string());
        self.properties
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::new(format!("unknown property: {}", name)))
    }

    async fn set_property(&self, name: &str, value: &str) -> Result<(), BackendError> {
        self.failures.check("set_property")?;
        self.property_sets
            .lock()
            .unwrap()
            .push((name.to_string(), value.to_string()));
        self.properties
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_property(&self, name: &str) -> Result<(), BackendError> {
        self.failures.check("remove_property")?;
        self.property_removes.lock().unwrap().push(name.to_string());
        self.properties.lock().unwrap().remove(name);
        Ok(())
    }

    async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Arc<dyn Process>, BackendError> {
        self.ran.lock().unwrap().push(spec);
        if let Err(e) = self.failures.check("run") {
            self.captured_io.lock().unwrap().replace(io);
            return Err(e);
        }
        match &*self.run_hook.lock().unwrap() {
            Some(hook) => hook(io).map(|process| process as Arc<dyn Process>),
            None => {
                self.captured_io.lock().unwrap().replace(io);
                Ok(FakeProcess::exited(0, 0))
            }
        }
    }

    async fn attach(&self, pid: u32, io: ProcessIo) -> Result<Arc<dyn Process>, BackendError> {
        self.attached.lock().unwrap().push(pid);
        if let Err(e) = self.failures.check("attach") {
            self.captured_io.lock().unwrap().replace(io);
            return Err(e);
        }
        match &*self.attach_hook.lock().unwrap() {
            Some(hook) => hook(io).map(|process| process as Arc<dyn Process>),
            None => {
                self.captured_io.lock().unwrap().replace(io);
                Ok(FakeProcess::exited(pid, 0))
            }
        }
    }

    async fn signal(&self, pid: u32, signal: Signal) -> Result<(), BackendError> {
        self.failures.check("signal")?;
        self.signals.lock().unwrap().push((pid, signal));
        Ok(())
    }
}

pub struct FakeProcess {
    id: u32,
    result_tx: watch::Sender<Option<Result<u32, BackendError>>>,
    result: watch::Receiver<Option<Result<u32, BackendError>>>,
    pub ttys: Mutex<Vec<TtySpec>>,
    pub signals: Mutex<Vec<Signal>>,
}

impl FakeProcess {
    /// A process whose wait never resolves until [`FakeProcess::finish`].
    pub fn pending(id: u32) -> Arc<FakeProcess> {
        let (result_tx, result) = watch::channel(None);
        Arc::new(FakeProcess {
            id,
            result_tx,
            result,
            ttys: Mutex::default(),
            signals: Mutex::default(),
        })
    }

    /// A process that already exited with `status`.
    pub fn exited(id: u32, status: u32) -> Arc<FakeProcess> {
        let process = FakeProcess::pending(id);
        process.finish(Ok(status));
        process
    }

    /// A process whose wait fails with `message`.
    pub fn failed(id: u32, message: &str) -> Arc<FakeProcess> {
        let process = FakeProcess::pending(id);
        process.finish(Err(BackendError::new(message)));
        process
    }

    pub fn finish(&self, result: Result<u32, BackendError>) {
        self.result_tx.send(Some(result)).ok();
    }
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> u32 {
        self.id
    }

    async fn wait(&self) -> Result<u32, BackendError> {
        let mut result = self.result.clone();
        loop {
            let current = result.borrow().clone();
            if let Some(result) = current {
                break result;
            }
            if result.changed().await.is_err() {
                break Err(BackendError::new("process abandoned"));
            }
        }
    }

    async fn set_tty(&self, tty: TtySpec) -> Result<(), BackendError> {
        self.ttys.lock().unwrap().push(tty);
        Ok(())
    }

    async fn signal(&self, signal: Signal) -> Result<(), BackendError> {
        self.signals.lock().unwrap().push(signal);
        Ok(())
    }
}

/// In memory `AsyncWrite` whose content the test can inspect.
pub struct Buffer {
    data: Arc<Mutex<Vec<u8>>>,
}

/// A writer and the shared buffer it appends to.
pub fn buffer() -> (Buffer, Arc<Mutex<Vec<u8>>>) {
    let data = Arc::new(Mutex::new(Vec::new()));
    (Buffer { data: data.clone() }, data)
}

impl tokio::io::AsyncWrite for Buffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.data.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Endless reader that records whether it was dropped. Stands in for a
/// backend stream whose close must propagate from the client.
pub struct CloseChecker {
    closed: Arc<AtomicBool>,
}

impl CloseChecker {
    pub fn new() -> (CloseChecker, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        (
            CloseChecker {
                closed: closed.clone(),
            },
            closed,
        )
    }
}

impl AsyncRead for CloseChecker {
    fn poll_read(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        buf.put_slice(b"x");
        Poll::Ready(Ok(()))
    }
}

impl Drop for CloseChecker {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
