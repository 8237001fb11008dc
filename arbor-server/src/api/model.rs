//! Wire representation of every protocol exchange. All payload fields are
//! optional or defaulted so both sides tolerate peers at a different minor
//! version; unknown fields are ignored.

use crate::{
    api::routes::Method,
    backend::{
        BackendError, BandwidthLimits, BindMount, Capacity, ContainerInfo, ContainerSpec,
        CpuLimits, DiskLimits, MemoryLimits, ProcessSpec, Properties, Protocol, ResourceLimits,
        Signal, TtySpec,
    },
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use thiserror::Error;

/// First frame of every request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
}

/// First frame of every response. 2xx is success; anything else is followed
/// by a single `RemoteError` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
}

impl ResponseHead {
    pub const OK: ResponseHead = ResponseHead { status: 200 };
    pub const BAD_REQUEST: ResponseHead = ResponseHead { status: 400 };
    pub const NOT_FOUND: ResponseHead = ResponseHead { status: 404 };
    pub const INTERNAL: ResponseHead = ResponseHead { status: 500 };

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "application/x-tar")]
    Tar,
}

/// Error body of a non-2xx response. Clients surface only `message`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backtrace: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

pub type PingResponse = Empty;
pub type StopResponse = Empty;
pub type DestroyResponse = Empty;
pub type NetOutResponse = Empty;
pub type SetPropertyResponse = Empty;
pub type RemovePropertyResponse = Empty;
pub type StreamInResponse = Empty;
pub type KillResponse = Empty;

pub type CapacityResponse = Capacity;
pub type InfoResponse = ContainerInfo;

pub type LimitBandwidthRequest = BandwidthLimits;
pub type LimitBandwidthResponse = BandwidthLimits;
pub type LimitCpuRequest = CpuLimits;
pub type LimitCpuResponse = CpuLimits;
pub type LimitDiskRequest = DiskLimits;
pub type LimitDiskResponse = DiskLimits;
pub type LimitMemoryRequest = MemoryLimits;
pub type LimitMemoryResponse = MemoryLimits;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<String>,
    /// Grace time in seconds. Absent means the server default applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bind_mounts: Vec<BindMount>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    #[serde(default)]
    pub handles: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub kill: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInRequest {
    #[serde(default)]
    pub host_port: u32,
    #[serde(default)]
    pub container_port: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInResponse {
    #[serde(default)]
    pub host_port: u32,
    #[serde(default)]
    pub container_port: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetOutRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default)]
    pub port: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPropertyResponse {
    #[serde(default)]
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPropertyRequest {
    #[serde(default)]
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty: Option<TtySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rlimits: Option<ResourceLimits>,
}

/// One record on a hijacked process stream. Every field is optional so this
/// single shape covers both directions; which fields are set decides the
/// meaning (see [`ProcessEvent`]).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(with = "base64", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty: Option<TtySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Stdin,
    Stdout,
    Stderr,
}

/// A `ProcessPayload` that sets none of the discriminating fields, or an
/// impossible combination of them.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid process record: {0}")]
pub struct InvalidRecord(pub &'static str);

/// The events a process stream can carry, one per `ProcessPayload` record.
/// `Exited` and `Failed` are terminal: the sender closes the stream after
/// them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Handshake, the first record on every stream. Tells the client the
    /// process id.
    Hello(u32),
    Stdin(Vec<u8>),
    StdinClose,
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Tty(TtySpec),
    Signal(Signal),
    Exited(u32),
    Failed(String),
}

impl ProcessEvent {
    /// The wire record for this event, stamped with `process_id`.
    pub fn into_payload(self, process_id: u32) -> ProcessPayload {
        let mut payload = ProcessPayload {
            process_id: Some(process_id),
            ..Default::default()
        };
        match self {
            ProcessEvent::Hello(pid) => payload.process_id = Some(pid),
            ProcessEvent::Stdin(data) => {
                payload.source = Some(Source::Stdin);
                payload.data = Some(data);
            }
            ProcessEvent::StdinClose => payload.source = Some(Source::Stdin),
            ProcessEvent::Stdout(data) => {
                payload.source = Some(Source::Stdout);
                payload.data = Some(data);
            }
            ProcessEvent::Stderr(data) => {
                payload.source = Some(Source::Stderr);
                payload.data = Some(data);
            }
            ProcessEvent::Tty(tty) => payload.tty = Some(tty),
            ProcessEvent::Signal(signal) => payload.signal = Some(signal),
            ProcessEvent::Exited(status) => payload.exit_status = Some(status),
            ProcessEvent::Failed(message) => payload.error = Some(message),
        }
        payload
    }
}

impl TryFrom<ProcessPayload> for ProcessEvent {
    type Error = InvalidRecord;

    fn try_from(payload: ProcessPayload) -> Result<ProcessEvent, InvalidRecord> {
        if let Some(message) = payload.error {
            return Ok(ProcessEvent::Failed(message));
        }
        if let Some(status) = payload.exit_status {
            return Ok(ProcessEvent::Exited(status));
        }
        if let Some(tty) = payload.tty {
            return Ok(ProcessEvent::Tty(tty));
        }
        if let Some(signal) = payload.signal {
            return Ok(ProcessEvent::Signal(signal));
        }
        match (payload.source, payload.data) {
            (Some(Source::Stdin), Some(data)) => Ok(ProcessEvent::Stdin(data)),
            (Some(Source::Stdin), None) => Ok(ProcessEvent::StdinClose),
            (Some(Source::Stdout), Some(data)) => Ok(ProcessEvent::Stdout(data)),
            (Some(Source::Stderr), Some(data)) => Ok(ProcessEvent::Stderr(data)),
            (Some(_), None) => Err(InvalidRecord("output record without data")),
            (None, Some(_)) => Err(InvalidRecord("data record without source")),
            (None, None) => match payload.process_id {
                Some(pid) => Ok(ProcessEvent::Hello(pid)),
                None => Err(InvalidRecord("empty record")),
            },
        }
    }
}

impl From<BackendError> for RemoteError {
    fn from(e: BackendError) -> RemoteError {
        RemoteError {
            message: e.message,
            data: e.data,
            backtrace: e.backtrace,
        }
    }
}

impl From<ContainerSpec> for CreateRequest {
    fn from(spec: ContainerSpec) -> CreateRequest {
        CreateRequest {
            handle: Some(spec.handle).filter(|handle| !handle.is_empty()),
            rootfs: Some(spec.rootfs).filter(|rootfs| !rootfs.is_empty()),
            grace_time: (!spec.grace_time.is_zero()).then(|| spec.grace_time.as_secs()),
            network: Some(spec.network).filter(|network| !network.is_empty()),
            bind_mounts: spec.bind_mounts,
            properties: spec.properties,
            env: spec.env,
            privileged: spec.privileged,
        }
    }
}

impl CreateRequest {
    /// The container spec this request describes. An unspecified grace time
    /// becomes `default_grace_time`.
    pub fn into_spec(self, default_grace_time: Duration) -> ContainerSpec {
        ContainerSpec {
            handle: self.handle.unwrap_or_default(),
            rootfs: self.rootfs.unwrap_or_default(),
            grace_time: self
                .grace_time
                .map(Duration::from_secs)
                .unwrap_or(default_grace_time),
            network: self.network.unwrap_or_default(),
            bind_mounts: self.bind_mounts,
            properties: self.properties,
            env: self.env,
            privileged: self.privileged,
        }
    }
}

impl From<ProcessSpec> for RunRequest {
    fn from(spec: ProcessSpec) -> RunRequest {
        RunRequest {
            path: Some(spec.path).filter(|path| !path.is_empty()),
            args: spec.args,
            dir: spec.dir,
            user: Some(spec.user).filter(|user| !user.is_empty()),
            env: spec.env,
            privileged: spec.privileged,
            tty: spec.tty,
            rlimits: Some(spec.limits),
        }
    }
}

impl From<RunRequest> for ProcessSpec {
    fn from(request: RunRequest) -> ProcessSpec {
        ProcessSpec {
            path: request.path.unwrap_or_default(),
            args: request.args,
            dir: request.dir,
            user: request.user.unwrap_or_default(),
            env: request.env,
            privileged: request.privileged,
            tty: request.tty,
            limits: request.rlimits.unwrap_or_default(),
        }
    }
}

mod base64 {
    use base64::{engine::general_purpose::STANDARD as Base64, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => String::serialize(&Base64.encode(v), s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|encoded| {
                Base64
                    .decode(encoded.as_bytes())
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_spec_survives_the_wire() {
        let spec = ContainerSpec {
            handle: "some-handle".into(),
            rootfs: "/path/to/rootfs".into(),
            grace_time: Duration::from_secs(42),
            network: "some-network".into(),
            bind_mounts: vec![BindMount {
                src_path: "/bind/mount/src".into(),
                dst_path: "/bind/mount/dst".into(),
                mode: crate::backend::BindMountMode::Rw,
                origin: crate::backend::BindMountOrigin::Container,
            }],
            properties: [("prop-a".to_string(), "val-a".to_string())]
                .into_iter()
                .collect(),
            env: vec!["env1=env1Value".into(), "env2=env2Value".into()],
            privileged: false,
        };

        let request = CreateRequest::from(spec.clone());
        let json = serde_json::to_vec(&request).unwrap();
        let decoded: CreateRequest = serde_json::from_slice(&json).unwrap();

        assert_eq!(decoded.into_spec(Duration::from_secs(7)), spec);
    }

    #[test]
    fn unspecified_grace_time_takes_the_default() {
        let request = CreateRequest::default();
        let spec = request.into_spec(Duration::from_secs(42));
        assert_eq!(spec.grace_time, Duration::from_secs(42));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let decoded: CreateRequest =
            serde_json::from_str(r#"{"handle":"h","brand_new_field":true}"#).unwrap();
        assert_eq!(decoded.handle.as_deref(), Some("h"));
    }

    #[test]
    fn payload_data_is_binary_safe() {
        let event = ProcessEvent::Stdout(vec![0, 159, 146, 150]);
        let payload = event.clone().into_payload(1);
        let json = serde_json::to_vec(&payload).unwrap();
        let decoded: ProcessPayload = serde_json::from_slice(&json).unwrap();
        assert_eq!(ProcessEvent::try_from(decoded).unwrap(), event);
    }

    #[test]
    fn terminal_records_win_the_discrimination() {
        let payload = ProcessPayload {
            process_id: Some(1),
            exit_status: Some(0),
            ..Default::default()
        };
        assert_eq!(
            ProcessEvent::try_from(payload).unwrap(),
            ProcessEvent::Exited(0)
        );
    }

    #[test]
    fn ambiguous_records_are_rejected() {
        let payload = ProcessPayload {
            process_id: Some(1),
            source: Some(Source::Stdout),
            ..Default::default()
        };
        assert!(ProcessEvent::try_from(payload).is_err());

        assert!(ProcessEvent::try_from(ProcessPayload::default()).is_err());
    }

    #[test]
    fn unknown_signals_fail_to_decode() {
        assert!(serde_json::from_str::<ProcessPayload>(r#"{"process_id":1,"signal":"hup"}"#).is_err());
    }
}
