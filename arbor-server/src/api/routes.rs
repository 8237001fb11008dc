use serde::{Deserialize, Serialize};
use std::fmt;

/// Request methods of the control protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// Logical operations of the protocol. Client and server share one fixed
/// table from operation to method and path template, so protocol evolution
/// happens in exactly one place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Ping,
    Capacity,
    List,
    Create,
    Info,
    Stop,
    Destroy,
    StreamIn,
    StreamOut,
    LimitBandwidth,
    CurrentBandwidthLimits,
    LimitCpu,
    CurrentCpuLimits,
    LimitDisk,
    CurrentDiskLimits,
    LimitMemory,
    CurrentMemoryLimits,
    NetIn,
    NetOut,
    GetProperty,
    SetProperty,
    RemoveProperty,
    Run,
    Attach,
    Kill,
}

/// Path parameters extracted from (or substituted into) a route template.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params {
    pub handle: Option<String>,
    pub pid: Option<u32>,
    pub key: Option<String>,
}

impl Params {
    pub fn handle(handle: &str) -> Params {
        Params {
            handle: Some(handle.to_string()),
            ..Default::default()
        }
    }

    pub fn process(handle: &str, pid: u32) -> Params {
        Params {
            handle: Some(handle.to_string()),
            pid: Some(pid),
            ..Default::default()
        }
    }

    pub fn property(handle: &str, key: &str) -> Params {
        Params {
            handle: Some(handle.to_string()),
            key: Some(key.to_string()),
            ..Default::default()
        }
    }
}

const TABLE: &[(Operation, Method, &str)] = &[
    (Operation::Ping, Method::Get, "/ping"),
    (Operation::Capacity, Method::Get, "/capacity"),
    (Operation::List, Method::Get, "/containers"),
    (Operation::Create, Method::Post, "/containers"),
    (Operation::Info, Method::Get, "/containers/:handle/info"),
    (Operation::Stop, Method::Put, "/containers/:handle/stop"),
    (Operation::Destroy, Method::Delete, "/containers/:handle"),
    (Operation::StreamIn, Method::Put, "/containers/:handle/files"),
    (Operation::StreamOut, Method::Get, "/containers/:handle/files"),
    (
        Operation::LimitBandwidth,
        Method::Put,
        "/containers/:handle/limits/bandwidth",
    ),
    (
        Operation::CurrentBandwidthLimits,
        Method::Get,
        "/containers/:handle/limits/bandwidth",
    ),
    (
        Operation::LimitCpu,
        Method::Put,
        "/containers/:handle/limits/cpu",
    ),
    (
        Operation::CurrentCpuLimits,
        Method::Get,
        "/containers/:handle/limits/cpu",
    ),
    (
        Operation::LimitDisk,
        Method::Put,
        "/containers/:handle/limits/disk",
    ),
    (
        Operation::CurrentDiskLimits,
        Method::Get,
        "/containers/:handle/limits/disk",
    ),
    (
        Operation::LimitMemory,
        Method::Put,
        "/containers/:handle/limits/memory",
    ),
    (
        Operation::CurrentMemoryLimits,
        Method::Get,
        "/containers/:handle/limits/memory",
    ),
    (Operation::NetIn, Method::Post, "/containers/:handle/net/in"),
    (
        Operation::NetOut,
        Method::Post,
        "/containers/:handle/net/out",
    ),
    (
        Operation::GetProperty,
        Method::Get,
        "/containers/:handle/properties/:key",
    ),
    (
        Operation::SetProperty,
        Method::Put,
        "/containers/:handle/properties/:key",
    ),
    (
        Operation::RemoveProperty,
        Method::Delete,
        "/containers/:handle/properties/:key",
    ),
    (Operation::Run, Method::Post, "/containers/:handle/processes"),
    (
        Operation::Attach,
        Method::Get,
        "/containers/:handle/processes/:pid",
    ),
    (
        Operation::Kill,
        Method::Post,
        "/containers/:handle/processes/:pid/kill",
    ),
];

impl Operation {
    /// Method and path template of this operation.
    pub fn route(self) -> (Method, &'static str) {
        TABLE
            .iter()
            .find(|(op, _, _)| *op == self)
            .map(|(_, method, template)| (*method, *template))
            .unwrap_or_else(|| unreachable!("route table covers every operation"))
    }

    /// Request path with `params` substituted into the template.
    pub fn path(self, params: &Params) -> String {
        let (_, template) = self.route();
        template
            .split('/')
            .map(|segment| match segment {
                ":handle" => params.handle.clone().unwrap_or_default(),
                ":pid" => params.pid.map(|pid| pid.to_string()).unwrap_or_default(),
                ":key" => params.key.clone().unwrap_or_default(),
                literal => literal.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Match a request against the route table. Returns the operation and the
/// extracted path parameters, or `None` for an unknown route.
pub fn resolve(method: Method, path: &str) -> Option<(Operation, Params)> {
    'table: for (operation, table_method, template) in TABLE {
        if *table_method != method {
            continue;
        }

        let mut segments = path.split('/');
        let mut template_segments = template.split('/');
        let mut params = Params::default();

        loop {
            match (template_segments.next(), segments.next()) {
                (None, None) => return Some((*operation, params)),
                (Some(":handle"), Some(segment)) if !segment.is_empty() => {
                    params.handle = Some(segment.to_string());
                }
                (Some(":pid"), Some(segment)) => match segment.parse() {
                    Ok(pid) => params.pid = Some(pid),
                    Err(_) => continue 'table,
                },
                (Some(":key"), Some(segment)) if !segment.is_empty() => {
                    params.key = Some(segment.to_string());
                }
                (Some(expected), Some(segment)) if expected == segment => (),
                _ => continue 'table,
            }
        }
    }
    None
}
