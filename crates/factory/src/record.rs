//! Container records, specifications, and identification labels.

use std::{collections::HashMap, fmt};

/// Label marking a container as created by this system. `scrub_containers`
/// filters on this label and must never destroy containers lacking it.
pub const MANAGED_LABEL: &str = "corral.managed";

/// Value of [`MANAGED_LABEL`] on managed containers.
pub const MANAGED_VALUE: &str = "true";

/// Label carrying the container's role.
pub const ROLE_LABEL: &str = "corral.role";

/// Label carrying the owning factory's namespace.
pub const NAMESPACE_LABEL: &str = "corral.ns";

/// What service a managed container hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRole {
    /// A remote-automation browser session.
    Browser,
    /// A caching proxy sidecar.
    Proxy,
}

impl ContainerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Proxy => "proxy",
        }
    }
}

impl fmt::Display for ContainerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a managed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Creating,
    Running,
    Stopped,
    Removed,
}

/// Published host:port of the service inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Specification for a container the factory should start.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Image reference, e.g. `selenium/standalone-chrome:latest`.
    pub image: String,
    /// Container-side service port in `PORT/PROTO` form, e.g. `4444/tcp`.
    /// Published to an engine-assigned host port.
    pub service_port: String,
    /// Role label applied to the container.
    pub role: ContainerRole,
    /// Environment variables in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Command override, if any.
    pub cmd: Option<Vec<String>>,
    /// Extra labels merged under the identification labels.
    pub extra_labels: HashMap<String, String>,
    /// Memory limit in bytes.
    pub mem_limit: Option<i64>,
    /// Shared-memory size in bytes. Browsers need a generous `/dev/shm`.
    pub shm_size: Option<i64>,
    /// Restart the container on failure.
    pub restart_on_failure: bool,
}

impl ContainerSpec {
    pub fn new(
        image: impl Into<String>,
        service_port: impl Into<String>,
        role: ContainerRole,
    ) -> Self {
        Self {
            image: image.into(),
            service_port: service_port.into(),
            role,
            env: Vec::new(),
            cmd: None,
            extra_labels: HashMap::new(),
            mem_limit: None,
            shm_size: None,
            restart_on_failure: false,
        }
    }

    pub fn env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_labels.insert(key.into(), value.into());
        self
    }

    pub fn mem_limit(mut self, bytes: i64) -> Self {
        self.mem_limit = Some(bytes);
        self
    }

    pub fn shm_size(mut self, bytes: i64) -> Self {
        self.shm_size = Some(bytes);
        self
    }

    pub fn restart_on_failure(mut self) -> Self {
        self.restart_on_failure = true;
        self
    }
}

/// One runtime container managed by this process.
///
/// Records are created and mutated only by the factory; every record carries
/// the identification labels so cleanup can always rediscover it.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    /// Opaque runtime container id.
    pub id: String,
    /// Generated container name, unique within the factory namespace.
    pub name: String,
    /// Image reference the container was created from.
    pub image: String,
    /// Full label set, identification labels included.
    pub labels: HashMap<String, String>,
    /// Published host endpoint for the service port.
    pub endpoint: Endpoint,
    /// Lifecycle status as last observed by the factory.
    pub status: ContainerStatus,
}

impl ContainerRecord {
    /// The container's role, when the role label is present and known.
    pub fn role(&self) -> Option<ContainerRole> {
        match self.labels.get(ROLE_LABEL).map(String::as_str) {
            Some("browser") => Some(ContainerRole::Browser),
            Some("proxy") => Some(ContainerRole::Proxy),
            _ => None,
        }
    }
}

/// The identification labels applied to every managed container.
pub(crate) fn identification_labels(
    namespace: &str,
    role: ContainerRole,
) -> HashMap<String, String> {
    HashMap::from([
        (MANAGED_LABEL.to_string(), MANAGED_VALUE.to_string()),
        (ROLE_LABEL.to_string(), role.as_str().to_string()),
        (NAMESPACE_LABEL.to_string(), namespace.to_string()),
    ])
}
