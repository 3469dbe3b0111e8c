//! Connection handling for the container runtime control plane.

use {
    bollard::{API_DEFAULT_VERSION, Docker},
    tracing::debug,
};

use crate::error::FactoryError;

/// Engine API timeout, in seconds.
const ENGINE_TIMEOUT_SECS: u64 = 120;

/// Where the container runtime control plane lives.
///
/// The default is the local engine resolved from the environment, matching
/// `docker` CLI behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EngineEndpoint {
    /// Local engine, resolved from `DOCKER_HOST` or the platform default.
    #[default]
    Local,
    /// A unix socket path.
    UnixSocket(String),
    /// A remote HTTP endpoint, e.g. `tcp://10.0.0.5:2375`.
    Http(String),
}

impl EngineEndpoint {
    /// Human-readable label for log output.
    pub fn label(&self) -> String {
        match self {
            Self::Local => "local".to_string(),
            Self::UnixSocket(path) => format!("unix://{path}"),
            Self::Http(addr) => addr.clone(),
        }
    }
}

/// Open a client connection to the engine. The connection is lazy; use
/// [`check_engine`] to verify the control plane is actually reachable.
pub fn connect_engine(endpoint: &EngineEndpoint) -> Result<Docker, FactoryError> {
    let docker = match endpoint {
        EngineEndpoint::Local => Docker::connect_with_local_defaults(),
        EngineEndpoint::UnixSocket(path) => {
            Docker::connect_with_socket(path, ENGINE_TIMEOUT_SECS, API_DEFAULT_VERSION)
        },
        EngineEndpoint::Http(addr) => {
            Docker::connect_with_http(addr, ENGINE_TIMEOUT_SECS, API_DEFAULT_VERSION)
        },
    };
    docker.map_err(|e| FactoryError::EngineUnavailable(e.to_string()))
}

/// Ping the engine, failing fast when the control plane is unreachable.
pub async fn check_engine(docker: &Docker) -> Result<(), FactoryError> {
    let version = docker
        .ping()
        .await
        .map_err(|e| FactoryError::EngineUnavailable(e.to_string()))?;
    debug!(response = %version, "engine ping ok");
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_labels() {
        assert_eq!(EngineEndpoint::Local.label(), "local");
        assert_eq!(
            EngineEndpoint::UnixSocket("/var/run/docker.sock".into()).label(),
            "unix:///var/run/docker.sock"
        );
        assert_eq!(
            EngineEndpoint::Http("tcp://10.0.0.5:2375".into()).label(),
            "tcp://10.0.0.5:2375"
        );
    }

    #[test]
    fn default_endpoint_is_local() {
        assert_eq!(EngineEndpoint::default(), EngineEndpoint::Local);
    }
}
