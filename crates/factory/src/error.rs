//! Factory error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while managing containers.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// The container runtime control plane could not be reached. Fatal at
    /// factory construction; never retried automatically.
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The runtime rejected a container creation request (bad image, port
    /// conflict). Surfaced to the caller of `create`, not retried.
    #[error("failed to create container from image {image}: {message}")]
    ContainerCreate { image: String, message: String },

    /// A readiness probe did not succeed within its timeout. The container is
    /// left running for inspection.
    #[error("container {name} not ready after {timeout:?}")]
    ContainerNotReady { name: String, timeout: Duration },

    /// The runtime did not publish a host port for the container's service
    /// port.
    #[error("container {name} has no published endpoint for {port}")]
    MissingEndpoint { name: String, port: String },

    /// Any other engine-side failure.
    #[error("container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),
}
