//! The container factory: sole owner of create/destroy on the runtime client.

use std::{collections::HashMap, time::Duration};

use {
    bollard::{
        Docker,
        exec::{CreateExecOptions, StartExecOptions},
        models::{ContainerCreateBody, HostConfig, RestartPolicy, RestartPolicyNameEnum},
        query_parameters::{
            CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
            DownloadFromContainerOptionsBuilder, InspectContainerOptions,
            ListContainersOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
            StopContainerOptionsBuilder,
        },
    },
    futures::{StreamExt, TryStreamExt},
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{
    engine::{EngineEndpoint, check_engine, connect_engine},
    error::FactoryError,
    probe::ReadyProbe,
    record::{
        ContainerRecord, ContainerSpec, ContainerStatus, Endpoint, MANAGED_LABEL, MANAGED_VALUE,
        identification_labels,
    },
};

/// Seconds the engine waits before killing a container on stop.
const STOP_GRACE_SECS: i32 = 5;

/// Process-local registry of containers this factory created, wrapping the
/// runtime client with identification labels, readiness semantics, and bulk
/// cleanup.
///
/// Constructed explicitly and passed to whoever needs it; there is no hidden
/// process-wide singleton. One factory per process is the common case, more
/// are fine — each gets its own namespace.
pub struct ContainerFactory {
    engine: Docker,
    namespace: String,
    registry: Mutex<HashMap<String, ContainerRecord>>,
}

impl ContainerFactory {
    /// Connect to the engine at `endpoint` and validate connectivity.
    ///
    /// Fails fast with [`FactoryError::EngineUnavailable`] when the control
    /// plane cannot be reached at all.
    pub async fn connect(
        endpoint: &EngineEndpoint,
        namespace: Option<String>,
    ) -> Result<Self, FactoryError> {
        let engine = connect_engine(endpoint)?;
        check_engine(&engine).await?;
        let namespace = namespace.unwrap_or_else(gen_namespace);
        info!(endpoint = %endpoint.label(), namespace, "container factory connected");
        Ok(Self {
            engine,
            namespace,
            registry: Mutex::new(HashMap::new()),
        })
    }

    /// The factory's namespace, stamped on every container it creates.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Number of containers currently registered.
    pub async fn container_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Snapshot of the registered records.
    pub async fn records(&self) -> Vec<ContainerRecord> {
        self.registry.lock().await.values().cloned().collect()
    }

    /// Create and start a container from `spec`, merge in the identification
    /// labels, publish the service port, and register the record.
    pub async fn create(&self, spec: &ContainerSpec) -> Result<ContainerRecord, FactoryError> {
        let name = self.gen_name();
        let mut labels = identification_labels(&self.namespace, spec.role);
        labels.extend(spec.extra_labels.clone());

        debug!(name, image = %spec.image, role = %spec.role, "creating container");

        let exposed_ports: HashMap<String, HashMap<(), ()>> =
            HashMap::from([(spec.service_port.clone(), HashMap::new())]);

        let restart_policy = spec.restart_on_failure.then(|| RestartPolicy {
            name: Some(RestartPolicyNameEnum::ON_FAILURE),
            maximum_retry_count: None,
        });

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            labels: Some(labels.clone()),
            env: if spec.env.is_empty() { None } else { Some(spec.env.clone()) },
            cmd: spec.cmd.clone(),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                publish_all_ports: Some(true),
                memory: spec.mem_limit,
                shm_size: spec.shm_size,
                restart_policy,
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .engine
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&name).build()),
                body,
            )
            .await
            .map_err(|e| create_error(&spec.image, e))?;

        self.engine
            .start_container(&name, None::<StartContainerOptions>)
            .await
            .map_err(|e| create_error(&spec.image, e))?;

        let endpoint = self.published_endpoint(&name, &spec.service_port).await?;

        let record = ContainerRecord {
            id: created.id,
            name: name.clone(),
            image: spec.image.clone(),
            labels,
            endpoint,
            status: ContainerStatus::Running,
        };

        self.registry.lock().await.insert(name.clone(), record.clone());
        info!(name, endpoint = %record.endpoint, "container started");
        Ok(record)
    }

    /// Poll `probe` against the container's published endpoint with bounded
    /// exponential backoff until it succeeds or `timeout` elapses.
    ///
    /// On timeout the container is intentionally left running so an operator
    /// can inspect it.
    pub async fn await_ready(
        &self,
        record: &ContainerRecord,
        probe: &dyn ReadyProbe,
        timeout: Duration,
    ) -> Result<(), FactoryError> {
        debug!(name = record.name, endpoint = %record.endpoint, "waiting for container readiness");
        if crate::probe::poll_until_ready(&record.endpoint, probe, timeout).await {
            Ok(())
        } else {
            Err(FactoryError::ContainerNotReady {
                name: record.name.clone(),
                timeout,
            })
        }
    }

    /// Stop and remove a container. Idempotent: destroying an already-removed
    /// record is a no-op.
    pub async fn destroy(&self, record: &ContainerRecord) -> Result<(), FactoryError> {
        self.registry.lock().await.remove(&record.name);
        destroy_by_name(&self.engine, &record.name).await?;
        debug!(name = record.name, "container destroyed");
        Ok(())
    }

    /// Destroy every container registered with this factory.
    pub async fn destroy_all(&self) -> Result<(), FactoryError> {
        let records: Vec<ContainerRecord> = {
            let mut registry = self.registry.lock().await;
            registry.drain().map(|(_, r)| r).collect()
        };
        for record in records {
            destroy_by_name(&self.engine, &record.name).await?;
        }
        Ok(())
    }

    /// Destroy every container on the runtime carrying the identification
    /// label, plus any `extra_labels` selector, regardless of which process
    /// created it.
    ///
    /// Queries the runtime directly rather than the in-memory registry, so it
    /// can clean up after crashed processes. Containers lacking the managed
    /// label are never touched.
    pub async fn scrub_containers(
        &self,
        extra_labels: &[(&str, &str)],
    ) -> Result<usize, FactoryError> {
        let destroyed = scrub_ids(&self.engine, extra_labels).await?;
        // drop registry entries only for containers the scrub destroyed;
        // a narrowed selector leaves the others running and registered
        let mut registry = self.registry.lock().await;
        remove_destroyed(&mut registry, &destroyed);
        Ok(destroyed.len())
    }

    /// Pull `image` unless it is already present locally. Preloading images
    /// before starting a fleet of sessions reduces readiness timeouts.
    pub async fn load_image(&self, image: &str) -> Result<(), FactoryError> {
        if self.engine.inspect_image(image).await.is_ok() {
            debug!(image, "image already present");
            return Ok(());
        }
        let (from_image, tag) = match image.rsplit_once(':') {
            Some((img, tag)) => (img, tag),
            None => (image, "latest"),
        };
        info!(image, "pulling image");
        self.engine
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    /// Run a command inside a managed container, detached.
    pub async fn exec_detached(
        &self,
        record: &ContainerRecord,
        cmd: Vec<String>,
        env: Option<Vec<String>>,
    ) -> Result<(), FactoryError> {
        let exec = self
            .engine
            .create_exec(
                &record.name,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env,
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        self.engine
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    /// Copy a file or directory out of a managed container as a tar archive.
    pub async fn download_archive(
        &self,
        record: &ContainerRecord,
        path: &str,
    ) -> Result<Vec<u8>, FactoryError> {
        let mut stream = self.engine.download_from_container(
            &record.name,
            Some(DownloadFromContainerOptionsBuilder::new().path(path).build()),
        );
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes)
    }

    /// Generate a container name unique within this factory's namespace.
    fn gen_name(&self) -> String {
        format!("corral-{}-{}", self.namespace, gen_hex(6))
    }

    /// Read back the engine-assigned host endpoint for `service_port`.
    async fn published_endpoint(
        &self,
        name: &str,
        service_port: &str,
    ) -> Result<Endpoint, FactoryError> {
        let missing = || FactoryError::MissingEndpoint {
            name: name.to_string(),
            port: service_port.to_string(),
        };

        let inspect = self
            .engine
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;
        let binding = inspect
            .network_settings
            .and_then(|net| net.ports)
            .and_then(|ports| ports.get(service_port).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().next())
            .ok_or_else(missing)?;

        let host = match binding.host_ip.as_deref() {
            None | Some("") | Some("0.0.0.0") | Some("::") => "127.0.0.1".to_string(),
            Some(ip) => ip.to_string(),
        };
        let port = binding
            .host_port
            .as_deref()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(missing)?;

        Ok(Endpoint { host, port })
    }
}

/// Destroy all managed containers visible to `engine`, filtered by the
/// identification label and any extra `key=value` selectors. Free function so
/// out-of-band cleanup does not need a live factory.
pub async fn scrub_containers(
    engine: &Docker,
    extra_labels: &[(&str, &str)],
) -> Result<usize, FactoryError> {
    Ok(scrub_ids(engine, extra_labels).await?.len())
}

/// Scrub and report the ids of the containers actually destroyed.
async fn scrub_ids(
    engine: &Docker,
    extra_labels: &[(&str, &str)],
) -> Result<Vec<String>, FactoryError> {
    let mut label_filters = vec![format!("{MANAGED_LABEL}={MANAGED_VALUE}")];
    for (key, value) in extra_labels {
        label_filters.push(format!("{key}={value}"));
    }
    let filters: HashMap<String, Vec<String>> =
        HashMap::from([("label".to_string(), label_filters)]);

    let summaries = engine
        .list_containers(Some(
            ListContainersOptionsBuilder::new()
                .all(true)
                .filters(&filters)
                .build(),
        ))
        .await?;

    debug!(count = summaries.len(), "found managed containers to scrub");

    let mut destroyed = Vec::new();
    for summary in summaries {
        let Some(id) = summary.id else { continue };
        match destroy_by_name(engine, &id).await {
            Ok(()) => destroyed.push(id),
            Err(e) => warn!(id, error = %e, "failed to scrub container"),
        }
    }
    info!(removed = destroyed.len(), "scrub complete");
    Ok(destroyed)
}

/// Forget registry entries whose containers a scrub destroyed, keeping
/// records whose containers fell outside the scrub's selector.
fn remove_destroyed(registry: &mut HashMap<String, ContainerRecord>, destroyed: &[String]) {
    registry.retain(|_, record| !destroyed.iter().any(|id| *id == record.id));
}

/// Stop (best-effort) and force-remove one container. Missing containers are
/// treated as already destroyed.
async fn destroy_by_name(engine: &Docker, name: &str) -> Result<(), FactoryError> {
    let _ = engine
        .stop_container(
            name,
            Some(StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build()),
        )
        .await;
    match engine
        .remove_container(
            name,
            Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
        )
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

fn create_error(image: &str, error: bollard::errors::Error) -> FactoryError {
    match error {
        bollard::errors::Error::DockerResponseServerError { message, .. } => {
            FactoryError::ContainerCreate {
                image: image.to_string(),
                message,
            }
        },
        other => FactoryError::EngineUnavailable(other.to_string()),
    }
}

fn gen_namespace() -> String {
    gen_hex(8)
}

fn gen_hex(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let nibble: u8 = rng.random_range(0..16);
            char::from_digit(u32::from(nibble), 16).unwrap_or('0')
        })
        .collect()
}
