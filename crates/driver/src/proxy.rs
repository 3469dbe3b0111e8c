//! Squid caching proxy sidecar.
//!
//! One proxy container can serve a whole fleet of sessions. Traffic routed
//! through it hits the shared cache, which cuts repeated page loads when many
//! sessions visit the same hosts.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    corral_factory::{
        ContainerFactory, ContainerRecord, ContainerRole, ContainerSpec, Endpoint, TcpProbe,
    },
    serde_json::{Value, json},
    tracing::{debug, info},
};

use crate::error::DriverError;

/// Container-side proxy port.
pub const SQUID_PORT: &str = "3128/tcp";

const SQUID_IMAGE: &str = "minimum2scp/squid";

const SQUID_MEM_LIMIT: i64 = 256 * 1024 * 1024;

const SQUID_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// A running squid container sessions can route their traffic through.
pub struct SquidProxy {
    factory: Arc<ContainerFactory>,
    record: ContainerRecord,
    terminated: AtomicBool,
}

impl SquidProxy {
    /// Start a proxy container and wait for it to accept connections.
    ///
    /// The proxy restarts on failure: a crashed cache should come back on
    /// its own rather than silently break every session pointed at it.
    pub async fn create(factory: Arc<ContainerFactory>) -> Result<Self, DriverError> {
        let spec = ContainerSpec::new(SQUID_IMAGE, SQUID_PORT, ContainerRole::Proxy)
            .mem_limit(SQUID_MEM_LIMIT)
            .restart_on_failure();

        debug!(image = SQUID_IMAGE, "creating proxy container");
        let record = factory.create(&spec).await?;
        factory
            .await_ready(&record, &TcpProbe::default(), SQUID_READY_TIMEOUT)
            .await?;

        info!(name = record.name, endpoint = %record.endpoint, "proxy ready");
        Ok(Self {
            factory,
            record,
            terminated: AtomicBool::new(false),
        })
    }

    /// The proxy's published host endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.record.endpoint
    }

    /// The container name backing this proxy.
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// W3C `proxy` capability routing HTTP and HTTPS through this container.
    pub fn selenium_proxy(&self) -> Value {
        let address = self.record.endpoint.to_string();
        json!({
            "proxyType": "manual",
            "httpProxy": address,
            "sslProxy": address,
        })
    }

    /// Destroy the proxy container. Idempotent, and shared-reference so a
    /// pool can tear down a proxy its sessions still hold handles to.
    pub async fn quit(&self) -> Result<(), DriverError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Ok(());
        }
        debug!(name = self.record.name, "proxy quit");
        self.factory.destroy(&self.record).await?;
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use corral_factory::{ContainerStatus, EngineEndpoint};

    use super::*;

    #[tokio::test]
    async fn quit_twice_destroys_the_container_once() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Regex("_ping".into()))
            .with_status(200)
            .with_body("OK")
            .create_async()
            .await;
        server
            .mock("POST", mockito::Matcher::Regex("/containers/.+/stop".into()))
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .with_body(r#"{"message":"no such container"}"#)
            .create_async()
            .await;
        let remove = server
            .mock("DELETE", mockito::Matcher::Regex("/containers/".into()))
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .with_body(r#"{"message":"no such container"}"#)
            .expect(1)
            .create_async()
            .await;

        let factory = Arc::new(
            ContainerFactory::connect(&EngineEndpoint::Http(server.url()), Some("t".into()))
                .await
                .unwrap(),
        );
        let proxy = SquidProxy {
            factory,
            record: ContainerRecord {
                id: "cafe03".into(),
                name: "corral-t-cafe03".into(),
                image: SQUID_IMAGE.into(),
                labels: HashMap::new(),
                endpoint: Endpoint { host: "127.0.0.1".into(), port: 3128 },
                status: ContainerStatus::Running,
            },
            terminated: AtomicBool::new(false),
        };

        proxy.quit().await.unwrap();
        proxy.quit().await.unwrap();
        remove.assert_async().await;
    }
}
