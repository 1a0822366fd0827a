//! Loopback fixtures for the end-to-end tests.

use std::net::SocketAddr;
use std::time::Duration;

use hailmesh_node::{DirectoryService, NodeConfig};
use hailmesh_transfer::{Dispatcher, Endpoint};

/// Everything on 127.0.0.1 with ephemeral ports.
pub fn loopback_config() -> NodeConfig {
    NodeConfig {
        directory_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        fetch_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

/// A directory running on its own dispatcher.
pub struct TestDirectory {
    pub addr: SocketAddr,
    dispatcher: Dispatcher<DirectoryService>,
}

impl TestDirectory {
    /// Start a directory and point `config` at it.
    pub async fn start(config: &mut NodeConfig) -> anyhow::Result<Self> {
        let endpoint = Endpoint::bind(config.directory_transport()).await?;
        let addr = endpoint.local_addr()?;
        let mut dispatcher = Dispatcher::new(DirectoryService::new(config.directory()));
        dispatcher.register(endpoint).await?;
        config.directory_addr = addr;
        Ok(Self { addr, dispatcher })
    }

    pub async fn stop(self) -> anyhow::Result<DirectoryService> {
        self.dispatcher.shutdown().await
    }
}

/// Give in-flight datagrams time to land.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
