//! Gateway Client Utilities
//!
//! This module provides the high-level entry point the configuration UI
//! talks to: scanning, family detection, adapter selection and the UDP
//! network settings command.

use std::{fs, net::Ipv4Addr, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    adapter::{self, Adapter},
    discovery::{DiscoveredDevice, HardwareAddress},
    encoding::{AckFlags, Credentials, NetworkConfigCommand, NetworkSettings},
    family::{FamilyDetector, GatewayFamily},
    http::{self, HttpConfig, HttpTransport, ReqwestTransport},
    transport::{self, BroadcastTransport, DiscoveryConfig},
    workflow::{ProvisioningBackend, ProvisioningPlan, Provisioner},
};

/// Errors loading a [`ClientConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything the client needs, loadable from JSON
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub discovery: DiscoveryConfig,
    pub http: HttpConfig,
    /// Used for HTTP Basic auth and UDP commands
    pub credentials: Credentials,
    pub provisioning: ProvisioningPlan,
}

impl ClientConfig {
    /// Load a configuration file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: display,
            source,
        })
    }
}

/// High-level gateway client
#[derive(Clone)]
pub struct GatewayClient {
    config: ClientConfig,
    transport: BroadcastTransport,
    http: Arc<dyn HttpTransport>,
}

impl GatewayClient {
    /// Create a client using `reqwest` for HTTP
    pub fn new(config: ClientConfig) -> http::Result<Self> {
        let http = Arc::new(ReqwestTransport::new(&config.http, config.credentials.clone())?);
        Ok(Self::with_http(config, http))
    }

    /// Create a client over a custom HTTP transport
    pub fn with_http(config: ClientConfig, http: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport: BroadcastTransport::new(config.discovery.clone()),
            config,
            http,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Scan for gateways for the whole of `timeout`
    pub async fn scan(&self, timeout: Duration) -> Vec<DiscoveredDevice> {
        self.transport.scan(timeout).await
    }

    /// Classify the gateway at `address`
    pub async fn detect_family(&self, address: Ipv4Addr) -> GatewayFamily {
        FamilyDetector::new(self.http.clone(), self.config.http.retry.clone())
            .detect(address)
            .await
    }

    /// Adapter for a gateway of a known family
    pub fn adapter_for(&self, family: GatewayFamily, address: Ipv4Addr) -> adapter::Result<Adapter> {
        Adapter::for_family(
            family,
            self.http.clone(),
            address,
            self.config.http.retry.clone(),
        )
    }

    /// Detect the family at `address` and return its adapter
    pub async fn connect(&self, address: Ipv4Addr) -> adapter::Result<Adapter> {
        let family = self.detect_family(address).await;
        self.adapter_for(family, address)
    }

    /// Push network settings to the gateway with `hw_address` over UDP
    pub async fn send_network_config(
        &self,
        hw_address: HardwareAddress,
        settings: NetworkSettings,
    ) -> transport::Result<AckFlags> {
        let command = NetworkConfigCommand::new(hw_address, self.config.credentials.clone(), settings);
        self.transport.send_network_config(&command).await
    }

    /// A provisioning run using the configured plan
    pub fn provisioner(&self) -> Provisioner<GatewayClient> {
        Provisioner::new(self.clone(), self.config.provisioning.clone())
    }
}

#[async_trait]
impl ProvisioningBackend for GatewayClient {
    async fn scan(&self, timeout: Duration) -> Vec<DiscoveredDevice> {
        GatewayClient::scan(self, timeout).await
    }

    async fn send_network_config(&self, command: &NetworkConfigCommand) -> transport::Result<AckFlags> {
        self.transport.send_network_config(command).await
    }

    async fn detect_family(&self, address: Ipv4Addr) -> GatewayFamily {
        GatewayClient::detect_family(self, address).await
    }
}
