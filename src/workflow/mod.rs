//! Provisioning Workflow Module
//!
//! This module drives a factory-fresh gateway onto the site network:
//! first to a known static address, then optionally over to DHCP, and
//! finally identifies its protocol family.
//!
//! # Overview
//!
//! ```text
//! Unconfigured -> StaticIpSet -> DiscoveredAtStaticIp
//!              -> DhcpEnabled -> DiscoveredAtDhcpIp -> Ready
//! ```
//!
//! Every transition waits on independent discovery scans with a bounded
//! attempt budget. A gateway is unreachable by any protocol for 12 to 20
//! seconds after each settings change, so each phase starts with a fixed
//! reboot wait. An exhausted budget aborts the run; later phases are never
//! attempted and nothing is rolled back.
//!
//! The workflow talks to the network only through [`ProvisioningBackend`],
//! which [`crate::client::GatewayClient`] implements.

use std::{fmt, net::Ipv4Addr, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    discovery::{DiscoveredDevice, HardwareAddress},
    encoding::{AckFlags, Credentials, NetworkConfigCommand, NetworkSettings},
    family::GatewayFamily,
    transport::{self, TransportError},
};

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Reasons a provisioning run stops
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The UDP command pair was not acknowledged
    #[error("{phase}: configuration command failed: {source}")]
    Command {
        phase: ProvisioningPhase,
        #[source]
        source: TransportError,
    },
    /// The gateway did not reappear within the scan budget
    #[error("gateway not found while waiting for {phase} after {attempts} scan(s); check cabling and retry manually")]
    DeviceLost {
        phase: ProvisioningPhase,
        attempts: u32,
    },
    /// The gateway was found but answered neither family probe
    #[error("family of {address} not detected after {attempts} attempt(s)")]
    FamilyUndetected { address: Ipv4Addr, attempts: u32 },
}

/// Workflow states, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProvisioningPhase {
    Unconfigured,
    StaticIpSet,
    DiscoveredAtStaticIp,
    DhcpEnabled,
    DiscoveredAtDhcpIp,
    Ready,
}

impl fmt::Display for ProvisioningPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisioningPhase::Unconfigured => "unconfigured",
            ProvisioningPhase::StaticIpSet => "static IP set",
            ProvisioningPhase::DiscoveredAtStaticIp => "discovered at static IP",
            ProvisioningPhase::DhcpEnabled => "DHCP enabled",
            ProvisioningPhase::DiscoveredAtDhcpIp => "discovered at DHCP IP",
            ProvisioningPhase::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Attempt budgets and waits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningPlan {
    /// Scans per discovery phase
    pub scan_attempts: u32,
    /// Window of each scan
    pub scan_timeout_ms: u64,
    /// Pause between scans
    pub scan_interval_ms: u64,
    /// Wait after each settings change before the first scan
    pub reboot_wait_ms: u64,
    /// Family detection attempts once the final address is known
    pub detect_attempts: u32,
    /// Pause between detection attempts
    pub detect_interval_ms: u64,
}

impl Default for ProvisioningPlan {
    fn default() -> Self {
        Self {
            scan_attempts: 6,
            scan_timeout_ms: 5000,
            scan_interval_ms: 5000,
            reboot_wait_ms: 15000,
            detect_attempts: 3,
            detect_interval_ms: 5000,
        }
    }
}

/// The gateway to provision and where it should end up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningTarget {
    pub hw_address: HardwareAddress,
    #[serde(default)]
    pub credentials: Credentials,
    /// Static address applied in the first step
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Switch to DHCP once the static address is confirmed
    #[serde(default = "default_true")]
    pub finish_with_dhcp: bool,
}

fn default_true() -> bool {
    true
}

impl ProvisioningTarget {
    fn command(&self, settings: NetworkSettings) -> NetworkConfigCommand {
        NetworkConfigCommand::new(self.hw_address, self.credentials.clone(), settings)
    }

    fn static_settings(&self) -> NetworkSettings {
        NetworkSettings::Static {
            ip: self.ip,
            gateway: self.gateway,
            netmask: self.netmask,
        }
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningReport {
    pub hw_address: HardwareAddress,
    pub address: Ipv4Addr,
    pub family: GatewayFamily,
    /// Phases passed through, in order
    pub phases: Vec<ProvisioningPhase>,
}

/// Network primitives the workflow is built from
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// One discovery scan, fresh result set
    async fn scan(&self, timeout: Duration) -> Vec<DiscoveredDevice>;

    /// Send settings plus save/reboot and wait for both acks
    async fn send_network_config(&self, command: &NetworkConfigCommand) -> transport::Result<AckFlags>;

    /// Probe the family of the gateway at `address`
    async fn detect_family(&self, address: Ipv4Addr) -> GatewayFamily;
}

#[async_trait]
impl<T: ProvisioningBackend + ?Sized> ProvisioningBackend for Arc<T> {
    async fn scan(&self, timeout: Duration) -> Vec<DiscoveredDevice> {
        (**self).scan(timeout).await
    }

    async fn send_network_config(&self, command: &NetworkConfigCommand) -> transport::Result<AckFlags> {
        (**self).send_network_config(command).await
    }

    async fn detect_family(&self, address: Ipv4Addr) -> GatewayFamily {
        (**self).detect_family(address).await
    }
}

/// Runs the provisioning state machine for one gateway
pub struct Provisioner<B> {
    backend: B,
    plan: ProvisioningPlan,
    phases: Vec<ProvisioningPhase>,
}

impl<B: ProvisioningBackend> Provisioner<B> {
    pub fn new(backend: B, plan: ProvisioningPlan) -> Self {
        Self {
            backend,
            plan,
            phases: vec![ProvisioningPhase::Unconfigured],
        }
    }

    /// Current phase
    pub fn phase(&self) -> ProvisioningPhase {
        self.phases
            .last()
            .copied()
            .unwrap_or(ProvisioningPhase::Unconfigured)
    }

    /// Phases reached so far
    pub fn history(&self) -> &[ProvisioningPhase] {
        &self.phases
    }

    fn advance(&mut self, phase: ProvisioningPhase) {
        log::info!("provisioning: {} -> {}", self.phase(), phase);
        self.phases.push(phase);
    }

    /// Run every phase for `target`
    pub async fn run(&mut self, target: &ProvisioningTarget) -> Result<ProvisioningReport> {
        log::info!("provisioning {} to {}", target.hw_address, target.ip);

        self.send(target, target.static_settings(), ProvisioningPhase::StaticIpSet)
            .await?;
        let device = self
            .wait_for(target.hw_address, ProvisioningPhase::DiscoveredAtStaticIp, |d| {
                d.address == target.ip
            })
            .await?;
        let mut address = device.address;

        if target.finish_with_dhcp {
            self.send(target, NetworkSettings::Dhcp, ProvisioningPhase::DhcpEnabled)
                .await?;
            let device = self
                .wait_for(target.hw_address, ProvisioningPhase::DiscoveredAtDhcpIp, |d| {
                    d.has_usable_address() && !d.is_factory_default() && d.address != target.ip
                })
                .await?;
            address = device.address;
        }

        let family = self.detect(address).await?;
        self.advance(ProvisioningPhase::Ready);

        Ok(ProvisioningReport {
            hw_address: target.hw_address,
            address,
            family,
            phases: self.phases.clone(),
        })
    }

    async fn send(
        &mut self,
        target: &ProvisioningTarget,
        settings: NetworkSettings,
        next: ProvisioningPhase,
    ) -> Result<()> {
        self.backend
            .send_network_config(&target.command(settings))
            .await
            .map_err(|source| WorkflowError::Command {
                phase: next,
                source,
            })?;
        self.advance(next);
        Ok(())
    }

    /// Scan until `hw_address` shows up in a state accepted by `accept`
    async fn wait_for<F>(
        &mut self,
        hw_address: HardwareAddress,
        next: ProvisioningPhase,
        accept: F,
    ) -> Result<DiscoveredDevice>
    where
        F: Fn(&DiscoveredDevice) -> bool,
    {
        tokio::time::sleep(Duration::from_millis(self.plan.reboot_wait_ms)).await;

        let attempts = self.plan.scan_attempts.max(1);
        for attempt in 1..=attempts {
            let devices = self
                .backend
                .scan(Duration::from_millis(self.plan.scan_timeout_ms))
                .await;

            match devices.into_iter().find(|d| d.hw_address == hw_address) {
                Some(device) if accept(&device) => {
                    self.advance(next);
                    return Ok(device);
                }
                Some(device) => log::debug!(
                    "scan {}/{}: {} seen at {}, waiting for {}",
                    attempt,
                    attempts,
                    hw_address,
                    device.address,
                    next
                ),
                None => log::debug!("scan {}/{}: {} not seen", attempt, attempts, hw_address),
            }

            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(self.plan.scan_interval_ms)).await;
            }
        }

        log::warn!("{} not found while waiting for {}", hw_address, next);
        Err(WorkflowError::DeviceLost {
            phase: next,
            attempts,
        })
    }

    async fn detect(&self, address: Ipv4Addr) -> Result<GatewayFamily> {
        let attempts = self.plan.detect_attempts.max(1);
        for attempt in 1..=attempts {
            let family = self.backend.detect_family(address).await;
            if family.is_known() {
                return Ok(family);
            }
            log::debug!("detection {}/{} at {} inconclusive", attempt, attempts, address);
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(self.plan.detect_interval_ms)).await;
            }
        }
        Err(WorkflowError::FamilyUndetected { address, attempts })
    }
}
