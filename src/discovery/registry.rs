//! Hardware-address keyed reconciliation of discovery replies.
//!
//! The same gateway answers several times per scan, sometimes from a stale
//! address and sometimes from a sentinel while it reboots. The registry keeps
//! one record per [`HardwareAddress`] and only ever improves its address:
//! a sentinel is replaced by a usable address, never the other way round,
//! and one usable address never replaces another.

use std::collections::HashMap;

use super::{DiscoveredDevice, HardwareAddress};
use crate::{family::GatewayFamily, network::LocalInterface};

/// What [`DeviceRegistry::merge`] did with a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First reply from this hardware address
    Inserted,
    /// Stored record had a sentinel address and was replaced
    Replaced,
    /// Stored record kept its address; placeholders may have been filled
    Kept,
}

/// Devices seen during one scan, in first-seen order
#[derive(Debug, Default, Clone)]
pub struct DeviceRegistry {
    devices: Vec<DiscoveredDevice>,
    index: HashMap<HardwareAddress, usize>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one parsed reply into the registry
    pub fn merge(&mut self, device: DiscoveredDevice) -> MergeOutcome {
        let Some(&slot) = self.index.get(&device.hw_address) else {
            log::debug!("new device {} at {}", device.hw_address, device.address);
            self.index.insert(device.hw_address, self.devices.len());
            self.devices.push(device);
            return MergeOutcome::Inserted;
        };

        let stored = &mut self.devices[slot];
        stored.last_seen = stored.last_seen.max(device.last_seen);

        if device.has_usable_address() && !stored.has_usable_address() {
            log::debug!(
                "device {} resolved from {} to {}",
                device.hw_address,
                stored.address,
                device.address
            );
            let previous = std::mem::replace(stored, device);
            fill_placeholders(stored, previous);
            return MergeOutcome::Replaced;
        }

        fill_placeholders(stored, device);
        MergeOutcome::Kept
    }

    /// Merge every device of another scan
    pub fn extend<I: IntoIterator<Item = DiscoveredDevice>>(&mut self, devices: I) {
        for device in devices {
            self.merge(device);
        }
    }

    /// Look a device up by hardware address
    pub fn find(&self, hw_address: &HardwareAddress) -> Option<&DiscoveredDevice> {
        self.index.get(hw_address).map(|&slot| &self.devices[slot])
    }

    /// All devices in first-seen order
    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.devices
    }

    /// Consume the registry, returning devices in first-seen order
    pub fn into_devices(self) -> Vec<DiscoveredDevice> {
        self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Refresh the same-subnet hint of every device
    pub fn annotate_reachability(&mut self, interfaces: &[LocalInterface]) {
        for device in &mut self.devices {
            device.annotate_reachability(interfaces);
        }
    }
}

/// Copy model, firmware and family from `other` where `stored` has none
fn fill_placeholders(stored: &mut DiscoveredDevice, other: DiscoveredDevice) {
    let model_known = !other.model_unknown();
    let firmware_known = !other.firmware_unknown();
    let DiscoveredDevice {
        model,
        firmware,
        family,
        ..
    } = other;

    if stored.model_unknown() && model_known {
        stored.model = model;
    }
    if stored.firmware_unknown() && firmware_known {
        stored.firmware = firmware;
    }
    if stored.family == GatewayFamily::Unknown {
        stored.family = family;
    }
}

impl FromIterator<DiscoveredDevice> for DeviceRegistry {
    fn from_iter<I: IntoIterator<Item = DiscoveredDevice>>(iter: I) -> Self {
        let mut registry = Self::new();
        registry.extend(iter);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn device(mac: &str, address: Ipv4Addr) -> DiscoveredDevice {
        DiscoveredDevice::new(mac.parse().unwrap(), address)
    }

    #[test]
    fn test_sentinel_then_valid_resolves() {
        let mut registry = DeviceRegistry::new();
        assert_eq!(
            registry.merge(device("AA-BB-CC-DD-EE-FF", Ipv4Addr::UNSPECIFIED)),
            MergeOutcome::Inserted
        );
        assert_eq!(
            registry.merge(device("aa:bb:cc:dd:ee:ff", Ipv4Addr::new(192, 168, 1, 50))),
            MergeOutcome::Replaced
        );

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.devices()[0].address, Ipv4Addr::new(192, 168, 1, 50));
    }

    #[test]
    fn test_replacement_refreshes_identity_fields() {
        let mut registry = DeviceRegistry::new();
        let mut rebooting = device("AA-BB-CC-DD-EE-FF", Ipv4Addr::UNSPECIFIED);
        rebooting.model = "USR-N510".into();
        rebooting.firmware = "V1.0.8".into();
        rebooting.family = GatewayFamily::N510;
        registry.merge(rebooting);

        let mut resolved = device("AA-BB-CC-DD-EE-FF", Ipv4Addr::new(192, 168, 1, 50));
        resolved.model = "USR-N720".into();
        resolved.firmware = "V2.0.3".into();
        resolved.family = GatewayFamily::N720;
        assert_eq!(registry.merge(resolved), MergeOutcome::Replaced);

        let stored = &registry.devices()[0];
        assert_eq!(stored.address, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(stored.model, "USR-N720");
        assert_eq!(stored.firmware, "V2.0.3");
        assert_eq!(stored.family, GatewayFamily::N720);
    }

    #[test]
    fn test_replacement_keeps_known_fields_over_placeholders() {
        let mut registry = DeviceRegistry::new();
        let mut rebooting = device("AA-BB-CC-DD-EE-FF", Ipv4Addr::UNSPECIFIED);
        rebooting.model = "USR-N510".into();
        rebooting.family = GatewayFamily::N510;
        registry.merge(rebooting);

        registry.merge(device("AA-BB-CC-DD-EE-FF", Ipv4Addr::new(192, 168, 1, 50)));

        let stored = &registry.devices()[0];
        assert_eq!(stored.model, "USR-N510");
        assert!(stored.firmware_unknown());
        assert_eq!(stored.family, GatewayFamily::N510);
    }

    #[test]
    fn test_valid_never_regresses() {
        let mut registry = DeviceRegistry::new();
        registry.merge(device("AA-BB-CC-DD-EE-FF", Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(
            registry.merge(device("AA-BB-CC-DD-EE-FF", Ipv4Addr::UNSPECIFIED)),
            MergeOutcome::Kept
        );
        registry.merge(device("AA-BB-CC-DD-EE-FF", Ipv4Addr::BROADCAST));

        assert_eq!(registry.devices()[0].address, Ipv4Addr::new(192, 168, 1, 50));
    }

    #[test]
    fn test_valid_addresses_do_not_flap() {
        let mut registry = DeviceRegistry::new();
        registry.merge(device("AA-BB-CC-DD-EE-FF", Ipv4Addr::new(192, 168, 1, 50)));
        registry.merge(device("AA-BB-CC-DD-EE-FF", Ipv4Addr::new(192, 168, 0, 7)));

        assert_eq!(registry.devices()[0].address, Ipv4Addr::new(192, 168, 1, 50));
    }

    #[test]
    fn test_placeholders_filled_without_touching_address() {
        let mut registry = DeviceRegistry::new();
        registry.merge(device("AA-BB-CC-DD-EE-FF", Ipv4Addr::new(192, 168, 1, 50)));

        let mut richer = device("AA-BB-CC-DD-EE-FF", Ipv4Addr::new(10, 0, 0, 9));
        richer.model = "USR-N720".into();
        richer.firmware = "V2.0.1".into();
        richer.family = GatewayFamily::N720;
        registry.merge(richer);

        let stored = &registry.devices()[0];
        assert_eq!(stored.address, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(stored.model, "USR-N720");
        assert_eq!(stored.firmware, "V2.0.1");
        assert_eq!(stored.family, GatewayFamily::N720);
    }

    #[test]
    fn test_two_scan_cycles_resolve_one_device() {
        let first_scan: DeviceRegistry =
            vec![device("AA-BB-CC-DD-EE-FF", Ipv4Addr::UNSPECIFIED)].into_iter().collect();
        let second_scan = vec![device("AA-BB-CC-DD-EE-FF", Ipv4Addr::new(192, 168, 1, 77))];

        let mut merged = first_scan;
        merged.extend(second_scan);

        let mac: HardwareAddress = "AA-BB-CC-DD-EE-FF".parse().unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.find(&mac).unwrap().address, Ipv4Addr::new(192, 168, 1, 77));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let registry: DeviceRegistry = vec![
            device("00-00-00-00-00-02", Ipv4Addr::new(10, 0, 0, 2)),
            device("00-00-00-00-00-01", Ipv4Addr::new(10, 0, 0, 1)),
            device("00-00-00-00-00-02", Ipv4Addr::new(10, 0, 0, 3)),
        ]
        .into_iter()
        .collect();

        let addresses: Vec<_> = registry.devices().iter().map(|d| d.address).collect();
        assert_eq!(
            addresses,
            vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1)]
        );
    }
}
