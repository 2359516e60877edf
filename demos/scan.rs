//! Gateway Scan Example
//!
//! Broadcasts a discovery search, prints every gateway that answered and
//! tries to detect the family of each reachable one.

use gwconf::{network, ClientConfig, GatewayClient};
use std::env;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => ClientConfig::default(),
    };
    let timeout = config.discovery.scan_timeout();
    let client = GatewayClient::new(config)?;

    println!("Gateway Scan");
    println!("============\n");
    for interface in network::local_interfaces()? {
        println!(
            "Interface {:<10} {}/{} broadcast {}",
            interface.name,
            interface.address,
            interface.netmask,
            interface.broadcast()
        );
    }
    println!("\nScanning for {:?}...\n", timeout);

    let devices = client.scan(timeout).await;
    if devices.is_empty() {
        println!("No gateways answered. Broadcast may be blocked on this network.");
        return Ok(());
    }

    println!(
        "{:<18} {:<16} {:<12} {:<10} {:<10} Family",
        "MAC", "Address", "Model", "Firmware", "Reachable"
    );
    for device in &devices {
        let family = if device.reachable == Some(true) {
            client.detect_family(device.address).await.to_string()
        } else {
            "-".to_string()
        };
        let reachable = match device.reachable {
            Some(true) => "yes",
            Some(false) => "no",
            None => "n/a",
        };
        println!(
            "{:<18} {:<16} {:<12} {:<10} {:<10} {}",
            device.hw_address.to_string(),
            device.address.to_string(),
            device.model,
            device.firmware,
            reachable,
            family
        );
    }

    println!("\nFound {} gateway(s)", devices.len());
    Ok(())
}
