//! Gateway Provisioning Example
//!
//! Moves a factory-fresh gateway to a static address, then to DHCP, and
//! reports the family it ends up as.
//!
//! ```text
//! provision <MAC> <IP> <GATEWAY> <NETMASK> [--static-only]
//! ```

use gwconf::{ClientConfig, Credentials, GatewayClient, HardwareAddress, ProvisioningTarget};
use std::{env, net::Ipv4Addr, process};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 4 {
        eprintln!("usage: provision <MAC> <IP> <GATEWAY> <NETMASK> [--static-only]");
        process::exit(2);
    }

    let hw_address: HardwareAddress = args[0].parse()?;
    let ip: Ipv4Addr = args[1].parse()?;
    let gateway: Ipv4Addr = args[2].parse()?;
    let netmask: Ipv4Addr = args[3].parse()?;
    let finish_with_dhcp = !args.iter().any(|arg| arg == "--static-only");

    let config = ClientConfig::default();
    let target = ProvisioningTarget {
        hw_address,
        credentials: Credentials::default(),
        ip,
        gateway,
        netmask,
        finish_with_dhcp,
    };

    println!("Provisioning {} -> {} (dhcp afterwards: {})", hw_address, ip, finish_with_dhcp);

    let client = GatewayClient::new(config)?;
    let mut provisioner = client.provisioner();
    let result = provisioner.run(&target).await;
    match result {
        Ok(report) => {
            println!("Gateway {} ready at {} ({})", report.hw_address, report.address, report.family);
            for phase in &report.phases {
                println!("  {}", phase);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Provisioning stopped in {}: {}", provisioner.phase(), e);
            process::exit(1);
        }
    }
}
