//! Locally gathered device facts reported alongside manifests.

use std::fs;
use std::net::UdpSocket;

use serde_json::{json, Value};

pub trait FactsProvider: Send + Sync {
    fn hardware_info(&self) -> Value;

    fn network_info(&self) -> Value;
}

/// Reads facts from the running Linux system.
#[derive(Debug, Default)]
pub struct SystemFacts;

fn read_trimmed(path: &str) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Address of the interface that routes to the outside world. Connecting a
/// UDP socket sends no packet.
fn primary_local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

impl FactsProvider for SystemFacts {
    fn hardware_info(&self) -> Value {
        json!({
            "hostname": read_trimmed("/etc/hostname"),
            "kernel": read_trimmed("/proc/sys/kernel/osrelease"),
            "arch": std::env::consts::ARCH,
            "os": std::env::consts::OS,
        })
    }

    fn network_info(&self) -> Value {
        json!({
            "hostname": read_trimmed("/etc/hostname"),
            "local_ipv4": primary_local_ip(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_facts_shape() {
        let facts = SystemFacts;
        let hw = facts.hardware_info();
        assert_eq!(hw["arch"], std::env::consts::ARCH);
        assert!(facts.network_info().get("local_ipv4").is_some());
    }
}
