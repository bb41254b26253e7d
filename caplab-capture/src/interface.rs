//! Network interface enumeration for live capture sources

use pnet_datalink::{self, NetworkInterface};
use std::net::IpAddr;

/// Pseudo-interface that captures on every interface (Linux)
pub const ANY_INTERFACE: &str = "any";

/// Information about a network interface
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    /// Interface name (e.g., "eth0", "wlan0")
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// MAC address if available
    pub mac: Option<String>,
    /// List of IP addresses assigned to this interface
    pub ips: Vec<IpAddr>,
    /// Whether the interface is up
    pub is_up: bool,
    /// Whether the interface is a loopback
    pub is_loopback: bool,
}

impl From<&NetworkInterface> for InterfaceInfo {
    fn from(iface: &NetworkInterface) -> Self {
        InterfaceInfo {
            name: iface.name.clone(),
            description: iface.description.clone(),
            mac: iface.mac.map(|mac| mac.to_string()),
            ips: iface.ips.iter().map(|network| network.ip()).collect(),
            is_up: iface.is_up(),
            is_loopback: iface.is_loopback(),
        }
    }
}

impl InterfaceInfo {
    /// Check if the interface can carry traffic worth capturing
    pub fn is_capture_capable(&self) -> bool {
        self.is_up && !self.is_loopback
    }

    /// One-line summary for listings
    pub fn summary(&self) -> String {
        let state = if self.is_up { "up" } else { "down" };
        let ips: Vec<String> = self.ips.iter().map(|ip| ip.to_string()).collect();
        let mut line = format!("{:<12} {:<5}", self.name, state);
        if let Some(mac) = &self.mac {
            line.push_str(&format!(" {}", mac));
        }
        if !ips.is_empty() {
            line.push_str(&format!(" [{}]", ips.join(", ")));
        }
        if self.is_loopback {
            line.push_str(" (loopback)");
        }
        line
    }
}

/// List all network interfaces, sorted by name
pub fn list_interfaces() -> Vec<InterfaceInfo> {
    let mut interfaces: Vec<InterfaceInfo> = pnet_datalink::interfaces()
        .iter()
        .map(InterfaceInfo::from)
        .collect();
    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    interfaces
}

/// Get information about a specific interface by name
pub fn get_interface(name: &str) -> Option<InterfaceInfo> {
    pnet_datalink::interfaces()
        .iter()
        .find(|iface| iface.name == name)
        .map(InterfaceInfo::from)
}

/// Check whether a live capture can be opened on `name`
pub fn interface_exists(name: &str) -> bool {
    name == ANY_INTERFACE || get_interface(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_nonexistent_interface() {
        assert!(get_interface("nonexistent_interface_xyz").is_none());
        assert!(!interface_exists("nonexistent_interface_xyz"));
    }

    #[test]
    fn test_any_always_exists() {
        assert!(interface_exists(ANY_INTERFACE));
    }

    #[test]
    fn test_listed_interfaces_resolve() {
        for iface in list_interfaces() {
            assert!(!iface.name.is_empty());
            assert!(interface_exists(&iface.name));
            if iface.is_loopback {
                assert!(!iface.is_capture_capable());
            }
            assert!(iface.summary().starts_with(&iface.name));
        }
    }

    #[test]
    fn test_summary_format() {
        let info = InterfaceInfo {
            name: "eth0".to_string(),
            description: String::new(),
            mac: Some("00:11:22:33:44:55".to_string()),
            ips: vec!["192.168.1.10".parse().unwrap()],
            is_up: true,
            is_loopback: false,
        };
        assert_eq!(
            info.summary(),
            "eth0         up    00:11:22:33:44:55 [192.168.1.10]"
        );
        assert!(info.is_capture_capable());
    }
}
