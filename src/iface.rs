//! Resolve a network interface name to the IPv4 address bound on it.
use if_addrs::{get_if_addrs, IfAddr};
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// First IPv4 address on the interface named exactly `name`.
///
/// A missing interface is not an error: callers bind the wildcard instead.
pub fn resolve(name: &str) -> Option<Ipv4Addr> {
    let interfaces = match get_if_addrs() {
        Ok(v) => v,
        Err(e) => {
            warn!(interface = name, error = %e, "interface enumeration failed");
            return None;
        }
    };
    for iface in interfaces {
        let IfAddr::V4(v4) = iface.addr else {
            continue;
        };
        if iface.name == name {
            return Some(v4.ip);
        }
    }
    debug!(interface = name, "no IPv4 address on interface");
    None
}

/// Local address to bind on: the interface's address, or `0.0.0.0`.
pub fn bind_address(interface: Option<&str>) -> Ipv4Addr {
    interface.and_then(resolve).unwrap_or(Ipv4Addr::UNSPECIFIED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_interface_falls_back_to_wildcard() {
        assert_eq!(resolve("no-such-iface0"), None);
        assert_eq!(bind_address(Some("no-such-iface0")), Ipv4Addr::UNSPECIFIED);
        assert_eq!(bind_address(None), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn loopback_resolves_when_present() {
        // Interface naming differs per OS; only check when a loopback with
        // 127.0.0.1 is enumerated.
        let lo = get_if_addrs()
            .unwrap_or_default()
            .into_iter()
            .find(|i| matches!(i.addr, IfAddr::V4(ref v4) if v4.ip == Ipv4Addr::LOCALHOST));
        if let Some(lo) = lo {
            assert_eq!(resolve(&lo.name), Some(Ipv4Addr::LOCALHOST));
        }
    }
}
