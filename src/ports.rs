//! Resolution of container ports to host-reachable bindings.

use crate::backend::HostBinding;
use crate::error::{Result, TestctrError};

use std::collections::HashMap;

/// Normalize a user supplied port into the `"port/proto"` key used by the
/// runtime's inspect output. A bare port number defaults to tcp.
pub(crate) fn normalize_port_key(port: &str) -> Result<String> {
    let (number, proto) = match port.split_once('/') {
        Some((number, proto)) => (number, proto),
        None => (port, "tcp"),
    };

    if !matches!(proto, "tcp" | "udp" | "sctp") {
        return Err(TestctrError::InvalidConfig(format!(
            "port `{}` has unknown protocol `{}` (expected tcp, udp or sctp)",
            port, proto
        )));
    }

    match number.parse::<u16>() {
        Ok(n) if n > 0 => Ok(format!("{}/{}", n, proto)),
        _ => Err(TestctrError::InvalidConfig(format!(
            "port `{}` does not parse as 1..65535",
            port
        ))),
    }
}

/// Pick the binding used to reach `key` from the host.
///
/// The first IPv4 binding wins; an IPv6-only binding is not selected, so
/// callers surface not-ready instead of guessing at IPv6 reachability.
pub(crate) fn select_binding<'a>(
    ports: &'a HashMap<String, Vec<HostBinding>>,
    key: &str,
) -> Option<&'a HostBinding> {
    let bindings = ports.get(key)?;
    bindings
        .iter()
        .find(|b| !b.host_ip.contains(':') && !b.host_port.is_empty())
}

/// Resolve the host port bound to `port` in a container's port map, as
/// produced by the backend's inspect.
pub(crate) fn host_port_in_map(
    ports: &HashMap<String, Vec<HostBinding>>,
    port: &str,
    container_id: &str,
) -> Result<u16> {
    let key = normalize_port_key(port)?;
    let binding = select_binding(ports, &key).ok_or_else(|| {
        TestctrError::NotReady(format!(
            "port {} is not bound on container {}",
            key, container_id
        ))
    })?;
    binding.host_port.parse::<u16>().map_err(|_| {
        TestctrError::Runtime(format!(
            "runtime reported malformed host port `{}` for {}",
            binding.host_port, key
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port_map(entries: &[(&str, &[(&str, &str)])]) -> HashMap<String, Vec<HostBinding>> {
        let mut ports = HashMap::new();
        for (key, bindings) in entries {
            ports.insert(
                key.to_string(),
                bindings
                    .iter()
                    .map(|(ip, port)| HostBinding {
                        host_ip: ip.to_string(),
                        host_port: port.to_string(),
                    })
                    .collect(),
            );
        }
        ports
    }

    #[test]
    fn bare_port_defaults_to_tcp() {
        assert_eq!(normalize_port_key("6379").unwrap(), "6379/tcp");
    }

    #[test]
    fn explicit_protocol_is_preserved() {
        assert_eq!(normalize_port_key("53/udp").unwrap(), "53/udp");
        assert_eq!(normalize_port_key("9899/sctp").unwrap(), "9899/sctp");
    }

    #[test]
    fn invalid_ports_are_rejected() {
        for bad in ["0", "65536", "http", "", "80/quic"] {
            let err = normalize_port_key(bad).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::InvalidConfig, "{}", bad);
        }
    }

    #[test]
    fn first_binding_resolves() {
        let ports = port_map(&[("6379/tcp", &[("0.0.0.0", "49153")])]);
        assert_eq!(host_port_in_map(&ports, "6379", "abc").unwrap(), 49153);
    }

    #[test]
    fn ipv4_binding_is_preferred_over_ipv6() {
        let ports = port_map(&[("80/tcp", &[("::", "32768"), ("0.0.0.0", "32769")])]);
        assert_eq!(host_port_in_map(&ports, "80", "abc").unwrap(), 32769);
    }

    #[test]
    fn unbound_port_is_not_ready() {
        let ports = port_map(&[("80/tcp", &[])]);
        let err = host_port_in_map(&ports, "80", "abc").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotReady);
        assert!(err.to_string().contains("80/tcp"), "got: {}", err);
    }

    #[test]
    fn undeclared_port_is_not_ready() {
        let ports = port_map(&[]);
        let err = host_port_in_map(&ports, "80", "abc").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotReady);
    }

    #[test]
    fn ipv6_only_binding_is_not_ready() {
        let ports = port_map(&[("80/tcp", &[("::", "32768")])]);
        let err = host_port_in_map(&ports, "80", "abc").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotReady);
    }
}
