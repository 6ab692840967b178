//! Guest network readiness: extract a stable IPv4 address from what guest tools report.

use std::net::{IpAddr, Ipv4Addr};
use vsfleet_providers::inventory::GuestNic;

/// First IPv4 address reported on an adapter that has a MAC and an IP configuration.
///
/// Adapters are scanned in backend order and never re-sorted, so the answer is
/// deterministic for a given report. `None` means "not yet available".
pub fn resolve_ipv4(nics: &[GuestNic]) -> Option<Ipv4Addr> {
    nics.iter()
        .filter(|nic| !nic.mac_address.is_empty())
        .filter_map(|nic| nic.ip_config.as_ref())
        .find_map(|cfg| cfg.addresses.iter().find_map(|a| parse_ipv4(a)))
}

/// Accepts dotted quads and IPv4-mapped IPv6 (`::ffff:10.0.0.5`).
fn parse_ipv4(raw: &str) -> Option<Ipv4Addr> {
    match raw.trim().parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}
