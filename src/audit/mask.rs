//! Client address masking for audit records.
//!
//! Only the network-identifying prefix survives: the first two octets of an
//! IPv4 address (`/16`) or the first three hextets of an IPv6 address
//! (`/48`). Events without a client address record `unknown`.

use std::net::IpAddr;

/// Placeholder recorded when no client address is available.
pub const UNKNOWN_IP: &str = "unknown";

/// Mask an address down to its network prefix.
pub fn mask_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            format!("{a}.{b}.0.0/16")
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => mask_ip(IpAddr::V4(v4)),
            None => {
                let [a, b, c, ..] = v6.segments();
                format!("{a:x}:{b:x}:{c:x}::/48")
            }
        },
    }
}
