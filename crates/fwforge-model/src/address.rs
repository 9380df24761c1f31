//! Address arithmetic shared by the expansion stages.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Expand an IPv4 range into the minimal set of covering CIDR blocks.
///
/// The result is ordered by start address, which keeps downstream output
/// stable. An inverted range yields an empty vector.
pub fn range_to_cidrs_v4(start: Ipv4Addr, end: Ipv4Addr) -> Vec<Ipv4Net> {
    let mut lo = u32::from(start);
    let hi = u32::from(end);
    let mut out = Vec::new();

    while lo <= hi {
        // Largest block aligned at `lo` that does not overshoot `hi`.
        let max_align = if lo == 0 { 32 } else { lo.trailing_zeros() };
        let span = u64::from(hi) - u64::from(lo) + 1;
        let max_span = 63 - span.leading_zeros();
        let bits = max_align.min(max_span);
        let prefix = (32 - bits) as u8;

        out.push(
            Ipv4Net::new(Ipv4Addr::from(lo), prefix).expect("prefix computed within bounds"),
        );

        let step = 1u64 << bits;
        let next = u64::from(lo) + step;
        if next > u64::from(u32::MAX) {
            break;
        }
        lo = next as u32;
    }
    out
}

/// Numeric ordering key for mixed-family addresses. IPv4 sorts before IPv6.
pub fn sort_key(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u128::from(u32::from(*a)),
        IpAddr::V6(a) => u128::from(*a),
    }
}

/// True when `net` contains `addr`, honoring family.
pub fn net_contains(net: &IpNet, addr: &IpAddr) -> bool {
    match (net, addr) {
        (IpNet::V4(n), IpAddr::V4(a)) => n.contains(a),
        (IpNet::V6(n), IpAddr::V6(a)) => n.contains(a),
        _ => false,
    }
}

/// True when the inclusive range [start, end] contains `addr`.
pub fn range_contains(start: &IpAddr, end: &IpAddr, addr: &IpAddr) -> bool {
    match (start, end, addr) {
        (IpAddr::V4(s), IpAddr::V4(e), IpAddr::V4(a)) => {
            (u32::from(*s)..=u32::from(*e)).contains(&u32::from(*a))
        }
        (IpAddr::V6(s), IpAddr::V6(e), IpAddr::V6(a)) => {
            (u128::from(*s)..=u128::from(*e)).contains(&u128::from(*a))
        }
        _ => false,
    }
}

/// Split an IPv4 network into the CIDR blocks covering it minus one address.
///
/// Used when a rule matches a network that contains the firewall itself: the
/// firewall address moves to INPUT/OUTPUT and the remainder stays in
/// FORWARD.
pub fn net_minus_addr_v4(net: &Ipv4Net, addr: &Ipv4Addr) -> Vec<Ipv4Net> {
    if !net.contains(addr) {
        return vec![*net];
    }
    let lo = u32::from(net.network());
    let hi = u32::from(net.broadcast());
    let a = u32::from(*addr);

    let mut out = Vec::new();
    if a > lo {
        out.extend(range_to_cidrs_v4(Ipv4Addr::from(lo), Ipv4Addr::from(a - 1)));
    }
    if a < hi {
        out.extend(range_to_cidrs_v4(Ipv4Addr::from(a + 1), Ipv4Addr::from(hi)));
    }
    out
}

pub fn family_of(addr: &IpAddr) -> crate::Family {
    match addr {
        IpAddr::V4(_) => crate::Family::V4,
        IpAddr::V6(_) => crate::Family::V6,
    }
}

pub fn net_family(net: &IpNet) -> crate::Family {
    match net {
        IpNet::V4(_) => crate::Family::V4,
        IpNet::V6(_) => crate::Family::V6,
    }
}

/// Host-route form of an address (`/32` or `/128`).
pub fn host_net(addr: IpAddr) -> IpNet {
    match addr {
        IpAddr::V4(a) => IpNet::V4(Ipv4Net::new(a, 32).expect("/32 is valid")),
        IpAddr::V6(a) => IpNet::V6(Ipv6Net::new(a, 128).expect("/128 is valid")),
    }
}
