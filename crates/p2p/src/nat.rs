//! Deterministic NAT posture classification.
//!
//! Reachability is derived purely from the addresses the host is listening
//! on, whether a relay address has been observed, and the outcome of recent
//! outgoing dials. No probing beyond what the swarm already does.

use std::net::{Ipv4Addr, Ipv6Addr};

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reachability {
    Public,
    Private,
    Relay,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatClass {
    None,
    FullCone,
    Restricted,
    PortRestricted,
    Symmetric,
    Unknown,
}

/// Classifies the node's posture.
///
/// Rules, in order:
/// 1. a relay address observed            => Relay / Symmetric
/// 2. public address and no private one   => Public / None
/// 3. only private addresses, dials ok    => Private / PortRestricted
/// 4. only private addresses, dials fail  => Private / Symmetric
pub fn classify(
    listen_addrs: &[Multiaddr],
    relay_observed: bool,
    outbound_ok: Option<bool>,
) -> (Reachability, NatClass) {
    if relay_observed {
        return (Reachability::Relay, NatClass::Symmetric);
    }

    let mut has_public = false;
    let mut has_private = false;
    for addr in listen_addrs {
        match addr_kind(addr) {
            Some(AddrKind::Public) => has_public = true,
            Some(AddrKind::Private) => has_private = true,
            Some(AddrKind::Loopback) | None => {}
        }
    }

    if has_public && !has_private {
        return (Reachability::Public, NatClass::None);
    }
    if has_private {
        return match outbound_ok {
            Some(true) => (Reachability::Private, NatClass::PortRestricted),
            Some(false) => (Reachability::Private, NatClass::Symmetric),
            None => (Reachability::Private, NatClass::Unknown),
        };
    }
    (Reachability::Unknown, NatClass::Unknown)
}

/// True for loopback multiaddrs; used to filter advertisements in wide-area
/// mode.
pub fn is_loopback(addr: &Multiaddr) -> bool {
    matches!(addr_kind(addr), Some(AddrKind::Loopback))
}

enum AddrKind {
    Public,
    Private,
    Loopback,
}

fn addr_kind(addr: &Multiaddr) -> Option<AddrKind> {
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(ip) => return Some(classify_v4(ip)),
            Protocol::Ip6(ip) => return Some(classify_v6(ip)),
            _ => {}
        }
    }
    None
}

fn classify_v4(ip: Ipv4Addr) -> AddrKind {
    if ip.is_loopback() {
        AddrKind::Loopback
    } else if ip.is_private() || ip.is_link_local() || ip.is_unspecified() {
        AddrKind::Private
    } else {
        AddrKind::Public
    }
}

fn classify_v6(ip: Ipv6Addr) -> AddrKind {
    if ip.is_loopback() {
        AddrKind::Loopback
    } else if ip.is_unspecified() || (ip.segments()[0] & 0xfe00) == 0xfc00 {
        // unique-local fc00::/7
        AddrKind::Private
    } else {
        AddrKind::Public
    }
}
