//! The weft overlay network.
//!
//! Hosts the libp2p swarm (TCP + QUIC, Noise, yamux), local-segment mdns
//! discovery, a Kademlia content-routing DHT (wide-area mode only), NAT
//! posture classification, and three stream protocols: the tagged shard/share
//! rpc, the compute delegation wire, and the Noise XX session handshake that
//! exchanges short ids and derives the guard's per-peer shared secret.

pub mod behaviour;
pub mod blob;
pub mod error;
pub mod handshake;
pub mod nat;
pub mod network;
pub mod peer_map;
pub mod protocol;
pub mod proximity;
pub mod rpc;

pub use error::P2pError;
pub use network::{ComputeHandler, NetworkHandle, NetworkService, P2pConfig};

/// Stream protocol id for the shard/share request-response wire.
pub const RPC_PROTOCOL: &str = "/app/rpc/1.0.0";
/// Stream protocol id for compute task delegation.
pub const COMPUTE_PROTOCOL: &str = "/app/compute/1.0.0";
/// Stream protocol id for the session handshake.
pub const HANDSHAKE_PROTOCOL: &str = "/app/handshake/1.0.0";

/// Fixed application label used as the DHT rendezvous key. Must stay within
/// 63 octets (DNS-SD service-type limit).
pub const DISCOVERY_LABEL: &str = "weft-mesh-v1";

/// Hard cap on a shard carried in one rpc response.
pub const MAX_SHARD_BYTES: usize = 1 << 20;
/// Hard cap on a threshold share carried in one rpc response.
pub const MAX_SHARE_BYTES: usize = 4 << 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_label_fits_dns_sd() {
        assert!(DISCOVERY_LABEL.len() <= 63);
    }
}
