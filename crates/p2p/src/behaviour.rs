//! Composed swarm behaviour.
//!
//! Kademlia, autonat and dcutr are toggled off in local-only mode; mdns,
//! identify, ping and the three request-response protocols always run.

use std::time::Duration;

use libp2p::kad::store::MemoryStore;
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{autonat, dcutr, identify, identity, kad, mdns, ping, relay, PeerId, StreamProtocol};

use crate::handshake::HandshakeCodec;
use crate::protocol::ComputeCodec;
use crate::rpc::RpcCodec;
use crate::{COMPUTE_PROTOCOL, HANDSHAKE_PROTOCOL, RPC_PROTOCOL};

/// Identify protocol version string.
const IDENTIFY_PROTOCOL: &str = "/weft/id/1.0.0";

/// Ping cadence; results feed the node store's latency EWMA.
const PING_INTERVAL: Duration = Duration::from_secs(5);
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Generous ceiling for task execution over the compute wire.
const COMPUTE_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const RPC_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(NetworkBehaviour)]
pub struct WeftBehaviour {
    pub kad: Toggle<kad::Behaviour<MemoryStore>>,
    pub mdns: mdns::tokio::Behaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub autonat: Toggle<autonat::Behaviour>,
    pub dcutr: Toggle<dcutr::Behaviour>,
    pub relay: relay::client::Behaviour,
    pub rpc: request_response::Behaviour<RpcCodec>,
    pub compute: request_response::Behaviour<ComputeCodec>,
    pub handshake: request_response::Behaviour<HandshakeCodec>,
}

impl WeftBehaviour {
    /// `wide_area` enables the DHT and the NAT traversal sub-services.
    pub fn new(
        key: &identity::Keypair,
        relay: relay::client::Behaviour,
        wide_area: bool,
    ) -> Result<Self, std::io::Error> {
        let peer_id = PeerId::from(key.public());

        let kad = wide_area
            .then(|| {
                let mut config = kad::Config::default();
                config.set_query_timeout(Duration::from_secs(60));
                let mut behaviour =
                    kad::Behaviour::with_config(peer_id, MemoryStore::new(peer_id), config);
                behaviour.set_mode(Some(kad::Mode::Server));
                behaviour
            })
            .into();

        let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)?;

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            key.public(),
        ));

        let ping = ping::Behaviour::new(
            ping::Config::new()
                .with_interval(PING_INTERVAL)
                .with_timeout(PING_TIMEOUT),
        );

        let autonat = wide_area
            .then(|| autonat::Behaviour::new(peer_id, autonat::Config::default()))
            .into();
        let dcutr = wide_area.then(|| dcutr::Behaviour::new(peer_id)).into();

        let rpc = request_response::Behaviour::with_codec(
            RpcCodec,
            [(StreamProtocol::new(RPC_PROTOCOL), ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(RPC_REQUEST_TIMEOUT),
        );
        let compute = request_response::Behaviour::with_codec(
            ComputeCodec,
            [(StreamProtocol::new(COMPUTE_PROTOCOL), ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(COMPUTE_REQUEST_TIMEOUT),
        );
        let handshake = request_response::Behaviour::with_codec(
            HandshakeCodec,
            [(StreamProtocol::new(HANDSHAKE_PROTOCOL), ProtocolSupport::Full)],
            request_response::Config::default(),
        );

        Ok(WeftBehaviour {
            kad,
            mdns,
            identify,
            ping,
            autonat,
            dcutr,
            relay,
            rpc,
            compute,
            handshake,
        })
    }
}
