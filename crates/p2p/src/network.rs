//! Swarm service and its command handle.
//!
//! The service owns the libp2p swarm and every per-peer table; the rest of
//! the system talks to it through a cloneable [`NetworkHandle`]. One command
//! maps to at most one in-flight request; replies travel back over oneshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::kad::{self, RecordKey};
use libp2p::request_response::{self, OutboundRequestId, ResponseChannel};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{identify, identity, mdns, noise, ping, relay, tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use weft_metrics::P2P_METRICS;
use weft_peers::{Guard, NodeStore};
use weft_types::{Capacity, ShortId, Task, TaskResult};
use x25519_dalek::StaticSecret;

use crate::behaviour::{WeftBehaviour, WeftBehaviourEvent};
use crate::blob::BlobStore;
use crate::error::P2pError;
use crate::handshake::Handshake;
use crate::nat::{self, NatClass, Reachability};
use crate::peer_map::PeerRegistry;
use crate::protocol::{ComputeRequest, ComputeResponse};
use crate::proximity::RttTable;
use crate::rpc::{RpcRequest, RpcResponse};
use crate::DISCOVERY_LABEL;

/// Executes tasks arriving over the compute protocol and reports capacity.
#[async_trait]
pub trait ComputeHandler: Send + Sync {
    async fn execute(&self, task: Task) -> TaskResult;
    fn capacity(&self) -> Capacity;
}

#[derive(Clone, Debug)]
pub struct P2pConfig {
    /// Loopback-only: no DHT, no NAT traversal, loopback advertised.
    pub local_mode: bool,
    /// Overlay port for both TCP and QUIC; 0 picks an ephemeral port.
    pub port: u16,
    pub bootstrap: Vec<Multiaddr>,
    /// DHT rendezvous label, at most 63 octets.
    pub discovery_label: String,
    pub max_connections: usize,
    /// Connections pruned down to this count after the grace period.
    pub prune_target: usize,
    pub prune_grace: Duration,
    /// Per-attempt dial deadlines; the slice length is the attempt budget.
    pub dial_attempt_timeouts: [Duration; 3],
    pub dial_backoff: Duration,
    pub dht_sweep_interval: Duration,
    /// New peers dialed per provider sweep.
    pub dht_dial_cap: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        P2pConfig {
            local_mode: false,
            port: 0,
            bootstrap: Vec::new(),
            discovery_label: DISCOVERY_LABEL.to_string(),
            max_connections: 400,
            prune_target: 100,
            prune_grace: Duration::from_secs(2),
            dial_attempt_timeouts: [
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(30),
            ],
            dial_backoff: Duration::from_secs(2),
            dht_sweep_interval: Duration::from_secs(30),
            dht_dial_cap: 5,
        }
    }
}

/// Shared state the service reads and writes on behalf of the node.
pub struct NetworkContext {
    pub guard: Arc<Guard>,
    pub node_store: Arc<NodeStore>,
    pub registry: Arc<PeerRegistry>,
    pub rtt: Arc<RttTable>,
    pub blobs: Arc<BlobStore>,
    pub compute: Arc<dyn ComputeHandler>,
    /// This node's own alias, announced during the session handshake.
    pub self_short_id: ShortId,
    /// Static Curve25519 key for the session handshake.
    pub noise_static: StaticSecret,
}

enum Command {
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), P2pError>>,
    },
    SendRpc {
        peer: PeerId,
        request: RpcRequest,
        reply: oneshot::Sender<Result<RpcResponse, P2pError>>,
    },
    Delegate {
        peer: PeerId,
        task: Task,
        reply: oneshot::Sender<Result<TaskResult, P2pError>>,
    },
    QueryCapacity {
        peer: PeerId,
        reply: oneshot::Sender<Result<Capacity, P2pError>>,
    },
    OpenSession {
        peer: PeerId,
        reply: Option<oneshot::Sender<Result<[u8; 32], P2pError>>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Posture {
        reply: oneshot::Sender<(Reachability, NatClass)>,
    },
    Shutdown,
}

enum Internal {
    ComputeDone {
        channel: ResponseChannel<ComputeResponse>,
        result: TaskResult,
    },
}

enum ComputePending {
    Task(oneshot::Sender<Result<TaskResult, P2pError>>),
    Capacity(oneshot::Sender<Result<Capacity, P2pError>>),
}

enum InitiatorState {
    AwaitMsg2 { hs: Box<Handshake>, peer: PeerId },
    AwaitAck { secret: [u8; 32], peer: PeerId },
}

/// Cloneable front door to the network service.
#[derive(Clone)]
pub struct NetworkHandle {
    tx: mpsc::Sender<Command>,
    local_peer_id: PeerId,
    config: Arc<P2pConfig>,
}

impl NetworkHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Dials with the three-attempt policy: deadlines of 10, 20 and 30
    /// seconds and a fixed backoff between attempts.
    pub async fn dial(&self, addr: Multiaddr) -> Result<(), P2pError> {
        let mut last = P2pError::DialFailed("no attempt made".into());
        for (attempt, deadline) in self.config.dial_attempt_timeouts.iter().enumerate() {
            P2P_METRICS.dials_attempted.inc();
            let (reply_tx, reply_rx) = oneshot::channel();
            self.send(Command::Dial {
                addr: addr.clone(),
                reply: reply_tx,
            })
            .await?;
            match tokio::time::timeout(*deadline, reply_rx).await {
                Ok(Ok(Ok(()))) => return Ok(()),
                Ok(Ok(Err(err))) => last = err,
                Ok(Err(_)) => last = P2pError::ServiceClosed,
                Err(_) => last = P2pError::Timeout,
            }
            P2P_METRICS.dials_failed.inc();
            if attempt + 1 < self.config.dial_attempt_timeouts.len() {
                tokio::time::sleep(self.config.dial_backoff).await;
            }
        }
        Err(last)
    }

    pub async fn send_rpc(&self, peer: PeerId, request: RpcRequest) -> Result<RpcResponse, P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::SendRpc {
            peer,
            request,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| P2pError::ServiceClosed)?
    }

    /// Stores one shard on `peer`; the peer answers "OK".
    pub async fn store_shard(
        &self,
        peer: PeerId,
        file_hash: Vec<u8>,
        shard_index: u32,
        shard: Vec<u8>,
    ) -> Result<(), P2pError> {
        let resp = self
            .send_rpc(
                peer,
                RpcRequest::StoreShard {
                    file_hash,
                    shard_index,
                    shard,
                },
            )
            .await?;
        if resp.is_ok() {
            Ok(())
        } else {
            Err(P2pError::Protocol("store-shard not acknowledged".into()))
        }
    }

    /// Fetches a shard; `None` means the peer does not hold it (empty
    /// response, non-authoritative).
    pub async fn fetch_shard(
        &self,
        peer: PeerId,
        file_hash: Vec<u8>,
        shard_index: u32,
    ) -> Result<Option<Vec<u8>>, P2pError> {
        let resp = self
            .send_rpc(peer, RpcRequest::GetShard { file_hash, shard_index })
            .await?;
        Ok((!resp.is_empty()).then_some(resp.0))
    }

    pub async fn store_share(
        &self,
        peer: PeerId,
        file_id: Vec<u8>,
        from_peer: u32,
        share: Vec<u8>,
    ) -> Result<(), P2pError> {
        let resp = self
            .send_rpc(
                peer,
                RpcRequest::StoreShare {
                    file_id,
                    from_peer,
                    share,
                },
            )
            .await?;
        if resp.is_ok() {
            Ok(())
        } else {
            Err(P2pError::Protocol("store-share not acknowledged".into()))
        }
    }

    pub async fn fetch_share(&self, peer: PeerId, file_id: Vec<u8>) -> Result<Option<Vec<u8>>, P2pError> {
        let resp = self.send_rpc(peer, RpcRequest::GetShare { file_id }).await?;
        Ok((!resp.is_empty()).then_some(resp.0))
    }

    /// Sends a task over the compute wire and awaits its result.
    pub async fn delegate(&self, peer: PeerId, task: Task) -> Result<TaskResult, P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Delegate {
            peer,
            task,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| P2pError::ServiceClosed)?
    }

    pub async fn query_capacity(&self, peer: PeerId) -> Result<Capacity, P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::QueryCapacity { peer, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| P2pError::ServiceClosed)?
    }

    /// Runs the Noise XX session handshake with `peer`; returns the derived
    /// shared secret (also registered with the guard).
    pub async fn open_session(&self, peer: PeerId) -> Result<[u8; 32], P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::OpenSession {
            peer,
            reply: Some(reply_tx),
        })
        .await?;
        reply_rx.await.map_err(|_| P2pError::ServiceClosed)?
    }

    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>, P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::ListenAddrs { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| P2pError::ServiceClosed)
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::ConnectedPeers { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| P2pError::ServiceClosed)
    }

    pub async fn posture(&self) -> Result<(Reachability, NatClass), P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Posture { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| P2pError::ServiceClosed)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    async fn send(&self, cmd: Command) -> Result<(), P2pError> {
        self.tx.send(cmd).await.map_err(|_| P2pError::ServiceClosed)
    }
}

/// Owns the swarm; drive it with [`NetworkService::run`].
pub struct NetworkService {
    swarm: Swarm<WeftBehaviour>,
    config: P2pConfig,
    ctx: NetworkContext,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    internal_rx: mpsc::Receiver<Internal>,
    internal_tx: mpsc::Sender<Internal>,

    listen_addrs: Vec<Multiaddr>,
    connected: HashMap<PeerId, Instant>,
    sessions: HashMap<PeerId, [u8; 32]>,
    relay_observed: bool,
    last_outbound_ok: Option<bool>,
    over_cap_since: Option<Instant>,

    pending_dials: HashMap<ConnectionId, oneshot::Sender<Result<(), P2pError>>>,
    pending_rpc: HashMap<OutboundRequestId, oneshot::Sender<Result<RpcResponse, P2pError>>>,
    pending_compute: HashMap<OutboundRequestId, ComputePending>,
    initiator_hs: HashMap<OutboundRequestId, InitiatorState>,
    responder_hs: HashMap<PeerId, Handshake>,
    /// One handshake per peer at a time; later callers queue here.
    session_waiters: HashMap<PeerId, Vec<oneshot::Sender<Result<[u8; 32], P2pError>>>>,
}

impl NetworkService {
    pub fn new(
        identity: identity::Keypair,
        config: P2pConfig,
        ctx: NetworkContext,
    ) -> Result<(Self, NetworkHandle), P2pError> {
        if config.discovery_label.len() > 63 {
            return Err(P2pError::Protocol("discovery label exceeds 63 octets".into()));
        }

        let wide_area = !config.local_mode;
        let mut swarm = SwarmBuilder::with_existing_identity(identity)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| P2pError::Listen(e.to_string()))?
            .with_quic()
            .with_dns()
            .map_err(|e| P2pError::Listen(e.to_string()))?
            .with_relay_client(noise::Config::new, yamux::Config::default)
            .map_err(|e| P2pError::Listen(e.to_string()))?
            .with_behaviour(|key, relay| {
                WeftBehaviour::new(key, relay, wide_area)
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            })
            .map_err(|e| P2pError::Listen(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let (tcp_addr, quic_addr) = if config.local_mode {
            (
                "/ip4/127.0.0.1/tcp/0".parse().expect("static multiaddr"),
                "/ip4/127.0.0.1/udp/0/quic-v1".parse().expect("static multiaddr"),
            )
        } else {
            (
                format!("/ip4/0.0.0.0/tcp/{}", config.port)
                    .parse()
                    .expect("static multiaddr"),
                format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.port)
                    .parse()
                    .expect("static multiaddr"),
            )
        };
        swarm
            .listen_on(tcp_addr)
            .map_err(|e| P2pError::Listen(e.to_string()))?;
        swarm
            .listen_on(quic_addr)
            .map_err(|e| P2pError::Listen(e.to_string()))?;

        if wide_area {
            if let Some(kad) = swarm.behaviour_mut().kad.as_mut() {
                for addr in &config.bootstrap {
                    if let Some(peer) = peer_id_from_addr(addr) {
                        kad.add_address(&peer, addr.clone());
                    }
                }
                if !config.bootstrap.is_empty() {
                    if let Err(err) = kad.bootstrap() {
                        warn!(%err, "dht bootstrap deferred");
                    }
                }
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (internal_tx, internal_rx) = mpsc::channel(64);
        let handle = NetworkHandle {
            tx: cmd_tx.clone(),
            local_peer_id: *swarm.local_peer_id(),
            config: Arc::new(config.clone()),
        };

        Ok((
            NetworkService {
                swarm,
                config,
                ctx,
                cmd_rx,
                cmd_tx,
                internal_rx,
                internal_tx,
                listen_addrs: Vec::new(),
                connected: HashMap::new(),
                sessions: HashMap::new(),
                relay_observed: false,
                last_outbound_ok: None,
                over_cap_since: None,
                pending_dials: HashMap::new(),
                pending_rpc: HashMap::new(),
                pending_compute: HashMap::new(),
                initiator_hs: HashMap::new(),
                responder_hs: HashMap::new(),
                session_waiters: HashMap::new(),
            },
            handle,
        ))
    }

    /// True when the Kademlia behaviour is active (wide-area mode).
    pub fn dht_enabled(&self) -> bool {
        self.swarm.behaviour().kad.is_enabled()
    }

    /// Addresses safe to advertise: loopback is filtered out unless the node
    /// runs in local-only mode.
    pub fn advertised_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs
            .iter()
            .filter(|addr| self.config.local_mode || !nat::is_loopback(addr))
            .cloned()
            .collect()
    }

    /// Drives the swarm until shutdown.
    pub async fn run(mut self) {
        let mut dht_sweep = tokio::time::interval(self.config.dht_sweep_interval);
        dht_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut housekeeping = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.on_swarm_event(event);
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    if self.on_command(cmd) {
                        info!("network service shutting down");
                        return;
                    }
                }
                Some(internal) = self.internal_rx.recv() => {
                    self.on_internal(internal);
                }
                _ = dht_sweep.tick() => {
                    self.sweep_providers();
                }
                _ = housekeeping.tick() => {
                    self.enforce_connection_cap();
                }
            }
        }
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<WeftBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "listening");
                self.listen_addrs.push(address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                let outbound = endpoint.is_dialer();
                self.connected.entry(peer_id).or_insert_with(Instant::now);
                P2P_METRICS.connected_peers.set(self.connected.len() as i64);

                let short = self.ctx.registry.intern(&peer_id.to_string());
                self.ctx.node_store.create(peer_id.to_string(), short);

                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(()));
                }
                if outbound {
                    self.last_outbound_ok = Some(true);
                    // Every connection gets a session; fire-and-forget when
                    // nobody is waiting on the secret.
                    if !self.sessions.contains_key(&peer_id) {
                        let _ = self.cmd_tx.try_send(Command::OpenSession { peer: peer_id, reply: None });
                    }
                }
                debug!(peer = %short_peer(&peer_id), outbound, "connection established");
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    self.connected.remove(&peer_id);
                    self.sessions.remove(&peer_id);
                    self.responder_hs.remove(&peer_id);
                    self.fail_session(peer_id, "disconnected".into());
                    P2P_METRICS.connected_peers.set(self.connected.len() as i64);
                    debug!(peer = %short_peer(&peer_id), "disconnected");
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                self.last_outbound_ok = Some(false);
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(P2pError::DialFailed(error.to_string())));
                }
                debug!(?peer_id, %error, "outgoing connection failed");
            }
            SwarmEvent::Behaviour(event) => self.on_behaviour_event(event),
            _ => {}
        }
    }

    fn on_behaviour_event(&mut self, event: WeftBehaviourEvent) {
        match event {
            WeftBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                for (peer, addr) in peers {
                    if !self.connected.contains_key(&peer) {
                        debug!(peer = %short_peer(&peer), %addr, "mdns discovery, auto-dialing");
                        if let Err(err) = self.swarm.dial(addr) {
                            debug!(%err, "mdns auto-dial failed");
                        }
                    }
                }
            }
            WeftBehaviourEvent::Mdns(mdns::Event::Expired(_)) => {}
            WeftBehaviourEvent::Ping(ping::Event { peer, result, .. }) => {
                if let Ok(rtt) = result {
                    P2P_METRICS.ping_rtt_seconds.observe(rtt.as_secs_f64());
                    self.ctx.rtt.update(&peer.to_string(), rtt);
                    if let Some(short) = self.ctx.registry.lookup_peer(&peer.to_string()) {
                        self.ctx
                            .node_store
                            .update_latency(short, rtt.as_secs_f64() * 1000.0);
                    }
                }
            }
            WeftBehaviourEvent::Identify(identify::Event::Received { peer_id, info }) => {
                if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                    for addr in info.listen_addrs {
                        kad.add_address(&peer_id, addr);
                    }
                }
            }
            WeftBehaviourEvent::Identify(_) => {}
            WeftBehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
                result: kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders { providers, .. })),
                ..
            }) => {
                let mut dialed = 0;
                for provider in providers {
                    if provider == *self.swarm.local_peer_id()
                        || self.connected.contains_key(&provider)
                    {
                        continue;
                    }
                    if dialed >= self.config.dht_dial_cap {
                        break;
                    }
                    if self.swarm.dial(DialOpts::peer_id(provider).build()).is_ok() {
                        dialed += 1;
                    }
                }
                if dialed > 0 {
                    debug!(dialed, "provider sweep dialed new peers");
                }
            }
            WeftBehaviourEvent::Kad(_) => {}
            WeftBehaviourEvent::Autonat(_) => {}
            WeftBehaviourEvent::Dcutr(_) => {}
            WeftBehaviourEvent::Relay(relay::client::Event::ReservationReqAccepted { .. }) => {
                self.relay_observed = true;
            }
            WeftBehaviourEvent::Relay(_) => {}
            WeftBehaviourEvent::Rpc(event) => self.on_rpc_event(event),
            WeftBehaviourEvent::Compute(event) => self.on_compute_event(event),
            WeftBehaviourEvent::Handshake(event) => self.on_handshake_event(event),
        }
    }

    fn on_rpc_event(&mut self, event: request_response::Event<RpcRequest, RpcResponse>) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request { request, channel, .. } => {
                    self.serve_rpc(peer, request, channel);
                }
                request_response::Message::Response { request_id, response } => {
                    if let Some(reply) = self.pending_rpc.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure { request_id, error, .. } => {
                if let Some(reply) = self.pending_rpc.remove(&request_id) {
                    let _ = reply.send(Err(map_outbound_failure(error)));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(peer = %short_peer(&peer), %error, "inbound rpc failure");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    /// Guard-checks the request and serves it from the blob store. A guard
    /// refusal drops the channel, closing the stream.
    fn serve_rpc(&mut self, peer: PeerId, request: RpcRequest, channel: ResponseChannel<RpcResponse>) {
        let peer_str = peer.to_string();
        let secret = self.sessions.get(&peer);
        if let Err(err) =
            self.ctx
                .guard
                .authenticate_stream(&peer_str, None, secret.map(|s| s.as_slice()))
        {
            P2P_METRICS.rpc_refused.inc();
            debug!(peer = %short_peer(&peer), %err, "rpc refused");
            if let Some(short) = self.ctx.registry.lookup_peer(&peer_str) {
                if let Some(record) = self.ctx.node_store.get(short) {
                    self.ctx
                        .node_store
                        .update_threat_score(short, (record.threat_score + 0.1).min(1.0));
                }
            }
            drop(channel);
            return;
        }

        let response = match request {
            RpcRequest::GetShard { file_hash, shard_index } => self
                .ctx
                .blobs
                .get_shard(&file_hash, shard_index)
                .map(RpcResponse)
                .unwrap_or_else(RpcResponse::empty),
            RpcRequest::GetShare { file_id } => self
                .ctx
                .blobs
                .get_share(&file_id)
                .map(RpcResponse)
                .unwrap_or_else(RpcResponse::empty),
            RpcRequest::StoreShard {
                file_hash,
                shard_index,
                shard,
            } => match self.ctx.blobs.put_shard(&file_hash, shard_index, shard) {
                Ok(()) => RpcResponse::ok(),
                Err(_) => RpcResponse::empty(),
            },
            RpcRequest::StoreShare {
                file_id,
                from_peer,
                share,
            } => match self.ctx.blobs.put_share(&file_id, from_peer, share) {
                Ok(()) => RpcResponse::ok(),
                Err(_) => RpcResponse::empty(),
            },
        };

        P2P_METRICS.rpc_served.inc();
        if self
            .swarm
            .behaviour_mut()
            .rpc
            .send_response(channel, response)
            .is_err()
        {
            debug!(peer = %short_peer(&peer), "rpc response channel gone");
        }
    }

    fn on_compute_event(&mut self, event: request_response::Event<ComputeRequest, ComputeResponse>) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request { request, channel, .. } => {
                    let peer_str = peer.to_string();
                    let secret = self.sessions.get(&peer);
                    if let Err(err) = self.ctx.guard.authenticate_stream(
                        &peer_str,
                        None,
                        secret.map(|s| s.as_slice()),
                    ) {
                        debug!(peer = %short_peer(&peer), %err, "compute request refused");
                        drop(channel);
                        return;
                    }
                    match request {
                        ComputeRequest::Capacity => {
                            let capacity = self.ctx.compute.capacity();
                            let _ = self
                                .swarm
                                .behaviour_mut()
                                .compute
                                .send_response(channel, ComputeResponse::Capacity(capacity));
                        }
                        ComputeRequest::Task(task) => {
                            let handler = Arc::clone(&self.ctx.compute);
                            let internal = self.internal_tx.clone();
                            tokio::spawn(async move {
                                let result = handler.execute(task).await;
                                let _ = internal.send(Internal::ComputeDone { channel, result }).await;
                            });
                        }
                    }
                }
                request_response::Message::Response { request_id, response } => {
                    match (self.pending_compute.remove(&request_id), response) {
                        (Some(ComputePending::Task(reply)), ComputeResponse::Task(result)) => {
                            let _ = reply.send(Ok(result));
                        }
                        (Some(ComputePending::Capacity(reply)), ComputeResponse::Capacity(cap)) => {
                            let _ = reply.send(Ok(cap));
                        }
                        (Some(ComputePending::Task(reply)), other) => {
                            let _ = reply.send(Err(P2pError::Protocol(format!(
                                "mismatched compute response: {other:?}"
                            ))));
                        }
                        (Some(ComputePending::Capacity(reply)), other) => {
                            let _ = reply.send(Err(P2pError::Protocol(format!(
                                "mismatched compute response: {other:?}"
                            ))));
                        }
                        (None, _) => {}
                    }
                }
            },
            request_response::Event::OutboundFailure { request_id, error, .. } => {
                match self.pending_compute.remove(&request_id) {
                    Some(ComputePending::Task(reply)) => {
                        let _ = reply.send(Err(map_outbound_failure(error)));
                    }
                    Some(ComputePending::Capacity(reply)) => {
                        let _ = reply.send(Err(map_outbound_failure(error)));
                    }
                    None => {}
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(peer = %short_peer(&peer), %error, "inbound compute failure");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn on_handshake_event(&mut self, event: request_response::Event<Vec<u8>, Vec<u8>>) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request { request, channel, .. } => {
                    self.serve_handshake(peer, request, channel);
                }
                request_response::Message::Response { request_id, response } => {
                    self.advance_initiator(request_id, response);
                }
            },
            request_response::Event::OutboundFailure { request_id, error, .. } => {
                if let Some(state) = self.initiator_hs.remove(&request_id) {
                    let peer = match state {
                        InitiatorState::AwaitMsg2 { peer, .. } => peer,
                        InitiatorState::AwaitAck { peer, .. } => peer,
                    };
                    self.fail_session(peer, map_outbound_failure(error).to_string());
                }
            }
            request_response::Event::InboundFailure { peer, .. } => {
                self.responder_hs.remove(&peer);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    /// Wakes everyone waiting on a session with `peer` with an error.
    fn fail_session(&mut self, peer: PeerId, reason: String) {
        if let Some(waiters) = self.session_waiters.remove(&peer) {
            for waiter in waiters {
                let _ = waiter.send(Err(P2pError::Handshake(reason.clone())));
            }
        }
    }

    /// Responder side: message one opens a fresh handshake, message three
    /// completes it.
    fn serve_handshake(&mut self, peer: PeerId, request: Vec<u8>, channel: ResponseChannel<Vec<u8>>) {
        // A message-one-sized frame always starts over, even with a
        // handshake pending: the initiator may have restarted.
        if let Some(mut hs) = self
            .responder_hs
            .remove(&peer)
            .filter(|_| request.len() != crate::handshake::MSG1_LEN)
        {
            match hs.read_message_three(&request) {
                Ok((payload, session)) => {
                    self.complete_session(peer, ShortId::from_be_bytes(payload), session.secret);
                    let _ = self
                        .swarm
                        .behaviour_mut()
                        .handshake
                        .send_response(channel, b"OK".to_vec());
                }
                Err(err) => {
                    debug!(peer = %short_peer(&peer), %err, "handshake message three rejected");
                    self.ctx.guard.note_protocol_violation(&peer.to_string());
                    drop(channel);
                }
            }
            return;
        }

        let mut hs = Handshake::responder(
            self.ctx.noise_static.clone(),
            self.ctx.self_short_id.to_be_bytes(),
        );
        let msg2 = hs
            .read_message_one(&request)
            .and_then(|()| hs.write_message_two());
        match msg2 {
            Ok(msg2) => {
                self.responder_hs.insert(peer, hs);
                let _ = self
                    .swarm
                    .behaviour_mut()
                    .handshake
                    .send_response(channel, msg2);
            }
            Err(err) => {
                debug!(peer = %short_peer(&peer), %err, "handshake message one rejected");
                self.ctx.guard.note_protocol_violation(&peer.to_string());
                drop(channel);
            }
        }
    }

    /// Initiator side: drives the state machine across the two
    /// request/response rounds.
    fn advance_initiator(&mut self, request_id: OutboundRequestId, response: Vec<u8>) {
        match self.initiator_hs.remove(&request_id) {
            Some(InitiatorState::AwaitMsg2 { mut hs, peer }) => {
                let step = hs
                    .read_message_two(&response)
                    .and_then(|payload| hs.write_message_three().map(|out| (payload, out)));
                match step {
                    Ok((their_short, (msg3, session))) => {
                        self.ctx
                            .registry
                            .insert(&peer.to_string(), ShortId::from_be_bytes(their_short));
                        let next_id = self.swarm.behaviour_mut().handshake.send_request(&peer, msg3);
                        self.initiator_hs.insert(
                            next_id,
                            InitiatorState::AwaitAck {
                                secret: session.secret,
                                peer,
                            },
                        );
                    }
                    Err(err) => self.fail_session(peer, err.to_string()),
                }
            }
            Some(InitiatorState::AwaitAck { secret, peer }) => {
                if response == b"OK" {
                    let short = self
                        .ctx
                        .registry
                        .lookup_peer(&peer.to_string())
                        .unwrap_or_else(|| self.ctx.registry.intern(&peer.to_string()));
                    self.complete_session(peer, short, secret);
                } else {
                    self.fail_session(peer, "missing ack".into());
                }
            }
            None => {}
        }
    }

    fn complete_session(&mut self, peer: PeerId, announced: ShortId, secret: [u8; 32]) {
        let peer_str = peer.to_string();
        let short = self.ctx.registry.insert(&peer_str, announced);
        self.ctx.node_store.create(peer_str.clone(), short);
        self.ctx.guard.set_shared_secret(&peer_str, secret);
        self.sessions.insert(peer, secret);
        if let Some(waiters) = self.session_waiters.remove(&peer) {
            for waiter in waiters {
                let _ = waiter.send(Ok(secret));
            }
        }
        P2P_METRICS.handshakes_completed.inc();
        debug!(peer = %short_peer(&peer), short = %short, "session established");
    }

    /// Returns true on shutdown.
    fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Dial { addr, reply } => {
                let opts = DialOpts::from(addr);
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        self.pending_dials.insert(connection_id, reply);
                    }
                    Err(err) => {
                        let _ = reply.send(Err(P2pError::DialFailed(err.to_string())));
                    }
                }
            }
            Command::SendRpc { peer, request, reply } => {
                if !self.connected.contains_key(&peer) {
                    let _ = reply.send(Err(P2pError::NotConnected));
                } else {
                    let id = self.swarm.behaviour_mut().rpc.send_request(&peer, request);
                    self.pending_rpc.insert(id, reply);
                }
            }
            Command::Delegate { peer, task, reply } => {
                if !self.connected.contains_key(&peer) {
                    let _ = reply.send(Err(P2pError::NotConnected));
                } else {
                    let id = self
                        .swarm
                        .behaviour_mut()
                        .compute
                        .send_request(&peer, ComputeRequest::Task(task));
                    self.pending_compute.insert(id, ComputePending::Task(reply));
                }
            }
            Command::QueryCapacity { peer, reply } => {
                if !self.connected.contains_key(&peer) {
                    let _ = reply.send(Err(P2pError::NotConnected));
                } else {
                    let id = self
                        .swarm
                        .behaviour_mut()
                        .compute
                        .send_request(&peer, ComputeRequest::Capacity);
                    self.pending_compute.insert(id, ComputePending::Capacity(reply));
                }
            }
            Command::OpenSession { peer, reply } => {
                if !self.connected.contains_key(&peer) {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(P2pError::NotConnected));
                    }
                } else if let Some(secret) = self.sessions.get(&peer) {
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(*secret));
                    }
                } else if let Some(waiters) = self.session_waiters.get_mut(&peer) {
                    // A handshake with this peer is already in flight.
                    if let Some(reply) = reply {
                        waiters.push(reply);
                    }
                } else {
                    let mut hs = Handshake::initiator(
                        self.ctx.noise_static.clone(),
                        self.ctx.self_short_id.to_be_bytes(),
                    );
                    match hs.write_message_one() {
                        Ok(msg1) => {
                            let id = self.swarm.behaviour_mut().handshake.send_request(&peer, msg1);
                            self.initiator_hs
                                .insert(id, InitiatorState::AwaitMsg2 { hs: Box::new(hs), peer });
                            let waiters = self.session_waiters.entry(peer).or_default();
                            if let Some(reply) = reply {
                                waiters.push(reply);
                            }
                        }
                        Err(err) => {
                            if let Some(reply) = reply {
                                let _ = reply.send(Err(P2pError::Handshake(err.to_string())));
                            }
                        }
                    }
                }
            }
            Command::ListenAddrs { reply } => {
                let _ = reply.send(self.advertised_addrs());
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.connected.keys().copied().collect());
            }
            Command::Posture { reply } => {
                let _ = reply.send(nat::classify(
                    &self.listen_addrs,
                    self.relay_observed,
                    self.last_outbound_ok,
                ));
            }
            Command::Shutdown => return true,
        }
        false
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ComputeDone { channel, result } => {
                let _ = self
                    .swarm
                    .behaviour_mut()
                    .compute
                    .send_response(channel, ComputeResponse::Task(result));
            }
        }
    }

    /// Wide-area: re-announce under the rendezvous key and look for other
    /// providers, dialing a capped number per sweep.
    fn sweep_providers(&mut self) {
        let key = RecordKey::new(&self.config.discovery_label);
        if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
            if let Err(err) = kad.start_providing(key.clone()) {
                debug!(%err, "provider announcement failed");
            }
            kad.get_providers(key);
        }

        // Best-effort bandwidth estimate, scaled by connectivity.
        let estimate = (self.connected.len() as i64) * 10;
        P2P_METRICS.bandwidth_mbps_estimate.set(estimate.min(1_000));
    }

    /// 400-connection cap with a 2 s grace period, pruning oldest-first down
    /// to the target.
    fn enforce_connection_cap(&mut self) {
        if self.connected.len() <= self.config.max_connections {
            self.over_cap_since = None;
            return;
        }
        let since = *self.over_cap_since.get_or_insert_with(Instant::now);
        if since.elapsed() < self.config.prune_grace {
            return;
        }

        let mut by_age: Vec<(PeerId, Instant)> =
            self.connected.iter().map(|(p, t)| (*p, *t)).collect();
        by_age.sort_by_key(|(_, connected_at)| *connected_at);
        let excess = self.connected.len().saturating_sub(self.config.prune_target);
        for (peer, _) in by_age.into_iter().take(excess) {
            let _ = self.swarm.disconnect_peer_id(peer);
        }
        info!(pruned = excess, "connection cap enforced");
        self.over_cap_since = None;
    }
}

fn map_outbound_failure(error: request_response::OutboundFailure) -> P2pError {
    use request_response::OutboundFailure;
    match error {
        OutboundFailure::Timeout => P2pError::Timeout,
        OutboundFailure::DialFailure => P2pError::DialFailed("request dial failure".into()),
        OutboundFailure::ConnectionClosed => P2pError::NotConnected,
        other => P2pError::Protocol(other.to_string()),
    }
}

fn peer_id_from_addr(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|proto| match proto {
        libp2p::multiaddr::Protocol::P2p(peer) => Some(peer),
        _ => None,
    })
}

fn short_peer(peer: &PeerId) -> String {
    let s = peer.to_string();
    s[s.len().saturating_sub(8)..].to_string()
}
