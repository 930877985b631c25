//! Node assembly: wires the CES pipeline, node store, guard, overlay and
//! compute orchestrator together and exposes the upload/download flows.
//!
//! The CES pipeline is deliberately a parameter of `upload` and `download`,
//! not node state: callers construct one per flow with an explicit key, and
//! two nodes sharing that key interoperate.

pub mod config;
pub mod identity;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use libp2p::{Multiaddr, PeerId};
use tracing::{debug, info, warn};
use weft_ces::Pipeline;
use weft_compute::{Orchestrator, OrchestratorConfig, P2pDelegator};
use weft_metrics::CES_METRICS;
use weft_p2p::blob::BlobStore;
use weft_p2p::network::NetworkContext;
use weft_p2p::peer_map::PeerRegistry;
use weft_p2p::proximity::RttTable;
use weft_p2p::{NetworkHandle, NetworkService, P2pConfig};
use weft_peers::{Guard, GuardConfig, NodeStore};
use weft_types::{unix_now, ContentHash, Manifest, Shard, ShortId};

pub use config::NodeConfig;

/// Default manifest freshness window.
const MANIFEST_TTL_SECS: u64 = 24 * 3600;
/// Proximity stride used to spread placements across ranked peers.
const UPLOAD_STRIDE: usize = 2;
/// RTT entries older than this are not considered for placement.
const RTT_STALENESS: Duration = Duration::from_secs(120);

/// Outcome of an upload: the manifest plus a placement summary.
#[derive(Debug)]
pub struct UploadReport {
    pub success: bool,
    pub errors: Vec<String>,
    pub shards_placed: u32,
    pub manifest: Manifest,
}

pub struct Node {
    config: NodeConfig,
    data_dir: PathBuf,
    network: NetworkHandle,
    orchestrator: Orchestrator,
    guard: Arc<Guard>,
    node_store: Arc<NodeStore>,
    registry: Arc<PeerRegistry>,
    rtt: Arc<RttTable>,
    blobs: Arc<BlobStore>,
    self_short_id: ShortId,
    scheduler: tokio::task::JoinHandle<()>,
    service: tokio::task::JoinHandle<()>,
}

impl Node {
    /// Boots the full stack. Fatal errors here (key load, bind) abort
    /// startup; the caller maps them to a non-zero exit.
    pub async fn start(config: NodeConfig, data_dir: PathBuf) -> Result<Node> {
        let host_key = identity::load_or_generate_host_key(&data_dir)?;
        let session_key = identity::load_or_generate_session_key(&data_dir)?;
        let peer_id = host_key.public().to_peer_id();
        info!(%peer_id, node = %config.node_id, local_mode = config.local_mode, "starting node");

        let node_store = Arc::new(NodeStore::new());
        let guard = Guard::new(GuardConfig::default(), Arc::clone(&node_store));
        let registry = Arc::new(PeerRegistry::new());
        let rtt = Arc::new(RttTable::new(RTT_STALENESS));
        let blobs = Arc::new(BlobStore::new());
        let self_short_id = registry.intern(&peer_id.to_string());

        let orchestrator = Orchestrator::new(OrchestratorConfig::default())?;
        let scheduler = orchestrator.start();

        let p2p_config = P2pConfig {
            local_mode: config.local_mode,
            port: config.overlay_port,
            bootstrap: parse_bootstrap(&config.bootstrap_peers),
            ..Default::default()
        };
        let ctx = NetworkContext {
            guard: Arc::clone(&guard),
            node_store: Arc::clone(&node_store),
            registry: Arc::clone(&registry),
            rtt: Arc::clone(&rtt),
            blobs: Arc::clone(&blobs),
            compute: Arc::new(orchestrator.clone()),
            self_short_id,
            noise_static: session_key,
        };
        let (service, network) = NetworkService::new(host_key, p2p_config.clone(), ctx)?;
        let service = tokio::spawn(service.run());

        orchestrator.set_delegator(Arc::new(P2pDelegator::new(
            network.clone(),
            orchestrator.workers(),
        )));

        // Bootstrap dials run in the background; startup does not block on
        // unreachable peers.
        for addr in p2p_config.bootstrap {
            let network = network.clone();
            tokio::spawn(async move {
                if let Err(err) = network.dial(addr.clone()).await {
                    warn!(%addr, %err, "bootstrap dial failed");
                }
            });
        }

        Ok(Node {
            config,
            data_dir,
            network,
            orchestrator,
            guard,
            node_store,
            registry,
            rtt,
            blobs,
            self_short_id,
            scheduler,
            service,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn network(&self) -> &NetworkHandle {
        &self.network
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn guard(&self) -> &Arc<Guard> {
        &self.guard
    }

    pub fn node_store(&self) -> &Arc<NodeStore> {
        &self.node_store
    }

    /// Runs the CES pipeline over `data` and places the shards on the
    /// closest peers, spread by the diversity stride. Shards that cannot be
    /// placed remotely stay in the local blob store so the upload degrades
    /// rather than fails.
    pub async fn upload(&self, pipeline: &Pipeline, data: &[u8]) -> Result<UploadReport> {
        let started = std::time::Instant::now();
        let file_hash = ContentHash::digest(data);
        let shards = pipeline.process(data)?;
        CES_METRICS.process_calls.inc();
        CES_METRICS.bytes_processed.inc_by(data.len() as u64);
        CES_METRICS.process_seconds.observe(started.elapsed().as_secs_f64());

        let mut targets: Vec<PeerId> = self
            .rtt
            .upload_targets(shards.len(), UPLOAD_STRIDE)
            .iter()
            .filter_map(|peer| PeerId::from_str(peer).ok())
            .collect();
        if targets.is_empty() {
            targets = self.network.connected_peers().await.unwrap_or_default();
        }

        let mut errors = Vec::new();
        let mut placed = 0u32;
        let mut locations: Vec<(u32, ShortId)> = Vec::with_capacity(shards.len());

        for (i, shard) in shards.iter().enumerate() {
            let mut stored_remote = false;
            if !targets.is_empty() {
                let peer = targets[i % targets.len()];
                match self
                    .network
                    .store_shard(peer, file_hash.as_bytes().to_vec(), shard.index, shard.data.clone())
                    .await
                {
                    Ok(()) => {
                        let short = self.registry.intern(&peer.to_string());
                        locations.push((shard.index, short));
                        placed += 1;
                        stored_remote = true;
                    }
                    Err(err) => {
                        errors.push(format!("shard {}: {err}", shard.index));
                    }
                }
            }
            if !stored_remote {
                // Local fallback keeps the shard set complete.
                if self
                    .blobs
                    .put_shard(file_hash.as_bytes(), shard.index, shard.data.clone())
                    .is_ok()
                {
                    locations.push((shard.index, self.self_short_id));
                }
            }
        }

        let manifest = Manifest {
            file_hash,
            file_size: data.len() as u64,
            shard_count: pipeline.config().data_shards as u32,
            parity_count: pipeline.config().parity_shards as u32,
            shard_locations: locations,
            timestamp: unix_now(),
            ttl: MANIFEST_TTL_SECS,
        };
        let success = manifest.shard_locations.len() as u32 >= manifest.shard_count;
        info!(%file_hash, placed, errors = errors.len(), "upload finished");

        Ok(UploadReport {
            success,
            errors,
            shards_placed: placed,
            manifest,
        })
    }

    /// Fetches shards by manifest until `k` are present, then reconstructs.
    /// Fewer than `k` recoverable shards surfaces `InsufficientShards`.
    pub async fn download(&self, pipeline: &Pipeline, manifest: &Manifest) -> Result<Vec<u8>> {
        let total = manifest.total_shards() as usize;
        let needed = manifest.shard_count as usize;
        let mut shards: Vec<Shard> = (0..total).map(|i| Shard::new(i as u32, Vec::new())).collect();
        let mut present = vec![false; total];
        let mut recovered = 0usize;

        for index in 0..total as u32 {
            if recovered >= needed {
                break;
            }
            if let Some(bytes) = self.fetch_one(manifest, index).await {
                shards[index as usize] = Shard::new(index, bytes);
                present[index as usize] = true;
                recovered += 1;
            }
        }

        CES_METRICS.reconstruct_calls.inc();
        let data = pipeline.reconstruct(&shards, &present)?;
        Ok(data)
    }

    /// One shard: local store first, then every manifest holder in turn.
    /// Empty responses are non-authoritative; the next holder is tried.
    async fn fetch_one(&self, manifest: &Manifest, index: u32) -> Option<Vec<u8>> {
        if let Some(bytes) = self.blobs.get_shard(manifest.file_hash.as_bytes(), index) {
            return Some(bytes);
        }
        for holder in manifest.holders(index) {
            if holder == self.self_short_id {
                continue;
            }
            let Some(peer_str) = self.registry.lookup(holder) else {
                debug!(%holder, "manifest names an unknown short id");
                continue;
            };
            let Ok(peer) = PeerId::from_str(&peer_str) else {
                continue;
            };
            match self
                .network
                .fetch_shard(peer, manifest.file_hash.as_bytes().to_vec(), index)
                .await
            {
                Ok(Some(bytes)) => return Some(bytes),
                Ok(None) => continue,
                Err(err) if err.is_retryable() => continue,
                Err(err) => {
                    debug!(%err, index, "shard fetch failed");
                    continue;
                }
            }
        }
        None
    }

    /// Persists a manifest under the node's data directory.
    pub fn save_manifest(&self, manifest: &Manifest) -> Result<PathBuf> {
        let dir = self.data_dir.join("manifests");
        std::fs::create_dir_all(&dir).context("create manifest dir")?;
        let path = dir.join(format!("{}.manifest", manifest.file_hash.to_hex()));
        let bytes = bincode::serialize(manifest).context("encode manifest")?;
        std::fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn load_manifest(&self, path: &Path) -> Result<Manifest> {
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        bincode::deserialize(&bytes).context("decode manifest")
    }

    /// Graceful shutdown: compute first, then the overlay, then the guard's
    /// sweeper.
    pub async fn shutdown(self) {
        self.orchestrator.shutdown();
        self.network.shutdown().await;
        self.guard.close().await;
        let _ = self.scheduler.await;
        let _ = self.service.await;
        info!("node stopped");
    }
}

fn parse_bootstrap(addrs: &[String]) -> Vec<Multiaddr> {
    addrs
        .iter()
        .filter_map(|raw| match raw.parse() {
            Ok(addr) => Some(addr),
            Err(err) => {
                warn!(%raw, %err, "skipping malformed bootstrap address");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_bootstrap_addresses_are_skipped() {
        let parsed = parse_bootstrap(&[
            "/ip4/10.0.0.1/tcp/12100".to_string(),
            "definitely not a multiaddr".to_string(),
        ]);
        assert_eq!(parsed.len(), 1);
    }
}
