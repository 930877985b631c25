//! Upload/download flows across two loopback nodes and against the local
//! fallback path.

use std::time::Duration;

use weft_ces::{Pipeline, PipelineConfig};
use weft_node::{Node, NodeConfig};

fn local_config(node_id: &str) -> NodeConfig {
    let mut config = NodeConfig::new(node_id);
    config.local_mode = true;
    config
}

async fn start_node(node_id: &str) -> (Node, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let node = Node::start(local_config(node_id), dir.path().to_path_buf())
        .await
        .expect("node starts");
    (node, dir)
}

async fn wait_tcp_addr(node: &Node) -> libp2p::Multiaddr {
    for _ in 0..50 {
        let addrs = node.network().listen_addrs().await.expect("service alive");
        if let Some(addr) = addrs
            .iter()
            .find(|a| a.to_string().contains("/tcp/"))
            .cloned()
        {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("node never listened");
}

#[tokio::test]
async fn upload_then_download_across_two_nodes() {
    let (a, _dir_a) = start_node("alpha").await;
    let (b, _dir_b) = start_node("beta").await;

    let addr = wait_tcp_addr(&b).await;
    a.network().dial(addr).await.expect("dial succeeds");

    let key = [0x42u8; 32];
    let pipeline = Pipeline::with_key(key, PipelineConfig::default()).expect("pipeline");
    let data: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();

    let report = a.upload(&pipeline, &data).await.expect("upload succeeds");
    assert!(report.success, "errors: {:?}", report.errors);
    assert_eq!(report.manifest.total_shards(), 12);
    assert_eq!(report.manifest.file_size, data.len() as u64);

    // A fresh pipeline with the same key reconstructs: the key travels with
    // the manifest holder, not the pipeline instance.
    let download_pipeline = Pipeline::with_key(key, PipelineConfig::default()).expect("pipeline");
    let recovered = a
        .download(&download_pipeline, &report.manifest)
        .await
        .expect("download succeeds");
    assert_eq!(recovered, data);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn upload_with_no_peers_falls_back_to_local_shards() {
    let (node, _dir) = start_node("loner").await;

    let pipeline = Pipeline::with_key([7u8; 32], PipelineConfig::default()).expect("pipeline");
    let data = b"nobody else is online".to_vec();

    let report = node.upload(&pipeline, &data).await.expect("upload succeeds");
    assert!(report.success);
    assert_eq!(report.shards_placed, 0, "nothing placed remotely");
    assert_eq!(report.manifest.shard_locations.len(), 12);

    let recovered = node
        .download(&pipeline, &report.manifest)
        .await
        .expect("local download succeeds");
    assert_eq!(recovered, data);

    node.shutdown().await;
}

#[tokio::test]
async fn manifest_round_trips_through_disk() {
    let (node, _dir) = start_node("scribe").await;

    let pipeline = Pipeline::with_key([9u8; 32], PipelineConfig::default()).expect("pipeline");
    let report = node
        .upload(&pipeline, b"manifest persistence")
        .await
        .expect("upload succeeds");

    let path = node.save_manifest(&report.manifest).expect("save");
    let loaded = node.load_manifest(&path).expect("load");
    assert_eq!(loaded, report.manifest);

    node.shutdown().await;
}
