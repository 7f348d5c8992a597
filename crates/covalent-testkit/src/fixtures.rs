//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;
use std::time::Duration;

use covalent::{LocalNode, NodeConfig, RetryPolicy, SyncConfig};
use covalent_core::{AgentSecret, PeerId};
use covalent_store::Storage;
use covalent_sync::{connected_pair, PeerRole};

/// Route `tracing` output through the test harness. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A deterministic agent. Distinct seeds give distinct agents.
pub fn agent(seed: u8) -> AgentSecret {
    let mut signer = [0u8; 32];
    let mut sealer = [0u8; 32];
    signer[0] = seed;
    sealer[0] = seed;
    sealer[31] = 1;
    AgentSecret::from_seeds(signer, sealer)
}

/// Timeouts short enough that a missing value fails a test quickly.
pub fn test_config() -> NodeConfig {
    NodeConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            retry_delay: Duration::from_millis(50),
        },
        load_timeout: Duration::from_secs(2),
        sync: SyncConfig {
            send_timeout: Duration::from_secs(2),
            flush_timeout: Duration::from_secs(1),
        },
        wait_for_sync_timeout: Duration::from_secs(5),
    }
}

/// A node with a fresh agent and no storage. Needs a Tokio runtime.
pub fn test_node() -> LocalNode {
    init_tracing();
    LocalNode::new(AgentSecret::generate(), test_config(), None)
}

/// A node with a fresh agent backed by `storage`.
pub fn test_node_with_storage(storage: Arc<dyn Storage>) -> LocalNode {
    init_tracing();
    LocalNode::new(AgentSecret::generate(), test_config(), Some(storage))
}

/// `count` nodes with deterministic agents.
pub fn multi_party_nodes(count: u8) -> Vec<LocalNode> {
    init_tracing();
    (0..count)
        .map(|i| LocalNode::new(agent(i), test_config(), None))
        .collect()
}

fn peer_id(node: &LocalNode) -> PeerId {
    PeerId::new(node.agent_id().to_string())
}

/// Connect `client` to `server` over an in-memory transport. The client
/// loads from the server; the server answers.
pub fn connect(client: &LocalNode, server: &LocalNode) -> anyhow::Result<()> {
    let (to_server, to_client) = connected_pair();
    client.add_peer(peer_id(server), PeerRole::Server, to_server)?;
    server.add_peer(peer_id(client), PeerRole::Client, to_client)?;
    Ok(())
}

/// Connect two nodes as servers of each other, so each pushes everything
/// it has.
pub fn connect_peers(a: &LocalNode, b: &LocalNode) -> anyhow::Result<()> {
    let (to_b, to_a) = connected_pair();
    a.add_peer(peer_id(b), PeerRole::Server, to_b)?;
    b.add_peer(peer_id(a), PeerRole::Server, to_a)?;
    Ok(())
}

/// Poll `condition` until it holds or `within` passes. Returns whether it
/// held.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
