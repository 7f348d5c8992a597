//! Nodes backed by storage: persistence across restarts and correction of
//! lost writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use covalent::{LoadOutcome, LocalNode, ParentLink};
use covalent_core::{CoValueId, KnownState, NewContentMessage};
use covalent_store::{MemoryStorage, SqliteStorage, Storage};
use covalent_testkit::{agent, eventually, test_config, test_node_with_storage};

const WAIT: Duration = Duration::from_secs(5);

/// Storage that acknowledges one store without keeping it when armed.
struct LossyStorage {
    inner: MemoryStorage,
    drop_next: AtomicBool,
}

impl LossyStorage {
    fn new() -> Self {
        Self {
            inner: MemoryStorage::new(),
            drop_next: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Storage for LossyStorage {
    async fn known_state(&self, id: &CoValueId) -> covalent_store::Result<Arc<KnownState>> {
        self.inner.known_state(id).await
    }

    async fn load(
        &self,
        id: &CoValueId,
        on_content: &mut (dyn FnMut(NewContentMessage) + Send),
        on_done: &mut (dyn FnMut(bool) + Send),
    ) -> covalent_store::Result<()> {
        self.inner.load(id, on_content, on_done).await
    }

    async fn store(
        &self,
        msg: NewContentMessage,
        on_correction: &mut (dyn for<'k> FnMut(&'k KnownState) -> Option<Vec<NewContentMessage>> + Send),
    ) -> covalent_store::Result<bool> {
        if self.drop_next.swap(false, Ordering::AcqRel) {
            return Ok(true);
        }
        self.inner.store(msg, on_correction).await
    }

    async fn wait_for_sync(&self, target: &KnownState, timeout: Duration) -> covalent_store::Result<()> {
        self.inner.wait_for_sync(target, timeout).await
    }

    async fn close(&self) -> covalent_store::Result<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_sqlite_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("covalent.db");

    let (group, map, list) = {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&path)?);
        let node = LocalNode::new(agent(7), test_config(), Some(storage));
        let group = node.create_group()?;
        let map = node.create_map(&group)?;
        node.map_set(&map, "title", json!("persisted"))?;
        let list = node.create_list(&group)?;
        node.list_append(&list, json!(1))?;
        node.list_append(&list, json!(2))?;
        node.map_set(&map, "items", json!(list.to_string()))?;
        node.wait_for_all_to_sync().await?;
        node.shutdown().await?;
        (group, map, list)
    };

    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&path)?);
    let node = LocalNode::new(agent(7), test_config(), Some(storage));
    assert_eq!(node.load(&map).await?, LoadOutcome::Available);
    assert!(node.is_available(&group));
    assert_eq!(node.map(&map)?.value("title"), Some(json!("persisted")));

    assert_eq!(node.load(&list).await?, LoadOutcome::Available);
    assert_eq!(node.list(&list)?.values(), vec![json!(1), json!(2)]);

    // The restarted node keeps writing in a new session.
    node.map_set(&map, "title", json!("edited"))?;
    node.wait_for_sync(&map).await?;
    assert_eq!(node.known_state(&map).map(|known| known.sessions.len()), Some(2));
    node.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_storage_loads_parent_group_first() -> Result<()> {
    let storage = Arc::new(MemoryStorage::new());
    let writer = LocalNode::new(agent(9), test_config(), Some(storage.clone()));
    let parent = writer.create_group()?;
    let child = writer.create_group()?;
    writer.extend(&child, &parent, ParentLink::Extend)?;
    let map = writer.create_map(&child)?;
    writer.map_set(&map, "title", json!("nested"))?;
    writer.wait_for_all_to_sync().await?;

    let ids: Vec<CoValueId> = storage
        .load_all(&map)
        .await?
        .unwrap_or_default()
        .iter()
        .map(|piece| piece.id)
        .collect();
    let first = |id: &CoValueId| ids.iter().position(|sent| sent == id);
    assert!(first(&parent).is_some());
    assert!(first(&parent) < first(&child));
    assert!(first(&child) < first(&map));

    // A second node on the same storage rebuilds the chain in order.
    let reader = LocalNode::new(agent(9), test_config(), Some(storage));
    assert_eq!(reader.load(&map).await?, LoadOutcome::Available);
    assert!(reader.is_available(&parent));
    assert!(reader.is_available(&child));
    assert_eq!(reader.map(&map)?.value("title"), Some(json!("nested")));
    Ok(())
}

#[tokio::test]
async fn test_lost_write_is_corrected() -> Result<()> {
    let storage = Arc::new(LossyStorage::new());
    let node = test_node_with_storage(storage.clone());

    let group = node.create_group()?;
    let map = node.create_map(&group)?;
    node.wait_for_sync(&map).await?;

    storage.drop_next.store(true, Ordering::Release);
    node.map_set(&map, "lost", json!(1))?;
    assert!(eventually(WAIT, || !storage.drop_next.load(Ordering::Acquire)).await);
    assert_eq!(storage.known_state(&map).await?.total(), 0);

    node.map_set(&map, "kept", json!(2))?;
    node.wait_for_sync(&map).await?;

    let stored = storage.known_state(&map).await?;
    assert_eq!(stored.total(), 2);
    assert_eq!(Some((*stored).clone()), node.known_state(&map));
    Ok(())
}

#[tokio::test]
async fn test_missing_value_is_unavailable_without_peers() -> Result<()> {
    let node = test_node_with_storage(Arc::new(MemoryStorage::new()));
    let missing = CoValueId([4; 20]);
    assert_eq!(node.load(&missing).await?, LoadOutcome::Unavailable);
    Ok(())
}
