use crate::events::CaseRuntimeEvent;
use crate::store::CaseStore;
use crate::types::CaseExecutionNode;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    /// (case_instance_id, execution_id) → node snapshot at insert time.
    nodes: BTreeMap<(Uuid, Uuid), CaseExecutionNode>,
    events: BTreeMap<Uuid, Vec<CaseRuntimeEvent>>,
}

/// In-memory store for tests and single-process use.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execution ids currently inserted for a case, in insertion-key order.
    pub fn stored_nodes(&self, case_instance_id: Uuid) -> Vec<Uuid> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .keys()
            .filter(|(case, _)| *case == case_instance_id)
            .map(|(_, id)| *id)
            .collect()
    }
}

#[async_trait]
impl CaseStore for MemoryStore {
    async fn insert_node(&self, node: &CaseExecutionNode) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .nodes
            .insert((node.case_instance_id, node.id), node.clone());
        Ok(())
    }

    async fn delete_node(&self, case_instance_id: Uuid, execution_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.remove(&(case_instance_id, execution_id));
        Ok(())
    }

    async fn append_event(&self, case_instance_id: Uuid, event: &CaseRuntimeEvent) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let log = inner.events.entry(case_instance_id).or_default();
        log.push(event.clone());
        Ok(log.len() as u64)
    }

    async fn read_events(
        &self,
        case_instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, CaseRuntimeEvent)>> {
        let inner = self.inner.lock().unwrap();
        let log = inner.events.get(&case_instance_id);
        Ok(log
            .map(|events| {
                events
                    .iter()
                    .enumerate()
                    .map(|(i, e)| (i as u64 + 1, e.clone()))
                    .filter(|(seq, _)| *seq >= from_seq)
                    .collect()
            })
            .unwrap_or_default())
    }
}
