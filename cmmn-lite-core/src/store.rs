use crate::events::CaseRuntimeEvent;
use crate::types::CaseExecutionNode;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence/eviction capability consumed by the dispatcher.
///
/// `insert_node` is invoked exactly once per creation and `delete_node`
/// exactly once per eviction (for the case root, eviction happens at
/// `close`, not at its terminal transition). The engine operates exclusively
/// through this trait, enabling pluggable backends (MemoryStore for tests,
/// durable stores elsewhere).
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn insert_node(&self, node: &CaseExecutionNode) -> Result<()>;
    async fn delete_node(&self, case_instance_id: Uuid, execution_id: Uuid) -> Result<()>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, case_instance_id: Uuid, event: &CaseRuntimeEvent) -> Result<u64>;
    async fn read_events(
        &self,
        case_instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, CaseRuntimeEvent)>>;
}
