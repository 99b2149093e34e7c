//! Listener dispatch.
//!
//! One capability interface regardless of how the observer is bound (by
//! class, expression, or script in the source format): `invoke` with the
//! node and transition name. Listeners run in registration order and may
//! read/write variables on the node's scope.

use crate::types::{CaseExecutionState, CaseInstance, Transition, VariableValue};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// How a listener failed.
///
/// A `Fault` is a business-level signal: it propagates to the caller but the
/// state change already applied stays committed. Anything else is `Fatal`
/// and aborts the transition, leaving state unchanged.
#[derive(Debug)]
pub enum ListenerFailure {
    Fault { code: String, message: String },
    Fatal(anyhow::Error),
}

/// View handed to a listener for the duration of one transition. Variable
/// access delegates upward through ancestor scopes.
pub struct ListenerContext<'a> {
    instance: &'a mut CaseInstance,
    execution_id: Uuid,
    transition: Transition,
}

impl<'a> ListenerContext<'a> {
    pub(crate) fn new(
        instance: &'a mut CaseInstance,
        execution_id: Uuid,
        transition: Transition,
    ) -> Self {
        Self { instance, execution_id, transition }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn transition(&self) -> Transition {
        self.transition
    }

    pub fn state(&self) -> Option<CaseExecutionState> {
        self.instance.node(self.execution_id).map(|n| n.state)
    }

    pub fn get_variable(&self, name: &str) -> Option<&VariableValue> {
        crate::variables::get(self.instance, self.execution_id, name)
    }

    pub fn get_variable_local(&self, name: &str) -> Option<&VariableValue> {
        crate::variables::get_local(self.instance, self.execution_id, name)
    }

    pub fn set_variable(&mut self, name: &str, value: VariableValue) {
        crate::variables::set(self.instance, self.execution_id, name, value);
    }

    pub fn set_variable_local(&mut self, name: &str, value: VariableValue) {
        crate::variables::set_local(self.instance, self.execution_id, name, value);
    }

    pub fn remove_variable(&mut self, name: &str) {
        crate::variables::remove(self.instance, self.execution_id, name);
    }

    pub fn remove_variable_local(&mut self, name: &str) {
        crate::variables::remove_local(self.instance, self.execution_id, name);
    }
}

#[async_trait]
pub trait CaseListener: Send + Sync {
    async fn invoke(&self, ctx: &mut ListenerContext<'_>) -> Result<(), ListenerFailure>;
}

/// Yields the ordered observers for a node and transition name. Resolution
/// strategy (by name, expression, script) lives behind the implementation.
pub trait ListenerRegistry: Send + Sync {
    fn listeners_for(&self, activity_id: &str, transition: Transition) -> Vec<Arc<dyn CaseListener>>;
}

/// Registry with no listeners at all.
pub struct NoListeners;

impl ListenerRegistry for NoListeners {
    fn listeners_for(&self, _activity_id: &str, _transition: Transition) -> Vec<Arc<dyn CaseListener>> {
        Vec::new()
    }
}

/// Simple in-memory registry keyed by (activity id, transition).
#[derive(Default)]
pub struct MapListenerRegistry {
    entries: HashMap<(String, Transition), Vec<Arc<dyn CaseListener>>>,
}

impl MapListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        activity_id: impl Into<String>,
        transition: Transition,
        listener: Arc<dyn CaseListener>,
    ) {
        self.entries
            .entry((activity_id.into(), transition))
            .or_default()
            .push(listener);
    }
}

impl ListenerRegistry for MapListenerRegistry {
    fn listeners_for(&self, activity_id: &str, transition: Transition) -> Vec<Arc<dyn CaseListener>> {
        self.entries
            .get(&(activity_id.to_string(), transition))
            .cloned()
            .unwrap_or_default()
    }
}
