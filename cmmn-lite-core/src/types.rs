use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Variable payload. Listeners read and write these; the state machine never does.
pub type VariableValue = serde_json::Value;

// ─── Lifecycle states ─────────────────────────────────────────

/// The closed set of states a plan-item occurrence may occupy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseExecutionState {
    /// Sentry pending — instantiated as a record, not yet an active occurrence.
    Available,
    Enabled,
    Active,
    Disabled,
    Suspended,
    Completed,
    Terminated,
    Exited,
    /// Archived case root. Only the root ever reaches this.
    Closed,
}

impl CaseExecutionState {
    /// Terminal outcomes evict the node from the tree (the root is the one
    /// exception: it stays queryable until `close`).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CaseExecutionState::Completed
                | CaseExecutionState::Terminated
                | CaseExecutionState::Exited
                | CaseExecutionState::Closed
        )
    }
}

impl fmt::Display for CaseExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaseExecutionState::Available => "available",
            CaseExecutionState::Enabled => "enabled",
            CaseExecutionState::Active => "active",
            CaseExecutionState::Disabled => "disabled",
            CaseExecutionState::Suspended => "suspended",
            CaseExecutionState::Completed => "completed",
            CaseExecutionState::Terminated => "terminated",
            CaseExecutionState::Exited => "exited",
            CaseExecutionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ─── Transitions (standard events) ────────────────────────────

/// The named transitions of the lifecycle. These double as the "standard
/// events" sentry parts and listener registrations key on, so the string
/// forms are part of the public contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Transition {
    Create,
    Enable,
    Disable,
    Reenable,
    Start,
    ManualStart,
    Complete,
    Terminate,
    Exit,
    Suspend,
    Resume,
    ParentSuspend,
    ParentResume,
    ParentTerminate,
    Occur,
    Close,
}

impl Transition {
    pub fn as_str(self) -> &'static str {
        match self {
            Transition::Create => "create",
            Transition::Enable => "enable",
            Transition::Disable => "disable",
            Transition::Reenable => "reenable",
            Transition::Start => "start",
            Transition::ManualStart => "manualStart",
            Transition::Complete => "complete",
            Transition::Terminate => "terminate",
            Transition::Exit => "exit",
            Transition::Suspend => "suspend",
            Transition::Resume => "resume",
            Transition::ParentSuspend => "parentSuspend",
            Transition::ParentResume => "parentResume",
            Transition::ParentTerminate => "parentTerminate",
            Transition::Occur => "occur",
            Transition::Close => "close",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Activation & item kinds ──────────────────────────────────

/// Whether reaching the enabled precondition requires an explicit
/// `manualStart` or transitions straight to active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationPolicy {
    Manual,
    Automatic,
}

/// Shape of a plan item. Stages own children; milestones and event
/// listeners skip the enabled/active stop-over and `occur` instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    Stage,
    Task,
    Milestone,
    EventListener,
}

/// Who caused the current suspension. `resume` only reverses a
/// self-initiated suspend; `parentResume` only a cascaded one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuspensionOrigin {
    Node,
    Parent,
}

// ─── Pure transition table ────────────────────────────────────

/// Target of a legal transition. `Prior` means "the state recorded when the
/// node was suspended" — the table cannot know it, the dispatcher does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetState {
    Fixed(CaseExecutionState),
    Prior,
}

/// The legality table of the lifecycle, independent of tree structure.
/// `None` means the combination is illegal from `from`.
///
/// `Enable` and `Start` are sub-events of the composite `create` and never
/// requested directly; `Resume`/`ParentResume` additionally require a
/// matching suspension origin, which the dispatcher checks.
pub fn legal_target(
    from: CaseExecutionState,
    transition: Transition,
    policy: ActivationPolicy,
    kind: ItemKind,
) -> Option<TargetState> {
    use CaseExecutionState as S;
    use TargetState::Fixed;

    let target = match transition {
        Transition::Create => match (from, kind) {
            (S::Available, ItemKind::Stage | ItemKind::Task) => match policy {
                ActivationPolicy::Manual => Fixed(S::Enabled),
                ActivationPolicy::Automatic => Fixed(S::Active),
            },
            _ => return None,
        },
        Transition::ManualStart => match (from, policy) {
            (S::Enabled, ActivationPolicy::Manual) => Fixed(S::Active),
            _ => return None,
        },
        Transition::Disable => match from {
            S::Enabled => Fixed(S::Disabled),
            _ => return None,
        },
        Transition::Reenable => match from {
            S::Disabled => Fixed(S::Enabled),
            _ => return None,
        },
        Transition::Complete => match from {
            S::Active => Fixed(S::Completed),
            _ => return None,
        },
        Transition::Terminate => match from {
            S::Enabled | S::Active | S::Disabled | S::Suspended => Fixed(S::Terminated),
            _ => return None,
        },
        Transition::Exit => match from {
            S::Enabled | S::Active => Fixed(S::Exited),
            _ => return None,
        },
        Transition::Suspend => match from {
            S::Enabled | S::Active => Fixed(S::Suspended),
            _ => return None,
        },
        Transition::Resume | Transition::ParentResume => match from {
            S::Suspended => TargetState::Prior,
            _ => return None,
        },
        Transition::ParentTerminate => {
            if from.is_terminal() {
                return None;
            }
            Fixed(S::Terminated)
        }
        Transition::ParentSuspend => {
            if from.is_terminal() || from == S::Suspended {
                return None;
            }
            Fixed(S::Suspended)
        }
        Transition::Occur => match (from, kind) {
            (S::Available, ItemKind::Milestone | ItemKind::EventListener) => Fixed(S::Completed),
            _ => return None,
        },
        Transition::Close => match from {
            S::Completed | S::Terminated => Fixed(S::Closed),
            _ => return None,
        },
        // Composite sub-events, never requested as operations.
        Transition::Enable | Transition::Start => return None,
    };
    Some(target)
}

// ─── Case model (immutable definitions) ───────────────────────

/// One plan-item definition. Definitions are read-only collaborators; the
/// runtime tree holds occurrences of them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanItemDefinition {
    pub activity_id: String,
    pub name: String,
    pub kind: ItemKind,
    pub activation_policy: ActivationPolicy,
    /// Must reach a terminal success state for the parent to auto-complete.
    pub required: bool,
    /// Stage completion policy: when true, non-required enabled/available
    /// children do not block completion.
    pub auto_complete: bool,
    /// Ordered child activity ids (stages only).
    pub children: Vec<String>,
    pub entry_sentry_ids: Vec<String>,
    pub exit_sentry_ids: Vec<String>,
}

/// One part of a sentry definition: watch `standard_event` on the occurrence
/// of `source_activity_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SentryPartDefinition {
    pub id: String,
    pub source_activity_id: String,
    pub standard_event: Transition,
}

/// A named guard condition — logical AND over its parts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SentryDefinition {
    pub id: String,
    pub parts: Vec<SentryPartDefinition>,
}

/// A complete, deployed case definition — the dispatcher's analogue of a
/// compiled program. Keyed lookups only; never mutated at runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseModel {
    pub key: String,
    /// Activity id of the case plan (the root stage).
    pub root_activity_id: String,
    pub items: BTreeMap<String, PlanItemDefinition>,
    pub sentries: BTreeMap<String, SentryDefinition>,
}

impl CaseModel {
    pub fn item(&self, activity_id: &str) -> Option<&PlanItemDefinition> {
        self.items.get(activity_id)
    }

    /// Structural validation, run once at case creation. A sentry with zero
    /// parts is vacuously unsatisfiable and rejected here, not at evaluation.
    pub fn validate(&self) -> Result<(), String> {
        let root = self
            .items
            .get(&self.root_activity_id)
            .ok_or_else(|| format!("root activity {} not defined", self.root_activity_id))?;
        if root.kind != ItemKind::Stage {
            return Err(format!("root activity {} must be a stage", self.root_activity_id));
        }
        for (id, item) in &self.items {
            if *id != item.activity_id {
                return Err(format!("item keyed {id} declares activity_id {}", item.activity_id));
            }
            if item.kind != ItemKind::Stage && !item.children.is_empty() {
                return Err(format!("non-stage {id} declares children"));
            }
            for child in &item.children {
                if !self.items.contains_key(child) {
                    return Err(format!("{id} references undefined child {child}"));
                }
            }
            for sentry_id in item.entry_sentry_ids.iter().chain(&item.exit_sentry_ids) {
                if !self.sentries.contains_key(sentry_id) {
                    return Err(format!("{id} references undefined sentry {sentry_id}"));
                }
            }
        }
        for (id, sentry) in &self.sentries {
            if sentry.parts.is_empty() {
                return Err(format!("sentry {id} has no parts"));
            }
            for part in &sentry.parts {
                if !self.items.contains_key(&part.source_activity_id) {
                    return Err(format!(
                        "sentry {id} part {} watches undefined activity {}",
                        part.id, part.source_activity_id
                    ));
                }
            }
        }
        Ok(())
    }
}

// ─── Runtime sentries ─────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SentryKind {
    Entry,
    Exit,
}

/// Runtime watch condition. `satisfied` latches once true and is never reset
/// while the sentry is pending. A part whose source occurrence was never
/// instantiated (or evicted before matching) carries no source id and can
/// never latch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SentryPart {
    pub id: String,
    pub source_execution_id: Option<Uuid>,
    pub standard_event: Transition,
    pub satisfied: bool,
}

/// Runtime sentry instance guarding one node's entry or exit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sentry {
    pub id: String,
    pub case_instance_id: Uuid,
    pub kind: SentryKind,
    pub target_execution_id: Uuid,
    pub parts: Vec<SentryPart>,
    /// A sentry triggers its dependent transition exactly once.
    pub fired: bool,
}

impl Sentry {
    /// Logical AND over all parts.
    pub fn is_satisfied(&self) -> bool {
        self.parts.iter().all(|p| p.satisfied)
    }
}

// ─── Runtime tree ─────────────────────────────────────────────

/// One plan-item occurrence in the running tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseExecutionNode {
    pub id: Uuid,
    pub case_instance_id: Uuid,
    /// Exclusively-owning parent; `None` only for the case root.
    pub parent_id: Option<Uuid>,
    pub activity_id: String,
    pub kind: ItemKind,
    pub state: CaseExecutionState,
    /// Owned children in definition order. Order matters for the
    /// last-required-child completion check.
    pub children: Vec<Uuid>,
    pub activation_policy: ActivationPolicy,
    pub required: bool,
    pub auto_complete: bool,
    pub entry_sentry_ids: Vec<String>,
    pub exit_sentry_ids: Vec<String>,
    /// State to restore on resume. Set on every suspend.
    pub prior_state: Option<CaseExecutionState>,
    pub suspension_origin: Option<SuspensionOrigin>,
    /// Local variable scope. Read and written by listeners only.
    pub variables: BTreeMap<String, VariableValue>,
}

impl CaseExecutionNode {
    pub fn from_definition(
        id: Uuid,
        case_instance_id: Uuid,
        parent_id: Option<Uuid>,
        def: &PlanItemDefinition,
    ) -> Self {
        Self {
            id,
            case_instance_id,
            parent_id,
            activity_id: def.activity_id.clone(),
            kind: def.kind,
            state: CaseExecutionState::Available,
            children: Vec::new(),
            activation_policy: def.activation_policy,
            required: def.required,
            auto_complete: def.auto_complete,
            entry_sentry_ids: def.entry_sentry_ids.clone(),
            exit_sentry_ids: def.exit_sentry_ids.clone(),
            prior_state: None,
            suspension_origin: None,
            variables: BTreeMap::new(),
        }
    }
}

/// One running case — the tree of live occurrences plus its pending
/// sentries. The arena keys nodes by id; `parent_id` is a lookup key, not an
/// owning pointer. One instance is the unit of serialization: callers apply
/// transitions under per-instance mutual exclusion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseInstance {
    pub case_instance_id: Uuid,
    pub case_definition_key: String,
    pub root_id: Uuid,
    pub nodes: BTreeMap<Uuid, CaseExecutionNode>,
    pub sentries: BTreeMap<String, Sentry>,
    pub closed: bool,
    pub created_at: Timestamp,
}

impl CaseInstance {
    pub fn node(&self, id: Uuid) -> Option<&CaseExecutionNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: Uuid) -> Option<&mut CaseExecutionNode> {
        self.nodes.get_mut(&id)
    }

    /// Find the live occurrence of an activity. Occurrences are unique per
    /// activity within one instance.
    pub fn find_by_activity(&self, activity_id: &str) -> Option<&CaseExecutionNode> {
        self.nodes.values().find(|n| n.activity_id == activity_id)
    }

    /// Live children of a node, in definition order.
    pub fn children_of(&self, id: Uuid) -> Vec<Uuid> {
        self.node(id).map(|n| n.children.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disable_only_legal_from_enabled() {
        use CaseExecutionState as S;
        for from in [S::Available, S::Active, S::Disabled, S::Suspended, S::Completed] {
            assert_eq!(
                legal_target(from, Transition::Disable, ActivationPolicy::Manual, ItemKind::Task),
                None,
                "disable must be illegal from {from}"
            );
        }
        assert_eq!(
            legal_target(S::Enabled, Transition::Disable, ActivationPolicy::Manual, ItemKind::Task),
            Some(TargetState::Fixed(S::Disabled))
        );
    }

    #[test]
    fn manual_start_requires_manual_policy() {
        use CaseExecutionState as S;
        assert_eq!(
            legal_target(S::Enabled, Transition::ManualStart, ActivationPolicy::Automatic, ItemKind::Task),
            None
        );
        assert_eq!(
            legal_target(S::Enabled, Transition::ManualStart, ActivationPolicy::Manual, ItemKind::Task),
            Some(TargetState::Fixed(S::Active))
        );
    }

    #[test]
    fn complete_never_legal_from_enabled() {
        assert_eq!(
            legal_target(
                CaseExecutionState::Enabled,
                Transition::Complete,
                ActivationPolicy::Manual,
                ItemKind::Task
            ),
            None
        );
    }

    #[test]
    fn parent_cascades_are_idempotent_on_reached_states() {
        use CaseExecutionState as S;
        assert_eq!(
            legal_target(S::Terminated, Transition::ParentTerminate, ActivationPolicy::Manual, ItemKind::Task),
            None
        );
        assert_eq!(
            legal_target(S::Suspended, Transition::ParentSuspend, ActivationPolicy::Manual, ItemKind::Task),
            None
        );
    }

    #[test]
    fn occur_restricted_to_event_shaped_items() {
        use CaseExecutionState as S;
        assert_eq!(
            legal_target(S::Available, Transition::Occur, ActivationPolicy::Automatic, ItemKind::Task),
            None
        );
        assert_eq!(
            legal_target(S::Available, Transition::Occur, ActivationPolicy::Automatic, ItemKind::Milestone),
            Some(TargetState::Fixed(S::Completed))
        );
    }

    #[test]
    fn model_rejects_zero_part_sentry() {
        let mut items = BTreeMap::new();
        items.insert(
            "case".to_string(),
            PlanItemDefinition {
                activity_id: "case".to_string(),
                name: "case".to_string(),
                kind: ItemKind::Stage,
                activation_policy: ActivationPolicy::Automatic,
                required: true,
                auto_complete: false,
                children: vec![],
                entry_sentry_ids: vec![],
                exit_sentry_ids: vec![],
            },
        );
        let mut sentries = BTreeMap::new();
        sentries.insert(
            "s1".to_string(),
            SentryDefinition { id: "s1".to_string(), parts: vec![] },
        );
        let model = CaseModel {
            key: "k".to_string(),
            root_activity_id: "case".to_string(),
            items,
            sentries,
        };
        assert!(model.validate().unwrap_err().contains("no parts"));
    }
}
