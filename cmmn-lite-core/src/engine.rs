use crate::errors::{CaseError, CaseResult};
use crate::events::CaseRuntimeEvent;
use crate::listener::{ListenerContext, ListenerFailure, ListenerRegistry};
use crate::sentry;
use crate::store::CaseStore;
use crate::types::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// One unit of cascade work. Steps run LIFO off an explicit stack, so a
/// child's follow-up steps execute before its parent's remaining ones
/// (depth-first), with no async recursion.
enum Step {
    Fire {
        id: Uuid,
        op: Transition,
        /// Cascaded/sentry-driven requests skip silently when the target is
        /// gone or the transition is no longer legal; external requests fail.
        lenient: bool,
    },
    Instantiate {
        stage_id: Uuid,
    },
    Evict {
        id: Uuid,
    },
    CompletionCheck {
        id: Uuid,
    },
}

/// The transition dispatcher. Validates legality, mutates state, fires
/// listeners, records sentry events, and computes cascade effects — one
/// externally-triggered operation runs to completion (including all
/// recursive cascades) before returning.
///
/// Callers serialize operations per case instance; different instances are
/// fully independent.
pub struct CaseEngine {
    store: Arc<dyn CaseStore>,
    listeners: Arc<dyn ListenerRegistry>,
}

impl CaseEngine {
    pub fn new(store: Arc<dyn CaseStore>, listeners: Arc<dyn ListenerRegistry>) -> Self {
        Self { store, listeners }
    }

    /// Instantiate a new case: the root (case plan) is created and started,
    /// and its plan items are instantiated, eagerly or sentry-gated per
    /// their definitions.
    pub async fn create_case(&self, model: &CaseModel) -> CaseResult<CaseInstance> {
        model.validate().map_err(CaseError::InvalidModel)?;
        let root_def = model
            .item(&model.root_activity_id)
            .ok_or_else(|| CaseError::InvalidModel("missing root definition".into()))?;

        let case_id = Uuid::now_v7();
        let root = CaseExecutionNode::from_definition(case_id, case_id, None, root_def);
        self.store.insert_node(&root).await?;

        let mut instance = CaseInstance {
            case_instance_id: case_id,
            case_definition_key: model.key.clone(),
            root_id: case_id,
            nodes: BTreeMap::from([(case_id, root)]),
            sentries: BTreeMap::new(),
            closed: false,
            created_at: now_ms(),
        };
        self.store
            .append_event(
                case_id,
                &CaseRuntimeEvent::CaseCreated {
                    case_instance_id: case_id,
                    case_definition_key: model.key.clone(),
                },
            )
            .await?;

        match self
            .run(&mut instance, model, Step::Fire { id: case_id, op: Transition::Create, lenient: false })
            .await
        {
            Ok(()) => Ok(instance),
            Err(err) => {
                // The instance never became visible to the caller; remove the
                // rows inserted so far. The event log keeps the history.
                let inserted: Vec<Uuid> = instance.nodes.keys().copied().collect();
                for id in inserted {
                    if let Err(cleanup) = self.store.delete_node(case_id, id).await {
                        warn!(execution_id = %id, error = %cleanup, "node rollback failed after aborted case creation");
                    }
                }
                Err(err)
            }
        }
    }

    pub async fn manual_start(
        &self,
        instance: &mut CaseInstance,
        model: &CaseModel,
        id: Uuid,
    ) -> CaseResult<()> {
        self.request(instance, model, id, Transition::ManualStart, false).await
    }

    pub async fn disable(&self, instance: &mut CaseInstance, model: &CaseModel, id: Uuid) -> CaseResult<()> {
        self.request(instance, model, id, Transition::Disable, false).await
    }

    pub async fn reenable(&self, instance: &mut CaseInstance, model: &CaseModel, id: Uuid) -> CaseResult<()> {
        self.request(instance, model, id, Transition::Reenable, false).await
    }

    pub async fn complete(&self, instance: &mut CaseInstance, model: &CaseModel, id: Uuid) -> CaseResult<()> {
        self.request(instance, model, id, Transition::Complete, false).await
    }

    pub async fn terminate(&self, instance: &mut CaseInstance, model: &CaseModel, id: Uuid) -> CaseResult<()> {
        self.request(instance, model, id, Transition::Terminate, false).await
    }

    pub async fn exit(&self, instance: &mut CaseInstance, model: &CaseModel, id: Uuid) -> CaseResult<()> {
        self.request(instance, model, id, Transition::Exit, false).await
    }

    pub async fn suspend(&self, instance: &mut CaseInstance, model: &CaseModel, id: Uuid) -> CaseResult<()> {
        self.request(instance, model, id, Transition::Suspend, false).await
    }

    pub async fn resume(&self, instance: &mut CaseInstance, model: &CaseModel, id: Uuid) -> CaseResult<()> {
        self.request(instance, model, id, Transition::Resume, false).await
    }

    /// Signal an instantaneous event on a milestone or event-listener node.
    pub async fn occur(&self, instance: &mut CaseInstance, model: &CaseModel, id: Uuid) -> CaseResult<()> {
        self.request(instance, model, id, Transition::Occur, false).await
    }

    // Parent-cascaded variants. Applying one to a node that already reached
    // the corresponding state through another path is a no-op, not an error.

    pub async fn parent_suspend(
        &self,
        instance: &mut CaseInstance,
        model: &CaseModel,
        id: Uuid,
    ) -> CaseResult<()> {
        self.request(instance, model, id, Transition::ParentSuspend, true).await
    }

    pub async fn parent_resume(
        &self,
        instance: &mut CaseInstance,
        model: &CaseModel,
        id: Uuid,
    ) -> CaseResult<()> {
        self.request(instance, model, id, Transition::ParentResume, true).await
    }

    pub async fn parent_terminate(
        &self,
        instance: &mut CaseInstance,
        model: &CaseModel,
        id: Uuid,
    ) -> CaseResult<()> {
        self.request(instance, model, id, Transition::ParentTerminate, true).await
    }

    /// Archive a finished case. Illegal while any plan item is still live or
    /// the root has not reached a terminal outcome.
    pub async fn close(&self, instance: &mut CaseInstance) -> CaseResult<()> {
        if instance.closed {
            return Err(CaseError::NotFound(instance.root_id));
        }
        let root = instance
            .node(instance.root_id)
            .ok_or(CaseError::NotFound(instance.root_id))?;
        let from = root.state;
        let activity_id = root.activity_id.clone();

        if instance.nodes.len() > 1 {
            return Err(CaseError::NotAllowed { transition: Transition::Close, state: from });
        }
        let Some(TargetState::Fixed(to)) =
            legal_target(from, Transition::Close, root.activation_policy, root.kind)
        else {
            return Err(CaseError::NotAllowed { transition: Transition::Close, state: from });
        };

        let root_id = instance.root_id;
        instance.node_mut(root_id).expect("root present").state = to;

        for listener in self.listeners.listeners_for(&activity_id, Transition::Close) {
            let mut ctx = ListenerContext::new(instance, root_id, Transition::Close);
            match listener.invoke(&mut ctx).await {
                Ok(()) => {}
                Err(ListenerFailure::Fatal(source)) => {
                    instance.node_mut(root_id).expect("root present").state = from;
                    return Err(CaseError::FatalListener { transition: Transition::Close, source });
                }
                Err(ListenerFailure::Fault { code, message }) => {
                    // Structural change stays committed, same as any fault.
                    self.finish_close(instance, &activity_id, from, to).await?;
                    return Err(CaseError::DomainFault { code, message });
                }
            }
        }
        self.finish_close(instance, &activity_id, from, to).await
    }

    async fn finish_close(
        &self,
        instance: &mut CaseInstance,
        activity_id: &str,
        from: CaseExecutionState,
        to: CaseExecutionState,
    ) -> CaseResult<()> {
        let root_id = instance.root_id;
        self.store
            .append_event(
                instance.case_instance_id,
                &CaseRuntimeEvent::TransitionFired {
                    execution_id: root_id,
                    activity_id: activity_id.to_string(),
                    transition: Transition::Close,
                    from,
                    to,
                },
            )
            .await?;
        self.store
            .append_event(instance.case_instance_id, &CaseRuntimeEvent::CaseClosed { at: now_ms() })
            .await?;
        self.store.delete_node(instance.case_instance_id, root_id).await?;
        instance.closed = true;
        Ok(())
    }

    async fn request(
        &self,
        instance: &mut CaseInstance,
        model: &CaseModel,
        id: Uuid,
        op: Transition,
        lenient: bool,
    ) -> CaseResult<()> {
        if instance.closed {
            return Err(CaseError::NotFound(id));
        }
        self.run(instance, model, Step::Fire { id, op, lenient }).await
    }

    /// Drain the work stack. The full effect of one external trigger —
    /// including every recursive cascade step — is applied before returning.
    async fn run(&self, instance: &mut CaseInstance, model: &CaseModel, first: Step) -> CaseResult<()> {
        let mut stack = vec![first];
        while let Some(step) = stack.pop() {
            match step {
                Step::Fire { id, op, lenient } => {
                    let follow = self.fire(instance, model, id, op, lenient).await?;
                    push_in_order(&mut stack, follow);
                }
                Step::Instantiate { stage_id } => {
                    let follow = self.instantiate_children(instance, model, stage_id).await?;
                    push_in_order(&mut stack, follow);
                }
                Step::Evict { id } => {
                    self.evict(instance, id).await?;
                }
                Step::CompletionCheck { id } => {
                    if let Some(next) = completion_step(instance, id) {
                        stack.push(next);
                    }
                }
            }
        }
        Ok(())
    }

    /// One atomic transition: validate legality, confirm guards, mutate
    /// state, invoke listeners in registration order, record sentry events,
    /// and return the cascade steps to apply next.
    async fn fire(
        &self,
        instance: &mut CaseInstance,
        _model: &CaseModel,
        id: Uuid,
        op: Transition,
        lenient: bool,
    ) -> CaseResult<Vec<Step>> {
        let Some(node) = instance.node(id) else {
            return if lenient { Ok(Vec::new()) } else { Err(CaseError::NotFound(id)) };
        };
        let from = node.state;
        let policy = node.activation_policy;
        let kind = node.kind;
        let activity_id = node.activity_id.clone();
        let parent_id = node.parent_id;
        let prior = node.prior_state;
        let origin = node.suspension_origin;

        let not_allowed = |lenient: bool| -> CaseResult<Vec<Step>> {
            if lenient {
                Ok(Vec::new())
            } else {
                Err(CaseError::NotAllowed { transition: op, state: from })
            }
        };

        let Some(target) = legal_target(from, op, policy, kind) else {
            return not_allowed(lenient);
        };

        // Resume variants must match the suspension origin: a cascaded
        // resume never undoes a self-initiated suspend, and vice versa.
        match op {
            Transition::Resume if origin != Some(SuspensionOrigin::Node) => return not_allowed(lenient),
            Transition::ParentResume if origin != Some(SuspensionOrigin::Parent) => {
                return not_allowed(lenient)
            }
            _ => {}
        }

        // A stage may only complete when no child still blocks it.
        if op == Transition::Complete && kind == ItemKind::Stage && !stage_can_complete(instance, id) {
            return not_allowed(lenient);
        }

        let to = match target {
            TargetState::Fixed(state) => state,
            TargetState::Prior => prior.unwrap_or(CaseExecutionState::Active),
        };

        {
            let node = instance.node_mut(id).expect("checked above");
            node.state = to;
            match op {
                Transition::Suspend => {
                    node.prior_state = Some(from);
                    node.suspension_origin = Some(SuspensionOrigin::Node);
                }
                Transition::ParentSuspend => {
                    node.prior_state = Some(from);
                    node.suspension_origin = Some(SuspensionOrigin::Parent);
                }
                Transition::Resume | Transition::ParentResume => {
                    node.prior_state = None;
                    node.suspension_origin = None;
                }
                _ => {}
            }
        }

        debug!(execution_id = %id, activity = %activity_id, transition = %op, %from, %to, "transition fired");

        // `create` is composite: it also fires enable (manual policy) or the
        // automatic start. Manual starts fire start before manualStart.
        let fired_events: Vec<Transition> = match op {
            Transition::Create => match policy {
                ActivationPolicy::Manual => vec![Transition::Create, Transition::Enable],
                ActivationPolicy::Automatic => vec![Transition::Create, Transition::Start],
            },
            Transition::ManualStart => vec![Transition::Start, Transition::ManualStart],
            other => vec![other],
        };

        for event in &fired_events {
            for listener in self.listeners.listeners_for(&activity_id, *event) {
                let mut ctx = ListenerContext::new(instance, id, *event);
                match listener.invoke(&mut ctx).await {
                    Ok(()) => {}
                    Err(ListenerFailure::Fatal(source)) => {
                        // Abort: restore the pre-transition lifecycle state.
                        let node = instance.node_mut(id).expect("still present");
                        node.state = from;
                        node.prior_state = prior;
                        node.suspension_origin = origin;
                        return Err(CaseError::FatalListener { transition: *event, source });
                    }
                    Err(ListenerFailure::Fault { code, message }) => {
                        // Commit the structural change, skip remaining
                        // cascade, propagate the business fault.
                        self.append_transition(instance, id, &activity_id, op, from, to).await?;
                        self.store
                            .append_event(
                                instance.case_instance_id,
                                &CaseRuntimeEvent::ListenerFaulted {
                                    execution_id: id,
                                    transition: *event,
                                    code: code.clone(),
                                    message: message.clone(),
                                },
                            )
                            .await?;
                        if to.is_terminal() {
                            self.evict(instance, id).await?;
                        }
                        return Err(CaseError::DomainFault { code, message });
                    }
                }
            }
        }

        self.append_transition(instance, id, &activity_id, op, from, to).await?;

        let mut follow = Vec::new();

        // Every fired standard event is observable by pending sentries.
        // Sentries that just latched fully fire their dependent transition
        // before the cascade effects of this one.
        for event in &fired_events {
            let outcome = sentry::record_event(&mut instance.sentries, id, *event);
            for latched in &outcome.latched {
                self.store
                    .append_event(
                        instance.case_instance_id,
                        &CaseRuntimeEvent::SentryPartSatisfied {
                            sentry_id: latched.sentry_id.clone(),
                            part_id: latched.part_id.clone(),
                            source_execution_id: latched.source_execution_id,
                            standard_event: latched.standard_event,
                        },
                    )
                    .await?;
            }
            for fired in outcome.fired {
                // A suspended target holds the sentry back; it re-fires when
                // the target resumes. Only a terminal target loses it.
                if instance.node(fired.target_execution_id).map(|n| n.state)
                    == Some(CaseExecutionState::Suspended)
                {
                    if let Some(held) = instance.sentries.get_mut(&fired.sentry_id) {
                        held.fired = false;
                    }
                    continue;
                }
                self.dispatch_fired_sentry(instance, &fired, &mut follow).await?;
            }
        }

        match op {
            Transition::Create | Transition::ManualStart => {
                if kind == ItemKind::Stage && to == CaseExecutionState::Active {
                    follow.push(Step::Instantiate { stage_id: id });
                }
            }
            Transition::Complete | Transition::Terminate | Transition::Exit | Transition::Occur => {
                // Children that did not block the terminal outcome are
                // cascaded out before the node is evicted.
                for child in instance.children_of(id) {
                    follow.push(Step::Fire { id: child, op: Transition::ParentTerminate, lenient: true });
                }
                follow.push(Step::Evict { id });
                if let Some(parent) = parent_id {
                    follow.push(Step::CompletionCheck { id: parent });
                }
            }
            Transition::ParentTerminate => {
                // Parent is already transitioning; no upward re-check.
                for child in instance.children_of(id) {
                    follow.push(Step::Fire { id: child, op: Transition::ParentTerminate, lenient: true });
                }
                follow.push(Step::Evict { id });
            }
            Transition::Suspend | Transition::ParentSuspend => {
                for child in instance.children_of(id) {
                    follow.push(Step::Fire { id: child, op: Transition::ParentSuspend, lenient: true });
                }
            }
            Transition::Resume | Transition::ParentResume => {
                // Sentries held back while this node was suspended fire now.
                for fired in sentry::fire_deferred(&mut instance.sentries, id) {
                    self.dispatch_fired_sentry(instance, &fired, &mut follow).await?;
                }
                for child in instance.children_of(id) {
                    follow.push(Step::Fire { id: child, op: Transition::ParentResume, lenient: true });
                }
            }
            Transition::Disable => {
                // A disabled child never blocks its parent; disabling the
                // last blocking one completes the parent.
                if let Some(parent) = parent_id {
                    follow.push(Step::CompletionCheck { id: parent });
                }
            }
            _ => {}
        }

        Ok(follow)
    }

    async fn append_transition(
        &self,
        instance: &CaseInstance,
        id: Uuid,
        activity_id: &str,
        transition: Transition,
        from: CaseExecutionState,
        to: CaseExecutionState,
    ) -> CaseResult<()> {
        self.store
            .append_event(
                instance.case_instance_id,
                &CaseRuntimeEvent::TransitionFired {
                    execution_id: id,
                    activity_id: activity_id.to_string(),
                    transition,
                    from,
                    to,
                },
            )
            .await?;
        Ok(())
    }

    /// Record satisfaction and queue the dependent transition of a sentry
    /// that just fired.
    async fn dispatch_fired_sentry(
        &self,
        instance: &CaseInstance,
        fired: &sentry::FiredSentry,
        follow: &mut Vec<Step>,
    ) -> CaseResult<()> {
        self.store
            .append_event(
                instance.case_instance_id,
                &CaseRuntimeEvent::SentrySatisfied {
                    sentry_id: fired.sentry_id.clone(),
                    target_execution_id: fired.target_execution_id,
                },
            )
            .await?;
        let dependent = match fired.kind {
            SentryKind::Entry => match instance.node(fired.target_execution_id).map(|n| n.kind) {
                Some(ItemKind::Milestone | ItemKind::EventListener) => Transition::Occur,
                _ => Transition::Create,
            },
            SentryKind::Exit => Transition::Exit,
        };
        follow.push(Step::Fire { id: fired.target_execution_id, op: dependent, lenient: true });
        Ok(())
    }

    /// Instantiate every child occurrence of an active stage: records first
    /// (so the whole sibling batch exists), then runtime sentries (parts
    /// resolve against the batch), then creation of the ungated children in
    /// definition order.
    async fn instantiate_children(
        &self,
        instance: &mut CaseInstance,
        model: &CaseModel,
        stage_id: Uuid,
    ) -> CaseResult<Vec<Step>> {
        let Some(stage) = instance.node(stage_id) else {
            return Ok(Vec::new());
        };
        if stage.state != CaseExecutionState::Active {
            return Ok(Vec::new());
        }
        let stage_activity = stage.activity_id.clone();
        let def = model
            .item(&stage_activity)
            .ok_or_else(|| CaseError::InvalidModel(format!("no definition for {stage_activity}")))?;

        let mut created = Vec::new();
        for child_activity in &def.children {
            let child_def = model
                .item(child_activity)
                .ok_or_else(|| CaseError::InvalidModel(format!("no definition for {child_activity}")))?;
            let child_id = Uuid::now_v7();
            let node = CaseExecutionNode::from_definition(
                child_id,
                instance.case_instance_id,
                Some(stage_id),
                child_def,
            );
            self.store.insert_node(&node).await?;
            self.store
                .append_event(
                    instance.case_instance_id,
                    &CaseRuntimeEvent::PlanItemInstantiated {
                        execution_id: child_id,
                        activity_id: child_def.activity_id.clone(),
                        parent_id: Some(stage_id),
                    },
                )
                .await?;
            instance.node_mut(stage_id).expect("stage present").children.push(child_id);
            instance.nodes.insert(child_id, node);
            created.push(child_id);
        }

        for child_id in &created {
            let child = instance.node(*child_id).expect("just inserted");
            let entry_ids = child.entry_sentry_ids.clone();
            let exit_ids = child.exit_sentry_ids.clone();
            for (sentry_kind, ids) in [(SentryKind::Entry, entry_ids), (SentryKind::Exit, exit_ids)] {
                for sentry_id in ids {
                    let sentry_def = model
                        .sentries
                        .get(&sentry_id)
                        .ok_or_else(|| CaseError::InvalidModel(format!("no sentry {sentry_id}")))?;
                    let runtime = sentry::instantiate(
                        sentry_def,
                        sentry_kind,
                        instance.case_instance_id,
                        *child_id,
                        |activity| instance.find_by_activity(activity).map(|n| n.id),
                    );
                    instance.sentries.insert(runtime.id.clone(), runtime);
                }
            }
        }

        let mut follow = Vec::new();
        for child_id in created {
            let child = instance.node(child_id).expect("just inserted");
            if !child.entry_sentry_ids.is_empty() {
                continue; // stays Available until its entry sentry fires
            }
            if matches!(child.kind, ItemKind::Milestone | ItemKind::EventListener) {
                continue; // waits for an external occur
            }
            follow.push(Step::Fire { id: child_id, op: Transition::Create, lenient: false });
        }
        Ok(follow)
    }

    /// Remove a terminal node from the tree. The case root is never evicted
    /// here; it stays queryable until `close`.
    async fn evict(&self, instance: &mut CaseInstance, id: Uuid) -> CaseResult<()> {
        if id == instance.root_id {
            return Ok(());
        }
        let Some(node) = instance.nodes.remove(&id) else {
            return Ok(());
        };
        if let Some(parent) = node.parent_id {
            if let Some(parent_node) = instance.node_mut(parent) {
                parent_node.children.retain(|child| *child != id);
            }
        }
        // Sentries guarding the evictee are discarded; parts elsewhere that
        // watched it stay latched-or-never.
        sentry::discard_for_target(&mut instance.sentries, id);
        self.store.delete_node(instance.case_instance_id, id).await?;
        self.store
            .append_event(
                instance.case_instance_id,
                &CaseRuntimeEvent::PlanItemEvicted {
                    execution_id: id,
                    activity_id: node.activity_id,
                    outcome: node.state,
                },
            )
            .await?;
        Ok(())
    }
}

fn push_in_order(stack: &mut Vec<Step>, follow: Vec<Step>) {
    for step in follow.into_iter().rev() {
        stack.push(step);
    }
}

/// Upward completion check: after a child leaves the blocking set, ask the
/// parent stage whether it should now complete.
fn completion_step(instance: &CaseInstance, id: Uuid) -> Option<Step> {
    let node = instance.node(id)?;
    if node.kind != ItemKind::Stage || node.state != CaseExecutionState::Active {
        return None;
    }
    if stage_can_complete(instance, id) {
        Some(Step::Fire { id, op: Transition::Complete, lenient: true })
    } else {
        None
    }
}

/// A stage may complete iff no live child is active or suspended, and no
/// required child is still available/enabled. Without `auto_complete`, any
/// available/enabled child blocks regardless of `required`. Disabled
/// children never block.
fn stage_can_complete(instance: &CaseInstance, id: Uuid) -> bool {
    let Some(stage) = instance.node(id) else {
        return false;
    };
    for child_id in &stage.children {
        let Some(child) = instance.node(*child_id) else {
            continue;
        };
        match child.state {
            CaseExecutionState::Active | CaseExecutionState::Suspended => return false,
            CaseExecutionState::Available | CaseExecutionState::Enabled => {
                if child.required || !stage.auto_complete {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
