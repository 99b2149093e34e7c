//! Incremental sentry evaluation.
//!
//! Parts latch as standard events arrive from named source occurrences; a
//! sentry reports satisfaction exactly once, when its last pending part
//! latches. Recording the same event twice has no additional effect.

use crate::types::{Sentry, SentryDefinition, SentryKind, SentryPart, Transition};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A part that latched during one `record_event` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LatchedPart {
    pub sentry_id: String,
    pub part_id: String,
    pub source_execution_id: Uuid,
    pub standard_event: Transition,
}

/// A sentry whose satisfaction flipped from false to true during one
/// `record_event` call. Each sentry appears here at most once, ever.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FiredSentry {
    pub sentry_id: String,
    pub kind: SentryKind,
    pub target_execution_id: Uuid,
}

#[derive(Clone, Debug, Default)]
pub struct RecordOutcome {
    pub latched: Vec<LatchedPart>,
    pub fired: Vec<FiredSentry>,
}

/// Build the runtime sentry for one guarded occurrence. `resolve` maps a
/// source activity id to the execution id of its live occurrence; an
/// unresolved source leaves the part permanently unsatisfiable.
pub fn instantiate(
    def: &SentryDefinition,
    kind: SentryKind,
    case_instance_id: Uuid,
    target_execution_id: Uuid,
    resolve: impl Fn(&str) -> Option<Uuid>,
) -> Sentry {
    let parts = def
        .parts
        .iter()
        .map(|p| SentryPart {
            id: p.id.clone(),
            source_execution_id: resolve(&p.source_activity_id),
            standard_event: p.standard_event,
            satisfied: false,
        })
        .collect();
    Sentry {
        id: def.id.clone(),
        case_instance_id,
        kind,
        target_execution_id,
        parts,
        fired: false,
    }
}

/// Mark satisfied every part watching `(source_execution_id, event)` and
/// report sentries that just became fully satisfied. Idempotent.
pub fn record_event(
    sentries: &mut BTreeMap<String, Sentry>,
    source_execution_id: Uuid,
    event: Transition,
) -> RecordOutcome {
    let mut outcome = RecordOutcome::default();

    for sentry in sentries.values_mut() {
        if sentry.fired {
            continue;
        }
        let was_satisfied = sentry.is_satisfied();
        for part in &mut sentry.parts {
            if part.satisfied
                || part.source_execution_id != Some(source_execution_id)
                || part.standard_event != event
            {
                continue;
            }
            part.satisfied = true;
            outcome.latched.push(LatchedPart {
                sentry_id: sentry.id.clone(),
                part_id: part.id.clone(),
                source_execution_id,
                standard_event: event,
            });
        }
        if !was_satisfied && sentry.is_satisfied() {
            sentry.fired = true;
            outcome.fired.push(FiredSentry {
                sentry_id: sentry.id.clone(),
                kind: sentry.kind,
                target_execution_id: sentry.target_execution_id,
            });
        }
    }

    outcome
}

/// Fire sentries that are fully satisfied but were held back because their
/// target was suspended when the last part latched. Marks them fired.
pub fn fire_deferred(
    sentries: &mut BTreeMap<String, Sentry>,
    target_execution_id: Uuid,
) -> Vec<FiredSentry> {
    let mut fired = Vec::new();
    for sentry in sentries.values_mut() {
        if sentry.fired || sentry.target_execution_id != target_execution_id || !sentry.is_satisfied()
        {
            continue;
        }
        sentry.fired = true;
        fired.push(FiredSentry {
            sentry_id: sentry.id.clone(),
            kind: sentry.kind,
            target_execution_id: sentry.target_execution_id,
        });
    }
    fired
}

/// Drop sentries guarding an occurrence that reached a terminal state
/// through another path. Parts elsewhere that watched the evictee keep
/// their latched flags; unlatched ones can never latch again.
pub fn discard_for_target(sentries: &mut BTreeMap<String, Sentry>, target_execution_id: Uuid) {
    sentries.retain(|_, s| s.target_execution_id != target_execution_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SentryPartDefinition;

    fn two_part_def() -> SentryDefinition {
        SentryDefinition {
            id: "s1".to_string(),
            parts: vec![
                SentryPartDefinition {
                    id: "p1".to_string(),
                    source_activity_id: "a".to_string(),
                    standard_event: Transition::Complete,
                },
                SentryPartDefinition {
                    id: "p2".to_string(),
                    source_activity_id: "b".to_string(),
                    standard_event: Transition::Occur,
                },
            ],
        }
    }

    #[test]
    fn fires_only_after_all_parts_regardless_of_order() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let target = Uuid::now_v7();
        let resolve = |act: &str| match act {
            "a" => Some(a),
            "b" => Some(b),
            _ => None,
        };

        let mut sentries = BTreeMap::new();
        sentries.insert(
            "s1".to_string(),
            instantiate(&two_part_def(), SentryKind::Entry, Uuid::now_v7(), target, resolve),
        );

        let out = record_event(&mut sentries, b, Transition::Occur);
        assert_eq!(out.latched.len(), 1);
        assert!(out.fired.is_empty());

        let out = record_event(&mut sentries, a, Transition::Complete);
        assert_eq!(out.fired.len(), 1);
        assert_eq!(out.fired[0].target_execution_id, target);
    }

    #[test]
    fn duplicate_event_does_not_fire_twice() {
        let a = Uuid::now_v7();
        let target = Uuid::now_v7();
        let def = SentryDefinition {
            id: "s1".to_string(),
            parts: vec![SentryPartDefinition {
                id: "p1".to_string(),
                source_activity_id: "a".to_string(),
                standard_event: Transition::Complete,
            }],
        };
        let mut sentries = BTreeMap::new();
        sentries.insert(
            "s1".to_string(),
            instantiate(&def, SentryKind::Entry, Uuid::now_v7(), target, |_| Some(a)),
        );

        let out = record_event(&mut sentries, a, Transition::Complete);
        assert_eq!(out.fired.len(), 1);

        let out = record_event(&mut sentries, a, Transition::Complete);
        assert!(out.latched.is_empty());
        assert!(out.fired.is_empty());
    }

    #[test]
    fn held_back_satisfied_sentry_fires_once_on_demand() {
        let a = Uuid::now_v7();
        let target = Uuid::now_v7();
        let def = SentryDefinition {
            id: "s1".to_string(),
            parts: vec![SentryPartDefinition {
                id: "p1".to_string(),
                source_activity_id: "a".to_string(),
                standard_event: Transition::Complete,
            }],
        };
        let mut sentries = BTreeMap::new();
        sentries.insert(
            "s1".to_string(),
            instantiate(&def, SentryKind::Entry, Uuid::now_v7(), target, |_| Some(a)),
        );

        let out = record_event(&mut sentries, a, Transition::Complete);
        assert_eq!(out.fired.len(), 1);
        // Dispatcher held the firing back because the target was suspended.
        sentries.get_mut("s1").unwrap().fired = false;

        let fired = fire_deferred(&mut sentries, target);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].target_execution_id, target);

        assert!(fire_deferred(&mut sentries, target).is_empty());
        assert!(fire_deferred(&mut sentries, Uuid::now_v7()).is_empty());
    }

    #[test]
    fn unresolved_source_never_latches() {
        let b = Uuid::now_v7();
        let mut sentries = BTreeMap::new();
        sentries.insert(
            "s1".to_string(),
            instantiate(
                &two_part_def(),
                SentryKind::Entry,
                Uuid::now_v7(),
                Uuid::now_v7(),
                |act| if act == "b" { Some(b) } else { None },
            ),
        );

        record_event(&mut sentries, b, Transition::Occur);
        assert!(!sentries["s1"].is_satisfied());
    }

    #[test]
    fn mismatched_event_name_does_not_latch() {
        let a = Uuid::now_v7();
        let def = SentryDefinition {
            id: "s1".to_string(),
            parts: vec![SentryPartDefinition {
                id: "p1".to_string(),
                source_activity_id: "a".to_string(),
                standard_event: Transition::Complete,
            }],
        };
        let mut sentries = BTreeMap::new();
        sentries.insert(
            "s1".to_string(),
            instantiate(&def, SentryKind::Entry, Uuid::now_v7(), Uuid::now_v7(), |_| Some(a)),
        );

        let out = record_event(&mut sentries, a, Transition::Terminate);
        assert!(out.latched.is_empty());
        assert!(out.fired.is_empty());
    }
}
