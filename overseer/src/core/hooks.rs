//! Hook events, decisions, and deterministic dispatch.
//!
//! Every external request and internal lifecycle event passes through
//! [`dispatch`]. Hooks are explicit registrations handed to the orchestrator
//! builder; there is no ambient registry, so isolated orchestrator instances
//! can run side by side in tests.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Lifecycle events that can trigger hooks.
///
/// The execution sequence for one task is linear with an intervention loop:
/// `RequestReceived → ExecutionStarted → ExecutionStream* →
/// [ExecutionIntervention]* → ExecutionCompleted | ExecutionFailed`.
/// `ParallelSpawn`/`ParallelMerge` and `MonitorAttach`/`MonitorDetach` are
/// cross-task events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEventKind {
    RequestReceived,
    ExecutionStarted,
    ExecutionStream,
    ExecutionIntervention,
    ExecutionCompleted,
    ExecutionFailed,
    ParallelSpawn,
    ParallelMerge,
    MonitorAttach,
    MonitorDetach,
}

impl HookEventKind {
    /// Canonical snake_case name, used in events and logs.
    pub fn event_name(self) -> &'static str {
        match self {
            HookEventKind::RequestReceived => "request_received",
            HookEventKind::ExecutionStarted => "execution_started",
            HookEventKind::ExecutionStream => "execution_stream",
            HookEventKind::ExecutionIntervention => "execution_intervention",
            HookEventKind::ExecutionCompleted => "execution_completed",
            HookEventKind::ExecutionFailed => "execution_failed",
            HookEventKind::ParallelSpawn => "parallel_spawn",
            HookEventKind::ParallelMerge => "parallel_merge",
            HookEventKind::MonitorAttach => "monitor_attach",
            HookEventKind::MonitorDetach => "monitor_detach",
        }
    }
}

/// One lifecycle event flowing through the dispatch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookEvent {
    pub kind: HookEventKind,
    pub task_id: String,
    pub payload: Value,
}

/// Decision returned by a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    /// Let dispatch continue to the next hook.
    Continue,
    /// Halt dispatch; the triggering request must not proceed.
    Block { reason: String },
    /// Merge `patch` into the event payload; visible to subsequent hooks.
    Modify { patch: Value },
    /// Halt dispatch and hand the request to another target.
    Redirect { target: String },
}

/// A registered hook handler.
pub trait Hook: Send + Sync {
    fn handle(&self, event: &HookEvent) -> HookDecision;
}

impl<F> Hook for F
where
    F: Fn(&HookEvent) -> HookDecision + Send + Sync,
{
    fn handle(&self, event: &HookEvent) -> HookDecision {
        self(event)
    }
}

/// A named registration: which events, at what priority, with which handler.
#[derive(Clone)]
pub struct HookRegistration {
    pub name: String,
    /// Subscribed event kinds. An empty set subscribes to everything.
    pub events: Vec<HookEventKind>,
    pub priority: i32,
    pub handler: Arc<dyn Hook>,
}

impl std::fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistration")
            .field("name", &self.name)
            .field("events", &self.events)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl HookRegistration {
    pub fn new(
        name: impl Into<String>,
        events: Vec<HookEventKind>,
        priority: i32,
        handler: Arc<dyn Hook>,
    ) -> Self {
        Self {
            name: name.into(),
            events,
            priority,
            handler,
        }
    }

    fn subscribed(&self, kind: HookEventKind) -> bool {
        self.events.is_empty() || self.events.contains(&kind)
    }
}

/// Terminal decision of one dispatch pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchDecision {
    Proceed,
    Blocked { hook: String, reason: String },
    Redirected { hook: String, target: String },
}

/// Result of dispatching one event through all subscribed hooks.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub decision: DispatchDecision,
    /// Event payload after all accumulated `Modify` patches.
    pub payload: Value,
    /// Names of hooks that faulted (panicked) during this pass.
    pub faults: Vec<String>,
}

impl DispatchOutcome {
    pub fn proceeded(&self) -> bool {
        self.decision == DispatchDecision::Proceed
    }
}

/// Run `event` through every subscribed hook in descending priority order
/// (stable: ties keep registration order).
///
/// The first `Block` or `Redirect` halts further dispatch. `Modify` patches
/// accumulate into the payload and are visible to subsequent hooks. A
/// panicking hook is treated as `Continue` with a logged warning: hooks can
/// never crash the orchestrator.
pub fn dispatch(registrations: &[HookRegistration], event: &HookEvent) -> DispatchOutcome {
    let mut ordered: Vec<&HookRegistration> = registrations
        .iter()
        .filter(|reg| reg.subscribed(event.kind))
        .collect();
    ordered.sort_by_key(|reg| std::cmp::Reverse(reg.priority));

    let mut current = event.clone();
    let mut faults = Vec::new();

    for reg in ordered {
        let result = catch_unwind(AssertUnwindSafe(|| reg.handler.handle(&current)));
        let decision = match result {
            Ok(decision) => decision,
            Err(_) => {
                warn!(
                    hook = %reg.name,
                    event = event.kind.event_name(),
                    "hook panicked; treating as continue"
                );
                faults.push(reg.name.clone());
                continue;
            }
        };
        match decision {
            HookDecision::Continue => {}
            HookDecision::Modify { patch } => {
                merge_patch(&mut current.payload, &patch);
            }
            HookDecision::Block { reason } => {
                return DispatchOutcome {
                    decision: DispatchDecision::Blocked {
                        hook: reg.name.clone(),
                        reason,
                    },
                    payload: current.payload,
                    faults,
                };
            }
            HookDecision::Redirect { target } => {
                return DispatchOutcome {
                    decision: DispatchDecision::Redirected {
                        hook: reg.name.clone(),
                        target,
                    },
                    payload: current.payload,
                    faults,
                };
            }
        }
    }

    DispatchOutcome {
        decision: DispatchDecision::Proceed,
        payload: current.payload,
        faults,
    }
}

/// Recursive JSON merge: objects merge key-wise, `null` removes, everything
/// else replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                if value.is_null() {
                    target_map.remove(key);
                } else {
                    merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target_slot, patch_value) => *target_slot = patch_value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: HookEventKind) -> HookEvent {
        HookEvent {
            kind,
            task_id: "t1".to_string(),
            payload: json!({"prompt": "create calculator"}),
        }
    }

    fn reg(name: &str, priority: i32, handler: Arc<dyn Hook>) -> HookRegistration {
        HookRegistration::new(name, Vec::new(), priority, handler)
    }

    #[test]
    fn block_halts_dispatch_in_priority_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let record = |name: &'static str, seen: Arc<std::sync::Mutex<Vec<String>>>, decision: HookDecision| {
            Arc::new(move |_event: &HookEvent| {
                seen.lock().unwrap().push(name.to_string());
                decision.clone()
            }) as Arc<dyn Hook>
        };

        let regs = vec![
            reg("low", 1, record("low", seen.clone(), HookDecision::Continue)),
            reg(
                "blocker",
                10,
                record(
                    "blocker",
                    seen.clone(),
                    HookDecision::Block {
                        reason: "nope".to_string(),
                    },
                ),
            ),
        ];

        let outcome = dispatch(&regs, &event(HookEventKind::RequestReceived));
        assert_eq!(
            outcome.decision,
            DispatchDecision::Blocked {
                hook: "blocker".to_string(),
                reason: "nope".to_string()
            }
        );
        // The lower-priority hook never ran.
        assert_eq!(*seen.lock().unwrap(), vec!["blocker".to_string()]);
    }

    #[test]
    fn modify_patches_accumulate_and_are_visible_downstream() {
        let observed = Arc::new(std::sync::Mutex::new(Value::Null));
        let observed_clone = observed.clone();

        let regs = vec![
            reg(
                "tagger",
                10,
                Arc::new(|_event: &HookEvent| HookDecision::Modify {
                    patch: json!({"tag": "audited"}),
                }) as Arc<dyn Hook>,
            ),
            reg(
                "witness",
                1,
                Arc::new(move |event: &HookEvent| {
                    *observed_clone.lock().unwrap() = event.payload.clone();
                    HookDecision::Continue
                }) as Arc<dyn Hook>,
            ),
        ];

        let outcome = dispatch(&regs, &event(HookEventKind::RequestReceived));
        assert!(outcome.proceeded());
        assert_eq!(outcome.payload["tag"], "audited");
        assert_eq!(outcome.payload["prompt"], "create calculator");
        assert_eq!(observed.lock().unwrap()["tag"], "audited");
    }

    #[test]
    fn panicking_hook_is_continue_with_fault_recorded() {
        let regs = vec![
            reg(
                "faulty",
                10,
                Arc::new(|_event: &HookEvent| -> HookDecision { panic!("boom") }) as Arc<dyn Hook>,
            ),
            reg(
                "steady",
                1,
                Arc::new(|_event: &HookEvent| HookDecision::Continue) as Arc<dyn Hook>,
            ),
        ];
        let outcome = dispatch(&regs, &event(HookEventKind::ExecutionStream));
        assert!(outcome.proceeded());
        assert_eq!(outcome.faults, vec!["faulty".to_string()]);
    }

    #[test]
    fn unsubscribed_hooks_are_skipped() {
        let regs = vec![HookRegistration::new(
            "completion-only",
            vec![HookEventKind::ExecutionCompleted],
            0,
            Arc::new(|_event: &HookEvent| HookDecision::Block {
                reason: "should not run".to_string(),
            }) as Arc<dyn Hook>,
        )];
        let outcome = dispatch(&regs, &event(HookEventKind::RequestReceived));
        assert!(outcome.proceeded());
    }
}
