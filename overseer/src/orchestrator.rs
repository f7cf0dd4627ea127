//! Hook orchestrator and request API.
//!
//! The single serialization point for every request and lifecycle event.
//! Each submitted task gets its own worker thread (sessions run with
//! process-level parallelism). Everything a single task does (stream
//! observation, rule evaluation, hook dispatch, events) happens on that
//! task's worker, so per-task event order is exact while independent tasks
//! proceed concurrently. The task tree is mutated under a single mutex with
//! short critical sections.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::hooks::{DispatchDecision, HookEvent, HookEventKind, HookRegistration, dispatch};
use crate::core::policy::{self, PolicyParams};
use crate::core::rules::{Rule, RuleAction, RuleEngine, RuleMatch, SuppressReason};
use crate::core::scanner::RollingWindow;
use crate::core::tree::TaskTree;
use crate::core::types::EvidenceRecord;
use crate::core::{invariants, types::ExitSummary};
use crate::errors::OverseerError;
use crate::io::config::OverseerConfig;
use crate::io::event_log::{Event, EventSink, JsonlEventLog, kinds};
use crate::io::pty::PtySessionRunner;
use crate::io::session::{
    SessionCommand, SessionPort, SessionRegistry, SessionRequest, SessionRunner,
};
use crate::io::verify::{Verifier, VerifyRequest, WorkspaceVerifier};
use crate::io::workspace::{TaskOutcome, WorkspaceHandle, WorkspaceManager};
use crate::notify::{Notifier, Subscription};
use crate::prompt::PromptEngine;
use crate::task::{DecompositionPattern, Task, TaskOptions, TaskStatus};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Builds an [`Orchestrator`] from explicit configuration objects.
///
/// Rules and hooks are constructor arguments, never ambient globals, so
/// multiple isolated orchestrators can coexist (and tests rely on that).
pub struct OrchestratorBuilder {
    config: OverseerConfig,
    source_root: PathBuf,
    state_dir: PathBuf,
    rules: Vec<Rule>,
    hooks: Vec<HookRegistration>,
    sink: Option<Arc<dyn EventSink>>,
    verifier: Option<Arc<dyn Verifier>>,
    runner: Option<Arc<dyn SessionRunner>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OverseerConfig, source_root: impl Into<PathBuf>) -> Self {
        let source_root = source_root.into();
        let state_dir = source_root.join(".overseer");
        Self {
            config,
            source_root,
            state_dir,
            rules: Vec::new(),
            hooks: Vec::new(),
            sink: None,
            verifier: None,
            runner: None,
        }
    }

    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn hook(mut self, registration: HookRegistration) -> Self {
        self.hooks.push(registration);
        self
    }

    pub fn hooks(mut self, hooks: Vec<HookRegistration>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn session_runner(mut self, runner: Arc<dyn SessionRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(JsonlEventLog::new(self.state_dir.join("events.jsonl"))));
        let verifier = self.verifier.unwrap_or_else(|| {
            Arc::new(WorkspaceVerifier {
                checks: self.config.verify.checks.clone(),
                check_timeout: Duration::from_secs(self.config.verify.check_timeout_secs),
                output_limit_bytes: self.config.verify.check_output_limit_bytes,
            })
        });
        let runner = self.runner.unwrap_or_else(|| Arc::new(PtySessionRunner));
        let workspaces = WorkspaceManager::new(
            &self.source_root,
            &self.state_dir,
            self.config.workspace.mode,
        );
        let params = self.config.policy.params();
        let notifier = Notifier::new(self.config.notify.queue_capacity);
        Ok(Orchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                params,
                hooks: self.hooks,
                rules: self.rules,
                prompts: PromptEngine::new(),
                tree: Mutex::new(TaskTree::new()),
                registry: SessionRegistry::new(),
                workspaces: Mutex::new(workspaces),
                handles: Mutex::new(HashMap::new()),
                final_output: Mutex::new(HashMap::new()),
                sink,
                notifier,
                verifier,
                runner,
            }),
            workers: Mutex::new(HashMap::new()),
        })
    }
}

struct Inner {
    config: OverseerConfig,
    params: PolicyParams,
    hooks: Vec<HookRegistration>,
    rules: Vec<Rule>,
    prompts: PromptEngine,
    tree: Mutex<TaskTree>,
    registry: SessionRegistry,
    workspaces: Mutex<WorkspaceManager>,
    /// Workspace handles for tasks whose merge/reclaim is deferred to a
    /// coordinator (decomposed children).
    handles: Mutex<HashMap<String, WorkspaceHandle>>,
    /// Output tail captured when a session closes, for `output()` afterwards.
    final_output: Mutex<HashMap<String, Vec<u8>>>,
    sink: Arc<dyn EventSink>,
    notifier: Notifier,
    verifier: Arc<dyn Verifier>,
    runner: Arc<dyn SessionRunner>,
}

/// What one finished worker reports to its coordinator.
#[derive(Debug, Clone)]
struct WorkerOutcome {
    completed: bool,
    reward: f64,
    /// Short human summary derived from evidence, used by sequential steps.
    summary: String,
}

/// Orchestrates sessions, hooks, the task tree, and workspaces.
pub struct Orchestrator {
    inner: Arc<Inner>,
    /// Coordinator thread per submitted root, keyed by root task id.
    workers: Mutex<HashMap<String, thread::JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn builder(config: OverseerConfig, source_root: impl Into<PathBuf>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config, source_root)
    }

    /// Submit a prompt for execution. Returns the root task id.
    ///
    /// Validation hooks run first; the request proceeds only if every one of
    /// them continues. `Modify` patches may rewrite the prompt or options
    /// before any task is created.
    #[instrument(skip_all)]
    pub fn submit(&self, prompt: &str, options: TaskOptions) -> Result<String> {
        let event = HookEvent {
            kind: HookEventKind::RequestReceived,
            task_id: String::new(),
            payload: json!({"prompt": prompt, "options": options}),
        };
        let outcome = dispatch(&self.inner.hooks, &event);
        match outcome.decision {
            DispatchDecision::Proceed => {}
            DispatchDecision::Blocked { hook, reason } => {
                info!(hook = %hook, reason = %reason, "submission blocked");
                return Err(OverseerError::Blocked { hook, reason }.into());
            }
            DispatchDecision::Redirected { hook, target } => {
                info!(hook = %hook, target = %target, "submission redirected");
                return Err(OverseerError::Redirected { hook, target }.into());
            }
        }

        let prompt = outcome
            .payload
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or(prompt)
            .to_string();
        let mut options: TaskOptions = match outcome.payload.get("options") {
            Some(patched) => serde_json::from_value(patched.clone())
                .context("options rejected after hook modification")?,
            None => options,
        };
        // A fan-out above one is itself a request to decompose.
        if options.decomposition_pattern == DecompositionPattern::None && options.fan_out > 1 {
            options.decomposition_pattern = DecompositionPattern::Decompose;
        }

        let fan_out = options.fan_out.clamp(1, self.inner.config.policy.max_fan_out);
        let max_depth = options.max_depth.min(self.inner.config.policy.max_depth);

        let root_id = {
            let mut tree = self.inner.tree.lock().expect("task tree lock poisoned");
            let id = tree.insert_root(&prompt, now_ms());
            let actions = PromptEngine::untried_actions(options.decomposition_pattern, fan_out);
            tree.set_untried_actions(&id, actions)
                .expect("freshly inserted root");
            id
        };
        self.record(
            &root_id,
            HookEventKind::RequestReceived.event_name(),
            outcome.payload.clone(),
            options.live_notify,
        );
        self.record(
            &root_id,
            kinds::TASK_SUBMITTED,
            json!({"prompt": prompt, "options": options}),
            options.live_notify,
        );

        let children = self.spawn_children(&root_id, &prompt, &options, fan_out, max_depth)?;

        let inner = self.inner.clone();
        let plan = RunPlan {
            root_id: root_id.clone(),
            prompt,
            options,
            fan_out,
            max_depth,
            children,
        };
        let handle = thread::Builder::new()
            .name(format!("overseer-task-{root_id}"))
            .spawn(move || coordinate(&inner, plan))
            .context("spawn task coordinator")?;
        self.workers
            .lock()
            .expect("workers lock poisoned")
            .insert(root_id.clone(), handle);
        Ok(root_id)
    }

    /// Create the up-front children for parallel-style decompositions.
    /// Sequential children are created lazily by the coordinator so each can
    /// see its predecessor's summary.
    fn spawn_children(
        &self,
        root_id: &str,
        prompt: &str,
        options: &TaskOptions,
        fan_out: u32,
        max_depth: u32,
    ) -> Result<Vec<String>> {
        use DecompositionPattern as P;
        if !matches!(
            options.decomposition_pattern,
            P::Decompose | P::Parallel | P::Recursive
        ) {
            return Ok(Vec::new());
        }
        let mut children = Vec::new();
        for index in 1..=fan_out {
            let child_prompt = self.inner.prompts.render_child(
                options.decomposition_pattern,
                prompt,
                index,
                fan_out,
                max_depth <= 1,
                None,
            )?;
            let child_id = {
                let mut tree = self.inner.tree.lock().expect("task tree lock poisoned");
                tree.take_untried_action(root_id)?;
                let id = tree.insert_child(root_id, &child_prompt, max_depth, now_ms())?;
                if options.decomposition_pattern == P::Recursive && max_depth > 1 {
                    tree.set_untried_actions(
                        &id,
                        PromptEngine::untried_actions(P::Recursive, fan_out),
                    )?;
                }
                id
            };
            self.record(
                &child_id,
                kinds::TASK_SUBMITTED,
                json!({"parent": root_id}),
                options.live_notify,
            );
            children.push(child_id);
        }
        let spawn_event = HookEvent {
            kind: HookEventKind::ParallelSpawn,
            task_id: root_id.to_string(),
            payload: json!({"children": children}),
        };
        dispatch(&self.inner.hooks, &spawn_event);
        self.record(
            root_id,
            spawn_event.kind.event_name(),
            json!({"children": children}),
            options.live_notify,
        );
        Ok(children)
    }

    /// Queue raw input to a task's live session. Acknowledges without
    /// blocking; a full queue surfaces as backpressure.
    pub fn send(&self, task_id: &str, bytes: &[u8]) -> Result<(), OverseerError> {
        let port = self.port_for(task_id)?;
        port.write(bytes)?;
        self.record(
            task_id,
            kinds::INPUT_WRITTEN,
            json!({"bytes": bytes.len()}),
            false,
        );
        Ok(())
    }

    /// Interrupt a task's session, optionally following up with input.
    ///
    /// Only the named task is touched: siblings and ancestors keep running.
    pub fn interrupt(&self, task_id: &str, follow_up: Option<&[u8]>) -> Result<(), OverseerError> {
        let port = self.port_for(task_id)?;
        port.interrupt()?;
        {
            let mut tree = self.inner.tree.lock().expect("task tree lock poisoned");
            let _ = tree.set_status(task_id, TaskStatus::Intervened, now_ms());
        }
        if let Some(bytes) = follow_up {
            port.write(bytes)?;
        }
        self.record(
            task_id,
            kinds::INTERVENTION,
            json!({"source": "manual", "follow_up": follow_up.is_some()}),
            false,
        );
        Ok(())
    }

    /// Snapshot one task, or every task with `"*"`.
    pub fn status(&self, selector: &str) -> Vec<Task> {
        self.inner
            .tree
            .lock()
            .expect("task tree lock poisoned")
            .snapshot(selector)
    }

    /// Tail of a task's session output (live or final).
    pub fn output(&self, task_id: &str, tail: Option<usize>) -> Result<Vec<u8>, OverseerError> {
        let n = tail.unwrap_or(usize::MAX);
        if let Some(port) = self.inner.registry.get(task_id) {
            return Ok(port.output_tail(n));
        }
        let outputs = self.inner.final_output.lock().expect("output lock poisoned");
        match outputs.get(task_id) {
            Some(bytes) => {
                let skip = bytes.len().saturating_sub(n);
                Ok(bytes[skip..].to_vec())
            }
            None => {
                let known = self
                    .inner
                    .tree
                    .lock()
                    .expect("task tree lock poisoned")
                    .snapshot(task_id);
                if known.is_empty() {
                    Err(OverseerError::UnknownTask(task_id.to_string()))
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Attach a live event subscriber.
    pub fn attach_monitor(&self) -> Subscription {
        let subscription = self.inner.notifier.subscribe();
        let event = HookEvent {
            kind: HookEventKind::MonitorAttach,
            task_id: String::new(),
            payload: json!({"monitor": subscription.id}),
        };
        dispatch(&self.inner.hooks, &event);
        self.record("", event.kind.event_name(), event.payload.clone(), false);
        subscription
    }

    pub fn detach_monitor(&self, id: u64) {
        self.inner.notifier.unsubscribe(id);
        let event = HookEvent {
            kind: HookEventKind::MonitorDetach,
            task_id: String::new(),
            payload: json!({"monitor": id}),
        };
        dispatch(&self.inner.hooks, &event);
        self.record("", event.kind.event_name(), event.payload.clone(), false);
    }

    /// Wait for a submitted root task (and its whole subtree) to finish.
    pub fn join(&self, root_id: &str) -> Result<()> {
        let handle = self
            .workers
            .lock()
            .expect("workers lock poisoned")
            .remove(root_id);
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow::anyhow!("task coordinator panicked")),
            None => Ok(()),
        }
    }

    /// Wait for every in-flight submission.
    pub fn join_all(&self) -> Result<()> {
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().expect("workers lock poisoned");
            workers.drain().collect()
        };
        for (root_id, handle) in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("coordinator for {root_id} panicked"))?;
        }
        Ok(())
    }

    /// Check the data-model invariants over the current snapshot.
    pub fn check_invariants(&self) -> Vec<String> {
        let tasks = self.status("*");
        let live: HashSet<String> = self.inner.registry.live_task_ids().into_iter().collect();
        invariants::validate_invariants(&tasks, &live)
    }

    fn port_for(&self, task_id: &str) -> Result<Arc<dyn SessionPort>, OverseerError> {
        match self.inner.registry.get(task_id) {
            Some(port) => Ok(port),
            None => {
                let known = !self
                    .inner
                    .tree
                    .lock()
                    .expect("task tree lock poisoned")
                    .snapshot(task_id)
                    .is_empty();
                if known {
                    Err(OverseerError::SessionNotLive(task_id.to_string()))
                } else {
                    Err(OverseerError::UnknownTask(task_id.to_string()))
                }
            }
        }
    }

    fn record(&self, task_id: &str, kind: &str, payload: Value, notify: bool) {
        record_event(&self.inner, task_id, kind, payload, notify);
    }
}

/// Everything a coordinator needs to run one submission to completion.
struct RunPlan {
    root_id: String,
    prompt: String,
    options: TaskOptions,
    fan_out: u32,
    max_depth: u32,
    /// Children created at submit time (parallel-style patterns).
    children: Vec<String>,
}

/// Append to the persistence sink (never fatal) and push to live monitors.
fn record_event(inner: &Inner, task_id: &str, kind: &str, payload: Value, notify: bool) {
    let event = Event {
        ts_ms: now_ms(),
        task_id: task_id.to_string(),
        kind: kind.to_string(),
        payload,
    };
    if let Err(err) = inner.sink.append(&event) {
        warn!(error = %err, kind, "event sink unavailable; continuing");
    }
    if notify {
        inner.notifier.publish(&event);
    }
}

/// Run one submission: the root alone, or a decomposition of it.
fn coordinate(inner: &Arc<Inner>, plan: RunPlan) {
    use DecompositionPattern as P;
    match plan.options.decomposition_pattern {
        P::None => {
            let outcome = run_task(inner, &plan.root_id, &plan.prompt, &plan.options, true);
            debug!(
                task_id = %plan.root_id,
                completed = outcome.completed,
                reward = outcome.reward,
                "root task finished"
            );
        }
        P::Decompose | P::Parallel => {
            run_children_parallel(inner, &plan);
            finish_parent(inner, &plan);
        }
        P::Sequential => {
            run_children_sequential(inner, &plan);
            finish_parent(inner, &plan);
        }
        P::Recursive => {
            run_children_parallel(inner, &plan);
            recursive_continuation(inner, &plan);
            finish_parent(inner, &plan);
        }
    }
}

fn run_children_parallel(inner: &Arc<Inner>, plan: &RunPlan) {
    let mut handles = Vec::new();
    for child_id in &plan.children {
        let inner = inner.clone();
        let child_id = child_id.clone();
        let options = plan.options.clone();
        let prompt = {
            let tree = inner.tree.lock().expect("task tree lock poisoned");
            tree.get(&child_id).map(|t| t.prompt.clone()).unwrap_or_default()
        };
        let handle = thread::Builder::new()
            .name(format!("overseer-task-{child_id}"))
            .spawn(move || {
                run_task(&inner, &child_id, &prompt, &options, false);
            });
        match handle {
            Ok(handle) => handles.push(handle),
            Err(err) => warn!(error = %err, "failed to spawn child worker"),
        }
    }
    for handle in handles {
        if handle.join().is_err() {
            warn!("child worker panicked");
        }
    }
}

fn run_children_sequential(inner: &Arc<Inner>, plan: &RunPlan) {
    let mut previous_summary: Option<String> = None;
    for index in 1..=plan.fan_out {
        let child_prompt = match inner.prompts.render_child(
            DecompositionPattern::Sequential,
            &plan.prompt,
            index,
            plan.fan_out,
            plan.max_depth <= 1,
            previous_summary.as_deref(),
        ) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(error = %err, "child prompt render failed");
                break;
            }
        };
        let child_id = {
            let mut tree = inner.tree.lock().expect("task tree lock poisoned");
            let _ = tree.take_untried_action(&plan.root_id);
            match tree.insert_child(&plan.root_id, &child_prompt, plan.max_depth, now_ms()) {
                Ok(id) => id,
                Err(err) => {
                    warn!(error = %err, "sequential child creation rejected");
                    break;
                }
            }
        };
        record_event(
            inner,
            &child_id,
            kinds::TASK_SUBMITTED,
            json!({"parent": plan.root_id, "step": index}),
            plan.options.live_notify,
        );
        let outcome = run_task(inner, &child_id, &child_prompt, &plan.options, false);
        if !outcome.completed {
            // A failed step invalidates the rest of the sequence.
            break;
        }
        previous_summary = Some(outcome.summary);
    }
}

/// Keep exploring under the best child until the quality bar is met or the
/// untried actions run out. Grandchildren run one at a time; width and depth
/// stay bounded by fan-out and max depth.
fn recursive_continuation(inner: &Arc<Inner>, plan: &RunPlan) {
    loop {
        let selected = {
            let tree = inner.tree.lock().expect("task tree lock poisoned");
            if tree.is_terminal_for_policy(&plan.root_id, &inner.params) {
                break;
            }
            match tree.select_child(&plan.root_id, &inner.params) {
                Some(id) => id,
                None => break,
            }
        };
        let (action, depth) = {
            let mut tree = inner.tree.lock().expect("task tree lock poisoned");
            let depth = tree.get(&selected).map(|t| t.depth).unwrap_or(0);
            match tree.take_untried_action(&selected) {
                Ok(action) => (action, depth),
                Err(_) => break,
            }
        };
        let Some(action) = action else { break };
        if depth + 1 > plan.max_depth {
            break;
        }
        let index = action
            .rsplit(':')
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(1);
        let parent_prompt = {
            let tree = inner.tree.lock().expect("task tree lock poisoned");
            tree.get(&selected).map(|t| t.prompt.clone()).unwrap_or_default()
        };
        let child_prompt = match inner.prompts.render_child(
            DecompositionPattern::Recursive,
            &parent_prompt,
            index,
            plan.fan_out,
            depth + 1 >= plan.max_depth,
            None,
        ) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(error = %err, "recursive prompt render failed");
                break;
            }
        };
        let child_id = {
            let mut tree = inner.tree.lock().expect("task tree lock poisoned");
            match tree.insert_child(&selected, &child_prompt, plan.max_depth, now_ms()) {
                Ok(id) => id,
                Err(_) => break,
            }
        };
        record_event(
            inner,
            &child_id,
            kinds::TASK_SUBMITTED,
            json!({"parent": selected, "action": action}),
            plan.options.live_notify,
        );
        run_task(inner, &child_id, &child_prompt, &plan.options, false);
    }
}

/// Merge surviving child workspaces, settle the parent status, and reclaim.
fn finish_parent(inner: &Arc<Inner>, plan: &RunPlan) {
    let notify = plan.options.live_notify;
    let children = {
        let tree = inner.tree.lock().expect("task tree lock poisoned");
        tree.child_ids(&plan.root_id)
    };

    let mut merged = Vec::new();
    let mut conflicts = Vec::new();
    for child_id in &children {
        let handle = {
            let mut handles = inner.handles.lock().expect("handles lock poisoned");
            handles.remove(child_id)
        };
        let Some(mut handle) = handle else { continue };
        if handle.merge_state == Some(crate::io::workspace::MergeState::Discarded) {
            let mut workspaces = inner.workspaces.lock().expect("workspace lock poisoned");
            if let Err(err) = workspaces.reclaim(&handle) {
                warn!(error = %err, "reclaim of discarded workspace failed");
            }
            continue;
        }
        let mut workspaces = inner.workspaces.lock().expect("workspace lock poisoned");
        match workspaces.merge(&mut handle) {
            Ok(files) => {
                merged.extend(files);
                if let Err(err) = workspaces.reclaim(&handle) {
                    warn!(error = %err, "reclaim after merge failed");
                }
            }
            Err(err) => {
                // Conflicts stay on disk for explicit resolution.
                warn!(child = %child_id, error = %err, "child workspace left unmerged");
                conflicts.push(json!({"child": child_id, "error": err.to_string()}));
            }
        }
    }

    let merge_event = HookEvent {
        kind: HookEventKind::ParallelMerge,
        task_id: plan.root_id.clone(),
        payload: json!({"merged": merged, "conflicts": conflicts}),
    };
    dispatch(&inner.hooks, &merge_event);
    record_event(
        inner,
        &plan.root_id,
        merge_event.kind.event_name(),
        merge_event.payload.clone(),
        notify,
    );

    let (status, completed_children) = {
        let tree = inner.tree.lock().expect("task tree lock poisoned");
        let completed = children
            .iter()
            .filter(|id| {
                tree.get(id)
                    .map(|t| t.status == TaskStatus::Completed)
                    .unwrap_or(false)
            })
            .count();
        let status = if completed > 0 && conflicts.is_empty() {
            TaskStatus::Completed
        } else if completed > 0 {
            // Verified work exists but could not all be merged.
            TaskStatus::Intervened
        } else {
            TaskStatus::Failed
        };
        (status, completed)
    };
    // A coordinator parent has no session of its own, so `intervened` would
    // violate the session-liveness invariant; fold it into failed.
    let status = if status == TaskStatus::Intervened {
        TaskStatus::Failed
    } else {
        status
    };
    {
        let mut tree = inner.tree.lock().expect("task tree lock poisoned");
        let _ = tree.set_status(&plan.root_id, status, now_ms());
    }
    let kind = if status == TaskStatus::Completed {
        HookEventKind::ExecutionCompleted
    } else {
        HookEventKind::ExecutionFailed
    };
    let event = HookEvent {
        kind,
        task_id: plan.root_id.clone(),
        payload: json!({"completed_children": completed_children, "children": children.len()}),
    };
    dispatch(&inner.hooks, &event);
    record_event(
        inner,
        &plan.root_id,
        kind.event_name(),
        event.payload.clone(),
        notify,
    );
}

/// Run one task end to end on the calling thread.
///
/// `settle_workspace` controls whether this worker merges and reclaims its
/// own workspace (single root task) or leaves the handle for a coordinator
/// (decomposed child).
#[instrument(skip_all, fields(task_id))]
fn run_task(
    inner: &Arc<Inner>,
    task_id: &str,
    prompt: &str,
    options: &TaskOptions,
    settle_workspace: bool,
) -> WorkerOutcome {
    let notify = options.live_notify;
    let failed = |summary: &str| WorkerOutcome {
        completed: false,
        reward: -1.0,
        summary: summary.to_string(),
    };

    // Workspace first: a task without isolation never starts a session.
    let handle = {
        let mut workspaces = inner.workspaces.lock().expect("workspace lock poisoned");
        workspaces.allocate(task_id)
    };
    let mut handle = match handle {
        Ok(handle) => handle,
        Err(err) => {
            warn!(error = %err, "workspace allocation failed");
            set_terminal(inner, task_id, TaskStatus::Failed, notify, json!({"error": err.to_string()}));
            return failed("workspace allocation failed");
        }
    };
    {
        let mut tree = inner.tree.lock().expect("task tree lock poisoned");
        let _ = tree.set_workspace_ref(task_id, Some(handle.name.clone()));
    }
    record_event(
        inner,
        task_id,
        kinds::WORKSPACE_ALLOCATED,
        json!({"name": handle.name, "mode": handle.mode}),
        notify,
    );

    // Validation gate: EXECUTION_STARTED fires only if no hook objects.
    let started = HookEvent {
        kind: HookEventKind::ExecutionStarted,
        task_id: task_id.to_string(),
        payload: json!({"prompt": prompt, "workspace": handle.name}),
    };
    let outcome = dispatch(&inner.hooks, &started);
    if !outcome.proceeded() {
        info!(decision = ?outcome.decision, "execution vetoed before start");
        {
            let mut workspaces = inner.workspaces.lock().expect("workspace lock poisoned");
            let _ = workspaces.finalize(&mut handle, TaskOutcome::Failure);
            let _ = workspaces.reclaim(&handle);
        }
        set_terminal(inner, task_id, TaskStatus::Cancelled, notify, json!({"decision": format!("{:?}", outcome.decision)}));
        return failed("execution vetoed");
    }
    record_event(
        inner,
        task_id,
        started.kind.event_name(),
        outcome.payload.clone(),
        notify,
    );

    let session_id = format!("s-{task_id}");
    {
        let mut tree = inner.tree.lock().expect("task tree lock poisoned");
        let _ = tree.set_status(task_id, TaskStatus::Running, now_ms());
        let _ = tree.set_session_ref(task_id, Some(session_id.clone()));
    }

    let request = SessionRequest {
        session_id: session_id.clone(),
        task_id: task_id.to_string(),
        command: inner.config.session.command.clone(),
        workspace: handle.path.clone(),
        env: inner.config.session.env.clone(),
        prompt: prompt.to_string(),
    };
    record_event(
        inner,
        task_id,
        kinds::SESSION_OPENED,
        json!({"session": session_id, "command": request.command}),
        notify,
    );

    // Per-session scanner state. The observer runs on this worker thread for
    // every chunk in order, so dispatch stays serialized per task.
    let mut window = RollingWindow::new(inner.config.scanner.window_bytes);
    let mut engine = RuleEngine::new(inner.rules.clone());
    let mut intervened = false;
    let inner_obs = inner.clone();
    let task_obs = task_id.to_string();
    let mut observer = move |chunk: &[u8]| -> Vec<SessionCommand> {
        observe_chunk(
            &inner_obs,
            &task_obs,
            chunk,
            &mut window,
            &mut engine,
            &mut intervened,
            notify,
        )
    };

    let report = inner
        .runner
        .run(&request, &inner.config.session, &inner.registry, &mut observer);

    let report = match report {
        Ok(report) => report,
        Err(err) => {
            warn!(error = %err, "session failed to run");
            inner.registry.deregister(task_id);
            {
                let mut workspaces = inner.workspaces.lock().expect("workspace lock poisoned");
                let _ = workspaces.finalize(&mut handle, TaskOutcome::Failure);
                let _ = workspaces.reclaim(&handle);
            }
            set_terminal(inner, task_id, TaskStatus::Failed, notify, json!({"error": err.to_string()}));
            let failed_event = HookEvent {
                kind: HookEventKind::ExecutionFailed,
                task_id: task_id.to_string(),
                payload: json!({"error": err.to_string()}),
            };
            dispatch(&inner.hooks, &failed_event);
            return failed("session spawn failed");
        }
    };

    inner
        .final_output
        .lock()
        .expect("output lock poisoned")
        .insert(task_id.to_string(), report.output_tail.clone());
    record_event(
        inner,
        task_id,
        kinds::SESSION_CLOSED,
        json!({"exit_code": report.exit.code, "forced": report.exit.forced, "truncated": report.truncated}),
        notify,
    );

    finish_task(inner, task_id, &mut handle, &report.exit, options, settle_workspace)
}

/// Observe one output chunk: record it, dispatch stream hooks, evaluate
/// rules, and translate at most one firing into session commands.
fn observe_chunk(
    inner: &Arc<Inner>,
    task_id: &str,
    chunk: &[u8],
    window: &mut RollingWindow,
    engine: &mut RuleEngine,
    intervened: &mut bool,
    notify: bool,
) -> Vec<SessionCommand> {
    window.push(chunk);
    let preview = String::from_utf8_lossy(chunk);
    let preview = preview.chars().take(200).collect::<String>();
    record_event(
        inner,
        task_id,
        kinds::OUTPUT_CHUNK,
        json!({"bytes": chunk.len(), "preview": preview}),
        notify,
    );
    let stream_event = HookEvent {
        kind: HookEventKind::ExecutionStream,
        task_id: task_id.to_string(),
        payload: json!({"bytes": chunk.len(), "preview": preview}),
    };
    dispatch(&inner.hooks, &stream_event);

    if engine.is_empty() {
        return Vec::new();
    }
    let decision = engine.evaluate(window.text(), now_ms());
    for (matched, reason) in &decision.suppressed {
        record_intervention(inner, task_id, matched, Some(*reason), notify);
    }
    let Some((matched, action)) = decision.fired else {
        return Vec::new();
    };

    if !*intervened {
        *intervened = true;
        let mut tree = inner.tree.lock().expect("task tree lock poisoned");
        let _ = tree.set_status(task_id, TaskStatus::Intervened, now_ms());
    }
    record_intervention(inner, task_id, &matched, None, notify);
    let intervention_event = HookEvent {
        kind: HookEventKind::ExecutionIntervention,
        task_id: task_id.to_string(),
        payload: json!({"rule": matched.rule_id, "matched": matched.matched}),
    };
    dispatch(&inner.hooks, &intervention_event);

    match action {
        RuleAction::Send { input } => vec![SessionCommand::Write(input.into_bytes())],
        RuleAction::Interrupt => vec![SessionCommand::Interrupt],
        RuleAction::Terminate => vec![SessionCommand::Terminate],
    }
}

fn record_intervention(
    inner: &Arc<Inner>,
    task_id: &str,
    matched: &RuleMatch,
    suppressed: Option<SuppressReason>,
    notify: bool,
) {
    record_event(
        inner,
        task_id,
        kinds::INTERVENTION,
        json!({
            "rule": matched.rule_id,
            "matched": matched.matched,
            "fired": suppressed.is_none(),
            "suppressed": suppressed,
        }),
        notify,
    );
}

/// Verification, reward, backpropagation, pruning, workspace settling.
fn finish_task(
    inner: &Arc<Inner>,
    task_id: &str,
    handle: &mut WorkspaceHandle,
    exit: &ExitSummary,
    options: &TaskOptions,
    settle_workspace: bool,
) -> WorkerOutcome {
    let notify = options.live_notify;
    let verify_request = VerifyRequest {
        workspace: handle.path.clone(),
        baseline: handle.baseline.clone(),
        exit: *exit,
    };
    let evidence = match inner.verifier.verify(&verify_request) {
        Ok(evidence) => evidence,
        Err(err) => {
            // Held unverified: never completed, no reward, branch not pruned.
            // The workspace stays on disk so evidence can be gathered later.
            warn!(error = %err, "verification collaborator unavailable");
            record_event(
                inner,
                task_id,
                kinds::VERIFICATION_UNAVAILABLE,
                json!({"error": err.to_string()}),
                notify,
            );
            {
                let mut workspaces = inner.workspaces.lock().expect("workspace lock poisoned");
                let _ = workspaces.finalize(handle, TaskOutcome::Failure);
            }
            set_terminal(inner, task_id, TaskStatus::Failed, notify, json!({"reason": "unverified"}));
            let event = HookEvent {
                kind: HookEventKind::ExecutionFailed,
                task_id: task_id.to_string(),
                payload: json!({"reason": "verification unavailable"}),
            };
            dispatch(&inner.hooks, &event);
            return WorkerOutcome {
                completed: false,
                reward: 0.0,
                summary: "verification unavailable".to_string(),
            };
        }
    };

    let reward = policy::reward_from_evidence(&evidence);
    record_event(
        inner,
        task_id,
        kinds::VERIFICATION,
        json!({"evidence": evidence, "reward": reward}),
        notify,
    );
    {
        let mut tree = inner.tree.lock().expect("task tree lock poisoned");
        let _ = tree.record_outcome(task_id, reward, &inner.params, now_ms());
    }

    let completed = reward >= 0.0 && exit.code == Some(0) && !exit.forced;
    if completed {
        let merge_outcome = {
            let mut workspaces = inner.workspaces.lock().expect("workspace lock poisoned");
            match workspaces.finalize(handle, TaskOutcome::Success) {
                Ok(()) if settle_workspace => {
                    let result = workspaces.merge(handle).map(|files| {
                        let _ = workspaces.reclaim(handle);
                        files
                    });
                    Some(result)
                }
                Ok(()) => None,
                Err(err) => Some(Err(err)),
            }
        };
        match merge_outcome {
            Some(Ok(files)) => {
                record_event(
                    inner,
                    task_id,
                    kinds::WORKSPACE_MERGED,
                    json!({"files": files}),
                    notify,
                );
            }
            Some(Err(err)) => {
                // Conflict or finalize fault: surfaced, never silently resolved.
                warn!(error = %err, "workspace left unmerged for resolution");
                record_event(
                    inner,
                    task_id,
                    kinds::WORKSPACE_FINALIZED,
                    json!({"error": err.to_string()}),
                    notify,
                );
            }
            None => {
                record_event(
                    inner,
                    task_id,
                    kinds::WORKSPACE_FINALIZED,
                    json!({"state": handle.merge_state}),
                    notify,
                );
                let mut handles = inner.handles.lock().expect("handles lock poisoned");
                handles.insert(task_id.to_string(), handle.clone());
            }
        }
        set_terminal(inner, task_id, TaskStatus::Completed, notify, json!({"reward": reward}));
        let event = HookEvent {
            kind: HookEventKind::ExecutionCompleted,
            task_id: task_id.to_string(),
            payload: json!({"reward": reward}),
        };
        dispatch(&inner.hooks, &event);
        let summary = summarize_evidence(&evidence);
        return WorkerOutcome {
            completed: true,
            reward,
            summary,
        };
    }

    // Negative outcome: discard the workspace and prune the branch.
    {
        let mut workspaces = inner.workspaces.lock().expect("workspace lock poisoned");
        let _ = workspaces.finalize(handle, TaskOutcome::Failure);
        let _ = workspaces.reclaim(handle);
    }
    let pruned = {
        let mut tree = inner.tree.lock().expect("task tree lock poisoned");
        let _ = tree.set_status(task_id, TaskStatus::Failed, now_ms());
        if reward <= -1.0 {
            tree.prune(task_id, now_ms()).unwrap_or_default()
        } else {
            Vec::new()
        }
    };
    if !pruned.is_empty() || reward <= -1.0 {
        record_event(
            inner,
            task_id,
            kinds::BRANCH_PRUNED,
            json!({"cancelled": pruned}),
            notify,
        );
    }
    record_event(
        inner,
        task_id,
        HookEventKind::ExecutionFailed.event_name(),
        json!({"reward": reward, "exit_code": exit.code, "forced": exit.forced}),
        notify,
    );
    let event = HookEvent {
        kind: HookEventKind::ExecutionFailed,
        task_id: task_id.to_string(),
        payload: json!({"reward": reward}),
    };
    dispatch(&inner.hooks, &event);
    WorkerOutcome {
        completed: false,
        reward,
        summary: "failed".to_string(),
    }
}

fn set_terminal(inner: &Inner, task_id: &str, status: TaskStatus, notify: bool, payload: Value) {
    {
        let mut tree = inner.tree.lock().expect("task tree lock poisoned");
        let _ = tree.set_status(task_id, status, now_ms());
    }
    let kind = match status {
        TaskStatus::Completed => HookEventKind::ExecutionCompleted.event_name(),
        _ => HookEventKind::ExecutionFailed.event_name(),
    };
    record_event(inner, task_id, kind, payload, notify);
}

fn summarize_evidence(evidence: &EvidenceRecord) -> String {
    let mut names: Vec<&str> = evidence
        .files_created
        .iter()
        .chain(evidence.files_modified.iter())
        .map(|a| a.path.as_str())
        .take(8)
        .collect();
    names.sort_unstable();
    format!(
        "{} files changed ({}), {} checks passed, {} failed",
        evidence.artifact_count(),
        names.join(", "),
        evidence.checks_passed,
        evidence.checks_failed
    )
}
