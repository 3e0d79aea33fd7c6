use std::sync::Arc;

use serde_yaml::Value;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::actions::{Dispatcher, ParsedAction, action_dir, parse_link};
use crate::coerce::{coerce_to_bool, coerce_to_string};
use crate::context::{BuildResult, RunContext};
use crate::diag::ValidationReport;
use crate::node::{NodeSpec, ResolvedNode};
use crate::settings::PipelineSettings;
use crate::template::{expand, expand_keys};

const STRING_KEYS: [&str; 7] = [
    "action",
    "before_message",
    "after_message",
    "fail_message",
    "success_message",
    "dir",
    "build_name",
];
const BOOL_KEYS: [&str; 4] = ["ignore_fail", "stop_on_fail", "success_only", "fail_only"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    /// Validate everything, touch nothing.
    Check,
    Execute { dry_run: bool },
}

#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub ok: bool,
    /// True when `stop_on_fail` terminated the run early.
    pub aborted: bool,
    /// Aggregated problems; only populated by the check pass.
    pub report: ValidationReport,
}

/// A stage's actions after structural validation.
struct StageData {
    name: String,
    parallel: bool,
    actions: Vec<Value>,
}

/// An action after structural validation and templating.
#[derive(Debug)]
struct ActionData {
    link: String,
    node: Option<NodeSpec>,
    dir: Option<String>,
    build_name: Option<String>,
    before_message: Option<String>,
    after_message: Option<String>,
    success_message: Option<String>,
    fail_message: Option<String>,
    ignore_fail: bool,
    stop_on_fail: bool,
    success_only: bool,
    fail_only: bool,
}

#[derive(Debug, Clone, Copy)]
struct ActionStatus {
    passed: bool,
    abort: bool,
}

/// Walks `stages[*].actions[*]` in declaration order, in one of two modes
/// sharing the same validation path. Stages run sequentially; actions
/// within a stage run sequentially or as a task group per the stage's
/// `parallel` flag.
#[derive(Clone)]
pub struct Walker {
    settings: Arc<PipelineSettings>,
    dispatcher: Arc<Dispatcher>,
}

impl Walker {
    pub fn new(settings: Arc<PipelineSettings>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            settings,
            dispatcher,
        }
    }

    pub async fn walk(&self, ctx: &RunContext, mode: WalkMode) -> WalkOutcome {
        let mut outcome = WalkOutcome {
            ok: true,
            ..WalkOutcome::default()
        };

        if self.settings.stages.is_empty() {
            match mode {
                WalkMode::Execute { .. } => info!("No stages to execute in pipeline config."),
                WalkMode::Check => debug!("No stages to check in pipeline config."),
            }
            return outcome;
        }

        for (stage_index, raw) in self.settings.stages.iter().enumerate() {
            let mut stage_report = ValidationReport::default();
            let stage = self.validate_stage(stage_index, raw, ctx, &mut stage_report);

            match mode {
                WalkMode::Check => {
                    if let Some(stage) = &stage {
                        for (index, action) in stage.actions.iter().enumerate() {
                            self.check_action(&stage.name, index, action, ctx, &mut stage_report);
                        }
                    }
                    if !stage_report.is_ok() {
                        outcome.ok = false;
                    }
                    outcome.report.merge(stage_report);
                }
                WalkMode::Execute { dry_run } => {
                    let Some(stage) = stage else {
                        outcome.ok = false;
                        ctx.fail(format!("Stage #{} failed validation", stage_index + 1));
                        ctx.record_stage(
                            format!("stage #{}", stage_index + 1),
                            false,
                            "invalid stage",
                        );
                        continue;
                    };

                    let (passed, aborted) = self.execute_stage(&stage, ctx, dry_run).await;
                    let detail = format!(
                        "{} action(s){}",
                        stage.actions.len(),
                        if stage.parallel { " in parallel" } else { "" }
                    );
                    ctx.record_stage(&stage.name, passed, detail);
                    if !passed {
                        outcome.ok = false;
                    }
                    if aborted {
                        outcome.aborted = true;
                        return outcome;
                    }
                }
            }
        }

        outcome
    }

    /// Stage structural validation: `name` and `actions` present and well
    /// typed, `parallel` boolean-convertible, name templated.
    fn validate_stage(
        &self,
        stage_index: usize,
        raw: &Value,
        ctx: &RunContext,
        report: &mut ValidationReport,
    ) -> Option<StageData> {
        let position = stage_index + 1;
        let Value::Mapping(map) = raw else {
            report.error(format!("Stage #{position} is not a mapping"));
            return None;
        };

        let name = match map.get("name").and_then(coerce_to_string) {
            Some(name) => {
                let expansion = expand(&name, &ctx.env_snapshot(), &ctx.builtins_snapshot());
                if !expansion.ok {
                    for problem in &expansion.problems {
                        report.error(format!("Stage #{position} name: {problem}"));
                    }
                }
                expansion.value
            }
            None => {
                report.error(format!("Stage #{position} has no usable 'name' key"));
                return None;
            }
        };

        let parallel = match map.get("parallel") {
            None => false,
            Some(raw) => match coerce_to_bool(raw) {
                Some(b) => b,
                None => {
                    report.error(format!("Stage '{name}': 'parallel' is not a boolean"));
                    return None;
                }
            },
        };

        let actions = match map.get("actions") {
            Some(Value::Sequence(actions)) if !actions.is_empty() => actions.clone(),
            Some(Value::Sequence(_)) => {
                report.error(format!("Stage '{name}': 'actions' is empty"));
                return None;
            }
            Some(_) => {
                report.error(format!("Stage '{name}': 'actions' is not a list"));
                return None;
            }
            None => {
                report.error(format!("Stage '{name}' has no 'actions' key"));
                return None;
            }
        };

        Some(StageData {
            name,
            parallel,
            actions,
        })
    }

    /// Action structural validation shared by both modes: key type checks,
    /// templating of string keys, node spec canonicalization.
    fn validate_action(
        &self,
        stage: &str,
        index: usize,
        raw: &Value,
        ctx: &RunContext,
        report: &mut ValidationReport,
    ) -> Option<ActionData> {
        let at = format!("{stage}[{index}]");
        let Value::Mapping(raw_map) = raw else {
            report.error(format!("Action {at} is not a mapping"));
            return None;
        };

        let env = ctx.env_snapshot();
        let extras = ctx.builtins_snapshot();

        let mut map = raw_map.clone();
        for key in STRING_KEYS {
            if let Some(value) = map.get(key)
                && coerce_to_string(value).is_none()
            {
                report.error(format!("Action {at}: key '{key}' is not string-convertible"));
            }
        }
        let mut problems = Vec::new();
        let mut keys: Vec<&str> = STRING_KEYS.to_vec();
        if matches!(map.get("node"), Some(Value::String(_))) {
            keys.push("node");
        }
        let ok = expand_keys(&mut map, &keys, &env, &extras, true, &mut problems);
        if !ok {
            for problem in problems {
                report.error(format!("Action {at}: {problem}"));
            }
        }

        let mut bools = [false; BOOL_KEYS.len()];
        for (slot, key) in bools.iter_mut().zip(BOOL_KEYS) {
            *slot = match map.get(key) {
                None => false,
                Some(raw) => match coerce_to_bool(raw) {
                    Some(b) => b,
                    None => {
                        report.error(format!(
                            "Action {at}: key '{key}' is not boolean-convertible"
                        ));
                        false
                    }
                },
            };
        }
        let [ignore_fail, stop_on_fail, success_only, fail_only] = bools;
        if success_only && fail_only {
            report.error(format!(
                "Action {at}: 'success_only' and 'fail_only' are mutually exclusive"
            ));
        }

        let link = match map.get("action").and_then(coerce_to_string) {
            Some(link) => link,
            None => {
                report.error(format!("Action {at} has no usable 'action' key"));
                return None;
            }
        };

        let node = match map.get("node") {
            None => None,
            Some(raw) => {
                let before = report.errors.len();
                let spec = NodeSpec::parse(raw, report);
                if report.errors.len() > before {
                    return None;
                }
                spec
            }
        };

        if !report.is_ok() {
            return None;
        }

        let get = |key: &str| map.get(key).and_then(coerce_to_string);
        Some(ActionData {
            link,
            node,
            dir: get("dir"),
            build_name: get("build_name"),
            before_message: get("before_message"),
            after_message: get("after_message"),
            success_message: get("success_message"),
            fail_message: get("fail_message"),
            ignore_fail,
            stop_on_fail,
            success_only,
            fail_only,
        })
    }

    fn check_action(
        &self,
        stage: &str,
        index: usize,
        raw: &Value,
        ctx: &RunContext,
        report: &mut ValidationReport,
    ) {
        let Some(data) = self.validate_action(stage, index, raw, ctx, report) else {
            return;
        };
        parse_link(
            &data.link,
            &self.settings,
            &ctx.env_snapshot(),
            &ctx.builtins_snapshot(),
            report,
        );
    }

    async fn execute_stage(
        &self,
        stage: &StageData,
        ctx: &RunContext,
        dry_run: bool,
    ) -> (bool, bool) {
        let mut passed = true;
        let mut aborted = false;

        if stage.parallel {
            let mut set = JoinSet::new();
            for (index, action) in stage.actions.iter().enumerate() {
                let walker = self.clone();
                let stage_name = stage.name.clone();
                let action = action.clone();
                let ctx = ctx.clone();
                set.spawn(async move {
                    walker
                        .execute_action(&stage_name, index, &action, &ctx, dry_run)
                        .await
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(status) => {
                        if !status.passed {
                            passed = false;
                        }
                        if status.abort {
                            aborted = true;
                            set.abort_all();
                        }
                    }
                    Err(err) if err.is_cancelled() => {}
                    Err(err) => {
                        warn!(stage = stage.name.as_str(), "Action task panicked: {err}");
                        passed = false;
                    }
                }
            }
        } else {
            for (index, action) in stage.actions.iter().enumerate() {
                let status = self
                    .execute_action(&stage.name, index, action, ctx, dry_run)
                    .await;
                if !status.passed {
                    passed = false;
                }
                if status.abort {
                    aborted = true;
                    break;
                }
            }
        }

        (passed, aborted)
    }

    /// One action, execute mode: gate, scope, dispatch, report.
    async fn execute_action(
        &self,
        stage: &str,
        index: usize,
        raw: &Value,
        ctx: &RunContext,
        dry_run: bool,
    ) -> ActionStatus {
        let at = format!("{stage}[{index}]");
        let mut report = ValidationReport::default();

        let Some(data) = self.validate_action(stage, index, raw, ctx, &mut report) else {
            ctx.fail(format!("Action {at} failed validation"));
            ctx.record_action(&at, false, "invalid action");
            return ActionStatus {
                passed: false,
                abort: false,
            };
        };

        let parsed = parse_link(
            &data.link,
            &self.settings,
            &ctx.env_snapshot(),
            &ctx.builtins_snapshot(),
            &mut report,
        );
        let Some(parsed) = parsed else {
            return self.conclude(ctx, &at, &data, Err(report.errors.join("; ")));
        };
        let detail = format!("{}: {}", parsed.link, parsed.discriminator);

        // Node resolution precedes gating: an unmatched pattern is an
        // error row even for an action the gate would skip.
        let node = match &data.node {
            None => ResolvedNode::Any,
            Some(spec) => {
                let registry = match self.dispatcher.deps.nodes.nodes().await {
                    Ok(nodes) => nodes,
                    Err(err) => {
                        return self.conclude(
                            ctx,
                            &at,
                            &data,
                            Err(format!("Node registry failed: {err}")),
                        );
                    }
                };
                match spec.resolve(&registry) {
                    Some(node) => node,
                    None => {
                        return self.conclude(
                            ctx,
                            &at,
                            &data,
                            Err(format!("No node matches spec {spec:?}")),
                        );
                    }
                }
            }
        };

        // Conditional gating against the result so far.
        let result = ctx.result();
        if (data.success_only && result == BuildResult::Failure)
            || (data.fail_only && result != BuildResult::Failure)
        {
            info!(
                action = at.as_str(),
                result = result.as_str(),
                "Skipping action due to its run-result condition"
            );
            ctx.record_action(&at, true, detail);
            return ActionStatus {
                passed: true,
                abort: false,
            };
        }

        if let Some(message) = &data.before_message {
            info!("{message}");
        }

        if let Some(name) = &data.build_name {
            ctx.set_build_name(name);
            if let Err(err) = self.dispatcher.deps.host.rename_build(name).await {
                warn!(action = at.as_str(), "Failed to rename build: {err}");
            }
        }

        let host = &self.dispatcher.deps.host;
        match &node {
            ResolvedNode::Name(name) if *name != host.current_node() => {
                info!(action = at.as_str(), node = name.as_str(), "Re-dispatching action");
                if let Err(err) = host.lease_node(name, false).await {
                    return self.conclude(ctx, &at, &data, Err(format!("Node lease failed: {err}")));
                }
            }
            ResolvedNode::Label(label) => {
                info!(action = at.as_str(), label = label.as_str(), "Re-dispatching action");
                if let Err(err) = host.lease_node(label, true).await {
                    return self.conclude(ctx, &at, &data, Err(format!("Node lease failed: {err}")));
                }
            }
            _ => {}
        }

        let dir = action_dir(&host.workspace(), data.dir.as_deref());
        let invoked = self
            .dispatcher
            .run(&parsed, ctx, dir.as_deref(), dry_run)
            .await;

        if let Some(message) = &data.after_message {
            info!("{message}");
        }

        self.conclude_parsed(ctx, &at, &data, &parsed, invoked.map_err(|e| e.to_string()))
    }

    /// Failure handling and reporting for an action that never resolved to
    /// an operation.
    fn conclude(
        &self,
        ctx: &RunContext,
        at: &str,
        data: &ActionData,
        result: Result<(), String>,
    ) -> ActionStatus {
        let detail = format!("{}: unresolved", data.link);
        self.finish(ctx, at, data, &detail, result)
    }

    fn conclude_parsed(
        &self,
        ctx: &RunContext,
        at: &str,
        data: &ActionData,
        parsed: &ParsedAction,
        result: Result<(), String>,
    ) -> ActionStatus {
        let detail = format!("{}: {}", parsed.link, parsed.discriminator);
        self.finish(ctx, at, data, &detail, result)
    }

    fn finish(
        &self,
        ctx: &RunContext,
        at: &str,
        data: &ActionData,
        detail: &str,
        result: Result<(), String>,
    ) -> ActionStatus {
        match result {
            Ok(()) => {
                if let Some(message) = &data.success_message {
                    info!("{message}");
                }
                ctx.record_action(at, true, detail);
                ActionStatus {
                    passed: true,
                    abort: false,
                }
            }
            Err(error) => {
                if let Some(message) = &data.fail_message {
                    warn!("{message}");
                }
                // The error row is recorded even when the failure is
                // ignored or escalated.
                ctx.record_action(at, false, detail);

                if data.ignore_fail {
                    info!(action = at, "Ignoring action failure: {error}");
                    return ActionStatus {
                        passed: true,
                        abort: false,
                    };
                }

                ctx.fail(format!("Action {at} ({}) failed: {error}", data.link));

                if data.stop_on_fail {
                    ctx.fail(format!(
                        "Terminating current pipeline run due to an error in {at} action."
                    ));
                    return ActionStatus {
                        passed: false,
                        abort: true,
                    };
                }

                ActionStatus {
                    passed: false,
                    abort: false,
                }
            }
        }
    }
}
