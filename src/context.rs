use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::report::{ReportTable, RunReport};

pub type Environment = BTreeMap<String, String>;

/// Built-in keys mirrored into the variable namespace so templates and
/// scripts can read them.
pub const BUILTIN_REPORT: &str = "MULTILINE_REPORT";
pub const BUILTIN_REPORT_STAGES: &str = "MULTILINE_REPORT_STAGES";
pub const BUILTIN_RUNNER_INSTALLATION: &str = "REMOTE_RUNNER_INSTALLATION";
pub const BUILTIN_BUILD_RESULT: &str = "BUILD_RESULT";

/// Result of the run so far. Conditional gating reads this; actions and
/// the resolver write it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuildResult {
    Success,
    Failure,
}

impl BuildResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildResult::Success => "SUCCESS",
            BuildResult::Failure => "FAILURE",
        }
    }
}

#[derive(Debug)]
struct RunState {
    env: Environment,
    builtins: BTreeMap<String, String>,
    action_report: ReportTable,
    stage_report: ReportTable,
    result: BuildResult,
    failure_reasons: Vec<String>,
    build_name: Option<String>,
}

/// Run-scoped shared state: the mutable environment, the built-ins map and
/// the two report tables. Parallel actions hold clones and serialize every
/// mutation through the inner lock.
#[derive(Debug, Clone)]
pub struct RunContext {
    inner: Arc<Mutex<RunState>>,
}

impl RunContext {
    pub fn new(env: Environment, runner_installation: &str) -> Self {
        let mut builtins = BTreeMap::new();
        builtins.insert(
            BUILTIN_RUNNER_INSTALLATION.to_string(),
            runner_installation.to_string(),
        );
        builtins.insert(BUILTIN_BUILD_RESULT.to_string(), "SUCCESS".to_string());
        builtins.insert(BUILTIN_REPORT.to_string(), String::new());
        builtins.insert(BUILTIN_REPORT_STAGES.to_string(), String::new());
        Self {
            inner: Arc::new(Mutex::new(RunState {
                env,
                builtins,
                action_report: ReportTable::default(),
                stage_report: ReportTable::default(),
                result: BuildResult::Success,
                failure_reasons: Vec::new(),
                build_name: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn env_get(&self, name: &str) -> Option<String> {
        self.lock().env.get(name).cloned()
    }

    pub fn env_set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.lock().env.insert(name.into(), value.into());
    }

    pub fn env_snapshot(&self) -> Environment {
        self.lock().env.clone()
    }

    pub fn builtin_set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.lock().builtins.insert(name.into(), value.into());
    }

    pub fn builtins_snapshot(&self) -> BTreeMap<String, String> {
        self.lock().builtins.clone()
    }

    pub fn result(&self) -> BuildResult {
        self.lock().result
    }

    /// Mark the run failed and record the reason for the final log line.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut state = self.lock();
        state.result = BuildResult::Failure;
        state
            .builtins
            .insert(BUILTIN_BUILD_RESULT.to_string(), "FAILURE".to_string());
        state.failure_reasons.push(reason.into());
    }

    pub fn failure_reasons(&self) -> Vec<String> {
        self.lock().failure_reasons.clone()
    }

    pub fn set_build_name(&self, name: impl Into<String>) {
        self.lock().build_name = Some(name.into());
    }

    pub fn build_name(&self) -> Option<String> {
        self.lock().build_name.clone()
    }

    /// Append an action-report row and refresh the rendered form held in
    /// the built-ins.
    pub fn record_action(&self, item: impl Into<String>, passed: bool, detail: impl Into<String>) {
        let mut state = self.lock();
        state.action_report.push(item, passed, detail);
        let rendered = state.action_report.render();
        state.builtins.insert(BUILTIN_REPORT.to_string(), rendered);
    }

    /// Append a stage-report row and refresh the rendered form.
    pub fn record_stage(&self, name: impl Into<String>, passed: bool, detail: impl Into<String>) {
        let mut state = self.lock();
        state.stage_report.push(name, passed, detail);
        let rendered = state.stage_report.render();
        state
            .builtins
            .insert(BUILTIN_REPORT_STAGES.to_string(), rendered);
    }

    pub fn report(&self) -> RunReport {
        let state = self.lock();
        RunReport::new(state.action_report.clone(), state.stage_report.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_rows_refresh_rendered_builtins() {
        let ctx = RunContext::new(Environment::new(), "default-runner");
        ctx.record_action("build[0]", true, "checkout: repo_url");
        ctx.record_stage("build", true, "1 action(s)");

        let builtins = ctx.builtins_snapshot();
        assert!(builtins[BUILTIN_REPORT].contains("build[0]"));
        assert!(builtins[BUILTIN_REPORT_STAGES].contains("1 action(s)"));
        assert_eq!(builtins[BUILTIN_RUNNER_INSTALLATION], "default-runner");
    }

    #[test]
    fn fail_flips_result_and_accumulates_reasons() {
        let ctx = RunContext::new(Environment::new(), "r");
        assert_eq!(ctx.result(), BuildResult::Success);
        ctx.fail("first");
        ctx.fail("second");
        assert_eq!(ctx.result(), BuildResult::Failure);
        assert_eq!(ctx.failure_reasons(), vec!["first", "second"]);
        assert_eq!(ctx.builtins_snapshot()[BUILTIN_BUILD_RESULT], "FAILURE");
    }

    #[test]
    fn clones_share_state() {
        let ctx = RunContext::new(Environment::new(), "r");
        let clone = ctx.clone();
        clone.env_set("KEY", "value");
        assert_eq!(ctx.env_get("KEY").as_deref(), Some("value"));
    }
}
