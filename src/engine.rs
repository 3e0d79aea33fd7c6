use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{error, info, warn};

use crate::actions::Dispatcher;
use crate::collab::Collaborators;
use crate::config::Config;
use crate::context::{BuildResult, Environment, RunContext};
use crate::params::inject;
use crate::params::resolve::resolve;
use crate::params::schema::{ParamSchema, merge_with_builtins, validate_schema};
use crate::settings::{PipelineSettings, SettingsLoader, load_file};
use crate::walker::{WalkMode, Walker};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Name of the job, used to derive the settings filename.
    pub job_name: String,
    /// Load settings from a local file instead of cloning the settings
    /// repository.
    pub settings_file: Option<PathBuf>,
    /// Settings branch override; falls back to the SETTINGS_GIT_BRANCH
    /// parameter and then the configured default.
    pub branch: Option<String>,
    pub dry_run: bool,
    pub verbose: bool,
}

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Succeeded,
    Failed,
    DryRunCompleted,
    ParametersUpdated,
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitStatus::Succeeded => "SUCCEEDED",
            ExitStatus::Failed => "FAILED",
            ExitStatus::DryRunCompleted => "DRY_RUN_COMPLETED",
            ExitStatus::ParametersUpdated => "PARAMETERS_UPDATED",
        };
        write!(f, "{s}")
    }
}

/// Drives a pipeline from settings load to the final result:
/// load -> schema validation -> parameter injection -> parameter
/// resolution -> check walk -> execute walk.
pub struct Engine {
    config: Config,
    deps: Collaborators,
    last_report: Mutex<Option<crate::report::RunReport>>,
}

impl Engine {
    pub fn new(config: Config, deps: Collaborators) -> Self {
        Self {
            config,
            deps,
            last_report: Mutex::new(None),
        }
    }

    /// Snapshot of the report tables from the most recent `run` call.
    pub fn last_report(&self) -> Option<crate::report::RunReport> {
        self.last_report.lock().map(|r| r.clone()).unwrap_or(None)
    }

    pub async fn run(&self, opts: &RunOptions) -> Result<ExitStatus> {
        let mut env = self.seed_environment();
        let dry_run = opts.dry_run || flag(&env, "DRY_RUN");

        let settings = match self.load_settings(opts, &env).await {
            Ok(settings) => settings,
            Err(err) => {
                return Ok(self.finish_failed(vec![err.to_string()]));
            }
        };

        let (user_schemas, schema_report) = validate_schema(
            &settings.parameters.required,
            &settings.parameters.optional,
        );
        if !schema_report.is_ok() {
            return Ok(self.finish_failed(schema_report.errors));
        }
        let merged = merge_with_builtins(user_schemas);
        apply_defaults(&merged, &mut env);

        let current = self.deps.host.current_parameters();
        if inject::needs_update(&merged, &current) || flag(&env, "UPDATE_PARAMETERS") {
            inject::inject(&*self.deps.host, &merged, dry_run).await?;
            info!(status = %ExitStatus::ParametersUpdated, "Run finished");
            return Ok(ExitStatus::ParametersUpdated);
        }

        let resolve_report = resolve(&merged, &mut env);
        if !resolve_report.is_ok() {
            return Ok(self.finish_failed(resolve_report.errors));
        }

        let ctx = RunContext::new(env, &self.config.remote_runner_installation);
        self.attach_node(&ctx).await;

        let walker = self.walker(settings);

        let check = walker.walk(&ctx, WalkMode::Check).await;
        if !check.ok {
            return Ok(self.finish_failed(check.report.errors));
        }

        let executed = walker.walk(&ctx, WalkMode::Execute { dry_run }).await;

        let report = ctx.report();
        info!("Action report:\n{}", report.actions.render());
        info!("Stage report:\n{}", report.stages.render());
        if let Ok(mut slot) = self.last_report.lock() {
            *slot = Some(report);
        }

        if ctx.result() == BuildResult::Failure || !executed.ok {
            return Ok(self.finish_failed(ctx.failure_reasons()));
        }

        let status = if dry_run {
            ExitStatus::DryRunCompleted
        } else {
            ExitStatus::Succeeded
        };
        info!(status = %status, "Run finished");
        Ok(status)
    }

    /// Validation-only entry: loads the settings, validates the parameter
    /// schema and walks every stage in check mode. Returns true when the
    /// pipeline is clean.
    pub async fn check(&self, opts: &RunOptions) -> Result<bool> {
        let mut env = self.seed_environment();

        let settings = match self.load_settings(opts, &env).await {
            Ok(settings) => settings,
            Err(err) => {
                error!("{err}");
                return Ok(false);
            }
        };

        let (user_schemas, schema_report) = validate_schema(
            &settings.parameters.required,
            &settings.parameters.optional,
        );
        let merged = merge_with_builtins(user_schemas);
        apply_defaults(&merged, &mut env);

        let ctx = RunContext::new(env, &self.config.remote_runner_installation);
        let outcome = self.walker(settings).walk(&ctx, WalkMode::Check).await;

        Ok(schema_report.is_ok() && outcome.ok)
    }

    /// The merged (built-in + user) parameter declaration for a settings
    /// tree, rendered as YAML.
    pub fn render_parameters(settings: &PipelineSettings) -> Result<String> {
        let (user_schemas, report) = validate_schema(
            &settings.parameters.required,
            &settings.parameters.optional,
        );
        if !report.is_ok() {
            anyhow::bail!(
                "Parameter schema has {} error(s); fix the settings file first",
                report.errors.len()
            );
        }
        let declaration: Vec<serde_yaml::Value> = merge_with_builtins(user_schemas)
            .iter()
            .map(ParamSchema::to_declaration)
            .collect();
        Ok(serde_yaml::to_string(&declaration)?)
    }

    fn walker(&self, settings: PipelineSettings) -> Walker {
        let dispatcher = Arc::new(Dispatcher::new(self.deps.clone(), self.config.clone()));
        Walker::new(Arc::new(settings), dispatcher)
    }

    fn seed_environment(&self) -> Environment {
        let mut env: Environment = std::env::vars().collect();
        env.extend(self.deps.host.current_parameters());
        env
    }

    async fn load_settings(
        &self,
        opts: &RunOptions,
        env: &Environment,
    ) -> Result<PipelineSettings, crate::settings::LoaderError> {
        if let Some(path) = &opts.settings_file {
            return load_file(path, opts.verbose);
        }

        let branch = opts
            .branch
            .clone()
            .or_else(|| env.get("SETTINGS_GIT_BRANCH").cloned())
            .unwrap_or_else(|| self.config.settings_default_branch.clone());
        let relative = self
            .config
            .settings_relative_path(&opts.job_name)
            .map_err(|err| crate::settings::LoaderError::Clone {
                url: self.config.settings_repo_url.clone(),
                branch: branch.clone(),
                message: err.to_string(),
            })?;

        let loader = SettingsLoader::new(
            &*self.deps.git,
            Some(self.config.default_credentials_id.clone()),
        );
        loader
            .load(
                &self.config.settings_repo_url,
                &branch,
                &relative,
                &self.deps.host.workspace(),
                opts.verbose,
            )
            .await
    }

    /// Initial node attachment: NODE_TAG wins over NODE_NAME; neither set
    /// means any available host.
    async fn attach_node(&self, ctx: &RunContext) {
        let tag = ctx.env_get("NODE_TAG").filter(|v| !v.is_empty());
        let name = ctx.env_get("NODE_NAME").filter(|v| !v.is_empty());
        let (target, is_label) = match (tag, name) {
            (Some(tag), _) => (tag, true),
            (None, Some(name)) => (name, false),
            (None, None) => return,
        };
        if let Err(err) = self.deps.host.lease_node(&target, is_label).await {
            warn!(target = target.as_str(), "Initial node attach failed: {err}");
        }
    }

    fn finish_failed(&self, reasons: Vec<String>) -> ExitStatus {
        let text = if reasons.is_empty() {
            "Pipeline run failed".to_string()
        } else {
            reasons.join("; ")
        };
        error!("{text} Please fix then re-build.");
        ExitStatus::Failed
    }
}

fn flag(env: &Environment, name: &str) -> bool {
    env.get(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn apply_defaults(schema: &[ParamSchema], env: &mut Environment) {
    for param in schema {
        if let Some(default) = &param.default
            && !env.contains_key(&param.name)
        {
            env.insert(param.name.clone(), default.clone());
        }
    }
}
