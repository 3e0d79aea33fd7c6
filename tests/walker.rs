use std::collections::BTreeSet;
use std::sync::Arc;

use pipewright::actions::Dispatcher;
use pipewright::context::{BuildResult, Environment, RunContext};
use pipewright::fakes::FakeWorld;
use pipewright::settings::PipelineSettings;
use pipewright::walker::{WalkMode, Walker};
use pipewright::Config;
use tempfile::tempdir;

fn settings(yaml: &str) -> PipelineSettings {
    serde_yaml::from_str(yaml).unwrap()
}

fn walker_for(world: &FakeWorld, tree: PipelineSettings) -> Walker {
    let dispatcher = Arc::new(Dispatcher::new(world.collaborators(), Config::default()));
    Walker::new(Arc::new(tree), dispatcher)
}

fn ctx() -> RunContext {
    RunContext::new(Environment::new(), "ansible210")
}

const TWO_ACTION_STAGE: &str = r#"
stages:
  - name: build
    actions:
      - action: A1
      - action: A2
actions:
  A1:
    repo_url: https://example.invalid/x.git
  A2:
    artifacts: "*.log"
"#;

#[tokio::test]
async fn sequential_stage_reports_rows_in_declaration_order() {
    let temp = tempdir().unwrap();
    let world = FakeWorld::new(temp.path().to_path_buf());
    let walker = walker_for(&world, settings(TWO_ACTION_STAGE));
    let ctx = ctx();

    let outcome = walker
        .walk(&ctx, WalkMode::Execute { dry_run: false })
        .await;

    assert!(outcome.ok);
    assert!(!outcome.aborted);

    let report = ctx.report();
    let rows: Vec<(String, bool, String)> = report
        .actions
        .rows
        .iter()
        .map(|r| (r.item.clone(), r.passed, r.detail.clone()))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("build[0]".to_string(), true, "A1: repo_url".to_string()),
            ("build[1]".to_string(), true, "A2: artifacts".to_string()),
        ]
    );

    assert_eq!(report.stages.rows.len(), 1);
    assert_eq!(report.stages.rows[0].detail, "2 action(s)");
    assert_eq!(world.git.clones.lock().unwrap().len(), 1);
    assert_eq!(world.artifacts.published.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn parallel_stage_produces_same_rows_modulo_order() {
    let temp = tempdir().unwrap();

    let sequential_rows = {
        let world = FakeWorld::new(temp.path().to_path_buf());
        let walker = walker_for(&world, settings(TWO_ACTION_STAGE));
        let ctx = ctx();
        walker
            .walk(&ctx, WalkMode::Execute { dry_run: false })
            .await;
        ctx.report()
            .actions
            .rows
            .iter()
            .map(|r| (r.item.clone(), r.passed, r.detail.clone()))
            .collect::<BTreeSet<_>>()
    };

    let parallel_yaml = TWO_ACTION_STAGE.replace("- name: build", "- name: build\n    parallel: true");
    let world = FakeWorld::new(temp.path().to_path_buf());
    let walker = walker_for(&world, settings(&parallel_yaml));
    let ctx = ctx();
    walker
        .walk(&ctx, WalkMode::Execute { dry_run: false })
        .await;
    let parallel_rows = ctx
        .report()
        .actions
        .rows
        .iter()
        .map(|r| (r.item.clone(), r.passed, r.detail.clone()))
        .collect::<BTreeSet<_>>();

    assert_eq!(sequential_rows, parallel_rows);
    assert_eq!(ctx.report().stages.rows[0].detail, "2 action(s) in parallel");
}

#[tokio::test]
async fn stop_on_fail_aborts_before_subsequent_actions() {
    let temp = tempdir().unwrap();
    let world = FakeWorld::with_downstream_result(temp.path().to_path_buf(), BuildResult::Failure);
    let tree = settings(
        r#"
stages:
  - name: deploy
    actions:
      - action: P
        stop_on_fail: true
      - action: after
  - name: later
    actions:
      - action: after
actions:
  P:
    pipeline: downstream-job
  after:
    artifacts: "*.log"
"#,
    );
    let walker = walker_for(&world, tree);
    let ctx = ctx();

    let outcome = walker
        .walk(&ctx, WalkMode::Execute { dry_run: false })
        .await;

    assert!(!outcome.ok);
    assert!(outcome.aborted);

    // Only the failing action ran; nothing after it was published.
    let report = ctx.report();
    assert_eq!(report.actions.rows.len(), 1);
    assert!(!report.actions.rows[0].passed);
    assert!(world.artifacts.published.lock().unwrap().is_empty());

    assert!(ctx
        .failure_reasons()
        .iter()
        .any(|r| r.contains("Terminating current pipeline run due to an error in")));
}

#[tokio::test]
async fn ignore_fail_records_error_row_but_passes_the_stage() {
    let temp = tempdir().unwrap();
    let world = FakeWorld::new(temp.path().to_path_buf());
    world.shell.respond("exit 1", 1, "");
    let tree = settings(
        r#"
stages:
  - name: tolerant
    actions:
      - action: flaky
        ignore_fail: true
actions:
  flaky:
    script:
      script: exit 1
"#,
    );
    let walker = walker_for(&world, tree);
    let ctx = ctx();

    let outcome = walker
        .walk(&ctx, WalkMode::Execute { dry_run: false })
        .await;

    assert!(outcome.ok);
    let report = ctx.report();
    assert!(!report.actions.rows[0].passed);
    assert!(report.stages.rows[0].passed);
    assert_eq!(ctx.result(), BuildResult::Success);
}

#[tokio::test]
async fn gating_skips_on_run_result() {
    let temp = tempdir().unwrap();
    let world = FakeWorld::new(temp.path().to_path_buf());
    world.shell.respond("exit 1", 1, "");
    let tree = settings(
        r#"
stages:
  - name: breaks
    actions:
      - action: flaky
  - name: conditional
    actions:
      - action: on_success
        success_only: true
      - action: on_fail
        fail_only: true
actions:
  flaky:
    script:
      script: exit 1
  on_success:
    repo_url: https://example.invalid/x.git
  on_fail:
    report: mattermost
    url: https://chat.invalid/hook
    text: build broke
"#,
    );
    let walker = walker_for(&world, tree);
    let ctx = ctx();

    walker
        .walk(&ctx, WalkMode::Execute { dry_run: false })
        .await;

    // success_only was skipped: no clone happened. fail_only ran.
    assert!(world.git.clones.lock().unwrap().is_empty());
    assert_eq!(world.messenger.mattermost.lock().unwrap().len(), 1);

    let report = ctx.report();
    let conditional: Vec<_> = report
        .actions
        .rows
        .iter()
        .filter(|r| r.item.starts_with("conditional"))
        .collect();
    assert_eq!(conditional.len(), 2);
    assert!(conditional.iter().all(|r| r.passed));
}

#[tokio::test]
async fn node_pattern_resolves_first_match_and_redispatches() {
    let temp = tempdir().unwrap();
    let world = FakeWorld::new(temp.path().to_path_buf());
    let tree = settings(
        r#"
stages:
  - name: build
    actions:
      - action: co
        node:
          name: "build-*"
          pattern: true
actions:
  co:
    repo_url: https://example.invalid/x.git
"#,
    );
    let walker = walker_for(&world, tree);
    let ctx = ctx();

    let outcome = walker
        .walk(&ctx, WalkMode::Execute { dry_run: false })
        .await;

    assert!(outcome.ok);
    assert_eq!(
        world.host.leases.lock().unwrap().as_slice(),
        &[("build-01".to_string(), false)]
    );
}

#[tokio::test]
async fn unmatched_node_pattern_skips_with_error_row() {
    let temp = tempdir().unwrap();
    let world = FakeWorld::new(temp.path().to_path_buf());
    let tree = settings(
        r#"
stages:
  - name: build
    actions:
      - action: co
        node:
          name: "arm-*"
          pattern: true
actions:
  co:
    repo_url: https://example.invalid/x.git
"#,
    );
    let walker = walker_for(&world, tree);
    let ctx = ctx();

    let outcome = walker
        .walk(&ctx, WalkMode::Execute { dry_run: false })
        .await;

    assert!(!outcome.ok);
    assert!(world.git.clones.lock().unwrap().is_empty());
    let report = ctx.report();
    assert_eq!(report.actions.rows.len(), 1);
    assert!(!report.actions.rows[0].passed);
}

#[tokio::test]
async fn unmatched_node_pattern_fails_even_when_action_is_gated() {
    let temp = tempdir().unwrap();
    let world = FakeWorld::new(temp.path().to_path_buf());
    world.shell.respond("exit 1", 1, "");
    let tree = settings(
        r#"
stages:
  - name: breaks
    actions:
      - action: flaky
  - name: conditional
    actions:
      - action: co
        success_only: true
        node:
          name: "arm-*"
          pattern: true
actions:
  flaky:
    script:
      script: exit 1
  co:
    repo_url: https://example.invalid/x.git
"#,
    );
    let walker = walker_for(&world, tree);
    let ctx = ctx();

    let outcome = walker
        .walk(&ctx, WalkMode::Execute { dry_run: false })
        .await;

    // Node resolution runs before gating: the gate would have skipped the
    // action, but the unmatched pattern is still an error row.
    assert!(!outcome.ok);
    assert!(world.git.clones.lock().unwrap().is_empty());
    let report = ctx.report();
    let row = report
        .actions
        .rows
        .iter()
        .find(|r| r.item == "conditional[0]")
        .unwrap();
    assert!(!row.passed);
}

#[tokio::test]
async fn pipeline_script_exports_merge_into_environment() {
    let temp = tempdir().unwrap();
    let world = FakeWorld::new(temp.path().to_path_buf());
    world
        .shell
        .respond("make version", 0, "RELEASE=1.2.3\nCHANNEL=stable\n");
    let tree = settings(
        r#"
stages:
  - name: version
    actions:
      - action: derive
  - name: tag
    actions:
      - action: co
actions:
  derive:
    script:
      script: make version
      pipeline: true
  co:
    repo_url: https://example.invalid/$CHANNEL.git
"#,
    );
    let walker = walker_for(&world, tree);
    let ctx = ctx();

    let outcome = walker
        .walk(&ctx, WalkMode::Execute { dry_run: false })
        .await;

    assert!(outcome.ok);
    assert_eq!(ctx.env_get("RELEASE").as_deref(), Some("1.2.3"));

    // The later action saw the exported variable through templating.
    let clones = world.git.clones.lock().unwrap();
    assert_eq!(clones[0].0, "https://example.invalid/stable.git");
}

#[tokio::test]
async fn dry_run_records_rows_without_side_effects() {
    let temp = tempdir().unwrap();
    let world = FakeWorld::new(temp.path().to_path_buf());
    let walker = walker_for(&world, settings(TWO_ACTION_STAGE));
    let ctx = ctx();

    let outcome = walker.walk(&ctx, WalkMode::Execute { dry_run: true }).await;

    assert!(outcome.ok);
    assert_eq!(ctx.report().actions.rows.len(), 2);
    assert!(world.git.clones.lock().unwrap().is_empty());
    assert!(world.artifacts.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn check_mode_aggregates_every_problem_without_executing() {
    let temp = tempdir().unwrap();
    let world = FakeWorld::new(temp.path().to_path_buf());
    let tree = settings(
        r#"
stages:
  - name: broken
    actions:
      - action: ghost
      - action: co
        success_only: true
        fail_only: true
actions:
  co:
    repo_url: https://example.invalid/x.git
"#,
    );
    let walker = walker_for(&world, tree);
    let ctx = ctx();

    let outcome = walker.walk(&ctx, WalkMode::Check).await;

    assert!(!outcome.ok);
    // Both problems surfaced in one pass.
    assert!(outcome.report.errors.len() >= 2);
    assert!(world.git.clones.lock().unwrap().is_empty());
    assert!(ctx.report().actions.rows.is_empty());
}

#[tokio::test]
async fn stage_name_is_templated() {
    let temp = tempdir().unwrap();
    let world = FakeWorld::new(temp.path().to_path_buf());
    let tree = settings(
        r#"
stages:
  - name: deploy-$TARGET
    actions:
      - action: co
actions:
  co:
    repo_url: https://example.invalid/x.git
"#,
    );
    let walker = walker_for(&world, tree);
    let mut env = Environment::new();
    env.insert("TARGET".to_string(), "staging".to_string());
    let ctx = RunContext::new(env, "ansible210");

    walker
        .walk(&ctx, WalkMode::Execute { dry_run: false })
        .await;

    assert_eq!(ctx.report().stages.rows[0].item, "deploy-staging");
}
