//! Lifecycle hooks.
//!
//! Hooks are ordered action lists keyed by lifecycle point. Shell actions
//! run through `sh -c` and are gated by the top-level `allow_shell_hooks`
//! setting; prompt actions go through the driver's one-shot prompt call and
//! take part in the rate-limit model fallback. Hook failures are captured in
//! results, never raised.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::driver::{AssistantDriver, CallOptions};
use crate::ratelimit::{is_rate_limit, should_fallback};

/// A single hook action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HookAction {
    /// Run `command` through the shell. Gated by `allow_shell_hooks`.
    Shell { command: String },
    /// Send `command` to the assistant as a one-shot prompt.
    Prompt { command: String },
}

/// Ordered action lists keyed by lifecycle point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Hooks {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub before_all: Vec<HookAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub after_all: Vec<HookAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub before_each: Vec<HookAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub after_each: Vec<HookAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<HookAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_question: Vec<HookAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_plan_generated: Vec<HookAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_approval: Vec<HookAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub on_complete: Vec<HookAction>,
}

/// Lifecycle points at which hooks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
    OnError,
    OnQuestion,
    OnPlanGenerated,
    OnApproval,
    OnComplete,
}

impl HookPoint {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeforeAll => "beforeAll",
            Self::AfterAll => "afterAll",
            Self::BeforeEach => "beforeEach",
            Self::AfterEach => "afterEach",
            Self::OnError => "onError",
            Self::OnQuestion => "onQuestion",
            Self::OnPlanGenerated => "onPlanGenerated",
            Self::OnApproval => "onApproval",
            Self::OnComplete => "onComplete",
        }
    }
}

impl Hooks {
    /// The action list for a lifecycle point.
    pub fn actions(&self, point: HookPoint) -> &[HookAction] {
        match point {
            HookPoint::BeforeAll => &self.before_all,
            HookPoint::AfterAll => &self.after_all,
            HookPoint::BeforeEach => &self.before_each,
            HookPoint::AfterEach => &self.after_each,
            HookPoint::OnError => &self.on_error,
            HookPoint::OnQuestion => &self.on_question,
            HookPoint::OnPlanGenerated => &self.on_plan_generated,
            HookPoint::OnApproval => &self.on_approval,
            HookPoint::OnComplete => &self.on_complete,
        }
    }

    /// Merge a per-ticket overlay onto queue-level hooks: any point the
    /// overlay defines replaces the base list for that point.
    pub fn overlay(&self, overlay: &Hooks) -> Hooks {
        fn pick(base: &[HookAction], over: &[HookAction]) -> Vec<HookAction> {
            if over.is_empty() { base.to_vec() } else { over.to_vec() }
        }
        Hooks {
            before_all: pick(&self.before_all, &overlay.before_all),
            after_all: pick(&self.after_all, &overlay.after_all),
            before_each: pick(&self.before_each, &overlay.before_each),
            after_each: pick(&self.after_each, &overlay.after_each),
            on_error: pick(&self.on_error, &overlay.on_error),
            on_question: pick(&self.on_question, &overlay.on_question),
            on_plan_generated: pick(&self.on_plan_generated, &overlay.on_plan_generated),
            on_approval: pick(&self.on_approval, &overlay.on_approval),
            on_complete: pick(&self.on_complete, &overlay.on_complete),
        }
    }
}

/// Outcome of one hook action. Hooks never raise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Ticket context exposed to hook actions via environment variables.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub ticket_id: Option<String>,
    pub ticket_title: Option<String>,
}

/// Executes hook actions for the orchestrator.
pub struct HookRunner {
    driver: Arc<dyn AssistantDriver>,
    allow_shell: bool,
    model: Option<String>,
    fallback_model: Option<String>,
    cwd: Option<PathBuf>,
}

impl HookRunner {
    pub fn new(
        driver: Arc<dyn AssistantDriver>,
        allow_shell: bool,
        model: Option<String>,
        fallback_model: Option<String>,
        cwd: Option<PathBuf>,
    ) -> Self {
        Self {
            driver,
            allow_shell,
            model,
            fallback_model,
            cwd,
        }
    }

    /// Working directory for shell actions and prompt calls.
    pub fn set_cwd(&mut self, cwd: Option<PathBuf>) {
        self.cwd = cwd;
    }

    /// Run every action registered for `point`, in order. Results are
    /// collected; the caller decides what to do with outputs (for example
    /// appending them as auto-answer context).
    pub async fn run_point(
        &self,
        hooks: &Hooks,
        point: HookPoint,
        ctx: &HookContext,
    ) -> Vec<HookResult> {
        let actions = hooks.actions(point);
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            let result = match action {
                HookAction::Shell { command } => self.run_shell(command, ctx).await,
                HookAction::Prompt { command } => self.run_prompt_hook(command).await,
            };
            if !result.success {
                warn!(
                    point = point.name(),
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "hook action failed"
                );
            }
            results.push(result);
        }
        results
    }

    async fn run_shell(&self, command: &str, ctx: &HookContext) -> HookResult {
        if !self.allow_shell {
            return HookResult {
                success: false,
                output: None,
                error: Some("shell hooks are disabled".to_string()),
            };
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(ticket_id) = &ctx.ticket_id {
            cmd.env("PLANBOT_TICKET_ID", ticket_id);
        }
        if let Some(title) = &ctx.ticket_title {
            cmd.env("PLANBOT_TICKET_TITLE", title);
        }

        match cmd.output().await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
                if output.status.success() {
                    HookResult {
                        success: true,
                        output: (!stdout.is_empty()).then_some(stdout),
                        error: None,
                    }
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
                    HookResult {
                        success: false,
                        output: (!stdout.is_empty()).then_some(stdout),
                        error: Some(format!("command exited with {}: {stderr}", output.status)),
                    }
                }
            }
            Err(e) => HookResult {
                success: false,
                output: None,
                error: Some(format!("failed to run command: {e}")),
            },
        }
    }

    /// Prompt hooks go through the driver and get one fallback-model retry
    /// when the first call classifies as a rate limit. Fallback failure here
    /// is non-fatal; the failed result is simply recorded.
    async fn run_prompt_hook(&self, prompt: &str) -> HookResult {
        let opts = CallOptions {
            model: self.model.clone(),
            timeout: None,
            cwd: self.cwd.clone(),
        };
        let mut result = self.driver.run_prompt(prompt, &opts).await;

        if !result.success
            && is_rate_limit(&result)
            && should_fallback(self.model.as_deref(), self.fallback_model.as_deref())
        {
            debug!("prompt hook hit a rate limit, retrying with fallback model");
            let fallback_opts = CallOptions {
                model: self.fallback_model.clone(),
                ..opts
            };
            result = self.driver.run_prompt(prompt, &fallback_opts).await;
        }

        HookResult {
            success: result.success,
            output: result.output,
            error: result.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::driver::{CallResult, ExecCallbacks, ExecOptions, OutputSink};

    /// Driver fake that returns canned prompt results and records models.
    struct PromptFake {
        results: Mutex<Vec<CallResult>>,
        models: Mutex<Vec<Option<String>>>,
    }

    impl PromptFake {
        fn new(results: Vec<CallResult>) -> Self {
            Self {
                results: Mutex::new(results),
                models: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AssistantDriver for PromptFake {
        async fn generate_plan(
            &self,
            _prompt: &str,
            _opts: &CallOptions,
            _output: Option<OutputSink>,
        ) -> CallResult {
            unimplemented!("not used by hook tests")
        }

        async fn execute(
            &self,
            _prompt: &str,
            _opts: &ExecOptions,
            _callbacks: ExecCallbacks,
        ) -> CallResult {
            unimplemented!("not used by hook tests")
        }

        async fn resume(
            &self,
            _session_id: &str,
            _prompt: &str,
            _opts: &ExecOptions,
            _callbacks: ExecCallbacks,
        ) -> CallResult {
            unimplemented!("not used by hook tests")
        }

        async fn run_prompt(&self, _prompt: &str, opts: &CallOptions) -> CallResult {
            self.models.lock().unwrap().push(opts.model.clone());
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                CallResult::err("exhausted")
            } else {
                results.remove(0)
            }
        }

        async fn abort(&self) {}

        async fn answer_question(&self, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn runner(driver: Arc<dyn AssistantDriver>, allow_shell: bool) -> HookRunner {
        HookRunner::new(
            driver,
            allow_shell,
            Some("opus".to_string()),
            Some("sonnet".to_string()),
            None,
        )
    }

    #[tokio::test]
    async fn shell_hooks_disabled_by_default() {
        let driver = Arc::new(PromptFake::new(vec![]));
        let runner = runner(driver, false);
        let hooks = Hooks {
            before_each: vec![HookAction::Shell { command: "echo hi".into() }],
            ..Hooks::default()
        };

        let results = runner
            .run_point(&hooks, HookPoint::BeforeEach, &HookContext::default())
            .await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(results[0].error.as_deref(), Some("shell hooks are disabled"));
    }

    #[tokio::test]
    async fn shell_hook_captures_output_and_env() {
        let driver = Arc::new(PromptFake::new(vec![]));
        let runner = runner(driver, true);
        let hooks = Hooks {
            on_complete: vec![HookAction::Shell {
                command: "echo done:$PLANBOT_TICKET_ID".into(),
            }],
            ..Hooks::default()
        };
        let ctx = HookContext {
            ticket_id: Some("T1".into()),
            ticket_title: Some("title".into()),
        };

        let results = runner.run_point(&hooks, HookPoint::OnComplete, &ctx).await;
        assert!(results[0].success);
        assert_eq!(results[0].output.as_deref(), Some("done:T1"));
    }

    #[tokio::test]
    async fn failing_shell_hook_is_captured_not_raised() {
        let driver = Arc::new(PromptFake::new(vec![]));
        let runner = runner(driver, true);
        let hooks = Hooks {
            on_error: vec![HookAction::Shell { command: "exit 7".into() }],
            ..Hooks::default()
        };

        let results = runner
            .run_point(&hooks, HookPoint::OnError, &HookContext::default())
            .await;
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("exited with"));
    }

    #[tokio::test]
    async fn prompt_hook_runs_through_driver() {
        let driver = Arc::new(PromptFake::new(vec![CallResult::ok("hint: use tokio")]));
        let runner = runner(driver.clone(), false);
        let hooks = Hooks {
            on_question: vec![HookAction::Prompt { command: "suggest an answer".into() }],
            ..Hooks::default()
        };

        let results = runner
            .run_point(&hooks, HookPoint::OnQuestion, &HookContext::default())
            .await;
        assert!(results[0].success);
        assert_eq!(results[0].output.as_deref(), Some("hint: use tokio"));
        assert_eq!(driver.models.lock().unwrap().as_slice(), &[Some("opus".to_string())]);
    }

    #[tokio::test]
    async fn prompt_hook_falls_back_on_rate_limit() {
        let driver = Arc::new(PromptFake::new(vec![
            CallResult::err("rate limit exceeded"),
            CallResult::ok("fallback hint"),
        ]));
        let runner = runner(driver.clone(), false);
        let hooks = Hooks {
            on_question: vec![HookAction::Prompt { command: "suggest".into() }],
            ..Hooks::default()
        };

        let results = runner
            .run_point(&hooks, HookPoint::OnQuestion, &HookContext::default())
            .await;
        assert!(results[0].success);
        assert_eq!(results[0].output.as_deref(), Some("fallback hint"));
        assert_eq!(
            driver.models.lock().unwrap().as_slice(),
            &[Some("opus".to_string()), Some("sonnet".to_string())]
        );
    }

    #[tokio::test]
    async fn prompt_hook_fallback_failure_is_non_fatal() {
        let driver = Arc::new(PromptFake::new(vec![
            CallResult::err("usage limit reached"),
            CallResult::err("usage limit reached"),
        ]));
        let runner = runner(driver, false);
        let hooks = Hooks {
            before_each: vec![HookAction::Prompt { command: "warm up".into() }],
            ..Hooks::default()
        };

        let results = runner
            .run_point(&hooks, HookPoint::BeforeEach, &HookContext::default())
            .await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
    }

    #[test]
    fn hook_actions_deserialize_tagged() {
        let yaml = r#"
beforeEach:
  - type: shell
    command: make lint
  - type: prompt
    command: summarize the repo
"#;
        let hooks: Hooks = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            hooks.before_each,
            vec![
                HookAction::Shell { command: "make lint".into() },
                HookAction::Prompt { command: "summarize the repo".into() },
            ]
        );
    }

    #[test]
    fn overlay_replaces_defined_points_only() {
        let base = Hooks {
            before_each: vec![HookAction::Shell { command: "base".into() }],
            on_complete: vec![HookAction::Shell { command: "notify".into() }],
            ..Hooks::default()
        };
        let overlay = Hooks {
            before_each: vec![HookAction::Prompt { command: "override".into() }],
            ..Hooks::default()
        };
        let merged = base.overlay(&overlay);
        assert_eq!(
            merged.before_each,
            vec![HookAction::Prompt { command: "override".into() }]
        );
        assert_eq!(merged.on_complete, base.on_complete);
    }
}
