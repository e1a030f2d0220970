//! Engine configuration.
//!
//! A [`Config`] may come from the queue file's `config:` block, from the
//! operator config file, or from flags; the orchestrator validates the merged
//! result once at startup. Queue-file data can never enable
//! `skip_permissions` (see [`crate::queue`]).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of plan revisions allowed per ticket.
pub const DEFAULT_MAX_PLAN_REVISIONS: u32 = 3;

/// Default number of execute retries per ticket (attempts = retries + 1).
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Errors produced by startup validation of the merged config.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "skip_permissions together with auto_approve requires acknowledge_autonomous_risk; \
         refusing to run fully autonomous without the explicit acknowledgment"
    )]
    UnacknowledgedAutonomousRisk,
}

/// Per-phase timeouts, in seconds on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    /// Plan-generation driver calls.
    pub plan_generation: u64,
    /// Execute/resume driver calls.
    pub execution: u64,
    /// Waiting for a human approval.
    pub approval: u64,
    /// Waiting for a human answer to a question.
    pub question: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            plan_generation: 600,
            execution: 1800,
            approval: 3600,
            question: 3600,
        }
    }
}

impl Timeouts {
    pub fn plan_generation(&self) -> Duration {
        Duration::from_secs(self.plan_generation)
    }

    pub fn execution(&self) -> Duration {
        Duration::from_secs(self.execution)
    }

    pub fn approval(&self) -> Duration {
        Duration::from_secs(self.approval)
    }

    pub fn question(&self) -> Duration {
        Duration::from_secs(self.question)
    }
}

/// Process-wide settings recognized by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Model passed to the driver for every call.
    pub model: Option<String>,
    /// Model used for the one-shot rate-limit fallback retry.
    pub fallback_model: Option<String>,
    /// Soft budget per ticket in USD; exceeding it is logged, not fatal.
    pub max_budget_per_ticket: Option<f64>,
    /// Execute retries per ticket beyond the first attempt.
    pub max_retries: u32,
    /// Plan revisions allowed before a rejected ticket is skipped.
    pub max_plan_revisions: u32,
    /// Keep processing the queue after a ticket fails.
    pub continue_on_error: bool,
    /// Skip the human approval step after plan generation.
    pub auto_approve: bool,
    /// Generate a plan before executing (tickets may override).
    pub plan_mode: bool,
    /// Pass the dangerous permissions-bypass flag to the driver.
    pub skip_permissions: bool,
    /// Allow `shell`-type hook actions to run.
    pub allow_shell_hooks: bool,
    /// Required to combine skip_permissions with auto_approve.
    pub acknowledge_autonomous_risk: bool,
    pub timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: None,
            fallback_model: None,
            max_budget_per_ticket: None,
            max_retries: DEFAULT_MAX_RETRIES,
            max_plan_revisions: DEFAULT_MAX_PLAN_REVISIONS,
            continue_on_error: false,
            auto_approve: false,
            plan_mode: true,
            skip_permissions: false,
            allow_shell_hooks: false,
            acknowledge_autonomous_risk: false,
            timeouts: Timeouts::default(),
        }
    }
}

impl Config {
    /// Validate invariants that span multiple fields. Called once at startup
    /// with the fully merged config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.skip_permissions && self.auto_approve && !self.acknowledge_autonomous_risk {
            return Err(ConfigError::UnacknowledgedAutonomousRisk);
        }
        Ok(())
    }

    /// Whether questions from the driver are answered without a human
    /// (plan-mode disabled or approvals automated).
    pub fn autonomous_answers(&self) -> bool {
        !self.plan_mode || self.auto_approve
    }
}
