//! The `AssistantDriver` trait -- the seam between the orchestrator and
//! the coding-assistant subprocess.
//!
//! Concrete drivers (the in-tree [`claude::ClaudeDriver`], scripted fakes in
//! tests) translate the assistant's I/O into [`StreamEvent`] values and
//! [`CallResult`] outcomes. The trait is object-safe so the orchestrator can
//! hold an `Arc<dyn AssistantDriver>`.

pub mod claude;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use claude::ClaudeDriver;

/// One parsed event from the assistant's stdout stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The subprocess announced itself and its session token.
    Init { session_id: String },
    /// Free-form assistant text.
    Assistant { text: String },
    /// The assistant invoked a tool.
    ToolUse {
        tool_name: String,
        tool_input: serde_json::Value,
    },
    /// Terminal success event.
    Result {
        result: String,
        cost_usd: Option<f64>,
        session_id: Option<String>,
    },
    /// Terminal failure event.
    Error { error: String },
}

/// Outcome of a driver call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallResult {
    pub success: bool,
    /// Plan text (for plan generation) or final result text.
    pub output: Option<String>,
    /// Opaque token accepted by [`AssistantDriver::resume`].
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub error: Option<String>,
}

impl CallResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Length of the captured output, zero when absent. Used by the
    /// rate-limit heuristic.
    pub fn output_len(&self) -> usize {
        self.output.as_deref().map_or(0, str::len)
    }
}

/// Options shared by plan generation and one-shot prompts.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub model: Option<String>,
    pub timeout: Option<Duration>,
    pub cwd: Option<PathBuf>,
}

/// Options for execute/resume calls.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub model: Option<String>,
    pub skip_permissions: bool,
    pub timeout: Option<Duration>,
    pub cwd: Option<PathBuf>,
    pub session_id: Option<String>,
}

/// One selectable answer to an interactive question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionOption {
    pub label: String,
    pub value: String,
}

/// Resolves interactive questions raised by the subprocess. The returned
/// answer is injected into the assistant's stdin.
#[async_trait]
pub trait QuestionHandler: Send + Sync {
    async fn answer(
        &self,
        question_id: &str,
        text: &str,
        options: &[QuestionOption],
    ) -> Result<String>;
}

/// Receives raw stdout text as it arrives.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives every parsed [`StreamEvent`] in stream order.
pub type EventSinkFn = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Callback bundle for execute/resume calls.
#[derive(Clone, Default)]
pub struct ExecCallbacks {
    pub events: Option<EventSinkFn>,
    pub output: Option<OutputSink>,
    pub questions: Option<Arc<dyn QuestionHandler>>,
}

impl ExecCallbacks {
    pub(crate) fn emit_event(&self, event: StreamEvent) {
        if let Some(events) = &self.events {
            events(event);
        }
    }

    pub(crate) fn emit_output(&self, chunk: &str) {
        if let Some(output) = &self.output {
            output(chunk);
        }
    }
}

impl std::fmt::Debug for ExecCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCallbacks")
            .field("events", &self.events.is_some())
            .field("output", &self.output.is_some())
            .field("questions", &self.questions.is_some())
            .finish()
    }
}

/// Supervisor interface for the assistant subprocess.
#[async_trait]
pub trait AssistantDriver: Send + Sync {
    /// Generate a plan for a prompt. The plan is the concatenation of the
    /// assistant's text output; an empty plan is reported as a failure.
    async fn generate_plan(
        &self,
        prompt: &str,
        opts: &CallOptions,
        output: Option<OutputSink>,
    ) -> CallResult;

    /// Execute a prompt, streaming events and routing interactive questions
    /// through `callbacks.questions`.
    async fn execute(&self, prompt: &str, opts: &ExecOptions, callbacks: ExecCallbacks)
    -> CallResult;

    /// Resume a prior session by its opaque token.
    async fn resume(
        &self,
        session_id: &str,
        prompt: &str,
        opts: &ExecOptions,
        callbacks: ExecCallbacks,
    ) -> CallResult;

    /// One-shot prompt with no streaming callbacks; used by prompt hooks.
    async fn run_prompt(&self, prompt: &str, opts: &CallOptions) -> CallResult;

    /// Cancel the in-flight call, if any. The pending call resolves to a
    /// failed [`CallResult`] with error "aborted".
    async fn abort(&self);

    /// Inject a user message into the running subprocess.
    async fn answer_question(&self, text: &str) -> Result<()>;
}

// Compile-time assertion: the driver seam must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AssistantDriver) {}
};
