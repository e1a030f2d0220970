//! Claude Code driver.
//!
//! Spawns `claude -p --output-format stream-json` as a subprocess and parses
//! its JSONL output into [`StreamEvent`] values. Interactive questions are
//! routed to a [`QuestionHandler`] and the resolved answer is written back
//! to the child's stdin as a stream-json user message.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    AssistantDriver, CallOptions, CallResult, ExecCallbacks, ExecOptions, OutputSink,
    QuestionHandler, QuestionOption, StreamEvent,
};

/// Fallback wall-clock limit when the caller did not set one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Tool names that represent an interactive question to the user.
fn is_question_tool(name: &str) -> bool {
    name.eq_ignore_ascii_case("askuserquestion") || name.eq_ignore_ascii_case("ask_user_question")
}

/// Shared handle to the in-flight call, if any.
struct ActiveCall {
    cancel: CancellationToken,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
}

/// Driver for [Claude Code](https://docs.anthropic.com/en/docs/claude-code).
///
/// One call runs at a time; `abort()` and `answer_question()` act on the
/// currently active call.
#[derive(Clone)]
pub struct ClaudeDriver {
    /// Path to the `claude` binary. Defaults to `"claude"` (found via `$PATH`).
    binary_path: String,
    active: Arc<Mutex<Option<ActiveCall>>>,
}

impl std::fmt::Debug for ClaudeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeDriver")
            .field("binary_path", &self.binary_path)
            .finish()
    }
}

impl ClaudeDriver {
    /// Create a driver that looks for `claude` on `$PATH`.
    pub fn new() -> Self {
        Self::with_binary("claude")
    }

    /// Create a driver with a custom binary path. Useful for testing or when
    /// the assistant is installed in a non-standard location.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
            active: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for ClaudeDriver {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// JSONL parsing
// ---------------------------------------------------------------------------

/// Parse a single JSONL line from the assistant's stream output into zero or
/// more [`StreamEvent`] values.
///
/// Returns `Err` if the line is not valid JSON; callers should treat that as
/// a warning and continue reading.
fn parse_stream_line(line: &str) -> Result<Vec<StreamEvent>> {
    let v: serde_json::Value =
        serde_json::from_str(line).context("malformed JSON in stream output")?;

    let mut events = Vec::new();
    let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match event_type {
        // ----------------------------------------------------------------
        // init -- the subprocess announces its session token
        // ----------------------------------------------------------------
        "init" => {
            if let Some(session_id) = v.get("session_id").and_then(|s| s.as_str()) {
                events.push(StreamEvent::Init {
                    session_id: session_id.to_string(),
                });
            }
        }

        // ----------------------------------------------------------------
        // assistant -- free-form text, either flat or in content blocks
        // ----------------------------------------------------------------
        "assistant" => {
            if let Some(text) = v.get("text").and_then(|t| t.as_str()) {
                events.push(StreamEvent::Assistant {
                    text: text.to_string(),
                });
            } else if let Some(blocks) = v
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
            {
                for block in blocks {
                    match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                        "text" => {
                            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                                events.push(StreamEvent::Assistant {
                                    text: text.to_string(),
                                });
                            }
                        }
                        "tool_use" => {
                            events.push(StreamEvent::ToolUse {
                                tool_name: block
                                    .get("name")
                                    .and_then(|n| n.as_str())
                                    .unwrap_or("unknown")
                                    .to_string(),
                                tool_input: block
                                    .get("input")
                                    .cloned()
                                    .unwrap_or(serde_json::Value::Null),
                            });
                        }
                        _ => {}
                    }
                }
            }
        }

        // ----------------------------------------------------------------
        // tool_use -- the assistant invoked a tool
        // ----------------------------------------------------------------
        "tool_use" => {
            events.push(StreamEvent::ToolUse {
                tool_name: v
                    .get("tool_name")
                    .or_else(|| v.get("name"))
                    .and_then(|n| n.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                tool_input: v
                    .get("tool_input")
                    .or_else(|| v.get("input"))
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            });
        }

        // ----------------------------------------------------------------
        // result -- terminal success event
        // ----------------------------------------------------------------
        "result" => {
            events.push(StreamEvent::Result {
                result: v
                    .get("result")
                    .and_then(|r| r.as_str())
                    .unwrap_or("")
                    .to_string(),
                cost_usd: v.get("cost_usd").and_then(|c| c.as_f64()),
                session_id: v
                    .get("session_id")
                    .and_then(|s| s.as_str())
                    .map(str::to_string),
            });
        }

        // ----------------------------------------------------------------
        // error -- terminal failure event
        // ----------------------------------------------------------------
        "error" => {
            let error = v
                .get("error")
                .map(|e| match e {
                    serde_json::Value::String(s) => s.clone(),
                    other => other
                        .get("message")
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| other.to_string()),
                })
                .unwrap_or_else(|| "unknown error".to_string());
            events.push(StreamEvent::Error { error });
        }

        other => {
            debug!(event_type = other, "ignoring unrecognized stream event type");
        }
    }

    Ok(events)
}

/// Extract (id, text, options) from an interactive question tool invocation.
fn parse_question_input(input: &serde_json::Value) -> (String, String, Vec<QuestionOption>) {
    let id = input
        .get("id")
        .and_then(|i| i.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let text = input
        .get("question")
        .or_else(|| input.get("prompt"))
        .and_then(|q| q.as_str())
        .unwrap_or("")
        .to_string();

    let options = input
        .get("options")
        .and_then(|o| o.as_array())
        .map(|opts| {
            opts.iter()
                .filter_map(|opt| match opt {
                    serde_json::Value::String(s) => Some(QuestionOption {
                        label: s.clone(),
                        value: s.clone(),
                    }),
                    other => {
                        let label = other.get("label").and_then(|l| l.as_str())?;
                        let value = other
                            .get("value")
                            .and_then(|v| v.as_str())
                            .unwrap_or(label);
                        Some(QuestionOption {
                            label: label.to_string(),
                            value: value.to_string(),
                        })
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    (id, text, options)
}

/// Encode an answer as a stream-json user message, newline-terminated.
fn encode_user_message(content: &str) -> String {
    let msg = serde_json::json!({
        "type": "user",
        "message": { "role": "user", "content": content },
    });
    format!("{msg}\n")
}

// ---------------------------------------------------------------------------
// Call plumbing
// ---------------------------------------------------------------------------

/// What kind of call is running; decides flag set and result shaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Plan,
    Execute,
    Prompt,
}

struct CallSpec<'a> {
    kind: CallKind,
    prompt: &'a str,
    model: Option<&'a str>,
    timeout: Duration,
    cwd: Option<&'a Path>,
    skip_permissions: bool,
    session_id: Option<&'a str>,
}

enum LoopOutcome {
    /// A `result` event arrived.
    Finished {
        result: String,
        cost_usd: Option<f64>,
        session_id: Option<String>,
    },
    /// An `error` event arrived.
    Errored { error: String },
    /// stdout closed without a terminal event.
    Eof,
}

impl ClaudeDriver {
    async fn run_call(&self, spec: CallSpec<'_>, callbacks: ExecCallbacks) -> CallResult {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--verbose");

        if spec.kind == CallKind::Plan {
            cmd.arg("--permission-mode").arg("plan");
        }
        if spec.skip_permissions {
            cmd.arg("--dangerously-skip-permissions");
        }
        if let Some(model) = spec.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(session_id) = spec.session_id {
            cmd.arg("--resume").arg(session_id);
        }
        if let Some(cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = match cmd.spawn().with_context(|| {
            format!(
                "failed to spawn assistant binary at '{}' -- is it installed and on PATH?",
                self.binary_path
            )
        }) {
            Ok(child) => child,
            Err(e) => return CallResult::err(format!("{e:#}")),
        };

        let stdin = Arc::new(Mutex::new(child.stdin.take()));
        let stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        // Write the prompt as the first user message. Execute calls keep
        // stdin open so question answers can follow.
        {
            let mut guard = stdin.lock().await;
            if let Some(writer) = guard.as_mut() {
                let first = encode_user_message(spec.prompt);
                if let Err(e) = writer.write_all(first.as_bytes()).await {
                    warn!(error = %e, "failed to write prompt to assistant stdin");
                }
                let _ = writer.flush().await;
            }
            if spec.kind != CallKind::Execute {
                // Close stdin so the one-shot call starts processing.
                guard.take();
            }
        }

        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock().await;
            *active = Some(ActiveCall {
                cancel: cancel.clone(),
                stdin: Arc::clone(&stdin),
            });
        }

        // Collect stderr concurrently for failure reporting.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(pipe) = stderr.as_mut() {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut assistant_texts: Vec<String> = Vec::new();
        let mut init_session: Option<String> = None;

        let read_loop = async {
            let Some(stdout) = stdout else {
                return LoopOutcome::Eof;
            };
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        callbacks.emit_output(trimmed);

                        let events = match parse_stream_line(trimmed) {
                            Ok(events) => events,
                            Err(e) => {
                                warn!(line = trimmed, error = %e, "skipping malformed stream line");
                                continue;
                            }
                        };

                        for event in events {
                            callbacks.emit_event(event.clone());
                            match event {
                                StreamEvent::Init { session_id } => {
                                    init_session = Some(session_id);
                                }
                                StreamEvent::Assistant { text } => {
                                    assistant_texts.push(text);
                                }
                                StreamEvent::ToolUse { tool_name, tool_input } => {
                                    if is_question_tool(&tool_name) {
                                        self.route_question(&tool_input, &callbacks, &stdin).await;
                                    }
                                }
                                StreamEvent::Result { result, cost_usd, session_id } => {
                                    return LoopOutcome::Finished { result, cost_usd, session_id };
                                }
                                StreamEvent::Error { error } => {
                                    return LoopOutcome::Errored { error };
                                }
                            }
                        }
                    }
                    Ok(None) => return LoopOutcome::Eof,
                    Err(e) => {
                        warn!(error = %e, "error reading assistant stdout");
                        return LoopOutcome::Eof;
                    }
                }
            }
        };

        let outcome = tokio::select! {
            outcome = read_loop => Some(outcome),
            _ = tokio::time::sleep(spec.timeout) => None,
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                self.clear_active().await;
                return CallResult::err("aborted");
            }
        };

        self.clear_active().await;

        // Close stdin so the child sees EOF and can exit.
        stdin.lock().await.take();

        let Some(outcome) = outcome else {
            terminate(&mut child).await;
            return CallResult::err("timed out");
        };

        match outcome {
            LoopOutcome::Finished { result, cost_usd, session_id } => {
                let _ = tokio::time::timeout(TERM_GRACE, child.wait()).await;
                let session_id = session_id.or(init_session);
                match spec.kind {
                    CallKind::Plan => {
                        let plan = assistant_texts.join("\n");
                        if plan.trim().is_empty() {
                            CallResult {
                                success: false,
                                output: None,
                                session_id,
                                cost_usd,
                                error: Some("empty plan".to_string()),
                            }
                        } else {
                            CallResult {
                                success: true,
                                output: Some(plan),
                                session_id,
                                cost_usd,
                                error: None,
                            }
                        }
                    }
                    CallKind::Execute | CallKind::Prompt => {
                        let output = if result.is_empty() {
                            assistant_texts.join("\n")
                        } else {
                            result
                        };
                        CallResult {
                            success: true,
                            output: Some(output),
                            session_id,
                            cost_usd,
                            error: None,
                        }
                    }
                }
            }
            LoopOutcome::Errored { error } => {
                let _ = tokio::time::timeout(TERM_GRACE, child.wait()).await;
                CallResult {
                    success: false,
                    output: None,
                    session_id: init_session,
                    cost_usd: None,
                    error: Some(error),
                }
            }
            LoopOutcome::Eof => {
                let status = tokio::time::timeout(TERM_GRACE, child.wait()).await;
                let stderr_text = stderr_task.await.unwrap_or_default();
                let error = match status {
                    Ok(Ok(status)) if status.success() => {
                        "process exited without a result event".to_string()
                    }
                    Ok(Ok(status)) => {
                        let detail = stderr_text.trim();
                        if detail.is_empty() {
                            format!("process exited with {status} without a result event")
                        } else {
                            format!("process exited with {status}: {detail}")
                        }
                    }
                    _ => "process did not exit after closing stdout".to_string(),
                };
                CallResult {
                    success: false,
                    output: None,
                    session_id: init_session,
                    cost_usd: None,
                    error: Some(error),
                }
            }
        }
    }

    /// Route an interactive question through the handler and write the
    /// resolved answer to the child's stdin.
    async fn route_question(
        &self,
        tool_input: &serde_json::Value,
        callbacks: &ExecCallbacks,
        stdin: &Arc<Mutex<Option<ChildStdin>>>,
    ) {
        let Some(handler) = callbacks.questions.clone() else {
            warn!("assistant asked a question but no question handler is set");
            return;
        };

        let (id, text, options) = parse_question_input(tool_input);
        match handler.answer(&id, &text, &options).await {
            Ok(answer) => {
                let mut guard = stdin.lock().await;
                if let Some(writer) = guard.as_mut() {
                    let encoded = encode_user_message(&answer);
                    if let Err(e) = writer.write_all(encoded.as_bytes()).await {
                        warn!(question_id = %id, error = %e, "failed to write answer to stdin");
                    }
                    let _ = writer.flush().await;
                } else {
                    warn!(question_id = %id, "stdin already closed, dropping answer");
                }
            }
            Err(e) => {
                warn!(question_id = %id, error = %e, "question handler failed");
            }
        }
    }

    async fn clear_active(&self) {
        let mut active = self.active.lock().await;
        *active = None;
    }
}

/// Terminate the child: SIGTERM first, then SIGKILL after a grace period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid is a valid u32 from a child we spawned.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }

    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(Ok(_status)) => {
            debug!("assistant process exited after SIGTERM");
        }
        _ => {
            debug!("assistant process did not exit after SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
        }
    }
}

// ---------------------------------------------------------------------------
// AssistantDriver implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl AssistantDriver for ClaudeDriver {
    async fn generate_plan(
        &self,
        prompt: &str,
        opts: &CallOptions,
        output: Option<OutputSink>,
    ) -> CallResult {
        let callbacks = ExecCallbacks {
            events: None,
            output,
            questions: None,
        };
        self.run_call(
            CallSpec {
                kind: CallKind::Plan,
                prompt,
                model: opts.model.as_deref(),
                timeout: opts.timeout.unwrap_or(DEFAULT_TIMEOUT),
                cwd: opts.cwd.as_deref(),
                skip_permissions: false,
                session_id: None,
            },
            callbacks,
        )
        .await
    }

    async fn execute(
        &self,
        prompt: &str,
        opts: &ExecOptions,
        callbacks: ExecCallbacks,
    ) -> CallResult {
        self.run_call(
            CallSpec {
                kind: CallKind::Execute,
                prompt,
                model: opts.model.as_deref(),
                timeout: opts.timeout.unwrap_or(DEFAULT_TIMEOUT),
                cwd: opts.cwd.as_deref(),
                skip_permissions: opts.skip_permissions,
                session_id: opts.session_id.as_deref(),
            },
            callbacks,
        )
        .await
    }

    async fn resume(
        &self,
        session_id: &str,
        prompt: &str,
        opts: &ExecOptions,
        callbacks: ExecCallbacks,
    ) -> CallResult {
        self.run_call(
            CallSpec {
                kind: CallKind::Execute,
                prompt,
                model: opts.model.as_deref(),
                timeout: opts.timeout.unwrap_or(DEFAULT_TIMEOUT),
                cwd: opts.cwd.as_deref(),
                skip_permissions: opts.skip_permissions,
                session_id: Some(session_id),
            },
            callbacks,
        )
        .await
    }

    async fn run_prompt(&self, prompt: &str, opts: &CallOptions) -> CallResult {
        self.run_call(
            CallSpec {
                kind: CallKind::Prompt,
                prompt,
                model: opts.model.as_deref(),
                timeout: opts.timeout.unwrap_or(DEFAULT_TIMEOUT),
                cwd: opts.cwd.as_deref(),
                skip_permissions: false,
                session_id: None,
            },
            ExecCallbacks::default(),
        )
        .await
    }

    async fn abort(&self) {
        let active = self.active.lock().await;
        if let Some(call) = active.as_ref() {
            call.cancel.cancel();
        }
    }

    async fn answer_question(&self, text: &str) -> Result<()> {
        let stdin = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(call) => Arc::clone(&call.stdin),
                None => bail!("no assistant call is in flight"),
            }
        };

        let mut guard = stdin.lock().await;
        let writer = guard
            .as_mut()
            .context("assistant stdin is closed")?;
        writer
            .write_all(encode_user_message(text).as_bytes())
            .await
            .context("failed to write user message to assistant stdin")?;
        writer.flush().await.context("failed to flush assistant stdin")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- JSONL parsing tests -----------------------------------------------

    #[test]
    fn parse_init_event() {
        let line = r#"{"type":"init","session_id":"sess-42"}"#;
        let events = parse_stream_line(line).unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Init { session_id: "sess-42".to_string() }]
        );
    }

    #[test]
    fn parse_flat_assistant_text() {
        let line = r#"{"type":"assistant","text":"Here is the plan."}"#;
        let events = parse_stream_line(line).unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Assistant { text: "Here is the plan.".to_string() }]
        );
    }

    #[test]
    fn parse_nested_assistant_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"},{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}"#;
        let events = parse_stream_line(line).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Assistant { text: "hi".to_string() });
        assert_eq!(
            events[1],
            StreamEvent::ToolUse {
                tool_name: "Bash".to_string(),
                tool_input: serde_json::json!({"command": "ls"}),
            }
        );
    }

    #[test]
    fn parse_top_level_tool_use() {
        let line = r#"{"type":"tool_use","tool_name":"Read","tool_input":{"path":"/tmp/a.rs"}}"#;
        let events = parse_stream_line(line).unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::ToolUse {
                tool_name: "Read".to_string(),
                tool_input: serde_json::json!({"path": "/tmp/a.rs"}),
            }]
        );
    }

    #[test]
    fn parse_result_event() {
        let line = r#"{"type":"result","result":"Done.","cost_usd":0.42,"session_id":"sess-9"}"#;
        let events = parse_stream_line(line).unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Result {
                result: "Done.".to_string(),
                cost_usd: Some(0.42),
                session_id: Some("sess-9".to_string()),
            }]
        );
    }

    #[test]
    fn parse_error_event_string_and_object() {
        let flat = parse_stream_line(r#"{"type":"error","error":"rate limit exceeded"}"#).unwrap();
        assert_eq!(flat, vec![StreamEvent::Error { error: "rate limit exceeded".into() }]);

        let nested =
            parse_stream_line(r#"{"type":"error","error":{"message":"something broke"}}"#).unwrap();
        assert_eq!(nested, vec![StreamEvent::Error { error: "something broke".into() }]);
    }

    #[test]
    fn parse_unknown_type_returns_empty() {
        let events = parse_stream_line(r#"{"type":"system","data":"warmup"}"#).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn parse_malformed_json_returns_error() {
        assert!(parse_stream_line("this is not json").is_err());
    }

    // -- Question input parsing --------------------------------------------

    #[test]
    fn question_input_with_labeled_options() {
        let input = serde_json::json!({
            "id": "q-1",
            "question": "Which approach?",
            "options": [
                {"label": "Fast (recommended)", "value": "fast"},
                {"label": "Thorough", "value": "thorough"},
            ],
        });
        let (id, text, options) = parse_question_input(&input);
        assert_eq!(id, "q-1");
        assert_eq!(text, "Which approach?");
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].value, "fast");
        assert_eq!(options[1].label, "Thorough");
    }

    #[test]
    fn question_input_with_bare_string_options() {
        let input = serde_json::json!({"question": "Pick one", "options": ["a", "b"]});
        let (id, _text, options) = parse_question_input(&input);
        assert!(!id.is_empty(), "missing id should be generated");
        assert_eq!(options[0].label, "a");
        assert_eq!(options[0].value, "a");
    }

    #[test]
    fn question_tool_matching_is_case_insensitive() {
        assert!(is_question_tool("AskUserQuestion"));
        assert!(is_question_tool("askuserquestion"));
        assert!(is_question_tool("ask_user_question"));
        assert!(!is_question_tool("Bash"));
    }

    #[test]
    fn user_message_encoding() {
        let encoded = encode_user_message("yes");
        assert!(encoded.ends_with('\n'));
        let v: serde_json::Value = serde_json::from_str(encoded.trim()).unwrap();
        assert_eq!(v["type"], "user");
        assert_eq!(v["message"]["content"], "yes");
    }

    // -- Integration tests with fake subprocesses --------------------------

    use planbot_test_utils::fake_assistant;

    #[tokio::test]
    async fn plan_call_concatenates_assistant_text() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = fake_assistant::script(
            tmp.path(),
            &[
                r#"{"type":"init","session_id":"sess-1"}"#,
                r#"{"type":"assistant","text":"Step 1: read the code."}"#,
                r#"{"type":"assistant","text":"Step 2: write the fix."}"#,
                r#"{"type":"result","result":"","cost_usd":0.01}"#,
            ],
        );

        let driver = ClaudeDriver::with_binary(bin.to_str().unwrap());
        let result = driver
            .generate_plan("fix the bug", &CallOptions::default(), None)
            .await;

        assert!(result.success, "expected success, got {:?}", result.error);
        let plan = result.output.unwrap();
        assert!(plan.contains("Step 1"));
        assert!(plan.contains("Step 2"));
        assert_eq!(result.session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn empty_plan_is_a_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = fake_assistant::script(
            tmp.path(),
            &[r#"{"type":"result","result":"ok","cost_usd":0.0}"#],
        );

        let driver = ClaudeDriver::with_binary(bin.to_str().unwrap());
        let result = driver
            .generate_plan("plan please", &CallOptions::default(), None)
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("empty plan"));
    }

    #[tokio::test]
    async fn execute_reports_result_and_session() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = fake_assistant::script(
            tmp.path(),
            &[
                r#"{"type":"init","session_id":"sess-7"}"#,
                r#"{"type":"assistant","text":"working"}"#,
                r#"{"type":"result","result":"All tests pass.","cost_usd":0.30}"#,
            ],
        );

        let driver = ClaudeDriver::with_binary(bin.to_str().unwrap());
        let events: Arc<std::sync::Mutex<Vec<StreamEvent>>> = Arc::default();
        let events_clone = Arc::clone(&events);
        let callbacks = ExecCallbacks {
            events: Some(Arc::new(move |e| events_clone.lock().unwrap().push(e))),
            output: None,
            questions: None,
        };

        let result = driver
            .execute("do the work", &ExecOptions::default(), callbacks)
            .await;

        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("All tests pass."));
        assert_eq!(result.session_id.as_deref(), Some("sess-7"));
        assert_eq!(result.cost_usd, Some(0.30));
        // All events arrived in stream order.
        let seen = events.lock().unwrap();
        assert!(matches!(seen[0], StreamEvent::Init { .. }));
        assert!(matches!(seen.last().unwrap(), StreamEvent::Result { .. }));
    }

    #[tokio::test]
    async fn error_event_fails_the_call() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = fake_assistant::script(
            tmp.path(),
            &[r#"{"type":"error","error":"usage limit reached"}"#],
        );

        let driver = ClaudeDriver::with_binary(bin.to_str().unwrap());
        let result = driver
            .execute("work", &ExecOptions::default(), ExecCallbacks::default())
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("usage limit reached"));
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = fake_assistant::script(
            tmp.path(),
            &[
                "this is not json",
                r#"{"type":"assistant","text":"still here"}"#,
                "another bad line {{{{",
                r#"{"type":"result","result":"done"}"#,
            ],
        );

        let driver = ClaudeDriver::with_binary(bin.to_str().unwrap());
        let result = driver
            .execute("work", &ExecOptions::default(), ExecCallbacks::default())
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn nonzero_exit_without_result_captures_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = fake_assistant::failing_script(tmp.path(), "credentials missing", 3);

        let driver = ClaudeDriver::with_binary(bin.to_str().unwrap());
        let result = driver
            .execute("work", &ExecOptions::default(), ExecCallbacks::default())
            .await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("credentials missing"), "stderr should surface: {error}");
    }

    #[tokio::test]
    async fn timeout_terminates_the_child() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = fake_assistant::hanging_script(tmp.path());

        let driver = ClaudeDriver::with_binary(bin.to_str().unwrap());
        let opts = ExecOptions {
            timeout: Some(Duration::from_millis(300)),
            ..ExecOptions::default()
        };
        let start = std::time::Instant::now();
        let result = driver.execute("work", &opts, ExecCallbacks::default()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("timed out"));
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn abort_resolves_in_flight_call() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = fake_assistant::hanging_script(tmp.path());

        let driver = ClaudeDriver::with_binary(bin.to_str().unwrap());
        let call_driver = driver.clone();
        let call = tokio::spawn(async move {
            call_driver
                .execute("work", &ExecOptions::default(), ExecCallbacks::default())
                .await
        });

        // Give the call time to spawn, then abort it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        driver.abort().await;

        let result = call.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("aborted"));
    }

    #[tokio::test]
    async fn question_routed_and_answer_written_to_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        // Script: ask a question, echo the reply it reads back as the result.
        let bin = fake_assistant::questioning_script(tmp.path());

        struct CannedAnswer;

        #[async_trait]
        impl QuestionHandler for CannedAnswer {
            async fn answer(
                &self,
                _id: &str,
                text: &str,
                options: &[QuestionOption],
            ) -> Result<String> {
                assert_eq!(text, "Which database?");
                assert_eq!(options.len(), 2);
                Ok("postgres".to_string())
            }
        }

        let driver = ClaudeDriver::with_binary(bin.to_str().unwrap());
        let callbacks = ExecCallbacks {
            events: None,
            output: None,
            questions: Some(Arc::new(CannedAnswer)),
        };
        let result = driver
            .execute("work", &ExecOptions::default(), callbacks)
            .await;

        assert!(result.success, "expected success, got {:?}", result.error);
        // The fake echoes the answer content back through its result.
        assert!(
            result.output.as_deref().unwrap_or("").contains("postgres"),
            "answer should round-trip: {:?}",
            result.output
        );
    }

    #[tokio::test]
    async fn answer_question_without_active_call_errors() {
        let driver = ClaudeDriver::new();
        assert!(driver.answer_question("hello").await.is_err());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_not_panicked() {
        let driver = ClaudeDriver::with_binary("/nonexistent/path/to/assistant");
        let result = driver
            .execute("work", &ExecOptions::default(), ExecCallbacks::default())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("failed to spawn"));
    }
}
