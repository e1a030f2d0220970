//! Shared fixtures for the integration suites: a scripted driver, a
//! programmable approval provider, and event-collection helpers.

// Each integration binary compiles its own copy; not all of them use
// every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use planbot_core::driver::{
    AssistantDriver, CallOptions, CallResult, ExecCallbacks, ExecOptions, OutputSink,
    QuestionOption,
};
use planbot_core::events::OrchestratorEvent;
use planbot_core::provider::{
    ApprovalResponse, PlanApprovalRequest, Provider, QuestionRequest, ResponseRouter,
};

/// One driver invocation as the scripted driver saw it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub op: &'static str,
    pub prompt: String,
    pub model: Option<String>,
    pub session_id: Option<String>,
}

/// A question the scripted driver should ask mid-execute.
#[derive(Debug, Clone)]
pub struct QuestionScript {
    pub id: String,
    pub text: String,
    pub options: Vec<QuestionOption>,
}

/// Driver fake that pops canned results per operation and records every
/// call. Also probes the persisted phase at execute time so tests can
/// assert transitions are written before driver calls.
#[derive(Default)]
pub struct ScriptedDriver {
    plan_results: Mutex<VecDeque<CallResult>>,
    exec_results: Mutex<VecDeque<CallResult>>,
    prompt_results: Mutex<VecDeque<CallResult>>,
    pub calls: Mutex<Vec<RecordedCall>>,
    pub question: Mutex<Option<QuestionScript>>,
    pub answers: Mutex<Vec<String>>,
    pub state_probe_root: Mutex<Option<PathBuf>>,
    pub observed_phases: Mutex<Vec<String>>,
}

impl ScriptedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_plan(&self, result: CallResult) {
        self.plan_results.lock().unwrap().push_back(result);
    }

    pub fn push_exec(&self, result: CallResult) {
        self.exec_results.lock().unwrap().push_back(result);
    }

    pub fn push_prompt(&self, result: CallResult) {
        self.prompt_results.lock().unwrap().push_back(result);
    }

    /// Arm a question to be asked on the next execute call.
    pub fn ask_on_execute(&self, script: QuestionScript) {
        *self.question.lock().unwrap() = Some(script);
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, op: &str) -> Vec<RecordedCall> {
        self.recorded().into_iter().filter(|c| c.op == op).collect()
    }

    fn pop(queue: &Mutex<VecDeque<CallResult>>) -> CallResult {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| CallResult::ok("done"))
    }

    fn probe_phase(&self) {
        let root = self.state_probe_root.lock().unwrap().clone();
        if let Some(root) = root {
            let path = root.join(".planbot").join("state.json");
            if let Ok(content) = std::fs::read_to_string(path) {
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(&content) {
                    if let Some(phase) = json.get("currentPhase").and_then(|p| p.as_str()) {
                        self.observed_phases.lock().unwrap().push(phase.to_string());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl AssistantDriver for ScriptedDriver {
    async fn generate_plan(
        &self,
        prompt: &str,
        opts: &CallOptions,
        _output: Option<OutputSink>,
    ) -> CallResult {
        self.calls.lock().unwrap().push(RecordedCall {
            op: "plan",
            prompt: prompt.to_string(),
            model: opts.model.clone(),
            session_id: None,
        });
        Self::pop(&self.plan_results)
    }

    async fn execute(
        &self,
        prompt: &str,
        opts: &ExecOptions,
        callbacks: ExecCallbacks,
    ) -> CallResult {
        self.calls.lock().unwrap().push(RecordedCall {
            op: "execute",
            prompt: prompt.to_string(),
            model: opts.model.clone(),
            session_id: opts.session_id.clone(),
        });
        self.probe_phase();

        let script = self.question.lock().unwrap().take();
        if let Some(script) = script {
            if let Some(handler) = &callbacks.questions {
                if let Ok(answer) = handler
                    .answer(&script.id, &script.text, &script.options)
                    .await
                {
                    self.answers.lock().unwrap().push(answer);
                }
            }
        }

        Self::pop(&self.exec_results)
    }

    async fn resume(
        &self,
        session_id: &str,
        prompt: &str,
        opts: &ExecOptions,
        _callbacks: ExecCallbacks,
    ) -> CallResult {
        self.calls.lock().unwrap().push(RecordedCall {
            op: "resume",
            prompt: prompt.to_string(),
            model: opts.model.clone(),
            session_id: Some(session_id.to_string()),
        });
        Self::pop(&self.exec_results)
    }

    async fn run_prompt(&self, prompt: &str, opts: &CallOptions) -> CallResult {
        self.calls.lock().unwrap().push(RecordedCall {
            op: "prompt",
            prompt: prompt.to_string(),
            model: opts.model.clone(),
            session_id: None,
        });
        Self::pop(&self.prompt_results)
    }

    async fn abort(&self) {}

    async fn answer_question(&self, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Provider fake that answers each approval request with the next scripted
/// response, resolving through the router shortly after the send.
pub struct ScriptedApprovals {
    name: String,
    router: Arc<ResponseRouter>,
    connected: AtomicBool,
    /// One entry per expected approval request; `None` means stay silent
    /// and let the caller resolve (or cancel) out of band.
    responses: Mutex<VecDeque<Option<ApprovalResponse>>>,
    question_answers: Mutex<VecDeque<String>>,
    pub approval_requests: Mutex<Vec<PlanApprovalRequest>>,
    pub question_requests: Mutex<Vec<QuestionRequest>>,
}

impl ScriptedApprovals {
    pub fn new(name: &str, router: Arc<ResponseRouter>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            router,
            connected: AtomicBool::new(false),
            responses: Mutex::new(VecDeque::new()),
            question_answers: Mutex::new(VecDeque::new()),
            approval_requests: Mutex::new(Vec::new()),
            question_requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push_question_answer(&self, answer: &str) {
        self.question_answers
            .lock()
            .unwrap()
            .push_back(answer.to_string());
    }

    pub fn push_response(&self, response: ApprovalResponse) {
        self.responses.lock().unwrap().push_back(Some(response));
    }

    /// The next approval request gets no reply from this provider.
    pub fn push_silence(&self) {
        self.responses.lock().unwrap().push_back(None);
    }

    pub fn push_approve(&self) {
        self.push_response(ApprovalResponse {
            approved: true,
            reason: None,
            responded_by: Some(self.name.clone()),
        });
    }

    pub fn push_reject(&self, reason: Option<&str>) {
        self.push_response(ApprovalResponse {
            approved: false,
            reason: reason.map(str::to_string),
            responded_by: Some(self.name.clone()),
        });
    }
}

#[async_trait]
impl Provider for ScriptedApprovals {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_plan_for_approval(&self, request: &PlanApprovalRequest) -> anyhow::Result<()> {
        self.approval_requests.lock().unwrap().push(request.clone());
        let response = self.responses.lock().unwrap().pop_front().flatten();
        if let Some(response) = response {
            let router = Arc::clone(&self.router);
            let plan_id = request.plan_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                router.resolve_approval(&plan_id, response);
            });
        }
        Ok(())
    }

    async fn send_question(&self, request: &QuestionRequest) -> anyhow::Result<()> {
        self.question_requests.lock().unwrap().push(request.clone());
        let answer = self.question_answers.lock().unwrap().pop_front();
        if let Some(answer) = answer {
            let router = Arc::clone(&self.router);
            let question_id = request.question_id.clone();
            let options = request.options.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                router.resolve_question(
                    &question_id,
                    planbot_core::provider::parse::parse_question_reply(&answer, &options),
                );
            });
        }
        Ok(())
    }

    async fn send_status(&self, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Drain every event the sink captured during a finished run.
pub fn drain_events(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<OrchestratorEvent>,
) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// The names of events concerning one ticket (or queue-level events), in
/// emission order.
pub fn event_names<'a>(events: &'a [OrchestratorEvent], ticket_id: Option<&str>) -> Vec<&'a str> {
    events
        .iter()
        .filter(|e| match ticket_id {
            Some(id) => e.ticket_id() == Some(id),
            None => e.ticket_id().is_none(),
        })
        .map(|e| e.name())
        .collect()
}
