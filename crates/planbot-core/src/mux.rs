//! Approval/question multiplexer.
//!
//! Fans each request out to every connected provider concurrently and races
//! their replies: the first response to reach the [`ResponseRouter`] wins,
//! later callbacks for the same id are no-ops. Each request carries its own
//! timeout; expiry clears the pending entry and surfaces an error event.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::events::{EventSink, OrchestratorEvent};
use crate::provider::{
    ApprovalResponse, PlanApprovalRequest, Provider, QuestionRequest, QuestionResponse,
    ResponseRouter,
};

/// Errors surfaced to multiplexer callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MuxError {
    #[error("{operation} request {id:?} timed out")]
    Timeout { operation: &'static str, id: String },

    #[error("{operation} request {id:?} aborted")]
    Aborted { operation: &'static str, id: String },
}

/// Fan-out/fan-in hub over a set of channel providers.
pub struct Multiplexer {
    providers: Mutex<Vec<Arc<dyn Provider>>>,
    router: Arc<ResponseRouter>,
    approval_timeout: Duration,
    question_timeout: Duration,
    events: Mutex<Option<Arc<dyn EventSink>>>,
}

impl Multiplexer {
    pub fn new(
        router: Arc<ResponseRouter>,
        approval_timeout: Duration,
        question_timeout: Duration,
    ) -> Self {
        Self {
            providers: Mutex::new(Vec::new()),
            router,
            approval_timeout,
            question_timeout,
            events: Mutex::new(None),
        }
    }

    /// Attach an observer for the multiplexer's `error` events.
    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        *self.events.lock().unwrap() = Some(sink);
    }

    /// The router providers resolve responses through.
    pub fn router(&self) -> Arc<ResponseRouter> {
        Arc::clone(&self.router)
    }

    pub fn add_provider(&self, provider: Arc<dyn Provider>) {
        self.providers.lock().unwrap().push(provider);
    }

    /// Remove a provider by name. Returns `true` if one was removed.
    pub fn remove_provider(&self, name: &str) -> bool {
        let mut providers = self.providers.lock().unwrap();
        let before = providers.len();
        providers.retain(|p| p.name() != name);
        providers.len() != before
    }

    fn snapshot(&self) -> Vec<Arc<dyn Provider>> {
        self.providers.lock().unwrap().clone()
    }

    fn connected(&self) -> Vec<Arc<dyn Provider>> {
        self.snapshot()
            .into_iter()
            .filter(|p| p.is_connected())
            .collect()
    }

    fn emit_error(&self, message: String) {
        let sink = self.events.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.emit(OrchestratorEvent::Error { message });
        }
    }

    /// Connect every provider. A provider that fails to connect is logged
    /// and left disconnected; fan-outs simply skip it.
    pub async fn connect_all(&self) {
        for provider in self.snapshot() {
            if provider.is_connected() {
                continue;
            }
            if let Err(e) = provider.connect().await {
                warn!(provider = provider.name(), error = %e, "provider failed to connect");
            }
        }
    }

    /// Disconnect every provider and abort all still-pending requests.
    pub async fn disconnect_all(&self) {
        for provider in self.snapshot() {
            if let Err(e) = provider.disconnect().await {
                warn!(provider = provider.name(), error = %e, "provider failed to disconnect");
            }
        }
        self.router.cancel_all();
    }

    /// Present a plan to every connected provider and wait for the first
    /// verdict.
    pub async fn request_approval(
        &self,
        request: &PlanApprovalRequest,
    ) -> Result<ApprovalResponse, MuxError> {
        let rx = self.router.register_approval(&request.plan_id);

        let providers = self.connected();
        debug!(
            plan_id = %request.plan_id,
            providers = providers.len(),
            "fanning out approval request"
        );
        let sends = providers.iter().map(|p| {
            let provider = Arc::clone(p);
            async move {
                if let Err(e) = provider.send_plan_for_approval(request).await {
                    warn!(provider = provider.name(), error = %e, "approval send failed");
                }
            }
        });
        join_all(sends).await;

        match tokio::time::timeout(self.approval_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_dropped)) => Err(MuxError::Aborted {
                operation: "approval",
                id: request.plan_id.clone(),
            }),
            Err(_elapsed) => {
                self.router.cancel_approval(&request.plan_id);
                let err = MuxError::Timeout {
                    operation: "approval",
                    id: request.plan_id.clone(),
                };
                self.emit_error(err.to_string());
                Err(err)
            }
        }
    }

    /// Forward a question to every connected provider and wait for the first
    /// answer.
    pub async fn ask_question(
        &self,
        request: &QuestionRequest,
    ) -> Result<QuestionResponse, MuxError> {
        let rx = self.router.register_question(&request.question_id);

        let providers = self.connected();
        debug!(
            question_id = %request.question_id,
            providers = providers.len(),
            "fanning out question"
        );
        let sends = providers.iter().map(|p| {
            let provider = Arc::clone(p);
            async move {
                if let Err(e) = provider.send_question(request).await {
                    warn!(provider = provider.name(), error = %e, "question send failed");
                }
            }
        });
        join_all(sends).await;

        match tokio::time::timeout(self.question_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_dropped)) => Err(MuxError::Aborted {
                operation: "question",
                id: request.question_id.clone(),
            }),
            Err(_elapsed) => {
                self.router.cancel_question(&request.question_id);
                let err = MuxError::Timeout {
                    operation: "question",
                    id: request.question_id.clone(),
                };
                self.emit_error(err.to_string());
                Err(err)
            }
        }
    }

    /// Send a status line to every connected provider. Best-effort: failures
    /// are logged and swallowed.
    pub async fn broadcast_status(&self, text: &str) {
        let providers = self.connected();
        let sends = providers.iter().map(|p| {
            let provider = Arc::clone(p);
            async move {
                if let Err(e) = provider.send_status(text).await {
                    warn!(provider = provider.name(), error = %e, "status send failed");
                }
            }
        });
        join_all(sends).await;
    }

    /// Abort a pending approval; its waiter observes [`MuxError::Aborted`].
    pub fn cancel_approval(&self, plan_id: &str) {
        self.router.cancel_approval(plan_id);
    }

    /// Abort a pending question.
    pub fn cancel_question(&self, question_id: &str) {
        self.router.cancel_question(question_id);
    }
}
