//! The channel-provider seam.
//!
//! A provider delivers plans, questions, and status updates to one channel
//! (terminal, chat bot, webhook) and resolves replies back through the
//! [`ResponseRouter`] it was constructed with. The router owns the pending
//! maps; map entries hold only the response senders, never back-pointers,
//! so providers and the multiplexer stay acyclic.

pub mod parse;
pub mod telegram;
pub mod terminal;

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use crate::driver::QuestionOption;

/// A plan presented for human approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanApprovalRequest {
    pub plan_id: String,
    pub ticket_id: String,
    pub title: String,
    pub plan: String,
}

/// The human's verdict on a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalResponse {
    pub approved: bool,
    pub reason: Option<String>,
    pub responded_by: Option<String>,
}

/// A clarifying question forwarded to the human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionRequest {
    pub question_id: String,
    pub ticket_id: String,
    pub text: String,
    pub options: Vec<QuestionOption>,
}

/// The human's answer to a question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionResponse {
    pub answer: String,
    pub matched_option: bool,
    pub responded_by: Option<String>,
}

/// A delivery channel. Implementations own their connection state and any
/// reply-correlation bookkeeping; responses come back through the router.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Establish the channel. Must be idempotent.
    async fn connect(&self) -> Result<()>;

    /// Tear the channel down. Must be idempotent.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn send_plan_for_approval(&self, request: &PlanApprovalRequest) -> Result<()>;

    async fn send_question(&self, request: &QuestionRequest) -> Result<()>;

    /// Best-effort status message; failures are the caller's to log.
    async fn send_status(&self, text: &str) -> Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Provider) {}
};

/// Routes provider responses to whoever is waiting on them.
///
/// The first resolution for an id wins: taking the sender out of the map is
/// a single locked remove, so concurrent callbacks for the same id cannot
/// both observe it. Later resolutions are no-ops.
#[derive(Default)]
pub struct ResponseRouter {
    approvals: Mutex<HashMap<String, oneshot::Sender<ApprovalResponse>>>,
    questions: Mutex<HashMap<String, oneshot::Sender<QuestionResponse>>>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending approval and get the receiving half. An existing
    /// entry for the same id is replaced (its waiter sees an abort).
    pub fn register_approval(&self, plan_id: &str) -> oneshot::Receiver<ApprovalResponse> {
        let (tx, rx) = oneshot::channel();
        self.approvals.lock().unwrap().insert(plan_id.to_string(), tx);
        rx
    }

    /// Register a pending question and get the receiving half.
    pub fn register_question(&self, question_id: &str) -> oneshot::Receiver<QuestionResponse> {
        let (tx, rx) = oneshot::channel();
        self.questions.lock().unwrap().insert(question_id.to_string(), tx);
        rx
    }

    /// Deliver an approval response. Returns `true` if this call won the
    /// race (a pending entry existed and was resolved).
    pub fn resolve_approval(&self, plan_id: &str, response: ApprovalResponse) -> bool {
        let sender = self.approvals.lock().unwrap().remove(plan_id);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(plan_id, "dropping approval response with no pending entry");
                false
            }
        }
    }

    /// Deliver a question response. Returns `true` if this call won the race.
    pub fn resolve_question(&self, question_id: &str, response: QuestionResponse) -> bool {
        let sender = self.questions.lock().unwrap().remove(question_id);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(question_id, "dropping question response with no pending entry");
                false
            }
        }
    }

    /// Remove a pending approval without resolving it. The waiter observes
    /// the dropped sender as an abort.
    pub fn cancel_approval(&self, plan_id: &str) -> bool {
        self.approvals.lock().unwrap().remove(plan_id).is_some()
    }

    /// Remove a pending question without resolving it.
    pub fn cancel_question(&self, question_id: &str) -> bool {
        self.questions.lock().unwrap().remove(question_id).is_some()
    }

    /// Drop every pending entry; all waiters observe aborts.
    pub fn cancel_all(&self) {
        self.approvals.lock().unwrap().clear();
        self.questions.lock().unwrap().clear();
    }

    /// Whether an approval with this id is still pending.
    pub fn has_pending_approval(&self, plan_id: &str) -> bool {
        self.approvals.lock().unwrap().contains_key(plan_id)
    }

    /// Whether a question with this id is still pending.
    pub fn has_pending_question(&self, question_id: &str) -> bool {
        self.questions.lock().unwrap().contains_key(question_id)
    }
}
