//! Queue orchestrator: sequences tickets through plan → approve → execute,
//! one ticket at a time, with retries, rate-limit model fallback, plan
//! revision loops, and resumption from persisted state.
//!
//! Concurrency lives below this layer (the driver's reader, provider polling
//! loops, multiplexer waits); the dispatch loop itself is strictly
//! sequential and persists every phase transition before the next driver
//! call begins.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use planbot_store::{PendingQuestion, Phase, StateStore, TicketStatus};

use crate::config::Config;
use crate::driver::{
    AssistantDriver, CallOptions, CallResult, ExecCallbacks, ExecOptions, QuestionHandler,
    QuestionOption, StreamEvent,
};
use crate::events::{EventSink, OrchestratorEvent};
use crate::hooks::{HookContext, HookPoint, HookRunner, Hooks};
use crate::mux::{Multiplexer, MuxError};
use crate::provider::{ApprovalResponse, PlanApprovalRequest, QuestionRequest};
use crate::queue::Ticket;
use crate::ratelimit::{is_rate_limit, should_fallback};

/// Prompt used when resuming a prior driver session.
const RESUME_PROMPT: &str = "Continue from where you left off.";

/// Answer used when an autonomous run gets a question with no options.
const BEST_JUDGEMENT: &str = "use your best judgement";

/// Snapshot returned by [`Orchestrator::get_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub running: bool,
    pub current_ticket_id: Option<String>,
    pub current_phase: Phase,
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Where to pick up a ticket that was interrupted mid-phase.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ResumePoint {
    /// Re-ask for approval using the persisted plan (regenerate if absent).
    ReAskApproval,
    /// Resume execution from the saved session, or re-execute from the plan.
    ReExecute,
}

/// The ticket currently being processed, for control-plane calls.
#[derive(Debug, Default)]
struct CurrentTicket {
    ticket_id: String,
    /// Pending approval id, while awaiting approval.
    plan_id: Option<String>,
    skip_requested: bool,
}

/// How processing one ticket ended.
enum TicketOutcome {
    Completed,
    Failed(String),
    Skipped(String),
    /// stop()/pause() interrupted the ticket; the queue loop winds down.
    Paused,
}

struct Inner {
    config: Config,
    driver: Arc<dyn AssistantDriver>,
    mux: Arc<Multiplexer>,
    store: StateStore,
    events: Arc<dyn EventSink>,
    hooks: Hooks,
    hook_runner: HookRunner,
    queue_path: Option<PathBuf>,
    cwd: Option<PathBuf>,
    tickets: Mutex<Vec<Ticket>>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    pause_requested: AtomicBool,
    phase: Mutex<Phase>,
    current: Mutex<Option<CurrentTicket>>,
    resume_directive: Mutex<Option<(String, ResumePoint)>>,
}

/// The queue-driven ticket state machine.
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build an orchestrator. Validates the merged config once.
    pub fn new(
        config: Config,
        tickets: Vec<Ticket>,
        driver: Arc<dyn AssistantDriver>,
        mux: Arc<Multiplexer>,
        store: StateStore,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        mux.set_event_sink(Arc::clone(&events));
        let hook_runner = HookRunner::new(
            Arc::clone(&driver),
            config.allow_shell_hooks,
            config.model.clone(),
            config.fallback_model.clone(),
            None,
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                driver,
                mux,
                store,
                events,
                hooks: Hooks::default(),
                hook_runner,
                queue_path: None,
                cwd: None,
                tickets: Mutex::new(tickets),
                running: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                pause_requested: AtomicBool::new(false),
                phase: Mutex::new(Phase::Idle),
                current: Mutex::new(None),
                resume_directive: Mutex::new(None),
            }),
        })
    }

    /// Attach queue-level hooks.
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_hooks must be called before the orchestrator is shared")
            .hooks = hooks;
        self
    }

    /// Attach the queue file path, enabling `complete` write-back.
    pub fn with_queue_path(mut self, path: PathBuf) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_queue_path must be called before the orchestrator is shared")
            .queue_path = Some(path);
        self
    }

    /// Working directory handed to the driver and to shell hooks.
    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_cwd must be called before the orchestrator is shared");
        inner.cwd = Some(cwd.clone());
        inner.hook_runner.set_cwd(Some(cwd));
        self
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Current queue snapshot.
    pub fn get_status(&self) -> QueueStatus {
        let tickets = self.inner.tickets.lock().unwrap();
        let count = |status: TicketStatus| tickets.iter().filter(|t| t.status == status).count();
        QueueStatus {
            running: self.is_running(),
            current_ticket_id: self
                .inner
                .current
                .lock()
                .unwrap()
                .as_ref()
                .map(|c| c.ticket_id.clone()),
            current_phase: *self.inner.phase.lock().unwrap(),
            total: tickets.len(),
            pending: count(TicketStatus::Pending),
            completed: count(TicketStatus::Completed),
            failed: count(TicketStatus::Failed),
            skipped: count(TicketStatus::Skipped),
        }
    }

    /// Append a ticket to the in-memory queue. Dynamically queued tickets
    /// run after the file tickets, in append order, and survive re-entry.
    pub fn queue_ticket(&self, ticket: Ticket) -> Result<()> {
        let mut tickets = self.inner.tickets.lock().unwrap();
        if tickets.iter().any(|t| t.id == ticket.id) {
            bail!("ticket {:?} is already queued", ticket.id);
        }
        tickets.push(ticket);
        Ok(())
    }

    /// Mark a ticket to be skipped. Pending tickets are skipped on the
    /// spot; the currently running ticket has its in-flight waits aborted.
    pub async fn skip_ticket(&self, ticket_id: &str) -> Result<()> {
        let is_current = {
            let mut current = self.inner.current.lock().unwrap();
            match current.as_mut() {
                Some(c) if c.ticket_id == ticket_id => {
                    c.skip_requested = true;
                    if let Some(plan_id) = &c.plan_id {
                        self.inner.mux.cancel_approval(plan_id);
                    }
                    true
                }
                _ => false,
            }
        };
        if is_current {
            self.inner.driver.abort().await;
            return Ok(());
        }

        let mut tickets = self.inner.tickets.lock().unwrap();
        let ticket = tickets
            .iter_mut()
            .find(|t| t.id == ticket_id)
            .with_context(|| format!("unknown ticket id {ticket_id:?}"))?;
        if ticket.status != TicketStatus::Pending {
            bail!(
                "cannot skip ticket {ticket_id:?}: status is {}, expected pending",
                ticket.status
            );
        }
        ticket.status = TicketStatus::Skipped;
        self.inner.events.emit(OrchestratorEvent::TicketSkipped {
            ticket_id: ticket_id.to_string(),
            reason: "skipped by operator".to_string(),
        });
        Ok(())
    }

    /// Resolve the pending approval for a ticket with an approval.
    pub fn approve_ticket(&self, ticket_id: &str) -> Result<()> {
        self.resolve_approval_for(ticket_id, ApprovalResponse {
            approved: true,
            reason: None,
            responded_by: Some("control-plane".to_string()),
        })
    }

    /// Resolve the pending approval for a ticket with a rejection.
    pub fn reject_ticket(&self, ticket_id: &str, reason: Option<String>) -> Result<()> {
        self.resolve_approval_for(ticket_id, ApprovalResponse {
            approved: false,
            reason,
            responded_by: Some("control-plane".to_string()),
        })
    }

    fn resolve_approval_for(&self, ticket_id: &str, response: ApprovalResponse) -> Result<()> {
        let plan_id = {
            let current = self.inner.current.lock().unwrap();
            match current.as_ref() {
                Some(c) if c.ticket_id == ticket_id => c.plan_id.clone(),
                Some(c) => bail!(
                    "ticket {ticket_id:?} is not awaiting approval (current ticket is {:?})",
                    c.ticket_id
                ),
                None => bail!("unknown or inactive ticket id {ticket_id:?}"),
            }
        };
        let plan_id = plan_id
            .with_context(|| format!("ticket {ticket_id:?} has no pending approval"))?;
        if !self.inner.mux.router().resolve_approval(&plan_id, response) {
            bail!("approval for ticket {ticket_id:?} was already resolved");
        }
        Ok(())
    }

    /// Answer a pending question by id.
    pub fn answer_question(&self, question_id: &str, answer: &str) -> Result<()> {
        let resolved = self.inner.mux.router().resolve_question(
            question_id,
            crate::provider::QuestionResponse {
                answer: answer.to_string(),
                matched_option: false,
                responded_by: Some("control-plane".to_string()),
            },
        );
        if !resolved {
            bail!("unknown or already-answered question id {question_id:?}");
        }
        Ok(())
    }

    /// Request a graceful pause: the current ticket finishes, then the queue
    /// stops and `queue:paused` is emitted.
    pub async fn pause(&self) -> Result<()> {
        self.inner.pause_requested.store(true, Ordering::SeqCst);
        self.inner
            .store
            .update(|s| s.pause_requested = true)
            .await
            .context("failed to persist pause request")?;
        Ok(())
    }

    /// Hard stop: abort the driver, persist the pause flag, abort in-flight
    /// approvals/questions, disconnect providers.
    pub async fn stop(&self) -> Result<()> {
        self.inner.pause_requested.store(true, Ordering::SeqCst);
        self.inner.cancel.lock().unwrap().cancel();
        self.inner.driver.abort().await;
        self.inner
            .store
            .update(|s| s.pause_requested = true)
            .await
            .context("failed to persist pause request")?;
        self.inner.mux.disconnect_all().await;
        Ok(())
    }

    /// Resume a previous run from persisted state, re-entering the phase the
    /// process was killed in.
    pub async fn resume(&self) -> Result<()> {
        let state = self.inner.store.load().await?;
        if let Some(ticket_id) = &state.current_ticket_id {
            let point = match state.current_phase {
                Phase::Idle | Phase::Planning => None,
                Phase::AwaitingApproval => Some(ResumePoint::ReAskApproval),
                Phase::Executing => Some(ResumePoint::ReExecute),
            };
            // Planning re-enters plan generation naturally; the other two
            // phases get explicit directives.
            if let Some(point) = point {
                *self.inner.resume_directive.lock().unwrap() =
                    Some((ticket_id.clone(), point));
            }
            info!(
                ticket_id = %ticket_id,
                phase = %state.current_phase,
                "resuming interrupted run"
            );
        }
        self.inner
            .store
            .update(|s| s.pause_requested = false)
            .await?;
        self.start().await
    }

    /// Run the queue to completion. Fails if the orchestrator is already
    /// running; may be called again after a stop or natural completion (the
    /// queue file is not re-read, so dynamically queued tickets persist).
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            bail!("orchestrator is already running");
        }

        let result = self.run_queue().await;

        self.inner.running.store(false, Ordering::SeqCst);
        *self.inner.current.lock().unwrap() = None;
        result
    }

    async fn run_queue(&self) -> Result<()> {
        let inner = &self.inner;

        // Fresh cancellation scope per run.
        *inner.cancel.lock().unwrap() = CancellationToken::new();
        inner.pause_requested.store(false, Ordering::SeqCst);

        inner.store.init().await.context("failed to initialize state store")?;
        inner
            .store
            .update(|s| s.pause_requested = false)
            .await
            .context("failed to clear persisted pause flag")?;

        let total = {
            let tickets = inner.tickets.lock().unwrap();
            tickets
                .iter()
                .filter(|t| !t.complete && !t.status.is_terminal())
                .count()
        };
        inner.events.emit(OrchestratorEvent::QueueStart { total });
        inner.mux.connect_all().await;
        inner
            .mux
            .broadcast_status(&format!("Queue started: {total} ticket(s) to process"))
            .await;

        self.run_hooks(&inner.hooks, HookPoint::BeforeAll, &HookContext::default())
            .await;

        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut skipped = 0usize;
        let mut broke_on_error = false;

        loop {
            // A pause may come from this process (pause()/stop()) or from
            // another process writing the persisted flag.
            let store_paused = self
                .inner
                .store
                .load()
                .await
                .map(|s| s.pause_requested)
                .unwrap_or(false);
            if self.interrupted() || store_paused {
                // The interrupted phase stays persisted so resume() can
                // re-enter it; only the pause flag is updated here.
                self.run_hooks(&inner.hooks, HookPoint::AfterAll, &HookContext::default())
                    .await;
                inner.events.emit(OrchestratorEvent::QueuePaused);
                inner.mux.broadcast_status("Queue paused").await;
                inner.mux.disconnect_all().await;
                return Ok(());
            }

            let next = self.next_dispatch();
            let ticket = match next {
                Dispatch::Run(ticket) => ticket,
                Dispatch::SkipForDependency { ticket_id, reason } => {
                    self.set_ticket_status(&ticket_id, TicketStatus::Skipped);
                    skipped += 1;
                    inner.events.emit(OrchestratorEvent::TicketSkipped { ticket_id, reason });
                    continue;
                }
                Dispatch::Done => break,
            };

            match self.process_ticket(ticket).await {
                TicketOutcome::Completed => completed += 1,
                TicketOutcome::Skipped(_) => skipped += 1,
                TicketOutcome::Paused => continue, // loop top handles wind-down
                TicketOutcome::Failed(error) => {
                    failed += 1;
                    if !inner.config.continue_on_error {
                        inner.events.emit(OrchestratorEvent::Error {
                            message: format!("queue stopped after ticket failure: {error}"),
                        });
                        broke_on_error = true;
                        break;
                    }
                }
            }
        }

        self.persist_phase(None, Phase::Idle).await;
        self.run_hooks(&inner.hooks, HookPoint::AfterAll, &HookContext::default())
            .await;

        inner.events.emit(OrchestratorEvent::QueueComplete { completed, failed, skipped });
        inner
            .mux
            .broadcast_status(&format!(
                "Queue complete: {completed} completed, {failed} failed, {skipped} skipped"
            ))
            .await;
        inner.mux.disconnect_all().await;

        if broke_on_error {
            bail!("queue stopped after a ticket failure (continue_on_error is off)");
        }
        Ok(())
    }

    // -- Dispatch ----------------------------------------------------------

    fn interrupted(&self) -> bool {
        self.inner.cancel.lock().unwrap().is_cancelled()
            || self.inner.pause_requested.load(Ordering::SeqCst)
    }

    fn next_dispatch(&self) -> Dispatch {
        let tickets = self.inner.tickets.lock().unwrap();
        let by_id: HashMap<&str, &Ticket> =
            tickets.iter().map(|t| (t.id.as_str(), t)).collect();

        for ticket in tickets.iter() {
            if ticket.complete || ticket.status != TicketStatus::Pending {
                continue;
            }

            let mut blocked = false;
            for dep in &ticket.dependencies {
                match by_id.get(dep.as_str()) {
                    Some(d) if d.complete || d.status == TicketStatus::Completed => {}
                    Some(d)
                        if d.status == TicketStatus::Failed
                            || d.status == TicketStatus::Skipped =>
                    {
                        return Dispatch::SkipForDependency {
                            ticket_id: ticket.id.clone(),
                            reason: format!("dependency {:?} {}", dep, d.status),
                        };
                    }
                    Some(_) => {
                        // Dependency still pending; it comes first.
                        blocked = true;
                        break;
                    }
                    None => {
                        // Unknown deps are rejected at load; a dynamically
                        // queued ticket may still reference one.
                        return Dispatch::SkipForDependency {
                            ticket_id: ticket.id.clone(),
                            reason: format!("unknown dependency {dep:?}"),
                        };
                    }
                }
            }
            if blocked {
                continue;
            }
            return Dispatch::Run(ticket.clone());
        }
        Dispatch::Done
    }

    // -- Ticket processing -------------------------------------------------

    async fn process_ticket(&self, ticket: Ticket) -> TicketOutcome {
        let inner = &self.inner;
        let ticket_id = ticket.id.clone();

        *inner.current.lock().unwrap() = Some(CurrentTicket {
            ticket_id: ticket_id.clone(),
            plan_id: None,
            skip_requested: false,
        });

        inner.events.emit(OrchestratorEvent::TicketStart { ticket_id: ticket_id.clone() });
        let _ = inner.store.append_log(&ticket_id, "ticket started").await;

        let hooks = match &ticket.hooks {
            Some(overlay) => inner.hooks.overlay(overlay),
            None => inner.hooks.clone(),
        };
        let hook_ctx = HookContext {
            ticket_id: Some(ticket_id.clone()),
            ticket_title: Some(ticket.title.clone()),
        };
        self.run_hooks(&hooks, HookPoint::BeforeEach, &hook_ctx).await;

        let outcome = self.drive_ticket(&ticket, &hooks, &hook_ctx).await;

        match &outcome {
            TicketOutcome::Completed => {
                self.set_ticket_status(&ticket_id, TicketStatus::Completed);
                if let Some(queue_path) = &inner.queue_path {
                    if let Err(e) = inner.store.mark_ticket_complete(queue_path, &ticket_id).await {
                        warn!(ticket_id = %ticket_id, error = %e, "failed to write complete flag back to queue file");
                    }
                }
                let _ = inner.store.append_log(&ticket_id, "ticket completed").await;
                self.run_hooks(&hooks, HookPoint::OnComplete, &hook_ctx).await;
            }
            TicketOutcome::Failed(error) => {
                self.set_ticket_status(&ticket_id, TicketStatus::Failed);
                let _ = inner
                    .store
                    .append_log(&ticket_id, &format!("ticket failed: {error}"))
                    .await;
                inner.events.emit(OrchestratorEvent::TicketFailed {
                    ticket_id: ticket_id.clone(),
                    error: error.clone(),
                });
                self.run_hooks(&hooks, HookPoint::OnError, &hook_ctx).await;
            }
            TicketOutcome::Skipped(reason) => {
                self.set_ticket_status(&ticket_id, TicketStatus::Skipped);
                let _ = inner
                    .store
                    .append_log(&ticket_id, &format!("ticket skipped: {reason}"))
                    .await;
                inner.events.emit(OrchestratorEvent::TicketSkipped {
                    ticket_id: ticket_id.clone(),
                    reason: reason.clone(),
                });
            }
            TicketOutcome::Paused => {
                // Leave the ticket pending so resume() picks it up.
                self.set_ticket_status(&ticket_id, TicketStatus::Pending);
                let _ = inner.store.append_log(&ticket_id, "ticket interrupted").await;
            }
        }

        if !matches!(outcome, TicketOutcome::Paused) {
            // The ticket reached a terminal status; the durable phase goes
            // back to idle so a crash between tickets resumes cleanly.
            self.persist_phase(None, Phase::Idle).await;
        }
        self.run_hooks(&hooks, HookPoint::AfterEach, &hook_ctx).await;
        *inner.current.lock().unwrap() = None;
        outcome
    }

    /// Plan/approve/execute one ticket. Status bookkeeping and terminal
    /// events are the caller's job.
    async fn drive_ticket(
        &self,
        ticket: &Ticket,
        hooks: &Hooks,
        hook_ctx: &HookContext,
    ) -> TicketOutcome {
        let inner = &self.inner;
        let ticket_id = &ticket.id;
        let plan_mode = ticket.plan_mode.unwrap_or(inner.config.plan_mode);

        let resume_point = {
            let mut directive = inner.resume_directive.lock().unwrap();
            match directive.take() {
                Some((id, point)) if id == *ticket_id => Some(point),
                other => {
                    *directive = other;
                    None
                }
            }
        };

        // Resume into execution directly when the prior run died there.
        if resume_point == Some(ResumePoint::ReExecute) {
            let saved_plan = inner.store.load_plan(ticket_id).await.unwrap_or(None);
            let session = inner.store.load_session(ticket_id).await.unwrap_or(None);
            return self
                .execute_ticket(ticket, saved_plan.as_deref(), session, hooks)
                .await;
        }

        let mut plan: Option<String> = None;

        if plan_mode {
            // An interrupted awaiting_approval phase re-uses the saved plan.
            let mut saved = None;
            if resume_point == Some(ResumePoint::ReAskApproval) {
                saved = inner.store.load_plan(ticket_id).await.unwrap_or(None);
                if saved.is_none() {
                    debug!(ticket_id = %ticket_id, "no saved plan to resume with, regenerating");
                }
            }

            match self
                .plan_and_approve(ticket, saved, hooks, hook_ctx)
                .await
            {
                PlanOutcome::Approved(text) => plan = Some(text),
                PlanOutcome::Skip(reason) => return TicketOutcome::Skipped(reason),
                PlanOutcome::Fail(error) => return TicketOutcome::Failed(error),
                PlanOutcome::Paused => return TicketOutcome::Paused,
            }
        }

        self.execute_ticket(ticket, plan.as_deref(), None, hooks).await
    }

    /// The plan generation + approval revision loop.
    async fn plan_and_approve(
        &self,
        ticket: &Ticket,
        saved_plan: Option<String>,
        hooks: &Hooks,
        hook_ctx: &HookContext,
    ) -> PlanOutcome {
        let inner = &self.inner;
        let ticket_id = &ticket.id;
        let mut revisions = 0u32;
        let mut feedback: Option<(String, String)> = None; // (prior plan, reason)
        let mut plan = saved_plan;

        loop {
            if self.interrupted() {
                return PlanOutcome::Paused;
            }

            // Generate (or regenerate) unless resuming with a saved plan.
            let plan_text = match plan.take() {
                Some(text) => text,
                None => {
                    self.persist_phase(Some(ticket_id.as_str()), Phase::Planning).await;
                    self.set_ticket_status(ticket_id, TicketStatus::Planning);

                    let prompt = build_plan_prompt(ticket, feedback.as_ref());
                    let opts_timeout = inner.config.timeouts.plan_generation();
                    let result = self
                        .call_with_fallback(|model| {
                            let driver = Arc::clone(&inner.driver);
                            let prompt = prompt.clone();
                            let cwd = inner.cwd.clone();
                            async move {
                                driver
                                    .generate_plan(
                                        &prompt,
                                        &CallOptions { model, timeout: Some(opts_timeout), cwd },
                                        None,
                                    )
                                    .await
                            }
                        })
                        .await;

                    if self.aborted_result(&result) {
                        return PlanOutcome::Paused;
                    }
                    if !result.success {
                        return PlanOutcome::Fail(
                            result.error.unwrap_or_else(|| "plan generation failed".into()),
                        );
                    }
                    match result.output {
                        Some(text) if !text.trim().is_empty() => text,
                        // Empty plan output is fatal for the ticket.
                        _ => return PlanOutcome::Fail("empty plan".to_string()),
                    }
                }
            };

            if let Err(e) = inner.store.save_plan(ticket_id, &plan_text).await {
                warn!(ticket_id = %ticket_id, error = %e, "failed to persist plan");
            }
            inner.events.emit(OrchestratorEvent::TicketPlanGenerated {
                ticket_id: ticket_id.clone(),
                plan: plan_text.clone(),
            });
            self.run_hooks(hooks, HookPoint::OnPlanGenerated, hook_ctx).await;

            if inner.config.auto_approve {
                inner.events.emit(OrchestratorEvent::TicketApproved {
                    ticket_id: ticket_id.clone(),
                });
                return PlanOutcome::Approved(plan_text);
            }

            // Ask the humans.
            self.persist_phase(Some(ticket_id.as_str()), Phase::AwaitingApproval).await;
            self.set_ticket_status(ticket_id, TicketStatus::AwaitingApproval);

            let plan_id = format!("plan-{}-{}", ticket_id, uuid::Uuid::new_v4());
            if let Some(current) = self.inner.current.lock().unwrap().as_mut() {
                current.plan_id = Some(plan_id.clone());
            }

            let request = PlanApprovalRequest {
                plan_id: plan_id.clone(),
                ticket_id: ticket_id.clone(),
                title: ticket.title.clone(),
                plan: plan_text.clone(),
            };
            let approval = inner.mux.request_approval(&request).await;

            if let Some(current) = self.inner.current.lock().unwrap().as_mut() {
                current.plan_id = None;
            }

            let response = match approval {
                Ok(response) => response,
                Err(MuxError::Aborted { .. }) if self.skip_requested() => {
                    return PlanOutcome::Skip("skipped by operator".to_string());
                }
                Err(_) if self.interrupted() => return PlanOutcome::Paused,
                Err(e) => return PlanOutcome::Fail(e.to_string()),
            };

            if response.approved {
                inner.events.emit(OrchestratorEvent::TicketApproved {
                    ticket_id: ticket_id.clone(),
                });
                self.run_hooks(hooks, HookPoint::OnApproval, hook_ctx).await;
                return PlanOutcome::Approved(plan_text);
            }

            // Rejections always emit, whether or not a revision follows.
            let reason = response.reason.clone().filter(|r| !r.trim().is_empty());
            inner.events.emit(OrchestratorEvent::TicketRejected {
                ticket_id: ticket_id.clone(),
                reason: reason.clone(),
            });

            match reason {
                None => return PlanOutcome::Skip("plan rejected".to_string()),
                Some(reason) if revisions < inner.config.max_plan_revisions => {
                    revisions += 1;
                    info!(
                        ticket_id = %ticket_id,
                        revision = revisions,
                        "plan rejected with feedback, revising"
                    );
                    feedback = Some((plan_text, reason));
                }
                Some(_) => {
                    return PlanOutcome::Skip(format!(
                        "plan rejected after {revisions} revision(s)"
                    ));
                }
            }
        }
    }

    /// Execute (or resume) a ticket, with the normal retry loop. The
    /// rate-limit fallback wraps every attempt and does not consume retries.
    async fn execute_ticket(
        &self,
        ticket: &Ticket,
        plan: Option<&str>,
        session: Option<String>,
        hooks: &Hooks,
    ) -> TicketOutcome {
        let inner = &self.inner;
        let ticket_id = ticket.id.clone();

        self.persist_phase(Some(ticket_id.as_str()), Phase::Executing).await;
        self.set_ticket_status(&ticket_id, TicketStatus::Executing);
        inner.events.emit(OrchestratorEvent::TicketExecuting { ticket_id: ticket_id.clone() });

        let callbacks = self.exec_callbacks(&ticket_id, hooks);
        let prompt = build_execute_prompt(ticket, plan);
        let timeout = inner.config.timeouts.execution();

        let mut resume_session = session;
        let mut retries = 0u32;

        loop {
            if self.interrupted() {
                return TicketOutcome::Paused;
            }

            let result = match resume_session.take() {
                Some(session_id) => {
                    self.call_with_fallback(|model| {
                        let driver = Arc::clone(&inner.driver);
                        let callbacks = callbacks.clone();
                        let session_id = session_id.clone();
                        let cwd = inner.cwd.clone();
                        let skip_permissions = inner.config.skip_permissions;
                        async move {
                            driver
                                .resume(
                                    &session_id,
                                    RESUME_PROMPT,
                                    &ExecOptions {
                                        model,
                                        skip_permissions,
                                        timeout: Some(timeout),
                                        cwd,
                                        session_id: None,
                                    },
                                    callbacks,
                                )
                                .await
                        }
                    })
                    .await
                }
                None => {
                    self.call_with_fallback(|model| {
                        let driver = Arc::clone(&inner.driver);
                        let callbacks = callbacks.clone();
                        let prompt = prompt.clone();
                        let cwd = inner.cwd.clone();
                        let skip_permissions = inner.config.skip_permissions;
                        async move {
                            driver
                                .execute(
                                    &prompt,
                                    &ExecOptions {
                                        model,
                                        skip_permissions,
                                        timeout: Some(timeout),
                                        cwd,
                                        session_id: None,
                                    },
                                    callbacks,
                                )
                                .await
                        }
                    })
                    .await
                }
            };

            if let Some(session_id) = &result.session_id {
                if let Err(e) = inner.store.save_session(&ticket_id, session_id).await {
                    warn!(ticket_id = %ticket_id, error = %e, "failed to persist session token");
                }
                let _ = inner
                    .store
                    .update(|s| s.session_id = Some(session_id.clone()))
                    .await;
            }

            if result.success {
                if let (Some(budget), Some(cost)) =
                    (inner.config.max_budget_per_ticket, result.cost_usd)
                {
                    if cost > budget {
                        warn!(
                            ticket_id = %ticket_id,
                            cost_usd = cost,
                            budget_usd = budget,
                            "ticket exceeded its budget"
                        );
                    }
                }
                inner.events.emit(OrchestratorEvent::TicketCompleted {
                    ticket_id: ticket_id.clone(),
                    cost_usd: result.cost_usd,
                });
                return TicketOutcome::Completed;
            }

            if self.aborted_result(&result) {
                if self.skip_requested() {
                    return TicketOutcome::Skipped("skipped by operator".to_string());
                }
                return TicketOutcome::Paused;
            }

            let error = result.error.unwrap_or_else(|| "execution failed".into());
            if retries >= inner.config.max_retries {
                return TicketOutcome::Failed(error);
            }
            retries += 1;
            warn!(
                ticket_id = %ticket_id,
                retry = retries,
                max_retries = inner.config.max_retries,
                error = %error,
                "execution failed, retrying"
            );
            let _ = inner
                .store
                .append_log(&ticket_id, &format!("retry {retries} after error: {error}"))
                .await;
        }
    }

    // -- Helpers -----------------------------------------------------------

    /// Run a driver call, retrying once on the fallback model when the first
    /// attempt classifies as rate-limited. The fallback attempt never
    /// consumes a normal retry slot.
    async fn call_with_fallback<F, Fut>(&self, call: F) -> CallResult
    where
        F: Fn(Option<String>) -> Fut,
        Fut: std::future::Future<Output = CallResult>,
    {
        let config = &self.inner.config;
        let result = call(config.model.clone()).await;
        if !result.success
            && is_rate_limit(&result)
            && should_fallback(config.model.as_deref(), config.fallback_model.as_deref())
        {
            info!(
                fallback = config.fallback_model.as_deref().unwrap_or("none"),
                "rate limit detected, retrying once with fallback model"
            );
            return call(config.fallback_model.clone()).await;
        }
        result
    }

    fn exec_callbacks(&self, ticket_id: &str, hooks: &Hooks) -> ExecCallbacks {
        let inner = Arc::clone(&self.inner);
        let events_ticket = ticket_id.to_string();
        let events_inner = Arc::clone(&inner);
        let events: crate::driver::EventSinkFn = Arc::new(move |event: StreamEvent| {
            events_inner.events.emit(OrchestratorEvent::TicketEvent {
                ticket_id: events_ticket.clone(),
                payload: stream_event_payload(&event),
            });
        });

        let output_ticket = ticket_id.to_string();
        let output_inner = Arc::clone(&inner);
        let output: crate::driver::OutputSink = Arc::new(move |chunk: &str| {
            output_inner.events.emit(OrchestratorEvent::TicketOutput {
                ticket_id: output_ticket.clone(),
                chunk: chunk.to_string(),
            });
            let store = output_inner.store.clone();
            let ticket_id = output_ticket.clone();
            let line = chunk.to_string();
            tokio::spawn(async move {
                let _ = store.append_log(&ticket_id, &line).await;
            });
        });

        let questions: Arc<dyn QuestionHandler> = Arc::new(TicketQuestionHandler {
            inner,
            ticket_id: ticket_id.to_string(),
            hooks: hooks.clone(),
        });

        ExecCallbacks {
            events: Some(events),
            output: Some(output),
            questions: Some(questions),
        }
    }

    fn aborted_result(&self, result: &CallResult) -> bool {
        !result.success && result.error.as_deref() == Some("aborted")
    }

    fn skip_requested(&self) -> bool {
        self.inner
            .current
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|c| c.skip_requested)
    }

    fn set_ticket_status(&self, ticket_id: &str, status: TicketStatus) {
        let mut tickets = self.inner.tickets.lock().unwrap();
        if let Some(ticket) = tickets.iter_mut().find(|t| t.id == ticket_id) {
            ticket.status = status;
        }
    }

    async fn persist_phase(&self, ticket_id: Option<&str>, phase: Phase) {
        *self.inner.phase.lock().unwrap() = phase;
        let ticket_id = ticket_id.map(str::to_string);
        let result = self
            .inner
            .store
            .update(move |s| {
                s.current_ticket_id = ticket_id;
                s.current_phase = phase;
                if phase == Phase::Idle {
                    s.session_id = None;
                }
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to persist phase transition");
        }
    }

    async fn run_hooks(&self, hooks: &Hooks, point: HookPoint, ctx: &HookContext) {
        let results = self.inner.hook_runner.run_point(hooks, point, ctx).await;
        for result in results.iter().filter(|r| !r.success) {
            debug!(
                point = point.name(),
                error = result.error.as_deref().unwrap_or("unknown"),
                "hook reported failure"
            );
        }
    }
}

enum Dispatch {
    Run(Ticket),
    SkipForDependency { ticket_id: String, reason: String },
    Done,
}

enum PlanOutcome {
    Approved(String),
    Skip(String),
    Fail(String),
    Paused,
}

// ---------------------------------------------------------------------------
// Question handling
// ---------------------------------------------------------------------------

/// Routes driver questions either to the multiplexer (interactive runs) or
/// to the auto-answer policy (autonomous runs).
struct TicketQuestionHandler {
    inner: Arc<Inner>,
    ticket_id: String,
    hooks: Hooks,
}

#[async_trait]
impl QuestionHandler for TicketQuestionHandler {
    async fn answer(
        &self,
        question_id: &str,
        text: &str,
        options: &[QuestionOption],
    ) -> Result<String> {
        let inner = &self.inner;
        inner.events.emit(OrchestratorEvent::Question {
            ticket_id: self.ticket_id.clone(),
            question_id: question_id.to_string(),
            text: text.to_string(),
        });

        // onQuestion prompt hooks can contribute context for the answer.
        let hook_ctx = HookContext {
            ticket_id: Some(self.ticket_id.clone()),
            ticket_title: None,
        };
        let hints: Vec<String> = inner
            .hook_runner
            .run_point(&self.hooks, HookPoint::OnQuestion, &hook_ctx)
            .await
            .into_iter()
            .filter(|r| r.success)
            .filter_map(|r| r.output)
            .collect();

        if inner.config.autonomous_answers() {
            let mut answer = auto_answer(options);
            if !hints.is_empty() {
                answer = format!("{answer}\n\nAdditional context:\n{}", hints.join("\n"));
            }
            debug!(question_id, answer = %answer, "auto-answering question");
            return Ok(answer);
        }

        inner
            .store
            .add_pending_question(PendingQuestion {
                id: question_id.to_string(),
                ticket_id: self.ticket_id.clone(),
                text: text.to_string(),
                asked_at: Utc::now(),
            })
            .await
            .ok();

        let response = inner
            .mux
            .ask_question(&QuestionRequest {
                question_id: question_id.to_string(),
                ticket_id: self.ticket_id.clone(),
                text: text.to_string(),
                options: options.to_vec(),
            })
            .await;

        inner.store.remove_pending_question(question_id).await.ok();

        match response {
            Ok(response) => Ok(response.answer),
            Err(e) => Err(e.into()),
        }
    }
}

/// Pick the answer for a question no human will see: the option whose label
/// contains "(recommended)" (case-insensitive), else the first option, else
/// a free-text judgement call.
pub fn auto_answer(options: &[QuestionOption]) -> String {
    if let Some(option) = options
        .iter()
        .find(|o| o.label.to_lowercase().contains("(recommended)"))
    {
        return option.value.clone();
    }
    if let Some(first) = options.first() {
        return first.value.clone();
    }
    BEST_JUDGEMENT.to_string()
}

// ---------------------------------------------------------------------------
// Prompt building
// ---------------------------------------------------------------------------

fn ticket_brief(ticket: &Ticket) -> String {
    let mut brief = format!("Ticket {}: {}\n\n{}\n", ticket.id, ticket.title, ticket.description);
    if !ticket.acceptance_criteria.is_empty() {
        brief.push_str("\nAcceptance criteria:\n");
        for criterion in &ticket.acceptance_criteria {
            brief.push_str(&format!("- {criterion}\n"));
        }
    }
    if !ticket.images.is_empty() {
        brief.push_str("\nReference images:\n");
        for image in &ticket.images {
            brief.push_str(&format!("- {image}\n"));
        }
    }
    brief
}

fn build_plan_prompt(ticket: &Ticket, feedback: Option<&(String, String)>) -> String {
    let mut prompt = format!(
        "Create a detailed implementation plan for the following ticket. \
         Do not make any changes yet; produce the plan only.\n\n{}",
        ticket_brief(ticket)
    );

    if let Some((previous_plan, reason)) = feedback {
        prompt.push_str(&format!(
            "\n## Previous Plan Feedback\n\n\
             The previous plan was rejected. Revise it to address the feedback.\n\n\
             Previous plan:\n{previous_plan}\n\nFeedback:\n{reason}\n"
        ));
    }

    prompt
}

fn build_execute_prompt(ticket: &Ticket, plan: Option<&str>) -> String {
    let mut prompt = format!("Implement the following ticket.\n\n{}", ticket_brief(ticket));
    if let Some(plan) = plan {
        prompt.push_str(&format!("\nFollow this approved plan:\n{plan}\n"));
    }
    prompt
}

fn stream_event_payload(event: &StreamEvent) -> serde_json::Value {
    match event {
        StreamEvent::Init { session_id } => {
            serde_json::json!({"type": "init", "session_id": session_id})
        }
        StreamEvent::Assistant { text } => {
            serde_json::json!({"type": "assistant", "text": text})
        }
        StreamEvent::ToolUse { tool_name, tool_input } => {
            serde_json::json!({"type": "tool_use", "tool_name": tool_name, "tool_input": tool_input})
        }
        StreamEvent::Result { result, cost_usd, session_id } => {
            serde_json::json!({
                "type": "result",
                "result": result,
                "cost_usd": cost_usd,
                "session_id": session_id,
            })
        }
        StreamEvent::Error { error } => {
            serde_json::json!({"type": "error", "error": error})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn option(label: &str, value: &str) -> QuestionOption {
        QuestionOption { label: label.into(), value: value.into() }
    }

    #[test]
    fn auto_answer_prefers_recommended_case_insensitively() {
        let options = vec![
            option("Quick fix", "quick"),
            option("Full refactor (RECOMMENDED)", "refactor"),
        ];
        assert_eq!(auto_answer(&options), "refactor");
    }

    #[test]
    fn auto_answer_falls_back_to_first_option() {
        let options = vec![option("One", "1"), option("Two", "2")];
        assert_eq!(auto_answer(&options), "1");
    }

    #[test]
    fn auto_answer_without_options_uses_judgement() {
        assert_eq!(auto_answer(&[]), "use your best judgement");
    }

    #[test]
    fn plan_prompt_embeds_feedback_section() {
        let ticket = Ticket::new("T1", "Add logging", "Wire tracing through the worker.");
        let bare = build_plan_prompt(&ticket, None);
        assert!(bare.contains("Add logging"));
        assert!(!bare.contains("Previous Plan Feedback"));

        let feedback = ("old plan text".to_string(), "add logging".to_string());
        let revised = build_plan_prompt(&ticket, Some(&feedback));
        assert!(revised.contains("Previous Plan Feedback"));
        assert!(revised.contains("old plan text"));
        assert!(revised.contains("add logging"));
    }

    #[test]
    fn execute_prompt_includes_plan_and_criteria() {
        let mut ticket = Ticket::new("T1", "Add logging", "Wire tracing.");
        ticket.acceptance_criteria = vec!["logs are structured".into()];
        let prompt = build_execute_prompt(&ticket, Some("1. do it"));
        assert!(prompt.contains("Wire tracing."));
        assert!(prompt.contains("logs are structured"));
        assert!(prompt.contains("Follow this approved plan"));
        assert!(prompt.contains("1. do it"));

        let no_plan = build_execute_prompt(&ticket, None);
        assert!(!no_plan.contains("approved plan"));
    }

    #[test]
    fn stream_event_payload_round_trips_type() {
        let payload = stream_event_payload(&StreamEvent::Result {
            result: "ok".into(),
            cost_usd: Some(0.1),
            session_id: None,
        });
        assert_eq!(payload["type"], "result");
        assert_eq!(payload["cost_usd"], 0.1);
    }
}
