//! Terminal provider: prints plans and questions to stdout and reads
//! replies line-by-line from stdin.
//!
//! The stdin reader runs as a background task started on connect; it checks
//! the connection flag each cycle and exits cleanly on disconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::driver::QuestionOption;

use super::parse::{parse_approval, parse_question_reply};
use super::{PlanApprovalRequest, Provider, QuestionRequest, ResponseRouter};

/// The request the next stdin line will be interpreted against.
enum PendingPrompt {
    Plan { plan_id: String },
    Question {
        question_id: String,
        options: Vec<QuestionOption>,
    },
}

pub struct TerminalProvider {
    router: Arc<ResponseRouter>,
    connected: Arc<AtomicBool>,
    pending: Arc<Mutex<Option<PendingPrompt>>>,
    reader_cancel: Mutex<Option<CancellationToken>>,
}

impl TerminalProvider {
    pub fn new(router: Arc<ResponseRouter>) -> Self {
        Self {
            router,
            connected: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(Mutex::new(None)),
            reader_cancel: Mutex::new(None),
        }
    }

    fn spawn_reader(&self) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let connected = Arc::clone(&self.connected);
        let pending = Arc::clone(&self.pending);
        let router = Arc::clone(&self.router);

        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            loop {
                if !connected.load(Ordering::SeqCst) {
                    break;
                }
                let line = tokio::select! {
                    _ = token.cancelled() => break,
                    line = lines.next_line() => line,
                };
                let Ok(Some(line)) = line else { break };

                let prompt = pending.lock().unwrap().take();
                match prompt {
                    Some(PendingPrompt::Plan { plan_id }) => {
                        let response = parse_approval(&line);
                        router.resolve_approval(&plan_id, response);
                    }
                    Some(PendingPrompt::Question { question_id, options }) => {
                        let response = parse_question_reply(&line, &options);
                        router.resolve_question(&question_id, response);
                    }
                    None => {
                        debug!(line = line.trim(), "ignoring terminal input with no pending prompt");
                    }
                }
            }
        });

        cancel
    }
}

#[async_trait]
impl Provider for TerminalProvider {
    fn name(&self) -> &str {
        "terminal"
    }

    async fn connect(&self) -> Result<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cancel = self.spawn_reader();
        *self.reader_cancel.lock().unwrap() = Some(cancel);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.reader_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        self.pending.lock().unwrap().take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_plan_for_approval(&self, request: &PlanApprovalRequest) -> Result<()> {
        println!();
        println!("=== Plan for ticket {} ({}) ===", request.ticket_id, request.title);
        println!("{}", request.plan);
        println!("=== Reply to approve or reject ===");
        println!("Type y/yes/approve to approve, or anything else to reject (text becomes feedback):");

        *self.pending.lock().unwrap() = Some(PendingPrompt::Plan {
            plan_id: request.plan_id.clone(),
        });
        Ok(())
    }

    async fn send_question(&self, request: &QuestionRequest) -> Result<()> {
        println!();
        println!("=== Question for ticket {} ===", request.ticket_id);
        println!("{}", request.text);
        if !request.options.is_empty() {
            for (i, option) in request.options.iter().enumerate() {
                println!("  {}. {}", i + 1, option.label);
            }
            println!("Reply with a number or an option label:");
        } else {
            println!("Reply with your answer:");
        }

        *self.pending.lock().unwrap() = Some(PendingPrompt::Question {
            question_id: request.question_id.clone(),
            options: request.options.clone(),
        });
        Ok(())
    }

    async fn send_status(&self, text: &str) -> Result<()> {
        println!("[planbot] {text}");
        Ok(())
    }
}
