//! Telegram provider: reply-correlating chat channel.
//!
//! Plans and questions go out via `sendMessage`; the server-assigned message
//! id of each prompt is tracked so that user replies (`reply_to_message`)
//! can be correlated back to the pending request. Replies are consumed via
//! `getUpdates` with an advancing offset, so every update is seen at most
//! once even when it is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::driver::QuestionOption;

use super::parse::{parse_approval, parse_question_reply};
use super::{PlanApprovalRequest, Provider, QuestionRequest, ResponseRouter};

const TELEGRAM_API: &str = "https://api.telegram.org/bot";

/// Chunk size limit for outbound messages. Telegram caps messages at 4096
/// characters; we stay under it to leave room for chunk markers.
pub const MAX_CHUNK_LEN: usize = 3996;

/// Base poll interval.
const BASE_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Poll interval growth factor per empty cycle.
const BACKOFF_FACTOR: f64 = 1.3;

/// Poll interval cap.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the Telegram provider.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Only replies originating from this chat are accepted.
    pub chat_id: i64,
    /// Override of the Bot API base URL, for tests.
    pub api_base: Option<String>,
}

/// What an outbound prompt message was for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TrackedMessage {
    Plan { plan_id: String },
    Question {
        question_id: String,
        options: Vec<QuestionOption>,
    },
}

/// All shared state lives behind `Arc`s so the polling task can hold a
/// clone of the provider.
#[derive(Clone)]
pub struct TelegramProvider {
    config: TelegramConfig,
    client: Client,
    router: Arc<ResponseRouter>,
    connected: Arc<AtomicBool>,
    /// Outbound message id -> pending request it belongs to.
    tracked: Arc<Mutex<HashMap<i64, TrackedMessage>>>,
    /// Next `getUpdates` offset; advanced past every consumed update.
    offset: Arc<AtomicI64>,
    poller: Arc<Mutex<Option<CancellationToken>>>,
}

impl TelegramProvider {
    pub fn new(config: TelegramConfig, router: Arc<ResponseRouter>) -> Self {
        Self {
            config,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to create reqwest client"),
            router,
            connected: Arc::new(AtomicBool::new(false)),
            tracked: Arc::new(Mutex::new(HashMap::new())),
            offset: Arc::new(AtomicI64::new(0)),
            poller: Arc::new(Mutex::new(None)),
        }
    }

    fn api_url(&self, method: &str) -> String {
        match &self.config.api_base {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), method),
            None => format!("{}{}/{}", TELEGRAM_API, self.config.bot_token, method),
        }
    }

    // -- HTTP helpers ------------------------------------------------------

    async fn api_get_updates(&self, offset: i64) -> Result<Vec<Value>> {
        let resp = self
            .client
            .get(self.api_url("getUpdates"))
            .query(&[("offset", offset.to_string()), ("timeout", "0".to_string())])
            .send()
            .await
            .context("getUpdates request failed")?;
        if !resp.status().is_success() {
            bail!("getUpdates returned {}", resp.status());
        }
        let json: Value = resp.json().await.context("getUpdates returned invalid JSON")?;
        Ok(json
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Send one message, optionally without tracking, returning its
    /// server-assigned message id.
    async fn api_send_message(&self, text: &str) -> Result<i64> {
        let body = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": text,
        });
        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .context("sendMessage request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            bail!("sendMessage returned {status}: {detail}");
        }
        let json: Value = resp.json().await.context("sendMessage returned invalid JSON")?;
        json.get("result")
            .and_then(|r| r.get("message_id"))
            .and_then(|id| id.as_i64())
            .context("sendMessage response missing message_id")
    }

    // -- Update handling ---------------------------------------------------

    /// Handle one update. Returns `true` when the update resolved a tracked
    /// request. The caller advances the offset regardless.
    fn process_update(&self, update: &Value) -> bool {
        let Some(message) = update.get("message") else {
            return false;
        };

        // Security: replies from any other chat are rejected outright.
        let chat_id = message
            .get("chat")
            .and_then(|c| c.get("id"))
            .and_then(|id| id.as_i64());
        if chat_id != Some(self.config.chat_id) {
            warn!(
                chat_id = ?chat_id,
                expected = self.config.chat_id,
                "rejecting reply from unexpected chat"
            );
            return false;
        }

        // Replies without text (photo-only, stickers) are ignored.
        let Some(text) = message.get("text").and_then(|t| t.as_str()) else {
            return false;
        };

        // Only replies to a tracked prompt message correlate.
        let Some(reply_to) = message
            .get("reply_to_message")
            .and_then(|r| r.get("message_id"))
            .and_then(|id| id.as_i64())
        else {
            debug!("ignoring chat message with no reply_to linkage");
            return false;
        };

        let entry = self.tracked.lock().unwrap().remove(&reply_to);
        let Some(entry) = entry else {
            debug!(reply_to, "reply references an untracked message");
            return false;
        };

        let responded_by = message
            .get("from")
            .and_then(|f| f.get("username"))
            .and_then(|u| u.as_str())
            .map(str::to_string);

        match entry {
            TrackedMessage::Plan { plan_id } => {
                let mut response = parse_approval(text);
                response.responded_by = responded_by;
                self.router.resolve_approval(&plan_id, response)
            }
            TrackedMessage::Question { question_id, options } => {
                let mut response = parse_question_reply(text, &options);
                response.responded_by = responded_by;
                self.router.resolve_question(&question_id, response)
            }
        }
    }

    /// Drop the tracked entry for a request that was resolved elsewhere
    /// (another provider won the race, or the request was cancelled).
    fn untrack_stale(&self) {
        let router = &self.router;
        self.tracked.lock().unwrap().retain(|_, entry| match entry {
            TrackedMessage::Plan { plan_id } => router.has_pending_approval(plan_id),
            TrackedMessage::Question { question_id, .. } => {
                router.has_pending_question(question_id)
            }
        });
    }

    // -- Polling loop ------------------------------------------------------

    /// Start the polling loop if it is not already running. The loop stops
    /// itself when no tracked messages remain.
    fn ensure_polling(&self) {
        let mut poller = self.poller.lock().unwrap();
        if poller.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *poller = Some(cancel.clone());
        drop(poller);

        let provider = self.clone();
        tokio::spawn(async move {
            provider.poll_loop(cancel).await;
        });
    }

    async fn poll_loop(self, cancel: CancellationToken) {
        let mut interval = BASE_POLL_INTERVAL;
        loop {
            if cancel.is_cancelled() || !self.connected.load(Ordering::SeqCst) {
                break;
            }

            self.untrack_stale();
            if self.tracked.lock().unwrap().is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let offset = self.offset.load(Ordering::SeqCst);
            match self.api_get_updates(offset).await {
                Ok(updates) => {
                    let mut matched_any = false;
                    for update in &updates {
                        if let Some(update_id) = update.get("update_id").and_then(|i| i.as_i64()) {
                            // At-most-once: advance past every consumed
                            // update, matching or not.
                            self.offset.fetch_max(update_id + 1, Ordering::SeqCst);
                        }
                        if self.process_update(update) {
                            matched_any = true;
                        }
                    }
                    interval = if matched_any {
                        BASE_POLL_INTERVAL
                    } else {
                        next_interval(interval)
                    };
                }
                Err(e) => {
                    warn!(error = %e, "telegram poll cycle failed");
                }
            }
        }

        // Allow a later send to restart the loop.
        self.poller.lock().unwrap().take();
        debug!("telegram polling loop stopped");
    }
}

/// Grow the poll interval by the backoff factor, capped.
fn next_interval(current: Duration) -> Duration {
    let grown = current.mul_f64(BACKOFF_FACTOR);
    grown.min(MAX_POLL_INTERVAL)
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// Split `text` into chunks of at most `limit` bytes.
///
/// Splits prefer the last newline in the window, then the last space, and
/// hard-cut only when neither sits past the halfway point (so no chunk ends
/// more than 50% short of the limit because of a boundary). Newlines chosen
/// as split points are dropped; concatenating the chunks otherwise yields
/// the input.
pub fn chunk_message(text: &str, limit: usize) -> Vec<String> {
    assert!(limit > 0, "chunk limit must be positive");
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        if rest.len() <= limit {
            chunks.push(rest.to_string());
            break;
        }

        let window_end = floor_char_boundary(rest, limit);
        let window = &rest[..window_end];
        let min_cut = limit / 2;

        // Newline boundary: chunk excludes the newline, which is dropped.
        if let Some(pos) = window.rfind('\n').filter(|p| *p >= min_cut) {
            chunks.push(rest[..pos].to_string());
            rest = &rest[pos + 1..];
            continue;
        }

        // Space boundary: the space stays at the end of the chunk.
        if let Some(pos) = window.rfind(' ').filter(|p| *p >= min_cut) {
            chunks.push(rest[..=pos].to_string());
            rest = &rest[pos + 1..];
            continue;
        }

        chunks.push(window.to_string());
        rest = &rest[window_end..];
    }

    chunks.retain(|c| !c.is_empty());
    chunks
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

// ---------------------------------------------------------------------------
// Provider implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Provider for TelegramProvider {
    fn name(&self) -> &str {
        "telegram"
    }

    /// Validate credentials and drain any backlog of stale updates so
    /// replies from a previous process run are never treated as answers to
    /// fresh requests.
    async fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .context("getMe request failed")?;
        if !resp.status().is_success() {
            bail!("telegram credentials rejected: getMe returned {}", resp.status());
        }

        // Drain the backlog: fetch whatever is queued and skip past it.
        match self.api_get_updates(-1).await {
            Ok(updates) => {
                for update in &updates {
                    if let Some(update_id) = update.get("update_id").and_then(|i| i.as_i64()) {
                        self.offset.fetch_max(update_id + 1, Ordering::SeqCst);
                    }
                }
                debug!(discarded = updates.len(), "drained telegram update backlog");
            }
            Err(e) => {
                warn!(error = %e, "failed to drain telegram backlog, continuing");
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.poller.lock().unwrap().take() {
            cancel.cancel();
        }
        self.tracked.lock().unwrap().clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_plan_for_approval(&self, request: &PlanApprovalRequest) -> Result<()> {
        self.api_send_message(&format!(
            "Plan ready for ticket {} ({})",
            request.ticket_id, request.title
        ))
        .await?;

        for chunk in chunk_message(&request.plan, MAX_CHUNK_LEN) {
            self.api_send_message(&chunk).await?;
        }

        let prompt_id = self
            .api_send_message(
                "Reply to this message to approve or reject the plan \
                 (yes/ok/lgtm approve; anything else rejects, your text becomes feedback).",
            )
            .await?;

        self.tracked.lock().unwrap().insert(
            prompt_id,
            TrackedMessage::Plan {
                plan_id: request.plan_id.clone(),
            },
        );
        self.ensure_polling();
        Ok(())
    }

    async fn send_question(&self, request: &QuestionRequest) -> Result<()> {
        let mut text = format!("Question for ticket {}:\n{}", request.ticket_id, request.text);
        if !request.options.is_empty() {
            text.push('\n');
            for (i, option) in request.options.iter().enumerate() {
                text.push_str(&format!("\n{}. {}", i + 1, option.label));
            }
            text.push_str("\n\nReply to this message with the number or the option label.");
        } else {
            text.push_str("\n\nReply to this message with your answer.");
        }

        let mut prompt_id = None;
        for chunk in chunk_message(&text, MAX_CHUNK_LEN) {
            prompt_id = Some(self.api_send_message(&chunk).await?);
        }
        let prompt_id = prompt_id.context("question produced no message")?;

        self.tracked.lock().unwrap().insert(
            prompt_id,
            TrackedMessage::Question {
                question_id: request.question_id.clone(),
                options: request.options.clone(),
            },
        );
        self.ensure_polling();
        Ok(())
    }

    async fn send_status(&self, text: &str) -> Result<()> {
        for chunk in chunk_message(text, MAX_CHUNK_LEN) {
            self.api_send_message(&chunk).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
