//! File-backed state store.
//!
//! All run state lives under `<root>/.planbot/`. `state.json` holds the
//! [`State`] snapshot; per-ticket artifacts live in `plans/`, `sessions/`,
//! and `logs/`. Writes are atomic: content goes to a `.tmp` sibling first
//! and is renamed into place.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::models::{PendingQuestion, State};

/// Name of the state directory created next to the queue file.
pub const STATE_DIR: &str = ".planbot";

/// Errors that can occur while reading or writing persisted state.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state store at {0} is not initialized")]
    NotInitialized(PathBuf),

    #[error("no saved {kind} for ticket {ticket_id:?}")]
    MissingArtifact { kind: &'static str, ticket_id: String },

    #[error("ticket {0:?} not found in queue file")]
    UnknownTicket(String),

    #[error("queue file {0} has an unrecognized extension (expected .yaml, .yml, or .json)")]
    UnsupportedQueueFormat(PathBuf),

    #[error("state file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("queue file is corrupt: {0}")]
    CorruptQueue(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Handle to the `.planbot/` directory for one queue run.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Create a handle rooted at `root` (the directory containing the queue
    /// file). Does not touch the filesystem; call [`StateStore::init`] to
    /// create the layout.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            dir: root.as_ref().join(STATE_DIR),
        }
    }

    /// The `.planbot/` directory this store manages.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    fn plan_path(&self, ticket_id: &str) -> PathBuf {
        self.dir.join("plans").join(format!("{}.md", safe_name(ticket_id)))
    }

    fn session_path(&self, ticket_id: &str) -> PathBuf {
        self.dir
            .join("sessions")
            .join(format!("{}.txt", safe_name(ticket_id)))
    }

    fn log_path(&self, ticket_id: &str) -> PathBuf {
        self.dir.join("logs").join(format!("{}.log", safe_name(ticket_id)))
    }

    /// Create the directory layout and an initial idle state if none exists.
    pub async fn init(&self) -> Result<State, StoreError> {
        for sub in ["plans", "sessions", "logs", "questions"] {
            fs::create_dir_all(self.dir.join(sub)).await?;
        }
        if self.exists().await {
            return self.load().await;
        }
        let state = State::new();
        self.save(&state).await?;
        Ok(state)
    }

    /// Whether a state file exists on disk.
    pub async fn exists(&self) -> bool {
        fs::try_exists(self.state_path()).await.unwrap_or(false)
    }

    /// Load the persisted state.
    pub async fn load(&self) -> Result<State, StoreError> {
        let path = self.state_path();
        let bytes = match fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotInitialized(self.dir.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Persist the state atomically, refreshing `last_updated_at`.
    pub async fn save(&self, state: &State) -> Result<(), StoreError> {
        let mut stamped = state.clone();
        stamped.last_updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(&stamped)?;
        write_atomic(&self.state_path(), &json).await?;
        Ok(())
    }

    /// Read-modify-write: re-reads the file just before merging so updates
    /// interleaved within a single process are not lost.
    pub async fn update<F>(&self, mutate: F) -> Result<State, StoreError>
    where
        F: FnOnce(&mut State),
    {
        let mut state = self.load().await?;
        mutate(&mut state);
        self.save(&state).await?;
        Ok(state)
    }

    /// Remove every artifact and the state file, leaving an empty layout.
    pub async fn clear(&self) -> Result<(), StoreError> {
        if fs::try_exists(&self.dir).await.unwrap_or(false) {
            fs::remove_dir_all(&self.dir).await?;
        }
        Ok(())
    }

    // -- Per-ticket artifacts ----------------------------------------------

    /// Save (or overwrite, on revision) the generated plan for a ticket.
    pub async fn save_plan(&self, ticket_id: &str, plan: &str) -> Result<(), StoreError> {
        write_atomic(&self.plan_path(ticket_id), plan.as_bytes()).await?;
        self.touch().await
    }

    /// Load the saved plan for a ticket, if one exists.
    pub async fn load_plan(&self, ticket_id: &str) -> Result<Option<String>, StoreError> {
        read_optional(&self.plan_path(ticket_id)).await
    }

    /// Save the opaque session token the driver returned for a ticket.
    pub async fn save_session(&self, ticket_id: &str, session_id: &str) -> Result<(), StoreError> {
        write_atomic(&self.session_path(ticket_id), session_id.as_bytes()).await?;
        self.touch().await
    }

    /// Load the saved session token for a ticket, if one exists.
    pub async fn load_session(&self, ticket_id: &str) -> Result<Option<String>, StoreError> {
        Ok(read_optional(&self.session_path(ticket_id))
            .await?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    /// Append a timestamped line to the ticket's execution log.
    pub async fn append_log(&self, ticket_id: &str, line: &str) -> Result<(), StoreError> {
        let path = self.log_path(ticket_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let stamped = format!("[{}] {}\n", Utc::now().to_rfc3339(), line.trim_end());
        file.write_all(stamped.as_bytes()).await?;
        Ok(())
    }

    /// Read the full execution log for a ticket (empty if none).
    pub async fn read_log(&self, ticket_id: &str) -> Result<String, StoreError> {
        Ok(read_optional(&self.log_path(ticket_id)).await?.unwrap_or_default())
    }

    // -- Pending questions --------------------------------------------------

    /// Record a question awaiting a human answer.
    pub async fn add_pending_question(&self, question: PendingQuestion) -> Result<(), StoreError> {
        self.update(|state| {
            state.pending_questions.retain(|q| q.id != question.id);
            state.pending_questions.push(question);
        })
        .await?;
        Ok(())
    }

    /// Remove a pending question by id. Returns the removed entry, if any.
    pub async fn remove_pending_question(
        &self,
        question_id: &str,
    ) -> Result<Option<PendingQuestion>, StoreError> {
        let mut removed = None;
        self.update(|state| {
            if let Some(pos) = state.pending_questions.iter().position(|q| q.id == question_id) {
                removed = Some(state.pending_questions.remove(pos));
            }
        })
        .await?;
        Ok(removed)
    }

    /// All questions currently awaiting answers.
    pub async fn get_pending_questions(&self) -> Result<Vec<PendingQuestion>, StoreError> {
        Ok(self.load().await?.pending_questions)
    }

    // -- Queue-file write-back ---------------------------------------------

    /// Mark a ticket `complete: true` in the queue file itself, preserving
    /// the file's format (YAML or JSON, by extension). The rewrite is atomic.
    pub async fn mark_ticket_complete(
        &self,
        queue_path: &Path,
        ticket_id: &str,
    ) -> Result<(), StoreError> {
        let content = fs::read_to_string(queue_path).await?;
        let ext = queue_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let rewritten = match ext.as_str() {
            "yaml" | "yml" => {
                let mut doc: serde_yaml::Value = serde_yaml::from_str(&content)?;
                set_ticket_complete_yaml(&mut doc, ticket_id)?;
                serde_yaml::to_string(&doc)?
            }
            "json" => {
                let mut doc: serde_json::Value = serde_json::from_str(&content)?;
                set_ticket_complete_json(&mut doc, ticket_id)?;
                let mut out = serde_json::to_string_pretty(&doc)?;
                out.push('\n');
                out
            }
            _ => return Err(StoreError::UnsupportedQueueFormat(queue_path.to_path_buf())),
        };

        write_atomic(queue_path, rewritten.as_bytes()).await?;
        tracing::debug!(ticket_id, queue = %queue_path.display(), "marked ticket complete in queue file");
        Ok(())
    }

    /// Refresh `last_updated_at` on the state file after an artifact write.
    async fn touch(&self) -> Result<(), StoreError> {
        if self.exists().await {
            self.update(|_| {}).await?;
        }
        Ok(())
    }
}

fn set_ticket_complete_yaml(doc: &mut serde_yaml::Value, ticket_id: &str) -> Result<(), StoreError> {
    let tickets = doc
        .get_mut("tickets")
        .and_then(|t| t.as_sequence_mut())
        .ok_or_else(|| StoreError::UnknownTicket(ticket_id.to_string()))?;
    for ticket in tickets.iter_mut() {
        if ticket.get("id").and_then(|v| v.as_str()) == Some(ticket_id) {
            if let Some(map) = ticket.as_mapping_mut() {
                map.insert(
                    serde_yaml::Value::String("complete".to_string()),
                    serde_yaml::Value::Bool(true),
                );
                return Ok(());
            }
        }
    }
    Err(StoreError::UnknownTicket(ticket_id.to_string()))
}

fn set_ticket_complete_json(doc: &mut serde_json::Value, ticket_id: &str) -> Result<(), StoreError> {
    let tickets = doc
        .get_mut("tickets")
        .and_then(|t| t.as_array_mut())
        .ok_or_else(|| StoreError::UnknownTicket(ticket_id.to_string()))?;
    for ticket in tickets.iter_mut() {
        if ticket.get("id").and_then(|v| v.as_str()) == Some(ticket_id) {
            if let Some(map) = ticket.as_object_mut() {
                map.insert("complete".to_string(), serde_json::Value::Bool(true));
                return Ok(());
            }
        }
    }
    Err(StoreError::UnknownTicket(ticket_id.to_string()))
}

/// Write `content` to `path` atomically via a `.tmp` sibling + rename.
async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Map a ticket id onto a filename-safe stem.
fn safe_name(ticket_id: &str) -> String {
    ticket_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Phase;

    #[test]
    fn safe_name_replaces_separators() {
        assert_eq!(safe_name("feat/login v2"), "feat-login-v2");
        assert_eq!(safe_name("T-001"), "T-001");
    }

    #[tokio::test]
    async fn init_creates_layout_and_idle_state() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        let state = store.init().await.unwrap();
        assert_eq!(state.current_phase, Phase::Idle);
        assert!(store.dir().join("plans").is_dir());
        assert!(store.dir().join("logs").is_dir());
        assert!(store.exists().await);
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        store.init().await.unwrap();
        store
            .update(|s| s.current_ticket_id = Some("T1".into()))
            .await
            .unwrap();
        let reloaded = store.init().await.unwrap();
        assert_eq!(reloaded.current_ticket_id.as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn load_before_init_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        assert!(matches!(
            store.load().await,
            Err(StoreError::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn save_refreshes_last_updated_at() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        let state = store.init().await.unwrap();
        let before = state.last_updated_at;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.save(&state).await.unwrap();
        let after = store.load().await.unwrap().last_updated_at;
        assert!(after > before);
    }

    #[tokio::test]
    async fn update_persists_phase_transition() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        store.init().await.unwrap();

        store
            .update(|s| {
                s.current_ticket_id = Some("T1".into());
                s.current_phase = Phase::Planning;
            })
            .await
            .unwrap();

        // A second handle sees the transition (durability across reloads).
        let other = StateStore::new(tmp.path());
        let loaded = other.load().await.unwrap();
        assert_eq!(loaded.current_phase, Phase::Planning);
        assert_eq!(loaded.current_ticket_id.as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn plan_and_session_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        store.init().await.unwrap();

        assert_eq!(store.load_plan("T1").await.unwrap(), None);
        store.save_plan("T1", "## Plan\ndo things").await.unwrap();
        assert_eq!(
            store.load_plan("T1").await.unwrap().as_deref(),
            Some("## Plan\ndo things")
        );
        // Revision overwrites.
        store.save_plan("T1", "## Plan v2").await.unwrap();
        assert_eq!(store.load_plan("T1").await.unwrap().as_deref(), Some("## Plan v2"));

        store.save_session("T1", "sess-abc\n").await.unwrap();
        assert_eq!(
            store.load_session("T1").await.unwrap().as_deref(),
            Some("sess-abc")
        );
        assert_eq!(store.load_session("T2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn log_appends_timestamped_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        store.init().await.unwrap();

        store.append_log("T1", "first").await.unwrap();
        store.append_log("T1", "second\n").await.unwrap();
        let log = store.read_log("T1").await.unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
        assert!(lines[0].starts_with('['));
    }

    #[tokio::test]
    async fn pending_questions_add_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        store.init().await.unwrap();

        let q = PendingQuestion {
            id: "q1".into(),
            ticket_id: "T1".into(),
            text: "Which database?".into(),
            asked_at: Utc::now(),
        };
        store.add_pending_question(q.clone()).await.unwrap();
        assert_eq!(store.get_pending_questions().await.unwrap().len(), 1);

        // Re-adding the same id replaces rather than duplicates.
        store.add_pending_question(q.clone()).await.unwrap();
        assert_eq!(store.get_pending_questions().await.unwrap().len(), 1);

        let removed = store.remove_pending_question("q1").await.unwrap();
        assert_eq!(removed.map(|r| r.id), Some("q1".to_string()));
        assert!(store.get_pending_questions().await.unwrap().is_empty());
        assert_eq!(store.remove_pending_question("q1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        store.init().await.unwrap();
        store.save_plan("T1", "plan").await.unwrap();
        store.clear().await.unwrap();
        assert!(!store.exists().await);
        // Clearing twice is fine.
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn mark_complete_rewrites_yaml() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = tmp.path().join("queue.yaml");
        tokio::fs::write(
            &queue,
            "tickets:\n  - id: T1\n    title: One\n    description: d\n  - id: T2\n    title: Two\n    description: d\n",
        )
        .await
        .unwrap();

        let store = StateStore::new(tmp.path());
        store.mark_ticket_complete(&queue, "T2").await.unwrap();

        let doc: serde_yaml::Value =
            serde_yaml::from_str(&tokio::fs::read_to_string(&queue).await.unwrap()).unwrap();
        let tickets = doc["tickets"].as_sequence().unwrap();
        assert!(tickets[0].get("complete").is_none());
        assert_eq!(tickets[1]["complete"], serde_yaml::Value::Bool(true));
    }

    #[tokio::test]
    async fn mark_complete_rewrites_json() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = tmp.path().join("queue.json");
        tokio::fs::write(
            &queue,
            r#"{"tickets":[{"id":"T1","title":"One","description":"d"}]}"#,
        )
        .await
        .unwrap();

        let store = StateStore::new(tmp.path());
        store.mark_ticket_complete(&queue, "T1").await.unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(&queue).await.unwrap()).unwrap();
        assert_eq!(doc["tickets"][0]["complete"], serde_json::Value::Bool(true));
    }

    #[tokio::test]
    async fn mark_complete_unknown_ticket_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = tmp.path().join("queue.yaml");
        tokio::fs::write(&queue, "tickets:\n  - id: T1\n    title: t\n    description: d\n")
            .await
            .unwrap();
        let store = StateStore::new(tmp.path());
        assert!(matches!(
            store.mark_ticket_complete(&queue, "nope").await,
            Err(StoreError::UnknownTicket(_))
        ));
    }

    #[tokio::test]
    async fn mark_complete_rejects_unknown_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = tmp.path().join("queue.toml");
        tokio::fs::write(&queue, "tickets = []").await.unwrap();
        let store = StateStore::new(tmp.path());
        assert!(matches!(
            store.mark_ticket_complete(&queue, "T1").await,
            Err(StoreError::UnsupportedQueueFormat(_))
        ));
    }
}
