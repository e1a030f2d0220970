//! Queue-file model and validation.
//!
//! A queue file (YAML or JSON, identified by extension) carries an optional
//! `config:` block, optional `hooks:`, and the ticket list. Validation
//! enforces field bounds, unique ids, known dependencies, an acyclic
//! dependency graph, and the rule that queue-file data can never enable
//! `skipPermissions`.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use planbot_store::TicketStatus;

use crate::config::Config;
use crate::hooks::Hooks;

const ID_MAX: usize = 100;
const TITLE_MAX: usize = 200;
const DESCRIPTION_MAX: usize = 50_000;

/// Errors that can occur during queue-file parsing and validation.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to read queue file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("queue file {0} has an unrecognized extension (expected .yaml, .yml, or .json)")]
    UnsupportedFormat(String),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("queue must contain at least one ticket")]
    NoTickets,

    #[error("duplicate ticket id: {0:?}")]
    DuplicateId(String),

    #[error("ticket {0:?}: {1}")]
    InvalidField(String, String),

    #[error("ticket {ticket:?} depends on unknown ticket {dependency:?}")]
    UnknownDependency { ticket: String, dependency: String },

    #[error("dependency cycle detected: {0}")]
    CycleDetected(String),

    #[error("queue files may not set skipPermissions; pass it on the command line instead")]
    SkipPermissionsInFile,
}

/// One unit of work in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub status: TicketStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Per-ticket override of the queue-wide plan mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_mode: Option<bool>,
    /// Durable done-flag written back to the queue file on success.
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl Ticket {
    /// A minimal pending ticket, for dynamic queueing and tests.
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            priority: 0,
            status: TicketStatus::Pending,
            acceptance_criteria: Vec::new(),
            dependencies: Vec::new(),
            plan_mode: None,
            complete: false,
            hooks: None,
            metadata: HashMap::new(),
            images: Vec::new(),
        }
    }
}

/// The root of a queue file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Config>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,
    #[serde(default)]
    pub tickets: Vec<Ticket>,
}

/// Load and validate a queue file, dispatching on the extension.
pub fn load_queue_file(path: &Path) -> Result<QueueFile, QueueError> {
    let content = std::fs::read_to_string(path).map_err(|source| QueueError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let queue: QueueFile = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content)?,
        "json" => serde_json::from_str(&content)?,
        _ => return Err(QueueError::UnsupportedFormat(path.display().to_string())),
    };

    validate(&queue)?;
    Ok(queue)
}

/// Validate a parsed queue.
pub fn validate(queue: &QueueFile) -> Result<(), QueueError> {
    // Security invariant: the queue file cannot grant permission bypass.
    if queue.config.as_ref().is_some_and(|c| c.skip_permissions) {
        return Err(QueueError::SkipPermissionsInFile);
    }

    if queue.tickets.is_empty() {
        return Err(QueueError::NoTickets);
    }

    let mut seen = HashSet::new();
    for ticket in &queue.tickets {
        if !seen.insert(ticket.id.as_str()) {
            return Err(QueueError::DuplicateId(ticket.id.clone()));
        }
    }

    for ticket in &queue.tickets {
        check_bounds(ticket)?;
        for dep in &ticket.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(QueueError::UnknownDependency {
                    ticket: ticket.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    check_for_cycles(&queue.tickets)?;
    Ok(())
}

fn check_bounds(ticket: &Ticket) -> Result<(), QueueError> {
    let field_err =
        |msg: String| Err(QueueError::InvalidField(ticket.id.clone(), msg));

    if ticket.id.is_empty() || ticket.id.len() > ID_MAX {
        return field_err(format!("id must be 1..{ID_MAX} characters"));
    }
    if ticket.title.is_empty() || ticket.title.len() > TITLE_MAX {
        return field_err(format!("title must be 1..{TITLE_MAX} characters"));
    }
    if ticket.description.is_empty() || ticket.description.len() > DESCRIPTION_MAX {
        return field_err(format!("description must be 1..{DESCRIPTION_MAX} characters"));
    }
    if ticket.dependencies.iter().any(|d| d == &ticket.id) {
        return field_err("ticket cannot depend on itself".to_string());
    }
    Ok(())
}

/// Dependency-walk marking for cycle detection.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// Not reached yet.
    New,
    /// On the current walk; reaching it again closes a cycle.
    Visiting,
    /// Fully explored, known acyclic.
    Done,
}

/// Reject dependency cycles by walking the dependency edges depth-first.
/// The error carries the offending cycle as a path.
fn check_for_cycles(tickets: &[Ticket]) -> Result<(), QueueError> {
    fn walk<'a>(
        id: &'a str,
        tickets_by_id: &HashMap<&'a str, &'a Ticket>,
        marks: &mut HashMap<&'a str, Mark>,
        trail: &mut Vec<&'a str>,
    ) -> Result<(), QueueError> {
        match marks.get(id).copied().unwrap_or(Mark::New) {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                let start = trail.iter().position(|t| *t == id).unwrap_or(0);
                let mut cycle = trail[start..].to_vec();
                cycle.push(id);
                return Err(QueueError::CycleDetected(cycle.join(" -> ")));
            }
            Mark::New => {}
        }

        marks.insert(id, Mark::Visiting);
        trail.push(id);
        if let Some(ticket) = tickets_by_id.get(id) {
            for dep in &ticket.dependencies {
                walk(dep, tickets_by_id, marks, trail)?;
            }
        }
        trail.pop();
        marks.insert(id, Mark::Done);
        Ok(())
    }

    let tickets_by_id: HashMap<&str, &Ticket> =
        tickets.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut marks = HashMap::new();
    let mut trail = Vec::new();

    for ticket in tickets {
        walk(&ticket.id, &tickets_by_id, &mut marks, &mut trail)?;
    }
    Ok(())
}
