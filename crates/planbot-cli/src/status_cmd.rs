//! Read-only inspection commands: status, list, logs.

use std::path::Path;

use anyhow::{Context, Result};

use planbot_core::queue::load_queue_file;
use planbot_store::StateStore;

fn store_for(queue_path: &Path) -> StateStore {
    StateStore::new(queue_path.parent().unwrap_or(Path::new(".")))
}

/// `planbot status`: the persisted run state plus per-ticket statuses.
pub async fn run_status(queue_path: &Path) -> Result<()> {
    let queue = load_queue_file(queue_path)?;
    let store = store_for(queue_path);

    if store.exists().await {
        let state = store.load().await?;
        println!("Phase:        {}", state.current_phase);
        println!(
            "Ticket:       {}",
            state.current_ticket_id.as_deref().unwrap_or("-")
        );
        println!(
            "Session:      {}",
            state.session_id.as_deref().unwrap_or("-")
        );
        println!("Paused:       {}", state.pause_requested);
        println!("Started:      {}", state.started_at.to_rfc3339());
        println!("Last update:  {}", state.last_updated_at.to_rfc3339());
        if !state.pending_questions.is_empty() {
            println!("Pending questions:");
            for q in &state.pending_questions {
                println!("  [{}] ({}) {}", q.id, q.ticket_id, q.text);
            }
        }
    } else {
        println!("No run state found (queue has not been started here).");
    }

    println!();
    let done = queue.tickets.iter().filter(|t| t.complete).count();
    println!("Tickets: {} total, {} complete", queue.tickets.len(), done);
    Ok(())
}

/// `planbot list`: every ticket with its durable completion flag.
pub fn run_list(queue_path: &Path) -> Result<()> {
    let queue = load_queue_file(queue_path)?;
    for ticket in &queue.tickets {
        let marker = if ticket.complete { "x" } else { " " };
        let deps = if ticket.dependencies.is_empty() {
            String::new()
        } else {
            format!("  (deps: {})", ticket.dependencies.join(", "))
        };
        println!("[{marker}] {}  {}{deps}", ticket.id, ticket.title);
    }
    Ok(())
}

/// `planbot logs <ticket>`: the ticket's execution log.
pub async fn run_logs(queue_path: &Path, ticket_id: &str) -> Result<()> {
    let store = store_for(queue_path);
    let log = store
        .read_log(ticket_id)
        .await
        .with_context(|| format!("failed to read log for ticket {ticket_id:?}"))?;
    if log.is_empty() {
        println!("No log recorded for ticket {ticket_id:?}.");
    } else {
        print!("{log}");
    }
    Ok(())
}
