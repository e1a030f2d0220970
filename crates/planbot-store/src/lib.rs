//! Persistence layer for planbot.
//!
//! The run state lives under a `.planbot/` directory next to the queue file:
//! `state.json` (the [`models::State`] snapshot), `plans/<id>.md`,
//! `sessions/<id>.txt`, `logs/<id>.log`, and `questions/` scratch space for
//! providers. All writes go through write-and-rename so a crash mid-write
//! never leaves a torn state file.

pub mod models;
pub mod store;

pub use models::{PendingQuestion, Phase, State, TicketStatus};
pub use store::{StateStore, StoreError};
