//! VibeCC — autonomous ticket-to-merge pipeline.
//!
//! Watches a kanban board per project, pulls tickets into a bounded worker
//! pool, and drives each one through a persisted state machine
//! (queued → coding → testing → merged | failed): an external coding agent
//! produces a patch on a feature branch, CI gates the PR, and failures feed
//! back into the next coding attempt up to a retry budget. Operators watch
//! and control everything over an HTTP API with an SSE event stream.
//!
//! ## Module map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌────────────────────────────────────────────────┐
//! │ Operator │ ───────> │  server.rs  (axum Router, lifecycle)           │
//! │          │ <─────── │    └─ api.rs  (handlers, AppState, envelope)   │
//! └──────────┘   SSE    │         │                                      │
//!                       │         │ autopilot start                      │
//!                       │         v                                      │
//!                       │  scheduler.rs  (per-project worker loop,       │
//!                       │                 admission control)             │
//!                       │         │ process_pipeline()                   │
//!                       │         v                                      │
//!                       │  orchestrator.rs  (state machine, retries,     │
//!                       │                    archival, autopilot flags)  │
//!                       │     │         │                                │
//!                       │     v         v                                │
//!                       │  workers/   vcs.rs + kanban.rs  (gateways)     │
//!                       └────────────────────────────────────────────────┘
//! ```
//!
//! Supporting modules: `models` (entities and the state enum), `store`
//! (SQLite persistence + history), `events` (bus behind the SSE stream),
//! `config`, `errors`.

pub mod api;
pub mod config;
pub mod errors;
pub mod events;
pub mod kanban;
pub mod models;
pub mod orchestrator;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod vcs;
pub mod workers;

#[cfg(test)]
pub mod testutil;
