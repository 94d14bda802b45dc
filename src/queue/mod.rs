//! Phase queue: dependency-ordered release of multi-phase work.
//!
//! ## Overview
//!
//! A request (the *group*) is split into an ordered chain of phases. Each
//! phase is executed by an external engine and becomes eligible only after
//! its predecessor completed. The queue tracks phase state in SQLite,
//! reconciles in-flight phases against the engine's status store, and
//! cascades a failure to every downstream phase.
//!
//! ## Module Map
//!
//! ```text
//! ┌────────────┐  HTTP   ┌────────────────────────────────────────────────┐
//! │ Dispatcher │ ──────> │  server.rs  (axum Router, ServerConfig)        │
//! │  / viewer  │ <────── │    └─ api.rs  (route handlers, AppState)       │
//! └────────────┘   WS    │         │                                      │
//!                        │         │ enqueue / mark_running / remove      │
//!                        │         v                                      │
//!                        │  store.rs  (PhaseQueueStore)                   │
//!                        │         │                                      │
//!                        │         │ guarded UPDATEs in one transaction   │
//!                        │         v                                      │
//!                        │  db.rs  (QueueDb, DbHandle)                    │
//!                        │         ^                                      │
//!                        │         │ get_running / mark_complete / failed │
//!                        │  coordinator.rs  (polling loop, CycleReport)   │
//!                        │     ├─ provider.rs  (ExternalStatusProvider)   │
//!                        │     ├─ ws.rs        (Broadcaster)              │
//!                        │     └─ github.rs    (Notifier)                 │
//!                        └────────────────────────────────────────────────┘
//! ```
//!
//! ## Phase Lifecycle
//!
//! | From             | To          | Trigger                               |
//! |------------------|-------------|---------------------------------------|
//! | *(enqueue)*      | `ready`     | phase 1 of a new chain                |
//! | *(enqueue)*      | `queued`    | every later phase                     |
//! | `ready`          | `running`   | `mark_running(external_ref)`          |
//! | `running`        | `completed` | `mark_complete`; successor → `ready`  |
//! | `running`        | `failed`    | `mark_failed`; pending dependents → `blocked` |
//!
//! `completed`, `failed` and `blocked` are terminal.

pub mod api;
pub mod coordinator;
pub mod db;
pub mod github;
pub mod models;
pub mod provider;
pub mod server;
pub mod store;
pub mod ws;
