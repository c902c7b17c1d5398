//! Hub: the project/task backend and its real-time activity stream.
//!
//! ## Module Map
//!
//! ```text
//! ┌───────────┐   HTTP   ┌────────────────────────────────────────────────┐
//! │  Client   │ ───────> │  server.rs  (Router, ServerConfig, TraceLayer) │
//! │ (browser, │          │    └─ api.rs  (route handlers, AppState)       │
//! │  watch)   │          │         │                                      │
//! └───────────┘          │         │ DbHandle::call(|db| ...)             │
//!       ^                │         v                                      │
//!       │                │  db.rs  (HubDb: migrations, CRUD, dashboard)   │
//!       │                │         │                                      │
//!       │                │         │ Activity row                         │
//!       │  STOMP over    │         v                                      │
//!       │  WebSocket     │  ws.rs  (ActivityHub broadcast → sessions)     │
//!       └─────────────── │                                                │
//!                        └────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                              |
//! |----------|-------------------------------------------------------------|
//! | `models` | Entities and view types: `Project`, `Task`, `Activity`, ... |
//! | `github` | OAuth redirect flow, issue import, webhook verification     |
//!
//! ## Typical Request Flow (create a task)
//!
//! 1. `POST /api/projects/{id}/tasks` → `api::create_task()`
//! 2. Inside one `DbHandle::call`, the task row and its `task_created`
//!    activity are written.
//! 3. `ActivityHub::publish_activity()` broadcasts an `ACTIVITY_UPDATE` on
//!    the global, project and task topics.
//! 4. Each STOMP session forwards the message if it subscribed to that
//!    destination; dashboard clients then debounce and refetch.

pub mod api;
pub mod db;
pub mod github;
pub mod models;
pub mod server;
pub mod ws;
