//! AgencyHub: multi-tenant agency back-end.
//!
//! ## Overview
//!
//! An agency owns sub-accounts (its clients). Agency owners and admins manage
//! every sub-account of their agency; sub-account users and guests reach only
//! the sub-accounts they were granted a permission for. Each sub-account holds
//! media, contacts, tags, funnels, and pipelines of ordered lanes with ordered
//! tickets.
//! Every mutation appends an attributed entry to the agency's notification log.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (router, CORS, graceful shutdown)    │
//! │          │ <─────── │    └─ api.rs  (handlers, AppState, ApiError)     │
//! └──────────┘          │         │                                        │
//!   x-auth-* headers    │         │ principal_from_headers() → Principal   │
//!                       │         v                                        │
//!                       │  access.rs  (authorize, Scope, AccessDecision)   │
//!                       │         │                                        │
//!                       │         │ account / invitation / activity        │
//!                       │         v                                        │
//!                       │  db.rs  (HubDb on SQLite, DbHandle)              │
//!                       │         │                                        │
//!                       │         │ role metadata, invitation emails       │
//!                       │         v                                        │
//!                       │  identity.rs  (IdentityProvider trait)           │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `models`      | Entities, joined views, and input payloads              |
//! | `validation`  | Field checks aggregated into `HubError::Validation`     |
//! | `account`     | Onboarding, user details, role sync, user deletion      |
//! | `invitation`  | Sending invitations and accepting them on sign-in       |
//! | `activity`    | Activity log writes and per-viewer notification reads   |
//!
//! ## Typical Request Flow (move a ticket)
//!
//! 1. `PUT /api/pipelines/{id}/tickets/order` → `api::reorder_tickets()`
//! 2. `access::authorize()` resolves the pipeline's sub-account and checks
//!    the caller's role or permission row.
//! 3. `HubDb::update_tickets_order()` applies the whole batch in one
//!    transaction; an unknown ticket rolls everything back.
//! 4. `activity::save_activity_log()` records "Moved tickets" against the
//!    sub-account and its agency.

pub mod access;
pub mod account;
pub mod activity;
pub mod api;
pub mod db;
pub mod identity;
pub mod invitation;
pub mod models;
pub mod server;
pub mod validation;
