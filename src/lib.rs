//! # Services Plane Library
//!
//! Provider connections, credentials, grants, webhooks and lifecycle
//! fan-out behind an admin HTTP API, plus the workflow surface for mapping
//! specs and sync runs.

pub mod auth;
pub mod callbacks;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod idempotency;
pub mod inbound;
pub mod lifecycle;
pub mod models;
pub mod pagination;
pub mod providers;
pub mod repositories;
pub mod scope;
pub mod server;
pub mod service;
pub mod sync;
pub mod telemetry;
pub mod webhooks;
pub mod worker;
pub mod workflow;
pub use migration;
