//! Offline-first field work synchronisation
//!
//! This library provides durable queues for ticket lifecycle actions and photo
//! upload jobs, the photo processing pipeline, the background upload worker and
//! the SQLite photo ledger with its audit trail.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
