//! `tasklist` server library.
//!
//! Exposes the server for use in tests and embedding. The server accepts
//! WebSocket connections, authenticates them, and serves a task document
//! collection with per-owner live queries.

pub mod accounts;
pub mod config;
pub mod documents;
pub mod server;
