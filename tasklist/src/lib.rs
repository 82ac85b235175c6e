//! `tasklist`: personal task list synced through a live document store.

pub mod app;
pub mod config;
pub mod remote;
pub mod session;
pub mod store;
pub mod sync;
