//! Shared data model and wire protocol for `tasklist`.

pub mod task;
pub mod wire;
