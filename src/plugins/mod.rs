//! Process-facing subsystems built on top of `core`.

pub mod interrupt;
pub mod launcher;
pub mod lifecycle;
pub mod listing;
pub mod resolver;
