//! Core modules: supervisor home, persisted state, configuration, errors
//! and the ambient plumbing every operation shares.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod output;
pub mod state;
pub mod store;
pub mod time;
