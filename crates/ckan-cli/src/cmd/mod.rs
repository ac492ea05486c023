//! Command implementations, one module per verb.

pub mod available;
pub mod cache;
pub mod install;
pub mod list;
pub mod remove;
pub mod repo;
pub mod scan;
pub mod update;
pub mod upgrade;
