//! Subcommand implementations

pub mod run;
pub mod run_container;
pub mod server;
