// constel-cli: Clap commands, logging, dispatch
// Depends on constel-core, constel-cloud, constel-access, constel-coordinator

pub mod commands;
pub mod logging;

pub use commands::run;
