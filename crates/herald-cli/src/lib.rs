//! Herald CLI library: operator subcommands and their table output.

pub mod commands;
pub mod fmt;
