//! CLI module for toolmeister - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
