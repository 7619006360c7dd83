//! CLI module for vloop - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
