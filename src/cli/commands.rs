//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - run: drive one task to a verified result, blocking
//! - start: launch a run in the background
//! - status / log / list: inspect persisted runs
//! - validate: check the configured roster against the policy

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// vloop - attempt, verify, refine until an external check passes
#[derive(Parser, Debug)]
#[command(name = "vloop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Options shared by `run` and `start`; each overrides the configured policy
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Task description handed to the planner
    pub task: String,

    /// Maximum build -> verify cycles
    #[arg(short = 'n', long)]
    pub max_iterations: Option<u32>,

    /// Verification command, run through `sh -c`
    #[arg(long)]
    pub verify: Option<String>,

    /// Milliseconds without progress before the watchdog reports a stall
    #[arg(long)]
    pub stall_threshold_ms: Option<u64>,

    /// Use this run id; an existing log with this id is resumed
    #[arg(long)]
    pub run_id: Option<String>,

    /// Working directory for roles and the verification command
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a task until it passes verification or gives up
    Run(RunArgs),

    /// Start a run in the background and print its id
    Start(RunArgs),

    /// Show the current state of a run
    Status {
        /// Run ID to check
        run_id: String,
    },

    /// Print the event log of a run
    Log {
        /// Run ID
        run_id: String,

        /// One JSON event per line
        #[arg(long)]
        json: bool,
    },

    /// List runs with a persisted log
    List,

    /// Validate the configured roles and policy
    Validate,
}
