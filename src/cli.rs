//! Minimal CLI surface for manually exercising the core. Flag parsing beyond
//! this is explicitly out of scope; a real product would drive the
//! [`Manager`](crate::manager::Manager) from a terminal UI instead.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "chief", about = "Drive a PRD to completion via Claude Code", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register and start a PRD's loop, printing events until it reaches a
    /// terminal state.
    Run {
        /// PRD name, i.e. the directory under `prds/`.
        name: String,

        /// Iteration budget before the loop pauses.
        #[arg(long, default_value = "50")]
        max_iterations: u32,
    },
    /// Print the current state of a registered PRD.
    Status {
        name: String,
    },
    /// Remove stale worktree administrative files.
    Gc,
}
