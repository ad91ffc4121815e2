use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "provision")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Run install plans with rollback, restart pauses and resumable state", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Keep state under <DIR>/.provision instead of the user data directory
    #[arg(long, global = true, value_name = "DIR")]
    pub project: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Execute an install plan file
    Run(RunArgs),

    /// Inspect and manage persisted install plans
    #[command(subcommand)]
    Plans(PlansCommand),

    /// Inspect remediation chains
    #[command(subcommand)]
    Chains(ChainsCommand),

    /// Check a plan file without executing anything
    Validate {
        /// Plan file (JSON)
        plan: PathBuf,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Run
// ============================================================================

#[derive(Args)]
pub struct RunArgs {
    /// Plan file (JSON)
    pub plan: PathBuf,

    /// Schedule steps by their dependencies, running independent ones in parallel
    #[arg(long)]
    pub dag: bool,

    /// Skip steps before this position (linear mode only)
    #[arg(long, value_name = "N", default_value_t = 0, conflicts_with = "dag")]
    pub from: usize,
}

// ============================================================================
// Plans
// ============================================================================

#[derive(Subcommand)]
pub enum PlansCommand {
    /// List persisted plans
    List {
        /// Include finished plans as well
        #[arg(short, long)]
        all: bool,
    },

    /// Show one plan in detail
    Show {
        /// Plan id
        id: String,

        /// Print the raw state document
        #[arg(long)]
        json: bool,
    },

    /// Continue a paused or failed plan
    Resume {
        /// Plan id
        id: String,
    },

    /// Mark a plan cancelled and archive it
    Cancel {
        /// Plan id
        id: String,
    },

    /// Move a plan to the archive without changing its status
    Archive {
        /// Plan id
        id: String,
    },

    /// Apply a plan's stored rollback actions, newest first
    Rollback {
        /// Plan id
        id: String,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

// ============================================================================
// Chains
// ============================================================================

#[derive(Subcommand)]
pub enum ChainsCommand {
    /// List remediation chains
    List,

    /// Show a chain with its breadcrumbs
    Show {
        /// Chain id
        id: String,
    },
}
