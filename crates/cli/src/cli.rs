use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Submit cloud resources for analysis and follow the resulting jobs.
#[derive(Parser, Debug)]
#[command(name = "greenops", version, about = "Client for the greenops analysis server")]
pub struct CliArgs {
    /// Server URL (overrides the config file)
    #[arg(long, global = true, env = "GREENOPS_SERVER_URL")]
    pub server: Option<String>,

    /// Path to config file (default: ~/.config/greenops/config.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Print pretty JSON instead of a text summary
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit a request body (JSON file) as a new job
    Submit {
        file: PathBuf,

        /// Wait for the job to finish and print its results
        #[arg(long)]
        wait: bool,
    },

    /// Show a job's status
    Status {
        job_id: String,

        /// Ask the server to finalize a job whose items are all accounted for
        #[arg(long)]
        force: bool,
    },

    /// Show the results recorded so far
    Results { job_id: String },

    /// Poll a job until it finishes
    Wait {
        job_id: String,

        /// Seconds between polls
        #[arg(long)]
        poll_interval: Option<u64>,

        /// Polls before giving up
        #[arg(long)]
        max_attempts: Option<u32>,
    },
}
