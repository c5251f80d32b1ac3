mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use greenops_cli::{output, CliConfig, JobStatusSource, PollConfig, ServerClient, StatusReconciler};

use crate::cli::{CliArgs, Command};

/// Print `value` as pretty JSON, or the text rendering.
fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value).context("failed to encode output")?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

async fn wait_for(
    client: ServerClient,
    job_id: &str,
    poll: PollConfig,
    config: &CliConfig,
    json: bool,
) -> Result<()> {
    info!(job_id, ?poll, "Waiting for job");
    let reconciler = StatusReconciler::new(client, poll);
    let timeout = config.wait_timeout();

    let done = tokio::select! {
        res = tokio::time::timeout(timeout, reconciler.wait(job_id)) => match res {
            Ok(res) => res?,
            Err(_) => bail!("gave up on job {} after {}s", job_id, timeout.as_secs()),
        },
        _ = tokio::signal::ctrl_c() => bail!("interrupted while waiting for job {}", job_id),
    };

    emit(json, &done, || {
        let mut text = output::job(&done.job);
        if done.forced {
            text.push_str("\n  (completion forced)");
        }
        format!("{text}\n{}", output::results(&done.results))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let config = CliConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let server = args.server.clone().unwrap_or_else(|| config.server_url.clone());
    debug!(server = %server, "Using server");
    let client = ServerClient::new(&server, config.request_timeout())?;

    match args.command {
        Command::Submit { file, wait } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let body: Value = serde_json::from_str(&content)
                .with_context(|| format!("{} is not valid JSON", file.display()))?;

            let receipt = client.submit(&body).await?;
            if wait {
                if !args.json {
                    println!("{}", output::receipt(&receipt));
                }
                let poll = config.poll_config(None, None);
                wait_for(client, &receipt.job_id, poll, &config, args.json).await?;
            } else {
                emit(args.json, &receipt, || output::receipt(&receipt))?;
            }
        }
        Command::Status { job_id, force } => {
            let job = client
                .job_status(&job_id, force)
                .await
                .with_context(|| format!("failed to fetch job {job_id}"))?;
            emit(args.json, &job, || output::job(&job))?;
        }
        Command::Results { job_id } => {
            let results = client
                .job_results(&job_id)
                .await
                .with_context(|| format!("failed to fetch results for job {job_id}"))?;
            emit(args.json, &results, || output::results(&results))?;
        }
        Command::Wait {
            job_id,
            poll_interval,
            max_attempts,
        } => {
            let poll = config.poll_config(poll_interval, max_attempts);
            wait_for(client, &job_id, poll, &config, args.json).await?;
        }
    }

    Ok(())
}
