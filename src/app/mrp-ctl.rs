use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use itertools::Itertools;
use mrpipe::cmd::ctl::{Args, Commands};
use mrpipe::scheduler::JobResult;
use mrpipe::standalone::engine::{pack_inputs, run_job};
use mrpipe::utils::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit status for a job that finished with permanent failures.
const EXIT_FAILED_ITEMS: u8 = 1;
/// Exit status for fatal errors: bad input, output or configuration.
const EXIT_FATAL: u8 = 2;

fn display_result(result: &JobResult) {
    println!(
        "STATUS: [{:?}]\tITEMS: [{}]\tSUCCEEDED: [{}]\tATTEMPTS: [{}]",
        result.status, result.items, result.succeeded, result.attempts
    );
    if !result.failures.is_empty() {
        println!(
            "FAILED ({}): {}",
            result.failures.len(),
            result
                .failures
                .iter()
                .map(|f| format!("{} after {} attempt(s): {}", f.key, f.attempts, f.message))
                .join("; ")
        );
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    match args.command {
        Commands::Run(run) => {
            let job = run.into_job()?;
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing in-flight attempts");
                    on_signal.cancel();
                }
            });

            let output = run_job(&job, &cancel).await?;
            display_result(&output.result);
            if output.result.is_success() {
                info!(path = %job.output.display(), "job succeeded");
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_FAILED_ITEMS))
            }
        }
        Commands::Pack { input, output } => {
            let n = pack_inputs(&input, &output)?;
            println!("Packed {n} file(s) into {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
