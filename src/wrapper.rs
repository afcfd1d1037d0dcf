//! The retry-guard wrapper: run a subcommand with retries, a timeout, and
//! idempotency protection.
//!
//! Before anything runs, the guard table is consulted: a SUCCESS row for
//! `(task_name, idempotency_key)` means the work is already satisfied and
//! the wrapper exits cleanly without re-executing. Otherwise the subcommand
//! runs with bounded retries, each attempt recorded, and the final exit
//! code is forwarded to the caller. Guard rows are never deleted here.

use std::time::Duration;

use tokio::process::Command;
use tracing::{error, info, warn};

use crate::error::{truncate_err, Result};
use crate::store::models::RunStatus;
use crate::store::Store;

pub struct GuardArgs {
    pub task_name: String,
    pub idempotency_key: String,
    pub retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub command: Vec<String>,
}

/// Run the guarded subcommand; returns the exit code to forward.
pub async fn run_guarded(store: &dyn Store, args: &GuardArgs) -> Result<i32> {
    if args.command.is_empty() {
        error!("guard: no subcommand given after --");
        return Ok(2);
    }

    if let Some(existing) = store.guard(&args.task_name, &args.idempotency_key).await? {
        if existing.status == RunStatus::Success.as_str() {
            info!(
                task = %args.task_name,
                key = %args.idempotency_key,
                "skipped: already satisfied by a previous successful run"
            );
            println!(
                "skipped task={} key={} reason=already-satisfied",
                args.task_name, args.idempotency_key
            );
            return Ok(0);
        }
    }

    let timeout_sec = args.timeout.as_secs() as u32;
    let mut last_code = 1;

    for attempt in 0..=args.retries {
        store
            .upsert_guard(
                &args.task_name,
                &args.idempotency_key,
                RunStatus::Running,
                attempt,
                timeout_sec,
                None,
            )
            .await?;

        match run_once(&args.command, args.timeout).await {
            AttemptOutcome::Success => {
                store
                    .upsert_guard(
                        &args.task_name,
                        &args.idempotency_key,
                        RunStatus::Success,
                        attempt,
                        timeout_sec,
                        None,
                    )
                    .await?;
                info!(task = %args.task_name, attempt, "guarded command succeeded");
                return Ok(0);
            }
            AttemptOutcome::Failed(code) => {
                last_code = code;
                let err = format!("exit_code={code}");
                store
                    .upsert_guard(
                        &args.task_name,
                        &args.idempotency_key,
                        RunStatus::Failed,
                        attempt,
                        timeout_sec,
                        Some(&err),
                    )
                    .await?;
                warn!(task = %args.task_name, attempt, code, "guarded command failed");
            }
            AttemptOutcome::TimedOut => {
                last_code = 1;
                let err = format!("timeout_after={}s", args.timeout.as_secs());
                store
                    .upsert_guard(
                        &args.task_name,
                        &args.idempotency_key,
                        RunStatus::Failed,
                        attempt,
                        timeout_sec,
                        Some(&truncate_err(&err, 255)),
                    )
                    .await?;
                warn!(task = %args.task_name, attempt, "guarded command timed out");
            }
        }

        if attempt < args.retries {
            info!(delay_sec = args.retry_delay.as_secs(), "retrying guarded command");
            tokio::time::sleep(args.retry_delay).await;
        }
    }

    error!(task = %args.task_name, "guarded command exhausted retries");
    Ok(last_code)
}

enum AttemptOutcome {
    Success,
    Failed(i32),
    TimedOut,
}

async fn run_once(command: &[String], timeout: Duration) -> AttemptOutcome {
    let mut child = match Command::new(&command[0]).args(&command[1..]).spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, cmd = %command[0], "failed to spawn guarded command");
            return AttemptOutcome::Failed(127);
        }
    };

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => AttemptOutcome::Success,
        Ok(Ok(status)) => AttemptOutcome::Failed(status.code().unwrap_or(1)),
        Ok(Err(e)) => {
            error!(error = %e, "failed waiting on guarded command");
            AttemptOutcome::Failed(1)
        }
        Err(_) => {
            // The attempt deadline expired; kill the child and move on.
            let _ = child.kill().await;
            AttemptOutcome::TimedOut
        }
    }
}
