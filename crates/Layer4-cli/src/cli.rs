//! Commands

use crate::host::Host;
use anyhow::{bail, Context};
use chrono::Utc;
use clap::Subcommand;
use relay_foundation::RelayConfig;
use relay_task::{
    ApplyOutcome, CallbackPayload, CancelOutcome, Chunk, PtyCommand, PtyProcess, SubtaskId,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply callback chunks (JSON lines) from a file or stdin
    Ingest {
        /// Input file; stdin when omitted
        file: Option<PathBuf>,
    },
    /// Reclaim stale remote executors
    Reap {
        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },
    /// Cancel a subtask
    Cancel {
        subtask: i64,
    },
    /// Show a subtask and its task
    Status {
        subtask: i64,
    },
    /// Run a command in a pseudo-terminal, relaying stdin and stdout
    Pty {
        #[arg(long, default_value = "24")]
        rows: u16,

        #[arg(long, default_value = "80")]
        cols: u16,

        #[arg(long)]
        cwd: Option<PathBuf>,

        #[arg(last = true, required = true, value_name = "CMD")]
        argv: Vec<String>,
    },
}

pub async fn run(command: Command, config: RelayConfig) -> anyhow::Result<()> {
    match command {
        Command::Ingest { file } => ingest(Host::open(config).await?, file).await,
        Command::Reap { once } => reap(Host::open(config).await?, once).await,
        Command::Cancel { subtask } => cancel(Host::open(config).await?, SubtaskId(subtask)).await,
        Command::Status { subtask } => status(Host::open(config).await?, SubtaskId(subtask)).await,
        Command::Pty {
            rows,
            cols,
            cwd,
            argv,
        } => pty(argv, rows, cols, cwd).await,
    }
}

#[derive(Debug, Default)]
struct IngestSummary {
    applied: usize,
    unchanged: usize,
    ignored_terminal: usize,
    rejected: usize,
}

async fn ingest(host: Host, file: Option<PathBuf>) -> anyhow::Result<()> {
    let reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> = match &file {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = BufReader::new(reader).lines();
    let mut summary = IngestSummary::default();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let chunk = serde_json::from_str::<CallbackPayload>(line)
            .map_err(anyhow::Error::from)
            .and_then(|payload| Chunk::try_from(payload).map_err(anyhow::Error::from));
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(line = line_no, error = %e, "Rejected callback line");
                summary.rejected += 1;
                continue;
            }
        };

        match host.bridge.apply_chunk(chunk).await {
            Ok(ApplyOutcome::Applied(_)) => summary.applied += 1,
            Ok(ApplyOutcome::Unchanged(_)) => summary.unchanged += 1,
            Ok(ApplyOutcome::IgnoredTerminal(_)) => summary.ignored_terminal += 1,
            Err(e) => {
                warn!(line = line_no, error = %e, "Callback chunk not applied");
                summary.rejected += 1;
            }
        }
    }

    info!(?summary, "Ingest finished");
    println!(
        "applied {}, unchanged {}, ignored (terminal) {}, rejected {}",
        summary.applied, summary.unchanged, summary.ignored_terminal, summary.rejected
    );
    Ok(())
}

async fn reap(host: Host, once: bool) -> anyhow::Result<()> {
    let reaper = Arc::new(host.reaper());

    if once {
        let report = reaper.sweep_once(Utc::now()).await?;
        println!("scanned {}, eligible {}", report.scanned, report.eligible);
        for (executor, subtasks) in &report.reclaimed {
            println!("reclaimed {} ({} subtasks)", executor, subtasks);
        }
        for (executor, error) in &report.failed {
            println!("failed {}: {}", executor, error);
        }
        return Ok(());
    }

    if !host.config.reaper.enabled {
        bail!("reaper is disabled in the configuration");
    }

    let shutdown = CancellationToken::new();
    let handle = reaper.spawn(shutdown.clone());
    tokio::signal::ctrl_c().await?;
    info!("Shutting down reaper");
    shutdown.cancel();
    handle.await?;
    Ok(())
}

async fn cancel(host: Host, id: SubtaskId) -> anyhow::Result<()> {
    match host.coordinator().cancel(id).await? {
        CancelOutcome::Cancelled {
            path,
            subtask,
            remote_error,
            ..
        } => {
            println!(
                "subtask {} cancelled via {} path (progress {})",
                subtask.id,
                path.as_str(),
                subtask.progress
            );
            if let Some(error) = remote_error {
                println!("remote cancel failed: {}", error);
            }
        }
        CancelOutcome::AlreadyTerminal(subtask) => {
            println!("subtask {} already {}", subtask.id, subtask.status);
        }
    }
    Ok(())
}

async fn status(host: Host, id: SubtaskId) -> anyhow::Result<()> {
    let subtask = host.bridge.get_subtask(id).await?;
    let task = host.bridge.get_task(subtask.task_id).await?;

    let view = serde_json::json!({
        "task": {
            "id": task.id,
            "status": task.status,
            "progress": task.progress,
            "task_type": task.task_type(),
            "error_message": task.error_message,
        },
        "subtask": subtask,
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn pty(argv: Vec<String>, rows: u16, cols: u16, cwd: Option<PathBuf>) -> anyhow::Result<()> {
    let mut command = PtyCommand::new(argv).size(rows, cols);
    if let Some(cwd) = cwd {
        command = command.cwd(cwd);
    }

    let mut process = PtyProcess::spawn(&command)?;
    info!(pid = ?process.pid(), rows, cols, "PTY process started");
    let mut output = process.spawn_output_pump(64)?;
    let pty_input = process.spawn_input_pump(64)?;
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            bytes = output.recv() => match bytes {
                Some(bytes) => {
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
                None => break,
            },
            line = input.next_line(), if stdin_open => match line? {
                Some(mut line) => {
                    line.push('\n');
                    if pty_input.send(line.into_bytes()).await.is_err() {
                        warn!("PTY input closed, no longer forwarding stdin");
                        stdin_open = false;
                    }
                }
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, terminating PTY process");
                process.terminate(false)?;
                break;
            }
        }
    }

    drop(pty_input);
    let code = tokio::task::spawn_blocking(move || process.close(Duration::from_secs(5))).await?;
    let code = match code {
        Some(code) => {
            info!(code, "PTY process exited");
            code as i32
        }
        None => {
            warn!("PTY process exit status unknown");
            1
        }
    };
    // A pending stdin read would keep the runtime from shutting down
    std::process::exit(code)
}
