mod args;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use libfanout::capture::{spawn_child, SpawnContext};
use libfanout::limiter::Limiter;
use libfanout::memory::MemoryBudget;
use libfanout::scheduler::Scheduler;
use libfanout::term::{self, TerminalGuard};
use tokio::io::AsyncBufReadExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::args::Invocation;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "fanout=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("fanout: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let invocation = args::parse()?;

    term::raise_nofile_limit();

    let interactive = term::stdout_is_tty();
    let streams_deduped =
        term::stdout_and_stderr_are_the_same().context("cannot stat stdout/stderr")?;

    let memory = Arc::new(MemoryBudget::new(invocation.max_mem_bytes));
    let limiter = match Limiter::from_env() {
        // The environment names a socket: an ancestor invocation owns the
        // parallelism budget and we only run the client side.
        Some(client) => client,
        None => Limiter::serve_root(invocation.max_concurrent)
            .await
            .context("starting the concurrency limiter")?,
    };
    let limit_socket_path = limiter.socket_path().to_path_buf();

    let terminal = Arc::new(TerminalGuard::capture());
    if interactive {
        let terminal = Arc::clone(&terminal);
        tokio::spawn(async move {
            let mut sigint =
                signal(SignalKind::interrupt()).expect("could not install SIGINT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("could not install SIGTERM handler");
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            terminal.restore();
            std::process::exit(1);
        });
    }

    let no_longer_spawn_children = Arc::new(AtomicBool::new(false));
    let ctx = SpawnContext::new(
        memory,
        limiter,
        interactive,
        streams_deduped,
        limit_socket_path,
    );

    let (records_tx, records_rx) = mpsc::channel(invocation.max_concurrent);
    let scheduler = Scheduler::new(
        invocation.verbose,
        invocation.keep_going_on_error,
        interactive,
        Arc::clone(&no_longer_spawn_children),
    );

    tokio::spawn(produce(
        invocation,
        Arc::clone(&ctx),
        Arc::clone(&no_longer_spawn_children),
        records_tx,
    ));

    let code = scheduler.run(records_rx).await;
    terminal.restore();
    Ok(code)
}

/// Feeds the scheduler one spawned child per argument, in argument order.
/// The bounded channel is what keeps at most `max_concurrent` children
/// buffered ahead of the scheduler.
async fn produce(
    invocation: Invocation,
    ctx: Arc<SpawnContext>,
    no_longer_spawn_children: Arc<AtomicBool>,
    records_tx: mpsc::Sender<libfanout::capture::ChildRecord>,
) {
    if invocation.from_stdin {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            if no_longer_spawn_children.load(Ordering::SeqCst) {
                break;
            }
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    if !spawn_one(&invocation, &ctx, &records_tx, &line).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    eprintln!("fanout: failed reading stdin: {err}");
                    std::process::exit(1);
                }
            }
        }
    } else {
        for argument in &invocation.data {
            if no_longer_spawn_children.load(Ordering::SeqCst) {
                break;
            }
            if !spawn_one(&invocation, &ctx, &records_tx, argument).await {
                break;
            }
        }
    }
}

async fn spawn_one(
    invocation: &Invocation,
    ctx: &Arc<SpawnContext>,
    records_tx: &mpsc::Sender<libfanout::capture::ChildRecord>,
    argument: &str,
) -> bool {
    let command =
        args::instantiate_command(&invocation.command, argument, &invocation.replacement);
    match spawn_child(ctx, command).await {
        Ok(record) => records_tx.send(record).await.is_ok(),
        Err(err) => {
            eprintln!("fanout: {err:#}");
            std::process::exit(1);
        }
    }
}
