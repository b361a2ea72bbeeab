use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sysinfo::{Pid as SysPid, ProcessStatus, System};
use tokio::sync::mpsc;
use tracing::debug;

use crate::capture::ChildRecord;

const BOLD: &str = "\x1b[1m";
const YELLOW: &str = "\x1b[33m";
const SGR_RESET: &str = "\x1b[0m";

/// Replays captured output strictly in spawn-submission order.
///
/// Children run in parallel, but the terminal only ever shows one child's
/// bytes at a time: the scheduler flushes the head child's buffer, promotes
/// it to live foreground output, waits for it to finish, and moves to the
/// next record. Completion order never changes presentation order.
pub struct Scheduler {
    verbose: bool,
    keep_going_on_error: bool,
    stdout_is_tty: bool,
    no_longer_spawn_children: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        verbose: bool,
        keep_going_on_error: bool,
        stdout_is_tty: bool,
        no_longer_spawn_children: Arc<AtomicBool>,
    ) -> Self {
        Self {
            verbose,
            keep_going_on_error,
            stdout_is_tty,
            no_longer_spawn_children,
        }
    }

    /// Consumes the ordered channel of spawned children and returns the
    /// aggregate exit code: the maximum over all children.
    pub async fn run(&self, mut records: mpsc::Receiver<ChildRecord>) -> i32 {
        let mut aggregate = 0;
        let mut first = true;

        while let Some(mut record) = records.recv().await {
            if self.verbose {
                self.echo_command(&record, first);
            }

            record.output.promote_and_flush();
            let code = (&mut record.exit_code).await.unwrap_or(1);
            aggregate = aggregate.max(code);

            if aggregate != 0 && !self.keep_going_on_error {
                self.no_longer_spawn_children.store(true, Ordering::SeqCst);
                terminate_remaining(&mut records).await;
                break;
            }
            first = false;
        }

        aggregate
    }

    fn echo_command(&self, record: &ChildRecord, first: bool) {
        let quoted = shlex::try_join(record.original_command.iter().map(String::as_str))
            .unwrap_or_else(|_| record.original_command.join(" "));

        if first || !self.stdout_is_tty {
            eprintln!("{BOLD}+ {quoted}{SGR_RESET}");
        } else if !child_is_alive(record.pid) {
            eprintln!(
                "{BOLD}+ {quoted}{SGR_RESET}{YELLOW} (already finished, reporting saved output){SGR_RESET}"
            );
        } else if record.started_at.elapsed() > Duration::from_secs(1) {
            eprintln!(
                "{BOLD}+ {quoted}{SGR_RESET}{YELLOW} (resumed output, already running for {}s){SGR_RESET}",
                record.started_at.elapsed().as_secs()
            );
        } else {
            eprintln!("{BOLD}+ {quoted}{SGR_RESET}");
        }
    }
}

/// After a failure stops the run: everything still queued is already running
/// or spawned, so terminate each child and wait for it. Nothing here may be
/// skipped — leaving a child unwaited leaks a zombie.
async fn terminate_remaining(records: &mut mpsc::Receiver<ChildRecord>) {
    let mut pending = Vec::new();
    while let Some(record) = records.recv().await {
        debug!("terminating queued child {}", record.pid);
        let _ = kill(Pid::from_raw(record.pid as i32), Signal::SIGTERM);
        pending.push(record);
    }
    for mut record in pending {
        let _ = (&mut record.exit_code).await;
    }
}

fn child_is_alive(pid: u32) -> bool {
    let mut system = System::new();
    let sys_pid = SysPid::from_u32(pid);
    if !system.refresh_process(sys_pid) {
        return false;
    }
    match system.process(sys_pid) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie),
        None => false,
    }
}
