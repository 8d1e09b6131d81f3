use log::{debug, error};
use std::process::Stdio;
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::sys;

/// Exit code reported when a child is torn down at its deadline.
pub const EXIT_TIMEOUT: i32 = 98;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Exited,
    TimedOut,
    SpawnError,
}

#[derive(Debug)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub outcome: Outcome,
}

impl CmdOutput {
    fn spawn_error(e: std::io::Error) -> Self {
        Self {
            stdout: String::new(),
            stderr: e.to_string(),
            exit_code: 1,
            outcome: Outcome::SpawnError,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.outcome == Outcome::TimedOut
    }

    /// stderr when the child wrote any, stdout otherwise.
    pub fn merged(&self) -> String {
        if !self.stderr.is_empty() {
            self.stderr.clone()
        } else {
            self.stdout.clone()
        }
    }
}

/// Run `exe` with a deadline, shell=false.
pub async fn run(exe: &str, args: &[&str], timeout_secs: u64) -> CmdOutput {
    let mut cmd = Command::new(exe);
    cmd.args(args);
    spawn_and_wait(cmd, timeout_secs).await
}

/// Run a command string through the OS command processor, quoting preserved
/// as supplied by the caller.
pub async fn run_shell(shell: &str, command: &str, timeout_secs: u64) -> CmdOutput {
    let (exe, args) = sys::shell_invocation(shell, command);
    let mut cmd = Command::new(exe);
    cmd.args(&args);
    spawn_and_wait(cmd, timeout_secs).await
}

pub(crate) async fn spawn_and_wait(mut cmd: Command, timeout_secs: u64) -> CmdOutput {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    // Each child gets its own process group so the whole tree can be
    // signalled at the deadline.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            debug!("spawn failed: {e}");
            return CmdOutput::spawn_error(e);
        }
    };

    let pid = child.id();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let out_task = tokio::spawn(read_to_string(stdout_pipe));
    let err_task = tokio::spawn(read_to_string(stderr_pipe));

    let waited = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await;
    let (exit_code, outcome) = match waited {
        Ok(Ok(status)) => (status.code().unwrap_or(1), Outcome::Exited),
        Ok(Err(e)) => {
            error!("error waiting on child: {e}");
            (1, Outcome::Exited)
        }
        Err(_) => {
            if let Some(pid) = pid {
                kill_tree(pid);
            }
            let _ = child.wait().await;
            (EXIT_TIMEOUT, Outcome::TimedOut)
        }
    };

    let stdout = out_task.await.unwrap_or_default();
    let stderr = err_task.await.unwrap_or_default();
    CmdOutput {
        stdout,
        stderr,
        exit_code,
        outcome,
    }
}

async fn read_to_string<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Launch `exe` in an independent process group; the agent may exit without
/// reaping it. Used by self-update, uninstall, and recovery commands.
pub fn run_detached(exe: &str, args: &[&str]) -> std::io::Result<()> {
    let mut cmd = std::process::Command::new(exe);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    detach(&mut cmd);
    cmd.spawn().map(|_| ())
}

/// Detached variant of `run_shell`. The command processor becomes the parent,
/// so a recovery command can restart or kill this agent without killing
/// itself mid-flight.
pub fn run_shell_detached(shell: &str, command: &str) -> std::io::Result<()> {
    let (exe, args) = sys::shell_invocation(shell, command);
    let argrefs: Vec<&str> = args.iter().map(String::as_str).collect();
    run_detached(&exe, &argrefs)
}

#[cfg(unix)]
fn detach(cmd: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(windows)]
fn detach(cmd: &mut std::process::Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

/// Kill the process tree rooted at `root`. Shell wrappers orphan their
/// grandchildren, so killing only the direct child leaves interpreters
/// running past the deadline.
pub fn kill_tree(root: u32) {
    #[cfg(unix)]
    unsafe {
        libc::killpg(root as i32, libc::SIGKILL);
    }

    let mut sys = System::new();
    sys.refresh_processes();
    let procs = sys.processes();

    let mut victims = vec![Pid::from_u32(root)];
    let mut i = 0;
    while i < victims.len() {
        let parent = victims[i];
        for (pid, p) in procs {
            if p.parent() == Some(parent) && !victims.contains(pid) {
                victims.push(*pid);
            }
        }
        i += 1;
    }

    // Children first so nothing has a chance to re-spawn under a dying parent.
    for pid in victims.iter().rev() {
        if let Some(p) = procs.get(pid) {
            p.kill();
        }
    }
}

/// Kill a single process and anything under it. Errors when the pid is not
/// in the process table.
pub fn kill_proc(pid: u32) -> anyhow::Result<()> {
    let mut sys = System::new();
    sys.refresh_processes();
    if sys.process(Pid::from_u32(pid)).is_none() {
        anyhow::bail!("process {pid} not found");
    }
    kill_tree(pid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run_shell("cmd", "echo hello", 10).await;
        assert_eq!(out.outcome, Outcome::Exited);
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.stderr.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stderr_separately() {
        let out = run_shell("cmd", "echo oops 1>&2; exit 3", 10).await;
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "oops");
        assert!(out.stdout.is_empty());
        assert_eq!(out.merged().trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deadline_kills_the_process_tree() {
        let start = Instant::now();
        let out = run_shell("cmd", "sleep 30", 1).await;
        assert!(out.timed_out());
        assert_eq!(out.exit_code, EXIT_TIMEOUT);
        // Deadline plus a small epsilon, never the full sleep.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let out = run("rmmagent-test-no-such-binary", &[], 5).await;
        assert_eq!(out.outcome, Outcome::SpawnError);
        assert!(!out.stderr.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn detached_child_outlives_the_call() {
        run_detached("sh", &["-c", "exit 0"]).expect("spawn");
    }
}
