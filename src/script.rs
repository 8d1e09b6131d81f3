use log::debug;
use std::io::Write;
use std::path::Path;

use crate::cmd::{self, Outcome};
use crate::config;
use crate::sys;

/// Reserved exit codes; a successful run reports the child's real code.
pub const EXIT_SPAWN_ERROR: i32 = 65;
pub const EXIT_TEMP_FAILURE: i32 = 85;
pub use crate::cmd::EXIT_TIMEOUT;

#[derive(Debug)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ScriptOutput {
    fn failed(exit_code: i32, stderr: String) -> Self {
        Self {
            stdout: String::new(),
            stderr,
            exit_code,
        }
    }
}

/// Materialize `code` into the agent temp directory and run it through the
/// matching interpreter with a deadline. The temp file lives for the duration
/// of the run and is removed on scope exit.
pub async fn run_script(
    code: &str,
    shell: &str,
    args: &[String],
    timeout_secs: u64,
    python_bin: &Path,
) -> ScriptOutput {
    if timeout_secs == 0 {
        return ScriptOutput::failed(
            EXIT_TIMEOUT,
            "Script timed out after 0 seconds".to_string(),
        );
    }

    if let Err(e) = config::create_agent_temp_dir() {
        return ScriptOutput::failed(EXIT_TEMP_FAILURE, e.to_string());
    }

    let mut file = match tempfile::Builder::new()
        .prefix("rmm")
        .suffix(sys::script_extension(shell))
        .tempfile_in(config::agent_temp_dir())
    {
        Ok(f) => f,
        Err(e) => return ScriptOutput::failed(EXIT_TEMP_FAILURE, e.to_string()),
    };
    if let Err(e) = file.write_all(code.as_bytes()) {
        return ScriptOutput::failed(EXIT_TEMP_FAILURE, e.to_string());
    }
    if let Err(e) = file.as_file().sync_all() {
        return ScriptOutput::failed(EXIT_TEMP_FAILURE, e.to_string());
    }

    let Some((exe, mut exe_args)) = sys::script_invocation(shell, file.path(), python_bin) else {
        return ScriptOutput::failed(
            EXIT_SPAWN_ERROR,
            format!("unsupported script shell: {shell}"),
        );
    };
    exe_args.extend(args.iter().cloned());
    let argrefs: Vec<&str> = exe_args.iter().map(String::as_str).collect();

    debug!("running {shell} script with {timeout_secs}s deadline");
    let out = cmd::run(&exe, &argrefs, timeout_secs).await;
    match out.outcome {
        Outcome::SpawnError => ScriptOutput::failed(EXIT_SPAWN_ERROR, out.stderr),
        Outcome::TimedOut => ScriptOutput {
            stdout: out.stdout,
            stderr: format!(
                "{}\nScript timed out after {timeout_secs} seconds",
                out.stderr
            ),
            exit_code: EXIT_TIMEOUT,
        },
        Outcome::Exited => ScriptOutput {
            stdout: out.stdout,
            stderr: out.stderr,
            exit_code: out.exit_code,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Instant;

    fn py() -> PathBuf {
        PathBuf::from("python3")
    }

    #[tokio::test]
    async fn zero_timeout_is_a_deadline_without_running() {
        let start = Instant::now();
        let out = run_script("echo never", "cmd", &[], 0, &py()).await;
        assert_eq!(out.exit_code, EXIT_TIMEOUT);
        assert!(out.stdout.is_empty());
        assert!(start.elapsed().as_millis() < 500);
    }

    #[tokio::test]
    async fn unknown_shell_reports_spawn_failure() {
        let out = run_script("puts 1", "ruby", &[], 5, &py()).await;
        assert_eq!(out.exit_code, EXIT_SPAWN_ERROR);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_args_are_appended_after_the_path() {
        let out = run_script("echo \"$1-$2\"", "cmd", &["a".into(), "b".into()], 10, &py()).await;
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "a-b");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deadline_reports_the_sentinel_code() {
        let start = Instant::now();
        let out = run_script("echo started\nsleep 30", "cmd", &[], 1, &py()).await;
        assert_eq!(out.exit_code, EXIT_TIMEOUT);
        assert!(out.stderr.contains("timed out after 1 seconds"));
        assert!(start.elapsed().as_secs() < 5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_exit_code_is_surfaced() {
        let out = run_script("exit 7", "cmd", &[], 10, &py()).await;
        assert_eq!(out.exit_code, 7);
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_spawn_error() {
        let out = run_script(
            "print('hi')",
            "python",
            &[],
            5,
            &PathBuf::from("/nonexistent/python.exe"),
        )
        .await;
        assert_eq!(out.exit_code, EXIT_SPAWN_ERROR);
    }
}
