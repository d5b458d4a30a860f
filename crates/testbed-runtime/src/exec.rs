//! Subprocess execution with a hard time limit.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use testbed_common::error::{Result, TestbedError};

const WAIT_POLL: Duration = Duration::from_millis(20);

/// Output from a finished command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Standard output from the command.
    pub stdout: String,
    /// Standard error from the command.
    pub stderr: String,
    /// Exit code returned by the command.
    pub exit_code: i32,
}

impl ExecOutput {
    /// Whether the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Renders a command line for logs and error messages.
#[must_use]
pub fn render(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs `program` with `args` and extra environment variables, killing it
/// once `timeout` elapses.
///
/// A non-zero exit is not an error here; callers inspect
/// [`ExecOutput::exit_code`] and map failures to their own error variant.
///
/// # Errors
///
/// Returns an error if the program cannot be spawned or waited on, or
/// [`TestbedError::CommandTimeout`] if it outlives `timeout`.
pub fn run_command(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    timeout: Duration,
) -> Result<ExecOutput> {
    tracing::debug!(command = %render(program, args), ?timeout, "running command");

    let mut child = Command::new(program)
        .args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| TestbedError::Io {
            path: program.into(),
            source: e,
        })?;

    // Pipes are drained on their own threads so a chatty child cannot block
    // on a full pipe while we poll for its exit.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(command = %render(program, args), ?timeout, "command timed out");
                return Err(TestbedError::CommandTimeout {
                    command: render(program, args),
                    timeout,
                });
            }
            Ok(None) => std::thread::sleep(WAIT_POLL),
            Err(e) => {
                return Err(TestbedError::Io {
                    path: program.into(),
                    source: e,
                });
            }
        }
    };

    Ok(ExecOutput {
        stdout: stdout.map(collect).unwrap_or_default(),
        stderr: stderr.map(collect).unwrap_or_default(),
        exit_code: status.code().unwrap_or(-1),
    })
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}
