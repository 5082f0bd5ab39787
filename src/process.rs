use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{CaptureError, LaunchError};

/// Lines buffered between the pipe readers and the consumer.
const LINE_BUFFER: usize = 256;

/// An executable plus its argument list. Never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn to_command(&self, cwd: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null()).kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        Ok(())
    }
}

/// A running command whose stdout and stderr are merged into one line stream.
///
/// Lines arrive as the child produces them. Once [`LineStream::next_line`]
/// returns `None`, both pipes are closed and [`LineStream::wait`] yields the
/// exit status.
pub struct LineStream {
    child: Child,
    lines: mpsc::Receiver<String>,
}

impl LineStream {
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    pub async fn wait(mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }
}

/// Starts `spec` in `cwd` with merged output.
pub fn launch(spec: &CommandSpec, cwd: &Path) -> Result<LineStream, LaunchError> {
    let mut child = spec
        .to_command(Some(cwd))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| LaunchError { program: spec.program.clone(), source })?;

    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    if let Some(out) = child.stdout.take() {
        forward_lines(out, tx.clone());
    }
    if let Some(err) = child.stderr.take() {
        forward_lines(err, tx);
    }
    Ok(LineStream { child, lines: rx })
}

fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "pipe read failed");
                    break;
                }
            }
        }
    });
}

/// Everything a streamed command produced.
#[derive(Debug)]
pub struct Completed {
    pub lines: Vec<String>,
    pub status: ExitStatus,
}

impl Completed {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Runs `spec` to completion, handing every line to `on_line` as soon as it
/// is read and accumulating the full output.
pub async fn run_streaming<F>(spec: &CommandSpec, cwd: &Path, mut on_line: F) -> Result<Completed, LaunchError>
where
    F: FnMut(&str),
{
    let mut stream = launch(spec, cwd)?;
    let mut lines = Vec::new();
    while let Some(line) = stream.next_line().await {
        on_line(&line);
        lines.push(line);
    }
    let status = stream
        .wait()
        .await
        .map_err(|source| LaunchError { program: spec.program.clone(), source })?;
    Ok(Completed { lines, status })
}

#[derive(Debug)]
pub struct Captured {
    pub stdout: String,
}

/// Runs a short command and collects its output, killing it after `timeout`.
/// A non-zero exit is an error.
pub async fn capture(spec: &CommandSpec, timeout: Duration) -> Result<Captured, CaptureError> {
    let child = spec
        .to_command(None)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| LaunchError { program: spec.program.clone(), source })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(res) => res.map_err(|source| CaptureError::Io { program: spec.program.clone(), source })?,
        // dropping the future drops the child, which kills it
        Err(_) => {
            return Err(CaptureError::Timeout {
                program: spec.program.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    };

    if !output.status.success() {
        return Err(CaptureError::Failed {
            program: spec.program.clone(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(Captured { stdout: String::from_utf8_lossy(&output.stdout).into_owned() })
}

/// True when `spec` runs successfully within `timeout`.
pub async fn probe(spec: &CommandSpec, timeout: Duration) -> bool {
    match capture(spec, timeout).await {
        Ok(_) => true,
        Err(e) => {
            debug!(command = %spec, error = %e, "probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn lines_arrive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("for i in 1 2 3 4 5 6 7 8 9 10; do echo \"marker-$i\"; done");
        let mut seen = Vec::new();
        let done = run_streaming(&spec, dir.path(), |l| seen.push(l.to_string())).await.unwrap();

        let expected: Vec<String> = (1..=10).map(|i| format!("marker-{i}")).collect();
        assert_eq!(seen, expected);
        assert_eq!(done.lines, expected);
        assert!(done.success());
    }

    #[tokio::test]
    async fn first_line_is_delivered_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = launch(&sh("echo first; sleep 3; echo second"), dir.path()).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), stream.next_line())
            .await
            .expect("line should arrive while the command is still running");
        assert_eq!(first.as_deref(), Some("first"));
        assert_eq!(stream.next_line().await.as_deref(), Some("second"));
        assert_eq!(stream.next_line().await, None);
        assert!(stream.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn stderr_is_merged_and_nonzero_exit_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let done = run_streaming(&sh("echo out; echo err 1>&2; exit 3"), dir.path(), |_| {}).await.unwrap();
        assert!(done.lines.contains(&"out".to_string()));
        assert!(done.lines.contains(&"err".to_string()));
        assert_eq!(done.status.code(), Some(3));
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("here.txt"), "x").unwrap();
        let done = run_streaming(&CommandSpec::new("ls"), dir.path(), |_| {}).await.unwrap();
        assert_eq!(done.lines, vec!["here.txt".to_string()]);
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_streaming(&CommandSpec::new("definitely-not-a-real-tool-xyz"), dir.path(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.source.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn capture_times_out() {
        let err = capture(&sh("sleep 5"), Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, CaptureError::Timeout { .. }));
    }

    #[tokio::test]
    async fn capture_reports_failure_with_stderr() {
        let err = capture(&sh("echo nope 1>&2; exit 1"), Duration::from_secs(5)).await.unwrap_err();
        match err {
            CaptureError::Failed { stderr, .. } => assert_eq!(stderr, "nope"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(probe(&sh("exit 0"), Duration::from_secs(5)).await);
        assert!(!probe(&CommandSpec::new("definitely-not-a-real-tool-xyz"), Duration::from_secs(5)).await);
    }

    #[test]
    fn display_joins_args() {
        let spec = CommandSpec::new("sysbench").args(["cpu", "--threads=1", "run"]);
        assert_eq!(spec.to_string(), "sysbench cpu --threads=1 run");
    }
}
