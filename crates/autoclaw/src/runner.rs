use crate::AutoclawError;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

const TERM_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Default)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub killed: bool,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        !self.killed && self.exit_code == Some(0)
    }
}

/// Spawn `argv` and wait for it, capturing stdout/stderr.
///
/// Output is drained concurrently from spawn, so a run that exceeds
/// `timeout` still reports whatever it printed before termination.
pub async fn run_command(
    argv: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<RunOutput, AutoclawError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| AutoclawError::new("empty command"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let mut child = command
        .spawn()
        .map_err(|err| AutoclawError::new(format!("spawn {program} failed: {err}")))?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| AutoclawError::new("child stdout missing"))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| AutoclawError::new("child stderr missing"))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let mut output = RunOutput::default();
    tokio::select! {
        status = child.wait() => {
            let status = status
                .map_err(|err| AutoclawError::new(format!("wait failed: {err}")))?;
            output.exit_code = status.code();
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                output.signal = status.signal();
            }
        }
        _ = tokio::time::sleep(timeout) => {
            terminate(&mut child).await;
            output.killed = true;
        }
    }

    output.stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).to_string();
    output.stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).to_string();
    Ok(output)
}

/// SIGTERM, a short grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
        let _ = child.wait().await;
    }
}

/// Long-lived JSON-line RPC transport for agents that support it.
///
/// The child is spawned once with `--mode rpc` and reused across calls to
/// avoid cold starts. Requests are one JSON line on stdin; response lines
/// stream until one carries `"done": true`. A protocol error or timeout
/// kills the child so the next request respawns it.
#[derive(Default)]
pub struct RpcRunner {
    child: Option<RpcChild>,
    argv: Vec<String>,
}

struct RpcChild {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl RpcRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|rpc| rpc.child.id())
    }

    pub async fn request(
        &mut self,
        argv: &[String],
        cwd: Option<&Path>,
        body: &str,
        timeout: Duration,
    ) -> Result<RunOutput, AutoclawError> {
        if self.argv != argv {
            self.shutdown().await;
            self.argv = argv.to_vec();
        }
        if self.child.is_none() {
            self.child = Some(RpcChild::spawn(argv, cwd).await?);
        }
        let rpc = match self.child.as_mut() {
            Some(rpc) => rpc,
            None => return Err(AutoclawError::new("rpc child unavailable")),
        };

        match tokio::time::timeout(timeout, rpc.roundtrip(body)).await {
            Ok(Ok(text)) => Ok(RunOutput {
                stdout: text,
                exit_code: Some(0),
                ..RunOutput::default()
            }),
            Ok(Err(err)) => {
                self.shutdown().await;
                Err(err)
            }
            Err(_) => {
                self.shutdown().await;
                Ok(RunOutput {
                    killed: true,
                    ..RunOutput::default()
                })
            }
        }
    }

    pub async fn shutdown(&mut self) {
        if let Some(mut rpc) = self.child.take() {
            terminate(&mut rpc.child).await;
        }
    }
}

impl RpcChild {
    async fn spawn(argv: &[String], cwd: Option<&Path>) -> Result<Self, AutoclawError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| AutoclawError::new("empty rpc command"))?;
        let mut command = Command::new(program);
        command
            .args(args)
            .arg("--mode")
            .arg("rpc")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let mut child = command
            .spawn()
            .map_err(|err| AutoclawError::new(format!("rpc spawn {program} failed: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AutoclawError::new("rpc child stdin missing"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AutoclawError::new("rpc child stdout missing"))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn roundtrip(&mut self, body: &str) -> Result<String, AutoclawError> {
        let request = serde_json::json!({ "type": "prompt", "message": body });
        let line = format!("{request}\n");
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AutoclawError::new(format!("rpc write failed: {err}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|err| AutoclawError::new(format!("rpc flush failed: {err}")))?;

        let mut texts = Vec::new();
        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|err| AutoclawError::new(format!("rpc read failed: {err}")))?
                .ok_or_else(|| AutoclawError::new("rpc child closed its stdout"))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: serde_json::Value = serde_json::from_str(&line)
                .map_err(|err| AutoclawError::new(format!("rpc protocol error: {err}")))?;
            if let Some(text) = event.get("text").and_then(|value| value.as_str()) {
                texts.push(text.to_string());
            }
            if event.get("done").and_then(|value| value.as_bool()) == Some(true) {
                return Ok(texts.join("\n"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let output = run_command(
            &sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.killed);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn timeout_kills_and_keeps_partial_output() {
        let output = run_command(
            &sh("echo partial answer; exec sleep 10"),
            None,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert!(output.killed);
        assert!(output.stdout.contains("partial answer"));
    }

    #[tokio::test]
    async fn cwd_is_honoured() {
        let dir = std::env::temp_dir();
        let output = run_command(&sh("pwd"), Some(&dir), Duration::from_secs(5))
            .await
            .unwrap();
        let printed = std::path::PathBuf::from(output.stdout.trim());
        let expected = dir.canonicalize().unwrap_or(dir);
        assert_eq!(printed.canonicalize().unwrap_or(printed), expected);
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let argv = vec!["autoclaw-definitely-not-a-binary".to_string()];
        assert!(run_command(&argv, None, Duration::from_secs(1)).await.is_err());
    }

    const ECHO_RPC: &str =
        r#"while read line; do printf '{"type":"response","text":"pong","done":true}\n'; done"#;

    #[tokio::test]
    async fn rpc_child_is_reused_across_requests() {
        let mut runner = RpcRunner::new();
        let argv = sh(ECHO_RPC);

        let first = runner
            .request(&argv, None, "hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(first.stdout, "pong");
        let pid = runner.child_id();
        assert!(pid.is_some());

        let second = runner
            .request(&argv, None, "again", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(second.stdout, "pong");
        assert_eq!(runner.child_id(), pid);

        runner.shutdown().await;
    }

    #[tokio::test]
    async fn rpc_protocol_error_restarts_the_child() {
        let mut runner = RpcRunner::new();
        let bad = sh(r#"while read line; do echo not-json; done"#);
        let result = runner
            .request(&bad, None, "hello", Duration::from_secs(5))
            .await;
        assert!(result.is_err());
        assert!(runner.child_id().is_none());

        let good = sh(ECHO_RPC);
        let output = runner
            .request(&good, None, "hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.stdout, "pong");
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn rpc_timeout_reports_killed() {
        let mut runner = RpcRunner::new();
        let silent = sh("while read line; do sleep 60; done");
        let output = runner
            .request(&silent, None, "hello", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(output.killed);
        assert!(runner.child_id().is_none());
        runner.shutdown().await;
    }
}
