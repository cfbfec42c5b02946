//! Container executor: runs one component container to completion with a
//! strict wall-clock deadline and collects one structured result.
//!
//! The contract with the component is a single JSON object written to
//! `$SHIPSEC_OUTPUT_PATH` inside the output mount. Stdout and stderr are
//! streamed as terminal chunks and log lines but are never parsed for
//! outputs.

use std::io::ErrorKind;
use std::io::Read;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;

use shipsec_protocol::ContainerSpec;
use shipsec_protocol::LogLevel;
use shipsec_protocol::RunnerKind;
use shipsec_protocol::TerminalStream;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::error::ShipsecErr;
use crate::error::stderr_tail;
use crate::flags::SHIPSEC_CONTAINER_RUNTIME;
use crate::flags::SHIPSEC_KILL_GRACE_MS;
use crate::flags::SKIP_CONTAINER_CLEANUP;

/// Mount point of the per-run output directory inside the container.
pub const OUTPUT_MOUNT: &str = "/shipsec-output";
/// Env var telling the component where to write its structured result.
pub const OUTPUT_ENV_VAR: &str = "SHIPSEC_OUTPUT_PATH";
const RESULT_FILE: &str = "result.json";

// Captured copies of stdout/stderr are capped; streaming through the chunk
// emitter is not.
const MAX_CAPTURE_BYTES: usize = 10 * 1024;
const MAX_CAPTURE_LINES: usize = 256;

/// Argument tokens longer than this (or containing newlines) are redacted
/// in logs; user-controlled values can be arbitrarily large.
const MAX_LOGGED_ARG_LEN: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IoMode {
    Stdio,
    Pty,
}

/// Run the container described by `spec` and return the structured result
/// record. See module docs for the output contract.
pub async fn run_container(
    spec: &ContainerSpec,
    inputs: &serde_json::Map<String, Value>,
    ctx: &ExecutionContext,
) -> Result<serde_json::Map<String, Value>> {
    let output_dir = tempfile::Builder::new()
        .prefix("shipsec-out-")
        .tempdir()?;
    let container_name = format!(
        "shipsec-{}-{}",
        sanitize_name(&ctx.node_ref),
        uuid::Uuid::new_v4().simple()
    );

    let result = if spec.pty {
        match run_pty(spec, ctx, &container_name, output_dir.path()).await {
            Err(ShipsecErr::Service(message)) if message.starts_with("pty unavailable") => {
                // PTY facilities can be missing in constrained sandboxes;
                // strip the TTY flag and run over plain pipes instead.
                warn!("{message}; falling back to standard I/O");
                run_stdio(spec, inputs, ctx, &container_name, output_dir.path(), false).await
            }
            other => other,
        }
    } else {
        run_stdio(
            spec,
            inputs,
            ctx,
            &container_name,
            output_dir.path(),
            spec.stdin_json,
        )
        .await
    };

    if *SKIP_CONTAINER_CLEANUP {
        let kept = output_dir.keep();
        debug!(dir = %kept.display(), "leaving output directory on disk");
    } else if let Err(err) = output_dir.close() {
        warn!("failed to remove container output directory: {err}");
    }

    result
}

fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Assemble the container runtime argv. Values are always passed as
/// discrete tokens; nothing is ever joined into a shell string.
fn build_runtime_args(
    spec: &ContainerSpec,
    container_name: &str,
    output_dir: &Path,
    mode: IoMode,
    stdin_json: bool,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container_name.to_string(),
    ];

    match mode {
        IoMode::Stdio => {
            if stdin_json {
                args.push("-i".to_string());
            }
        }
        IoMode::Pty => args.push("-t".to_string()),
    }

    args.push("-v".to_string());
    args.push(format!("{}:{OUTPUT_MOUNT}", output_dir.display()));
    args.push("-e".to_string());
    args.push(format!("{OUTPUT_ENV_VAR}={OUTPUT_MOUNT}/{RESULT_FILE}"));

    args.push("--network".to_string());
    args.push(spec.network.as_docker_arg().to_string());

    if let Some(platform) = &spec.platform {
        args.push("--platform".to_string());
        args.push(platform.clone());
    }

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }

    for mount in &spec.volumes {
        args.push("-v".to_string());
        let mut mapping = format!("{}:{}", mount.source, mount.target);
        if mount.read_only {
            mapping.push_str(":ro");
        }
        args.push(mapping);
    }

    if let Some(entrypoint) = &spec.entrypoint {
        args.push("--entrypoint".to_string());
        args.push(entrypoint.clone());
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Redacted view of the argv for logging: long or multi-line tokens become
/// `<arg-N:LEN chars>`.
fn redact_args(args: &[String]) -> Vec<String> {
    args.iter()
        .enumerate()
        .map(|(index, arg)| {
            if arg.contains('\n') || arg.len() > MAX_LOGGED_ARG_LEN {
                format!("<arg-{index}:{} chars>", arg.len())
            } else {
                arg.clone()
            }
        })
        .collect()
}

struct StreamCapture {
    buf: Vec<u8>,
    remaining_bytes: usize,
    remaining_lines: usize,
    line: Vec<u8>,
}

impl StreamCapture {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            remaining_bytes: MAX_CAPTURE_BYTES,
            remaining_lines: MAX_CAPTURE_LINES,
            line: Vec::new(),
        }
    }

    /// Append within the byte/line budget and hand complete lines to the
    /// log collector. Bytes past the budget are discarded (the chunk
    /// stream still carries them) so readers never apply backpressure.
    fn push(&mut self, bytes: &[u8], mut on_line: impl FnMut(&str)) {
        for &b in bytes {
            if self.remaining_bytes > 0 && self.remaining_lines > 0 {
                self.buf.push(b);
                self.remaining_bytes -= 1;
                if b == b'\n' {
                    self.remaining_lines -= 1;
                }
            }
            if b == b'\n' {
                if !self.line.is_empty() {
                    on_line(&String::from_utf8_lossy(&self.line));
                }
                self.line.clear();
            } else {
                self.line.push(b);
            }
        }
    }

    fn finish(mut self, mut on_line: impl FnMut(&str)) -> Vec<u8> {
        if !self.line.is_empty() {
            on_line(&String::from_utf8_lossy(&self.line));
        }
        self.buf
    }
}

async fn run_stdio(
    spec: &ContainerSpec,
    inputs: &serde_json::Map<String, Value>,
    ctx: &ExecutionContext,
    container_name: &str,
    output_dir: &Path,
    stdin_json: bool,
) -> Result<serde_json::Map<String, Value>> {
    let args = build_runtime_args(spec, container_name, output_dir, IoMode::Stdio, stdin_json);
    debug!(args = ?redact_args(&args), "starting container");

    let mut cmd = Command::new(*SHIPSEC_CONTAINER_RUNTIME);
    cmd.args(&args);
    cmd.stdin(if stdin_json {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn()?;

    if stdin_json {
        let payload = serde_json::to_vec(&Value::Object(inputs.clone()))?;
        if let Some(mut stdin) = child.stdin.take() {
            // Write the full document, then close stdin so the component
            // sees EOF and starts working.
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }
    }

    let stdout_reader = child
        .stdout
        .take()
        .ok_or_else(|| ShipsecErr::Service("container stdout pipe unavailable".to_string()))?;
    let stderr_reader = child
        .stderr
        .take()
        .ok_or_else(|| ShipsecErr::Service("container stderr pipe unavailable".to_string()))?;

    let stdout_ctx = ctx.clone();
    let stdout_handle = tokio::spawn(consume_stream(
        BufReader::new(stdout_reader),
        stdout_ctx,
        TerminalStream::Stdout,
        LogLevel::Info,
    ));
    let stderr_ctx = ctx.clone();
    let stderr_handle = tokio::spawn(consume_stream(
        BufReader::new(stderr_reader),
        stderr_ctx,
        TerminalStream::Stderr,
        LogLevel::Warn,
    ));

    let deadline = Duration::from_secs(spec.timeout_seconds);
    let exit_status = tokio::select! {
        result = timeout(deadline, child.wait()) => {
            match result {
                Ok(status) => status?,
                Err(_) => {
                    kill_container(container_name).await;
                    child.start_kill()?;
                    let _ = child.wait().await;
                    return Err(ShipsecErr::Timeout { timeout_secs: spec.timeout_seconds });
                }
            }
        }
        _ = ctx.cancellation.cancelled() => {
            kill_container(container_name).await;
            child.start_kill()?;
            let _ = child.wait().await;
            return Err(ShipsecErr::Cancelled);
        }
    };

    let stdout = stdout_handle.await??;
    let stderr = stderr_handle.await??;

    finish_run(
        exit_status.code().unwrap_or(-1),
        &stdout,
        &stderr,
        output_dir,
    )
}

async fn consume_stream<R: AsyncRead + Unpin + Send + 'static>(
    mut reader: R,
    ctx: ExecutionContext,
    stream: TerminalStream,
    level: LogLevel,
) -> std::io::Result<Vec<u8>> {
    let mut emitter = ctx.terminal_emitter(stream, RunnerKind::Container, "container");
    let mut capture = StreamCapture::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        emitter.emit(&buf[..n]);
        capture.push(&buf[..n], |line| ctx.collect_log(level, line));
    }

    Ok(capture.finish(|line| ctx.collect_log(level, line)))
}

async fn run_pty(
    spec: &ContainerSpec,
    ctx: &ExecutionContext,
    container_name: &str,
    output_dir: &Path,
) -> Result<serde_json::Map<String, Value>> {
    let args = build_runtime_args(spec, container_name, output_dir, IoMode::Pty, false);
    debug!(args = ?redact_args(&args), "starting container with pty");

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| ShipsecErr::Service(format!("pty unavailable: {err}")))?;

    let mut command_builder = CommandBuilder::new(*SHIPSEC_CONTAINER_RUNTIME);
    for arg in &args {
        command_builder.arg(arg);
    }

    let mut child = pair
        .slave
        .spawn_command(command_builder)
        .map_err(|err| ShipsecErr::Service(format!("pty unavailable: {err}")))?;
    let mut killer = child.clone_killer();

    // Reader thread drains the PTY and forwards raw frames to the async
    // side where chunks are emitted.
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| ShipsecErr::Service(format!("pty unavailable: {err}")))?;
    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(128);
    let reader_handle = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if frame_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                Err(_) => break,
            }
        }
    });

    let (exit_tx, mut exit_rx) = oneshot::channel::<i32>();
    let wait_handle = tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(_) => -1,
        };
        let _ = exit_tx.send(code);
    });

    let mut emitter = ctx.terminal_emitter(TerminalStream::Pty, RunnerKind::Container, "container");
    let mut capture = StreamCapture::new();
    let deadline = Instant::now() + Duration::from_secs(spec.timeout_seconds);
    let mut exit_code: Option<i32> = None;

    loop {
        tokio::select! {
            biased;
            exit = &mut exit_rx => {
                exit_code = exit.ok();
                // Grace period to pull the remaining buffered output.
                let grace_deadline = Instant::now() + Duration::from_millis(25);
                while Instant::now() < grace_deadline {
                    match timeout(Duration::from_millis(1), frame_rx.recv()).await {
                        Ok(Some(frame)) => {
                            emitter.emit(&frame);
                            capture.push(&frame, |_| {});
                        }
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
                break;
            }
            _ = ctx.cancellation.cancelled() => {
                kill_container(container_name).await;
                let _ = killer.kill();
                reader_handle.abort();
                let _ = wait_handle.await;
                return Err(ShipsecErr::Cancelled);
            }
            frame = timeout(deadline.saturating_duration_since(Instant::now()), frame_rx.recv()) => {
                match frame {
                    Ok(Some(frame)) => {
                        emitter.emit(&frame);
                        capture.push(&frame, |_| {});
                    }
                    Ok(None) => {
                        // PTY closed; keep waiting for the exit code.
                        let code = (&mut exit_rx).await.ok();
                        exit_code = code;
                        break;
                    }
                    Err(_) => {
                        kill_container(container_name).await;
                        let _ = killer.kill();
                        reader_handle.abort();
                        let _ = wait_handle.await;
                        return Err(ShipsecErr::Timeout { timeout_secs: spec.timeout_seconds });
                    }
                }
            }
        }
    }

    let _ = reader_handle.await;
    let _ = wait_handle.await;

    let combined = capture.finish(|_| {});
    finish_run(exit_code.unwrap_or(-1), &combined, &combined, output_dir)
}

fn finish_run(
    exit_code: i32,
    stdout: &[u8],
    stderr: &[u8],
    output_dir: &Path,
) -> Result<serde_json::Map<String, Value>> {
    if exit_code != 0 {
        let stderr = String::from_utf8_lossy(stderr);
        return Err(ShipsecErr::Container {
            exit_code,
            stderr_tail: stderr_tail(&stderr),
            stdout: String::from_utf8_lossy(stdout).to_string(),
            transient: is_transient_failure(exit_code, &stderr),
        });
    }
    read_result_file(&output_dir.join(RESULT_FILE))
}

/// Runtime-level failures (image pull, daemon hiccups) are worth a retry;
/// component exits are not.
fn is_transient_failure(exit_code: i32, stderr: &str) -> bool {
    if exit_code == 125 {
        let lowered = stderr.to_ascii_lowercase();
        return ["pull", "no such host", "connection refused", "timeout", "i/o timeout"]
            .iter()
            .any(|needle| lowered.contains(needle));
    }
    false
}

/// Empty or absent result file means an empty record; malformed JSON or a
/// non-object document is a validation failure, never retried.
fn read_result_file(path: &Path) -> Result<serde_json::Map<String, Value>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(serde_json::Map::new()),
        Err(err) => return Err(err.into()),
    };
    if raw.trim().is_empty() {
        return Ok(serde_json::Map::new());
    }
    let value: Value = serde_json::from_str(&raw)
        .map_err(|err| ShipsecErr::Validation(format!("malformed result JSON: {err}")))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ShipsecErr::Validation(format!(
            "result JSON must be an object, got {}",
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

async fn kill_container(container_name: &str) {
    let status = Command::new(*SHIPSEC_CONTAINER_RUNTIME)
        .args(["kill", container_name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match timeout(*SHIPSEC_KILL_GRACE_MS, status).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!("failed to kill container {container_name}: {err}"),
        Err(_) => warn!("timed out killing container {container_name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use shipsec_protocol::NetworkMode;
    use shipsec_protocol::VolumeMount;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            image: "shipsec/subfinder:latest".to_string(),
            entrypoint: None,
            command: vec!["-d".to_string(), "example.com".to_string()],
            env: HashMap::new(),
            network: NetworkMode::Bridge,
            platform: None,
            volumes: Vec::new(),
            timeout_seconds: 300,
            stdin_json: true,
            pty: false,
        }
    }

    #[test]
    fn stdio_args_include_output_mount_and_network() {
        let dir = TempDir::new().unwrap();
        let args = build_runtime_args(&spec(), "shipsec-node-abc", dir.path(), IoMode::Stdio, true);

        assert_eq!(args[0], "run");
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(!args.contains(&"-t".to_string()));
        assert!(
            args.iter()
                .any(|a| a.ends_with(&format!(":{OUTPUT_MOUNT}")))
        );
        assert!(
            args.contains(&format!("{OUTPUT_ENV_VAR}={OUTPUT_MOUNT}/{RESULT_FILE}"))
        );
        let network_pos = args.iter().position(|a| a == "--network").unwrap();
        assert_eq!(args[network_pos + 1], "bridge");
        // Image comes before the command tail.
        let image_pos = args
            .iter()
            .position(|a| a == "shipsec/subfinder:latest")
            .unwrap();
        assert_eq!(&args[image_pos + 1..], ["-d", "example.com"]);
    }

    #[test]
    fn pty_args_use_tty_and_never_stdin() {
        let dir = TempDir::new().unwrap();
        let args = build_runtime_args(&spec(), "shipsec-node-abc", dir.path(), IoMode::Pty, false);
        assert!(args.contains(&"-t".to_string()));
        assert!(!args.contains(&"-i".to_string()));
    }

    #[test]
    fn extra_volumes_platform_and_entrypoint_are_passed_through() {
        let dir = TempDir::new().unwrap();
        let mut spec = spec();
        spec.platform = Some("linux/amd64".to_string());
        spec.entrypoint = Some("/bin/scan".to_string());
        spec.env = HashMap::from([("API_URL".to_string(), "https://api.internal".to_string())]);
        spec.volumes = vec![VolumeMount {
            source: "/data/inputs".to_string(),
            target: "/inputs".to_string(),
            read_only: true,
        }];

        let args = build_runtime_args(&spec, "shipsec-node-abc", dir.path(), IoMode::Stdio, false);
        assert!(args.contains(&"/data/inputs:/inputs:ro".to_string()));
        assert!(args.contains(&"API_URL=https://api.internal".to_string()));
        let platform_pos = args.iter().position(|a| a == "--platform").unwrap();
        assert_eq!(args[platform_pos + 1], "linux/amd64");
        let entry_pos = args.iter().position(|a| a == "--entrypoint").unwrap();
        assert_eq!(args[entry_pos + 1], "/bin/scan");
        // stdin_json = false drops `-i` entirely.
        assert!(!args.contains(&"-i".to_string()));
    }

    #[test]
    fn long_and_multiline_args_are_redacted() {
        let args = vec![
            "run".to_string(),
            "x".repeat(200),
            "line1\nline2".to_string(),
        ];
        let redacted = redact_args(&args);
        assert_eq!(redacted[0], "run");
        assert_eq!(redacted[1], "<arg-1:200 chars>");
        assert_eq!(redacted[2], "<arg-2:11 chars>");
    }

    #[test]
    fn result_file_semantics() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RESULT_FILE);

        // Missing file -> empty record.
        assert!(read_result_file(&path).unwrap().is_empty());

        // Empty file -> empty record.
        std::fs::write(&path, "").unwrap();
        assert!(read_result_file(&path).unwrap().is_empty());
        std::fs::write(&path, "   \n").unwrap();
        assert!(read_result_file(&path).unwrap().is_empty());

        // Valid object.
        std::fs::write(&path, r#"{"subdomains": ["a.io"], "count": 1}"#).unwrap();
        let map = read_result_file(&path).unwrap();
        assert_eq!(map["count"], 1);

        // Malformed JSON -> validation error.
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            read_result_file(&path),
            Err(ShipsecErr::Validation(_))
        ));

        // Non-object -> validation error.
        std::fs::write(&path, "[1,2,3]").unwrap();
        assert!(matches!(
            read_result_file(&path),
            Err(ShipsecErr::Validation(_))
        ));
    }

    #[test]
    fn non_zero_exit_preserves_stdout_for_salvage() {
        let dir = TempDir::new().unwrap();
        let err = finish_run(
            1,
            b"api.example.com\nwww.example.com",
            b"rate limited by upstream",
            dir.path(),
        )
        .unwrap_err();
        match err {
            ShipsecErr::Container {
                exit_code,
                stdout,
                stderr_tail,
                transient,
            } => {
                assert_eq!(exit_code, 1);
                assert_eq!(stdout, "api.example.com\nwww.example.com");
                assert_eq!(stderr_tail, "rate limited by upstream");
                assert!(!transient);
            }
            other => panic!("expected container error, got {other:?}"),
        }
    }

    #[test]
    fn pull_failures_are_transient() {
        assert!(is_transient_failure(
            125,
            "docker: Error response from daemon: pull access denied: i/o timeout"
        ));
        assert!(!is_transient_failure(1, "scanner crashed"));
        assert!(!is_transient_failure(125, "invalid mount config"));
    }

    #[test]
    fn capture_caps_bytes_but_collects_lines() {
        let mut capture = StreamCapture::new();
        let mut lines = Vec::new();
        capture.push(b"one\ntwo\nthr", |line| lines.push(line.to_string()));
        capture.push(b"ee\n", |line| lines.push(line.to_string()));
        let buf = capture.finish(|line| lines.push(line.to_string()));
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(buf, b"one\ntwo\nthree\n");
    }
}
