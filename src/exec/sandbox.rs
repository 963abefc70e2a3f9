//! Subprocess isolation for skill entries.
//!
//! The entry script runs as a child process with a wall-clock timeout, an
//! address-space cap, a stripped environment and capped output capture.
//! Parameters travel as one JSON string in `argv[1]` (or on stdin when the
//! skill declares it).
//!
//! The child always inherits the host's working directory and receives the
//! entry as an absolute path. Overriding CWD while passing an absolute
//! entry breaks interpreter module resolution, so the command surface has
//! no CWD field at all; the per-skill workspace is exposed through
//! `SKILL_WORKSPACE` instead.

use crate::errors::{ErrorCode, ExecutionError};
use crate::skills::metadata::{FilesystemPolicy, NetworkPolicy};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SandboxCommand {
    pub skill_name: String,
    /// Absolute path to the entry script.
    pub entry: PathBuf,
    pub parameters: Value,
    /// Host environment variable names forwarded to the child.
    pub env_whitelist: Vec<String>,
    pub timeout: Duration,
    pub memory_mb: u64,
    pub network: NetworkPolicy,
    pub network_allowlist: Vec<String>,
    pub filesystem: FilesystemPolicy,
    /// Pass parameters on stdin instead of `argv[1]`.
    pub use_stdin: bool,
    /// Scratch directory exposed via `SKILL_WORKSPACE`; never the CWD.
    pub workspace: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecState {
    Pending,
    Spawning,
    Running,
    Exited,
    TimedOut,
    Oom,
    Killed,
    Reported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Exited,
    TimedOut,
    Oom,
    Killed,
}

#[derive(Debug)]
pub struct SandboxOutcome {
    pub status: SandboxStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
    pub transitions: Vec<(ExecState, DateTime<Utc>)>,
    pub warnings: Vec<String>,
}

pub struct SandboxExecutor {
    cfg: crate::config::SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(cfg: crate::config::SandboxConfig) -> Self {
        Self { cfg }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.timeout_ms)
    }

    pub fn default_memory_mb(&self) -> u64 {
        self.cfg.memory_mb
    }

    /// Run one entry to completion. Blocking; the execution manager calls
    /// this on a worker.
    pub fn run(&self, cmd: &SandboxCommand) -> Result<SandboxOutcome, ExecutionError> {
        let mut transitions = vec![(ExecState::Pending, Utc::now())];
        let mut warnings = Vec::new();

        if !cmd.entry.is_absolute() {
            // Relative entries would resolve against the host CWD, which is
            // exactly the interaction this runtime forbids.
            return Err(ExecutionError::new(
                ErrorCode::SandboxFailed,
                format!("entry path {:?} is not absolute", cmd.entry),
            ));
        }
        if !cmd.entry.is_file() {
            return Err(ExecutionError::new(
                ErrorCode::SandboxFailed,
                format!("entry {:?} does not exist", cmd.entry),
            ));
        }

        let payload = serde_json::to_string(&cmd.parameters).map_err(|e| {
            ExecutionError::new(
                ErrorCode::InvalidParameters,
                format!("parameters are not serializable: {}", e),
            )
        })?;

        let mut command = self.build_command(cmd, &payload, &mut warnings);
        transitions.push((ExecState::Spawning, Utc::now()));
        let start = Instant::now();
        let mut child = command.spawn().map_err(|e| {
            ExecutionError::new(
                ErrorCode::SandboxFailed,
                format!("failed to spawn {:?}: {}", cmd.entry, e),
            )
        })?;
        transitions.push((ExecState::Running, Utc::now()));

        let stdout_handle = capture_stream(child.stdout.take(), self.cfg.capture_cap_bytes);
        let stderr_handle = capture_stream(child.stderr.take(), self.cfg.capture_cap_bytes);

        if cmd.use_stdin {
            // Readers are already draining, so a large payload cannot
            // deadlock against a full output pipe.
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(payload.as_bytes()) {
                    warn!("writing parameters to stdin of '{}': {}", cmd.skill_name, e);
                }
            }
        }

        let timed_out = self.wait_with_timeout(&mut child, cmd.timeout);

        let exit_status = match child.wait() {
            Ok(status) => status,
            Err(e) => {
                return Err(ExecutionError::new(
                    ErrorCode::SandboxFailed,
                    format!("waiting for '{}': {}", cmd.skill_name, e),
                ))
            }
        };
        let duration = start.elapsed();

        let (stdout, stdout_truncated) = stdout_handle
            .join()
            .unwrap_or_else(|_| (String::new(), false));
        let (stderr, stderr_truncated) = stderr_handle
            .join()
            .unwrap_or_else(|_| (String::new(), false));

        let exit_code = exit_status.code();
        let status = if timed_out {
            SandboxStatus::TimedOut
        } else {
            classify_abnormal_exit(&exit_status, &stderr, cmd.memory_mb)
        };
        let terminal_state = match status {
            SandboxStatus::Exited => ExecState::Exited,
            SandboxStatus::TimedOut => ExecState::TimedOut,
            SandboxStatus::Oom => ExecState::Oom,
            SandboxStatus::Killed => ExecState::Killed,
        };
        transitions.push((terminal_state, Utc::now()));
        transitions.push((ExecState::Reported, Utc::now()));

        info!(
            "skill '{}' finished: {:?} (exit {:?}) in {}ms",
            cmd.skill_name,
            status,
            exit_code,
            duration.as_millis()
        );

        Ok(SandboxOutcome {
            status,
            exit_code,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            duration,
            transitions,
            warnings,
        })
    }

    fn build_command(
        &self,
        cmd: &SandboxCommand,
        payload: &str,
        warnings: &mut Vec<String>,
    ) -> Command {
        let mut command = match interpreter_for(&cmd.entry) {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(&cmd.entry);
                c
            }
            None => Command::new(&cmd.entry),
        };
        if !cmd.use_stdin {
            command.arg(payload);
        }

        // Note: no current_dir() — the child keeps the host CWD.
        command
            .stdin(if cmd.use_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Environment: conservative base + explicit whitelist, nothing else.
        command.env_clear();
        for base in ["PATH", "LANG", "LC_ALL", "TZ"] {
            if let Ok(value) = std::env::var(base) {
                command.env(base, value);
            }
        }
        command.env("TMPDIR", std::env::temp_dir());
        for name in &cmd.env_whitelist {
            if let Ok(value) = std::env::var(name) {
                command.env(name, value);
            }
        }
        if let Some(workspace) = &cmd.workspace {
            command.env("SKILL_WORKSPACE", workspace);
        }

        match cmd.network {
            NetworkPolicy::None => {
                command.env("SKILL_NETWORK", "none");
            }
            NetworkPolicy::Allowlist => {
                if cmd.network_allowlist.is_empty() {
                    warnings.push("network allowlist is empty; treating as none".to_string());
                    command.env("SKILL_NETWORK", "none");
                } else {
                    command.env("SKILL_NETWORK", "allowlist");
                    command.env("SKILL_NETWORK_ALLOWLIST", cmd.network_allowlist.join(","));
                }
            }
        }
        // Filesystem narrowing has no portable enforcement; the policy is
        // passed down and the gap is surfaced.
        command.env(
            "SKILL_FILESYSTEM",
            match cmd.filesystem {
                FilesystemPolicy::None => "none",
                FilesystemPolicy::ReadOnly => "read-only",
                FilesystemPolicy::ReadWrite => "read-write",
            },
        );
        if cmd.filesystem < FilesystemPolicy::ReadWrite {
            warnings.push(format!(
                "filesystem policy {:?} not enforceable on this host; skill is trusted",
                cmd.filesystem
            ));
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            let bytes = cmd.memory_mb.saturating_mul(1024 * 1024) as libc::rlim_t;
            if bytes > 0 {
                unsafe {
                    command.pre_exec(move || {
                        let limit = libc::rlimit {
                            rlim_cur: bytes,
                            rlim_max: bytes,
                        };
                        if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
            }
        }

        command
    }

    /// Poll until exit or timeout. On timeout: SIGTERM, a grace period,
    /// then SIGKILL. Returns whether the timeout fired.
    fn wait_with_timeout(&self, child: &mut Child, timeout: Duration) -> bool {
        let grace = Duration::from_millis(self.cfg.kill_grace_ms);
        let start = Instant::now();
        let mut term_sent_at: Option<Instant> = None;

        loop {
            match child.try_wait() {
                Ok(Some(_)) => return term_sent_at.is_some(),
                Ok(None) => {}
                Err(_) => return term_sent_at.is_some(),
            }
            match term_sent_at {
                None if start.elapsed() >= timeout => {
                    send_sigterm(child);
                    term_sent_at = Some(Instant::now());
                }
                Some(sent) if sent.elapsed() >= grace => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return true;
                }
                _ => {}
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &Child) {
    let _ = child;
}

fn interpreter_for(entry: &std::path::Path) -> Option<&'static str> {
    match entry.extension().and_then(|e| e.to_str()) {
        Some("py") => Some("python3"),
        Some("js") | Some("mjs") => Some("node"),
        Some("sh") => Some("sh"),
        Some("bash") => Some("bash"),
        Some("rb") => Some("ruby"),
        Some("pl") => Some("perl"),
        _ => None,
    }
}

fn classify_abnormal_exit(
    status: &std::process::ExitStatus,
    stderr: &str,
    memory_mb: u64,
) -> SandboxStatus {
    if status.code().is_some() {
        // A clean exit code, zero or not; stderr may still reveal an
        // allocator death under the rlimit.
        if memory_mb > 0
            && status.code() != Some(0)
            && (stderr.contains("MemoryError") || stderr.contains("out of memory"))
        {
            return SandboxStatus::Oom;
        }
        return SandboxStatus::Exited;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        match status.signal() {
            Some(libc::SIGKILL) | Some(libc::SIGSEGV) if memory_mb > 0 => SandboxStatus::Oom,
            Some(_) => SandboxStatus::Killed,
            None => SandboxStatus::Exited,
        }
    }
    #[cfg(not(unix))]
    SandboxStatus::Killed
}

/// Drain a child stream on its own thread, keeping the first `cap` bytes.
/// Draining continues past the cap so the child never blocks on a full pipe.
fn capture_stream<R: Read + Send + 'static>(
    stream: Option<R>,
    cap: usize,
) -> std::thread::JoinHandle<(String, bool)> {
    std::thread::spawn(move || {
        let Some(mut stream) = stream else {
            return (String::new(), false);
        };
        let mut buf: Vec<u8> = Vec::with_capacity(8192.min(cap));
        let mut truncated = false;
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if buf.len() < cap {
                        let take = n.min(cap - buf.len());
                        buf.extend_from_slice(&chunk[..take]);
                        if take < n {
                            truncated = true;
                        }
                    } else {
                        truncated = true;
                    }
                }
                Err(_) => break,
            }
        }
        let mut text = String::from_utf8_lossy(&buf).to_string();
        if truncated {
            text.push_str("\n[output truncated]");
        }
        (text, truncated)
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("execute.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        path
    }

    fn command(entry: PathBuf) -> SandboxCommand {
        SandboxCommand {
            skill_name: "test".to_string(),
            entry,
            parameters: serde_json::json!({"sides": 6}),
            env_whitelist: Vec::new(),
            timeout: Duration::from_secs(5),
            memory_mb: 0,
            network: NetworkPolicy::None,
            network_allowlist: Vec::new(),
            filesystem: FilesystemPolicy::ReadWrite,
            use_stdin: false,
            workspace: None,
        }
    }

    fn executor() -> SandboxExecutor {
        SandboxExecutor::new(crate::config::SandboxConfig::default())
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let tmp = TempDir::new().unwrap();
        let entry = write_script(&tmp, "echo '{\"value\": 4}'");
        let outcome = executor().run(&command(entry)).unwrap();
        assert_eq!(outcome.status, SandboxStatus::Exited);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.trim(), "{\"value\": 4}");
    }

    #[test]
    fn parameters_arrive_as_argv_one() {
        let tmp = TempDir::new().unwrap();
        let entry = write_script(&tmp, "printf '%s' \"$1\"");
        let outcome = executor().run(&command(entry)).unwrap();
        let echoed: serde_json::Value = serde_json::from_str(&outcome.stdout).unwrap();
        assert_eq!(echoed, serde_json::json!({"sides": 6}));
    }

    #[test]
    fn parameters_arrive_on_stdin_when_declared() {
        let tmp = TempDir::new().unwrap();
        let entry = write_script(&tmp, "cat");
        let mut cmd = command(entry);
        cmd.use_stdin = true;
        let outcome = executor().run(&cmd).unwrap();
        let echoed: serde_json::Value = serde_json::from_str(&outcome.stdout).unwrap();
        assert_eq!(echoed, serde_json::json!({"sides": 6}));
    }

    #[test]
    fn timeout_terminates_the_child() {
        let tmp = TempDir::new().unwrap();
        let entry = write_script(&tmp, "sleep 30");
        let mut cmd = command(entry);
        cmd.timeout = Duration::from_millis(100);
        let executor = SandboxExecutor::new(crate::config::SandboxConfig {
            kill_grace_ms: 100,
            ..Default::default()
        });
        let start = Instant::now();
        let outcome = executor.run(&cmd).unwrap();
        assert_eq!(outcome.status, SandboxStatus::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn child_keeps_host_cwd_even_with_workspace() {
        let tmp = TempDir::new().unwrap();
        let ws = TempDir::new().unwrap();
        let entry = write_script(&tmp, "pwd; printf '%s' \"$SKILL_WORKSPACE\"");
        let mut cmd = command(entry);
        cmd.workspace = Some(ws.path().to_path_buf());
        let outcome = executor().run(&cmd).unwrap();
        let host_cwd = std::env::current_dir().unwrap();
        let mut lines = outcome.stdout.lines();
        assert_eq!(
            fs::canonicalize(lines.next().unwrap()).unwrap(),
            fs::canonicalize(&host_cwd).unwrap()
        );
        assert_eq!(lines.next().unwrap(), ws.path().to_string_lossy());
    }

    #[test]
    fn environment_is_whitelisted() {
        std::env::set_var("SKILLBRIDGE_ALLOWED", "yes");
        std::env::set_var("SKILLBRIDGE_BLOCKED", "no");
        let tmp = TempDir::new().unwrap();
        let entry = write_script(
            &tmp,
            "printf '%s|%s|%s' \"$SKILLBRIDGE_ALLOWED\" \"$SKILLBRIDGE_BLOCKED\" \"$SKILL_NETWORK\"",
        );
        let mut cmd = command(entry);
        cmd.env_whitelist = vec!["SKILLBRIDGE_ALLOWED".to_string()];
        let outcome = executor().run(&cmd).unwrap();
        assert_eq!(outcome.stdout, "yes||none");
    }

    #[test]
    fn oversized_output_is_truncated_with_marker() {
        let tmp = TempDir::new().unwrap();
        let entry = write_script(&tmp, "yes x | head -c 4096");
        let executor = SandboxExecutor::new(crate::config::SandboxConfig {
            capture_cap_bytes: 256,
            ..Default::default()
        });
        let outcome = executor.run(&command(entry)).unwrap();
        assert!(outcome.stdout_truncated);
        assert!(outcome.stdout.ends_with("[output truncated]"));
        assert!(outcome.stdout.len() < 4096);
    }

    #[test]
    fn relative_entry_fails_fast() {
        let err = executor()
            .run(&command(PathBuf::from("scripts/execute.sh")))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SandboxFailed);
    }

    #[test]
    fn missing_entry_fails_fast() {
        let err = executor()
            .run(&command(PathBuf::from("/nonexistent/execute.sh")))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SandboxFailed);
    }

    #[test]
    fn nonzero_exit_is_reported_with_stderr() {
        let tmp = TempDir::new().unwrap();
        let entry = write_script(&tmp, "echo 'bad input' >&2; exit 3");
        let outcome = executor().run(&command(entry)).unwrap();
        assert_eq!(outcome.status, SandboxStatus::Exited);
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.stderr.contains("bad input"));
    }

    #[test]
    fn state_transitions_are_ordered() {
        let tmp = TempDir::new().unwrap();
        let entry = write_script(&tmp, "true");
        let outcome = executor().run(&command(entry)).unwrap();
        let states: Vec<ExecState> = outcome.transitions.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            states,
            vec![
                ExecState::Pending,
                ExecState::Spawning,
                ExecState::Running,
                ExecState::Exited,
                ExecState::Reported
            ]
        );
    }
}
