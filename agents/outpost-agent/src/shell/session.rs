//! Shell Session Engine
//!
//! Owns one long-lived interpreter process. Commands are written to its
//! stdin one at a time and framed on the way back by a per-command token
//! printed after the command finishes, so the interpreter's working
//! directory, exported variables and shell options survive across calls.
//!
//! Output is scanned as raw bytes over the running buffer. Nothing here
//! reads by lines, so a command that prints no trailing newline (or binary
//! junk) cannot stall the scan.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::borrow::Cow;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use outpost_protocol::payloads::{CommandRequest, CommandResult, ShellStatus};

use super::denylist::Denylist;
use super::error::ShellError;
use crate::cli::config::ShellConfig;

/// Exit code reported when a command was aborted by its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// How long spawning plus the readiness probe may take.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 8192;

/// Anything that turns a command request into a result.
///
/// The session client depends on this rather than on [`ShellSession`] so
/// dispatch can be exercised without a real interpreter.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, request: CommandRequest) -> Result<CommandResult, ShellError>;

    /// Cheap view of the session for status reports; never waits on a
    /// running command.
    fn status(&self) -> ShellStatus;

    /// Terminate the interpreter, if any.
    async fn shutdown(&self);
}

/// Lifecycle of the interpreter.
enum SessionState {
    Uninitialized,
    Ready(Interpreter),
    /// Timed out, desynced or exited; the next command respawns.
    Closed,
}

#[derive(Debug, Clone)]
struct Snapshot {
    state: &'static str,
    cwd: Option<String>,
    commands_run: u64,
}

/// A persistent interpreter plus the lock serializing commands into it.
pub struct ShellSession {
    config: ShellConfig,
    denylist: Denylist,
    // tokio's Mutex queues waiters in FIFO order.
    state: Mutex<SessionState>,
    snapshot: SyncMutex<Snapshot>,
    counter: AtomicU64,
}

impl ShellSession {
    pub fn new(config: ShellConfig) -> Self {
        let denylist = Denylist::new(&config.blocked_patterns);
        Self {
            config,
            denylist,
            state: Mutex::new(SessionState::Uninitialized),
            snapshot: SyncMutex::new(Snapshot {
                state: "uninitialized",
                cwd: None,
                commands_run: 0,
            }),
            counter: AtomicU64::new(0),
        }
    }

    /// Last working directory the interpreter reported. Display only.
    pub fn cached_cwd(&self) -> Option<String> {
        self.snapshot.lock().cwd.clone()
    }

    /// Run one command in the persistent interpreter.
    pub async fn execute(&self, request: CommandRequest) -> Result<CommandResult, ShellError> {
        let command_line = build_command_line(&request)?;

        if let Some(pattern) = self.denylist.check(&command_line) {
            warn!(command = %request.command, pattern = %pattern, "Rejected blocked command");
            return Err(ShellError::Blocked {
                pattern: pattern.to_string(),
            });
        }

        let script = build_script(&request, &command_line)?;
        let timeout = match request.timeout {
            0 => Duration::from_secs(self.config.default_timeout_secs.max(1)),
            secs => Duration::from_secs(secs),
        };

        let mut state = self.state.lock().await;
        if !matches!(*state, SessionState::Ready(_)) {
            let interpreter = self.start_interpreter().await?;
            *state = SessionState::Ready(interpreter);
            self.set_state("ready");
        }
        let SessionState::Ready(interpreter) = &mut *state else {
            return Err(ShellError::Desync("interpreter not ready after start".into()));
        };

        let token = self.next_token();
        let started = Instant::now();
        debug!(command = %command_line, token = %token, ?timeout, "Executing command");

        let outcome = interpreter.run(&script, &token, started + timeout).await;
        let duration = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(RunOutcome::Completed {
                output,
                exit_code,
                cwd,
            }) => {
                self.record_command(cwd.clone());
                CommandResult {
                    stdout: String::from_utf8_lossy(&output).into_owned(),
                    stderr: String::new(),
                    exit_code,
                    duration,
                    timed_out: false,
                    working_dir: cwd,
                }
            }
            Ok(RunOutcome::TimedOut { output }) => {
                warn!(command = %request.command, ?timeout, "Command timed out, restarting shell");
                interpreter.kill().await;
                *state = SessionState::Closed;
                self.record_command(None);
                self.set_state("closed");
                CommandResult {
                    stdout: String::from_utf8_lossy(&output).into_owned(),
                    stderr: String::new(),
                    exit_code: TIMEOUT_EXIT_CODE,
                    duration,
                    timed_out: true,
                    working_dir: None,
                }
            }
            Ok(RunOutcome::Exited { output, exit_code }) => {
                info!(exit_code, "Shell exited");
                *state = SessionState::Closed;
                self.record_command(None);
                self.set_state("closed");
                CommandResult {
                    stdout: String::from_utf8_lossy(&output).into_owned(),
                    stderr: String::new(),
                    exit_code,
                    duration,
                    timed_out: false,
                    working_dir: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Shell session lost");
                interpreter.kill().await;
                *state = SessionState::Closed;
                self.set_state("closed");
                return Err(e);
            }
        };

        Ok(result)
    }

    /// Kill the interpreter; the next command starts a fresh one.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let SessionState::Ready(interpreter) = &mut *state {
            interpreter.kill().await;
        }
        *state = SessionState::Closed;
        self.set_state("closed");
    }

    async fn start_interpreter(&self) -> Result<Interpreter, ShellError> {
        let mut interpreter = Interpreter::spawn(self.config.program.as_ref()).await?;

        let deadline = Instant::now() + STARTUP_TIMEOUT;
        let probe = self.next_token();
        match interpreter.run("true", &probe, deadline).await {
            Ok(RunOutcome::Completed { exit_code: 0, cwd, .. }) => {
                self.snapshot.lock().cwd = cwd;
            }
            other => {
                interpreter.kill().await;
                return Err(ShellError::Spawn(format!(
                    "shell did not answer readiness probe: {}",
                    describe(&other)
                )));
            }
        }

        if let Some(dir) = &self.config.initial_dir {
            let script = format!("cd -- {}", quote(dir)?);
            let token = self.next_token();
            match interpreter.run(&script, &token, deadline).await {
                Ok(RunOutcome::Completed { exit_code: 0, cwd, .. }) => {
                    self.snapshot.lock().cwd = cwd;
                }
                other => {
                    interpreter.kill().await;
                    return Err(ShellError::Spawn(format!(
                        "cannot enter initial directory {dir}: {}",
                        describe(&other)
                    )));
                }
            }
        }

        info!(
            program = %interpreter.program,
            cwd = ?self.cached_cwd(),
            "Shell session ready"
        );
        Ok(interpreter)
    }

    fn next_token(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("__OUTPOST_{}_{}__", Uuid::new_v4().simple(), n)
    }

    fn record_command(&self, cwd: Option<String>) {
        let mut snapshot = self.snapshot.lock();
        snapshot.commands_run += 1;
        if cwd.is_some() {
            snapshot.cwd = cwd;
        }
    }

    fn set_state(&self, state: &'static str) {
        self.snapshot.lock().state = state;
    }
}

#[async_trait]
impl CommandExecutor for ShellSession {
    async fn execute(&self, request: CommandRequest) -> Result<CommandResult, ShellError> {
        ShellSession::execute(self, request).await
    }

    fn status(&self) -> ShellStatus {
        let snapshot = self.snapshot.lock().clone();
        ShellStatus {
            state: snapshot.state.to_string(),
            cwd: snapshot.cwd,
            commands_run: snapshot.commands_run,
        }
    }

    async fn shutdown(&self) {
        self.close().await;
    }
}

/// What came back for one framed command.
enum RunOutcome {
    Completed {
        output: Vec<u8>,
        exit_code: i32,
        cwd: Option<String>,
    },
    TimedOut {
        output: Vec<u8>,
    },
    /// The interpreter closed its output, usually because the command ran `exit`.
    Exited {
        output: Vec<u8>,
        exit_code: i32,
    },
}

fn describe(outcome: &Result<RunOutcome, ShellError>) -> String {
    match outcome {
        Ok(RunOutcome::Completed { exit_code, output, .. }) => format!(
            "exit {exit_code}: {}",
            String::from_utf8_lossy(output).trim()
        ),
        Ok(RunOutcome::TimedOut { .. }) => "timed out".to_string(),
        Ok(RunOutcome::Exited { exit_code, .. }) => format!("shell exited with {exit_code}"),
        Err(e) => e.to_string(),
    }
}

struct Interpreter {
    program: String,
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    buf: Vec<u8>,
}

impl Interpreter {
    async fn spawn(program: Option<&PathBuf>) -> Result<Self, ShellError> {
        let (mut child, program) = match program {
            Some(path) => {
                let program = path.to_string_lossy().into_owned();
                (spawn_program(&program)?, program)
            }
            None => match spawn_program("bash") {
                Ok(child) => (child, "bash".to_string()),
                Err(ShellError::Spawn(reason)) => {
                    debug!(reason = %reason, "bash unavailable, falling back to /bin/sh");
                    (spawn_program("/bin/sh")?, "/bin/sh".to_string())
                }
                Err(e) => return Err(e),
            },
        };

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ShellError::Spawn("interpreter stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ShellError::Spawn("interpreter stdout not captured".into()))?;

        let mut interpreter = Self {
            program,
            child,
            stdin,
            stdout,
            buf: Vec::with_capacity(READ_CHUNK),
        };

        // From here on the command's stderr shares the stdout pipe.
        interpreter
            .write(b"exec 2>&1\n")
            .await
            .map_err(|e| ShellError::Spawn(format!("interpreter rejected input: {e}")))?;

        Ok(interpreter)
    }

    async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stdin.write_all(bytes).await?;
        self.stdin.flush().await
    }

    /// Write `body` framed by `token`, then scan output until the token's
    /// line arrives, the deadline passes, or the interpreter goes away.
    async fn run(
        &mut self,
        body: &str,
        token: &str,
        deadline: Instant,
    ) -> Result<RunOutcome, ShellError> {
        self.buf.clear();

        // `eval` keeps `cd`/`export` in this shell and turns a syntax error
        // in the body into a status of 2 instead of ending the interpreter;
        // `command` stops a POSIX sh from exiting on it. stdin is detached
        // so the command cannot eat the framing lines below it.
        let body = quote(body)?;
        let framed = format!(
            "{{ command eval {body}\n}} </dev/null\n__outpost_rc=$?; printf '\\n{token}:%s:%s\\n' \"$__outpost_rc\" \"$PWD\"\n"
        );
        self.write(framed.as_bytes()).await.map_err(ShellError::Io)?;

        let needle = token.as_bytes();
        let mut scanned = 0usize;
        let mut marker = None;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if marker.is_none() {
                marker = find(&self.buf, needle, scanned.saturating_sub(needle.len()));
            }
            if let Some(at) = marker {
                let after = at + needle.len();
                if let Some(nl) = self.buf[after..].iter().position(|&b| b == b'\n') {
                    let status_line = String::from_utf8_lossy(&self.buf[after..after + nl]);
                    let (exit_code, cwd) = parse_status(&status_line);

                    let mut output = self.buf[..at].to_vec();
                    // Drop the newline printed ahead of the token.
                    if output.last() == Some(&b'\n') {
                        output.pop();
                    }
                    let leftover = self.buf.len() - (after + nl + 1);
                    if leftover > 0 {
                        debug!(bytes = leftover, "Discarding output after marker");
                    }
                    self.buf.clear();
                    return Ok(RunOutcome::Completed {
                        output,
                        exit_code,
                        cwd,
                    });
                }
            }
            scanned = self.buf.len();

            match tokio::time::timeout_at(deadline, self.stdout.read(&mut chunk)).await {
                Err(_) => {
                    return Ok(RunOutcome::TimedOut {
                        output: std::mem::take(&mut self.buf),
                    })
                }
                Ok(Ok(0)) => {
                    let exit_code = match tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await {
                        Ok(Ok(status)) => status.code().unwrap_or(TIMEOUT_EXIT_CODE),
                        _ => TIMEOUT_EXIT_CODE,
                    };
                    return Ok(RunOutcome::Exited {
                        output: std::mem::take(&mut self.buf),
                        exit_code,
                    });
                }
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(ShellError::Io(e)),
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "Interpreter already gone");
            return;
        }
        if tokio::time::timeout(Duration::from_secs(2), self.child.wait())
            .await
            .is_err()
        {
            warn!("Interpreter did not exit after kill");
        }
    }
}

fn spawn_program(program: &str) -> Result<Child, ShellError> {
    let mut command = Command::new(program);
    if program.ends_with("bash") {
        command.args(["--noprofile", "--norc"]);
    }
    command
        .env("TERM", "dumb")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    command
        .spawn()
        .map_err(|e| ShellError::Spawn(format!("{program}: {e}")))
}

/// Parse `:<rc>:<pwd>` following the token.
fn parse_status(line: &str) -> (i32, Option<String>) {
    let rest = line.strip_prefix(':').unwrap_or(line);
    let (rc, pwd) = rest.split_once(':').unwrap_or((rest, ""));
    let exit_code = rc.trim().parse().unwrap_or(TIMEOUT_EXIT_CODE);
    let cwd = (!pwd.is_empty()).then(|| pwd.to_string());
    (exit_code, cwd)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn quote(value: &str) -> Result<Cow<'_, str>, ShellError> {
    shlex::try_quote(value)
        .map_err(|e| ShellError::InvalidRequest(format!("cannot quote {value:?}: {e}")))
}

/// The command plus its shell-quoted arguments.
fn build_command_line(request: &CommandRequest) -> Result<String, ShellError> {
    if request.command.trim().is_empty() {
        return Err(ShellError::InvalidRequest("empty command".into()));
    }
    if request.command.contains('\0') {
        return Err(ShellError::InvalidRequest("command contains a NUL byte".into()));
    }
    let mut line = request.command.clone();
    for arg in &request.args {
        line.push(' ');
        line.push_str(&quote(arg)?);
    }
    Ok(line)
}

/// Exports and the optional directory change wrapped around the command line.
fn build_script(request: &CommandRequest, command_line: &str) -> Result<String, ShellError> {
    let mut script = String::new();
    for (key, value) in &request.env {
        if !is_identifier(key) {
            return Err(ShellError::InvalidRequest(format!(
                "invalid environment variable name: {key:?}"
            )));
        }
        script.push_str(&format!("export {key}={}\n", quote(value)?));
    }

    if request.working_dir.is_empty() {
        script.push_str(command_line);
    } else {
        script.push_str(&format!(
            "cd -- {} && {{\n{command_line}\n}}",
            quote(&request.working_dir)?
        ));
    }
    Ok(script)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
