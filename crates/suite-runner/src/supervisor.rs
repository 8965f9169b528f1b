//! Process supervision: run a command to completion under a deadline, or
//! start one in the background, and tear down whole process trees.
//!
//! Every child is placed in its own process group. Killing a tree signals the
//! group and, on Linux, every descendant found through `/proc`, which also
//! catches children that moved to a group of their own. When a run ends,
//! any process still holding the child's output pipes is killed as well, and
//! waiting for the pipes to close never outlasts the deadline.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("failed to wait for child: {0}")]
    Wait(#[source] std::io::Error),
}

/// Cooperative cancellation flag shared between the orchestrator, the
/// supervisor and whoever wants to stop a run (e.g. a signal handler).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A fully rendered external command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Working directory; inherited when unset.
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Shell-quoted command line, for logs only.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().to_string()];
        parts.extend(self.args.iter().cloned());
        shell_join(&parts)
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.process_group(0);
        cmd
    }
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, or `signal` when the process was killed by one.
    pub fn status_label(&self) -> String {
        self.status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string())
    }

    pub fn stderr_tail(&self) -> String {
        last_non_empty_line(&self.stderr)
            .or_else(|| last_non_empty_line(&self.stdout))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    poll_interval: Duration,
    cancel: CancelToken,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(CancelToken::new())
    }
}

impl Supervisor {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Runs `spec` to completion, capturing stdout and stderr. On deadline or
    /// cancellation the whole process tree is killed and an error returned,
    /// which keeps a timeout distinguishable from a non-zero exit.
    pub fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<ProcessOutput, ProcessError> {
        let mut cmd = spec.to_command();
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        debug!(pid, command = %spec.display(), "spawned");

        let mut tree = Tree::new(pid, &[pipe_link(&child.stdout), pipe_link(&child.stderr)]);

        // Drain both pipes concurrently so a chatty child never blocks on a
        // full pipe buffer.
        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if self.cancel.is_cancelled() {
                        tree.kill();
                        let _ = child.wait();
                        return Err(ProcessError::Cancelled);
                    }
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        tree.kill();
                        let _ = child.wait();
                        debug!(pid, "killed after timeout");
                        return Err(ProcessError::Timeout(timeout));
                    }
                    tree.observe();
                    thread::sleep(self.poll_interval.min(timeout - elapsed));
                }
                Err(e) => {
                    tree.kill();
                    let _ = child.wait();
                    return Err(ProcessError::Wait(e));
                }
            }
        };

        // Stragglers, including ones that left the group, would keep the
        // pipes open.
        tree.kill_stragglers();

        let (Some(stdout), Some(stderr)) = (
            collect(&stdout_reader, timeout.saturating_sub(start.elapsed())),
            collect(&stderr_reader, timeout.saturating_sub(start.elapsed())),
        ) else {
            tree.kill_stragglers();
            debug!(pid, "output still open after timeout");
            return Err(ProcessError::Timeout(timeout));
        };
        Ok(ProcessOutput {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            elapsed: start.elapsed(),
        })
    }

    /// Starts `spec` without waiting for it. Its output is discarded.
    pub fn spawn_background(&self, spec: &CommandSpec) -> Result<BackgroundProcess, ProcessError> {
        let mut cmd = spec.to_command();
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;
        debug!(pid = child.id(), command = %spec.display(), "spawned background process");
        Ok(BackgroundProcess {
            pid: child.id(),
            child: Some(child),
        })
    }
}

/// Handle to a process started with [`Supervisor::spawn_background`]. The
/// tree is killed by [`BackgroundProcess::kill_tree`] or, failing that, when
/// the handle is dropped.
#[derive(Debug)]
pub struct BackgroundProcess {
    pid: u32,
    child: Option<Child>,
}

impl BackgroundProcess {
    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Kills the process and all of its descendants. A process that already
    /// exited counts as success; nothing is reported back.
    pub fn kill_tree(mut self) {
        self.terminate();
    }

    fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            kill_tree(self.pid);
            match child.wait() {
                Ok(status) => debug!(pid = self.pid, %status, "background process reaped"),
                Err(e) => debug!(pid = self.pid, error = %e, "failed to reap background process"),
            }
        }
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// SIGKILLs `pid`, its process group and every descendant. Errors such as
/// `ESRCH` are ignored.
pub fn kill_tree(pid: u32) {
    let victims = descendants(pid);
    signal_group(pid);
    send_sigkill(pid);
    for victim in victims {
        send_sigkill(victim);
    }
}

/// Whether `pid` names a live, non-zombie process.
pub fn process_alive(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !matches!(parse_stat(&stat), Some((_, 'Z')) | Some((_, 'X'))),
        Err(_) => {
            // No procfs: fall back to a null signal.
            let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
            ret == 0
        }
    }
}

/// Everything a supervised child may leave behind: its descendants as last
/// seen while it ran, plus any process still holding its output pipes.
struct Tree {
    root: u32,
    pipes: Vec<PathBuf>,
    /// pid → start time, so a recycled pid is never signalled.
    seen: BTreeMap<u32, u64>,
    last_scan: Option<Instant>,
}

impl Tree {
    const SCAN_INTERVAL: Duration = Duration::from_millis(250);

    fn new(root: u32, pipes: &[Option<PathBuf>]) -> Self {
        Self {
            root,
            pipes: pipes.iter().flatten().cloned().collect(),
            seen: BTreeMap::new(),
            last_scan: None,
        }
    }

    /// Records current descendants. A child that daemonizes is reparented
    /// once its parent exits, so it has to be seen before that.
    fn observe(&mut self) {
        if self
            .last_scan
            .is_some_and(|at| at.elapsed() < Self::SCAN_INTERVAL)
        {
            return;
        }
        for pid in descendants(self.root) {
            if let Some(started) = start_time(pid) {
                self.seen.entry(pid).or_insert(started);
            }
        }
        self.last_scan = Some(Instant::now());
    }

    fn kill(&mut self) {
        kill_tree(self.root);
        self.kill_stragglers();
    }

    /// Kills what is left after the root was reaped. The root pid itself is
    /// not signalled since it may already belong to someone else.
    fn kill_stragglers(&mut self) {
        signal_group(self.root);
        for (pid, started) in std::mem::take(&mut self.seen) {
            if start_time(pid) == Some(started) {
                send_sigkill(pid);
            }
        }
        for pid in pipe_holders(&self.pipes) {
            kill_tree(pid);
        }
    }
}

fn signal_group(pgid: u32) {
    let _ = unsafe { libc::kill(-(pgid as libc::pid_t), libc::SIGKILL) };
}

fn send_sigkill(pid: u32) {
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if ret == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(pid, error = %err, "kill failed");
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

/// Output of a reader, or `None` if the pipe is still open at the deadline.
fn collect(reader: &Receiver<Vec<u8>>, remaining: Duration) -> Option<Vec<u8>> {
    match reader.recv_timeout(remaining) {
        Ok(buf) => Some(buf),
        Err(RecvTimeoutError::Disconnected) => Some(Vec::new()),
        Err(RecvTimeoutError::Timeout) => None,
    }
}

/// `/proc` link of our end of a pipe, e.g. `pipe:[81234]`.
fn pipe_link<P: AsRawFd>(pipe: &Option<P>) -> Option<PathBuf> {
    let fd = pipe.as_ref()?.as_raw_fd();
    fs::read_link(format!("/proc/self/fd/{}", fd)).ok()
}

/// Other processes with an open descriptor on any of `pipes`.
fn pipe_holders(pipes: &[PathBuf]) -> Vec<u32> {
    if pipes.is_empty() {
        return Vec::new();
    }
    let me = std::process::id();
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == me {
            continue;
        }
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let holds = fds
            .flatten()
            .filter_map(|fd| fs::read_link(fd.path()).ok())
            .any(|link| pipes.contains(&link));
        if holds {
            out.push(pid);
        }
    }
    out
}

/// Transitive children of `root`, parents before children.
fn descendants(root: u32) -> Vec<u32> {
    let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some((ppid, _)) = parse_stat(&stat) {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut out = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if !out.contains(&kid) {
                    out.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    out
}

/// Extracts `(ppid, state)` from a `/proc/<pid>/stat` line. The command name
/// may contain spaces and parentheses, so fields are read after the last `)`.
fn parse_stat(stat: &str) -> Option<(u32, char)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((ppid, state))
}

/// Start time of `pid` in clock ticks since boot (field 22 of `stat`).
fn start_time(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

fn last_non_empty_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Resolves a bare program name against `PATH`.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
