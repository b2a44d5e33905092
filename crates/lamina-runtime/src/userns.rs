//! Running commands as root of a user namespace.
//!
//! When the caller is already root, commands run directly. Otherwise every
//! command is wrapped in the userns-exec helper with one `-m` argument per
//! id map entry. Children run in their own process group so that
//! cancellation reaches everything they spawned.

use crate::idmap::{self, IdMapSet};
use crate::internal::{self, InternalOp};
use crate::RuntimeError;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const USERNS_HELPER: &str = "lxc-usernsexec";
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn never() -> bool {
    false
}

/// How a command is supervised.
pub struct RunOptions<'a> {
    /// Replaces the inherited environment when set.
    pub env: Option<&'a BTreeMap<String, String>>,
    pub cwd: Option<&'a Path>,
    pub timeout: Option<Duration>,
    pub deadline: Option<Instant>,
    /// Time between SIGTERM and SIGKILL.
    pub grace: Duration,
    pub should_stop: &'a (dyn Fn() -> bool + Sync),
}

impl Default for RunOptions<'_> {
    fn default() -> Self {
        Self {
            env: None,
            cwd: None,
            timeout: None,
            deadline: None,
            grace: DEFAULT_GRACE,
            should_stop: &never,
        }
    }
}

impl RunOptions<'_> {
    fn limit(&self, started: Instant) -> Option<Instant> {
        let by_timeout = self.timeout.map(|t| started + t);
        match (by_timeout, self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecMode {
    /// Caller is root; no namespace.
    Direct,
    Userns(IdMapSet),
}

#[derive(Debug, Clone)]
enum ProbeFailure {
    Missing,
    Rejected(String),
}

#[derive(Debug)]
pub struct Executor {
    mode: ExecMode,
    helper: String,
    self_exe: Option<PathBuf>,
    map_probe: OnceLock<Result<(), ProbeFailure>>,
}

impl Executor {
    pub fn direct() -> Self {
        Self::with_mode(ExecMode::Direct)
    }

    pub fn userns(map: IdMapSet) -> Self {
        Self::with_mode(ExecMode::Userns(map))
    }

    fn with_mode(mode: ExecMode) -> Self {
        Self {
            mode,
            helper: USERNS_HELPER.to_owned(),
            self_exe: None,
            map_probe: OnceLock::new(),
        }
    }

    /// Pick the mode for the calling process: direct for root, otherwise a
    /// namespace with the caller's subordinate allocation.
    pub fn detect() -> Result<Self, RuntimeError> {
        if nix::unistd::geteuid().is_root() {
            info!("running as root, build steps run without a user namespace");
            return Ok(Self::direct());
        }
        let map = idmap::resolve_current()?;
        debug!("id map: {}", map.helper_args().join(" "));
        Ok(Self::userns(map))
    }

    #[must_use]
    pub fn with_helper(mut self, helper: impl Into<String>) -> Self {
        self.helper = helper.into();
        self
    }

    /// Binary re-executed for internal operations. Defaults to the running
    /// executable.
    #[must_use]
    pub fn with_self_exe(mut self, path: impl Into<PathBuf>) -> Self {
        self.self_exe = Some(path.into());
        self
    }

    pub fn mode(&self) -> &ExecMode {
        &self.mode
    }

    pub fn is_rootless(&self) -> bool {
        matches!(self.mode, ExecMode::Userns(_))
    }

    /// The command line that runs `program` in this executor's mode.
    pub fn command<S: AsRef<OsStr>>(&self, program: impl AsRef<OsStr>, args: &[S]) -> Command {
        match &self.mode {
            ExecMode::Direct => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            ExecMode::Userns(map) => {
                let mut cmd = Command::new(&self.helper);
                cmd.args(map.helper_args()).arg("--").arg(program).args(args);
                cmd
            }
        }
    }

    fn check_map(&self) -> Result<(), RuntimeError> {
        if !self.is_rootless() {
            return Ok(());
        }
        let probe = self.map_probe.get_or_init(|| {
            match self.command("true", &[] as &[&str]).output() {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ProbeFailure::Missing),
                Err(e) => Err(ProbeFailure::Rejected(e.to_string())),
                Ok(out) if out.status.success() => Ok(()),
                Ok(out) => Err(ProbeFailure::Rejected(
                    String::from_utf8_lossy(&out.stderr).trim().to_owned(),
                )),
            }
        });
        match probe {
            Ok(()) => Ok(()),
            Err(ProbeFailure::Missing) => Err(RuntimeError::MissingHelper(self.helper.clone())),
            Err(ProbeFailure::Rejected(msg)) => Err(RuntimeError::MapRejected(msg.clone())),
        }
    }

    /// Run `program` to completion with inherited standard I/O.
    pub fn run<S: AsRef<OsStr>>(
        &self,
        program: &str,
        args: &[S],
        opts: &RunOptions<'_>,
    ) -> Result<(), RuntimeError> {
        self.check_map()?;
        if (opts.should_stop)() {
            return Err(RuntimeError::Cancelled);
        }

        let mut cmd = self.command(program, args);
        if let Some(env) = opts.env {
            cmd.env_clear().envs(env);
        }
        if let Some(cwd) = opts.cwd {
            cmd.current_dir(cwd);
        }
        cmd.process_group(0);

        debug!("spawn: {program}");
        let child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                let missing = if self.is_rootless() {
                    self.helper.clone()
                } else {
                    program.to_owned()
                };
                RuntimeError::MissingHelper(missing)
            } else {
                RuntimeError::Io(e)
            }
        })?;
        supervise(child, program, opts)
    }

    /// Run an operation that must see the namespace's view of file
    /// ownership. Inside a namespace the current executable is re-run with
    /// the hidden `internal` subcommand.
    pub fn run_internal(&self, op: &InternalOp, opts: &RunOptions<'_>) -> Result<(), RuntimeError> {
        match &self.mode {
            ExecMode::Direct => internal::execute(op),
            ExecMode::Userns(_) => {
                let exe = match &self.self_exe {
                    Some(p) => p.clone(),
                    None => std::env::current_exe()?,
                };
                let payload = serde_json::to_string(op)?;
                let args = [OsString::from("internal"), OsString::from(payload)];
                self.run(&exe.to_string_lossy(), &args, opts)
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn supervise(mut child: Child, command: &str, opts: &RunOptions<'_>) -> Result<(), RuntimeError> {
    let started = Instant::now();
    let limit = opts.limit(started);
    loop {
        if let Some(status) = child.try_wait()? {
            debug!("exit: {command} ({status})");
            if status.success() {
                return Ok(());
            }
            return Err(RuntimeError::ChildFailed {
                command: command.to_owned(),
                status: exit_code(status),
            });
        }
        if (opts.should_stop)() {
            warn!("cancelling {command}");
            terminate(&mut child, opts.grace)?;
            return Err(RuntimeError::Cancelled);
        }
        if let Some(limit) = limit {
            if Instant::now() >= limit {
                warn!("{command} timed out");
                terminate(&mut child, opts.grace)?;
                return Err(RuntimeError::Timeout {
                    command: command.to_owned(),
                    secs: limit.saturating_duration_since(started).as_secs(),
                });
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// SIGTERM the child's process group, then SIGKILL after `grace`.
fn terminate(child: &mut Child, grace: Duration) -> io::Result<()> {
    let pgid = i32::try_from(child.id())
        .map(Pid::from_raw)
        .map_err(io::Error::other)?;
    let _ = killpg(pgid, Signal::SIGTERM);
    let until = Instant::now() + grace;
    while Instant::now() < until {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }
    let _ = killpg(pgid, Signal::SIGKILL);
    child.wait()?;
    Ok(())
}
