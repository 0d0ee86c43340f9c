use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Fully resolved operator configuration. Built once by `cli::build_config`
/// and only read afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchConfig {
    /// Frontend bind port. `None` lets the frontend pick its own default.
    pub port: Option<u16>,
    /// Snapshot the engine resumes from.
    pub origin: String,
    /// Snapshot the engine writes to.
    pub target: String,
    /// Steps requested once, right after the handshake. 0 disables.
    pub autorun_steps: u32,
    /// Steps requested per periodic tick. 0 disables ticking.
    pub tick_steps: u32,
    /// Time between periodic ticks. Zero disables ticking.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub tick_warmup: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    pub strict_handshake: bool,
}

/// Program, arguments and working directory of one external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        Ok(())
    }
}

/// The three commands the launcher runs, in order.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchPlan {
    pub migrate: Invocation,
    pub frontend: Invocation,
    pub engine: Invocation,
}

/// Which of the two supervised children a process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Frontend,
    Engine,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Frontend => "frontend",
            Role::Engine => "engine",
        }
    }

    pub fn other(self) -> Role {
        match self {
            Role::Frontend => Role::Engine,
            Role::Engine => Role::Frontend,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a child ended. `code` is `None` when it was terminated by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exited {
    pub code: Option<i32>,
}

impl fmt::Display for Exited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(c) => write!(f, "code {c}"),
            None => f.write_str("signal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Starting,
    Running,
    Exited(Exited),
}

impl Liveness {
    pub fn is_exited(self) -> bool {
        matches!(self, Liveness::Exited(_))
    }
}

/// Supervisor Loop states. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    OneExited(Role),
    ShuttingDown,
    Terminated,
}

/// What made the supervisor start shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    ChildExited(Role),
    Interrupted,
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::ChildExited(role) => write!(f, "{role} exited"),
            ShutdownCause::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Why the Tick Driver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStop {
    EngineExited,
    WriteFailed,
    InputDropped,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub ticks: u64,
    pub stop: TickStop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorReport {
    pub cause: ShutdownCause,
    pub frontend: Liveness,
    pub engine: Liveness,
    /// Children still alive at the final sweep.
    pub forced_kills: Vec<Role>,
    pub ticker: Option<TickReport>,
    /// Every state the supervisor passed through, in order.
    pub transitions: Vec<SupervisorState>,
}
