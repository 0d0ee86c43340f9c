//! Launch sequencing: migrate, then frontend, then engine.
//!
//! Each step fails fast. A failed migration starts nothing; a failed engine
//! spawn takes the already running frontend down with it.

pub mod platform;
pub mod protocol;

use crate::model::{Exited, Invocation, LaunchConfig, LaunchPlan, Liveness, Role};
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("could not run migration `{invocation}`: {source}")]
    MigrationSpawn {
        invocation: String,
        #[source]
        source: io::Error,
    },

    #[error("migration failed with {0}")]
    MigrationFailed(Exited),

    #[error("could not start {role} `{invocation}`: {source}")]
    Spawn {
        role: Role,
        invocation: String,
        #[source]
        source: io::Error,
    },

    #[error("engine handshake failed: {0}")]
    Handshake(#[source] io::Error),
}

impl LaunchError {
    /// Process exit code this error maps to. A failed migration hands back
    /// its own code.
    pub fn exit_code(&self) -> u8 {
        match self {
            LaunchError::MigrationFailed(Exited { code: Some(c) }) => {
                u8::try_from(*c).ok().filter(|c| *c != 0).unwrap_or(1)
            }
            _ => 1,
        }
    }
}

/// The operations the supervisor needs from a child process.
pub trait SupervisedChild: Send {
    fn pid(&self) -> Option<u32>;
    /// Non-blocking exit check.
    fn try_exit(&mut self) -> io::Result<Option<Exited>>;
    fn request_stop(&mut self) -> io::Result<()>;
    fn force_kill(&mut self) -> io::Result<()>;
}

impl SupervisedChild for Child {
    fn pid(&self) -> Option<u32> {
        self.id()
    }

    fn try_exit(&mut self) -> io::Result<Option<Exited>> {
        Ok(self.try_wait()?.map(|s| Exited { code: s.code() }))
    }

    fn request_stop(&mut self) -> io::Result<()> {
        platform::request_graceful_stop(self)
    }

    fn force_kill(&mut self) -> io::Result<()> {
        self.start_kill()
    }
}

/// Writable side of the engine's control channel.
pub type EngineInput<W = ChildStdin> = Arc<Mutex<W>>;

/// One supervised child and its published liveness.
pub struct ManagedProcess<C = Child, W = ChildStdin> {
    pub role: Role,
    pub invocation: Invocation,
    child: C,
    input: Option<EngineInput<W>>,
    liveness: watch::Sender<Liveness>,
}

impl<C: SupervisedChild, W> ManagedProcess<C, W> {
    pub fn new(role: Role, invocation: Invocation, child: C, input: Option<W>) -> Self {
        let (liveness, _) = watch::channel(Liveness::Starting);
        Self {
            role,
            invocation,
            child,
            input: input.map(|w| Arc::new(Mutex::new(w))),
            liveness,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.pid()
    }

    pub fn liveness(&self) -> Liveness {
        *self.liveness.borrow()
    }

    pub fn watch_liveness(&self) -> watch::Receiver<Liveness> {
        self.liveness.subscribe()
    }

    /// A non-owning handle on the input channel. It stops upgrading once the
    /// process is closed out.
    pub fn input(&self) -> Option<Weak<Mutex<W>>> {
        self.input.as_ref().map(Arc::downgrade)
    }

    pub fn mark_running(&self) {
        self.liveness.send_if_modified(|l| {
            if *l == Liveness::Starting {
                *l = Liveness::Running;
                true
            } else {
                false
            }
        });
    }

    /// Check for exit and publish it. Once exited, the state never changes
    /// again and the input channel is released.
    pub fn poll_exit(&mut self) -> Liveness {
        if let Liveness::Exited(e) = self.liveness() {
            return Liveness::Exited(e);
        }
        match self.child.try_exit() {
            Ok(Some(exited)) => {
                self.liveness.send_replace(Liveness::Exited(exited));
                self.input = None;
                Liveness::Exited(exited)
            }
            Ok(None) => self.liveness(),
            Err(e) => {
                warn!(role = %self.role, error = %e, "failed to poll child status");
                self.liveness()
            }
        }
    }

    /// Deliver a graceful stop request. Returns whether it was delivered.
    pub fn request_stop(&mut self) -> bool {
        match self.child.request_stop() {
            Ok(()) => {
                info!(role = %self.role, pid = ?self.pid(), "sent stop request");
                true
            }
            Err(e) => {
                warn!(role = %self.role, pid = ?self.pid(), error = %e, "stop request failed");
                false
            }
        }
    }

    pub fn force_kill(&mut self) {
        match self.child.force_kill() {
            Ok(()) => warn!(role = %self.role, pid = ?self.pid(), "force-killed"),
            Err(e) => warn!(role = %self.role, pid = ?self.pid(), error = %e, "force kill failed"),
        }
    }

    /// Drop the owning handle on the input channel (closes the engine's stdin
    /// once no write is in flight).
    pub fn close_input(&mut self) {
        self.input = None;
    }
}

impl<W> ManagedProcess<Child, W> {
    /// Kill and reap. Used when a launch is aborted half way.
    async fn kill_and_reap(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(role = %self.role, error = %e, "failed to kill child");
        }
        self.input = None;
    }

    /// Wait for the child to exit on its own.
    #[cfg(test)]
    pub(crate) async fn wait(&mut self) -> io::Result<Exited> {
        let status = self.child.wait().await?;
        Ok(Exited {
            code: status.code(),
        })
    }
}

/// Both long-running children, as handed to the supervisor.
pub struct Children {
    pub frontend: ManagedProcess,
    pub engine: ManagedProcess,
}

pub struct Launcher<'a> {
    cfg: &'a LaunchConfig,
    plan: &'a LaunchPlan,
}

fn command(inv: &Invocation) -> Command {
    let mut cmd = Command::new(&inv.program);
    cmd.args(&inv.args).current_dir(&inv.cwd);
    cmd
}

fn long_running(inv: &Invocation) -> Command {
    let mut cmd = command(inv);
    cmd.kill_on_drop(true);
    platform::prepare(&mut cmd);
    cmd
}

impl<'a> Launcher<'a> {
    pub fn new(cfg: &'a LaunchConfig, plan: &'a LaunchPlan) -> Self {
        Self { cfg, plan }
    }

    /// Run the migration to completion. Anything but a zero exit is fatal.
    pub async fn run_migration(&self) -> Result<(), LaunchError> {
        let inv = &self.plan.migrate;
        info!(cmd = %inv, cwd = %inv.cwd.display(), "[1/3] running database migration");
        let status = command(inv)
            .status()
            .await
            .map_err(|source| LaunchError::MigrationSpawn {
                invocation: inv.to_string(),
                source,
            })?;
        if !status.success() {
            return Err(LaunchError::MigrationFailed(Exited {
                code: status.code(),
            }));
        }
        debug!("migration finished");
        Ok(())
    }

    /// Start the frontend and return at once. There is no readiness check.
    pub fn start_frontend(&self) -> Result<ManagedProcess, LaunchError> {
        let inv = &self.plan.frontend;
        match self.cfg.port {
            Some(port) => info!(port, "[2/3] starting frontend"),
            None => info!("[2/3] starting frontend on its default port"),
        }
        let child = long_running(inv)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                role: Role::Frontend,
                invocation: inv.to_string(),
                source,
            })?;
        let proc = ManagedProcess::new(Role::Frontend, inv.clone(), child, None);
        proc.mark_running();
        info!(pid = ?proc.pid(), "frontend started");
        Ok(proc)
    }

    /// Start the engine with a piped stdin and send the handshake (plus the
    /// autorun request) before returning. A failed handshake is logged and
    /// tolerated unless `strict_handshake` is set.
    pub async fn start_engine(&self) -> Result<ManagedProcess, LaunchError> {
        let inv = &self.plan.engine;
        info!(
            origin = %self.cfg.origin,
            target = %self.cfg.target,
            "[3/3] starting engine"
        );
        let mut child = long_running(inv)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                role: Role::Engine,
                invocation: inv.to_string(),
                source,
            })?;
        let mut stdin = child.stdin.take();
        let handshake = match stdin.as_mut() {
            Some(w) => {
                protocol::send_handshake(w, &self.cfg.origin, &self.cfg.target, self.cfg.autorun_steps)
                    .await
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "engine stdin not captured")),
        };
        let mut proc = ManagedProcess::new(Role::Engine, inv.clone(), child, stdin);
        match handshake {
            Ok(()) => {
                if self.cfg.autorun_steps > 0 {
                    info!(steps = self.cfg.autorun_steps, "requested autorun");
                }
            }
            Err(e) if self.cfg.strict_handshake => {
                proc.kill_and_reap().await;
                return Err(LaunchError::Handshake(e));
            }
            Err(e) => warn!(error = %e, "engine handshake failed; continuing"),
        }
        proc.mark_running();
        info!(pid = ?proc.pid(), "engine started");
        Ok(proc)
    }

    /// Run all three steps in order.
    pub async fn launch(&self) -> Result<Children, LaunchError> {
        self.run_migration().await?;
        let mut frontend = self.start_frontend()?;
        match self.start_engine().await {
            Ok(engine) => Ok(Children { frontend, engine }),
            Err(e) => {
                frontend.kill_and_reap().await;
                Err(e)
            }
        }
    }
}
