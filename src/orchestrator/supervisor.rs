//! Supervisor loop: both children run, or neither does.
//!
//! Polls both children on a fixed cadence. The first observed exit, or an
//! operator interrupt, moves to a shutdown where every survivor is asked to
//! stop once. After the grace period (or a further interrupt) the final sweep
//! force-kills whatever is left.

use super::ticker::TickHandle;
use crate::launcher::{ManagedProcess, SupervisedChild};
use crate::model::{
    LaunchConfig, Liveness, Role, ShutdownCause, SupervisorReport, SupervisorState,
};
use std::time::Duration;
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// How long the final sweep waits for killed children to be reaped.
const KILL_CONFIRM: Duration = Duration::from_secs(2);
const KILL_POLL: Duration = Duration::from_millis(20);
/// Floor for the child poll cadence; a zero period would stall the timer.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Supervisor<C = Child, W = ChildStdin> {
    frontend: ManagedProcess<C, W>,
    engine: ManagedProcess<C, W>,
    poll_interval: Duration,
    shutdown_grace: Duration,
    ticker: Option<TickHandle>,
    state: SupervisorState,
    transitions: Vec<SupervisorState>,
}

impl<C: SupervisedChild, W> Supervisor<C, W> {
    pub fn new(
        frontend: ManagedProcess<C, W>,
        engine: ManagedProcess<C, W>,
        cfg: &LaunchConfig,
        ticker: Option<TickHandle>,
    ) -> Self {
        Self {
            frontend,
            engine,
            poll_interval: cfg.poll_interval.max(MIN_POLL_INTERVAL),
            shutdown_grace: cfg.shutdown_grace,
            ticker,
            state: SupervisorState::Running,
            transitions: vec![SupervisorState::Running],
        }
    }

    fn process_mut(&mut self, role: Role) -> &mut ManagedProcess<C, W> {
        match role {
            Role::Frontend => &mut self.frontend,
            Role::Engine => &mut self.engine,
        }
    }

    fn transition(&mut self, next: SupervisorState) {
        if self.state == next {
            return;
        }
        info!(from = ?self.state, to = ?next, "supervisor state change");
        self.state = next;
        self.transitions.push(next);
    }

    /// Poll one child, logging the exit the first time it is seen.
    fn observe(&mut self, role: Role) -> bool {
        let p = self.process_mut(role);
        let before = p.liveness();
        let now = p.poll_exit();
        if let (false, Liveness::Exited(status)) = (before.is_exited(), now) {
            info!(%role, %status, cmd = %p.invocation, "child exited");
        }
        now.is_exited()
    }

    fn both_exited(&mut self) -> bool {
        let f = self.observe(Role::Frontend);
        let e = self.observe(Role::Engine);
        f && e
    }

    fn first_exit(&mut self) -> Option<Role> {
        [Role::Frontend, Role::Engine]
            .into_iter()
            .find(|role| self.observe(*role))
    }

    /// Run until both children are gone. `interrupts` yields once per
    /// operator interrupt; a closed channel just means no more interrupts.
    pub async fn run(mut self, mut interrupts: UnboundedReceiver<()>) -> SupervisorReport {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut listening = true;

        let cause = loop {
            tokio::select! {
                msg = interrupts.recv(), if listening => match msg {
                    Some(()) => break ShutdownCause::Interrupted,
                    None => listening = false,
                },
                _ = poll.tick() => {
                    if let Some(role) = self.first_exit() {
                        break ShutdownCause::ChildExited(role);
                    }
                }
            }
        };

        match cause {
            ShutdownCause::ChildExited(role) => {
                self.transition(SupervisorState::OneExited(role));
                info!("{role} exited, stopping {}", role.other());
            }
            ShutdownCause::Interrupted => info!("interrupt received, stopping both children"),
        }
        self.transition(SupervisorState::ShuttingDown);
        if let Some(t) = &self.ticker {
            t.cancel();
        }
        for role in [Role::Frontend, Role::Engine] {
            if !self.observe(role) {
                self.process_mut(role).request_stop();
            }
        }

        let grace = tokio::time::sleep_until(Instant::now() + self.shutdown_grace);
        tokio::pin!(grace);
        loop {
            if self.both_exited() {
                break;
            }
            tokio::select! {
                _ = &mut grace => {
                    warn!(grace = ?self.shutdown_grace, "children still running after grace period");
                    break;
                }
                msg = interrupts.recv(), if listening => match msg {
                    Some(()) => {
                        warn!("interrupted during shutdown, killing children now");
                        break;
                    }
                    None => listening = false,
                },
                _ = poll.tick() => {}
            }
        }

        let forced_kills = self.final_sweep().await;
        let ticker = match self.ticker.take() {
            Some(t) => t.finish(self.poll_interval).await,
            None => None,
        };
        if let Some(r) = &ticker {
            info!(ticks = r.ticks, stop = ?r.stop, "auto-tick finished");
        }

        SupervisorReport {
            cause,
            frontend: self.frontend.liveness(),
            engine: self.engine.liveness(),
            forced_kills,
            ticker,
            transitions: self.transitions,
        }
    }

    /// Kill anything still alive and wait briefly for it to be reaped.
    async fn final_sweep(&mut self) -> Vec<Role> {
        let mut killed = Vec::new();
        for role in [Role::Frontend, Role::Engine] {
            if !self.observe(role) {
                self.process_mut(role).force_kill();
                killed.push(role);
            }
        }

        let deadline = Instant::now() + KILL_CONFIRM;
        loop {
            if self.both_exited() {
                self.transition(SupervisorState::Terminated);
                break;
            }
            if Instant::now() >= deadline {
                error!("children still alive after kill");
                break;
            }
            tokio::time::sleep(KILL_POLL).await;
        }
        self.frontend.close_input();
        self.engine.close_input();
        killed
    }
}
