//! Periodic `run <N>` requests to the engine.
//!
//! The driver only holds a weak handle on the engine's stdin and a view of
//! its liveness. It stops for good on the first of: engine exit, a failed
//! write, the input being released, or cancellation.

use crate::launcher::protocol::{self, ControlLine};
use crate::model::{LaunchConfig, Liveness, TickReport, TickStop};
use std::sync::Weak;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Floor for the tick interval so a tiny value can't spin.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickConfig {
    pub steps: u32,
    pub interval: Duration,
    pub warmup: Duration,
}

impl TickConfig {
    /// `None` when ticking is switched off (no steps or no interval).
    pub fn from_launch(cfg: &LaunchConfig) -> Option<Self> {
        if cfg.tick_steps == 0 || cfg.tick_interval.is_zero() {
            return None;
        }
        Some(Self {
            steps: cfg.tick_steps,
            interval: cfg.tick_interval.max(MIN_TICK_INTERVAL),
            warmup: cfg.tick_warmup,
        })
    }
}

/// Owner side of a running driver.
pub struct TickHandle {
    cancel: CancellationToken,
    join: JoinHandle<TickReport>,
}

impl TickHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait up to `wait` for the driver to notice. A driver stuck
    /// in a write is left behind.
    pub async fn finish(self, wait: Duration) -> Option<TickReport> {
        self.cancel.cancel();
        match tokio::time::timeout(wait, self.join).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                warn!(error = %e, "tick driver task failed");
                None
            }
            Err(_) => {
                debug!("tick driver did not stop in time");
                None
            }
        }
    }
}

/// Start the driver on its own task.
pub fn spawn<W>(
    cfg: TickConfig,
    input: Weak<Mutex<W>>,
    liveness: watch::Receiver<Liveness>,
) -> TickHandle
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    info!(
        steps = cfg.steps,
        interval = ?cfg.interval,
        "auto-tick enabled"
    );
    let cancel = CancellationToken::new();
    let join = tokio::spawn(run(cfg, input, liveness, cancel.clone()));
    TickHandle { cancel, join }
}

/// Sleep for `d`; true if cancelled first.
async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(d) => false,
    }
}

pub async fn run<W>(
    cfg: TickConfig,
    input: Weak<Mutex<W>>,
    liveness: watch::Receiver<Liveness>,
    cancel: CancellationToken,
) -> TickReport
where
    W: AsyncWrite + Unpin + Send,
{
    let mut ticks = 0u64;
    let done = |ticks, stop| {
        debug!(ticks, ?stop, "tick driver stopped");
        TickReport { ticks, stop }
    };

    if sleep_or_cancel(cfg.warmup, &cancel).await {
        return done(ticks, TickStop::Cancelled);
    }
    let line = ControlLine::Run(cfg.steps);
    loop {
        if cancel.is_cancelled() {
            return done(ticks, TickStop::Cancelled);
        }
        if liveness.borrow().is_exited() {
            return done(ticks, TickStop::EngineExited);
        }
        let Some(input) = input.upgrade() else {
            return done(ticks, TickStop::InputDropped);
        };
        let res = {
            let mut w = input.lock().await;
            protocol::send_line(&mut *w, &line).await
        };
        drop(input);
        if let Err(e) = res {
            warn!(error = %e, ticks, "tick write failed; auto-tick stopped");
            return done(ticks, TickStop::WriteFailed);
        }
        ticks += 1;
        debug!(ticks, steps = cfg.steps, "tick sent");

        if sleep_or_cancel(cfg.interval, &cancel).await {
            return done(ticks, TickStop::Cancelled);
        }
    }
}
