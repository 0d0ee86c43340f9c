use crate::launcher::{LaunchError, Launcher};
use crate::layout::{ConfigError, ProjectLayout};
use crate::model::{LaunchConfig, LaunchPlan};
use crate::orchestrator::{spawn_ticker, Supervisor, TickConfig};
use crate::snapshot;
use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::info;

#[cfg(unix)]
const DEFAULT_PYTHON: &str = "python3";
#[cfg(not(unix))]
const DEFAULT_PYTHON: &str = "python";

#[derive(Debug, Parser, Clone)]
#[command(
    name = "sim-supervisor",
    version,
    about = "Run the web frontend and the simulation engine together and stop them together"
)]
pub struct Cli {
    /// Frontend bind port (0 lets the frontend choose)
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Snapshot to resume from (default: newest valid snapshot in storage)
    #[arg(long, default_value = "")]
    pub origin: String,

    /// Name of the snapshot to write (default: auto_run_<timestamp>)
    #[arg(long, default_value = "")]
    pub target: String,

    /// Steps to request once right after the engine starts (0 disables)
    #[arg(long, default_value_t = 0)]
    pub autorun: u32,

    /// Steps requested per periodic tick (0 disables ticking)
    #[arg(long, default_value_t = 1)]
    pub tick: u32,

    /// Seconds between periodic ticks (<= 0 disables ticking)
    #[arg(long, default_value_t = 0.5, allow_negative_numbers = true)]
    pub interval: f64,

    /// Project root holding the frontend and engine trees
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Frontend directory (default: <root>/environment/frontend_server)
    #[arg(long)]
    pub frontend_dir: Option<PathBuf>,

    /// Engine directory (default: <root>/generative_agents-main/reverie/backend_server)
    #[arg(long)]
    pub engine_dir: Option<PathBuf>,

    /// Engine entry script, relative to the engine directory
    #[arg(long, default_value = "reverie.py")]
    pub engine_script: PathBuf,

    /// Snapshot storage directory (default: <frontend-dir>/storage)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Interpreter used for the migration, the frontend and the engine
    #[arg(long, default_value = DEFAULT_PYTHON)]
    pub python: PathBuf,

    /// How often both children are checked
    #[arg(long, default_value = "500ms", value_parser = nonzero_duration)]
    pub poll_interval: humantime::Duration,

    /// How long to wait for a graceful stop before killing
    #[arg(long, default_value = "5s")]
    pub shutdown_grace: humantime::Duration,

    /// Delay before the first periodic tick
    #[arg(long, default_value = "500ms")]
    pub warmup: humantime::Duration,

    /// Abort the launch if the engine handshake can't be written
    #[arg(long)]
    pub strict_handshake: bool,

    /// Resolve the configuration, print it as JSON and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn layout(&self) -> ProjectLayout {
        ProjectLayout::new(
            &self.root,
            self.python.clone(),
            self.frontend_dir.clone(),
            self.engine_dir.clone(),
            &self.engine_script,
            self.storage_dir.clone(),
        )
    }
}

/// Exit code for a failed run: the migration's own code when that is what
/// failed, 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<LaunchError>()
        .map(LaunchError::exit_code)
        .unwrap_or(1)
}

/// Seconds from the command line; non-positive or NaN disables.
fn nonzero_duration(s: &str) -> Result<humantime::Duration, String> {
    let d: humantime::Duration = s.parse().map_err(|e| format!("{e}"))?;
    if Duration::from(d).is_zero() {
        return Err("must be greater than zero".to_string());
    }
    Ok(d)
}

fn interval_from_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// `auto_run_YYYYmmdd_HHMMSS`.
pub fn default_target(now: OffsetDateTime) -> String {
    let fmt = time::macros::format_description!("[year][month][day]_[hour][minute][second]");
    let stamp = now
        .format(fmt)
        .unwrap_or_else(|_| now.unix_timestamp().to_string());
    format!("auto_run_{stamp}")
}

fn resolve_origin(args: &Cli, layout: &ProjectLayout) -> Result<String, ConfigError> {
    let origin = args.origin.trim();
    if !origin.is_empty() {
        return Ok(origin.to_string());
    }
    snapshot::resolve_latest(&layout.storage_dir)
        .map_err(|source| ConfigError::StorageUnreadable {
            path: layout.storage_dir.clone(),
            source,
        })?
        .ok_or_else(|| ConfigError::NoSnapshot(layout.storage_dir.clone()))
}

/// Build a `LaunchConfig` from CLI arguments, resolving the origin snapshot
/// and the target name.
pub fn build_config(
    args: &Cli,
    layout: &ProjectLayout,
    now: OffsetDateTime,
) -> Result<LaunchConfig, ConfigError> {
    let origin = resolve_origin(args, layout)?;
    let target = match args.target.trim() {
        "" => default_target(now),
        t => t.to_string(),
    };
    Ok(LaunchConfig {
        port: (args.port != 0).then_some(args.port),
        origin,
        target,
        autorun_steps: args.autorun,
        tick_steps: args.tick,
        tick_interval: interval_from_secs(args.interval),
        tick_warmup: Duration::from(args.warmup),
        poll_interval: Duration::from(args.poll_interval),
        shutdown_grace: Duration::from(args.shutdown_grace),
        strict_handshake: args.strict_handshake,
    })
}

#[derive(Serialize)]
struct DryRun<'a> {
    config: &'a LaunchConfig,
    plan: &'a LaunchPlan,
}

/// Turn SIGINT/SIGTERM (Ctrl+C elsewhere) into messages for the supervisor.
fn forward_interrupts() -> Result<mpsc::UnboundedReceiver<()>> {
    let (tx, rx) = mpsc::unbounded_channel();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to listen for SIGINT")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
        tokio::spawn(async move {
            loop {
                let got = tokio::select! {
                    s = sigint.recv() => s,
                    s = sigterm.recv() => s,
                };
                if got.is_none() || tx.send(()).is_err() {
                    break;
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(()).is_err() {
                    break;
                }
            }
        });
    }

    Ok(rx)
}

pub async fn run(args: Cli, now: OffsetDateTime) -> Result<()> {
    let layout = args.layout();
    layout.validate()?;
    let cfg = build_config(&args, &layout, now)?;
    let plan = layout.plan(&cfg);

    if args.dry_run {
        let out = serde_json::to_string_pretty(&DryRun {
            config: &cfg,
            plan: &plan,
        })?;
        println!("{out}");
        return Ok(());
    }

    let children = Launcher::new(&cfg, &plan)
        .launch()
        .await
        .context("launch aborted")?;

    let ticker = match (TickConfig::from_launch(&cfg), children.engine.input()) {
        (Some(tick), Some(input)) => Some(spawn_ticker(
            tick,
            input,
            children.engine.watch_liveness(),
        )),
        _ => None,
    };

    let interrupts = forward_interrupts()?;
    info!("started; press Ctrl+C to stop both processes");

    let report = Supervisor::new(children.frontend, children.engine, &cfg, ticker)
        .run(interrupts)
        .await;

    info!(
        cause = %report.cause,
        frontend = ?report.frontend,
        engine = ?report.engine,
        forced_kills = ?report.forced_kills,
        "all processes stopped"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ENGINE_SUBDIR, ENVIRONMENT_SUBDIR, META_FILE};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;
    use time::macros::datetime;

    fn parse(extra: &[&str]) -> Cli {
        let mut argv = vec!["sim-supervisor"];
        argv.extend_from_slice(extra);
        Cli::try_parse_from(argv).unwrap()
    }

    fn storage_with(names: &[&str]) -> (TempDir, ProjectLayout) {
        let tmp = TempDir::new().unwrap();
        let layout = parse(&["--root", tmp.path().to_str().unwrap()]).layout();
        for name in names {
            let dir = layout.storage_dir.join(name);
            fs::create_dir_all(dir.join(ENGINE_SUBDIR)).unwrap();
            fs::create_dir_all(dir.join(ENVIRONMENT_SUBDIR)).unwrap();
            fs::write(dir.join(ENGINE_SUBDIR).join(META_FILE), "{}").unwrap();
        }
        fs::create_dir_all(&layout.storage_dir).unwrap();
        (tmp, layout)
    }

    const NOW: OffsetDateTime = datetime!(2024-03-05 07:08:09 UTC);

    #[test]
    fn defaults_match_the_documented_surface() {
        let args = parse(&[]);
        assert_eq!(args.port, 8000);
        assert_eq!(args.autorun, 0);
        assert_eq!(args.tick, 1);
        assert_eq!(args.interval, 0.5);
        assert_eq!(args.root, Path::new("."));
    }

    #[test]
    fn target_timestamp_format() {
        assert_eq!(default_target(NOW), "auto_run_20240305_070809");
    }

    #[test]
    fn explicit_values_are_trimmed_and_kept() {
        let (_tmp, layout) = storage_with(&[]);
        let args = parse(&["--origin", "  base  ", "--target", " out "]);
        let cfg = build_config(&args, &layout, NOW).unwrap();
        assert_eq!(cfg.origin, "base");
        assert_eq!(cfg.target, "out");
    }

    #[test]
    fn empty_origin_resolves_from_storage() {
        let (_tmp, layout) = storage_with(&["only_one"]);
        let cfg = build_config(&parse(&[]), &layout, NOW).unwrap();
        assert_eq!(cfg.origin, "only_one");
        assert_eq!(cfg.target, "auto_run_20240305_070809");
    }

    #[test]
    fn no_snapshot_is_a_config_error() {
        let (_tmp, layout) = storage_with(&[]);
        let err = build_config(&parse(&[]), &layout, NOW).unwrap_err();
        assert!(matches!(err, ConfigError::NoSnapshot(_)));
    }

    #[test]
    fn tick_settings() {
        let (_tmp, layout) = storage_with(&["s"]);

        let cfg = build_config(&parse(&["--tick", "3", "--interval", "0.1"]), &layout, NOW).unwrap();
        assert_eq!(cfg.tick_steps, 3);
        assert_eq!(cfg.tick_interval, Duration::from_millis(100));
        assert!(TickConfig::from_launch(&cfg).is_some());

        let cfg = build_config(&parse(&["--interval", "-1"]), &layout, NOW).unwrap();
        assert_eq!(cfg.tick_interval, Duration::ZERO);
        assert!(TickConfig::from_launch(&cfg).is_none());

        let cfg = build_config(&parse(&["--autorun", "5", "--tick", "0"]), &layout, NOW).unwrap();
        assert_eq!(cfg.autorun_steps, 5);
        assert!(TickConfig::from_launch(&cfg).is_none());
    }

    #[test]
    fn port_zero_means_frontend_default() {
        let (_tmp, layout) = storage_with(&["s"]);
        let cfg = build_config(&parse(&["--port", "0"]), &layout, NOW).unwrap();
        assert_eq!(cfg.port, None);
        let cfg = build_config(&parse(&["--port", "9000"]), &layout, NOW).unwrap();
        assert_eq!(cfg.port, Some(9000));
    }

    #[test]
    fn durations_parse_humantime() {
        let (_tmp, layout) = storage_with(&["s"]);
        let args = parse(&["--poll-interval", "250ms", "--shutdown-grace", "2s", "--warmup", "1s"]);
        let cfg = build_config(&args, &layout, NOW).unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(2));
        assert_eq!(cfg.tick_warmup, Duration::from_secs(1));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        for bad in ["0ms", "0s"] {
            let err = Cli::try_parse_from(["sim-supervisor", "--poll-interval", bad]).err();
            assert!(err.is_some(), "{bad} should be rejected");
        }
        let args = parse(&["--poll-interval", "1ms"]);
        assert_eq!(Duration::from(args.poll_interval), Duration::from_millis(1));
    }

    #[test]
    fn migration_failure_keeps_its_exit_code() {
        use crate::model::Exited;
        let err = anyhow::Error::new(LaunchError::MigrationFailed(Exited { code: Some(7) }))
            .context("launch aborted");
        assert_eq!(exit_code(&err), 7);

        let err = anyhow::Error::new(ConfigError::NoSnapshot(PathBuf::from("s")));
        assert_eq!(exit_code(&err), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_layout_fails_before_anything_runs() {
        let tmp = TempDir::new().unwrap();
        let args = parse(&["--root", tmp.path().to_str().unwrap()]);
        let err = run(args, NOW).await.unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
        assert_eq!(exit_code(&err), 1);
    }
}
