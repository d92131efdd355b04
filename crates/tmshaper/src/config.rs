//! Command-line surface and its validation.
//!
//! [`Args`] is the raw clap view. [`RunConfig::from_args`] turns it into a
//! checked [`Action`] before any hardware is touched, so every contract
//! violation surfaces as [`TmError::InvalidArgument`] up front.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Parser, ValueEnum};

use crate::error::{TmError, TmResult};
use crate::rate::RateRequest;
use crate::sampling::{OutputFormat, QueueSelection, StopCondition, WatchOptions};
use crate::sink::LogFileOptions;
use crate::types::{DevicePort, LogicalQueue, Mode, Scope, ShapingTarget};

/// Bridge command used when neither `--bridge-cmd` nor the env var is set.
pub const DEFAULT_BRIDGE_CMD: &str = "bfshell-bridge";

/// Control-plane adapter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Backend {
    /// External bfrt bridge process.
    #[default]
    Bridge,
    /// In-memory simulated switch (dry run).
    Sim,
}

/// Configure Tofino TM port/queue shaping and watch TM counters
#[derive(Parser, Debug, Clone)]
#[command(name = "tmshaper")]
#[command(author, version, about, long_about = None)]
#[command(group(
    ArgGroup::new("rate")
        .args(["max_gbps", "max_mbps", "max_bps"])
        .multiple(false)
))]
pub struct Args {
    /// Apply shaping at TM port level (recommended) or TM queue level
    #[arg(long, value_enum, default_value_t = Scope::Port)]
    pub scope: Scope,

    /// Device port (required for apply/watch; reset without it sweeps all ports)
    #[arg(long)]
    pub dev_port: Option<u32>,

    /// Logical queue 0-7
    #[arg(long, default_value_t = 0)]
    pub queue: u32,

    /// Operating mode
    #[arg(long, value_enum, default_value_t = Mode::Watch)]
    pub mode: Mode,

    /// Watch all 8 queues of the port instead of only --queue
    #[arg(long)]
    pub all_queues: bool,

    /// Clear TM counters once before watching (if supported)
    #[arg(long)]
    pub clear_counters: bool,

    /// Shaping rate in Gbps
    #[arg(long, allow_negative_numbers = true)]
    pub max_gbps: Option<f64>,

    /// Shaping rate in Mbps
    #[arg(long, allow_negative_numbers = true)]
    pub max_mbps: Option<f64>,

    /// Shaping rate in bps
    #[arg(long, allow_negative_numbers = true)]
    pub max_bps: Option<i64>,

    /// Polling interval in seconds
    #[arg(long, default_value_t = 1.0, allow_negative_numbers = true)]
    pub interval: f64,

    /// Stop watching after this many seconds
    #[arg(long, allow_negative_numbers = true)]
    pub duration: Option<f64>,

    /// Stop watching after this many samples
    #[arg(long)]
    pub iterations: Option<u64>,

    /// Also write output to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Append to --log-file instead of overwriting
    #[arg(long)]
    pub log_append: bool,

    /// Control-plane backend
    #[arg(long, value_enum, default_value_t = Backend::Bridge)]
    pub backend: Backend,

    /// Command spawned for the bridge backend (run via /bin/sh -c)
    #[arg(long, env = "TMSHAPER_BRIDGE_CMD", default_value = DEFAULT_BRIDGE_CMD)]
    pub bridge_cmd: String,

    /// Watch row encoding
    #[arg(long, value_enum, default_value_t = OutputFormat::Tsv)]
    pub format: OutputFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,
}

/// A validated unit of work.
#[derive(Debug, Clone)]
pub enum Action {
    /// Enable shaping on one port or queue.
    Apply {
        target: ShapingTarget,
        rate: RateRequest,
    },
    /// Disable shaping on one port or queue.
    Reset { target: ShapingTarget },
    /// Disable shaping on every device port.
    ResetAll { scope: Scope },
    /// Poll counters.
    Watch(WatchOptions),
}

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// What to do.
    pub action: Action,
    /// Which control plane to talk to.
    pub backend: Backend,
    /// Bridge command line.
    pub bridge_cmd: String,
    /// Optional output log file.
    pub log_file: Option<LogFileOptions>,
    /// Diagnostic log filter.
    pub log_level: String,
    mode: Mode,
    scope: Scope,
    dev_port: Option<DevicePort>,
    queue: LogicalQueue,
}

fn seconds(arg: &str, value: f64) -> TmResult<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(TmError::invalid_argument(
            arg,
            format!("{} must be a non-negative number of seconds", value),
        ));
    }
    Duration::try_from_secs_f64(value).map_err(|e| TmError::invalid_argument(arg, e.to_string()))
}

fn require_dev_port(dev_port: Option<DevicePort>, mode: Mode) -> TmResult<DevicePort> {
    dev_port.ok_or_else(|| {
        TmError::invalid_argument("--dev-port", format!("required for {} mode", mode))
    })
}

impl RunConfig {
    /// Validates parsed arguments.
    pub fn from_args(args: &Args) -> TmResult<Self> {
        let dev_port = args.dev_port.map(DevicePort::new).transpose()?;
        let queue = LogicalQueue::new(args.queue)?;
        let interval = seconds("--interval", args.interval)?;
        let duration = args
            .duration
            .map(|d| seconds("--duration", d))
            .transpose()?;

        let target = |dev_port: DevicePort| match args.scope {
            Scope::Port => ShapingTarget::port(dev_port),
            Scope::Queue => ShapingTarget::queue(dev_port, queue),
        };

        let action = match args.mode {
            Mode::Apply => {
                let dev_port = require_dev_port(dev_port, args.mode)?;
                let rate = RateRequest::from_options(args.max_gbps, args.max_mbps, args.max_bps)
                    .ok_or_else(|| {
                        TmError::invalid_argument(
                            "--mode apply",
                            "requires --max-gbps or --max-mbps or --max-bps",
                        )
                    })?;
                rate.validate()?;
                Action::Apply {
                    target: target(dev_port),
                    rate,
                }
            }
            Mode::Reset => match dev_port {
                Some(dev_port) => Action::Reset {
                    target: target(dev_port),
                },
                None => Action::ResetAll { scope: args.scope },
            },
            Mode::Watch => {
                let dev_port = require_dev_port(dev_port, args.mode)?;
                let queues = if args.all_queues {
                    QueueSelection::All
                } else {
                    QueueSelection::Single(queue)
                };
                Action::Watch(WatchOptions {
                    dev_port,
                    queues,
                    interval,
                    stop: StopCondition {
                        duration,
                        iterations: args.iterations,
                    },
                    clear_counters: args.clear_counters,
                    format: args.format,
                })
            }
        };

        Ok(Self {
            action,
            backend: args.backend,
            bridge_cmd: args.bridge_cmd.clone(),
            log_file: args.log_file.as_ref().map(|path| LogFileOptions {
                path: path.clone(),
                append: args.log_append,
            }),
            log_level: args.log_level.clone(),
            mode: args.mode,
            scope: args.scope,
            dev_port,
            queue,
        })
    }

    /// The `# Command:` line written first when a log file is in use.
    pub fn command_line(&self) -> String {
        let dev_port = self
            .dev_port
            .map_or_else(|| "all".to_string(), |p| p.to_string());
        format!(
            "# Command: mode={}, dev_port={}, queue={}, scope={}",
            self.mode, dev_port, self.queue, self.scope
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        let mut full = vec!["tmshaper"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap()
    }

    fn config(argv: &[&str]) -> TmResult<RunConfig> {
        RunConfig::from_args(&parse(argv))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--dev-port", "10"]);
        assert_eq!(args.scope, Scope::Port);
        assert_eq!(args.mode, Mode::Watch);
        assert_eq!(args.queue, 0);
        assert_eq!(args.interval, 1.0);
        assert_eq!(args.backend, Backend::Bridge);
        assert_eq!(args.format, OutputFormat::Tsv);

        let cfg = RunConfig::from_args(&args).unwrap();
        match cfg.action {
            Action::Watch(opts) => {
                assert_eq!(opts.interval, Duration::from_secs(1));
                assert!(opts.stop.is_unbounded());
                assert_eq!(
                    opts.queues,
                    QueueSelection::Single(LogicalQueue::new(0).unwrap())
                );
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_rate_options_are_exclusive() {
        let err = Args::try_parse_from([
            "tmshaper",
            "--mode",
            "apply",
            "--dev-port",
            "1",
            "--max-gbps",
            "1",
            "--max-mbps",
            "5",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_apply_requires_rate_and_port() {
        let err = config(&["--mode", "apply", "--dev-port", "10"]).unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("--max-gbps"));

        let err = config(&["--mode", "apply", "--max-gbps", "1"]).unwrap_err();
        assert!(err.to_string().contains("--dev-port"));
    }

    #[test]
    fn test_apply_rate_parsing() {
        let cfg = config(&["--mode", "apply", "--dev-port", "10", "--max-gbps", "2.5"]).unwrap();
        match cfg.action {
            Action::Apply { target, rate } => {
                assert_eq!(target, ShapingTarget::port(DevicePort::new(10).unwrap()));
                assert_eq!(rate.bits_per_second(), 2_500_000_000);
            }
            other => panic!("unexpected action {:?}", other),
        }

        let err = config(&["--mode", "apply", "--dev-port", "10", "--max-bps", "-5"]).unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn test_queue_scope_target() {
        let cfg = config(&["--mode", "reset", "--dev-port", "3", "--scope", "queue", "--queue", "6"]).unwrap();
        match cfg.action {
            Action::Reset { target } => {
                assert_eq!(target.scope, Scope::Queue);
                assert_eq!(target.queue.as_u32(), 6);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_reset_without_port_is_global() {
        let cfg = config(&["--mode", "reset", "--scope", "queue"]).unwrap();
        assert!(matches!(cfg.action, Action::ResetAll { scope: Scope::Queue }));
        assert_eq!(
            cfg.command_line(),
            "# Command: mode=reset, dev_port=all, queue=0, scope=queue"
        );
    }

    #[test]
    fn test_range_checks() {
        assert!(config(&["--dev-port", "256"]).unwrap_err().is_usage());
        assert!(config(&["--dev-port", "1", "--queue", "8"]).unwrap_err().is_usage());
        assert!(config(&["--dev-port", "1", "--interval", "-1"]).unwrap_err().is_usage());
        assert!(config(&["--dev-port", "1", "--duration", "-0.5"]).unwrap_err().is_usage());
        assert!(config(&["--dev-port", "1", "--duration", "1e30"]).unwrap_err().is_usage());
        assert!(config(&["--dev-port", "1", "--interval", "1e30"]).unwrap_err().is_usage());
        assert!(config(&[]).unwrap_err().is_usage());
    }

    #[test]
    fn test_watch_bounds_and_log_file() {
        let cfg = config(&[
            "--dev-port",
            "140",
            "--all-queues",
            "--duration",
            "2.5",
            "--iterations",
            "7",
            "--log-file",
            "/tmp/tm.log",
            "--log-append",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(
            cfg.log_file,
            Some(LogFileOptions {
                path: PathBuf::from("/tmp/tm.log"),
                append: true
            })
        );
        match cfg.action {
            Action::Watch(opts) => {
                assert_eq!(opts.queues, QueueSelection::All);
                assert_eq!(opts.stop.duration, Some(Duration::from_millis(2500)));
                assert_eq!(opts.stop.iterations, Some(7));
                assert_eq!(opts.format, OutputFormat::Json);
                assert_eq!(opts.dev_port.pipe(), 1);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }
}
