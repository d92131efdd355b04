//! tmshaper entry point.
//!
//! Parses and validates the command line, connects the selected control
//! plane, and dispatches to the shaping controller or the watch loop.
//! Operator output goes to stdout (and the optional log file); diagnostics
//! go to stderr through tracing.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sonic_tmshaper::{
    run_watch, Action, Args, Backend, BridgeClient, ControlPlane, OutputSink, ResetSummary,
    RunConfig, ShapingController, SimSwitch,
};

/// Exit code for command-line contract violations.
const EXIT_USAGE: u8 = 2;

/// Initialize tracing/logging on stderr.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn build_backend(cfg: &RunConfig) -> (Arc<dyn ControlPlane>, Option<Arc<BridgeClient>>) {
    match cfg.backend {
        Backend::Bridge => {
            info!(command = %cfg.bridge_cmd, "Using control-plane bridge");
            let bridge = Arc::new(BridgeClient::new(cfg.bridge_cmd.clone()));
            let cp: Arc<dyn ControlPlane> = bridge.clone();
            (cp, Some(bridge))
        }
        Backend::Sim => {
            info!("Using simulated traffic manager");
            let cp: Arc<dyn ControlPlane> = Arc::new(SimSwitch::reference());
            (cp, None)
        }
    }
}

async fn run(
    cfg: &RunConfig,
    sink: &mut OutputSink,
    cp: Arc<dyn ControlPlane>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    if sink.has_log_file() {
        sink.emit(&cfg.command_line())?;
    }

    match &cfg.action {
        Action::Apply { target, rate } => {
            let ctrl = ShapingController::new(cp);
            let report = ctrl
                .apply(*target, rate.bits_per_second())
                .await
                .with_context(|| format!("apply {} shaping on dev_port={}", target.scope, target.dev_port))?;
            for line in report.lines() {
                sink.emit(&line)?;
            }
        }
        Action::Reset { target } => {
            let ctrl = ShapingController::new(cp);
            let report = ctrl
                .reset(*target)
                .await
                .with_context(|| format!("reset {} shaping on dev_port={}", target.scope, target.dev_port))?;
            for line in report.lines() {
                sink.emit(&line)?;
            }
        }
        Action::ResetAll { scope } => {
            sink.emit(&ResetSummary::banner())?;
            let summary = ShapingController::new(cp).reset_all(*scope).await;
            sink.emit(&summary.line())?;
        }
        Action::Watch(opts) => {
            run_watch(cp.as_ref(), sink, opts, cancel)
                .await
                .with_context(|| format!("watch dev_port={}", opts.dev_port))?;
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    let cfg = match RunConfig::from_args(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let mut sink = match OutputSink::stdout(cfg.log_file.as_ref()) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Failed to open output: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            signal_token.cancel();
        }
    });

    let (cp, bridge) = build_backend(&cfg);
    let watching = matches!(cfg.action, Action::Watch(_));

    // The watch loop stops on the token itself; other modes are abandoned.
    let result = tokio::select! {
        r = run(&cfg, &mut sink, cp, &cancel) => r,
        _ = cancel.cancelled(), if !watching => Err(anyhow::anyhow!("interrupted")),
    };

    if let Some(bridge) = bridge {
        bridge.shutdown().await;
    }
    if let Err(e) = sink.close() {
        error!("Failed to close output log: {}", e);
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
