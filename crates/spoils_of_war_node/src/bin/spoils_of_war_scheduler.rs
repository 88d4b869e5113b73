use std::env;
use std::process;
use std::sync::mpsc;
use std::sync::Arc;

use spoils_of_war::now_unix_ms;
use spoils_of_war_node::{build_scheduler, SchedulerFileConfig, SchedulerRuntime};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[path = "spoils_of_war_scheduler/cli.rs"]
mod cli;

use cli::{parse_options, print_help, CliOptions};

fn main() {
    let raw_args: Vec<String> = env::args().skip(1).collect();
    if raw_args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        return;
    }

    let options = match parse_options(raw_args.iter().map(|arg| arg.as_str())) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{err}");
            print_help();
            process::exit(1);
        }
    };

    init_tracing();
    if let Err(err) = run(options) {
        eprintln!("spoils_of_war_scheduler failed: {err}");
        process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
}

fn run(options: CliOptions) -> Result<(), String> {
    let mut config =
        SchedulerFileConfig::from_file(&options.config_path).map_err(|err| err.to_string())?;
    if let Some(tick_interval_ms) = options.tick_interval_ms {
        config.scheduler = config
            .scheduler
            .with_tick_interval_ms(tick_interval_ms)
            .map_err(|err| err.to_string())?;
    }
    let scheduler = Arc::new(build_scheduler(&config).map_err(|err| err.to_string())?);

    if options.once {
        let report = scheduler
            .run_once(now_unix_ms())
            .map_err(|err| err.to_string())?;
        let summary = serde_json::to_string_pretty(&report).map_err(|err| err.to_string())?;
        println!("{summary}");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .map_err(|err| format!("install shutdown handler failed: {err}"))?;

    let mut runtime = SchedulerRuntime::new(scheduler);
    runtime.start().map_err(|err| err.to_string())?;
    if shutdown_rx.recv().is_err() {
        warn!("shutdown handler dropped; stopping scheduler");
    }
    info!("shutdown requested");
    runtime.stop().map_err(|err| err.to_string())?;

    let snapshot = runtime.snapshot();
    info!(
        sweeps = snapshot.sweep_count,
        quarantined = snapshot.quarantined.len(),
        "spoils scheduler exited"
    );
    Ok(())
}
