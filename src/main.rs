#![allow(missing_docs)]

//! Straylight launcher.
//!
//! Subcommands: `start` (run the kernel and serve the control channel),
//! `check-config` (validate and exit), `baseline` (run the scripted
//! scenario harness).
//!
//! Exit codes: 0 clean shutdown, 1 config error, 2 persistence failure at
//! start, 3 unrecoverable invariant violation.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use straylight::config::KernelConfig;
use straylight::control;
use straylight::harness;
use straylight::kernel::handle::{KernelError, KernelHandle};
use straylight::types::EventKind;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_PERSISTENCE: u8 = 2;
const EXIT_INVARIANT: u8 = 3;

#[derive(Parser)]
#[command(name = "straylight", about = "Policy-enforcing autonomy kernel", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the kernel until interrupted.
    Start {
        /// Path to the kernel config.
        #[arg(long, default_value = "straylight.toml")]
        config: PathBuf,
    },
    /// Validate the config and exit.
    CheckConfig {
        /// Path to the kernel config.
        #[arg(long, default_value = "straylight.toml")]
        config: PathBuf,
    },
    /// Run the baseline scenario harness against an in-memory kernel.
    Baseline,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Start { config } => start(config).await,
        Command::CheckConfig { config } => check_config(&config),
        Command::Baseline => baseline().await,
    }
}

async fn start(config_path: PathBuf) -> ExitCode {
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let _logging_guard = match straylight::logging::init_service(
        &PathBuf::from(&config.logs_dir),
        &config.agent.name,
    ) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialise logging: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let kernel = match KernelHandle::builder(config).build() {
        Ok(kernel) => kernel,
        Err(e) => {
            error!(error = %e, "kernel assembly failed");
            let code = match e {
                KernelError::PersistenceUnavailable(_) => EXIT_PERSISTENCE,
                _ => EXIT_CONFIG,
            };
            return ExitCode::from(code);
        }
    };

    kernel.start();
    info!("kernel running; ctrl-c to stop");

    let (_client, control_rx) = control::channel();
    let control_kernel = kernel.clone();
    let control_task = tokio::spawn(control::serve(control_kernel, control_rx));

    // An invariant violation that lands while safe mode is already active
    // has nowhere left to degrade to: shut down with the dedicated code.
    let mut events = kernel.subscribe_events();
    let code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break EXIT_OK;
            }
            event = events.recv() => match event {
                Ok(event)
                    if event.kind == EventKind::InvariantViolated
                        && kernel.status().safe_mode =>
                {
                    error!(payload = %event.payload, "invariant violated inside safe mode");
                    break EXIT_INVARIANT;
                }
                Ok(_) => {}
                Err(_lagged) => {}
            }
        }
    };

    kernel.stop();
    control_task.abort();
    ExitCode::from(code)
}

fn check_config(config_path: &PathBuf) -> ExitCode {
    straylight::logging::init_cli();
    match load_config(config_path) {
        Ok(config) => {
            println!(
                "config ok: agent '{}', admit tier {}, {} max concurrent pipeline(s)",
                config.agent.name, config.memory.admit_tier, config.workflow.max_concurrent
            );
            ExitCode::from(EXIT_OK)
        }
        Err(code) => code,
    }
}

async fn baseline() -> ExitCode {
    straylight::logging::init_cli();
    let report = harness::run_all().await;
    for detail in &report.details {
        let status = if detail.passed { "pass" } else { "FAIL" };
        println!("{status}  {}  {}", detail.name, detail.detail);
    }
    println!("baseline: {} passed, {} failed", report.passed, report.failed);
    if report.ok() {
        ExitCode::from(EXIT_OK)
    } else {
        ExitCode::from(EXIT_CONFIG)
    }
}

fn load_config(path: &PathBuf) -> Result<KernelConfig, ExitCode> {
    // A missing file is fine for local runs; defaults apply. An unreadable
    // or invalid file is a config error.
    if !path.exists() {
        return Ok(KernelConfig::default());
    }
    KernelConfig::load(path).map_err(|e| {
        eprintln!("config error: {e}");
        ExitCode::from(EXIT_CONFIG)
    })
}
