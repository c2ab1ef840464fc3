use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use dossier::core::config::Settings;
use dossier::pipeline::report::write_report_file;
use dossier::pipeline::{Orchestrator, RunOptions};
use dossier::AppState;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

/// Produce a cited research report for a natural-language query.
#[derive(Parser, Debug)]
#[command(name = "dossier", version, about)]
struct Cli {
    /// The research query.
    query: String,

    /// Config file path (default: ./dossier.json, then env vars).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the report file is written to.
    #[arg(long, default_value = ".")]
    output: PathBuf,

    /// Log verbosity (RUST_LOG overrides).
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Print the research plan before executing it.
    #[arg(long)]
    show_plan: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries only the plan (opt-in) and the
    // report path.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            error!("{}", e);
            return e.exit_code();
        }
    };
    let output_format = settings.output_format;

    let state = match AppState::new(settings) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("{}", e);
            return e.exit_code();
        }
    };

    // Ctrl-C propagates cooperatively to every in-flight stage worker.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let orchestrator = Orchestrator::new(state);
    let outcome = match orchestrator
        .run(
            &cli.query,
            cancel,
            RunOptions {
                show_plan: cli.show_plan,
            },
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error_kind = e.kind(), "{}", e);
            return e.exit_code();
        }
    };

    match write_report_file(
        &cli.output,
        &outcome.report,
        outcome.verification.as_ref(),
        output_format,
    ) {
        Ok(path) => {
            println!("{}", path.display());
            0
        }
        Err(e) => {
            error!("failed to write report: {}", e);
            e.exit_code()
        }
    }
}
