use clap::Parser;
use relabel::cli::Cli;
use relabel::config::Settings;
use relabel::controller::backup::BackupStore;
use relabel::controller::migrate::{EXIT_FAILURE, EXIT_INPUT};
use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Failed to install TLS crypto provider: {:?}", e);
        return Ok(ExitCode::from(EXIT_FAILURE));
    }

    let cli = Cli::parse();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return Ok(ExitCode::from(EXIT_INPUT));
        }
    };

    // ops.log lives next to the backups and receives every line the terminal does
    let backups = BackupStore::new(settings.backup_dir.clone());
    backups.ensure_dir()?;
    let ops_log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(backups.ops_log_path())?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(ops_log)),
        )
        .init();

    let run_id = uuid::Uuid::new_v4();
    let span = info_span!("run", run_id = %run_id);
    info!(
        parent: &span,
        args = ?std::env::args().skip(1).collect::<Vec<_>>(),
        backup_dir = %settings.backup_dir.display(),
        "Starting relabel"
    );

    match cli.run(settings).instrument(span.clone()).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            let _guard = span.enter();
            match e.failed_step() {
                Some(step) if step.past_point_of_no_return() => error!(
                    step = %step,
                    error = %e,
                    "Failed after the original deployment was deleted"
                ),
                Some(step) => error!(step = %step, error = %e, "Failed"),
                None => error!(error = %e, "Failed"),
            }
            error!(remediation = %e.remediation(), "Next step");
            Ok(ExitCode::from(e.exit_code()))
        }
    }
}
