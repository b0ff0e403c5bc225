use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use opentelemetry::KeyValue;

use report_publisher::cli::Cli;
use report_publisher::clock::RunClock;
use report_publisher::config::{Credentials, LoggingSettings, Settings, TelemetryConfig};
use report_publisher::telemetry::init_telemetry;
use report_publisher::telemetry::metrics::WORKFLOW_DURATION;
use report_publisher::workflow::{Destination, Services, Workflow};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = Settings::load(&cli.config);
    let log_file = match &settings {
        Ok(settings) => settings.logging.file_path.clone(),
        Err(_) => LoggingSettings::default().file_path,
    };

    let telemetry_guard = match init_telemetry(&TelemetryConfig::from_env(log_file)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize telemetry: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let started = Instant::now();
    let result = run(cli, settings).await;

    let outcome = if result.is_ok() { "success" } else { "failure" };
    WORKFLOW_DURATION.record(
        started.elapsed().as_secs_f64(),
        &[KeyValue::new("outcome", outcome)],
    );

    let code = match result {
        Ok(()) => {
            tracing::info!(
                elapsed_s = started.elapsed().as_secs_f64(),
                "Workflow completed successfully"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Workflow failed");
            ExitCode::FAILURE
        }
    };

    telemetry_guard.shutdown();
    code
}

async fn run(
    cli: Cli,
    settings: report_publisher::error::AppResult<Settings>,
) -> anyhow::Result<()> {
    let settings = settings?;
    let credentials = Credentials::from_env()?;

    tracing::info!(
        config = %cli.config.display(),
        report_type = ?cli.report_type,
        dry_run = cli.dry_run,
        "Starting report-publisher"
    );

    let clock = RunClock::now(settings.tz()?);
    let services = Services::connect(&settings, &credentials)?;
    let workflow = Workflow::new(
        settings,
        cli.run_options(),
        services,
        Destination::from(&credentials),
    );

    workflow.run(&clock).await?;
    Ok(())
}
