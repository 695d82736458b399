use clap::Parser;
use std::process::ExitCode;
use tempjwk::{cli::Cli, Lifecycle, LifecycleError, OperatorInput, Settings, WaitOutcome};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    // Logs go to stderr; stdout carries the operator prompts.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tempjwk=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(run(cli));
    // A stdin read still pending from the wait cannot be cancelled.
    runtime.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => ExitCode::from(report_failure(&err)),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load(&cli).map_err(LifecycleError::from)?;
    let plan = settings.plan().map_err(LifecycleError::from)?;
    info!(
        provisioner = %plan.name,
        admin_provisioner = %plan.admin.provisioner,
        public_key = %plan.keys.public_key.display(),
        "Starting tempjwk v{}",
        env!("CARGO_PKG_VERSION")
    );

    let lifecycle = Lifecycle::new(settings.runner(), plan);
    let mut operator = OperatorInput::new();
    let report = lifecycle.run(&mut operator).await?;

    match report.outcome {
        WaitOutcome::Cancelled => info!(waited = ?report.waited, "Revoked on operator request"),
        WaitOutcome::TimedOut => info!(waited = ?report.waited, "Revoked after timeout"),
    }
    Ok(())
}

/// Print the failure and pick the exit status.
fn report_failure(err: &anyhow::Error) -> u8 {
    let Some(failure) = err.downcast_ref::<LifecycleError>() else {
        eprintln!("Error: {:#}", err);
        return 1;
    };

    debug!(stage = %failure.stage(), "Run failed");
    if failure.leaves_credential() {
        eprintln!("***************************************************************");
        eprintln!("* WARNING: the temporary provisioner may still be registered. *");
        eprintln!("* Remove it by hand with `step ca provisioner remove`.        *");
        eprintln!("***************************************************************");
    }
    eprintln!("Error ({}): {:#}", failure.stage(), err);
    failure.exit_code()
}
