use execfork::configuration::get_configuration;
use execfork::startup::{Application, RunError};
use execfork::telemetry::{get_subscriber, init_subscriber};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let subscriber = get_subscriber("execfork".into(), "info".into(), std::io::stdout);
    init_subscriber(subscriber);

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "execfork failed",
            );
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), RunError> {
    let configuration = get_configuration()?;
    let application = Application::build(configuration).await?;
    application.run_until_stopped().await
}
