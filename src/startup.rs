use crate::configuration::{ForkSettings, Settings};
use crate::fork::{ForkError, ForkedProcess};
use crate::probe::{PingProbe, ProbeError};
use crate::telemetry::error_chain_fmt;
use std::pin::Pin;

type Interrupt = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct Application {
    probe: PingProbe,
    forks: Vec<ForkedProcess>,
    interrupted: Interrupt,
}

#[derive(thiserror::Error)]
pub enum RunError {
    #[error("Failed to read configuration.")]
    Configuration(#[from] config::ConfigError),
    #[error("Failed to listen for Ctrl-C.")]
    Signal(#[source] std::io::Error),
    #[error(transparent)]
    Fork(#[from] ForkError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("Interrupted before the probe completed.")]
    Interrupted,
}

impl std::fmt::Debug for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl RunError {
    /// Process exit code: 1 for a wrong response, 2 for a failed request,
    /// 3 when the run could not be set up, 130 when interrupted.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Probe(e) if e.is_assertion_failure() => 1,
            RunError::Probe(e) if e.is_transport() => 2,
            RunError::Probe(_)
            | RunError::Fork(_)
            | RunError::Configuration(_)
            | RunError::Signal(_) => 3,
            RunError::Interrupted => 130,
        }
    }
}

impl Application {
    /// Start every configured fork, in order. If one of them fails, or Ctrl-C
    /// is pressed, the forks started so far are stopped again.
    pub async fn build(configuration: Settings) -> Result<Self, RunError> {
        let interrupted = ctrl_c().map_err(RunError::Signal)?;
        Self::build_until(configuration, interrupted).await
    }

    /// Like [`Application::build`], but startup and the probe are cut short
    /// once `interrupted` completes instead of on Ctrl-C.
    pub async fn build_until<F>(configuration: Settings, interrupted: F) -> Result<Self, RunError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let probe = PingProbe::new(&configuration.probe)?;
        let mut interrupted: Interrupt = Box::pin(interrupted);

        let mut forks = Vec::with_capacity(configuration.forks.len());
        for settings in &configuration.forks {
            match start_fork(settings, &mut interrupted).await {
                Ok(fork) => forks.push(fork),
                Err(e) => {
                    stop_all(&mut forks).await;
                    return Err(e);
                }
            }
        }

        Ok(Self {
            probe,
            forks,
            interrupted,
        })
    }

    pub fn forks(&self) -> &[ForkedProcess] {
        &self.forks
    }

    /// Probe the server once, then stop all forks, whatever the outcome.
    #[tracing::instrument(name = "Running probe", skip(self), fields(url = %self.probe.url()))]
    pub async fn run_until_stopped(mut self) -> Result<(), RunError> {
        let outcome = tokio::select! {
            outcome = self.probe.check() => outcome.map_err(RunError::from),
            () = self.interrupted.as_mut() => Err(RunError::Interrupted),
        };

        stop_all(&mut self.forks).await;

        match &outcome {
            Ok(()) => tracing::info!("Probe succeeded"),
            Err(e) => tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "Probe failed",
            ),
        }
        outcome
    }
}

/// Spawn a fork and wait for it to become ready, unless interrupted first.
/// A fork that is not ready is stopped before returning.
#[tracing::instrument(name = "Starting fork", skip(settings, interrupted), fields(fork = %settings.name))]
async fn start_fork(
    settings: &ForkSettings,
    interrupted: &mut Interrupt,
) -> Result<ForkedProcess, RunError> {
    let mut fork = ForkedProcess::spawn(settings).await?;
    let ready = tokio::select! {
        ready = fork.wait_until_ready(settings) => ready.map_err(RunError::from),
        () = interrupted.as_mut() => Err(RunError::Interrupted),
    };
    match ready {
        Ok(()) => Ok(fork),
        Err(e) => {
            fork.stop_unready(&e).await;
            Err(e)
        }
    }
}

/// Completes on the first Ctrl-C. The handler is installed right away, so a
/// Ctrl-C arriving before the first poll is not lost.
#[cfg(unix)]
fn ctrl_c() -> std::io::Result<Interrupt> {
    let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    Ok(Box::pin(async move {
        if interrupt.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }))
}

#[cfg(not(unix))]
fn ctrl_c() -> std::io::Result<Interrupt> {
    Ok(Box::pin(async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }))
}

/// Stop forks in the reverse order of their start.
async fn stop_all(forks: &mut Vec<ForkedProcess>) {
    while let Some(mut fork) = forks.pop() {
        tracing::info!("Running `{}` for `{}`", fork.stop_name(), fork.name());
        fork.stop().await;
    }
}
