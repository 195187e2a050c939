use crate::error::StageError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;

/// What a single poll-and-process step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A message was fully processed; poll again right away.
    Processed,
    /// Nothing was available before the poll timed out.
    Idle,
}

/// One pipeline stage driven by [`StageRunner`].
#[async_trait]
pub trait Stage: Send {
    fn name(&self) -> &str;

    /// Connects and prepares resources. Called once before the first step.
    async fn start(&mut self) -> Result<(), StageError>;

    /// Polls for at most one message and processes it completely.
    async fn step(&mut self) -> Result<StepOutcome, StageError>;

    /// Releases bus and storage handles. Called on every exit path.
    async fn close(&mut self) -> Result<(), StageError>;
}

/// Cooperative poll loop shared by every stage.
///
/// The loop checks the shutdown channel between steps, so an in-flight step
/// always completes before the stage exits. A step error ends the loop; the
/// stage is closed and the error returned so the supervisor can restart it.
pub struct StageRunner {
    idle_sleep: Duration,
}

impl StageRunner {
    #[must_use]
    pub const fn new(idle_sleep: Duration) -> Self {
        Self { idle_sleep }
    }

    /// Runs `stage` until shutdown is signalled or a step fails.
    ///
    /// # Errors
    /// Returns the start or step error that stopped the stage, otherwise any
    /// error raised while closing it.
    pub async fn run<S>(
        &self,
        stage: &mut S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), StageError>
    where
        S: Stage + ?Sized,
    {
        let name = stage.name().to_string();
        tracing::info!(stage = %name, "Starting stage");

        let outcome = match stage.start().await {
            Ok(()) => self.run_loop(stage, &mut shutdown).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            tracing::error!(stage = %name, kind = e.kind(), error = %e, "Stage failed, shutting down");
        }

        let closed = stage.close().await;
        if let Err(e) = &closed {
            tracing::error!(stage = %name, error = %e, "Failed to close stage cleanly");
        }

        tracing::info!(stage = %name, "Stage stopped");
        outcome.and(closed)
    }

    async fn run_loop<S>(
        &self,
        stage: &mut S,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), StageError>
    where
        S: Stage + ?Sized,
    {
        loop {
            if *shutdown.borrow() {
                tracing::info!(stage = stage.name(), "Shutdown requested");
                return Ok(());
            }

            match stage.step().await? {
                StepOutcome::Processed => tokio::task::yield_now().await,
                StepOutcome::Idle => {
                    tokio::select! {
                        () = tokio::time::sleep(self.idle_sleep) => {}
                        changed = shutdown.changed() => {
                            // Sender gone: nobody can stop us any more, treat as shutdown.
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}
