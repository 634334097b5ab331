//! Sequential multi-step operations with compensation.
//!
//! A [`Saga`] runs its steps strictly in order. When a step fails, every
//! step that succeeded before it is compensated in reverse order and the
//! saga ends FAILED. Compensation is best effort: a compensation that fails
//! or panics is logged and the remaining ones still run.
//!
//! Steps never run in parallel, so the rollback order is always defined.

use std::fmt;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{panic_message, Error, Result};
use crate::event::RawEvent;

/// One forward action of a saga and the action that undoes it.
#[async_trait]
pub trait SagaStep<D: Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, data: &mut D) -> Result<()>;

    /// Semantically undoes a successful [`SagaStep::execute`].
    async fn compensate(&self, data: &mut D) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    Started,
    Completed,
    Compensating,
    Failed,
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SagaStatus::Started => write!(f, "STARTED"),
            SagaStatus::Completed => write!(f, "COMPLETED"),
            SagaStatus::Compensating => write!(f, "COMPENSATING"),
            SagaStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaState<D> {
    pub saga_id: Uuid,
    pub data: D,
    /// Index of the next step to execute. Equals the number of steps that succeeded.
    pub current_step: usize,
    pub status: SagaStatus,
    pub error: Option<String>,
}

pub struct Saga<D: Send> {
    state: SagaState<D>,
    steps: Vec<Box<dyn SagaStep<D>>>,
}

impl<D: Send> fmt::Debug for Saga<D>
where
    D: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Saga")
            .field("state", &self.state)
            .field(
                "steps",
                &self.steps.iter().map(|step| step.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<D: Send> Saga<D> {
    pub fn new(data: D) -> Self {
        Self {
            state: SagaState {
                saga_id: Uuid::new_v4(),
                data,
                current_step: 0,
                status: SagaStatus::Started,
                error: None,
            },
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: impl SagaStep<D> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn id(&self) -> Uuid {
        self.state.saga_id
    }

    pub fn state(&self) -> &SagaState<D> {
        &self.state
    }

    pub fn status(&self) -> SagaStatus {
        self.state.status
    }

    pub fn data(&self) -> &D {
        &self.state.data
    }

    pub fn into_state(self) -> SagaState<D> {
        self.state
    }

    /// Runs the remaining steps in order, starting at `current_step`.
    ///
    /// On the first failing step the completed steps are compensated and
    /// the failure is returned as [`Error::SagaStep`] carrying the index of
    /// that step.
    pub async fn execute(&mut self) -> Result<()> {
        self.ensure_started()?;
        self.run_remaining().await?;

        self.state.status = SagaStatus::Completed;
        info!(saga_id = %self.state.saga_id, steps = self.steps.len(), "Saga completed");
        Ok(())
    }

    /// Runs the steps from `current_step` on, compensating on the first
    /// failure. The status is left untouched when every step succeeds.
    async fn run_remaining(&mut self) -> Result<()> {
        let saga_id = self.state.saga_id;

        while self.state.current_step < self.steps.len() {
            let index = self.state.current_step;
            let step = &self.steps[index];

            let outcome = AssertUnwindSafe(step.execute(&mut self.state.data))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(Error::infrastructure(panic_message(payload.as_ref()))));

            if let Err(e) = outcome {
                error!(%saga_id, step = index, name = step.name(), error = %e, "Saga step failed");
                self.state.error = Some(e.to_string());
                self.compensate(index).await;
                return Err(Error::SagaStep {
                    step: index,
                    message: e.to_string(),
                });
            }

            self.state.current_step += 1;
        }

        Ok(())
    }

    /// Compensates every step with an index below `from_step`, highest
    /// first, then leaves the saga FAILED.
    pub async fn compensate(&mut self, from_step: usize) {
        let saga_id = self.state.saga_id;
        self.state.status = SagaStatus::Compensating;

        for index in (0..from_step.min(self.steps.len())).rev() {
            let step = &self.steps[index];

            let outcome = AssertUnwindSafe(step.compensate(&mut self.state.data))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(Error::infrastructure(panic_message(payload.as_ref()))));

            match outcome {
                Ok(()) => info!(%saga_id, step = index, name = step.name(), "Step compensated"),
                Err(e) => warn!(
                    %saga_id,
                    step = index,
                    name = step.name(),
                    error = %e,
                    "Compensation failed, continuing rollback"
                ),
            }
        }

        self.state.status = SagaStatus::Failed;
    }

    fn ensure_started(&self) -> Result<()> {
        if self.state.status != SagaStatus::Started {
            return Err(Error::InvalidState {
                expected: SagaStatus::Started.to_string(),
                actual: self.state.status.to_string(),
            });
        }
        Ok(())
    }
}

/// Hooks of an [`EventDrivenSaga`]. All default to doing nothing.
#[async_trait]
pub trait SagaLifecycle<D: Send>: Send + Sync {
    async fn on_start(&self, _data: &mut D) -> Result<()> {
        Ok(())
    }

    async fn on_event(&self, _data: &mut D, _event: &RawEvent) -> Result<()> {
        Ok(())
    }

    async fn on_timeout(&self, _data: &mut D) -> Result<()> {
        Ok(())
    }

    async fn on_complete(&self, _data: &mut D) -> Result<()> {
        Ok(())
    }
}

/// A saga driven by incoming events rather than a single call.
///
/// `start`, `handle_event`, `timeout`, `complete` and `run_steps` are only
/// valid while the saga is STARTED; otherwise they fail with
/// [`Error::InvalidState`].
pub struct EventDrivenSaga<D: Send, H> {
    saga: Saga<D>,
    hooks: H,
}

impl<D, H> EventDrivenSaga<D, H>
where
    D: Send,
    H: SagaLifecycle<D>,
{
    pub fn new(data: D, hooks: H) -> Self {
        Self {
            saga: Saga::new(data),
            hooks,
        }
    }

    pub fn with_step(mut self, step: impl SagaStep<D> + 'static) -> Self {
        self.saga = self.saga.with_step(step);
        self
    }

    pub fn saga(&self) -> &Saga<D> {
        &self.saga
    }

    pub fn status(&self) -> SagaStatus {
        self.saga.status()
    }

    pub async fn start(&mut self) -> Result<()> {
        self.saga.ensure_started()?;
        self.hooks.on_start(&mut self.saga.state.data).await?;
        info!(saga_id = %self.saga.id(), "Saga started");
        Ok(())
    }

    pub async fn handle_event(&mut self, event: &RawEvent) -> Result<()> {
        self.saga.ensure_started()?;
        self.hooks.on_event(&mut self.saga.state.data, event).await
    }

    /// Runs the remaining steps. A failing step compensates and leaves the
    /// saga FAILED; otherwise the saga stays STARTED until [`Self::complete`].
    pub async fn run_steps(&mut self) -> Result<()> {
        self.saga.ensure_started()?;
        self.saga.run_remaining().await
    }

    /// Gives up on the saga: runs the timeout hook, compensates the steps
    /// completed so far and leaves the saga FAILED.
    pub async fn timeout(&mut self) -> Result<()> {
        self.saga.ensure_started()?;
        let saga_id = self.saga.id();
        warn!(%saga_id, completed_steps = self.saga.state.current_step, "Saga timed out");

        if let Err(e) = self.hooks.on_timeout(&mut self.saga.state.data).await {
            warn!(%saga_id, error = %e, "Timeout hook failed");
        }

        self.saga.state.error = Some("saga timed out".to_string());
        let completed = self.saga.state.current_step;
        self.saga.compensate(completed).await;
        Ok(())
    }

    pub async fn complete(&mut self) -> Result<()> {
        self.saga.ensure_started()?;
        self.hooks.on_complete(&mut self.saga.state.data).await?;
        self.saga.state.status = SagaStatus::Completed;
        info!(saga_id = %self.saga.id(), "Saga completed");
        Ok(())
    }
}
