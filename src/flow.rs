//! Generic step machine for long-running modem operations.
//!
//! Connect/disconnect sequences and registration checks all share one shape:
//! a strictly-ordered set of steps, each either performing one async
//! sub-operation or having nothing to do and falling straight through to the
//! next step. [`drive`] is the single driver: it loops on
//! [`Advance::Continue`] (the fallthrough), checks cancellation at the top of
//! every iteration, and runs the sequence's compensating hook before
//! surfacing a cancelled error. Jumps and bounded same-step retries are just
//! a matter of which step a `run_step` returns next.

use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::Error;

/// What a step decided: move to another step (immediately — the driver does
/// not yield in between), or finish with the overall result.
pub enum Advance<S, T> {
    Continue(S),
    Done(T),
}

/// A multi-step asynchronous operation.
pub trait Sequence: Send {
    /// Ordered step enumeration. `Debug` so the driver can trace progress.
    type Step: Copy + PartialEq + fmt::Debug + Send;
    type Output: Send;

    fn first_step(&self) -> Self::Step;

    /// Execute one step. Errors propagate straight to the caller of
    /// [`drive`]; a step that wants soft-fallback handles the failure itself
    /// and returns the fallback step.
    fn run_step(
        &mut self,
        step: Self::Step,
    ) -> impl std::future::Future<Output = Result<Advance<Self::Step, Self::Output>, Error>> + Send;

    /// Compensating action run when cancellation is observed (e.g. tear down
    /// a half-established connection). Default: nothing to undo.
    fn on_cancel(&mut self, _step: Self::Step) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }
}

/// Drive a sequence to completion.
///
/// The context is consumed; whatever state the steps accumulated is handed
/// back through `Output` and nothing outlives the run.
pub async fn drive<S: Sequence>(
    mut seq: S,
    cancel: Option<CancellationToken>,
) -> Result<S::Output, Error> {
    let mut step = seq.first_step();
    loop {
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                seq.on_cancel(step).await;
                return Err(Error::Cancelled);
            }
        }
        trace!("step {:?}", step);
        match seq.run_step(step).await? {
            Advance::Continue(next) => step = next,
            Advance::Done(output) => return Ok(output),
        }
    }
}
