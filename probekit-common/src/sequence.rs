use futures::future::BoxFuture;

use crate::failure::{Failure, FailureKind};

/// A fallible asynchronous step in a composed operation.
pub type Step<'a> = BoxFuture<'a, Result<(), Failure>>;

/// Runs `steps` in order, continuing past failed steps, and collapses any
/// failures into a single `SequentialOperationError` whose children are
/// the individual failures in step order.
pub async fn run_sequence<'a, I>(steps: I) -> Result<(), Failure>
where
    I: IntoIterator<Item = Step<'a>>,
{
    let mut failures = Vec::new();
    for step in steps {
        if let Err(failure) = step.await {
            tracing::debug!(failure = failure.ooni_failure(), "sequence step failed");
            failures.push(failure);
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(Failure::with_children(FailureKind::SequentialOperation, failures))
    }
}
