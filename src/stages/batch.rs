use futures::{StreamExt, stream};
use tracing::{info, warn};

use super::Workflow;
use crate::models::{BatchOutcome, CallInput, FailureRecord};

/// Analyze many calls under the workflow's concurrency cap
///
/// Outcomes come back in input order. With `continue_on_error` every call
/// runs regardless of its siblings; otherwise the first failure stops the
/// batch and every call without an outcome yet is reported as skipped.
pub async fn execute_batch(
    workflow: &Workflow,
    calls: Vec<CallInput>,
    continue_on_error: bool,
) -> Vec<BatchOutcome> {
    let call_ids: Vec<String> = calls.iter().map(|c| c.call_id.clone()).collect();
    let limit = workflow.config().max_concurrent_calls.max(1);
    info!(
        "Batch of {} calls (concurrency {}, {})",
        calls.len(),
        limit,
        if continue_on_error { "continue on error" } else { "fail fast" }
    );

    let mut slots: Vec<Option<BatchOutcome>> = vec![None; calls.len()];
    {
        let mut runs = stream::iter(calls.into_iter().enumerate())
            .map(|(position, call)| async move {
                let call_id = call.call_id.clone();
                let outcome = match workflow.execute(call).await {
                    Ok(report) => BatchOutcome::Report(Box::new(report)),
                    Err(e) => BatchOutcome::Failure(FailureRecord::from_error(call_id, &e)),
                };
                (position, outcome)
            })
            .buffer_unordered(limit);

        while let Some((position, outcome)) = runs.next().await {
            let failed = !outcome.is_success();
            slots[position] = Some(outcome);
            if failed && !continue_on_error {
                warn!("Stopping batch after failure of {}", call_ids[position]);
                break;
            }
        }
    }

    let outcomes: Vec<BatchOutcome> = slots
        .into_iter()
        .zip(call_ids)
        .map(|(slot, call_id)| {
            slot.unwrap_or_else(|| BatchOutcome::Failure(FailureRecord::skipped(call_id)))
        })
        .collect();

    let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
    info!(
        "Batch complete: {}/{} calls succeeded",
        succeeded,
        outcomes.len()
    );
    outcomes
}
