//! Retry policies for reindex activities.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::ReindexOptions;
use crate::error::{BackendError, StorageError, StorageResult};
use crate::orchestration::OrchestrationError;

/// Runs an activity call until it succeeds or its retry budget runs out.
///
/// Each attempt is bounded by `activity_timeout`; a timeout counts as a
/// transient failure. Transient failures back off per `options.retry`,
/// precondition failures retry per `options.precondition_retry`, and the two
/// budgets are tracked separately. Anything else fails at once.
pub(crate) async fn run_activity<T, F, Fut>(
    activity: &str,
    options: &ReindexOptions,
    mut call: F,
) -> Result<T, OrchestrationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut transient_attempts = 0u32;
    let mut precondition_attempts = 0u32;

    loop {
        let result = match timeout(options.activity_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(timed_out(activity, options.activity_timeout)),
        };

        let err = match result {
            Ok(value) => {
                if transient_attempts + precondition_attempts > 0 {
                    debug!(
                        activity,
                        transient_attempts, precondition_attempts, "Activity succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let delay = if err.is_precondition_failed()
            && precondition_attempts < options.precondition_retry.max_retries
        {
            precondition_attempts += 1;
            options
                .precondition_retry
                .delay_for_attempt(precondition_attempts)
        } else if err.is_transient() && transient_attempts < options.retry.max_retries {
            transient_attempts += 1;
            options.retry.delay_for_attempt(transient_attempts)
        } else {
            warn!(
                activity,
                transient_attempts,
                precondition_attempts,
                error = %err,
                "Activity failed"
            );
            return Err(OrchestrationError::Activity {
                activity: activity.to_string(),
                source: err,
            });
        };

        warn!(
            activity,
            transient_attempts,
            precondition_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Activity attempt failed, retrying"
        );
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

fn timed_out(activity: &str, after: Duration) -> StorageError {
    BackendError::Timeout {
        operation: activity.to_string(),
        timeout_ms: after.as_millis() as u64,
    }
    .into()
}
