//! Running a metered operation under a quota.

use std::future::Future;

use crate::prelude::*;

use super::{Admission, QuotaError, UsageQuotaTracker, UsageState};

/// Output of a metered operation, which knows what it cost.
pub trait MeteredOutput {
    /// How many units did this operation actually consume?
    fn units_consumed(&self) -> u64;
}

/// The outcome of [`run_metered`].
#[derive(Debug)]
pub enum Metered<T> {
    /// The quota did not allow the operation, so it was never started.
    Denied {
        /// The admission check which failed.
        admission: Admission,
    },

    /// The operation succeeded and its cost was recorded.
    Completed {
        /// The operation's output.
        output: T,
        /// The usage record after recording.
        state: UsageState,
    },

    /// The operation succeeded, but we could not record its cost. The caller
    /// decides whether to keep going.
    Unrecorded {
        /// The operation's output.
        output: T,
        /// Why recording failed.
        error: QuotaError,
    },
}

/// Check that `requested_units` fit in the quota, run `op` if they do, and
/// record what `op` reports it consumed.
///
/// If `op` fails, nothing is recorded and its error is returned. Retries
/// belong inside `op`, so that a successful call is recorded exactly once.
#[instrument(level = "debug", skip_all, fields(location = %tracker.location(), requested_units = requested_units))]
pub async fn run_metered<T, F, Fut>(
    tracker: &UsageQuotaTracker,
    requested_units: u64,
    op: F,
) -> Result<Metered<T>>
where
    T: MeteredOutput,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let admission = tracker.can_consume(requested_units)?;
    if !admission.allowed {
        warn!(
            remaining = admission.remaining,
            limit = tracker.limit(),
            "Quota exhausted; not starting metered operation"
        );
        return Ok(Metered::Denied { admission });
    }

    let output = op().await?;

    let units = output.units_consumed();
    if units == 0 {
        // Nothing to record, so don't touch storage.
        return Ok(Metered::Completed {
            output,
            state: admission.state,
        });
    }
    Ok(match tracker.record_consumption(units) {
        Ok(state) => Metered::Completed { output, state },
        Err(error) => Metered::Unrecorded { output, error },
    })
}
