use std::collections::{BTreeMap, BTreeSet};

use dashmap::{DashMap, DashSet};

use crate::report::AggregatableContribution;

/// A bucket sum overflowed. Aggregation integrity is at risk, so this fails
/// the whole job instead of silently wrapping or saturating.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("bucket sum overflowed a signed 64-bit value for bucket {bucket:#034x}")]
pub struct OverflowError {
    pub bucket: u128,
}

/// Concurrent histogram accumulator for one job.
///
/// The only cross-task shared mutable state of the pipeline. Updates happen
/// under the map's per-bucket entry lock, so final sums are identical
/// regardless of report completion order. Owned by a single
/// [`AggregationEngine`] run and never shared across jobs.
///
/// [`AggregationEngine`]: crate::aggregation::AggregationEngine
#[derive(Default)]
pub struct BucketAccumulator {
    sums: DashMap<u128, i64>,
    /// Buckets touched by a report that opted into debug mode on a debug run.
    debug_buckets: DashSet<u128>,
    /// Report ids already applied; guards against double-counting when a
    /// source retry replays part of the sequence.
    seen_reports: DashSet<String>,
}

impl BucketAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `report_id` for accumulation. Returns `false` if this report
    /// was already applied, in which case its contributions must be skipped.
    pub fn begin_report(&self, report_id: &str) -> bool {
        self.seen_reports.insert(report_id.to_owned())
    }

    /// Folds one contribution into its bucket.
    ///
    /// ## Errors
    /// If the bucket sum overflows an `i64`. The bucket keeps its previous
    /// value so diagnostics can still render the pre-overflow state.
    pub fn accumulate(&self, contribution: &AggregatableContribution) -> Result<(), OverflowError> {
        let mut slot = self.sums.entry(contribution.bucket).or_insert(0);
        *slot = slot.checked_add(contribution.value).ok_or(OverflowError {
            bucket: contribution.bucket,
        })?;
        Ok(())
    }

    pub fn mark_debug(&self, bucket: u128) {
        self.debug_buckets.insert(bucket);
    }

    /// Reads out the observed bucket sums and the debug-eligible bucket set,
    /// in stable bucket order. Only meaningful once all report tasks of the
    /// job have resolved.
    #[must_use]
    pub fn snapshot(&self) -> (BTreeMap<u128, i64>, BTreeSet<u128>) {
        let sums = self.sums.iter().map(|e| (*e.key(), *e.value())).collect();
        let debug_buckets = self.debug_buckets.iter().map(|e| *e.key()).collect();
        (sums, debug_buckets)
    }
}
