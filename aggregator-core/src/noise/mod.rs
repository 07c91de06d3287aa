//! Differential-privacy noising of the merged histogram.
//!
//! Noise is applied independently to every bucket of the merged domain,
//! including buckets with zero observed signal: a domain-declared empty
//! bucket must be indistinguishable from a non-empty one after noising.

use std::{collections::BTreeSet, sync::Arc};

use rand::{thread_rng, Rng};
use rand_core::{CryptoRng, RngCore};

use crate::{
    aggregation::DomainReconciliation,
    config::{PrivacyParameters, WorkerConfig},
    error::Res,
};

/// One row of the final output: a bucket of the merged domain with its
/// noised value, plus the unnoised value when the bucket is debug-eligible
/// on a debug run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AggregatedFact {
    pub bucket: u128,
    pub metric: i64,
    pub unnoised_metric: Option<i64>,
}

/// One row of the debug view emitted on debug runs. Covers the union of the
/// declared domain and the observed buckets, so buckets dropped from the
/// noised output stay diagnosable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DebugFact {
    pub bucket: u128,
    pub noised_metric: i64,
    /// Present only for buckets touched by a report that opted into debug
    /// mode; other buckets stay noised-only even on debug runs.
    pub unnoised_metric: Option<i64>,
    pub in_domain: bool,
    pub in_reports: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AggregatedResults {
    pub facts: Vec<AggregatedFact>,
    /// Populated only on debug runs.
    pub debug_facts: Option<Vec<DebugFact>>,
}

/// A noise mechanism applied once per bucket, independently per bucket.
pub trait NoiseApplier: Send + Sync {
    fn apply(&self, true_sum: i64) -> i64;
}

/// Pass-through "noise" for deterministic testing: `noised == true_sum`,
/// optionally shifted by a fixed offset.
pub struct ConstantNoise(i64);

impl ConstantNoise {
    #[must_use]
    pub fn none() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn with_offset(offset: i64) -> Self {
        Self(offset)
    }
}

impl NoiseApplier for ConstantNoise {
    fn apply(&self, true_sum: i64) -> i64 {
        true_sum.saturating_add(self.0)
    }
}

/// The Laplace mechanism: adds `Lap(0, l1_sensitivity / epsilon)` noise.
pub struct LaplaceNoise {
    scale: f64,
}

impl LaplaceNoise {
    /// ## Errors
    /// If the privacy parameters cannot produce a valid distribution.
    pub fn new(params: &PrivacyParameters) -> Res<Self> {
        params.validate()?;
        Ok(Self {
            scale: params.laplace_scale(),
        })
    }

    /// Draws one sample via the inverse CDF. The `CryptoRng` bound is load
    /// bearing: noise drawn from a predictable source voids the privacy
    /// guarantee.
    fn sample<R: RngCore + CryptoRng>(&self, rng: &mut R) -> f64 {
        let u = rng.gen::<f64>() - 0.5;
        -self.scale * u.signum() * (1.0 - 2.0 * u.abs()).max(f64::MIN_POSITIVE).ln()
    }
}

impl NoiseApplier for LaplaceNoise {
    fn apply(&self, true_sum: i64) -> i64 {
        let noise = self.sample(&mut thread_rng());
        true_sum.saturating_add(round_to_i64(noise))
    }
}

#[allow(clippy::cast_possible_truncation)]
fn round_to_i64(value: f64) -> i64 {
    // min/max of i64 are not exactly representable as f64; clamping to them
    // rounds through the nearest representable neighbour, which saturating_add
    // absorbs.
    value.round().clamp(i64::MIN as f64, i64::MAX as f64) as i64
}

/// Applies the configured mechanism to a reconciled histogram and renders
/// the final facts (plus the debug view on debug runs).
#[derive(Clone)]
pub struct NoisedAggregationRunner {
    applier: Arc<dyn NoiseApplier>,
}

impl NoisedAggregationRunner {
    /// ## Errors
    /// If the configured privacy parameters are unusable.
    pub fn from_config(config: &WorkerConfig) -> Res<Self> {
        let applier: Arc<dyn NoiseApplier> = if config.no_noising {
            tracing::warn!("noising is disabled; results carry no privacy guarantee");
            Arc::new(ConstantNoise::none())
        } else {
            Arc::new(LaplaceNoise::new(&config.privacy)?)
        };
        Ok(Self { applier })
    }

    #[must_use]
    pub fn with_applier(applier: Arc<dyn NoiseApplier>) -> Self {
        Self { applier }
    }

    /// Noises every bucket of the merged domain. `debug_buckets` is the set
    /// of buckets touched by debug-enabled reports; only those expose their
    /// unnoised sum, and only when `debug_run` is set.
    #[must_use]
    pub fn noise(
        &self,
        reconciliation: &DomainReconciliation,
        debug_buckets: &BTreeSet<u128>,
        debug_run: bool,
    ) -> AggregatedResults {
        let expose_unnoised =
            |bucket: u128| debug_run && debug_buckets.contains(&bucket);

        let mut facts = Vec::with_capacity(reconciliation.in_domain.len());
        let mut debug_facts =
            debug_run.then(|| Vec::with_capacity(reconciliation.in_domain.len()));

        for (&bucket, &true_sum) in &reconciliation.in_domain {
            let noised = self.applier.apply(true_sum);
            let unnoised = expose_unnoised(bucket).then_some(true_sum);
            facts.push(AggregatedFact {
                bucket,
                metric: noised,
                unnoised_metric: unnoised,
            });
            if let Some(debug_facts) = debug_facts.as_mut() {
                debug_facts.push(DebugFact {
                    bucket,
                    noised_metric: noised,
                    unnoised_metric: unnoised,
                    in_domain: true,
                    in_reports: reconciliation.observed.contains(&bucket),
                });
            }
        }

        if let Some(debug_facts) = debug_facts.as_mut() {
            for (&bucket, &true_sum) in &reconciliation.outside_domain {
                debug_facts.push(DebugFact {
                    bucket,
                    noised_metric: self.applier.apply(true_sum),
                    unnoised_metric: expose_unnoised(bucket).then_some(true_sum),
                    in_domain: false,
                    in_reports: true,
                });
            }
        }

        AggregatedResults { facts, debug_facts }
    }
}
