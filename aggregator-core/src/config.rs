use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Parameters of the differential privacy guarantee carried by every
/// non-debug result this worker produces.
///
/// `epsilon` and `l1_sensitivity` drive the Laplace scale
/// (`l1_sensitivity / epsilon`); `delta` is carried for mechanisms that
/// need it and for result metadata.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivacyParameters {
    pub epsilon: f64,
    pub l1_sensitivity: i64,
    pub delta: f64,
}

impl PrivacyParameters {
    /// ## Errors
    /// If the parameters cannot produce a valid noise distribution.
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(Error::InvalidNoiseParameters(format!(
                "epsilon must be finite and positive, got {}",
                self.epsilon
            )));
        }
        if self.l1_sensitivity <= 0 {
            return Err(Error::InvalidNoiseParameters(format!(
                "l1_sensitivity must be positive, got {}",
                self.l1_sensitivity
            )));
        }
        if !(0.0..1.0).contains(&self.delta) {
            return Err(Error::InvalidNoiseParameters(format!(
                "delta must be in [0, 1), got {}",
                self.delta
            )));
        }
        Ok(())
    }

    /// Scale parameter of the Laplace distribution these parameters imply.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn laplace_scale(&self) -> f64 {
        self.l1_sensitivity as f64 / self.epsilon
    }
}

impl Default for PrivacyParameters {
    fn default() -> Self {
        Self {
            epsilon: 10.0,
            l1_sensitivity: 65536,
            delta: 1e-5,
        }
    }
}

/// Static configuration of one aggregation worker process.
///
/// Concrete collaborator implementations are bound to these values at process
/// start; there is no runtime service locator. A `debug_run` is a property of
/// an individual [`Job`], not of the worker.
///
/// [`Job`]: crate::job::Job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub privacy: PrivacyParameters,
    /// When true, jobs may omit the explicit output domain and the observed
    /// bucket set becomes the domain.
    pub domain_optional: bool,
    /// Replaces the Laplace mechanism with pass-through noise. Only for
    /// deterministic testing; never enable for production traffic.
    pub no_noising: bool,
    /// Threads in the pool that runs decryption-key fetches and
    /// privacy-budget calls.
    pub blocking_pool_size: NonZeroUsize,
    /// Threads in the pool that runs the CPU-bound merge and noise work.
    pub non_blocking_pool_size: NonZeroUsize,
    /// How many reports may be in flight through the per-report pipeline at
    /// any point in time.
    pub active_work: NonZeroUsize,
}

impl WorkerConfig {
    /// ## Errors
    /// If the privacy parameters are unusable.
    pub fn validate(&self) -> Result<(), Error> {
        self.privacy.validate()
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            privacy: PrivacyParameters::default(),
            domain_optional: false,
            no_noising: false,
            blocking_pool_size: NonZeroUsize::new(4).unwrap(),
            non_blocking_pool_size: NonZeroUsize::new(4).unwrap(),
            active_work: NonZeroUsize::new(64).unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        WorkerConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_positive_epsilon() {
        let mut params = PrivacyParameters::default();
        params.epsilon = 0.0;
        assert!(params.validate().is_err());
        params.epsilon = f64::NAN;
        assert!(params.validate().is_err());
    }

    #[test]
    fn rejects_bad_sensitivity_and_delta() {
        let mut params = PrivacyParameters::default();
        params.l1_sensitivity = 0;
        assert!(params.validate().is_err());

        let mut params = PrivacyParameters::default();
        params.delta = 1.0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn laplace_scale() {
        let params = PrivacyParameters {
            epsilon: 2.0,
            l1_sensitivity: 10,
            delta: 0.0,
        };
        assert_eq!(params.laplace_scale(), 5.0);
    }

    #[test]
    fn config_deserializes_from_json() {
        let cfg: WorkerConfig = serde_json::from_str(
            r#"{
                "privacy": {"epsilon": 1.5, "l1_sensitivity": 100, "delta": 0.0001},
                "domain_optional": true,
                "no_noising": false,
                "blocking_pool_size": 8,
                "non_blocking_pool_size": 2,
                "active_work": 32
            }"#,
        )
        .unwrap();
        assert!(cfg.domain_optional);
        assert_eq!(cfg.blocking_pool_size.get(), 8);
        assert_eq!(cfg.privacy.epsilon, 1.5);
    }
}
