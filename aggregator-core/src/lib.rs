#![deny(clippy::pedantic, clippy::clone_on_ref_ptr)]
// The following warnings are too noisy for us and having them enabled leads to polluting the
// code with allow annotations. Disabling them once per project here
#![allow(clippy::similar_names)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
// In unit tests, it is ok to use methods discouraged to use in prod code. Most of the time it is
// because of performance implications which shouldn't be a concern for unit testing.
#![cfg_attr(test, allow(clippy::disallowed_methods))]

pub mod aggregation;
pub mod app;
pub mod budget;
pub mod config;
pub mod error;
pub mod executor;
pub mod hpke;
pub mod job;
pub mod noise;
pub mod report;
pub mod telemetry;
pub mod validation;

#[cfg(any(test, feature = "test-fixture"))]
pub mod test_fixture;

pub use app::AggregationWorker;
