use std::backtrace::Backtrace;

use thiserror::Error;

use crate::{aggregation::StageError, validation::InvalidJobError};

/// An error that fails an entire aggregation job.
///
/// Per-report failures are not represented here: malformed reports are recorded
/// as [`ErrorMessage`] diagnostics and excluded from the histogram without
/// aborting the job. Everything in this enum aborts processing and moves the
/// job to `FAILED`.
///
/// [`ErrorMessage`]: crate::job::ErrorMessage
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid job: {0}")]
    InvalidArgument(#[from] InvalidJobError),
    #[error("privacy budget service unavailable: {0}")]
    BudgetBridgeUnavailable(BoxError),
    #[error("bucket sum overflowed a signed 64-bit value for bucket {bucket:#034x}")]
    NumericOverflow { bucket: u128 },
    #[error("report source failed: {0}")]
    ReportSource(BoxError),
    #[error("output domain source failed: {0}")]
    DomainSource(BoxError),
    #[error("result sink failed: {0}")]
    ResultSink(BoxError),
    #[error("job status reporter failed: {0}")]
    StatusReporter(BoxError),
    #[error("invalid noising parameters: {0}")]
    InvalidNoiseParameters(String),
    #[error(transparent)]
    IllegalStage(#[from] StageError),
    #[error("problem during IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime error")]
    RuntimeError(#[from] tokio::task::JoinError),
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Res<T> = Result<T, Error>;

/// Set up a global panic hook that dumps the panic information to our tracing subsystem if it is
/// available and duplicates that to standard error output.
///
/// Note that it is not possible to reliably test panic hooks because Rust test runner uses more
/// than one thread by default.
///
/// ## Panics
/// If caller thread is panicking while calling this function.
pub fn set_global_panic_hook() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        let backtrace = Backtrace::force_capture();

        let cur_thread = std::thread::current();
        tracing::error!(
            "{thread_id:?} \"{thread_name}\" {panic_info}\nstack trace:\n{backtrace}",
            thread_id = cur_thread.id(),
            thread_name = cur_thread.name().unwrap_or("<no_name>")
        );
        (default_hook)(panic_info);
    }));
}
