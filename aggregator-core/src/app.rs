//! The worker's outer loop and its external collaborators.
//!
//! Everything the worker touches outside its own process goes through one of
//! the traits defined here: where encrypted reports and output domains come
//! from, where results go, and who is told about job progress. The engine
//! never talks to storage directly, which keeps the whole pipeline testable
//! with in-memory fixtures.

use std::{collections::BTreeSet, pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures::Stream;

use crate::{
    aggregation::AggregationEngine,
    error::{BoxError, Error, Res},
    hpke::PrivateKeyRegistry,
    job::{Job, JobStatus, ResultInfo},
    noise::AggregatedResults,
    report::EncryptedReport,
    telemetry::Stopwatch,
};

/// Message attached to a successfully finished job.
pub const SUCCESS_MESSAGE: &str = "Aggregation job successfully processed";

/// Stream of encrypted reports for one job. Item-level errors are fatal to
/// the job: a batch that cannot be fully read must not produce a result.
pub type EncryptedReportStream =
    Pin<Box<dyn Stream<Item = Result<EncryptedReport, BoxError>> + Send>>;

/// Hands out the encrypted report batch named by a job's `input_location`.
#[async_trait]
pub trait ReportSource: Send + Sync {
    /// ## Errors
    /// If the batch cannot be opened at all. Errors while streaming are
    /// reported through the stream items instead.
    async fn read_reports(&self, job: &Job) -> Result<EncryptedReportStream, BoxError>;
}

/// Hands out the declared output domain of a job. Only consulted for jobs
/// whose parameters name an output domain location.
#[async_trait]
pub trait OutputDomainSource: Send + Sync {
    async fn read_domain(&self, job: &Job) -> Result<BTreeSet<u128>, BoxError>;
}

/// Receives the noised histogram (and the debug view, on debug runs).
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn write_results(&self, job: &Job, results: &AggregatedResults)
        -> Result<(), BoxError>;
}

/// Receives job lifecycle updates. Owned by the external job service; the
/// worker only ever moves a job forward.
#[async_trait]
pub trait JobStatusReporter: Send + Sync {
    async fn mark_in_progress(&self, job_id: &str) -> Result<(), BoxError>;
    async fn complete(&self, job_id: &str, result: &ResultInfo) -> Result<(), BoxError>;
}

/// One aggregation worker: the engine plus its bound collaborators.
///
/// `process_job` is the single entry point. A failed job is a normal outcome
/// (`Ok` with a `FAILED` result); an `Err` means a collaborator broke and the
/// job's final state is unknown to us.
pub struct AggregationWorker<K> {
    engine: AggregationEngine<K>,
    report_source: Arc<dyn ReportSource>,
    domain_source: Arc<dyn OutputDomainSource>,
    result_sink: Arc<dyn ResultSink>,
    status_reporter: Arc<dyn JobStatusReporter>,
}

impl<K: PrivateKeyRegistry> AggregationWorker<K> {
    #[must_use]
    pub fn new(
        engine: AggregationEngine<K>,
        report_source: Arc<dyn ReportSource>,
        domain_source: Arc<dyn OutputDomainSource>,
        result_sink: Arc<dyn ResultSink>,
        status_reporter: Arc<dyn JobStatusReporter>,
    ) -> Self {
        Self {
            engine,
            report_source,
            domain_source,
            result_sink,
            status_reporter,
        }
    }

    /// Runs one job end to end and reports the outcome.
    ///
    /// ## Errors
    /// Only when a collaborator call fails; job-level failures (invalid
    /// parameters, overflow, unreachable budget service) come back as an
    /// `Ok` result with `JobStatus::Failed`.
    pub async fn process_job(&self, job: &Job) -> Res<ResultInfo> {
        let _timer = Stopwatch::started("process_job");
        tracing::info!(job_id = %job.job_id, "starting job");

        self.status_reporter
            .mark_in_progress(&job.job_id)
            .await
            .map_err(Error::StatusReporter)?;

        let result = match self
            .engine
            .process(job, &*self.report_source, &*self.domain_source)
            .await
        {
            Ok(outcome) => {
                self.result_sink
                    .write_results(job, &outcome.results)
                    .await
                    .map_err(Error::ResultSink)?;
                tracing::info!(
                    job_id = %job.job_id,
                    buckets = outcome.results.facts.len(),
                    excluded_reports = outcome.error_summary.total(),
                    "job finished"
                );
                ResultInfo {
                    status: JobStatus::Finished,
                    message: SUCCESS_MESSAGE.to_owned(),
                    error_summary: outcome.error_summary,
                }
            }
            Err(error) => {
                tracing::error!(job_id = %job.job_id, %error, "job failed");
                ResultInfo {
                    status: JobStatus::Failed,
                    message: error.to_string(),
                    error_summary: Default::default(),
                }
            }
        };

        self.status_reporter
            .complete(&job.job_id, &result)
            .await
            .map_err(Error::StatusReporter)?;

        Ok(result)
    }
}
