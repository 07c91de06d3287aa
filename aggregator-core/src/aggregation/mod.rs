//! The per-job aggregation pipeline.
//!
//! A job moves through a fixed sequence of stages: its parameters are
//! validated, every report is decrypted, validated and budgeted in bounded
//! parallelism while its contributions fold into a shared accumulator, the
//! observed sums are reconciled against the declared output domain, and the
//! result is noised. Per-report failures exclude that report and are counted;
//! the errors in [`Error`] abort the whole job.

mod accumulator;
mod domain;

pub use accumulator::{BucketAccumulator, OverflowError};
pub use domain::{reconcile, DomainReconciliation};

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::{future, StreamExt};

use crate::{
    app::{OutputDomainSource, ReportSource},
    budget::{BudgetOutcome, PrivacyBudgetingServiceBridge},
    config::WorkerConfig,
    error::{Error, Res},
    executor::{RuntimeHandle, WorkerPools},
    hpke::PrivateKeyRegistry,
    job::{ErrorCategory, ErrorMessage, ErrorSummary, Job},
    noise::{AggregatedResults, NoisedAggregationRunner},
    report::{EncryptedReport, PrivacyBudgetKey, Report},
    validation::{required_field_invalid, JobValidator, PrivacyBudgetKeyValidator},
};

/// Where a job currently is in its pipeline. Stages only ever move forward;
/// `Failed` is reachable from everywhere except `Done`.
///
/// Job-level parameter validation happens while still in `Init`: it gates
/// whether the pipeline starts at all. `Decrypting` spans the parallel
/// per-report phase (decryption, budget-key validation and budget spend
/// interleave per report); `Validating` is the barrier confirming every
/// dispatched report resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JobStage {
    Init,
    Decrypting,
    Validating,
    Aggregating,
    Noising,
    Done,
    Failed,
}

impl JobStage {
    fn can_advance_to(self, next: Self) -> bool {
        use JobStage::*;
        matches!(
            (self, next),
            (Init, Decrypting)
                | (Decrypting, Validating)
                | (Validating, Aggregating)
                | (Aggregating, Noising)
                | (Noising, Done)
        ) || (next == Failed && !matches!(self, Done | Failed))
    }
}

/// A stage transition the pipeline is not allowed to make. Indicates a bug in
/// the engine, not a property of the job.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("illegal job stage transition from {from:?} to {to:?}")]
pub struct StageError {
    pub from: JobStage,
    pub to: JobStage,
}

struct StageTracker {
    current: JobStage,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            current: JobStage::Init,
        }
    }

    fn advance(&mut self, next: JobStage) -> Result<(), StageError> {
        if !self.current.can_advance_to(next) {
            return Err(StageError {
                from: self.current,
                to: next,
            });
        }
        tracing::debug!(from = ?self.current, to = ?next, "job stage");
        self.current = next;
        Ok(())
    }

    fn fail(&mut self) {
        if self.current.can_advance_to(JobStage::Failed) {
            self.current = JobStage::Failed;
        }
    }
}

/// Result of the blocking half of one report's trip: either the decrypted
/// report, cleared for folding on the compute pool, or an early resolution.
enum PreparedReport {
    Cleared(Report),
    Resolved(ReportOutcome),
}

/// Resolution of one report's trip through the pipeline.
enum ReportOutcome {
    /// Contributions folded into the histogram.
    Counted,
    /// A report with this id was already counted; skipped without touching
    /// the privacy budget again.
    Duplicate,
    /// Excluded from the histogram, with the diagnostic to record.
    Excluded(ErrorMessage),
    /// The whole job must abort.
    Fatal(Error),
}

/// What a successfully processed job produces.
#[derive(Debug)]
pub struct JobOutcome {
    pub results: AggregatedResults,
    pub error_summary: ErrorSummary,
}

/// Runs the aggregation pipeline for one job at a time.
///
/// Construction binds the worker-wide collaborators (decryption keys, budget
/// bridge, pools); per-job inputs arrive through [`process`].
///
/// [`process`]: AggregationEngine::process
pub struct AggregationEngine<K> {
    config: WorkerConfig,
    key_registry: Arc<K>,
    budget_bridge: Arc<dyn PrivacyBudgetingServiceBridge>,
    noise_runner: NoisedAggregationRunner,
    blocking: RuntimeHandle,
    non_blocking: RuntimeHandle,
}

impl<K: PrivateKeyRegistry> AggregationEngine<K> {
    /// ## Errors
    /// If the worker configuration is invalid.
    pub fn new(
        config: WorkerConfig,
        key_registry: Arc<K>,
        budget_bridge: Arc<dyn PrivacyBudgetingServiceBridge>,
        pools: &WorkerPools,
    ) -> Res<Self> {
        config.validate()?;
        let noise_runner = NoisedAggregationRunner::from_config(&config)?;
        Ok(Self {
            config,
            key_registry,
            budget_bridge,
            noise_runner,
            blocking: pools.blocking(),
            non_blocking: pools.non_blocking(),
        })
    }

    /// Runs one job through the pipeline.
    ///
    /// ## Errors
    /// On invalid job parameters, a failing report or domain source, an
    /// unreachable budget service, or a bucket sum overflow. Any of these
    /// stops scheduling new report tasks, drains the ones in flight, and
    /// fails the job without producing a result.
    pub async fn process(
        &self,
        job: &Job,
        report_source: &dyn ReportSource,
        domain_source: &dyn OutputDomainSource,
    ) -> Res<JobOutcome> {
        let mut stage = StageTracker::new();
        let outcome = self.run(job, report_source, domain_source, &mut stage).await;
        if outcome.is_err() {
            stage.fail();
        }
        outcome
    }

    async fn run(
        &self,
        job: &Job,
        report_source: &dyn ReportSource,
        domain_source: &dyn OutputDomainSource,
        stage: &mut StageTracker,
    ) -> Res<JobOutcome> {
        // the single gate before any report task is scheduled
        JobValidator::validate(Some(job), self.config.domain_optional)?;

        stage.advance(JobStage::Decrypting)?;
        let declared_domain: Option<BTreeSet<u128>> = if job.parameters.has_output_domain() {
            Some(
                domain_source
                    .read_domain(job)
                    .await
                    .map_err(Error::DomainSource)?,
            )
        } else {
            None
        };
        let reports = report_source
            .read_reports(job)
            .await
            .map_err(Error::ReportSource)?;

        let debug_run = job.parameters.debug_run;
        let accumulator = Arc::new(BucketAccumulator::new());
        let stop = Arc::new(AtomicBool::new(false));

        // Each report is decrypted, validated and budgeted on the blocking
        // pool, then its contributions fold into the histogram on the compute
        // pool, with at most `active_work` reports in flight. A fatal outcome
        // raises `stop`, which ends scheduling while the tasks already in
        // flight drain through the buffer.
        let stop_reading = Arc::clone(&stop);
        let key_registry = Arc::clone(&self.key_registry);
        let budget_bridge = Arc::clone(&self.budget_bridge);
        let task_accumulator = Arc::clone(&accumulator);
        let blocking = self.blocking.clone();
        let non_blocking = self.non_blocking.clone();
        let mut outcomes = reports
            .take_while(move |_| future::ready(!stop_reading.load(Ordering::Acquire)))
            .map(move |item| {
                let key_registry = Arc::clone(&key_registry);
                let budget_bridge = Arc::clone(&budget_bridge);
                let accumulator = Arc::clone(&task_accumulator);
                let blocking = blocking.clone();
                let non_blocking = non_blocking.clone();
                async move {
                    let encrypted = match item {
                        Err(source_error) => {
                            return ReportOutcome::Fatal(Error::ReportSource(source_error));
                        }
                        Ok(encrypted) => encrypted,
                    };
                    let prepared = blocking.spawn(prepare_report(
                        encrypted,
                        key_registry,
                        budget_bridge,
                        Arc::clone(&accumulator),
                    ));
                    let report = match prepared.await {
                        Ok(PreparedReport::Cleared(report)) => report,
                        Ok(PreparedReport::Resolved(outcome)) => return outcome,
                        Err(join_error) => {
                            return ReportOutcome::Fatal(Error::RuntimeError(join_error));
                        }
                    };
                    let folded = non_blocking
                        .spawn(async move { fold_report(&report, &accumulator, debug_run) });
                    match folded.await {
                        Ok(outcome) => outcome,
                        Err(join_error) => ReportOutcome::Fatal(Error::RuntimeError(join_error)),
                    }
                }
            })
            .buffer_unordered(self.config.active_work.get());

        let mut error_summary = ErrorSummary::default();
        let mut fatal: Option<Error> = None;
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                ReportOutcome::Counted => {}
                ReportOutcome::Duplicate => {
                    tracing::debug!(job_id = %job.job_id, "skipped replayed report");
                }
                ReportOutcome::Excluded(diagnostic) => {
                    tracing::debug!(
                        job_id = %job.job_id,
                        category = %diagnostic.category,
                        "report excluded from aggregation"
                    );
                    error_summary.record(diagnostic.category);
                }
                ReportOutcome::Fatal(error) => {
                    stop.store(true, Ordering::Release);
                    if fatal.is_none() {
                        fatal = Some(error);
                    }
                }
            }
        }
        drop(outcomes);
        if let Some(error) = fatal {
            return Err(error);
        }
        stage.advance(JobStage::Validating)?;

        stage.advance(JobStage::Aggregating)?;
        let merge_accumulator = Arc::clone(&accumulator);
        let (reconciliation, debug_buckets) = self
            .non_blocking
            .spawn(async move {
                let (observed, debug_buckets) = merge_accumulator.snapshot();
                (reconcile(observed, declared_domain.as_ref()), debug_buckets)
            })
            .await?;

        stage.advance(JobStage::Noising)?;
        let noise_runner = self.noise_runner.clone();
        let results = self
            .non_blocking
            .spawn(async move { noise_runner.noise(&reconciliation, &debug_buckets, debug_run) })
            .await?;

        stage.advance(JobStage::Done)?;
        Ok(JobOutcome {
            results,
            error_summary,
        })
    }
}

/// Takes one encrypted report through decryption, budget-key validation and
/// budget consumption. Runs on the blocking pool; both decryption-key lookup
/// and the budget spend may stall on external calls.
async fn prepare_report<K: PrivateKeyRegistry>(
    encrypted: EncryptedReport,
    key_registry: Arc<K>,
    budget_bridge: Arc<dyn PrivacyBudgetingServiceBridge>,
    accumulator: Arc<BucketAccumulator>,
) -> PreparedReport {
    let report = match encrypted.decrypt(&*key_registry) {
        Ok(report) => report,
        Err(err) => {
            return PreparedReport::Resolved(ReportOutcome::Excluded(ErrorMessage::from(&err)));
        }
    };

    let Some(validator) = PrivacyBudgetKeyValidator::for_report(&report.shared_info) else {
        return PreparedReport::Resolved(ReportOutcome::Excluded(required_field_invalid()));
    };
    if let Some(diagnostic) = validator.validate(&report.shared_info) {
        return PreparedReport::Resolved(ReportOutcome::Excluded(diagnostic));
    }

    // Claim before spending budget: a replayed report must neither be counted
    // twice nor charged twice.
    if !accumulator.begin_report(&report.shared_info.report_id) {
        return PreparedReport::Resolved(ReportOutcome::Duplicate);
    }

    let key = PrivacyBudgetKey::derive(&report.shared_info);
    match budget_bridge.consume_budget(&key).await {
        Ok(BudgetOutcome::Granted) => PreparedReport::Cleared(report),
        Ok(BudgetOutcome::Exhausted) => {
            PreparedReport::Resolved(ReportOutcome::Excluded(ErrorMessage {
                category: ErrorCategory::PrivacyBudgetExhausted,
                detailed_message: format!("no privacy budget left for key {key}"),
            }))
        }
        Err(err) => {
            PreparedReport::Resolved(ReportOutcome::Fatal(Error::BudgetBridgeUnavailable(err.0)))
        }
    }
}

/// Folds a cleared report's contributions into the shared histogram. Runs on
/// the compute pool.
fn fold_report(report: &Report, accumulator: &BucketAccumulator, debug_run: bool) -> ReportOutcome {
    let mark_debug = debug_run && report.shared_info.debug_mode;
    for contribution in &report.contributions {
        if let Err(overflow) = accumulator.accumulate(contribution) {
            return ReportOutcome::Fatal(Error::NumericOverflow {
                bucket: overflow.bucket,
            });
        }
        if mark_debug {
            accumulator.mark_debug(contribution.bucket);
        }
    }

    ReportOutcome::Counted
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand_core::SeedableRng;
    use tokio::runtime::Builder;

    use super::*;
    use crate::{
        budget::{BudgetUnavailableError, InMemoryPrivacyBudget, UnlimitedPrivacyBudget},
        hpke::{KeyPair, KeyRegistry},
        test_fixture::{
            encrypt_all, encrypt_raw_payload, histogram_report, setup_logging, shared_info,
            test_job, InMemoryDomainSource, InMemoryReportSource, UnavailableBudget,
        },
        validation::InvalidJobError,
    };

    fn run_job(
        config: WorkerConfig,
        budget: Arc<dyn PrivacyBudgetingServiceBridge>,
        registry: Arc<KeyRegistry<KeyPair>>,
        job: &Job,
        source: &InMemoryReportSource,
        domain: &InMemoryDomainSource,
    ) -> Res<JobOutcome> {
        setup_logging();
        let pools = WorkerPools::new(&config).unwrap();
        let engine = AggregationEngine::new(config, registry, budget, &pools).unwrap();
        let rt = Builder::new_current_thread().build().unwrap();
        rt.block_on(engine.process(job, source, domain))
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            no_noising: true,
            ..WorkerConfig::default()
        }
    }

    fn registry() -> Arc<KeyRegistry<KeyPair>> {
        let mut rng = StdRng::seed_from_u64(180);
        Arc::new(KeyRegistry::random(1, &mut rng))
    }

    fn sums_of(outcome: &JobOutcome) -> BTreeMap<u128, i64> {
        outcome
            .results
            .facts
            .iter()
            .map(|f| (f.bucket, f.metric))
            .collect()
    }

    #[test]
    fn sums_reports_against_declared_domain() {
        let registry = registry();
        let reports = vec![
            histogram_report("11111111-aaaa-4bbb-8ccc-000000000001", &[(1, 10), (2, 5)]),
            histogram_report("11111111-aaaa-4bbb-8ccc-000000000002", &[(1, -3)]),
        ];
        let source = InMemoryReportSource::new(encrypt_all(&reports, &registry));
        let domain = InMemoryDomainSource::new([1, 2, 9]);

        let outcome = run_job(
            test_config(),
            Arc::new(UnlimitedPrivacyBudget),
            registry,
            &test_job("job-1"),
            &source,
            &domain,
        )
        .unwrap();

        assert_eq!(BTreeMap::from([(1, 7), (2, 5), (9, 0)]), sums_of(&outcome));
        assert!(outcome.error_summary.is_empty());
    }

    #[test]
    fn budget_exhaustion_excludes_reports_without_failing_the_job() {
        let registry = registry();
        // same origin, so both reports share one budget key
        let reports = vec![
            histogram_report("11111111-aaaa-4bbb-8ccc-000000000001", &[(1, 10)]),
            histogram_report("11111111-aaaa-4bbb-8ccc-000000000002", &[(1, 10)]),
        ];
        let source = InMemoryReportSource::new(encrypt_all(&reports, &registry));
        let domain = InMemoryDomainSource::new([1]);

        let outcome = run_job(
            test_config(),
            Arc::new(InMemoryPrivacyBudget::new(1)),
            registry,
            &test_job("job-1"),
            &source,
            &domain,
        )
        .unwrap();

        assert_eq!(BTreeMap::from([(1, 10)]), sums_of(&outcome));
        assert_eq!(
            1,
            outcome
                .error_summary
                .count(ErrorCategory::PrivacyBudgetExhausted)
        );
    }

    #[test]
    fn bucket_overflow_fails_the_job() {
        let registry = registry();
        let reports = vec![
            histogram_report("11111111-aaaa-4bbb-8ccc-000000000001", &[(7, i64::MAX)]),
            histogram_report("11111111-aaaa-4bbb-8ccc-000000000002", &[(7, 1)]),
        ];
        let source = InMemoryReportSource::new(encrypt_all(&reports, &registry));
        let domain = InMemoryDomainSource::new([7]);

        let err = run_job(
            test_config(),
            Arc::new(UnlimitedPrivacyBudget),
            registry,
            &test_job("job-1"),
            &source,
            &domain,
        )
        .unwrap_err();

        assert!(matches!(err, Error::NumericOverflow { bucket: 7 }));
    }

    #[test]
    fn unreachable_budget_service_fails_the_job() {
        let registry = registry();
        let reports = vec![histogram_report(
            "11111111-aaaa-4bbb-8ccc-000000000001",
            &[(1, 10)],
        )];
        let source = InMemoryReportSource::new(encrypt_all(&reports, &registry));
        let domain = InMemoryDomainSource::new([1]);

        let err = run_job(
            test_config(),
            Arc::new(UnavailableBudget),
            registry,
            &test_job("job-1"),
            &source,
            &domain,
        )
        .unwrap_err();

        assert!(matches!(err, Error::BudgetBridgeUnavailable(_)));
    }

    #[test]
    fn replayed_report_is_counted_and_charged_once() {
        let registry = registry();
        let report = histogram_report("11111111-aaaa-4bbb-8ccc-000000000001", &[(1, 10)]);
        let mut encrypted = encrypt_all(&[report.clone()], &registry);
        encrypted.extend(encrypt_all(&[report], &registry));
        let source = InMemoryReportSource::new(encrypted);
        let domain = InMemoryDomainSource::new([1]);

        let budget = Arc::new(InMemoryPrivacyBudget::new(1));
        let outcome = run_job(
            test_config(),
            Arc::clone(&budget) as Arc<dyn PrivacyBudgetingServiceBridge>,
            registry,
            &test_job("job-1"),
            &source,
            &domain,
        )
        .unwrap();

        assert_eq!(BTreeMap::from([(1, 10)]), sums_of(&outcome));
        assert!(outcome.error_summary.is_empty());
    }

    #[test]
    fn undecryptable_report_is_excluded_and_counted() {
        let registry = registry();
        let good = histogram_report("11111111-aaaa-4bbb-8ccc-000000000001", &[(1, 10)]);
        let bad = histogram_report("11111111-aaaa-4bbb-8ccc-000000000002", &[(2, 5)]);

        let mut encrypted = encrypt_all(&[good, bad], &registry);
        // flip a ciphertext byte so the AEAD tag check fails
        let mut payload = encrypted[1].payload.to_vec();
        payload[0] ^= 0xff;
        encrypted[1].payload = payload.into();

        let source = InMemoryReportSource::new(encrypted);
        let domain = InMemoryDomainSource::new([1, 2]);

        let outcome = run_job(
            test_config(),
            Arc::new(UnlimitedPrivacyBudget),
            registry,
            &test_job("job-1"),
            &source,
            &domain,
        )
        .unwrap();

        assert_eq!(BTreeMap::from([(1, 10), (2, 0)]), sums_of(&outcome));
        assert_eq!(1, outcome.error_summary.count(ErrorCategory::DecryptionError));
    }

    #[test]
    fn unsupported_api_version_is_excluded() {
        let registry = registry();
        let mut report = histogram_report("11111111-aaaa-4bbb-8ccc-000000000001", &[(1, 10)]);
        report.shared_info.version = "9.9".to_owned();

        let source = InMemoryReportSource::new(encrypt_all(&[report], &registry));
        let domain = InMemoryDomainSource::new([1]);

        let outcome = run_job(
            test_config(),
            Arc::new(UnlimitedPrivacyBudget),
            registry,
            &test_job("job-1"),
            &source,
            &domain,
        )
        .unwrap();

        assert_eq!(BTreeMap::from([(1, 0)]), sums_of(&outcome));
        assert_eq!(
            1,
            outcome
                .error_summary
                .count(ErrorCategory::RequiredSharedInfoFieldInvalid)
        );
    }

    #[test]
    fn invalid_job_fails_before_any_report_is_read() {
        let registry = registry();
        let mut job = test_job("job-1");
        job.parameters.attribution_report_to = None;

        // a poisoned source proves reports are never pulled
        let source = InMemoryReportSource::from_items(vec![Err("must not be read".into())]);
        let domain = InMemoryDomainSource::new([1]);

        let err = run_job(
            test_config(),
            Arc::new(UnlimitedPrivacyBudget),
            registry,
            &job,
            &source,
            &domain,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            Error::InvalidArgument(InvalidJobError::MissingAttributionReportTo { .. })
        ));
    }

    #[test]
    fn failing_domain_source_fails_the_job() {
        let registry = registry();
        let source = InMemoryReportSource::new(Vec::new());
        let domain = InMemoryDomainSource::failing("domain bucket gone");

        let err = run_job(
            test_config(),
            Arc::new(UnlimitedPrivacyBudget),
            registry,
            &test_job("job-1"),
            &source,
            &domain,
        )
        .unwrap_err();

        assert!(matches!(err, Error::DomainSource(_)));
    }

    #[test]
    fn unparsable_payloads_are_excluded_and_counted() {
        let registry = registry();
        let good = histogram_report("11111111-aaaa-4bbb-8ccc-000000000001", &[(1, 10)]);

        let mut encrypted = encrypt_all(&[good], &registry);
        // decrypts fine, but the plaintext is not a payload at all
        encrypted.push(encrypt_raw_payload(
            &shared_info("11111111-aaaa-4bbb-8ccc-000000000002"),
            b"not a payload",
            &registry,
        ));
        // well-formed JSON carrying an operation the worker does not support
        encrypted.push(encrypt_raw_payload(
            &shared_info("11111111-aaaa-4bbb-8ccc-000000000003"),
            br#"{"operation":"count","data":[]}"#,
            &registry,
        ));

        let source = InMemoryReportSource::new(encrypted);
        let domain = InMemoryDomainSource::new([1]);

        let outcome = run_job(
            test_config(),
            Arc::new(UnlimitedPrivacyBudget),
            registry,
            &test_job("job-1"),
            &source,
            &domain,
        )
        .unwrap();

        assert_eq!(BTreeMap::from([(1, 10)]), sums_of(&outcome));
        assert_eq!(
            2,
            outcome.error_summary.count(ErrorCategory::PayloadParseError)
        );
    }

    #[derive(Default)]
    struct ThreadRecordingBudget {
        names: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl PrivacyBudgetingServiceBridge for ThreadRecordingBudget {
        async fn consume_budget(
            &self,
            _key: &PrivacyBudgetKey,
        ) -> Result<BudgetOutcome, BudgetUnavailableError> {
            self.names
                .lock()
                .unwrap()
                .push(std::thread::current().name().map(str::to_owned));
            Ok(BudgetOutcome::Granted)
        }
    }

    #[test]
    fn report_preparation_runs_on_the_blocking_pool() {
        let registry = registry();
        let reports = vec![
            histogram_report("11111111-aaaa-4bbb-8ccc-000000000001", &[(1, 10)]),
            histogram_report("11111111-aaaa-4bbb-8ccc-000000000002", &[(2, 5)]),
        ];
        let source = InMemoryReportSource::new(encrypt_all(&reports, &registry));
        let domain = InMemoryDomainSource::new([1, 2]);

        let budget = Arc::new(ThreadRecordingBudget::default());
        run_job(
            test_config(),
            Arc::clone(&budget) as Arc<dyn PrivacyBudgetingServiceBridge>,
            registry,
            &test_job("job-1"),
            &source,
            &domain,
        )
        .unwrap();

        let names = budget.names.lock().unwrap();
        assert_eq!(2, names.len());
        assert!(names
            .iter()
            .all(|name| name.as_deref() == Some("agg-blocking")));
    }

    #[test]
    fn failing_report_source_fails_the_job() {
        let registry = registry();
        let good = histogram_report("11111111-aaaa-4bbb-8ccc-000000000001", &[(1, 10)]);
        let mut items: Vec<_> = encrypt_all(&[good], &registry).into_iter().map(Ok).collect();
        items.push(Err("blob store gone".into()));

        let source = InMemoryReportSource::from_items(items);
        let domain = InMemoryDomainSource::new([1]);

        let err = run_job(
            test_config(),
            Arc::new(UnlimitedPrivacyBudget),
            registry,
            &test_job("job-1"),
            &source,
            &domain,
        )
        .unwrap_err();

        assert!(matches!(err, Error::ReportSource(_)));
    }

    #[test]
    fn debug_run_exposes_unnoised_sums_for_optin_reports() {
        let registry = registry();
        let mut debug_report =
            histogram_report("11111111-aaaa-4bbb-8ccc-000000000001", &[(1, 10)]);
        debug_report.shared_info.debug_mode = true;
        let plain_report = histogram_report("11111111-aaaa-4bbb-8ccc-000000000002", &[(2, 5)]);

        let source = InMemoryReportSource::new(encrypt_all(&[debug_report, plain_report], &registry));
        let domain = InMemoryDomainSource::new([1, 2]);

        let mut job = test_job("job-1");
        job.parameters.debug_run = true;

        let outcome = run_job(
            test_config(),
            Arc::new(UnlimitedPrivacyBudget),
            registry,
            &job,
            &source,
            &domain,
        )
        .unwrap();

        let by_bucket: BTreeMap<u128, Option<i64>> = outcome
            .results
            .facts
            .iter()
            .map(|f| (f.bucket, f.unnoised_metric))
            .collect();
        assert_eq!(Some(&Some(10)), by_bucket.get(&1));
        assert_eq!(Some(&None), by_bucket.get(&2));
        assert!(outcome.results.debug_facts.is_some());
    }

    mod stages {
        use super::*;

        #[test]
        fn happy_path_transitions() {
            let mut tracker = StageTracker::new();
            for next in [
                JobStage::Decrypting,
                JobStage::Validating,
                JobStage::Aggregating,
                JobStage::Noising,
                JobStage::Done,
            ] {
                tracker.advance(next).unwrap();
            }
            assert_eq!(JobStage::Done, tracker.current);
        }

        #[test]
        fn stages_cannot_be_skipped() {
            let mut tracker = StageTracker::new();
            let err = tracker.advance(JobStage::Aggregating).unwrap_err();
            assert_eq!(
                StageError {
                    from: JobStage::Init,
                    to: JobStage::Aggregating
                },
                err
            );
        }

        #[test]
        fn any_live_stage_can_fail_but_done_cannot() {
            assert!(JobStage::Init.can_advance_to(JobStage::Failed));
            assert!(JobStage::Noising.can_advance_to(JobStage::Failed));
            assert!(!JobStage::Done.can_advance_to(JobStage::Failed));
            assert!(!JobStage::Failed.can_advance_to(JobStage::Failed));
        }
    }
}
