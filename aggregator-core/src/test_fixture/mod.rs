//! In-memory collaborators and report builders for tests.
//!
//! Everything here implements the same traits the production collaborators
//! do, so a whole worker can be assembled and driven without storage, a key
//! management service or a budget service behind it.
#![allow(clippy::missing_panics_doc)]

use std::{
    collections::BTreeSet,
    sync::{Mutex, Once},
};

use async_trait::async_trait;
use futures::stream;
use rand::thread_rng;

use crate::{
    app::{
        EncryptedReportStream, JobStatusReporter, OutputDomainSource, ReportSource, ResultSink,
    },
    budget::{BudgetOutcome, BudgetUnavailableError, PrivacyBudgetingServiceBridge},
    error::{set_global_panic_hook, BoxError},
    hpke::{seal_in_place, Info, KeyPair, KeyRegistry, Serializable as _},
    job::{Job, JobParameters, JobStatus, ResultInfo},
    noise::AggregatedResults,
    report::{
        AggregatableContribution, Api, EncryptedReport, PrivacyBudgetKey, Report, SharedInfo,
        DEFAULT_KEY_ID, VERSION_0_1,
    },
    telemetry::install_logging,
};

pub const TEST_ORIGIN: &str = "https://www.origin.com";
pub const TEST_SCHEDULED_TIME: u64 = 1_609_459_200;

/// Installs the tracing subscriber and the panic hook once per test binary,
/// no matter how many tests call it.
pub fn setup_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        install_logging();
        set_global_panic_hook();
    });
}

/// Attribution-Reporting v0.1 identity with every budget-key field populated.
#[must_use]
pub fn shared_info(report_id: &str) -> SharedInfo {
    SharedInfo {
        api: Api::AttributionReporting,
        version: VERSION_0_1.to_owned(),
        report_id: report_id.to_owned(),
        reporting_origin: TEST_ORIGIN.to_owned(),
        scheduled_report_time: TEST_SCHEDULED_TIME,
        attribution_destination: None,
        source_registration_time: None,
        debug_mode: false,
    }
}

/// A plaintext histogram report with the given (bucket, value) contributions.
#[must_use]
pub fn histogram_report(report_id: &str, contributions: &[(u128, i64)]) -> Report {
    Report {
        shared_info: shared_info(report_id),
        contributions: contributions
            .iter()
            .map(|&(bucket, value)| AggregatableContribution { bucket, value })
            .collect(),
    }
}

/// Seals each report towards the registry's default key.
///
/// ## Panics
/// If a report cannot be encrypted; fixture reports always can.
#[must_use]
pub fn encrypt_all(reports: &[Report], registry: &KeyRegistry<KeyPair>) -> Vec<EncryptedReport> {
    let mut rng = thread_rng();
    reports
        .iter()
        .map(|report| {
            report
                .encrypt(DEFAULT_KEY_ID, registry, &mut rng)
                .expect("fixture reports are always encryptable")
        })
        .collect()
}

/// Seals an arbitrary plaintext towards the registry's default key, skipping
/// payload encoding entirely. What comes out decrypts fine but need not parse
/// as a histogram payload.
#[must_use]
pub fn encrypt_raw_payload(
    shared_info: &SharedInfo,
    plaintext: &[u8],
    registry: &KeyRegistry<KeyPair>,
) -> EncryptedReport {
    let mut rng = thread_rng();
    let info = Info::new(
        DEFAULT_KEY_ID,
        shared_info.api,
        &shared_info.version,
        &shared_info.reporting_origin,
    )
    .expect("fixture identities are ascii");

    let mut buf = plaintext.to_vec();
    let (encap_key, ciphertext, tag) = seal_in_place(registry, &mut buf, &info, &mut rng)
        .expect("fixture payloads are always encryptable");
    let mut sealed = ciphertext.to_vec();
    sealed.extend_from_slice(&tag.to_bytes());

    EncryptedReport {
        shared_info: shared_info.clone(),
        key_id: DEFAULT_KEY_ID,
        encap_key: encap_key.to_bytes().to_vec(),
        payload: sealed.into(),
    }
}

/// A job with every required parameter filled in, pointing at an in-memory
/// input location.
#[must_use]
pub fn test_job(job_id: &str) -> Job {
    Job {
        job_id: job_id.to_owned(),
        input_location: format!("memory://{job_id}/reports"),
        parameters: JobParameters {
            attribution_report_to: Some("foo.com".to_owned()),
            output_domain_bucket_name: Some("domain-bucket".to_owned()),
            output_domain_blob_prefix: Some("domain/".to_owned()),
            debug_run: false,
        },
        status: JobStatus::Received,
    }
}

/// Serves one batch of reports, then refuses further reads. Item-level
/// failures can be injected through [`from_items`].
///
/// [`from_items`]: InMemoryReportSource::from_items
pub struct InMemoryReportSource {
    items: Mutex<Option<Vec<Result<EncryptedReport, BoxError>>>>,
}

impl InMemoryReportSource {
    #[must_use]
    pub fn new(reports: Vec<EncryptedReport>) -> Self {
        Self::from_items(reports.into_iter().map(Ok).collect())
    }

    #[must_use]
    pub fn from_items(items: Vec<Result<EncryptedReport, BoxError>>) -> Self {
        Self {
            items: Mutex::new(Some(items)),
        }
    }
}

#[async_trait]
impl ReportSource for InMemoryReportSource {
    async fn read_reports(&self, _job: &Job) -> Result<EncryptedReportStream, BoxError> {
        let items = self
            .items
            .lock()
            .unwrap()
            .take()
            .ok_or("report batch already consumed")?;
        Ok(Box::pin(stream::iter(items)))
    }
}

/// Serves a fixed declared output domain, or fails every read.
pub struct InMemoryDomainSource {
    outcome: Result<BTreeSet<u128>, String>,
}

impl InMemoryDomainSource {
    #[must_use]
    pub fn new(buckets: impl IntoIterator<Item = u128>) -> Self {
        Self {
            outcome: Ok(buckets.into_iter().collect()),
        }
    }

    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self {
            outcome: Err(message.to_owned()),
        }
    }
}

#[async_trait]
impl OutputDomainSource for InMemoryDomainSource {
    async fn read_domain(&self, _job: &Job) -> Result<BTreeSet<u128>, BoxError> {
        match &self.outcome {
            Ok(buckets) => Ok(buckets.clone()),
            Err(message) => Err(message.clone().into()),
        }
    }
}

/// Records every result written to it.
#[derive(Default)]
pub struct InMemoryResultSink {
    written: Mutex<Vec<(String, AggregatedResults)>>,
}

impl InMemoryResultSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn written(&self) -> Vec<(String, AggregatedResults)> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for InMemoryResultSink {
    async fn write_results(
        &self,
        job: &Job,
        results: &AggregatedResults,
    ) -> Result<(), BoxError> {
        self.written
            .lock()
            .unwrap()
            .push((job.job_id.clone(), results.clone()));
        Ok(())
    }
}

/// Records every lifecycle update.
#[derive(Default)]
pub struct RecordingStatusReporter {
    in_progress: Mutex<Vec<String>>,
    completed: Mutex<Vec<(String, ResultInfo)>>,
}

impl RecordingStatusReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn in_progress(&self) -> Vec<String> {
        self.in_progress.lock().unwrap().clone()
    }

    #[must_use]
    pub fn completed(&self) -> Vec<(String, ResultInfo)> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobStatusReporter for RecordingStatusReporter {
    async fn mark_in_progress(&self, job_id: &str) -> Result<(), BoxError> {
        self.in_progress.lock().unwrap().push(job_id.to_owned());
        Ok(())
    }

    async fn complete(&self, job_id: &str, result: &ResultInfo) -> Result<(), BoxError> {
        self.completed
            .lock()
            .unwrap()
            .push((job_id.to_owned(), result.clone()));
        Ok(())
    }
}

/// A budget bridge that is always down.
pub struct UnavailableBudget;

#[async_trait]
impl PrivacyBudgetingServiceBridge for UnavailableBudget {
    async fn consume_budget(
        &self,
        _key: &PrivacyBudgetKey,
    ) -> Result<BudgetOutcome, BudgetUnavailableError> {
        Err(BudgetUnavailableError("budget service offline".into()))
    }
}
