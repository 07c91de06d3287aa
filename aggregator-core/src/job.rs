use std::{collections::BTreeMap, fmt::{Display, Formatter}};

use serde::{Deserialize, Serialize};

use crate::report::InvalidReportError;

/// Lifecycle of a job as seen by the status collaborator. The worker only
/// ever moves a job forward; `Received` jobs come from the intake service.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobStatus {
    Received,
    InProgress,
    Finished,
    Failed,
}

/// Request parameters attached to a job by the adtech caller.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    /// Origin the aggregatable reports were attributed to. Required.
    pub attribution_report_to: Option<String>,
    /// Location of the declared output domain. Both fields must be present
    /// unless the worker runs with `domain_optional`.
    pub output_domain_bucket_name: Option<String>,
    pub output_domain_blob_prefix: Option<String>,
    /// Debug runs additionally emit unnoised values for reports that opted in.
    #[serde(default)]
    pub debug_run: bool,
}

impl JobParameters {
    /// Whether the job declares an explicit output domain location.
    #[must_use]
    pub fn has_output_domain(&self) -> bool {
        fn present(field: &Option<String>) -> bool {
            field.as_deref().is_some_and(|v| !v.is_empty())
        }
        present(&self.output_domain_bucket_name) && present(&self.output_domain_blob_prefix)
    }
}

/// One unit of work: a batch of encrypted reports to aggregate. Owned by the
/// external job service; the core reads the parameters and reports outcomes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    /// Location of the encrypted report batch, interpreted by the report
    /// source collaborator.
    pub input_location: String,
    pub parameters: JobParameters,
    pub status: JobStatus,
}

/// Category of a per-report failure. Every excluded report is attributable to
/// exactly one of these.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum ErrorCategory {
    DecryptionError,
    PayloadParseError,
    RequiredSharedInfoFieldInvalid,
    PrivacyBudgetExhausted,
}

impl Display for ErrorCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::DecryptionError => "DECRYPTION_ERROR",
            Self::PayloadParseError => "PAYLOAD_PARSE_ERROR",
            Self::RequiredSharedInfoFieldInvalid => "REQUIRED_SHAREDINFO_FIELD_INVALID",
            Self::PrivacyBudgetExhausted => "PRIVACY_BUDGET_EXHAUSTED",
        };
        f.write_str(name)
    }
}

/// Diagnostic attached to a report excluded from aggregation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub category: ErrorCategory,
    pub detailed_message: String,
}

impl From<&InvalidReportError> for ErrorMessage {
    fn from(err: &InvalidReportError) -> Self {
        let category = match err {
            InvalidReportError::Crypt(_) | InvalidReportError::NonAsciiString(_) => {
                ErrorCategory::DecryptionError
            }
            InvalidReportError::Payload(_) | InvalidReportError::UnsupportedOperation(_) => {
                ErrorCategory::PayloadParseError
            }
        };
        Self {
            category,
            detailed_message: err.to_string(),
        }
    }
}

/// Per-category counts of excluded reports, attached to the job result so
/// that partial failures stay visible without aborting the job.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    counts: BTreeMap<ErrorCategory, u64>,
    total: u64,
}

impl ErrorSummary {
    pub fn record(&mut self, category: ErrorCategory) {
        *self.counts.entry(category).or_insert(0) += 1;
        self.total += 1;
    }

    #[must_use]
    pub fn count(&self, category: ErrorCategory) -> u64 {
        self.counts.get(&category).copied().unwrap_or(0)
    }

    /// Total number of reports excluded from aggregation.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = (ErrorCategory, u64)> + '_ {
        self.counts.iter().map(|(category, count)| (*category, *count))
    }
}

/// Outcome reported to the job-status collaborator when processing ends.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResultInfo {
    pub status: JobStatus,
    pub message: String,
    pub error_summary: ErrorSummary,
}
