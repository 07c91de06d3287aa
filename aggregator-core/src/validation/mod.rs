//! Per-report and per-job validation gates.
//!
//! Report-level validation decides whether a privacy budget key may be
//! derived from a report's `SharedInfo`; it deliberately reports a fixed
//! generic message so that the response does not disclose which identity
//! field was malformed. Job-level validation runs once per job before any
//! report is touched and is allowed to name the missing parameter.

mod job;

pub use job::{InvalidJobError, JobValidator};

use crate::{
    job::{ErrorCategory, ErrorMessage},
    report::{Api, SharedInfo, VERSION_0_1, VERSION_1_0},
};

/// Fixed diagnostic for privacy-budget-key validation failures. Field
/// specifics are intentionally withheld.
pub const NULL_OR_INVALID_SHAREDINFO_FIELD_ERROR: &str =
    "One or more required fields in report's SharedInfo are null or invalid.";

/// Validates that every `SharedInfo` field required to derive the privacy
/// budget key of one API version is present and non-empty.
///
/// Closed set dispatched on `(api, version)`: supporting a new API version
/// means adding a variant, not touching the dispatch logic.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PrivacyBudgetKeyValidator {
    AttributionReportingV01,
    AttributionReportingV10,
    ProtectedAudienceV01,
}

impl PrivacyBudgetKeyValidator {
    /// Selects the validator for a report, or `None` when the API version is
    /// not supported by this worker.
    #[must_use]
    pub fn for_report(shared_info: &SharedInfo) -> Option<Self> {
        match (shared_info.api, shared_info.version.as_str()) {
            (Api::AttributionReporting, VERSION_0_1) => Some(Self::AttributionReportingV01),
            (Api::AttributionReporting, VERSION_1_0) => Some(Self::AttributionReportingV10),
            (Api::ProtectedAudience, VERSION_0_1) => Some(Self::ProtectedAudienceV01),
            _ => None,
        }
    }

    /// Returns `None` when every required field is usable, or the generic
    /// `REQUIRED_SHAREDINFO_FIELD_INVALID` diagnostic otherwise. Pure
    /// function, no side effects.
    #[must_use]
    pub fn validate(&self, shared_info: &SharedInfo) -> Option<ErrorMessage> {
        let common_fields_valid = !shared_info.version.is_empty()
            && !shared_info.report_id.is_empty()
            && !shared_info.reporting_origin.is_empty();

        let valid = match self {
            Self::AttributionReportingV01 | Self::ProtectedAudienceV01 => common_fields_valid,
            Self::AttributionReportingV10 => {
                common_fields_valid
                    && shared_info
                        .attribution_destination
                        .as_deref()
                        .is_some_and(|v| !v.is_empty())
                    && shared_info.source_registration_time.is_some()
            }
        };

        if valid {
            None
        } else {
            Some(required_field_invalid())
        }
    }
}

/// The diagnostic for an unsupported API version. Folded into the same
/// category as a malformed field: the budget key cannot be derived either way.
#[must_use]
pub fn required_field_invalid() -> ErrorMessage {
    ErrorMessage {
        category: ErrorCategory::RequiredSharedInfoFieldInvalid,
        detailed_message: NULL_OR_INVALID_SHAREDINFO_FIELD_ERROR.to_owned(),
    }
}
