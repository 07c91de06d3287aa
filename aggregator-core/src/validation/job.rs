use crate::job::Job;

/// Job-level parameter failure. Fatal: no report of the job is processed.
///
/// Unlike per-report privacy-budget validation, these messages are
/// user-facing and intentionally name the requirement that was unmet.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidJobError {
    #[error("Job metadata not found.")]
    MissingJob,
    #[error("Job parameters does not have an attribution_report_to field for the Job '{job_id}'.")]
    MissingAttributionReportTo { job_id: String },
    #[error(
        "Job parameters for the job '{job_id}' does not have output domain location specified in \
         'output_domain_bucket_name' and 'output_domain_blob_prefix' fields. Please refer to the \
         API documentation for output domain parameters at \
         https://github.com/privacysandbox/aggregation-service/blob/main/docs/API.md"
    )]
    MissingOutputDomain { job_id: String },
}

/// Single gate run once per job, before any report task is scheduled.
pub struct JobValidator;

impl JobValidator {
    /// Checks, in order: the job is present; `attribution_report_to` is
    /// present and non-empty; and, unless `domain_optional`, both output
    /// domain location fields are present and non-empty.
    ///
    /// ## Errors
    /// Fails fast with the first unmet requirement.
    pub fn validate(job: Option<&Job>, domain_optional: bool) -> Result<(), InvalidJobError> {
        let job = job.ok_or(InvalidJobError::MissingJob)?;

        if !job
            .parameters
            .attribution_report_to
            .as_deref()
            .is_some_and(|v| !v.is_empty())
        {
            return Err(InvalidJobError::MissingAttributionReportTo {
                job_id: job.job_id.clone(),
            });
        }

        if !domain_optional && !job.parameters.has_output_domain() {
            return Err(InvalidJobError::MissingOutputDomain {
                job_id: job.job_id.clone(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobParameters, JobStatus};

    fn job_with_parameters(parameters: JobParameters) -> Job {
        Job {
            job_id: String::new(),
            input_location: "reports/".to_owned(),
            parameters,
            status: JobStatus::Received,
        }
    }

    #[test]
    fn no_attribution_report_to_key_fails() {
        let job = job_with_parameters(JobParameters::default());

        let err = JobValidator::validate(Some(&job), false).unwrap_err();
        assert!(err
            .to_string()
            .contains("Job parameters does not have an attribution_report_to field for the Job"));
    }

    #[test]
    fn empty_attribution_report_to_fails() {
        let job = job_with_parameters(JobParameters {
            attribution_report_to: Some(String::new()),
            ..JobParameters::default()
        });

        let err = JobValidator::validate(Some(&job), false).unwrap_err();
        assert!(err
            .to_string()
            .contains("Job parameters does not have an attribution_report_to field for the Job"));
    }

    #[test]
    fn no_output_domain_domain_optional_succeeds() {
        let job = job_with_parameters(JobParameters {
            attribution_report_to: Some("foo.com".to_owned()),
            ..JobParameters::default()
        });

        JobValidator::validate(Some(&job), true).unwrap();
    }

    #[test]
    fn no_output_domain_domain_not_optional_fails() {
        let job = job_with_parameters(JobParameters {
            attribution_report_to: Some("foo.com".to_owned()),
            ..JobParameters::default()
        });

        let err = JobValidator::validate(Some(&job), false).unwrap_err();
        assert!(err.to_string().contains(
            "Job parameters for the job '' does not have output domain location specified in \
             'output_domain_bucket_name' and 'output_domain_blob_prefix' fields."
        ));
    }

    #[test]
    fn output_domain_present_domain_not_optional_succeeds() {
        let job = job_with_parameters(JobParameters {
            attribution_report_to: Some("foo.com".to_owned()),
            output_domain_blob_prefix: Some("prefix_".to_owned()),
            output_domain_bucket_name: Some("bucket".to_owned()),
            debug_run: false,
        });

        JobValidator::validate(Some(&job), false).unwrap();
    }

    #[test]
    fn no_job_fails() {
        let err = JobValidator::validate(None, false).unwrap_err();
        assert_eq!("Job metadata not found.", err.to_string());
    }
}
