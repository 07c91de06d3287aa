use std::fmt::{Display, Formatter};

use bytes::Bytes;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::hpke::{
    open_in_place, seal_in_place, CryptError, Info, PrivateKeyRegistry, PublicKeyRegistry,
    Serializable as _,
};

pub type KeyIdentifier = u8;
pub const DEFAULT_KEY_ID: KeyIdentifier = 0;

pub const VERSION_0_1: &str = "0.1";
pub const VERSION_1_0: &str = "1.0";

const OPERATION_HISTOGRAM: &str = "histogram";

/// Measurement API a report originates from. Closed set: supporting a new
/// API means adding a variant here and a privacy-budget-key validator for it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Api {
    #[serde(rename = "attribution-reporting")]
    AttributionReporting,
    #[serde(rename = "protected-audience")]
    ProtectedAudience,
}

impl Api {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Api::AttributionReporting => "attribution-reporting",
            Api::ProtectedAudience => "protected-audience",
        }
    }
}

impl Display for Api {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one report, sent in the clear alongside the ciphertext for
/// routing and validation. Immutable once decoded.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SharedInfo {
    pub api: Api,
    pub version: String,
    /// UUID assigned by the client at report time.
    pub report_id: String,
    pub reporting_origin: String,
    /// Seconds since the unix epoch.
    pub scheduled_report_time: u64,
    /// Required by Attribution-Reporting v1.0 and later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution_destination: Option<String>,
    /// Required by Attribution-Reporting v1.0 and later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_registration_time: Option<u64>,
    /// Whether this report opted into exposing its unnoised contribution on
    /// debug runs.
    #[serde(default)]
    pub debug_mode: bool,
}

/// Derived identity used to rate-limit how often a given origin/API/version
/// combination may contribute to aggregated queries.
///
/// Must only be derived from a [`SharedInfo`] that passed the
/// privacy-budget-key field validation for its API version; the digest of an
/// empty field would silently alias unrelated reports otherwise.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PrivacyBudgetKey(String);

impl PrivacyBudgetKey {
    #[must_use]
    pub fn derive(shared_info: &SharedInfo) -> Self {
        let mut hasher = Sha256::new();
        for part in [
            shared_info.api.as_str(),
            &shared_info.version,
            &shared_info.reporting_origin,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0]);
        }
        // Versions from 1.0 onwards scope the budget to the attribution
        // destination and the source registration window as well.
        if shared_info.api == Api::AttributionReporting && shared_info.version != VERSION_0_1 {
            hasher.update(
                shared_info
                    .attribution_destination
                    .as_deref()
                    .unwrap_or_default()
                    .as_bytes(),
            );
            hasher.update([0]);
            hasher.update(
                shared_info
                    .source_registration_time
                    .unwrap_or_default()
                    .to_be_bytes(),
            );
        }
        Self(hex::encode(hasher.finalize()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PrivacyBudgetKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub struct NonAsciiStringError {
    input: String,
}

impl Display for NonAsciiStringError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "string contains non-ascii symbols: {}", self.input)
    }
}

impl std::error::Error for NonAsciiStringError {}

impl From<&'_ [u8]> for NonAsciiStringError {
    fn from(input: &[u8]) -> Self {
        Self {
            input: String::from_utf8(
                input
                    .iter()
                    .copied()
                    .flat_map(std::ascii::escape_default)
                    .collect::<Vec<_>>(),
            )
            .unwrap(),
        }
    }
}

impl From<&'_ str> for NonAsciiStringError {
    fn from(input: &str) -> Self {
        Self::from(input.as_bytes())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidReportError {
    #[error("en/decryption failure: {0}")]
    Crypt(#[from] CryptError),
    #[error("bad reporting identity: {0}")]
    NonAsciiString(#[from] NonAsciiStringError),
    #[error("malformed report payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("unsupported payload operation: {0}")]
    UnsupportedOperation(String),
}

/// A single (bucket, value) pair extracted from a decrypted report payload.
/// Many contributions may target the same bucket; they are summed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AggregatableContribution {
    /// 128-bit bucket identifier, rendered as 32 hex characters on the wire.
    #[serde(with = "bucket_hex")]
    pub bucket: u128,
    pub value: i64,
}

/// Decrypted payload body. The container format a report travels in (Avro,
/// CBOR envelopes) belongs to the report source collaborator; by the time a
/// payload reaches this type it is the canonical JSON body.
#[derive(Serialize, Deserialize)]
struct PayloadContents {
    operation: String,
    data: Vec<AggregatableContribution>,
}

/// An encrypted aggregatable report as handed over by the report source.
/// Decrypted exactly once, then discarded after contributing to the
/// histogram (or being recorded as an error).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncryptedReport {
    pub shared_info: SharedInfo,
    pub key_id: KeyIdentifier,
    pub encap_key: Vec<u8>,
    pub payload: Bytes,
}

impl EncryptedReport {
    /// Opens the payload with the decryption key identified by `key_id` and
    /// parses the plaintext contributions.
    ///
    /// The receiver context binds the clear-text identity fields, so a report
    /// whose `SharedInfo` was modified in transit fails here with a crypt
    /// error rather than aggregating under the wrong identity.
    ///
    /// ## Errors
    /// [`InvalidReportError::Crypt`] on key-fetch or ciphertext-integrity
    /// failure, [`InvalidReportError::Payload`] /
    /// [`InvalidReportError::UnsupportedOperation`] on malformed plaintext.
    pub fn decrypt(
        &self,
        key_registry: &impl PrivateKeyRegistry,
    ) -> Result<Report, InvalidReportError> {
        let info = Info::new(
            self.key_id,
            self.shared_info.api,
            &self.shared_info.version,
            &self.shared_info.reporting_origin,
        )?;

        let mut ciphertext = self.payload.to_vec();
        let plaintext = open_in_place(key_registry, &self.encap_key, &mut ciphertext, &info)?;
        let payload: PayloadContents = serde_json::from_slice(plaintext)?;
        if payload.operation != OPERATION_HISTOGRAM {
            return Err(InvalidReportError::UnsupportedOperation(payload.operation));
        }

        Ok(Report {
            shared_info: self.shared_info.clone(),
            contributions: payload.data,
        })
    }
}

/// A decrypted report: identity plus the contributions it makes to the
/// histogram. Owned exclusively by the aggregation step that consumed it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Report {
    pub shared_info: SharedInfo,
    pub contributions: Vec<AggregatableContribution>,
}

impl Report {
    /// Seals this report towards the worker public key identified by
    /// `key_id`. Used by report collectors and test fixtures; the worker
    /// itself only ever opens.
    ///
    /// ## Errors
    /// If there is a problem encrypting the report.
    pub fn encrypt<R: CryptoRng + RngCore>(
        &self,
        key_id: KeyIdentifier,
        key_registry: &impl PublicKeyRegistry,
        rng: &mut R,
    ) -> Result<EncryptedReport, InvalidReportError> {
        let info = Info::new(
            key_id,
            self.shared_info.api,
            &self.shared_info.version,
            &self.shared_info.reporting_origin,
        )?;

        let payload = PayloadContents {
            operation: OPERATION_HISTOGRAM.to_owned(),
            data: self.contributions.clone(),
        };
        let mut plaintext = serde_json::to_vec(&payload)?;

        let (encap_key, ciphertext, tag) =
            seal_in_place(key_registry, &mut plaintext, &info, rng)?;
        let mut sealed = ciphertext.to_vec();
        sealed.extend_from_slice(&tag.to_bytes());

        Ok(EncryptedReport {
            shared_info: self.shared_info.clone(),
            key_id,
            encap_key: encap_key.to_bytes().to_vec(),
            payload: sealed.into(),
        })
    }
}

mod bucket_hex {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bucket: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{bucket:032x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.len() != 32 {
            return Err(D::Error::custom(format!(
                "bucket must be 32 hex characters, got {}",
                raw.len()
            )));
        }
        u128::from_str_radix(&raw, 16).map_err(D::Error::custom)
    }
}
