use crate::report::{Api, KeyIdentifier, NonAsciiStringError};

const DOMAIN: &str = "aggregation-service";

/// Represents the [`info`] part of the receiver context, that is: application
/// specific data for each encryption.
///
/// The aggregation service uses the key identifier, measurement API, API
/// version and the reporting origin to authenticate the encryption of a
/// report payload. It is not guaranteed that the same receiver can be used
/// for anything else.
///
/// [`info`]: https://www.rfc-editor.org/rfc/rfc9180.html#name-creating-the-encryption-con
#[derive(Clone)]
pub struct Info<'a> {
    key_id: KeyIdentifier,
    api: Api,
    version: &'a str,
    reporting_origin: &'a str,
}

impl<'a> Info<'a> {
    /// Creates a new instance.
    ///
    /// ## Errors
    /// if the version or reporting origin is not a valid ASCII string.
    pub fn new(
        key_id: KeyIdentifier,
        api: Api,
        version: &'a str,
        reporting_origin: &'a str,
    ) -> Result<Self, NonAsciiStringError> {
        // If the types of errors returned from this function change, then the validation in
        // `EncryptedReport::decrypt` may need to change as well.
        if !version.is_ascii() {
            return Err(version.into());
        }

        if !reporting_origin.is_ascii() {
            return Err(reporting_origin.into());
        }

        Ok(Self {
            key_id,
            api,
            version,
            reporting_origin,
        })
    }

    pub(super) fn key_id(&self) -> KeyIdentifier {
        self.key_id
    }

    /// Converts this instance into an owned byte slice that can further be used to create HPKE
    /// sender or receiver context.
    pub(crate) fn to_bytes(&self) -> Box<[u8]> {
        let api = self.api.as_str();
        let info_len = DOMAIN.len()
            + api.len()
            + self.version.len()
            + self.reporting_origin.len()
            + 4 // account for 4 delimiters
            + std::mem::size_of_val(&self.key_id);
        let mut r = Vec::with_capacity(info_len);

        r.extend_from_slice(DOMAIN.as_bytes());
        r.push(0);
        r.extend_from_slice(api.as_bytes());
        r.push(0);
        r.extend_from_slice(self.version.as_bytes());
        r.push(0);
        r.extend_from_slice(self.reporting_origin.as_bytes());
        r.push(0);

        r.push(self.key_id);

        debug_assert_eq!(
            r.len(),
            info_len,
            "HPKE Info length estimation is incorrect and leads to extra allocation or wasted memory"
        );

        r.into_boxed_slice()
    }
}
