//! HPKE primitives for opening aggregatable report payloads.
//!
//! Reports are sealed towards the aggregation worker with the receiver
//! context bound to the report identity (API, version, reporting origin), so
//! a ciphertext routed with tampered clear-text identity fails to open.

use std::io;

use hpke::{
    aead::AeadTag, single_shot_open_in_place_detached, single_shot_seal_in_place_detached,
    OpModeR, OpModeS,
};
use rand_core::{CryptoRng, RngCore};

mod info;
mod registry;

pub use info::Info;
pub use registry::{
    KeyPair, KeyRegistry, PrivateKeyOnly, PrivateKeyRegistry, PublicKeyOnly, PublicKeyRegistry,
};

use crate::report::KeyIdentifier;

/// Aggregation service ciphersuite
type AggKem = hpke::kem::X25519HkdfSha256;
type AggAead = hpke::aead::AesGcm128;
type AggKdf = hpke::kdf::HkdfSha256;

pub type AggPublicKey = <AggKem as hpke::Kem>::PublicKey;
pub type AggPrivateKey = <AggKem as hpke::Kem>::PrivateKey;
pub type AggEncapsulatedKey = <AggKem as hpke::Kem>::EncappedKey;

pub use hpke::{Deserializable, Serializable};

#[derive(Debug, thiserror::Error)]
pub enum CryptError {
    #[error("Unknown key {0}")]
    NoSuchKey(KeyIdentifier),
    #[error("Failed to open ciphertext")]
    Other,
}

impl From<hpke::HpkeError> for CryptError {
    fn from(_value: hpke::HpkeError) -> Self {
        Self::Other
    }
}

impl From<io::Error> for CryptError {
    fn from(_value: io::Error) -> Self {
        Self::Other
    }
}

/// Opens the given ciphertext in place using the secret key that matches the
/// key identifier in `info`, then applying HPKE decryption to the provided
/// ciphertext.
///
/// This function mutates the provided ciphertext slice and replaces it with
/// the plaintext obtained after opening the ciphertext. The result will
/// contain a pointer to the plaintext slice. Note that if the ciphertext
/// slice does not include the authentication tag, decryption will fail.
///
/// ## Errors
/// If the key identifier is unknown to the registry, or the ciphertext cannot
/// be opened for any reason.
pub fn open_in_place<'a>(
    key_registry: &impl PrivateKeyRegistry,
    enc: &[u8],
    ciphertext: &'a mut [u8],
    info: &Info<'_>,
) -> Result<&'a [u8], CryptError> {
    let key_id = info.key_id();
    let info = info.to_bytes();
    let sk = key_registry
        .private_key(key_id)
        .ok_or(CryptError::NoSuchKey(key_id))?;
    let encap_key = <AggKem as hpke::Kem>::EncappedKey::from_bytes(enc)?;
    // ciphertext is attacker-controlled; anything shorter than the tag cannot
    // be authentic
    if ciphertext.len() < AeadTag::<AggAead>::size() {
        return Err(CryptError::Other);
    }
    let (ct, tag) = ciphertext.split_at_mut(ciphertext.len() - AeadTag::<AggAead>::size());
    let tag = AeadTag::<AggAead>::from_bytes(tag)?;

    single_shot_open_in_place_detached::<_, AggKdf, AggKem>(
        &OpModeR::Base,
        sk,
        &encap_key,
        &info,
        ct,
        &[],
        &tag,
    )?;

    // at this point ct is no longer a pointer to the ciphertext.
    let pt = ct;
    Ok(pt)
}

// Avoids a clippy "complex type" warning on the return type from `seal_in_place`.
// Not intended to be widely used.
pub(crate) type Ciphertext<'a> = (AggEncapsulatedKey, &'a [u8], AeadTag<AggAead>);

/// Seals a report payload towards the public key identified by `info`.
///
/// ## Errors
/// If the payload cannot be sealed for any reason.
pub(crate) fn seal_in_place<'a, R: CryptoRng + RngCore>(
    key_registry: &impl PublicKeyRegistry,
    plaintext: &'a mut [u8],
    info: &Info<'_>,
    rng: &mut R,
) -> Result<Ciphertext<'a>, CryptError> {
    let key_id = info.key_id();
    let info = info.to_bytes();
    let pk = key_registry
        .public_key(key_id)
        .ok_or(CryptError::NoSuchKey(key_id))?;
    let (encap_key, tag) = single_shot_seal_in_place_detached::<AggAead, AggKdf, AggKem, _>(
        &OpModeS::Base,
        pk,
        &info,
        plaintext,
        &[],
        rng,
    )?;

    // at this point `plaintext` is no longer a pointer to the plaintext.
    Ok((encap_key, plaintext, tag))
}
