use std::ops::Deref;

use hpke::Serializable;

use super::{AggPrivateKey, AggPublicKey};
use crate::report::KeyIdentifier;

/// A pair of secret key and public key. Public keys are distributed to
/// reporting origins to encrypt payloads towards the worker; secret keys stay
/// with the key-management collaborator and are served to workers by key id.
pub struct KeyPair {
    pk: AggPublicKey,
    sk: AggPrivateKey,
}

impl From<(AggPrivateKey, AggPublicKey)> for KeyPair {
    fn from(value: (AggPrivateKey, AggPublicKey)) -> Self {
        Self {
            pk: value.1,
            sk: value.0,
        }
    }
}

impl KeyPair {
    pub fn gen<R: rand::RngCore + rand::CryptoRng>(mut r: &mut R) -> Self {
        <super::AggKem as hpke::Kem>::gen_keypair(&mut r).into()
    }

    /// Returns the public key bytes. With the X25519 crate it is possible to borrow those bytes,
    /// but the hpke crate wraps those types and does not offer `as_bytes`.
    #[must_use]
    pub fn pk_bytes(&self) -> Box<[u8]> {
        let pk_bytes: [u8; 32] = self.pk.to_bytes().into();
        Box::new(pk_bytes)
    }

    /// Returns the secret key bytes, for the same reason as [`pk_bytes`] it returns an owned
    /// slice, instead of borrow.
    ///
    /// [`pk_bytes`]: Self::pk_bytes
    #[must_use]
    pub fn sk_bytes(&self) -> Box<[u8]> {
        let sk_bytes: [u8; 32] = self.sk.to_bytes().into();
        Box::new(sk_bytes)
    }
}

// This newtype is necessary because AggPublicKey is an associated type from another crate (hpke).
// The coherence rules prohibit us from implementing `PublicKeyRegistry` both for our concrete type
// `KeyPair` and for `AggPublicKey`, because the impls would overlap if hpke chose to define
// `AggPublicKey` to be the same as `KeyPair`.
pub struct PublicKeyOnly(pub AggPublicKey);

impl Deref for PublicKeyOnly {
    type Target = AggPublicKey;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Same coherence constraint as for `PublicKeyOnly`.
pub struct PrivateKeyOnly(pub AggPrivateKey);

impl Deref for PrivateKeyOnly {
    type Target = AggPrivateKey;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&KeyRegistry<KeyPair>> for KeyRegistry<PrivateKeyOnly> {
    fn from(key_registry: &KeyRegistry<KeyPair>) -> Self {
        let keys = key_registry
            .keys
            .iter()
            .map(|k| PrivateKeyOnly(k.sk.clone()))
            .collect::<Vec<_>>();
        Self {
            keys: keys.into_boxed_slice(),
        }
    }
}

pub trait PublicKeyRegistry {
    fn public_key(&self, key_id: KeyIdentifier) -> Option<&AggPublicKey>;
}

/// The key-management collaborator seam: fetches decryption key material by
/// the key identifier a report was sealed with. Returning `None` is the
/// "no such key" signal and fails that report with a decryption error.
pub trait PrivateKeyRegistry: Send + Sync + 'static {
    fn private_key(&self, key_id: KeyIdentifier) -> Option<&AggPrivateKey>;
}

/// A registry that holds all the keys available to this worker.
pub struct KeyRegistry<K> {
    keys: Box<[K]>,
}

impl<K> KeyRegistry<K> {
    /// Create a key registry with no keys. Since the registry is immutable, it is useless,
    /// but this avoids `Option<KeyRegistry>` when the registry is ultimately not optional.
    #[must_use]
    pub fn empty() -> Self {
        Self { keys: Box::new([]) }
    }

    pub fn from_keys<const N: usize, I: Into<K>>(pairs: [I; N]) -> Self {
        Self {
            keys: pairs
                .into_iter()
                .map(Into::into)
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    fn key(&self, key_id: KeyIdentifier) -> Option<&K> {
        match key_id as usize {
            key_id if key_id < self.keys.len() => Some(&self.keys[key_id]),
            _ => None,
        }
    }
}

impl KeyRegistry<KeyPair> {
    pub fn random<R: rand::RngCore + rand::CryptoRng>(keys_count: usize, r: &mut R) -> Self {
        let keys = (0..keys_count).map(|_| KeyPair::gen(r)).collect::<Vec<_>>();

        Self {
            keys: keys.into_boxed_slice(),
        }
    }
}

impl PrivateKeyRegistry for KeyRegistry<KeyPair> {
    #[must_use]
    fn private_key(&self, key_id: KeyIdentifier) -> Option<&AggPrivateKey> {
        self.key(key_id).map(|v| &v.sk)
    }
}

impl PrivateKeyRegistry for KeyRegistry<PrivateKeyOnly> {
    #[must_use]
    fn private_key(&self, key_id: KeyIdentifier) -> Option<&AggPrivateKey> {
        self.key(key_id).map(|sk| &**sk)
    }
}

impl PublicKeyRegistry for KeyRegistry<KeyPair> {
    fn public_key(&self, key_id: KeyIdentifier) -> Option<&AggPublicKey> {
        self.key(key_id).map(|v| &v.pk)
    }
}

impl PublicKeyRegistry for KeyRegistry<PublicKeyOnly> {
    fn public_key(&self, key_id: KeyIdentifier) -> Option<&AggPublicKey> {
        self.key(key_id).map(|pk| &**pk)
    }
}
