//! Participant identities and the directory of validated verifying keys.
//!
//! Key distribution itself is out of band; the directory is assumed to be
//! populated with keys that were validated at onboarding.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use crate::error::IdentityError;

/// Opaque pseudonymous participant handle, derived from the verifying key.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let mut h = Sha256::new();
        h.update(b"equiverse/participant-id/v1");
        h.update(key.as_bytes());
        Self(hex::encode(&h.finalize()[..16]))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// A participant's long-term signing identity.
///
/// Private material never leaves the participant process; the noise key and
/// audit salt are derived from it with domain separation.
pub struct ParticipantIdentity {
    id: ParticipantId,
    signing_key: SigningKey,
}

impl fmt::Debug for ParticipantIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParticipantIdentity({}, ***)", self.id)
    }
}

impl ParticipantIdentity {
    pub fn generate() -> Self { Self::from_signing_key(SigningKey::generate(&mut OsRng)) }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self { Self::from_signing_key(SigningKey::from_bytes(bytes)) }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let id = ParticipantId::from_verifying_key(&signing_key.verifying_key());
        Self { id, signing_key }
    }

    pub fn id(&self) -> &ParticipantId { &self.id }
    pub fn verifying_key(&self) -> VerifyingKey { self.signing_key.verifying_key() }

    /// Sign a message digest; returns the hex-encoded signature.
    pub fn sign(&self, digest: &[u8]) -> String { hex::encode(self.signing_key.sign(digest).to_bytes()) }

    pub(crate) fn noise_key(&self) -> [u8; 32] { self.derive(b"equiverse/noise-key/v1") }
    pub(crate) fn audit_salt(&self) -> [u8; 32] { self.derive(b"equiverse/audit-salt/v1") }

    fn derive(&self, label: &[u8]) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(label);
        h.update(self.signing_key.to_bytes());
        h.finalize().into()
    }
}

fn parse_sig(sig: &str) -> Result<Signature, IdentityError> {
    let bytes = hex::decode(sig).map_err(|_| IdentityError::MalformedSignature)?;
    let arr: [u8; 64] = bytes.try_into().map_err(|_| IdentityError::MalformedSignature)?;
    Ok(Signature::from_bytes(&arr))
}

/// Validated verifying keys, keyed by participant handle.
#[derive(Clone, Debug, Default)]
pub struct KeyDirectory {
    keys: HashMap<ParticipantId, VerifyingKey>,
}

impl KeyDirectory {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, key: VerifyingKey) -> ParticipantId {
        let id = ParticipantId::from_verifying_key(&key);
        self.keys.insert(id.clone(), key);
        id
    }

    pub fn contains(&self, id: &ParticipantId) -> bool { self.keys.contains_key(id) }
    pub fn len(&self) -> usize { self.keys.len() }
    pub fn is_empty(&self) -> bool { self.keys.is_empty() }

    pub fn verify(&self, id: &ParticipantId, digest: &[u8], sig: &str) -> Result<(), IdentityError> {
        let key = self.keys.get(id).ok_or(IdentityError::UnknownParticipant)?;
        let sig = parse_sig(sig)?;
        key.verify(digest, &sig).map_err(|_| IdentityError::BadSignature)
    }
}
