//! Wire messages exchanged between participants and the aggregator.
//!
//! Every message a participant originates is signed with its identity key
//! over a domain-separated SHA-256 digest of its fields.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::masking::MaskingSession;
use super::RoundId;
use crate::error::{IdentityError, ProtocolError};
use crate::identity::{KeyDirectory, ParticipantId, ParticipantIdentity};
use crate::privacy::{PreparedSubmission, CONTRIBUTION_LEN};
use crate::tier::{NoisedPercentage, Period, Sector, Tier};

/// Round announcement sent to every roster member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundTicket {
    pub round_id: RoundId,
    pub sector: Sector,
    pub period: Period,
    pub roster: Vec<ParticipantId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAdvertisement {
    pub round_id: RoundId,
    pub participant_id: ParticipantId,
    /// Hex-encoded X25519 public key, fresh for this round.
    pub dh_public: String,
    pub signature: String,
}

impl KeyAdvertisement {
    pub fn digest(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(b"equiverse/advert/v1");
        h.update(self.round_id.as_bytes());
        h.update(self.participant_id.as_str().as_bytes());
        h.update(self.dh_public.as_bytes());
        h.finalize().into()
    }

    pub fn verify(&self, directory: &KeyDirectory) -> Result<(), IdentityError> {
        directory.verify(&self.participant_id, &self.digest(), &self.signature)
    }

    pub fn dh_public_bytes(&self) -> Result<[u8; 32], ProtocolError> {
        let bytes = hex::decode(&self.dh_public).map_err(|_| ProtocolError::IncompleteBundle)?;
        bytes.try_into().map_err(|_| ProtocolError::IncompleteBundle)
    }
}

/// All advertisements of a round, relayed by the aggregator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    pub round_id: RoundId,
    pub adverts: Vec<KeyAdvertisement>,
}

impl KeyBundle {
    /// Order-independent digest of the bundle's keys.
    pub fn digest(&self) -> String {
        let mut sorted: Vec<&KeyAdvertisement> = self.adverts.iter().collect();
        sorted.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        let mut h = Sha256::new();
        h.update(b"equiverse/bundle/v1");
        h.update(self.round_id.as_bytes());
        for a in sorted {
            h.update(a.participant_id.as_str().as_bytes());
            h.update(a.dh_public.as_bytes());
        }
        hex::encode(h.finalize())
    }
}

/// A participant's commitment to the mask set derived from a bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskCommitment {
    pub round_id: RoundId,
    pub participant_id: ParticipantId,
    pub bundle_digest: String,
    pub signature: String,
}

impl MaskCommitment {
    pub fn digest(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(b"equiverse/commit/v1");
        h.update(self.round_id.as_bytes());
        h.update(self.participant_id.as_str().as_bytes());
        h.update(self.bundle_digest.as_bytes());
        h.finalize().into()
    }

    pub fn verify(&self, directory: &KeyDirectory) -> Result<(), IdentityError> {
        directory.verify(&self.participant_id, &self.digest(), &self.signature)
    }
}

/// Which control notice a [`RoundNotice`] is signed as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeKind {
    Decline,
    Abort,
}

impl NoticeKind {
    fn tag(self) -> &'static [u8] {
        match self {
            NoticeKind::Decline => b"equiverse/decline/v1",
            NoticeKind::Abort => b"equiverse/abort/v1",
        }
    }
}

/// Signed control notice: a participant leaving or aborting a round. The
/// kind is bound into the signature, so a decline cannot be replayed as an
/// abort.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundNotice {
    pub round_id: RoundId,
    pub participant_id: ParticipantId,
    pub signature: String,
}

impl RoundNotice {
    pub fn sign(identity: &ParticipantIdentity, round_id: RoundId, kind: NoticeKind) -> Self {
        let mut notice = Self { round_id, participant_id: identity.id().clone(), signature: String::new() };
        notice.signature = identity.sign(&notice.digest(kind));
        notice
    }

    pub fn digest(&self, kind: NoticeKind) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(kind.tag());
        h.update(self.round_id.as_bytes());
        h.update(self.participant_id.as_str().as_bytes());
        h.finalize().into()
    }

    pub fn verify(&self, kind: NoticeKind, directory: &KeyDirectory) -> Result<(), IdentityError> {
        directory.verify(&self.participant_id, &self.digest(kind), &self.signature)
    }
}

/// Contribution vector after pairwise masking; uniformly distributed on its
/// own, meaningful only summed over the whole round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaskedVector(pub Vec<u64>);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivacySubmission {
    pub participant_id: ParticipantId,
    pub round_id: RoundId,
    pub sector: Sector,
    pub period: Period,
    /// Absent tiers were suppressed by the k-anonymity guard.
    pub per_tier: BTreeMap<Tier, NoisedPercentage>,
    pub masked_contribution: MaskedVector,
    pub mask_commitment: String,
    pub validation_hash: String,
    pub signature: String,
}

impl PrivacySubmission {
    /// Mask the prepared contribution with the session's pairwise masks and
    /// sign the result.
    pub fn seal(
        identity: &ParticipantIdentity,
        prepared: &PreparedSubmission,
        session: &MaskingSession,
    ) -> Result<Self, ProtocolError> {
        let ticket = session.ticket();
        if ticket.sector != prepared.sector || ticket.period != prepared.period {
            return Err(ProtocolError::ScopeMismatch);
        }
        let masked_contribution = session.mask(prepared.contribution())?;
        let mut sub = Self {
            participant_id: identity.id().clone(),
            round_id: ticket.round_id,
            sector: prepared.sector.clone(),
            period: prepared.period,
            per_tier: prepared.disclosed().clone(),
            masked_contribution,
            mask_commitment: session.bundle_digest().ok_or(ProtocolError::NoSession)?.to_string(),
            validation_hash: prepared.validation_hash().to_string(),
            signature: String::new(),
        };
        sub.signature = identity.sign(&sub.digest());
        Ok(sub)
    }

    pub fn noised(&self, tier: Tier) -> Option<NoisedPercentage> { self.per_tier.get(&tier).copied() }

    pub fn digest(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(b"equiverse/submission/v1");
        h.update(self.participant_id.as_str().as_bytes());
        h.update(self.round_id.as_bytes());
        h.update(self.sector.as_str().as_bytes());
        h.update(self.period.year.to_le_bytes());
        h.update([self.period.quarter.unwrap_or(0)]);
        for (tier, pct) in &self.per_tier {
            h.update([tier.index() as u8]);
            h.update(pct.value().to_bits().to_le_bytes());
        }
        for v in &self.masked_contribution.0 { h.update(v.to_le_bytes()); }
        h.update(self.mask_commitment.as_bytes());
        h.update(self.validation_hash.as_bytes());
        h.finalize().into()
    }

    /// Signature plus structural checks; run before admission to a round.
    pub fn verify(&self, directory: &KeyDirectory) -> Result<(), ProtocolError> {
        directory.verify(&self.participant_id, &self.digest(), &self.signature)?;
        if self.masked_contribution.0.len() != CONTRIBUTION_LEN {
            return Err(ProtocolError::MalformedContribution(self.masked_contribution.0.len()));
        }
        Ok(())
    }
}

/// Participant -> aggregator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ToAggregator {
    Advertise(KeyAdvertisement),
    /// Participant has nothing to submit this round (all tiers suppressed).
    Decline(RoundNotice),
    Commit(MaskCommitment),
    Submit(Box<PrivacySubmission>),
    Abort(RoundNotice),
}

impl ToAggregator {
    pub fn decline(identity: &ParticipantIdentity, round_id: RoundId) -> Self {
        ToAggregator::Decline(RoundNotice::sign(identity, round_id, NoticeKind::Decline))
    }

    pub fn abort(identity: &ParticipantIdentity, round_id: RoundId) -> Self {
        ToAggregator::Abort(RoundNotice::sign(identity, round_id, NoticeKind::Abort))
    }
}

impl ToAggregator {
    pub fn round_id(&self) -> RoundId {
        match self {
            ToAggregator::Advertise(a) => a.round_id,
            ToAggregator::Decline(n) | ToAggregator::Abort(n) => n.round_id,
            ToAggregator::Commit(c) => c.round_id,
            ToAggregator::Submit(s) => s.round_id,
        }
    }
}

/// Aggregator -> participant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ToParticipant {
    Open(RoundTicket),
    Keys(KeyBundle),
    RequestSubmission { round_id: RoundId },
    Aborted { round_id: RoundId },
    Completed { round_id: RoundId },
}
