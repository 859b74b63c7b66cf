//! Aggregator-side state of a single round.
//!
//! Holds signed advertisements, commitments and masked submissions only.
//! No accessor hands out an individual submission; the only plaintext that
//! leaves a round is the unmasked sum.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::messages::{
    KeyAdvertisement, KeyBundle, MaskCommitment, NoticeKind, PrivacySubmission, RoundNotice, RoundTicket,
};
use super::{ProtocolPhase, RoundId, RoundStatus};
use crate::error::{AbortReason, ProtocolError};
use crate::identity::{KeyDirectory, ParticipantId};
use crate::privacy::CONTRIBUTION_LEN;
use crate::settings::ProtocolConfig;
use crate::tier::{Period, Sector, Tier};

/// Unmasked per-tier totals plus moments of the disclosed percentages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TierSum {
    pub total: u64,
    pub female: u64,
    /// Participants that disclosed a percentage for this tier.
    pub reporting: u32,
    pub pct_sum: f64,
    pub pct_sq_sum: f64,
}

impl TierSum {
    pub fn is_consistent(&self) -> bool { self.female <= self.total }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundSums {
    pub sector: Sector,
    pub period: Period,
    pub round_id: RoundId,
    pub participant_count: usize,
    pub tiers: BTreeMap<Tier, TierSum>,
}

impl RoundSums {
    /// Summed headcount over all tiers; `None` if the totals overflow, which
    /// only a malformed contribution can cause.
    pub fn headcount(&self) -> Option<u64> {
        self.tiers.values().try_fold(0u64, |acc, t| acc.checked_add(t.total))
    }
}

#[derive(Debug)]
pub struct AggregationRound {
    ticket: RoundTicket,
    phase: ProtocolPhase,
    declined: BTreeSet<ParticipantId>,
    adverts: BTreeMap<ParticipantId, KeyAdvertisement>,
    bundle: Option<KeyBundle>,
    commitments: BTreeSet<ParticipantId>,
    submissions: BTreeMap<ParticipantId, PrivacySubmission>,
    abort_reason: Option<AbortReason>,
}

impl AggregationRound {
    /// Open a round under a fresh id. The roster is de-duplicated and sorted.
    pub fn open(sector: Sector, period: Period, roster: Vec<ParticipantId>, min: usize) -> Result<Self, ProtocolError> {
        let roster: Vec<ParticipantId> = roster.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let min = min.max(ProtocolConfig::FLOOR);
        if roster.len() < min {
            return Err(ProtocolError::RosterTooSmall { min, got: roster.len() });
        }
        let ticket = RoundTicket { round_id: RoundId::generate(), sector, period, roster };
        debug!(round_id = %ticket.round_id, sector = %ticket.sector, period = %ticket.period, roster = ticket.roster.len(), "round opened");
        Ok(Self {
            ticket,
            phase: ProtocolPhase::KeyExchange,
            declined: BTreeSet::new(),
            adverts: BTreeMap::new(),
            bundle: None,
            commitments: BTreeSet::new(),
            submissions: BTreeMap::new(),
            abort_reason: None,
        })
    }

    pub fn round_id(&self) -> RoundId { self.ticket.round_id }
    pub fn ticket(&self) -> &RoundTicket { &self.ticket }
    pub fn roster(&self) -> &[ParticipantId] { &self.ticket.roster }
    pub fn phase(&self) -> ProtocolPhase { self.phase }
    pub fn status(&self) -> RoundStatus { self.phase.into() }
    pub fn abort_reason(&self) -> Option<AbortReason> { self.abort_reason }
    pub fn masks_received(&self) -> usize { self.submissions.len() }
    pub fn declined(&self) -> impl Iterator<Item = &ParticipantId> { self.declined.iter() }

    fn expect_phase(&self, expected: ProtocolPhase) -> Result<(), ProtocolError> {
        if let Some(reason) = self.abort_reason { return Err(ProtocolError::Aborted(reason)); }
        if self.phase != expected { return Err(ProtocolError::WrongPhase { expected, actual: self.phase }); }
        Ok(())
    }

    fn expect_member(&self, round_id: RoundId, id: &ParticipantId) -> Result<(), ProtocolError> {
        if round_id != self.ticket.round_id {
            return Err(ProtocolError::RoundMismatch { expected: self.ticket.round_id, got: round_id });
        }
        if self.ticket.roster.binary_search(id).is_err() { return Err(ProtocolError::NotInRoster); }
        Ok(())
    }

    pub fn decline(&mut self, notice: &RoundNotice, directory: &KeyDirectory) -> Result<(), ProtocolError> {
        self.expect_phase(ProtocolPhase::KeyExchange)?;
        self.expect_member(notice.round_id, &notice.participant_id)?;
        notice.verify(NoticeKind::Decline, directory)?;
        self.adverts.remove(&notice.participant_id);
        self.declined.insert(notice.participant_id.clone());
        Ok(())
    }

    /// Authenticate a participant's abort request. Aborting is left to the
    /// caller, which also decides the next roster.
    pub fn check_abort_request(&self, notice: &RoundNotice, directory: &KeyDirectory) -> Result<(), ProtocolError> {
        if let Some(reason) = self.abort_reason { return Err(ProtocolError::Aborted(reason)); }
        self.expect_member(notice.round_id, &notice.participant_id)?;
        notice.verify(NoticeKind::Abort, directory)?;
        Ok(())
    }

    /// Record a key advertisement. Returns the bundle to relay once every
    /// roster member has advertised.
    pub fn record_advertisement(
        &mut self,
        advert: KeyAdvertisement,
        directory: &KeyDirectory,
    ) -> Result<Option<KeyBundle>, ProtocolError> {
        self.expect_phase(ProtocolPhase::KeyExchange)?;
        self.expect_member(advert.round_id, &advert.participant_id)?;
        advert.verify(directory)?;
        advert.dh_public_bytes()?;
        if let Some(prev) = self.adverts.get(&advert.participant_id) {
            if prev != &advert { return Err(ProtocolError::ConflictingSubmission); }
            return Ok(None);
        }
        if self.declined.contains(&advert.participant_id) { return Err(ProtocolError::ConflictingSubmission); }
        self.adverts.insert(advert.participant_id.clone(), advert);
        if self.adverts.len() < self.ticket.roster.len() { return Ok(None); }

        let bundle = KeyBundle { round_id: self.ticket.round_id, adverts: self.adverts.values().cloned().collect() };
        self.bundle = Some(bundle.clone());
        self.phase = ProtocolPhase::Masking;
        Ok(Some(bundle))
    }

    /// Returns true once every roster member has committed.
    pub fn record_commitment(&mut self, commitment: MaskCommitment, directory: &KeyDirectory) -> Result<bool, ProtocolError> {
        self.expect_phase(ProtocolPhase::Masking)?;
        self.expect_member(commitment.round_id, &commitment.participant_id)?;
        commitment.verify(directory)?;
        if Some(commitment.bundle_digest.as_str()) != self.bundle_digest().as_deref() {
            return Err(ProtocolError::CommitmentMismatch);
        }
        self.commitments.insert(commitment.participant_id);
        if self.commitments.len() == self.ticket.roster.len() {
            self.phase = ProtocolPhase::Submission;
            return Ok(true);
        }
        Ok(false)
    }

    /// Admit a masked submission. An identical resend is accepted again; a
    /// different one from the same participant is refused. Returns true once
    /// every roster member has submitted.
    pub fn admit_submission(&mut self, submission: PrivacySubmission, directory: &KeyDirectory) -> Result<bool, ProtocolError> {
        self.expect_phase(ProtocolPhase::Submission)?;
        self.expect_member(submission.round_id, &submission.participant_id)?;
        if submission.sector != self.ticket.sector || submission.period != self.ticket.period {
            return Err(ProtocolError::ScopeMismatch);
        }
        submission.verify(directory)?;
        if Some(submission.mask_commitment.as_str()) != self.bundle_digest().as_deref() {
            return Err(ProtocolError::CommitmentMismatch);
        }
        if let Some(prev) = self.submissions.get(&submission.participant_id) {
            if prev != &submission { return Err(ProtocolError::ConflictingSubmission); }
        } else {
            self.submissions.insert(submission.participant_id.clone(), submission);
        }
        Ok(self.submissions.len() == self.ticket.roster.len())
    }

    fn bundle_digest(&self) -> Option<String> { self.bundle.as_ref().map(KeyBundle::digest) }

    fn missing(&self, have: impl Fn(&ParticipantId) -> bool) -> Vec<ParticipantId> {
        self.ticket.roster.iter().filter(|id| !have(id)).cloned().collect()
    }

    pub fn missing_advertisements(&self) -> Vec<ParticipantId> {
        self.missing(|id| self.adverts.contains_key(id) || self.declined.contains(id))
    }
    pub fn missing_commitments(&self) -> Vec<ParticipantId> { self.missing(|id| self.commitments.contains(id)) }
    pub fn missing_submissions(&self) -> Vec<ParticipantId> { self.missing(|id| self.submissions.contains_key(id)) }

    /// Sum every masked vector. Pairwise masks cancel, leaving the exact
    /// per-tier totals. Consumes the stored submissions.
    pub fn unmask(&mut self) -> Result<RoundSums, ProtocolError> {
        self.expect_phase(ProtocolPhase::Submission)?;
        if self.submissions.len() != self.ticket.roster.len() {
            return Err(ProtocolError::WrongPhase { expected: ProtocolPhase::Unmasking, actual: self.phase });
        }
        self.phase = ProtocolPhase::Unmasking;

        let mut acc = [0u64; CONTRIBUTION_LEN];
        let mut tiers: BTreeMap<Tier, TierSum> = BTreeMap::new();
        for sub in self.submissions.values() {
            for (a, v) in acc.iter_mut().zip(&sub.masked_contribution.0) {
                *a = a.wrapping_add(*v);
            }
            for (tier, pct) in &sub.per_tier {
                let t = tiers.entry(*tier).or_default();
                t.reporting += 1;
                t.pct_sum += pct.value();
                t.pct_sq_sum += pct.value() * pct.value();
            }
        }
        for tier in Tier::ALL {
            let (total, female) = (acc[tier.index() * 2], acc[tier.index() * 2 + 1]);
            if total == 0 && female == 0 && !tiers.contains_key(&tier) { continue; }
            let t = tiers.entry(tier).or_default();
            t.total = total;
            t.female = female;
        }

        let sums = RoundSums {
            sector: self.ticket.sector.clone(),
            period: self.ticket.period,
            round_id: self.ticket.round_id,
            participant_count: self.submissions.len(),
            tiers,
        };
        self.submissions.clear();
        self.adverts.clear();
        self.bundle = None;
        self.phase = ProtocolPhase::Completed;
        Ok(sums)
    }

    /// Abort and discard every masked value held for this round. Refused
    /// once unmasking has started.
    pub fn abort(&mut self, reason: AbortReason) -> Result<(), ProtocolError> {
        match self.phase {
            ProtocolPhase::Unmasking | ProtocolPhase::Completed => return Err(ProtocolError::AbortRefused),
            ProtocolPhase::Aborted => return Ok(()),
            _ => {}
        }
        self.phase = ProtocolPhase::Aborted;
        self.abort_reason = Some(reason);
        self.adverts.clear();
        self.bundle = None;
        self.commitments.clear();
        self.submissions.clear();
        Ok(())
    }
}
