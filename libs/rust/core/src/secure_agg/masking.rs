//! Participant side of pairwise masking.
//!
//! For every pair (i, j) both sides derive the same seed from an X25519
//! shared secret bound to the round; the party ordered first adds the
//! expanded mask, the other subtracts it, so masks cancel in the round sum
//! (arithmetic mod 2^64).

use rand::rngs::OsRng;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use x25519_dalek::{PublicKey, StaticSecret};

use super::messages::{KeyAdvertisement, KeyBundle, MaskCommitment, MaskedVector, RoundTicket};
use crate::error::ProtocolError;
use crate::identity::{KeyDirectory, ParticipantId, ParticipantIdentity};
use crate::privacy::Contribution;

/// Per-round masking state. Dropped (and its secret zeroized) when the round
/// ends or aborts; a new round always starts a new session.
pub struct MaskingSession {
    ticket: RoundTicket,
    me: ParticipantId,
    secret: StaticSecret,
    public: PublicKey,
    peer_seeds: BTreeMap<ParticipantId, [u8; 32]>,
    bundle_digest: Option<String>,
}

impl MaskingSession {
    pub fn new(ticket: RoundTicket, me: ParticipantId) -> Result<Self, ProtocolError> {
        Self::with_secret(ticket, me, StaticSecret::random_from_rng(OsRng))
    }

    pub(crate) fn with_secret(ticket: RoundTicket, me: ParticipantId, secret: StaticSecret) -> Result<Self, ProtocolError> {
        if !ticket.roster.contains(&me) { return Err(ProtocolError::NotInRoster); }
        let public = PublicKey::from(&secret);
        Ok(Self { ticket, me, secret, public, peer_seeds: BTreeMap::new(), bundle_digest: None })
    }

    pub fn ticket(&self) -> &RoundTicket { &self.ticket }
    pub fn bundle_digest(&self) -> Option<&str> { self.bundle_digest.as_deref() }

    pub fn advertisement(&self, identity: &ParticipantIdentity) -> KeyAdvertisement {
        let mut advert = KeyAdvertisement {
            round_id: self.ticket.round_id,
            participant_id: self.me.clone(),
            dh_public: hex::encode(self.public.as_bytes()),
            signature: String::new(),
        };
        advert.signature = identity.sign(&advert.digest());
        advert
    }

    /// Verify the relayed bundle and derive one seed per peer.
    ///
    /// The bundle must contain exactly one correctly signed advertisement per
    /// roster member, including our own unchanged key.
    pub fn accept_bundle(&mut self, bundle: &KeyBundle, directory: &KeyDirectory) -> Result<(), ProtocolError> {
        if bundle.round_id != self.ticket.round_id {
            return Err(ProtocolError::RoundMismatch { expected: self.ticket.round_id, got: bundle.round_id });
        }
        let roster: BTreeSet<&ParticipantId> = self.ticket.roster.iter().collect();
        let mut seen = BTreeSet::new();
        let mut seeds = BTreeMap::new();
        for advert in &bundle.adverts {
            if advert.round_id != self.ticket.round_id || !roster.contains(&advert.participant_id) {
                return Err(ProtocolError::IncompleteBundle);
            }
            if !seen.insert(&advert.participant_id) { return Err(ProtocolError::IncompleteBundle); }
            advert.verify(directory)?;
            let peer_public = PublicKey::from(advert.dh_public_bytes()?);
            if advert.participant_id == self.me {
                if peer_public.as_bytes() != self.public.as_bytes() { return Err(ProtocolError::IncompleteBundle); }
                continue;
            }
            let shared = self.secret.diffie_hellman(&peer_public);
            if !shared.was_contributory() { return Err(ProtocolError::NonContributoryKey); }
            seeds.insert(advert.participant_id.clone(), self.pair_seed(&advert.participant_id, shared.as_bytes()));
        }
        if seen.len() != roster.len() { return Err(ProtocolError::IncompleteBundle); }
        self.peer_seeds = seeds;
        self.bundle_digest = Some(bundle.digest());
        Ok(())
    }

    pub fn commitment(&self, identity: &ParticipantIdentity) -> Result<MaskCommitment, ProtocolError> {
        let bundle_digest = self.bundle_digest.clone().ok_or(ProtocolError::NoSession)?;
        let mut c = MaskCommitment {
            round_id: self.ticket.round_id,
            participant_id: self.me.clone(),
            bundle_digest,
            signature: String::new(),
        };
        c.signature = identity.sign(&c.digest());
        Ok(c)
    }

    pub(crate) fn mask(&self, contribution: &Contribution) -> Result<MaskedVector, ProtocolError> {
        if self.bundle_digest.is_none() { return Err(ProtocolError::NoSession); }
        let mut out = contribution.values().to_vec();
        for (peer, seed) in &self.peer_seeds {
            let mut rng = ChaCha20Rng::from_seed(*seed);
            let add = self.me < *peer;
            for v in out.iter_mut() {
                let m = rng.next_u64();
                *v = if add { v.wrapping_add(m) } else { v.wrapping_sub(m) };
            }
        }
        Ok(MaskedVector(out))
    }

    fn pair_seed(&self, peer: &ParticipantId, shared: &[u8; 32]) -> [u8; 32] {
        let (lo, hi) = if self.me < *peer { (&self.me, peer) } else { (peer, &self.me) };
        let mut h = Sha256::new();
        h.update(b"equiverse/mask/v1");
        h.update(self.ticket.round_id.as_bytes());
        h.update(self.ticket.sector.as_str().as_bytes());
        h.update(self.ticket.period.year.to_le_bytes());
        h.update([self.ticket.period.quarter.unwrap_or(0)]);
        h.update(lo.as_str().as_bytes());
        h.update(hi.as_str().as_bytes());
        h.update(shared);
        h.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privacy::LocalPrivacyTransform;
    use crate::secure_agg::RoundId;
    use crate::settings::PrivacyConfig;
    use crate::tier::{Period, RawTierSet, Sector, Tier};

    struct Party {
        ident: ParticipantIdentity,
        dh: [u8; 32],
    }

    fn parties(n: u8) -> (Vec<Party>, KeyDirectory) {
        let mut dir = KeyDirectory::new();
        let ps: Vec<Party> = (0..n)
            .map(|i| {
                let ident = ParticipantIdentity::from_secret_bytes(&[i + 1; 32]);
                dir.register(ident.verifying_key());
                Party { ident, dh: [i + 101; 32] }
            })
            .collect();
        (ps, dir)
    }

    fn ticket(ps: &[Party], round_id: RoundId) -> RoundTicket {
        RoundTicket {
            round_id,
            sector: Sector::new("it"),
            period: Period::annual(2025),
            roster: ps.iter().map(|p| p.ident.id().clone()).collect(),
        }
    }

    fn sessions(ps: &[Party], dir: &KeyDirectory, t: &RoundTicket) -> Vec<MaskingSession> {
        let mut ss: Vec<MaskingSession> = ps
            .iter()
            .map(|p| MaskingSession::with_secret(t.clone(), p.ident.id().clone(), StaticSecret::from(p.dh)).unwrap())
            .collect();
        let bundle = KeyBundle {
            round_id: t.round_id,
            adverts: ss.iter().zip(ps).map(|(s, p)| s.advertisement(&p.ident)).collect(),
        };
        for s in ss.iter_mut() { s.accept_bundle(&bundle, dir).unwrap(); }
        ss
    }

    fn contribution(ident: &ParticipantIdentity, total: u64, female: u64) -> Contribution {
        let cfg = PrivacyConfig { k_min: 1, ..Default::default() };
        LocalPrivacyTransform::new(&cfg, ident)
            .unwrap()
            .apply(&Sector::new("it"), Period::annual(2025), RawTierSet::new().with(Tier::SeniorMgmt, total, female))
            .unwrap()
            .contribution()
            .clone()
    }

    fn wrapping_sum(vs: &[MaskedVector]) -> Vec<u64> {
        let mut acc = vec![0u64; vs[0].0.len()];
        for v in vs {
            for (a, x) in acc.iter_mut().zip(&v.0) { *a = a.wrapping_add(*x); }
        }
        acc
    }

    #[test]
    fn masks_cancel_in_the_sum() {
        let (ps, dir) = parties(3);
        let t = ticket(&ps, RoundId::generate());
        let ss = sessions(&ps, &dir, &t);
        let counts = [(150, 45), (120, 50), (90, 10)];
        let masked: Vec<MaskedVector> = ss
            .iter()
            .zip(&ps)
            .zip(counts)
            .map(|((s, p), (tot, fem))| s.mask(&contribution(&p.ident, tot, fem)).unwrap())
            .collect();
        let sum = wrapping_sum(&masked);
        assert_eq!(sum[Tier::SeniorMgmt.index() * 2], 360);
        assert_eq!(sum[Tier::SeniorMgmt.index() * 2 + 1], 105);
        for (m, (tot, _)) in masked.iter().zip(counts) {
            assert_ne!(m.0[Tier::SeniorMgmt.index() * 2], tot);
        }
    }

    #[test]
    fn other_messages_independent_of_one_participants_data() {
        let (ps, dir) = parties(3);
        let t = ticket(&ps, RoundId::generate());
        let ss = sessions(&ps, &dir, &t);
        let run = |first: (u64, u64)| -> Vec<MaskedVector> {
            let counts = [first, (120, 50), (90, 10)];
            ss.iter()
                .zip(&ps)
                .zip(counts)
                .map(|((s, p), (tot, fem))| s.mask(&contribution(&p.ident, tot, fem)).unwrap())
                .collect()
        };
        let a = run((150, 45));
        let b = run((80, 2));
        assert_ne!(a[0], b[0]);
        assert_eq!(a[1], b[1]);
        assert_eq!(a[2], b[2]);
        assert_eq!(ss[1].advertisement(&ps[1].ident), ss[1].advertisement(&ps[1].ident));
    }

    #[test]
    fn fresh_round_yields_fresh_masks() {
        let (ps, dir) = parties(2);
        let first = sessions(&ps, &dir, &ticket(&ps, RoundId::generate()));
        let retry = sessions(&ps, &dir, &ticket(&ps, RoundId::generate()));
        let c = contribution(&ps[0].ident, 150, 45);
        // same DH keys on purpose: the round id alone must change the masks
        assert_ne!(first[0].mask(&c).unwrap(), retry[0].mask(&c).unwrap());
    }

    #[test]
    fn tampered_bundle_is_refused() {
        let (ps, dir) = parties(3);
        let t = ticket(&ps, RoundId::generate());
        let mut ss: Vec<MaskingSession> = ps
            .iter()
            .map(|p| MaskingSession::with_secret(t.clone(), p.ident.id().clone(), StaticSecret::from(p.dh)).unwrap())
            .collect();
        let mut adverts: Vec<KeyAdvertisement> = ss.iter().zip(&ps).map(|(s, p)| s.advertisement(&p.ident)).collect();
        adverts[2].dh_public = hex::encode([9u8; 32]);
        let bundle = KeyBundle { round_id: t.round_id, adverts };
        assert!(matches!(ss[0].accept_bundle(&bundle, &dir), Err(ProtocolError::Identity(_))));

        let short = KeyBundle { round_id: t.round_id, adverts: vec![ss[0].advertisement(&ps[0].ident)] };
        assert_eq!(ss[0].accept_bundle(&short, &dir), Err(ProtocolError::IncompleteBundle));
    }

    #[test]
    fn not_in_roster_is_refused() {
        let (ps, _) = parties(2);
        let t = ticket(&ps, RoundId::generate());
        let outsider = ParticipantIdentity::generate();
        assert!(matches!(MaskingSession::new(t, outsider.id().clone()), Err(ProtocolError::NotInRoster)));
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(24))]
        #[test]
        fn any_roster_sums_exactly(counts in proptest::collection::vec((1u64..5_000, 0u64..=100), 2..6)) {
            let (ps, dir) = parties(counts.len() as u8);
            let t = ticket(&ps, RoundId::generate());
            let ss = sessions(&ps, &dir, &t);
            let counts: Vec<(u64, u64)> = counts.into_iter().map(|(tot, pct)| (tot, tot * pct / 100)).collect();
            let masked: Vec<MaskedVector> = ss
                .iter()
                .zip(&ps)
                .zip(&counts)
                .map(|((s, p), (tot, fem))| s.mask(&contribution(&p.ident, *tot, *fem)).unwrap())
                .collect();
            let sum = wrapping_sum(&masked);
            proptest::prop_assert_eq!(sum[Tier::SeniorMgmt.index() * 2], counts.iter().map(|c| c.0).sum::<u64>());
            proptest::prop_assert_eq!(sum[Tier::SeniorMgmt.index() * 2 + 1], counts.iter().map(|c| c.1).sum::<u64>());
        }
    }
}
