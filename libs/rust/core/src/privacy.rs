//! Local privacy transform.
//!
//! Runs inside the participant's trust boundary. Turns exact per-tier counts
//! into k-anonymity-suppressed, noised and rounded percentages for
//! disclosure, plus the exact (unmasked) contribution vector that the secure
//! aggregation protocol masks before anything leaves the process.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Exp1, Normal};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::audit::AuditRecord;
use crate::error::PrivacyError;
use crate::identity::ParticipantIdentity;
use crate::settings::{NoiseMechanism, NoiseSeeding, PrivacyConfig};
use crate::tier::{NoisedPercentage, Period, RawTierSet, Sector, Tier, TierCount};

/// Length of the contribution vector: `(total, female)` per tier.
pub const CONTRIBUTION_LEN: usize = Tier::COUNT * 2;

const MAX_DRAWS: usize = 64;

/// Exact counts laid out for secure summation. Never disclosed unmasked.
#[derive(Clone, PartialEq, Eq)]
pub struct Contribution {
    values: [u64; CONTRIBUTION_LEN],
}

impl fmt::Debug for Contribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("Contribution(***)") }
}

impl Contribution {
    /// Built from every tier, suppressed or not: suppression limits what is
    /// disclosed, not what is summed.
    fn from_counts<'a>(counts: impl Iterator<Item = &'a TierCount>) -> Self {
        let mut values = [0u64; CONTRIBUTION_LEN];
        for c in counts {
            values[c.tier.index() * 2] = c.total;
            values[c.tier.index() * 2 + 1] = c.female;
        }
        Self { values }
    }

    pub(crate) fn values(&self) -> &[u64; CONTRIBUTION_LEN] { &self.values }
}

/// Output of the transform, still inside the participant boundary.
#[derive(Debug, Clone)]
pub struct PreparedSubmission {
    pub sector: Sector,
    pub period: Period,
    disclosed: BTreeMap<Tier, NoisedPercentage>,
    contribution: Contribution,
    audit: AuditRecord,
}

impl PreparedSubmission {
    /// Disclosed value for a tier; `None` when suppressed.
    pub fn noised(&self, tier: Tier) -> Option<NoisedPercentage> { self.disclosed.get(&tier).copied() }
    pub fn disclosed(&self) -> &BTreeMap<Tier, NoisedPercentage> { &self.disclosed }
    pub fn audit_record(&self) -> &AuditRecord { &self.audit }
    pub fn validation_hash(&self) -> &str { &self.audit.validation_hash }
    pub(crate) fn contribution(&self) -> &Contribution { &self.contribution }
}

pub struct LocalPrivacyTransform<'a> {
    config: &'a PrivacyConfig,
    identity: &'a ParticipantIdentity,
}

impl<'a> LocalPrivacyTransform<'a> {
    pub fn new(config: &'a PrivacyConfig, identity: &'a ParticipantIdentity) -> Result<Self, PrivacyError> {
        config.validate()?;
        Ok(Self { config, identity })
    }

    /// Consume the raw counts and produce a submission ready for masking.
    pub fn apply(&self, sector: &Sector, period: Period, raw: RawTierSet) -> Result<PreparedSubmission, PrivacyError> {
        if let Some(bad) = raw.iter().find(|c| !c.is_consistent()) {
            return Err(PrivacyError::InvalidCount { tier: bad.tier, total: bad.total, female: bad.female });
        }

        let salt = self.identity.audit_salt();
        let mut disclosed = BTreeMap::new();
        let mut tier_hashes = BTreeMap::new();
        for count in raw.iter() {
            tier_hashes.insert(count.tier, tier_validation_hash(&salt, sector, period, count));
            if count.total == 0 || count.total < self.config.k_min { continue; }

            let raw_pct = 100.0 * count.female as f64 / count.total as f64;
            let noised = match self.config.seeding {
                NoiseSeeding::Persistent => {
                    let mut rng = ChaCha20Rng::from_seed(self.noise_seed(sector, count));
                    perturb(self.config, raw_pct, count.total, &mut rng)
                }
                NoiseSeeding::Fresh => perturb(self.config, raw_pct, count.total, &mut ChaCha20Rng::from_entropy()),
            };
            let rounded = round_to_step(noised, self.config.round_to);
            if let Some(p) = NoisedPercentage::new(rounded) { disclosed.insert(count.tier, p); }
        }

        if disclosed.is_empty() { return Err(PrivacyError::InsufficientData); }
        debug!(%sector, %period, disclosed = disclosed.len(), suppressed = raw.len() - disclosed.len(), "privacy transform applied");

        let contribution = Contribution::from_counts(raw.iter());
        let audit = AuditRecord::new(sector.clone(), period, tier_hashes);
        Ok(PreparedSubmission { sector: sector.clone(), period, disclosed, contribution, audit })
    }

    fn noise_seed(&self, sector: &Sector, count: &TierCount) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(b"equiverse/noise/v1");
        h.update(self.identity.noise_key());
        h.update(sector.as_str().as_bytes());
        h.update([count.tier.index() as u8]);
        h.update(count.total.to_le_bytes());
        h.update(count.female.to_le_bytes());
        h.finalize().into()
    }
}

/// Salted digest of one tier's exact counts. The salt is participant-private,
/// which keeps the small count space from being brute-forced.
pub(crate) fn tier_validation_hash(salt: &[u8; 32], sector: &Sector, period: Period, count: &TierCount) -> String {
    let mut h = Sha256::new();
    h.update(b"equiverse/validation/v1");
    h.update(salt);
    h.update(sector.as_str().as_bytes());
    h.update(period.year.to_le_bytes());
    h.update([period.quarter.unwrap_or(0)]);
    h.update([count.tier.index() as u8]);
    h.update(count.total.to_le_bytes());
    h.update(count.female.to_le_bytes());
    hex::encode(h.finalize())
}

/// Noise standard deviation (Gaussian) or scale (Laplace) for a tier of
/// `total` people. One person changes the percentage by at most `100/total`.
pub(crate) fn noise_scale(cfg: &PrivacyConfig, total: u64) -> f64 {
    let sensitivity = 100.0 / total.max(1) as f64;
    match cfg.mechanism {
        NoiseMechanism::Gaussian => sensitivity * (2.0 * (1.25 / cfg.delta).ln()).sqrt() / cfg.epsilon,
        NoiseMechanism::Laplace => sensitivity / cfg.epsilon,
    }
}

/// Add bounded noise to `raw_pct` and clamp into `[0, 100]`.
///
/// Draws outside `[-noise_range, noise_range]` are rejected; after
/// `MAX_DRAWS` rejections the last draw is clamped into the band.
pub(crate) fn perturb<R: Rng + ?Sized>(cfg: &PrivacyConfig, raw_pct: f64, total: u64, rng: &mut R) -> f64 {
    let range = cfg.noise_range;
    if range == 0.0 { return raw_pct.clamp(0.0, 100.0); }
    let scale = noise_scale(cfg, total);
    let mut n = 0.0;
    for _ in 0..MAX_DRAWS {
        n = match cfg.mechanism {
            NoiseMechanism::Gaussian => match Normal::new(0.0, scale) {
                Ok(d) => d.sample(rng),
                Err(_) => 0.0,
            },
            NoiseMechanism::Laplace => {
                let mag: f64 = Exp1.sample(rng);
                if rng.gen::<bool>() { mag * scale } else { -mag * scale }
            }
        };
        if n.abs() <= range { break; }
    }
    (raw_pct + n.clamp(-range, range)).clamp(0.0, 100.0)
}

/// Round to the nearest multiple of `step`, never past the largest multiple
/// that stays within 100.
pub(crate) fn round_to_step(value: f64, step: u32) -> f64 {
    let step = f64::from(step.max(1));
    let rounded = (value / step).round() * step;
    let ceiling = (100.0 / step).floor() * step;
    rounded.clamp(0.0, ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cfg() -> PrivacyConfig { PrivacyConfig { k_min: 50, noise_range: 5.0, ..Default::default() } }

    #[test]
    fn suppresses_small_tiers() {
        let ident = ParticipantIdentity::from_secret_bytes(&[1u8; 32]);
        let cfg = cfg();
        let t = LocalPrivacyTransform::new(&cfg, &ident).unwrap();
        let raw = RawTierSet::new().with(Tier::SeniorMgmt, 150, 45).with(Tier::Board, 30, 10);
        let out = t.apply(&Sector::new("it"), Period::annual(2025), raw).unwrap();
        assert!(out.noised(Tier::Board).is_none());
        assert!(out.noised(Tier::SeniorMgmt).is_some());
        assert!(!out.disclosed().contains_key(&Tier::Board));
        // suppressed tiers still count towards the secure sum
        assert_eq!(out.contribution().values()[Tier::Board.index() * 2], 30);
        assert_eq!(out.audit_record().tier_hashes.len(), 2);
    }

    #[test]
    fn all_suppressed_is_insufficient_data() {
        let ident = ParticipantIdentity::generate();
        let cfg = cfg();
        let t = LocalPrivacyTransform::new(&cfg, &ident).unwrap();
        let raw = RawTierSet::new().with(Tier::Board, 12, 3).with(Tier::CSuite, 0, 0);
        assert_eq!(t.apply(&Sector::new("it"), Period::annual(2025), raw).unwrap_err(), PrivacyError::InsufficientData);
    }

    #[test]
    fn invalid_count_wins_over_suppression() {
        let ident = ParticipantIdentity::generate();
        let cfg = cfg();
        let t = LocalPrivacyTransform::new(&cfg, &ident).unwrap();
        let raw = RawTierSet::new().with(Tier::Board, 5, 9);
        assert_eq!(
            t.apply(&Sector::new("it"), Period::annual(2025), raw).unwrap_err(),
            PrivacyError::InvalidCount { tier: Tier::Board, total: 5, female: 9 }
        );
    }

    #[test]
    fn persistent_seeding_is_stable_across_periods() {
        let ident = ParticipantIdentity::from_secret_bytes(&[3u8; 32]);
        let cfg = cfg();
        let t = LocalPrivacyTransform::new(&cfg, &ident).unwrap();
        let raw = || RawTierSet::new().with(Tier::EntryLevel, 400, 170);
        let a = t.apply(&Sector::new("it"), Period::annual(2024), raw()).unwrap();
        let b = t.apply(&Sector::new("it"), Period::annual(2025), raw()).unwrap();
        assert_eq!(a.noised(Tier::EntryLevel), b.noised(Tier::EntryLevel));
        assert_ne!(a.validation_hash(), b.validation_hash());
    }

    #[test]
    fn rounding_stays_inside_range() {
        assert_eq!(round_to_step(99.0, 40), 80.0);
        assert_eq!(round_to_step(47.4, 5), 45.0);
        assert_eq!(round_to_step(47.6, 5), 50.0);
        assert_eq!(round_to_step(0.2, 1), 0.0);
    }

    proptest! {
        #[test]
        fn noised_value_bounded(female in 0u64..=500, extra in 0u64..500, seed in any::<u64>(), laplace in any::<bool>(), range in 0.0f64..20.0) {
            let total = (female + extra).max(1);
            let cfg = PrivacyConfig {
                noise_range: range,
                mechanism: if laplace { NoiseMechanism::Laplace } else { NoiseMechanism::Gaussian },
                ..cfg()
            };
            let raw_pct = 100.0 * female as f64 / total as f64;
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let noised = perturb(&cfg, raw_pct, total, &mut rng);
            prop_assert!((0.0..=100.0).contains(&noised));
            prop_assert!((noised - raw_pct).abs() <= range + 1e-9);
            let rounded = round_to_step(noised, 5);
            prop_assert!((0.0..=100.0).contains(&rounded));
        }
    }
}
