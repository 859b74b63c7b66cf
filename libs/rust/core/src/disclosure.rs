//! Opt-in disclosure registry and recognition badges.
//!
//! Entirely separate from the transform, protocol and validation paths:
//! entries exist only because a participant explicitly disclosed itself,
//! and nothing in aggregation ever reads them.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::benchmark::{RankBucket, SectorBenchmark};
use crate::identity::ParticipantId;
use crate::tier::{NoisedPercentage, Tier};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Badge {
    GenderParityLeader,
    ParityBand,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Disclosure {
    pub display_name: String,
    /// Percentages the participant chose to publish about itself.
    #[serde(default)]
    pub percentages: BTreeMap<Tier, NoisedPercentage>,
}

pub struct DisclosureConfig {
    pub leader_min_tiers: usize,
    pub parity_band: (f64, f64),
}

impl Default for DisclosureConfig { fn default() -> Self { Self { leader_min_tiers: 2, parity_band: (40.0, 60.0) } } }

pub struct DisclosureRegistry {
    cfg: DisclosureConfig,
    entries: Arc<RwLock<HashMap<ParticipantId, Disclosure>>>,
}

impl DisclosureRegistry {
    pub fn new(cfg: DisclosureConfig) -> Self { Self { cfg, entries: Arc::new(RwLock::new(HashMap::new())) } }

    pub fn disclose(&self, id: ParticipantId, disclosure: Disclosure) { self.entries.write().insert(id, disclosure); }
    pub fn withdraw(&self, id: &ParticipantId) -> bool { self.entries.write().remove(id).is_some() }
    pub fn get(&self, id: &ParticipantId) -> Option<Disclosure> { self.entries.read().get(id).cloned() }
    pub fn len(&self) -> usize { self.entries.read().len() }
    pub fn is_empty(&self) -> bool { self.entries.read().is_empty() }

    /// Badges earned against a sector benchmark, from self-disclosed values only.
    pub fn badges(&self, id: &ParticipantId, benchmark: &SectorBenchmark) -> Vec<Badge> {
        let map = self.entries.read();
        let Some(d) = map.get(id) else { return Vec::new() };
        let mut out = Vec::new();

        let top = d
            .percentages
            .iter()
            .filter(|(tier, pct)| {
                benchmark.per_tier.get(*tier).is_some_and(|b| b.bucket(pct.value()) == RankBucket::TopQuartile)
            })
            .count();
        if top >= self.cfg.leader_min_tiers { out.push(Badge::GenderParityLeader); }

        let (lo, hi) = self.cfg.parity_band;
        if !d.percentages.is_empty() && d.percentages.values().all(|p| (lo..=hi).contains(&p.value())) {
            out.push(Badge::ParityBand);
        }
        out
    }
}
