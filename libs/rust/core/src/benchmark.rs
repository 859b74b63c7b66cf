//! Sector benchmark computation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::secure_agg::{RoundId, RoundSums};
use crate::tier::{Period, Sector, Tier};
use crate::validation::{Outcome, ValidationReport};

/// z-value of the quartiles of a standard normal.
const QUARTILE_Z: f64 = 0.6745;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankBucket {
    BottomQuartile,
    LowerMiddle,
    UpperMiddle,
    TopQuartile,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TierBenchmark {
    /// Pooled: `100 * sum(female) / sum(total)` over every participant.
    pub avg_female_pct: f64,
    /// Population std-dev of the disclosed noised percentages.
    pub std_dev: f64,
    /// Participants whose tier was not suppressed.
    pub participant_count: u32,
    /// Percentage points against the same period a year earlier.
    pub trend_yoy: Option<f64>,
    pub headcount: u64,
    /// Quartile boundaries (25th, 50th, 75th) under a normal approximation.
    pub rank_cutoffs: [f64; 3],
}

impl TierBenchmark {
    pub fn bucket(&self, pct: f64) -> RankBucket {
        let [q1, q2, q3] = self.rank_cutoffs;
        if pct >= q3 {
            RankBucket::TopQuartile
        } else if pct >= q2 {
            RankBucket::UpperMiddle
        } else if pct >= q1 {
            RankBucket::LowerMiddle
        } else {
            RankBucket::BottomQuartile
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SectorBenchmark {
    pub sector: Sector,
    pub period: Period,
    pub round_id: RoundId,
    /// Assigned on publication; 0 until then.
    #[serde(default)]
    pub version: u32,
    pub participant_count: usize,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat: Option<String>,
    pub per_tier: BTreeMap<Tier, TierBenchmark>,
}

/// Turn validated sums into a benchmark. `None` unless the report allows
/// publication. Pure: same inputs, same output.
pub fn compute_benchmark(
    sums: &RoundSums,
    report: &ValidationReport,
    prior_year: Option<&SectorBenchmark>,
) -> Option<SectorBenchmark> {
    if !report.outcome.is_publishable() { return None; }

    let per_tier = sums
        .tiers
        .iter()
        // a tier nobody disclosed would publish suppressed counts on their own
        .filter(|(_, t)| t.total > 0 && t.reporting > 0)
        .map(|(tier, t)| {
            let avg = 100.0 * t.female as f64 / t.total as f64;
            let n = f64::from(t.reporting);
            let mean = t.pct_sum / n;
            let std_dev = (t.pct_sq_sum / n - mean * mean).max(0.0).sqrt();
            let trend_yoy = prior_year.and_then(|p| p.per_tier.get(tier)).map(|p| avg - p.avg_female_pct);
            let spread = QUARTILE_Z * std_dev;
            let rank_cutoffs = [(avg - spread).clamp(0.0, 100.0), avg, (avg + spread).clamp(0.0, 100.0)];
            let bench = TierBenchmark {
                avg_female_pct: avg,
                std_dev,
                participant_count: t.reporting,
                trend_yoy,
                headcount: t.total,
                rank_cutoffs,
            };
            (*tier, bench)
        })
        .collect();

    Some(SectorBenchmark {
        sector: sums.sector.clone(),
        period: sums.period,
        round_id: sums.round_id,
        version: 0,
        participant_count: sums.participant_count,
        outcome: report.outcome,
        caveat: report.caveat(),
        per_tier,
    })
}
