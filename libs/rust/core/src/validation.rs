//! Validation & anomaly engine.
//!
//! Sees only unmasked round sums and the published series. Findings never
//! silently promote a round: the worst finding decides the outcome, with
//! `Rejected > InsufficientCohort > Anomalous > Accepted`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use tracing::{info, warn};

use crate::benchmark::SectorBenchmark;
use crate::Period;
use crate::metrics::record_outcome;
use crate::secure_agg::RoundSums;
use crate::settings::ValidationConfig;
use crate::tier::{Sector, Tier};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Anomalous,
    InsufficientCohort,
    Rejected,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::Anomalous => "anomalous",
            Outcome::InsufficientCohort => "insufficient_cohort",
            Outcome::Rejected => "rejected",
        }
    }

    /// Accepted and anomalous rounds are published; anomalous ones with a caveat.
    pub fn is_publishable(self) -> bool { matches!(self, Outcome::Accepted | Outcome::Anomalous) }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    CrossTotalDeviation { expected: u64, observed: u64, relative: f64 },
    TrendJump { tier: Tier, delta: f64 },
    TrendOutlier { tier: Tier, score: f64 },
    InsufficientCohort { participants: usize, required: usize },
    Inconsistent { detail: String },
}

impl Finding {
    pub fn outcome(&self) -> Outcome {
        match self {
            Finding::CrossTotalDeviation { .. } | Finding::TrendJump { .. } | Finding::TrendOutlier { .. } => Outcome::Anomalous,
            Finding::InsufficientCohort { .. } => Outcome::InsufficientCohort,
            Finding::Inconsistent { .. } => Outcome::Rejected,
        }
    }
}

impl Display for Finding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Finding::CrossTotalDeviation { expected, observed, relative } => {
                write!(f, "headcount {observed} deviates {:.1}% from external total {expected}", relative * 100.0)
            }
            Finding::TrendJump { tier, delta } => write!(f, "{tier} moved {delta:+.1} pts without headcount change"),
            Finding::TrendOutlier { tier, score } => write!(f, "{tier} trend is an outlier (score {score:.2})"),
            Finding::InsufficientCohort { participants, required } => {
                write!(f, "{participants} participants, {required} required")
            }
            Finding::Inconsistent { detail } => f.write_str(detail),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub outcome: Outcome,
    pub findings: Vec<Finding>,
    /// Cross-total deviations repeated for the sector; needs a manual audit.
    pub audit_required: bool,
}

impl ValidationReport {
    pub fn caveat(&self) -> Option<String> {
        if self.outcome != Outcome::Anomalous { return None; }
        let parts: Vec<String> = self
            .findings
            .iter()
            .filter(|f| f.outcome() == Outcome::Anomalous)
            .map(ToString::to_string)
            .collect();
        Some(parts.join("; "))
    }
}

pub struct ValidationEngine {
    config: ValidationConfig,
    /// Consecutive cross-total deviations per sector.
    deviations: Mutex<HashMap<Sector, u32>>,
}

impl ValidationEngine {
    pub fn new(config: ValidationConfig) -> Self { Self { config, deviations: Mutex::new(HashMap::new()) } }

    pub fn config(&self) -> &ValidationConfig { &self.config }

    /// `history` holds the sector's earlier published benchmarks in period
    /// order. Trend checks only compare periods that directly follow each
    /// other; a gap in the series skips them. Inconsistent sums are rejected
    /// without touching the cross-total streak.
    pub fn evaluate(&self, sums: &RoundSums, external_headcount: Option<u64>, history: &[SectorBenchmark]) -> ValidationReport {
        if let Some(finding) = self.consistency(sums) {
            record_outcome(Outcome::Rejected.as_str());
            warn!(sector = %sums.sector, period = %sums.period, round_id = %sums.round_id, %finding, "round rejected");
            return ValidationReport { outcome: Outcome::Rejected, findings: vec![finding], audit_required: false };
        }
        let mut findings = Vec::new();
        if sums.participant_count < self.config.min_cohort_size {
            findings.push(Finding::InsufficientCohort { participants: sums.participant_count, required: self.config.min_cohort_size });
        }
        let audit_required = match external_headcount {
            Some(expected) => self.cross_total(sums, expected, &mut findings),
            None => false,
        };
        self.trend(sums, history, &mut findings);

        let outcome = findings.iter().map(Finding::outcome).max().unwrap_or(Outcome::Accepted);
        record_outcome(outcome.as_str());
        if outcome == Outcome::Accepted {
            info!(sector = %sums.sector, period = %sums.period, round_id = %sums.round_id, "round validated");
        } else {
            warn!(sector = %sums.sector, period = %sums.period, round_id = %sums.round_id, outcome = outcome.as_str(), findings = findings.len(), audit_required, "round flagged");
        }
        ValidationReport { outcome, findings, audit_required }
    }

    fn consistency(&self, sums: &RoundSums) -> Option<Finding> {
        let Some(headcount) = sums.headcount() else {
            return Some(Finding::Inconsistent { detail: "summed headcount overflows".into() });
        };
        if sums.participant_count == 0 || headcount == 0 {
            return Some(Finding::Inconsistent { detail: "empty round".into() });
        }
        for (tier, t) in &sums.tiers {
            if !t.is_consistent() {
                return Some(Finding::Inconsistent { detail: format!("{tier}: summed female exceeds total") });
            }
            if t.reporting as usize > sums.participant_count {
                return Some(Finding::Inconsistent { detail: format!("{tier}: more reporters than participants") });
            }
        }
        None
    }

    fn cross_total(&self, sums: &RoundSums, expected: u64, findings: &mut Vec<Finding>) -> bool {
        // consistency already refused an overflowing sum
        let observed = sums.headcount().unwrap_or(u64::MAX);
        let relative = if expected == 0 {
            if observed == 0 { 0.0 } else { f64::INFINITY }
        } else {
            (observed as f64 - expected as f64).abs() / expected as f64
        };
        let mut ledger = self.deviations.lock();
        let streak = ledger.entry(sums.sector.clone()).or_insert(0);
        if relative > self.config.cross_total_tolerance {
            *streak += 1;
            findings.push(Finding::CrossTotalDeviation { expected, observed, relative });
        } else {
            *streak = 0;
        }
        *streak >= self.config.audit_after_consecutive
    }

    fn trend(&self, sums: &RoundSums, history: &[SectorBenchmark], findings: &mut Vec<Finding>) {
        let adjacent = |earlier: &SectorBenchmark, later: Period| later.preceding() == Some(earlier.period);
        let Some(previous) = history.last().filter(|p| adjacent(p, sums.period)) else { return };
        for (tier, t) in &sums.tiers {
            if t.total == 0 { continue; }
            let Some(prev) = previous.per_tier.get(tier) else { continue };
            let current = 100.0 * t.female as f64 / t.total as f64;
            let delta = current - prev.avg_female_pct;

            let headcount_change = if prev.headcount == 0 {
                f64::INFINITY
            } else {
                (t.total as f64 - prev.headcount as f64).abs() / prev.headcount as f64
            };
            if delta.abs() > self.config.max_trend_delta && headcount_change < self.config.corroborating_headcount_change {
                findings.push(Finding::TrendJump { tier: *tier, delta });
            }

            let past: Vec<f64> = history
                .windows(2)
                .filter(|w| adjacent(&w[0], w[1].period))
                .filter_map(|w| Some(w[1].per_tier.get(tier)?.avg_female_pct - w[0].per_tier.get(tier)?.avg_female_pct))
                .collect();
            if past.len() < self.config.min_history { continue; }
            let score = mad_score(&past, delta);
            if score > self.config.trend_outlier_threshold {
                findings.push(Finding::TrendOutlier { tier: *tier, score });
            }
        }
    }
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 { sorted[n / 2] } else { (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0 }
}

/// Modified z-score of `x` against `sample`: `0.6745 * |x - median| / MAD`.
/// Zero when the sample has no spread.
pub(crate) fn mad_score(sample: &[f64], x: f64) -> f64 {
    if sample.is_empty() { return 0.0; }
    let mut sorted = sample.to_vec();
    sorted.sort_by(f64::total_cmp);
    let med = median(&sorted);
    let mut deviations: Vec<f64> = sorted.iter().map(|v| (v - med).abs()).collect();
    deviations.sort_by(f64::total_cmp);
    let mad = median(&deviations);
    if mad <= 1e-9 { 0.0 } else { 0.6745 * (x - med).abs() / mad }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::TierBenchmark;
    use crate::secure_agg::{RoundId, TierSum};
    use crate::tier::Period;
    use std::collections::BTreeMap;

    fn sums(participants: usize, total: u64, female: u64) -> RoundSums {
        let mut tiers = BTreeMap::new();
        tiers.insert(Tier::MiddleMgmt, TierSum { total, female, reporting: participants as u32, pct_sum: 0.0, pct_sq_sum: 0.0 });
        RoundSums { sector: Sector::new("energy"), period: Period::annual(2025), round_id: RoundId::generate(), participant_count: participants, tiers }
    }

    fn published(year: u16, avg: f64, headcount: u64) -> SectorBenchmark {
        let mut per_tier = BTreeMap::new();
        per_tier.insert(Tier::MiddleMgmt, TierBenchmark {
            avg_female_pct: avg,
            std_dev: 0.0,
            participant_count: 6,
            trend_yoy: None,
            headcount,
            rank_cutoffs: [avg, avg, avg],
        });
        SectorBenchmark {
            sector: Sector::new("energy"),
            period: Period::annual(year),
            round_id: RoundId::generate(),
            version: 1,
            participant_count: 6,
            outcome: Outcome::Accepted,
            caveat: None,
            per_tier,
        }
    }

    #[test]
    fn clean_round_is_accepted() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let r = engine.evaluate(&sums(6, 1000, 300), Some(1010), &[published(2024, 29.0, 990)]);
        assert_eq!(r.outcome, Outcome::Accepted);
        assert!(r.findings.is_empty());
        assert_eq!(r.caveat(), None);
    }

    #[test]
    fn small_cohort_wins_over_anomalies() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let r = engine.evaluate(&sums(2, 1000, 300), Some(5000), &[]);
        assert_eq!(r.outcome, Outcome::InsufficientCohort);
        assert_eq!(r.findings.len(), 2);
    }

    #[test]
    fn inconsistent_sums_are_rejected() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        assert_eq!(engine.evaluate(&sums(6, 100, 101), None, &[]).outcome, Outcome::Rejected);
        assert_eq!(engine.evaluate(&sums(6, 0, 0), None, &[]).outcome, Outcome::Rejected);
    }

    #[test]
    fn repeated_cross_total_deviation_requires_audit() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let first = engine.evaluate(&sums(6, 1000, 300), Some(1200), &[]);
        assert_eq!(first.outcome, Outcome::Anomalous);
        assert!(!first.audit_required);
        assert!(first.caveat().unwrap().contains("external total 1200"));
        let second = engine.evaluate(&sums(6, 1000, 300), Some(1200), &[]);
        assert!(second.audit_required);
        let clean = engine.evaluate(&sums(6, 1000, 300), Some(1000), &[]);
        assert!(!clean.audit_required);
        assert_eq!(clean.outcome, Outcome::Accepted);
    }

    #[test]
    fn trend_jump_unless_headcount_corroborates() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let prior = [published(2024, 20.0, 1000)];
        let r = engine.evaluate(&sums(6, 1000, 350), None, &prior);
        assert!(matches!(r.findings[..], [Finding::TrendJump { tier: Tier::MiddleMgmt, .. }]));
        // 30% more people: a 15-point swing is plausible
        let r = engine.evaluate(&sums(6, 1300, 455), None, &prior);
        assert_eq!(r.outcome, Outcome::Accepted);
    }

    #[test]
    fn trend_skips_a_gap_in_the_series() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        // 2024 was never published: 2023 is not the previous period
        let r = engine.evaluate(&sums(6, 1000, 350), None, &[published(2023, 20.0, 1000)]);
        assert_eq!(r.outcome, Outcome::Accepted);
        assert!(r.findings.is_empty());
    }

    #[test]
    fn overflowing_headcount_is_rejected_without_moving_the_streak() {
        let engine = ValidationEngine::new(ValidationConfig::default());
        let mut huge = sums(6, u64::MAX - 5, 0);
        huge.tiers.insert(Tier::Board, TierSum { total: 10, female: 0, reporting: 1, pct_sum: 0.0, pct_sq_sum: 0.0 });
        let r = engine.evaluate(&huge, Some(1000), &[]);
        assert_eq!(r.outcome, Outcome::Rejected);
        assert!(matches!(&r.findings[..], [Finding::Inconsistent { detail }] if detail.contains("overflows")));
        assert!(!r.audit_required);

        engine.evaluate(&sums(6, 1000, 300), Some(1200), &[]);
        let after = engine.evaluate(&huge, Some(1200), &[]);
        assert!(!after.audit_required);
        let second_deviation = engine.evaluate(&sums(6, 1000, 300), Some(1200), &[]);
        assert!(second_deviation.audit_required);
    }

    #[test]
    fn trend_outlier_against_history() {
        let engine = ValidationEngine::new(ValidationConfig { max_trend_delta: 50.0, ..Default::default() });
        let history: Vec<SectorBenchmark> = [20.0, 20.5, 21.2, 21.6, 22.3, 22.8]
            .iter()
            .enumerate()
            .map(|(i, avg)| published(2019 + i as u16, *avg, 1000))
            .collect();
        let steady = engine.evaluate(&sums(6, 1000, 233), None, &history);
        assert_eq!(steady.outcome, Outcome::Accepted);
        let spike = engine.evaluate(&sums(6, 1000, 300), None, &history);
        assert!(spike.findings.iter().any(|f| matches!(f, Finding::TrendOutlier { .. })));
        assert_eq!(spike.outcome, Outcome::Anomalous);
    }

    #[test]
    fn mad_score_matches_modified_z() {
        assert_eq!(mad_score(&[1.0, 1.0, 1.0], 5.0), 0.0);
        let s = mad_score(&[1.0, 2.0, 3.0, 4.0, 5.0], 3.0);
        assert!(s.abs() < 1e-12);
        let s = mad_score(&[1.0, 2.0, 3.0, 4.0, 5.0], 13.0);
        assert!((s - 0.6745 * 10.0).abs() < 1e-9);
    }
}
