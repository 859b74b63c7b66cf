//! Aggregator role: one sector/period from round to published benchmark.
//!
//! Rounds for different sectors or periods run concurrently on a shared
//! `Aggregator`; a second run for the same (sector, period) is refused while
//! one is active. The benchmark series is the only shared mutable state.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::benchmark::{compute_benchmark, SectorBenchmark};
use crate::error::{ProtocolError, RoundFailure};
use crate::identity::KeyDirectory;
use crate::secure_agg::{RoundDriver, RoundId, RoundLinks, RoundSums};
use crate::series::BenchmarkSeries;
use crate::settings::EquiverseConfig;
use crate::tier::{Period, Sector};
use crate::validation::{Finding, Outcome, ValidationEngine, ValidationReport};

/// Published rounds that need a human look.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReviewItem {
    pub sector: Sector,
    pub period: Period,
    pub round_id: RoundId,
    pub version: Option<u32>,
    pub findings: Vec<Finding>,
    pub audit_required: bool,
}

/// Result of a completed period. Never `Rejected`: a round whose sums fail
/// the consistency checks is reopened for the same sector/period, and once
/// `max_attempts` is spent the period fails with a [`RoundFailure`].
#[derive(Clone, Debug)]
pub struct PeriodOutcome {
    pub report: ValidationReport,
    /// Present for accepted and anomalous rounds.
    pub benchmark: Option<SectorBenchmark>,
    pub attempts: u32,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct AggregatorStatus {
    pub active_rounds: usize,
    pub published: usize,
    pub pending_review: usize,
}

pub struct Aggregator {
    config: EquiverseConfig,
    directory: Arc<KeyDirectory>,
    engine: ValidationEngine,
    series: Arc<RwLock<BenchmarkSeries>>,
    active: Mutex<HashSet<(Sector, Period)>>,
    review: Mutex<Vec<ReviewItem>>,
}

struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<(Sector, Period)>>,
    key: (Sector, Period),
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) { self.active.lock().remove(&self.key); }
}

impl Aggregator {
    pub fn new(config: EquiverseConfig, directory: Arc<KeyDirectory>) -> Self {
        let engine = ValidationEngine::new(config.validation.clone());
        Self {
            config,
            directory,
            engine,
            series: Arc::new(RwLock::new(BenchmarkSeries::new())),
            active: Mutex::new(HashSet::new()),
            review: Mutex::new(Vec::new()),
        }
    }

    pub fn series(&self) -> Arc<RwLock<BenchmarkSeries>> { self.series.clone() }
    pub fn review_queue(&self) -> Vec<ReviewItem> { self.review.lock().clone() }

    pub fn status(&self) -> AggregatorStatus {
        AggregatorStatus {
            active_rounds: self.active.lock().len(),
            published: self.series.read().len(),
            pending_review: self.review.lock().len(),
        }
    }

    fn begin(&self, sector: &Sector, period: Period) -> Result<ActiveGuard<'_>, RoundFailure> {
        let key = (sector.clone(), period);
        if !self.active.lock().insert(key.clone()) {
            return Err(RoundFailure::new(sector, period, ProtocolError::RoundActive.to_string()));
        }
        Ok(ActiveGuard { active: &self.active, key })
    }

    /// Run the secure round, validate the sums and publish when allowed.
    /// Rejected sums reopen the round over the same links.
    #[instrument(skip_all, fields(%sector, %period))]
    pub async fn run_period(
        &self,
        sector: &Sector,
        period: Period,
        links: &mut RoundLinks,
        external_headcount: Option<u64>,
    ) -> Result<PeriodOutcome, RoundFailure> {
        let _guard = self.begin(sector, period)?;
        let driver = RoundDriver::new(self.config.protocol.clone(), self.directory.clone());
        let (history, prior_year) = {
            let series = self.series.read();
            (series.history(sector, period), series.year_ago(sector, period).cloned())
        };
        let mut report = None;
        let accept = |sums: &RoundSums| {
            let r = self.engine.evaluate(sums, external_headcount, &history);
            let publishable = r.outcome != Outcome::Rejected;
            report = Some(r);
            publishable
        };
        let completed = match driver.run(sector, period, links, accept).await {
            Ok(c) => c,
            Err(failure) => {
                warn!(%failure, "period not aggregated");
                return Err(failure);
            }
        };
        let Some(report) = report else {
            return Err(RoundFailure::new(sector, period, "round completed without validation"));
        };
        let mut benchmark = compute_benchmark(&completed.sums, &report, prior_year.as_ref());
        if let Some(b) = benchmark.as_mut() {
            b.version = self.series.write().publish(b.clone());
            info!(version = b.version, outcome = report.outcome.as_str(), tiers = b.per_tier.len(), "benchmark published");
        }
        if report.outcome == Outcome::Anomalous || report.audit_required {
            self.review.lock().push(ReviewItem {
                sector: sector.clone(),
                period,
                round_id: completed.sums.round_id,
                version: benchmark.as_ref().map(|b| b.version),
                findings: report.findings.clone(),
                audit_required: report.audit_required,
            });
        }
        Ok(PeriodOutcome { report, benchmark, attempts: completed.attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_run_for_same_period_is_refused() {
        let agg = Aggregator::new(EquiverseConfig::default(), Arc::new(KeyDirectory::new()));
        let sector = Sector::new("it");
        let guard = agg.begin(&sector, Period::annual(2025)).unwrap();
        assert!(agg.begin(&sector, Period::annual(2025)).is_err());
        assert!(agg.begin(&sector, Period::annual(2024)).is_ok());
        assert_eq!(agg.status().active_rounds, 1);
        drop(guard);
        assert_eq!(agg.status().active_rounds, 0);
        assert!(agg.begin(&sector, Period::annual(2025)).is_ok());
    }
}
