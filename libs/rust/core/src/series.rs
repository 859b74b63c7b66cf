//! Historical benchmark series.
//!
//! Append-only and versioned by (sector, period): republishing a period adds
//! a superseding version, nothing is ever overwritten.

use std::collections::BTreeMap;

use crate::benchmark::SectorBenchmark;
use crate::tier::{Period, Sector};

#[derive(Debug, Default)]
pub struct BenchmarkSeries {
    entries: BTreeMap<(Sector, Period), Vec<SectorBenchmark>>,
}

impl BenchmarkSeries {
    pub fn new() -> Self { Self::default() }

    /// Append and return the assigned version (1-based).
    pub fn publish(&mut self, mut benchmark: SectorBenchmark) -> u32 {
        let versions = self.entries.entry((benchmark.sector.clone(), benchmark.period)).or_default();
        let version = versions.len() as u32 + 1;
        benchmark.version = version;
        versions.push(benchmark);
        version
    }

    pub fn latest(&self, sector: &Sector, period: Period) -> Option<&SectorBenchmark> {
        self.entries.get(&(sector.clone(), period)).and_then(|v| v.last())
    }

    pub fn versions(&self, sector: &Sector, period: Period) -> &[SectorBenchmark] {
        self.entries.get(&(sector.clone(), period)).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn year_ago(&self, sector: &Sector, period: Period) -> Option<&SectorBenchmark> {
        self.latest(sector, period.year_before()?)
    }

    /// Latest version of every earlier period of the same granularity
    /// (annual or quarterly), oldest first.
    pub fn history(&self, sector: &Sector, before: Period) -> Vec<SectorBenchmark> {
        self.entries
            .iter()
            .filter(|((s, p), _)| s == sector && *p < before && p.quarter.is_some() == before.quarter.is_some())
            .filter_map(|(_, v)| v.last().cloned())
            .collect()
    }

    /// Every published version in (sector, period, version) order.
    pub fn feed(&self) -> impl Iterator<Item = &SectorBenchmark> { self.entries.values().flatten() }

    pub fn len(&self) -> usize { self.entries.values().map(Vec::len).sum() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure_agg::RoundId;
    use crate::validation::Outcome;

    fn bench(sector: &str, period: Period) -> SectorBenchmark {
        SectorBenchmark {
            sector: Sector::new(sector),
            period,
            round_id: RoundId::generate(),
            version: 0,
            participant_count: 5,
            outcome: Outcome::Accepted,
            caveat: None,
            per_tier: BTreeMap::new(),
        }
    }

    #[test]
    fn republishing_supersedes_without_overwrite() {
        let mut s = BenchmarkSeries::new();
        let first = bench("it", Period::annual(2025));
        let first_round = first.round_id;
        assert_eq!(s.publish(first), 1);
        assert_eq!(s.publish(bench("it", Period::annual(2025))), 2);
        assert_eq!(s.versions(&Sector::new("it"), Period::annual(2025)).len(), 2);
        assert_eq!(s.versions(&Sector::new("it"), Period::annual(2025))[0].round_id, first_round);
        assert_eq!(s.latest(&Sector::new("it"), Period::annual(2025)).unwrap().version, 2);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn history_is_ordered_and_scoped() {
        let mut s = BenchmarkSeries::new();
        for y in [2023, 2021, 2022] { s.publish(bench("it", Period::annual(y))); }
        s.publish(bench("it", Period::quarterly(2022, 3)));
        s.publish(bench("retail", Period::annual(2022)));
        let it = Sector::new("it");
        let h = s.history(&it, Period::annual(2024));
        assert_eq!(h.iter().map(|b| b.period.year).collect::<Vec<_>>(), vec![2021, 2022, 2023]);
        assert_eq!(s.history(&it, Period::annual(2023)).last().unwrap().period, Period::annual(2022));
        assert_eq!(s.year_ago(&it, Period::annual(2024)).unwrap().period, Period::annual(2023));
        assert!(s.year_ago(&it, Period::quarterly(2023, 1)).is_none());
    }
}
