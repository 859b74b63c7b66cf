//! Shared tier statistic model.
//!
//! Every other module speaks in these types. `RawTierSet` is the only type
//! that carries exact per-participant counts. It deserializes from local
//! input and has no serializer, so it never reaches the wire.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Organizational level at which representation is measured.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Board,
    #[serde(rename = "c_suite")]
    CSuite,
    SeniorMgmt,
    MiddleMgmt,
    JuniorMgmt,
    EntryLevel,
}

impl Tier {
    pub const COUNT: usize = 6;
    pub const ALL: [Tier; Tier::COUNT] = [
        Tier::Board,
        Tier::CSuite,
        Tier::SeniorMgmt,
        Tier::MiddleMgmt,
        Tier::JuniorMgmt,
        Tier::EntryLevel,
    ];

    /// Stable position used for vector encodings and digests.
    pub fn index(self) -> usize {
        match self {
            Tier::Board => 0,
            Tier::CSuite => 1,
            Tier::SeniorMgmt => 2,
            Tier::MiddleMgmt => 3,
            Tier::JuniorMgmt => 4,
            Tier::EntryLevel => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Board => "board",
            Tier::CSuite => "c_suite",
            Tier::SeniorMgmt => "senior_mgmt",
            Tier::MiddleMgmt => "middle_mgmt",
            Tier::JuniorMgmt => "junior_mgmt",
            Tier::EntryLevel => "entry_level",
        }
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Industry sector a participant reports under.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sector(String);

impl Sector {
    pub fn new(name: impl Into<String>) -> Self { Self(name.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl Display for Sector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// Reporting period: a year, optionally narrowed to a quarter.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub year: u16,
    #[serde(default)]
    pub quarter: Option<u8>,
}

impl Period {
    pub fn annual(year: u16) -> Self { Self { year, quarter: None } }
    pub fn quarterly(year: u16, quarter: u8) -> Self { Self { year, quarter: Some(quarter) } }

    /// Same sub-period one year earlier; used for year-over-year trend.
    pub fn year_before(self) -> Option<Period> {
        self.year.checked_sub(1).map(|year| Period { year, quarter: self.quarter })
    }

    /// The period immediately before this one at the same granularity.
    pub fn preceding(self) -> Option<Period> {
        match self.quarter {
            Some(q) if q > 1 => Some(Period::quarterly(self.year, q - 1)),
            Some(_) => self.year.checked_sub(1).map(|year| Period::quarterly(year, 4)),
            None => self.year_before(),
        }
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.quarter {
            Some(q) => write!(f, "{}-Q{}", self.year, q),
            None => write!(f, "{}", self.year),
        }
    }
}

/// Exact headcount for one tier. Invariant: `female <= total`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct TierCount {
    pub tier: Tier,
    pub total: u64,
    pub female: u64,
}

impl TierCount {
    pub fn new(tier: Tier, total: u64, female: u64) -> Self { Self { tier, total, female } }
    pub fn is_consistent(&self) -> bool { self.female <= self.total }
}

#[derive(Deserialize)]
struct CountEntry {
    total: u64,
    female: u64,
}

/// Exact per-tier counts for one participant and one reporting period.
///
/// Lives only inside the participant's trust boundary and is consumed by the
/// local privacy transform.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawTierSet {
    counts: BTreeMap<Tier, TierCount>,
}

impl RawTierSet {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, count: TierCount) -> Option<TierCount> { self.counts.insert(count.tier, count) }

    pub fn with(mut self, tier: Tier, total: u64, female: u64) -> Self {
        self.insert(TierCount::new(tier, total, female));
        self
    }

    pub fn get(&self, tier: Tier) -> Option<&TierCount> { self.counts.get(&tier) }
    pub fn iter(&self) -> impl Iterator<Item = &TierCount> { self.counts.values() }
    pub fn len(&self) -> usize { self.counts.len() }
    pub fn is_empty(&self) -> bool { self.counts.is_empty() }

    pub fn headcount(&self) -> u64 { self.counts.values().fold(0, |acc, c| acc.saturating_add(c.total)) }
}

impl<'de> Deserialize<'de> for RawTierSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where D: serde::Deserializer<'de> {
        let entries = BTreeMap::<Tier, CountEntry>::deserialize(deserializer)?;
        let counts = entries
            .into_iter()
            .map(|(tier, e)| (tier, TierCount { tier, total: e.total, female: e.female }))
            .collect();
        Ok(Self { counts })
    }
}

/// A disclosed, noised female percentage. Always within `[0, 100]`.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct NoisedPercentage(f64);

impl NoisedPercentage {
    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && (0.0..=100.0).contains(&value) { Some(Self(value)) } else { None }
    }
    pub fn value(self) -> f64 { self.0 }
}

impl TryFrom<f64> for NoisedPercentage {
    type Error = String;
    fn try_from(v: f64) -> Result<Self, Self::Error> {
        Self::new(v).ok_or_else(|| format!("percentage {v} outside [0, 100]"))
    }
}

impl From<NoisedPercentage> for f64 {
    fn from(p: NoisedPercentage) -> f64 { p.0 }
}
