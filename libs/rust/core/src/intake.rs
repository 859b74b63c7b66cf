//! HR export intake: normalizes employee rows and tallies exact tier counts.
//!
//! Runs inside the participant boundary. Rows carry no personal identifiers;
//! the output is the `RawTierSet` fed to the local privacy transform.

use serde::{Deserialize, Serialize};

use crate::tier::{RawTierSet, Tier, TierCount};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    /// Map the many spellings HR systems use; anything unrecognized is `Other`.
    pub fn normalize(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "M" | "MALE" | "1" | "MAN" | "HE" => Gender::Male,
            "F" | "FEMALE" | "2" | "WOMAN" | "SHE" => Gender::Female,
            _ => Gender::Other,
        }
    }
}

/// One row as exported by the HR system.
#[derive(Clone, Debug, Deserialize)]
pub struct EmployeeRow {
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub grade: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool { true }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmployeeRecord {
    pub gender: Gender,
    pub tier: Tier,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TierRule {
    pub tier: Tier,
    /// Matched as lowercase substrings of the job title.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Matched exactly (case-insensitive) against the grade code.
    #[serde(default)]
    pub grades: Vec<String>,
}

/// Title/grade to tier mapping. Rules are checked in order, highest tier first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierClassifier {
    rules: Vec<TierRule>,
}

fn rule(tier: Tier, keywords: &[&str], grades: &[&str]) -> TierRule {
    TierRule {
        tier,
        keywords: keywords.iter().map(|s| s.to_string()).collect(),
        grades: grades.iter().map(|s| s.to_string()).collect(),
    }
}

impl Default for TierClassifier {
    fn default() -> Self {
        Self {
            rules: vec![
                rule(Tier::Board, &["board", "director", "non-executive", "independent director", "chairman", "chairperson"], &[]),
                rule(
                    Tier::CSuite,
                    &["ceo", "cfo", "cto", "coo", "cmo", "cpo", "chro", "cio", "chief", "managing director", "md", "president", "executive director", "ed", "svp", "senior vice president"],
                    &["E1", "E2", "L10", "L9"],
                ),
                rule(
                    Tier::SeniorMgmt,
                    &["vice president", "vp ", "avp", "associate vice president", "general manager", "gm", "senior director", "head of", "principal", "evp"],
                    &["E3", "E4", "L8", "L7", "M5", "M4"],
                ),
                rule(
                    Tier::MiddleMgmt,
                    &["director", "senior manager", "manager", "associate director", "program manager", "delivery manager", "project manager"],
                    &["M3", "M2", "L6", "L5"],
                ),
                rule(
                    Tier::JuniorMgmt,
                    &["lead", "team lead", "tech lead", "senior consultant", "senior analyst", "senior engineer", "senior developer", "senior associate", "supervisor", "assistant manager"],
                    &["M1", "L4", "L3", "A4", "A3"],
                ),
                rule(
                    Tier::EntryLevel,
                    &["analyst", "associate", "engineer", "developer", "consultant", "executive", "trainee", "intern", "graduate", "fresher"],
                    &["A2", "A1", "L2", "L1", "T1", "T2"],
                ),
            ],
        }
    }
}

impl TierClassifier {
    pub fn new(mut rules: Vec<TierRule>) -> Self {
        rules.sort_by_key(|r| r.tier);
        Self { rules }
    }

    pub fn classify(&self, title: &str, grade: Option<&str>) -> Option<Tier> {
        let title = title.to_lowercase();
        let grade = grade.map(|g| g.trim().to_ascii_uppercase()).unwrap_or_default();
        self.rules
            .iter()
            .find(|r| {
                r.keywords.iter().any(|k| title.contains(k.as_str()))
                    || (!grade.is_empty() && r.grades.iter().any(|g| g.eq_ignore_ascii_case(&grade)))
            })
            .map(|r| r.tier)
    }

    /// `None` for rows that cannot be placed in any tier.
    pub fn record(&self, row: &EmployeeRow) -> Option<EmployeeRecord> {
        let tier = self.classify(&row.title, row.grade.as_deref())?;
        Some(EmployeeRecord { gender: Gender::normalize(&row.gender), tier, active: row.active })
    }
}

/// Exact per-tier counts over active employees. `total` counts every gender.
pub fn tally<'a>(records: impl IntoIterator<Item = &'a EmployeeRecord>) -> RawTierSet {
    let mut counts = [(0u64, 0u64); Tier::COUNT];
    let mut seen = [false; Tier::COUNT];
    for r in records.into_iter().filter(|r| r.active) {
        let c = &mut counts[r.tier.index()];
        c.0 += 1;
        if r.gender == Gender::Female { c.1 += 1; }
        seen[r.tier.index()] = true;
    }
    let mut raw = RawTierSet::new();
    for tier in Tier::ALL {
        if seen[tier.index()] {
            let (total, female) = counts[tier.index()];
            raw.insert(TierCount::new(tier, total, female));
        }
    }
    raw
}

/// Classify and tally rows in one pass; unclassifiable rows are skipped.
pub fn tally_rows(classifier: &TierClassifier, rows: &[EmployeeRow]) -> RawTierSet {
    let records: Vec<EmployeeRecord> = rows.iter().filter_map(|r| classifier.record(r)).collect();
    tally(&records)
}
