//! Cohort file: the sectors to aggregate and the participants that report
//! into each, as run in-process by this service.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use equiverse_core::{tally_rows, EmployeeRow, ParticipantIdentity, Period, RawTierSet, Sector, TierClassifier};

#[derive(Debug, Deserialize)]
pub struct CohortFile {
    pub period: Period,
    #[serde(default)]
    pub classifier: Option<TierClassifier>,
    pub sectors: Vec<SectorCohort>,
}

#[derive(Debug, Deserialize)]
pub struct SectorCohort {
    pub sector: Sector,
    /// Headcount from an external registry, for the cross-total check.
    #[serde(default)]
    pub external_headcount: Option<u64>,
    pub participants: Vec<ParticipantEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ParticipantEntry {
    /// Local label; never sent to the aggregator.
    pub label: String,
    /// Hex-encoded 32-byte signing key; generated when absent.
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub counts: Option<RawTierSet>,
    #[serde(default)]
    pub employees: Vec<EmployeeRow>,
}

impl ParticipantEntry {
    pub fn identity(&self) -> Result<ParticipantIdentity> {
        let Some(hex_key) = &self.secret_key else { return Ok(ParticipantIdentity::generate()) };
        let bytes = hex::decode(hex_key.trim()).with_context(|| format!("participant {}: secret_key is not hex", self.label))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("participant {}: secret_key must be 32 bytes", self.label))?;
        Ok(ParticipantIdentity::from_secret_bytes(&bytes))
    }

    /// Exact counts, either given directly or tallied from employee rows.
    pub fn raw_counts(&self, classifier: &TierClassifier) -> Result<RawTierSet> {
        match (&self.counts, self.employees.is_empty()) {
            (Some(c), true) => Ok(c.clone()),
            (None, false) => Ok(tally_rows(classifier, &self.employees)),
            (Some(_), false) => bail!("participant {}: give either counts or employees, not both", self.label),
            (None, true) => bail!("participant {}: no counts or employees", self.label),
        }
    }
}

pub fn load(path: &Path) -> Result<CohortFile> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading cohort file {}", path.display()))?;
    let cohort: CohortFile = serde_yaml::from_str(&text).context("parsing cohort file")?;
    if cohort.sectors.is_empty() { bail!("cohort file lists no sectors"); }
    Ok(cohort)
}
