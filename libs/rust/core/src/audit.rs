//! Participant-local audit trail of validation hashes.
//!
//! Never transmitted. Lets a participant later prove to itself which exact
//! counts it reported for a given sector and period.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::identity::ParticipantIdentity;
use crate::privacy::tier_validation_hash;
use crate::secure_agg::RoundId;
use crate::tier::{Period, RawTierSet, Sector, Tier};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sector: Sector,
    pub period: Period,
    #[serde(default)]
    pub round_id: Option<RoundId>,
    /// Digest over the per-tier hashes in tier order.
    pub validation_hash: String,
    pub tier_hashes: BTreeMap<Tier, String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub(crate) fn new(sector: Sector, period: Period, tier_hashes: BTreeMap<Tier, String>) -> Self {
        let mut h = Sha256::new();
        for (tier, th) in &tier_hashes {
            h.update([tier.index() as u8]);
            h.update(th.as_bytes());
        }
        let validation_hash = hex::encode(h.finalize());
        Self { sector, period, round_id: None, validation_hash, tier_hashes, recorded_at: Utc::now() }
    }

    /// Recompute the hashes for `raw` and compare with this record.
    pub fn matches(&self, identity: &ParticipantIdentity, raw: &RawTierSet) -> bool {
        let salt = identity.audit_salt();
        let recomputed: BTreeMap<Tier, String> = raw
            .iter()
            .map(|c| (c.tier, tier_validation_hash(&salt, &self.sector, self.period, c)))
            .collect();
        recomputed == self.tier_hashes
    }
}

/// Append-only JSON-lines log on local disk.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    path: PathBuf,
}

impl AuditTrail {
    pub fn open(path: impl AsRef<Path>) -> Self { Self { path: path.as_ref().to_path_buf() } }

    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening audit trail {}", self.path.display()))?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn records(&self) -> Result<Vec<AuditRecord>> {
        if !self.path.exists() { return Ok(Vec::new()); }
        let file = std::fs::File::open(&self.path)?;
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() { continue; }
            out.push(serde_json::from_str(&line).context("corrupt audit trail line")?);
        }
        Ok(out)
    }

    pub fn find(&self, sector: &Sector, period: Period) -> Result<Option<AuditRecord>> {
        Ok(self.records()?.into_iter().rev().find(|r| &r.sector == sector && r.period == period))
    }
}
