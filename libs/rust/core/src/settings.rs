//! Configuration surface consumed by the transform, protocol and validation
//! layers. Values come from `load_config` (defaults, file, environment).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::PrivacyError;

/// Noise distribution used by the local privacy transform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseMechanism {
    Gaussian,
    Laplace,
}

/// How noise randomness is seeded across reporting periods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseSeeding {
    /// Derived from the participant's noise key and the exact counts, so
    /// re-reporting unchanged counts discloses the same value every period.
    Persistent,
    /// Fresh OS entropy on every run.
    Fresh,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub epsilon: f64,
    pub delta: f64,
    pub k_min: u64,
    pub round_to: u32,
    pub noise_range: f64,
    pub mechanism: NoiseMechanism,
    pub seeding: NoiseSeeding,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            epsilon: 1.0,
            delta: 1e-5,
            k_min: 50,
            round_to: 1,
            noise_range: 5.0,
            mechanism: NoiseMechanism::Gaussian,
            seeding: NoiseSeeding::Persistent,
        }
    }
}

impl PrivacyConfig {
    pub fn validate(&self) -> Result<(), PrivacyError> {
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(PrivacyError::InvalidConfig(format!("epsilon must be > 0, got {}", self.epsilon)));
        }
        if !(self.delta > 0.0 && self.delta < 1.0) {
            return Err(PrivacyError::InvalidConfig(format!("delta must be in (0,1), got {}", self.delta)));
        }
        if self.round_to == 0 {
            return Err(PrivacyError::InvalidConfig("round_to must be >= 1".into()));
        }
        if !(self.noise_range.is_finite() && self.noise_range >= 0.0) {
            return Err(PrivacyError::InvalidConfig(format!("noise_range must be >= 0, got {}", self.noise_range)));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Max period-over-period move of a tier average, in percentage points.
    pub max_trend_delta: f64,
    pub min_cohort_size: usize,
    /// Relative band around the external headcount total.
    pub cross_total_tolerance: f64,
    /// Relative headcount change that corroborates a large trend move.
    pub corroborating_headcount_change: f64,
    /// Consecutive cross-total deviations before a manual audit is requested.
    pub audit_after_consecutive: u32,
    pub trend_outlier_threshold: f64,
    pub min_history: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_trend_delta: 10.0,
            min_cohort_size: 5,
            cross_total_tolerance: 0.05,
            corroborating_headcount_change: 0.15,
            audit_after_consecutive: 2,
            trend_outlier_threshold: 3.5,
            min_history: 4,
        }
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_trend_delta >= 0.0, "max_trend_delta must be >= 0");
        anyhow::ensure!(self.cross_total_tolerance >= 0.0, "cross_total_tolerance must be >= 0");
        anyhow::ensure!(self.corroborating_headcount_change >= 0.0, "corroborating_headcount_change must be >= 0");
        anyhow::ensure!(self.audit_after_consecutive >= 1, "audit_after_consecutive must be >= 1");
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub phase_timeout_ms: u64,
    /// Extra wait after re-requesting a missing submission.
    pub resubmit_grace_ms: u64,
    pub max_attempts: u32,
    pub min_participants: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self { Self { phase_timeout_ms: 30_000, resubmit_grace_ms: 5_000, max_attempts: 3, min_participants: 2 } }
}

impl ProtocolConfig {
    /// Smallest roster the protocol ever runs with; a lone participant's
    /// "sum" would be its own contribution.
    pub const FLOOR: usize = 2;

    pub fn phase_timeout(&self) -> Duration { Duration::from_millis(self.phase_timeout_ms) }
    pub fn resubmit_grace(&self) -> Duration { Duration::from_millis(self.resubmit_grace_ms) }
    pub fn min_roster(&self) -> usize { self.min_participants.max(Self::FLOOR) }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.phase_timeout_ms > 0, "phase_timeout_ms must be > 0");
        anyhow::ensure!(self.max_attempts >= 1, "max_attempts must be >= 1");
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquiverseConfig {
    pub service_name: Option<String>,
    pub log_level: Option<String>,
    pub privacy: PrivacyConfig,
    pub validation: ValidationConfig,
    pub protocol: ProtocolConfig,
}

impl Default for EquiverseConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            log_level: Some("info".into()),
            privacy: PrivacyConfig::default(),
            validation: ValidationConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl EquiverseConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.privacy.validate()?;
        self.validation.validate()?;
        self.protocol.validate()?;
        Ok(())
    }
}
