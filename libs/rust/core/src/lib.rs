//! Core library for Equiverse privacy-preserving representation benchmarks.
//!
//! Participant side: `intake` -> `privacy` -> `participant` (masking via
//! `secure_agg::masking`). Aggregator side: `secure_agg::{round, driver}` ->
//! `validation` -> `benchmark` -> `series`, orchestrated by `aggregator`.

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use std::path::Path;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub mod aggregator;
pub mod audit;
pub mod benchmark;
pub mod disclosure;
pub mod error;
pub mod identity;
pub mod intake;
pub mod metrics;
pub mod participant;
pub mod privacy;
pub mod secure_agg;
pub mod series;
pub mod settings;
pub mod tier;
pub mod validation;

pub use aggregator::{Aggregator, AggregatorStatus, PeriodOutcome, ReviewItem};
pub use audit::{AuditRecord, AuditTrail};
pub use benchmark::{compute_benchmark, RankBucket, SectorBenchmark, TierBenchmark};
pub use disclosure::{Badge, Disclosure, DisclosureConfig, DisclosureRegistry};
pub use error::{AbortReason, IdentityError, PrivacyError, ProtocolError, RoundFailure};
pub use identity::{KeyDirectory, ParticipantId, ParticipantIdentity};
pub use intake::{tally, tally_rows, EmployeeRecord, EmployeeRow, Gender, TierClassifier, TierRule};
pub use participant::{ParticipantAgent, ParticipantOutcome};
pub use privacy::{LocalPrivacyTransform, PreparedSubmission};
pub use secure_agg::{ProtocolPhase, RoundId, RoundStatus};
pub use series::BenchmarkSeries;
pub use settings::{EquiverseConfig, NoiseMechanism, NoiseSeeding, PrivacyConfig, ProtocolConfig, ValidationConfig};
pub use tier::{NoisedPercentage, Period, RawTierSet, Sector, Tier, TierCount};
pub use validation::{Finding, Outcome, ValidationEngine, ValidationReport};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber once. `RUST_LOG` wins over `default_level`;
/// `EQUIVERSE_JSON_LOG=1|true` switches to JSON lines.
pub fn init_tracing(service: &str, default_level: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("EQUIVERSE_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry
                .with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false))
                .try_init()?;
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(target: "equiverse", service, "tracing initialized");
    Ok(())
}

/// Defaults, then the file named by `EQUIVERSE_CONFIG_FILE` (if any), then
/// `EQUIVERSE__SECTION__KEY` environment overrides.
pub fn load_config() -> Result<EquiverseConfig> {
    let file = std::env::var("EQUIVERSE_CONFIG_FILE").ok();
    load_config_from(file.as_deref().map(Path::new))
}

pub fn load_config_from(file: Option<&Path>) -> Result<EquiverseConfig> {
    let mut builder = config::Config::builder().add_source(config::Config::try_from(&EquiverseConfig::default())?);
    if let Some(path) = file {
        builder = builder.add_source(config::File::from(path).required(true));
    }
    builder = builder.add_source(config::Environment::with_prefix("EQUIVERSE").separator("__").try_parsing(true));
    let cfg: EquiverseConfig = builder
        .build()?
        .try_deserialize()
        .context("deserializing equiverse configuration")?;
    cfg.validate()?;
    Ok(cfg)
}
