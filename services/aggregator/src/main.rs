use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use equiverse_core::{
    init_tracing, load_config, Aggregator, AuditTrail, EquiverseConfig, KeyDirectory, ParticipantAgent, ParticipantIdentity,
    RawTierSet,
};
use equiverse_core::secure_agg::RoundLinks;

mod cohort;
mod health;

const CHANNEL_CAPACITY: usize = 64;

struct Enrolled {
    identity: ParticipantIdentity,
    label: String,
    raw: RawTierSet,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = load_config()?;
    init_tracing("equiverse-aggregator", cfg.log_level.as_deref().unwrap_or("info"))?;
    health::init_metrics()?;

    let cohort_path = PathBuf::from(std::env::var("EQUIVERSE_COHORT_FILE").unwrap_or_else(|_| "cohort.yaml".into()));
    let cohort = cohort::load(&cohort_path)?;
    let classifier = cohort.classifier.clone().unwrap_or_default();
    let audit_dir = std::env::var("EQUIVERSE_AUDIT_DIR").ok().map(PathBuf::from);

    // enrol every participant first: the key directory is fixed for the run
    let mut directory = KeyDirectory::new();
    let mut sectors = Vec::new();
    for sc in cohort.sectors {
        let mut enrolled = Vec::new();
        for p in &sc.participants {
            let identity = p.identity()?;
            directory.register(identity.verifying_key());
            enrolled.push(Enrolled { identity, label: p.label.clone(), raw: p.raw_counts(&classifier)? });
        }
        sectors.push((sc.sector, sc.external_headcount, enrolled));
    }
    let directory = Arc::new(directory);
    let aggregator = Arc::new(Aggregator::new(cfg.clone(), directory.clone()));

    let port = std::env::var("EQUIVERSE_HEALTH_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(9109);
    health::start_health_server(port, aggregator.clone()).await?;
    health::mark_ready();
    info!(sectors = sectors.len(), period = %cohort.period, "service ready");

    let period = cohort.period;
    let mut tasks = JoinSet::new();
    for (sector, external_headcount, enrolled) in sectors {
        let aggregator = aggregator.clone();
        let directory = directory.clone();
        let cfg = cfg.clone();
        let audit_dir = audit_dir.clone();
        tasks.spawn(async move {
            let (mut links, outbox) = RoundLinks::new(CHANNEL_CAPACITY);
            let mut agents = JoinSet::new();
            for e in enrolled {
                let inbox = links.attach(e.identity.id().clone(), CHANNEL_CAPACITY);
                let agent = participant_agent(e, &directory, &cfg, audit_dir.as_ref());
                agents.spawn(agent.run(inbox, outbox.clone()));
            }
            drop(outbox);
            let result = aggregator.run_period(&sector, period, &mut links, external_headcount).await;
            drop(links);
            while let Some(joined) = agents.join_next().await {
                match joined {
                    Ok(Err(e)) => warn!(%sector, error = %e, "participant agent failed"),
                    Err(e) => warn!(%sector, error = %e, "participant agent panicked"),
                    Ok(Ok(_)) => {}
                }
            }
            (sector, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (sector, result) = joined.context("sector task panicked")?;
        match result {
            Ok(outcome) => info!(%sector, outcome = outcome.report.outcome.as_str(), attempts = outcome.attempts, "period processed"),
            Err(failure) => error!(%sector, "{failure}"),
        }
    }

    // publication feed: every published version, one JSON object per line
    for benchmark in aggregator.series().read().feed() {
        println!("{}", serde_json::to_string(benchmark)?);
    }
    for item in aggregator.review_queue() {
        info!(sector = %item.sector, period = %item.period, audit_required = item.audit_required, findings = item.findings.len(), "queued for review");
    }

    signal::ctrl_c().await?;
    info!("shutdown");
    Ok(())
}

fn participant_agent(
    e: Enrolled,
    directory: &Arc<KeyDirectory>,
    cfg: &EquiverseConfig,
    audit_dir: Option<&PathBuf>,
) -> ParticipantAgent {
    let agent = ParticipantAgent::new(e.identity, directory.clone(), cfg.privacy.clone(), e.raw);
    match audit_dir {
        Some(dir) => agent.with_audit_trail(AuditTrail::open(dir.join(format!("{}.jsonl", e.label)))),
        None => agent,
    }
}
