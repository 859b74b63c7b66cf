#![allow(dead_code)]

use std::sync::Arc;
use tokio::task::JoinSet;

use equiverse_core::secure_agg::{RoundLinks, ToAggregator};
use equiverse_core::{
    EquiverseConfig, KeyDirectory, ParticipantAgent, ParticipantIdentity, ParticipantOutcome, ProtocolError, RawTierSet, Tier,
};

pub type Agents = JoinSet<Result<ParticipantOutcome, ProtocolError>>;

pub fn config(min_cohort: usize) -> EquiverseConfig {
    let mut cfg = EquiverseConfig::default();
    cfg.privacy.k_min = 50;
    cfg.validation.min_cohort_size = min_cohort;
    cfg.protocol.phase_timeout_ms = 500;
    cfg.protocol.resubmit_grace_ms = 200;
    cfg
}

pub fn identities(n: u8) -> Vec<ParticipantIdentity> {
    (0..n).map(|i| ParticipantIdentity::from_secret_bytes(&[i + 40; 32])).collect()
}

pub fn directory(idents: &[&ParticipantIdentity]) -> Arc<KeyDirectory> {
    let mut dir = KeyDirectory::new();
    for i in idents { dir.register(i.verifying_key()); }
    Arc::new(dir)
}

pub fn senior(total: u64, female: u64) -> RawTierSet { RawTierSet::new().with(Tier::SeniorMgmt, total, female) }

/// Wire honest agents into fresh links. The returned sender lets a test
/// attach scripted participants of its own.
pub fn wire(
    cfg: &EquiverseConfig,
    dir: &Arc<KeyDirectory>,
    members: Vec<(ParticipantIdentity, RawTierSet)>,
) -> (RoundLinks, tokio::sync::mpsc::Sender<ToAggregator>, Agents) {
    let (mut links, outbox) = RoundLinks::new(64);
    let mut agents = JoinSet::new();
    for (identity, raw) in members {
        let inbox = links.attach(identity.id().clone(), 64);
        let agent = ParticipantAgent::new(identity, dir.clone(), cfg.privacy.clone(), raw);
        agents.spawn(agent.run(inbox, outbox.clone()));
    }
    (links, outbox, agents)
}

pub async fn outcomes(mut agents: Agents) -> Vec<ParticipantOutcome> {
    let mut out = Vec::new();
    while let Some(j) = agents.join_next().await {
        out.push(j.expect("agent task").expect("agent result"));
    }
    out
}
