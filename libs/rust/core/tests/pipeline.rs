mod common;

use std::io::Write;
use std::sync::Arc;

use common::{config, directory, identities, outcomes, senior, wire};
use equiverse_core::{
    Aggregator, AuditTrail, Outcome, ParticipantAgent, ParticipantOutcome, Period, PrivacyError, RawTierSet, Sector, Tier,
};
use equiverse_core::secure_agg::RoundLinks;
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

/// In-memory log sink shared with the subscriber under test.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;
    fn make_writer(&'a self) -> Self::Writer { self.clone() }
}

/// Every number and word that appears in a JSON log value, split on anything
/// that is not alphanumeric, so ids and timestamps never count as a match.
fn tokens(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => map.values().for_each(|v| tokens(v, out)),
        serde_json::Value::Array(items) => items.iter().for_each(|v| tokens(v, out)),
        serde_json::Value::String(s) => {
            out.extend(s.split(|c: char| !c.is_ascii_alphanumeric()).filter(|t| !t.is_empty()).map(str::to_string))
        }
        other => out.push(other.to_string()),
    }
}

#[tokio::test]
async fn three_participant_example_publishes_pooled_average() {
    let cfg = config(3);
    let ids = identities(3);
    let dir = directory(&ids.iter().collect::<Vec<_>>());
    let agg = Aggregator::new(cfg.clone(), dir.clone());
    let members = ids.into_iter().zip([senior(150, 45), senior(120, 50), senior(90, 10)]).collect();
    let (mut links, outbox, agents) = wire(&cfg, &dir, members);
    drop(outbox);

    let out = agg.run_period(&Sector::new("it"), Period::annual(2025), &mut links, Some(360)).await.unwrap();
    drop(links);

    assert_eq!(out.report.outcome, Outcome::Accepted);
    assert_eq!(out.attempts, 1);
    let b = out.benchmark.expect("published");
    assert_eq!(b.version, 1);
    let t = &b.per_tier[&Tier::SeniorMgmt];
    assert_eq!(t.headcount, 360);
    assert!((t.avg_female_pct - 29.1667).abs() < 1e-3);
    assert_eq!(t.participant_count, 3);
    assert!(t.trend_yoy.is_none());

    for o in outcomes(agents).await {
        assert_eq!(o, ParticipantOutcome::Contributed { round_id: b.round_id });
    }
    assert_eq!(agg.series().read().len(), 1);
}

#[tokio::test]
async fn aggregator_logs_never_carry_an_individual_count() {
    let sink = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .without_time()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(sink.clone())
        .finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let cfg = config(3);
    let ids = identities(3);
    let dir = directory(&ids.iter().collect::<Vec<_>>());
    let agg = Aggregator::new(cfg.clone(), dir.clone());
    let members = ids.into_iter().zip([senior(150, 45), senior(120, 50), senior(90, 10)]).collect();
    let (mut links, outbox, agents) = wire(&cfg, &dir, members);
    drop(outbox);
    let out = agg.run_period(&Sector::new("it"), Period::annual(2025), &mut links, Some(360)).await.unwrap();
    drop(links);
    outcomes(agents).await;
    assert!(out.benchmark.is_some());

    let text = String::from_utf8(sink.0.lock().clone()).unwrap();
    assert!(text.contains("round completed"), "nothing captured: {text}");
    let mut seen = Vec::new();
    for line in text.lines() {
        let event: serde_json::Value = serde_json::from_str(line).unwrap();
        tokens(&event, &mut seen);
    }
    for private in ["150", "45", "120", "50", "90", "10"] {
        assert!(!seen.iter().any(|t| t == private), "{private} leaked into logs:\n{text}");
    }
}

#[tokio::test]
async fn suppressed_tier_still_counts_in_headcount_but_not_reporters() {
    let cfg = config(3);
    let ids = identities(4);
    let dir = directory(&ids.iter().collect::<Vec<_>>());
    let agg = Aggregator::new(cfg.clone(), dir.clone());
    let small = RawTierSet::new().with(Tier::SeniorMgmt, 30, 10).with(Tier::EntryLevel, 200, 90);
    let members = ids.into_iter().zip([senior(150, 45), senior(120, 50), senior(90, 10), small]).collect();
    let (mut links, outbox, agents) = wire(&cfg, &dir, members);
    drop(outbox);

    let out = agg.run_period(&Sector::new("it"), Period::annual(2025), &mut links, None).await.unwrap();
    drop(links);
    let b = out.benchmark.unwrap();
    let senior_mgmt = &b.per_tier[&Tier::SeniorMgmt];
    assert_eq!(senior_mgmt.participant_count, 3);
    assert_eq!(senior_mgmt.headcount, 390);
    assert_eq!(b.per_tier[&Tier::EntryLevel].participant_count, 1);
    assert_eq!(b.participant_count, 4);
    assert_eq!(outcomes(agents).await.len(), 4);
}

#[tokio::test]
async fn two_participants_below_min_cohort_are_not_published() {
    let cfg = config(5);
    let ids = identities(2);
    let dir = directory(&ids.iter().collect::<Vec<_>>());
    let agg = Aggregator::new(cfg.clone(), dir.clone());
    let members = ids.into_iter().zip([senior(150, 45), senior(120, 50)]).collect();
    let (mut links, outbox, agents) = wire(&cfg, &dir, members);
    drop(outbox);

    let out = agg.run_period(&Sector::new("it"), Period::annual(2025), &mut links, None).await.unwrap();
    drop(links);
    assert_eq!(out.report.outcome, Outcome::InsufficientCohort);
    assert!(out.benchmark.is_none());
    assert!(agg.series().read().is_empty());
    assert_eq!(agg.status().published, 0);
    assert_eq!(outcomes(agents).await.len(), 2);
}

#[tokio::test]
async fn participant_with_nothing_to_disclose_declines_and_round_restarts() {
    let cfg = config(2);
    let ids = identities(3);
    let dir = directory(&ids.iter().collect::<Vec<_>>());
    let agg = Aggregator::new(cfg.clone(), dir.clone());
    let tiny = RawTierSet::new().with(Tier::Board, 12, 3);
    let members = ids.into_iter().zip([senior(150, 45), senior(120, 50), tiny]).collect();
    let (mut links, outbox, agents) = wire(&cfg, &dir, members);
    drop(outbox);

    let out = agg.run_period(&Sector::new("it"), Period::annual(2025), &mut links, None).await.unwrap();
    drop(links);
    assert_eq!(out.attempts, 2);
    let b = out.benchmark.unwrap();
    assert_eq!(b.participant_count, 2);
    assert_eq!(b.per_tier[&Tier::SeniorMgmt].headcount, 270);
    assert!(!b.per_tier.contains_key(&Tier::Board));

    let results = outcomes(agents).await;
    assert!(results.contains(&ParticipantOutcome::Declined(PrivacyError::InsufficientData)));
    assert_eq!(results.iter().filter(|o| matches!(o, ParticipantOutcome::Contributed { .. })).count(), 2);
}

#[tokio::test]
async fn next_year_carries_trend_and_audit_trail_records_round() {
    let cfg = config(2);
    let ids = identities(2);
    let dir = directory(&ids.iter().collect::<Vec<_>>());
    let agg = Aggregator::new(cfg.clone(), dir.clone());
    let tmp = tempfile::tempdir().unwrap();
    let trail = AuditTrail::open(tmp.path().join("p0.jsonl"));
    let sector = Sector::new("finance");

    let mut last = None;
    for (year, female) in [(2024u16, 40u64), (2025, 60)] {
        let (mut links, outbox) = RoundLinks::new(16);
        let mut agents = tokio::task::JoinSet::new();
        for (i, ident) in identities(2).into_iter().enumerate() {
            let inbox = links.attach(ident.id().clone(), 16);
            let mut agent = ParticipantAgent::new(ident, dir.clone(), cfg.privacy.clone(), senior(200, female));
            if i == 0 { agent = agent.with_audit_trail(trail.clone()); }
            agents.spawn(agent.run(inbox, outbox.clone()));
        }
        drop(outbox);
        let out = agg.run_period(&sector, Period::annual(year), &mut links, None).await.unwrap();
        drop(links);
        while agents.join_next().await.is_some() {}
        last = out.benchmark;
    }

    let b = last.unwrap();
    let trend = b.per_tier[&Tier::SeniorMgmt].trend_yoy.unwrap();
    assert!((trend - 10.0).abs() < 1e-9);
    let record = trail.find(&sector, Period::annual(2025)).unwrap().unwrap();
    assert_eq!(record.round_id, Some(b.round_id));
    assert!(record.matches(&ids[0], &senior(200, 60)));
    assert_eq!(trail.records().unwrap().len(), 2);
}

#[tokio::test]
async fn sectors_run_concurrently_on_one_aggregator() {
    let cfg = config(2);
    let ids = identities(4);
    let dir = directory(&ids.iter().collect::<Vec<_>>());
    let agg = Arc::new(Aggregator::new(cfg.clone(), dir.clone()));
    let mut ids = ids.into_iter();
    let it_members = ids.by_ref().take(2).zip([senior(150, 45), senior(120, 50)]).collect();
    let retail_members = ids.zip([senior(300, 160), senior(80, 41)]).collect();
    let (mut it_links, it_out, it_agents) = wire(&cfg, &dir, it_members);
    let (mut retail_links, retail_out, retail_agents) = wire(&cfg, &dir, retail_members);
    drop((it_out, retail_out));

    let (it_sector, retail_sector) = (Sector::new("it"), Sector::new("retail"));
    let (it, retail) = tokio::join!(
        agg.run_period(&it_sector, Period::annual(2025), &mut it_links, None),
        agg.run_period(&retail_sector, Period::annual(2025), &mut retail_links, None),
    );
    drop((it_links, retail_links));
    assert_eq!(it.unwrap().benchmark.unwrap().per_tier[&Tier::SeniorMgmt].headcount, 270);
    assert_eq!(retail.unwrap().benchmark.unwrap().per_tier[&Tier::SeniorMgmt].headcount, 380);
    outcomes(it_agents).await;
    outcomes(retail_agents).await;
    assert_eq!(agg.status().published, 2);
    assert_eq!(agg.status().active_rounds, 0);
}
