//! Aggregator-side round driver.
//!
//! Runs one sector/period through as many rounds as it takes: barrier phases
//! bounded by `phase_timeout`, one re-request with `resubmit_grace` for late
//! submissions, then abort and reopen with the responsive participants under
//! a fresh round id (and therefore fresh masks). Decline and abort notices
//! are only honoured when signed by the member they name. Logs stay at round
//! level and never name the participant that stalled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::messages::{ToAggregator, ToParticipant};
use super::round::{AggregationRound, RoundSums};
use super::ProtocolPhase;
use crate::error::{AbortReason, ProtocolError, RoundFailure};
use crate::identity::{KeyDirectory, ParticipantId};
use crate::metrics::{record_abort, AGGREGATION_METRICS};
use crate::settings::ProtocolConfig;
use crate::tier::{Period, Sector};

/// Channels between the aggregator and the current participant set.
pub struct RoundLinks {
    pub outbound: BTreeMap<ParticipantId, mpsc::Sender<ToParticipant>>,
    pub inbound: mpsc::Receiver<ToAggregator>,
}

impl RoundLinks {
    /// Create the shared inbound queue; hand the sender to every participant.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<ToAggregator>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { outbound: BTreeMap::new(), inbound: rx }, tx)
    }

    /// Register a participant and return its inbox.
    pub fn attach(&mut self, id: ParticipantId, capacity: usize) -> mpsc::Receiver<ToParticipant> {
        let (tx, rx) = mpsc::channel(capacity);
        self.outbound.insert(id, tx);
        rx
    }
}

#[derive(Clone, Debug)]
pub struct CompletedRound {
    pub sums: RoundSums,
    /// Rounds opened for this period, including aborted ones.
    pub attempts: u32,
}

enum Halt {
    Abort { reason: AbortReason, responsive: Vec<ParticipantId> },
    Fatal(ProtocolError),
}

enum Step {
    Wait,
    Relay(super::KeyBundle),
    RequestSubmissions,
    Unmask,
}

pub struct RoundDriver {
    config: ProtocolConfig,
    directory: Arc<KeyDirectory>,
}

impl RoundDriver {
    pub fn new(config: ProtocolConfig, directory: Arc<KeyDirectory>) -> Self { Self { config, directory } }

    /// Drive rounds until one completes with sums `accept` takes. A round
    /// whose sums are refused is aborted and reopened over the same roster,
    /// counting against `max_attempts` like any other abort.
    pub async fn run(
        &self,
        sector: &Sector,
        period: Period,
        links: &mut RoundLinks,
        mut accept: impl FnMut(&RoundSums) -> bool,
    ) -> Result<CompletedRound, RoundFailure> {
        let mut roster: Vec<ParticipantId> = links.outbound.keys().filter(|id| self.directory.contains(id)).cloned().collect();
        if roster.len() < links.outbound.len() {
            warn!(%sector, %period, unknown = links.outbound.len() - roster.len(), "links without registered identity ignored");
        }
        let started = StdInstant::now();
        let mut attempts = 0u32;
        let mut opened = 0u32;
        loop {
            let mut round = AggregationRound::open(sector.clone(), period, roster.clone(), self.config.min_roster())
                .map_err(|e| RoundFailure::new(sector, period, e.to_string()))?;
            opened += 1;
            AGGREGATION_METRICS.rounds_opened_total.add(1, &[]);

            let (reason, responsive) = match self.drive(&mut round, links).await {
                Ok(sums) if accept(&sums) => {
                    self.broadcast(links, round.roster(), ToParticipant::Completed { round_id: round.round_id() }).await;
                    AGGREGATION_METRICS.rounds_completed_total.add(1, &[]);
                    AGGREGATION_METRICS.aggregation_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
                    info!(round_id = %round.round_id(), %sector, %period, participants = sums.participant_count, "round completed");
                    return Ok(CompletedRound { sums, attempts: opened });
                }
                // Unmasked already, so the round itself cannot abort; its sums are dropped here.
                Ok(_) => (AbortReason::Rejected, round.roster().to_vec()),
                Err(Halt::Fatal(e)) => {
                    let _ = round.abort(AbortReason::ParticipantLost);
                    self.broadcast(links, round.roster(), ToParticipant::Aborted { round_id: round.round_id() }).await;
                    return Err(RoundFailure::new(sector, period, e.to_string()));
                }
                Err(Halt::Abort { reason, responsive }) => {
                    if let Err(e) = round.abort(reason) {
                        return Err(RoundFailure::new(sector, period, e.to_string()));
                    }
                    (reason, responsive)
                }
            };
            self.broadcast(links, round.roster(), ToParticipant::Aborted { round_id: round.round_id() }).await;
            record_abort(reason);
            warn!(round_id = %round.round_id(), %sector, %period, %reason, responsive = responsive.len(), "round aborted");
            if reason != AbortReason::Declined {
                attempts += 1;
                if attempts >= self.config.max_attempts {
                    return Err(RoundFailure::new(sector, period, reason.to_string()));
                }
            }
            roster = responsive;
        }
    }

    async fn drive(&self, round: &mut AggregationRound, links: &mut RoundLinks) -> Result<RoundSums, Halt> {
        let roster = round.roster().to_vec();
        let lost = self.send_all(links, &roster, ToParticipant::Open(round.ticket().clone())).await;
        lost_link(round, &lost, &[])?;
        let mut deadline = Instant::now() + self.config.phase_timeout();
        let mut regranted = false;

        loop {
            let msg = match timeout_at(deadline, links.inbound.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(Halt::Abort { reason: AbortReason::ParticipantLost, responsive: Vec::new() }),
                Err(_) if round.phase() == ProtocolPhase::Submission && !regranted => {
                    regranted = true;
                    let missing = round.missing_submissions();
                    info!(round_id = %round.round_id(), missing = missing.len(), "re-requesting late submissions");
                    let lost = self.send_all(links, &missing, ToParticipant::RequestSubmission { round_id: round.round_id() }).await;
                    lost_link(round, &lost, &missing)?;
                    deadline = Instant::now() + self.config.resubmit_grace();
                    continue;
                }
                Err(_) => return Err(timed_out(round)),
            };
            if msg.round_id() != round.round_id() {
                debug!(round_id = %round.round_id(), "stale message dropped");
                continue;
            }
            match self.apply(round, msg) {
                Ok(Step::Wait) => {}
                Ok(Step::Relay(bundle)) => {
                    let lost = self.send_all(links, &roster, ToParticipant::Keys(bundle)).await;
                    lost_link(round, &lost, &[])?;
                    deadline = Instant::now() + self.config.phase_timeout();
                }
                Ok(Step::RequestSubmissions) => {
                    let lost = self.send_all(links, &roster, ToParticipant::RequestSubmission { round_id: round.round_id() }).await;
                    lost_link(round, &lost, &[])?;
                    deadline = Instant::now() + self.config.phase_timeout();
                }
                Ok(Step::Unmask) => return round.unmask().map_err(Halt::Fatal),
                Err(halt @ Halt::Abort { .. }) => return Err(halt),
                Err(Halt::Fatal(e)) => {
                    AGGREGATION_METRICS.submissions_rejected_total.add(1, &[]);
                    warn!(round_id = %round.round_id(), error = %e, "protocol message rejected");
                }
            }
        }
    }

    /// Feed one message into the round. `Halt::Fatal` here means the message
    /// was refused; the round carries on.
    fn apply(&self, round: &mut AggregationRound, msg: ToAggregator) -> Result<Step, Halt> {
        let dir = self.directory.as_ref();
        match msg {
            ToAggregator::Advertise(advert) => match round.record_advertisement(advert, dir) {
                Ok(Some(bundle)) => Ok(Step::Relay(bundle)),
                Ok(None) => Ok(Step::Wait),
                Err(e) => Err(Halt::Fatal(e)),
            },
            ToAggregator::Decline(notice) => {
                round.decline(&notice, dir).map_err(Halt::Fatal)?;
                Err(Halt::Abort { reason: AbortReason::Declined, responsive: without(round.roster(), &[notice.participant_id]) })
            }
            ToAggregator::Commit(c) => match round.record_commitment(c, dir) {
                Ok(true) => Ok(Step::RequestSubmissions),
                Ok(false) => Ok(Step::Wait),
                Err(e) => Err(Halt::Fatal(e)),
            },
            ToAggregator::Submit(sub) => match round.admit_submission(*sub, dir) {
                Ok(true) => Ok(Step::Unmask),
                Ok(false) => Ok(Step::Wait),
                Err(e) => Err(Halt::Fatal(e)),
            },
            ToAggregator::Abort(notice) => {
                round.check_abort_request(&notice, dir).map_err(Halt::Fatal)?;
                Err(Halt::Abort { reason: AbortReason::Requested, responsive: without(round.roster(), &[notice.participant_id]) })
            }
        }
    }

    /// Send to each listed participant and return those whose link is closed.
    async fn send_all(&self, links: &RoundLinks, ids: &[ParticipantId], msg: ToParticipant) -> Vec<ParticipantId> {
        let mut lost = Vec::new();
        for id in ids {
            let delivered = match links.outbound.get(id) {
                Some(tx) => tx.send(msg.clone()).await.is_ok(),
                None => false,
            };
            if !delivered { lost.push(id.clone()); }
        }
        lost
    }

    async fn broadcast(&self, links: &RoundLinks, ids: &[ParticipantId], msg: ToParticipant) {
        for id in ids {
            if let Some(tx) = links.outbound.get(id) {
                let _ = tx.send(msg.clone()).await;
            }
        }
    }
}

fn without(roster: &[ParticipantId], gone: &[ParticipantId]) -> Vec<ParticipantId> {
    roster.iter().filter(|p| !gone.contains(p)).cloned().collect()
}

/// A closed link aborts the round. The next roster is the whole current
/// roster minus the lost links and anyone in `stalled`.
fn lost_link(round: &AggregationRound, lost: &[ParticipantId], stalled: &[ParticipantId]) -> Result<(), Halt> {
    if lost.is_empty() { return Ok(()); }
    let responsive = without(round.roster(), lost).into_iter().filter(|p| !stalled.contains(p)).collect();
    Err(Halt::Abort { reason: AbortReason::ParticipantLost, responsive })
}

fn timed_out(round: &AggregationRound) -> Halt {
    let (reason, missing) = match round.phase() {
        ProtocolPhase::KeyExchange => (AbortReason::KeyExchangeTimeout, round.missing_advertisements()),
        ProtocolPhase::Masking => (AbortReason::CommitmentTimeout, round.missing_commitments()),
        _ => (AbortReason::SubmissionTimeout, round.missing_submissions()),
    };
    let responsive = round.roster().iter().filter(|id| !missing.contains(id)).cloned().collect();
    Halt::Abort { reason, responsive }
}
