//! Participant agent: the organization-side half of a round.
//!
//! Owns the exact counts. They are transformed locally once per
//! sector/period; only disclosed percentages and the masked contribution
//! vector ever reach the outbox.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audit::AuditTrail;
use crate::error::{PrivacyError, ProtocolError};
use crate::identity::{KeyDirectory, ParticipantId, ParticipantIdentity};
use crate::privacy::{LocalPrivacyTransform, PreparedSubmission};
use crate::secure_agg::{MaskingSession, PrivacySubmission, RoundId, ToAggregator, ToParticipant};
use crate::settings::PrivacyConfig;
use crate::tier::RawTierSet;

#[derive(Debug, PartialEq)]
pub enum ParticipantOutcome {
    /// Contribution was part of the completed round.
    Contributed { round_id: RoundId },
    /// Nothing was disclosable (or the data was malformed); declined the round.
    Declined(PrivacyError),
    /// Aggregator went away before completion.
    Disconnected,
}

pub struct ParticipantAgent {
    identity: ParticipantIdentity,
    directory: Arc<KeyDirectory>,
    privacy: PrivacyConfig,
    raw: RawTierSet,
    audit: Option<AuditTrail>,
}

impl ParticipantAgent {
    pub fn new(identity: ParticipantIdentity, directory: Arc<KeyDirectory>, privacy: PrivacyConfig, raw: RawTierSet) -> Self {
        Self { identity, directory, privacy, raw, audit: None }
    }

    pub fn with_audit_trail(mut self, trail: AuditTrail) -> Self {
        self.audit = Some(trail);
        self
    }

    pub fn id(&self) -> &ParticipantId { self.identity.id() }

    pub async fn run(
        self,
        mut inbox: mpsc::Receiver<ToParticipant>,
        outbox: mpsc::Sender<ToAggregator>,
    ) -> Result<ParticipantOutcome, ProtocolError> {
        let me = self.identity.id().clone();
        let mut prepared: Option<PreparedSubmission> = None;
        let mut session: Option<MaskingSession> = None;
        let mut sealed: Option<PrivacySubmission> = None;

        while let Some(msg) = inbox.recv().await {
            match msg {
                ToParticipant::Open(ticket) => {
                    let scope_changed = prepared
                        .as_ref()
                        .map_or(true, |p| p.sector != ticket.sector || p.period != ticket.period);
                    if scope_changed {
                        let applied = LocalPrivacyTransform::new(&self.privacy, &self.identity)
                            .and_then(|t| t.apply(&ticket.sector, ticket.period, self.raw.clone()));
                        match applied {
                            Ok(p) => prepared = Some(p),
                            Err(e) => {
                                info!(sector = %ticket.sector, period = %ticket.period, error = %e, "declining round");
                                let _ = outbox.send(ToAggregator::decline(&self.identity, ticket.round_id)).await;
                                return Ok(ParticipantOutcome::Declined(e));
                            }
                        }
                    }
                    let s = MaskingSession::new(ticket, me.clone())?;
                    sealed = None;
                    if outbox.send(ToAggregator::Advertise(s.advertisement(&self.identity))).await.is_err() {
                        return Ok(ParticipantOutcome::Disconnected);
                    }
                    session = Some(s);
                }
                ToParticipant::Keys(bundle) => {
                    let Some(s) = session.as_mut().filter(|s| s.ticket().round_id == bundle.round_id) else {
                        debug!(round_id = %bundle.round_id, "bundle for unknown round ignored");
                        continue;
                    };
                    let reply = match s.accept_bundle(&bundle, &self.directory).and_then(|_| s.commitment(&self.identity)) {
                        Ok(c) => ToAggregator::Commit(c),
                        Err(e) => {
                            warn!(round_id = %bundle.round_id, error = %e, "key bundle refused, leaving round");
                            session = None;
                            ToAggregator::abort(&self.identity, bundle.round_id)
                        }
                    };
                    if outbox.send(reply).await.is_err() { return Ok(ParticipantOutcome::Disconnected); }
                }
                ToParticipant::RequestSubmission { round_id } => {
                    let (Some(s), Some(p)) = (session.as_ref(), prepared.as_ref()) else { continue };
                    if s.ticket().round_id != round_id { continue; }
                    let sub = match sealed.take() {
                        Some(sub) => sub,
                        None => PrivacySubmission::seal(&self.identity, p, s)?,
                    };
                    sealed = Some(sub.clone());
                    if outbox.send(ToAggregator::Submit(Box::new(sub))).await.is_err() {
                        return Ok(ParticipantOutcome::Disconnected);
                    }
                }
                ToParticipant::Aborted { round_id } => {
                    if session.as_ref().is_some_and(|s| s.ticket().round_id == round_id) {
                        debug!(%round_id, "round aborted, discarding masking session");
                        session = None;
                        sealed = None;
                    }
                }
                ToParticipant::Completed { round_id } => {
                    if !session.as_ref().is_some_and(|s| s.ticket().round_id == round_id) { continue; }
                    if let (Some(trail), Some(p)) = (&self.audit, &prepared) {
                        let mut record = p.audit_record().clone();
                        record.round_id = Some(round_id);
                        if let Err(e) = trail.append(&record) {
                            warn!(%round_id, error = %e, "audit trail write failed");
                        }
                    }
                    return Ok(ParticipantOutcome::Contributed { round_id });
                }
            }
        }
        Ok(ParticipantOutcome::Disconnected)
    }
}
