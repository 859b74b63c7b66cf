//! Error taxonomy for the aggregation pipeline.

use thiserror::Error;

use crate::secure_agg::{ProtocolPhase, RoundId};
use crate::tier::{Period, Sector, Tier};

/// Failures of the participant-local privacy transform.
#[derive(Debug, Error, PartialEq)]
pub enum PrivacyError {
    /// Every tier fell below `k_min`; the participant skips this round.
    #[error("insufficient data: every tier is suppressed")]
    InsufficientData,
    /// Upstream data is malformed; surfaced to the HR connector.
    #[error("invalid count for tier {tier}: female {female} exceeds total {total}")]
    InvalidCount { tier: Tier, total: u64, female: u64 },
    #[error("invalid privacy configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("unknown participant")]
    UnknownParticipant,
    #[error("signature encoding invalid")]
    MalformedSignature,
    #[error("signature verification failed")]
    BadSignature,
}

/// Why a round was aborted. Carries no participant identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    KeyExchangeTimeout,
    CommitmentTimeout,
    SubmissionTimeout,
    Requested,
    ParticipantLost,
    /// A roster member had nothing to report; the round restarts without it.
    Declined,
    /// The unmasked aggregate failed internal consistency checks.
    Rejected,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AbortReason::KeyExchangeTimeout => "key exchange timed out",
            AbortReason::CommitmentTimeout => "mask commitment timed out",
            AbortReason::SubmissionTimeout => "submission timed out",
            AbortReason::Requested => "abort requested",
            AbortReason::ParticipantLost => "participant link lost",
            AbortReason::Declined => "roster member declined",
            AbortReason::Rejected => "aggregate failed consistency checks",
        };
        f.write_str(s)
    }
}

/// Protocol-level errors raised by either side of a round.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("message for phase {expected:?} arrived during {actual:?}")]
    WrongPhase { expected: ProtocolPhase, actual: ProtocolPhase },
    #[error("participant is not on the round roster")]
    NotInRoster,
    #[error("message bound to round {got}, current round is {expected}")]
    RoundMismatch { expected: RoundId, got: RoundId },
    #[error("message bound to another sector or period")]
    ScopeMismatch,
    #[error("round needs at least {min} participants, got {got}")]
    RosterTooSmall { min: usize, got: usize },
    #[error("conflicting resubmission")]
    ConflictingSubmission,
    #[error("mask commitment does not match the relayed key bundle")]
    CommitmentMismatch,
    #[error("key bundle does not cover the round roster")]
    IncompleteBundle,
    #[error("peer key agreement was not contributory")]
    NonContributoryKey,
    #[error("masked contribution has wrong length {0}")]
    MalformedContribution(usize),
    #[error("no masking session for this round")]
    NoSession,
    #[error("identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("round already aborted: {0}")]
    Aborted(AbortReason),
    #[error("abort refused: unmasking already started")]
    AbortRefused,
    #[error("round already active for this sector and period")]
    RoundActive,
}

/// Round-granularity failure reported to users.
///
/// Never names the participant that caused a protocol failure.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("round for sector {sector}, period {period} could not be completed: retry next period ({cause})")]
pub struct RoundFailure {
    pub sector: Sector,
    pub period: Period,
    pub cause: String,
}

impl RoundFailure {
    pub fn new(sector: &Sector, period: Period, cause: impl Into<String>) -> Self {
        Self { sector: sector.clone(), period, cause: cause.into() }
    }
}
