//! Secure aggregation: round-based pairwise masking.
//!
//! Phases: KeyExchange -> Masking -> Submission -> Unmasking -> Completed,
//! with Aborted reachable from every phase before Unmasking.

pub mod driver;
pub mod masking;
pub mod messages;
pub mod round;

pub use driver::{CompletedRound, RoundDriver, RoundLinks};
pub use masking::MaskingSession;
pub use messages::{
    KeyAdvertisement, KeyBundle, MaskCommitment, MaskedVector, NoticeKind, PrivacySubmission, RoundNotice, RoundTicket,
    ToAggregator, ToParticipant,
};
pub use round::{AggregationRound, RoundSums, TierSum};

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundId(Uuid);

impl RoundId {
    pub fn generate() -> Self { Self(Uuid::new_v4()) }
    pub fn from_uuid(u: Uuid) -> Self { Self(u) }
    pub fn as_bytes(&self) -> &[u8; 16] { self.0.as_bytes() }
}

impl Display for RoundId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolPhase { KeyExchange, Masking, Submission, Unmasking, Completed, Aborted }

impl ProtocolPhase {
    pub fn is_terminal(self) -> bool { matches!(self, ProtocolPhase::Completed | ProtocolPhase::Aborted) }
}

/// Coarse round status as seen by operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundStatus { Collecting, Aggregating, Completed, Aborted }

impl From<ProtocolPhase> for RoundStatus {
    fn from(p: ProtocolPhase) -> Self {
        match p {
            ProtocolPhase::KeyExchange | ProtocolPhase::Masking | ProtocolPhase::Submission => RoundStatus::Collecting,
            ProtocolPhase::Unmasking => RoundStatus::Aggregating,
            ProtocolPhase::Completed => RoundStatus::Completed,
            ProtocolPhase::Aborted => RoundStatus::Aborted,
        }
    }
}
