use serde::{Deserialize, Serialize};

/// Lifecycle of a single swap leg.
///
/// Transitions are monotone: `Created → Initiated → {Redeemed | Refunded}`.
/// The two terminal states are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LegState {
    /// Parameters fixed, no funding broadcast or observed yet.
    Created = 0,
    /// A funding transaction was broadcast by us or observed on the ledger.
    Initiated = 1,
    /// The HTLC output was spent through the secret branch.
    Redeemed = 2,
    /// The HTLC output was spent back to the initiator after expiry.
    Refunded = 3,
}

impl LegState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Created),
            1 => Some(Self::Initiated),
            2 => Some(Self::Redeemed),
            3 => Some(Self::Refunded),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Redeemed | Self::Refunded)
    }

    /// Whether moving from `self` to `next` respects the lifecycle.
    pub fn can_transition_to(self, next: LegState) -> bool {
        match (self, next) {
            (Self::Created, Self::Initiated) => true,
            // A second initiate() funds the script again.
            (Self::Initiated, Self::Initiated) => true,
            (Self::Initiated, Self::Redeemed) | (Self::Initiated, Self::Refunded) => true,
            _ => false,
        }
    }
}
