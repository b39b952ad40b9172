use thiserror::Error;

use crate::state::LegState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid swap parameter: {0}")]
    Validation(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("insufficient funds: needed {needed} sat, available {available} sat")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("fee too low: ledger requires at least {required} sat")]
    FeeTooLow { required: u64 },

    #[error("operation not allowed in state {state:?}: {reason}")]
    State { state: LegState, reason: String },

    #[error("refund not allowed before expiry: {0}")]
    PrematureRefund(String),

    #[error("broadcast rejected: {0}")]
    Broadcast(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("transaction construction error: {0}")]
    Transaction(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("task join error: {0}")]
    Task(String),
}

impl Error {
    /// Transient failures are retried inside polling loops; everything else
    /// is surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Provider(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
