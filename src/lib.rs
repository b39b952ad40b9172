pub use bitcoin;

pub mod chain;
pub mod clock;
pub mod config;
pub mod contract;
pub mod error;
pub mod fee;
pub mod leg;
pub mod network;
pub mod orchestrator;
pub mod params;
pub mod provider;
pub mod runner;
pub mod signer;
pub mod spend;
pub mod state;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod witness;

// Core types
pub use chain::{ChainBackend, ElectrumBackend, ScriptHistoryEntry, Utxo};
pub use clock::{Clock, PollStatus, SystemClock, poll};
pub use config::SwapConfig;
pub use contract::{HtlcContract, compile_script, decode_script};
pub use error::{Error, Result};
pub use network::Network;
pub use params::{Expiry, HtlcParams, LOCKTIME_THRESHOLD, ScriptVariant, Secret, SecretHash};
pub use state::LegState;

// Ledger access and signing
pub use provider::{DEFAULT_MIN_FEE, FeePolicy, Provider, WalletProvider};
pub use signer::{KeySigner, Signer};

// Spending
pub use fee::{classify_rejection, parse_required_fee, with_fee_retry};
pub use spend::{FundingOutput, build_spend, locate_output};
pub use witness::{SpendPath, extract_secret};

// Swap flow
pub use leg::{AtomicSwap, BtcSwapLeg, LegParams};
pub use orchestrator::{
    NoopObserver, SwapEvent, SwapObserver, SwapOutcome, execute_as_counterparty,
    execute_as_counterparty_with, execute_as_initiator, execute_as_initiator_with,
};
pub use runner::{SwapReport, SwapRunner};
