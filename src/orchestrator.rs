//! Sequences a native and a foreign leg through one side of an atomic swap.
//!
//! A party never funds before seeing the counterpart's funding, and every
//! funded leg ends redeemed or refunded.

use bitcoin::Txid;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;
use crate::leg::AtomicSwap;
use crate::params::Secret;

/// How an orchestrated swap ended for this party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// We claimed the counterpart's leg.
    Redeemed { txid: Txid },
    /// The counterpart never completed; our funds came back.
    Refunded { txid: Txid },
    /// The counterpart never funded; nothing was placed at risk.
    Aborted,
}

/// Progress notifications emitted while a swap runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapEvent {
    NativeFunded { txid: Txid },
    CounterpartyFunded,
    CounterpartyMissing,
    SecretObserved,
    ForeignRedeemed { txid: Txid },
    WaitingForExpiry,
    NativeRefunded { txid: Txid },
    Aborted,
}

pub trait SwapObserver {
    fn on_event(&self, event: SwapEvent);
}

/// Observer that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SwapObserver for NoopObserver {
    fn on_event(&self, _event: SwapEvent) {}
}

impl SwapObserver for UnboundedSender<SwapEvent> {
    fn on_event(&self, event: SwapEvent) {
        let _ = self.send(event);
    }
}

/// Swap as the party that generated the secret.
///
/// Funds `native`, waits for the counterpart to fund `foreign`, then redeems
/// `foreign` and so reveals the secret. Refunds `native` after expiry if the
/// counterpart never funds.
pub fn execute_as_initiator<N, F>(native: &mut N, foreign: &mut F, secret: &Secret) -> Result<SwapOutcome>
where
    N: AtomicSwap + ?Sized,
    F: AtomicSwap + ?Sized,
{
    execute_as_initiator_with(native, foreign, secret, &NoopObserver)
}

pub fn execute_as_initiator_with<N, F>(
    native: &mut N,
    foreign: &mut F,
    secret: &Secret,
    observer: &dyn SwapObserver,
) -> Result<SwapOutcome>
where
    N: AtomicSwap + ?Sized,
    F: AtomicSwap + ?Sized,
{
    let txid = native.initiate()?;
    observer.on_event(SwapEvent::NativeFunded { txid });

    if foreign.wait_for_initiate()? {
        observer.on_event(SwapEvent::CounterpartyFunded);
        let txid = foreign.redeem(secret, None)?;
        log::info!("orchestrator: initiator redeemed foreign leg in {txid}");
        observer.on_event(SwapEvent::ForeignRedeemed { txid });
        return Ok(SwapOutcome::Redeemed { txid });
    }

    log::warn!("orchestrator: counterpart never funded, refunding");
    observer.on_event(SwapEvent::CounterpartyMissing);
    refund_after_expiry(native, observer)
}

/// Swap as the party reacting to an initiator.
///
/// Funds `native` only after `foreign` is funded, then redeems `foreign` with
/// the secret the initiator reveals on `native`, or refunds `native` after
/// expiry.
pub fn execute_as_counterparty<N, F>(native: &mut N, foreign: &mut F) -> Result<SwapOutcome>
where
    N: AtomicSwap + ?Sized,
    F: AtomicSwap + ?Sized,
{
    execute_as_counterparty_with(native, foreign, &NoopObserver)
}

pub fn execute_as_counterparty_with<N, F>(
    native: &mut N,
    foreign: &mut F,
    observer: &dyn SwapObserver,
) -> Result<SwapOutcome>
where
    N: AtomicSwap + ?Sized,
    F: AtomicSwap + ?Sized,
{
    if !foreign.wait_for_initiate()? {
        log::info!("orchestrator: initiator never funded, aborting");
        observer.on_event(SwapEvent::Aborted);
        return Ok(SwapOutcome::Aborted);
    }
    observer.on_event(SwapEvent::CounterpartyFunded);

    let txid = native.initiate()?;
    observer.on_event(SwapEvent::NativeFunded { txid });

    match native.wait_for_redeem()? {
        Some(secret) => {
            observer.on_event(SwapEvent::SecretObserved);
            let txid = foreign.redeem(&secret, None)?;
            log::info!("orchestrator: counterparty redeemed foreign leg in {txid}");
            observer.on_event(SwapEvent::ForeignRedeemed { txid });
            Ok(SwapOutcome::Redeemed { txid })
        }
        None => {
            log::warn!("orchestrator: no redeem before expiry, refunding");
            refund_after_expiry(native, observer)
        }
    }
}

fn refund_after_expiry<N: AtomicSwap + ?Sized>(
    native: &mut N,
    observer: &dyn SwapObserver,
) -> Result<SwapOutcome> {
    observer.on_event(SwapEvent::WaitingForExpiry);
    native.wait_for_expiry()?;
    let txid = native.refund()?;
    observer.on_event(SwapEvent::NativeRefunded { txid });
    Ok(SwapOutcome::Refunded { txid })
}
