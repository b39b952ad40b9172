//! One party's fund-and-spend lifecycle on one ledger.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Address, Txid};

use crate::clock::{Clock, PollStatus, poll};
use crate::config::SwapConfig;
use crate::contract::HtlcContract;
use crate::error::{Error, Result};
use crate::fee::with_fee_retry;
use crate::params::{Expiry, ScriptVariant, Secret, SecretHash, parse_address};
use crate::provider::Provider;
use crate::spend::{FundingOutput, build_spend, locate_output};
use crate::state::LegState;
use crate::witness::SpendPath;

/// Operations the orchestrator drives on either side of a swap.
pub trait AtomicSwap {
    /// Fund the HTLC. Calling it twice funds the script twice.
    fn initiate(&mut self) -> Result<Txid>;

    /// Block until a qualifying funding transaction is seen (`true`) or the
    /// expiry passes first (`false`).
    fn wait_for_initiate(&mut self) -> Result<bool>;

    /// Spend the observed funding to the recipient with the preimage.
    fn redeem(&mut self, secret: &Secret, fee: Option<u64>) -> Result<Txid>;

    /// Spend our funding back to the refund address after expiry.
    fn refund(&mut self) -> Result<Txid>;

    /// Block until the counterpart reveals the secret, or `None` at expiry.
    fn wait_for_redeem(&mut self) -> Result<Option<Secret>>;

    /// Block until the refund branch is spendable.
    fn wait_for_expiry(&mut self) -> Result<()>;

    fn state(&self) -> LegState;
}

impl<T: AtomicSwap + ?Sized> AtomicSwap for Box<T> {
    fn initiate(&mut self) -> Result<Txid> {
        (**self).initiate()
    }

    fn wait_for_initiate(&mut self) -> Result<bool> {
        (**self).wait_for_initiate()
    }

    fn redeem(&mut self, secret: &Secret, fee: Option<u64>) -> Result<Txid> {
        (**self).redeem(secret, fee)
    }

    fn refund(&mut self) -> Result<Txid> {
        (**self).refund()
    }

    fn wait_for_redeem(&mut self) -> Result<Option<Secret>> {
        (**self).wait_for_redeem()
    }

    fn wait_for_expiry(&mut self) -> Result<()> {
        (**self).wait_for_expiry()
    }

    fn state(&self) -> LegState {
        (**self).state()
    }
}

/// Immutable terms of a leg.
#[derive(Debug, Clone)]
pub struct LegParams {
    pub secret_hash: SecretHash,
    /// Paid on redeem; its key hash guards the IF branch.
    pub recipient: String,
    /// Paid on refund; its key hash guards the ELSE branch.
    pub refund: String,
    pub amount: u64,
    pub expiry: Expiry,
    pub confirmations: u32,
    pub poll_interval: Duration,
    pub variant: ScriptVariant,
}

impl LegParams {
    pub fn new(
        secret_hash: SecretHash,
        recipient: impl Into<String>,
        refund: impl Into<String>,
        amount: u64,
        expiry: Expiry,
    ) -> Self {
        Self {
            secret_hash,
            recipient: recipient.into(),
            refund: refund.into(),
            amount,
            expiry,
            confirmations: 0,
            poll_interval: Duration::from_secs(1),
            variant: ScriptVariant::default(),
        }
    }

    pub fn confirmations(mut self, confirmations: u32) -> Self {
        self.confirmations = confirmations;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn variant(mut self, variant: ScriptVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Take confirmations, poll interval and variant from `config`.
    pub fn with_config(self, config: &SwapConfig) -> Self {
        self.confirmations(config.confirmations)
            .poll_interval(config.poll_interval())
            .variant(config.variant)
    }
}

/// HTLC leg on a Bitcoin ledger.
pub struct BtcSwapLeg<P: Provider + ?Sized> {
    provider: Arc<P>,
    clock: Arc<dyn Clock>,
    contract: HtlcContract,
    recipient: Address,
    refund_address: Address,
    amount: u64,
    confirmations: u32,
    poll_interval: Duration,
    state: LegState,
    /// Our own most recent funding broadcast.
    init_txid: Option<Txid>,
    /// Funding seen on the ledger, ours or the counterpart's.
    funding_txid: Option<Txid>,
    redeem_txid: Option<Txid>,
    refund_txid: Option<Txid>,
    /// Tip height when `wait_for_initiate` first polled.
    watch_from: Option<u32>,
}

impl<P: Provider + ?Sized> BtcSwapLeg<P> {
    pub fn new(provider: Arc<P>, clock: Arc<dyn Clock>, params: LegParams) -> Result<Self> {
        let network = provider.network();
        let min_fee = provider.min_fee();
        if params.amount == 0 {
            return Err(Error::Validation("amount must be positive".into()));
        }
        if params.amount <= min_fee {
            return Err(Error::Validation(format!(
                "amount {} sat does not cover the minimum fee {min_fee} sat",
                params.amount
            )));
        }
        let contract = HtlcContract::build(
            params.secret_hash,
            &params.recipient,
            &params.refund,
            params.expiry,
            network,
            params.variant,
        )?;
        let recipient = parse_address(&params.recipient, network)?;
        let refund_address = parse_address(&params.refund, network)?;
        log::debug!(
            "leg: created {} for {} sat, expiry {:?}",
            contract.address(),
            params.amount,
            params.expiry
        );
        Ok(Self {
            provider,
            clock,
            contract,
            recipient,
            refund_address,
            amount: params.amount,
            confirmations: params.confirmations,
            poll_interval: params.poll_interval,
            state: LegState::Created,
            init_txid: None,
            funding_txid: None,
            redeem_txid: None,
            refund_txid: None,
            watch_from: None,
        })
    }

    pub fn contract(&self) -> &HtlcContract {
        &self.contract
    }

    pub fn address(&self) -> &Address {
        self.contract.address()
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    pub fn init_txid(&self) -> Option<Txid> {
        self.init_txid
    }

    pub fn funding_txid(&self) -> Option<Txid> {
        self.funding_txid
    }

    pub fn redeem_txid(&self) -> Option<Txid> {
        self.redeem_txid
    }

    pub fn refund_txid(&self) -> Option<Txid> {
        self.refund_txid
    }

    fn transition(&mut self, next: LegState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(self.state_error(format!("cannot move to {next:?}")));
        }
        if self.state != next {
            log::info!(
                "leg: {} {:?} -> {next:?}",
                self.contract.address(),
                self.state
            );
        }
        self.state = next;
        Ok(())
    }

    /// Whether a timestamp deadline has passed on the local clock. Block
    /// expiries have no deadline of this kind.
    fn deadline_passed(&self) -> bool {
        match self.contract.expiry() {
            Expiry::Timestamp(t) => self.clock.now() >= u64::from(t),
            Expiry::Blocks(_) => false,
        }
    }

    /// Whether the ledger would accept a refund of `funding` now.
    ///
    /// Timestamp locks open once the tip's median time past exceeds the lock
    /// time. Block locks count confirmations of `funding`; without one they
    /// count blocks since `watch_from`.
    fn lock_elapsed(&self, funding: Option<&Txid>) -> Result<bool> {
        match self.contract.expiry() {
            Expiry::Timestamp(t) => Ok(self.provider.median_time_past()? > u64::from(t)),
            Expiry::Blocks(n) => match funding {
                Some(txid) => {
                    let confs = self.provider.confirmations(self.address(), txid)?;
                    Ok(confs >= u32::from(n))
                }
                None => {
                    let Some(start) = self.watch_from else {
                        return Ok(false);
                    };
                    Ok(self.provider.tip_height()? >= start.saturating_add(u32::from(n)))
                }
            },
        }
    }

    fn state_error(&self, reason: impl Into<String>) -> Error {
        Error::State {
            state: self.state,
            reason: reason.into(),
        }
    }

    fn funding_output(&self, txid: &Txid) -> Result<FundingOutput> {
        let tx = self.provider.get_transaction(txid)?;
        locate_output(&self.contract, &tx)
    }

    /// Sign and broadcast a spend, retrying once per policy on fee rejections.
    fn spend(&self, funding: &FundingOutput, path: &SpendPath, fee: u64) -> Result<Txid> {
        let payout = match path {
            SpendPath::Redeem { .. } => self.recipient.script_pubkey(),
            SpendPath::Refund => self.refund_address.script_pubkey(),
        };
        let pubkey = self.provider.public_key();
        with_fee_retry(fee, self.provider.max_fee_retries(), |fee| {
            let tx = build_spend(
                &self.contract,
                funding,
                &payout,
                fee,
                path,
                &pubkey,
                |sighash| self.provider.sign(sighash),
            )?;
            self.provider.broadcast(&tx)
        })
    }
}

impl<P: Provider + ?Sized> AtomicSwap for BtcSwapLeg<P> {
    fn initiate(&mut self) -> Result<Txid> {
        if self.state.is_terminal() {
            return Err(self.state_error("leg already settled"));
        }
        let txid = self.provider.fund(self.contract.address(), self.amount)?;
        log::info!(
            "leg: initiated {} with {} sat in {txid}",
            self.contract.address(),
            self.amount
        );
        self.init_txid = Some(txid);
        self.funding_txid = Some(txid);
        self.transition(LegState::Initiated)?;
        Ok(txid)
    }

    fn wait_for_initiate(&mut self) -> Result<bool> {
        if self.state.is_terminal() {
            return Err(self.state_error("leg already settled"));
        }
        let clock = Arc::clone(&self.clock);
        let label = format!("funding of {}", self.contract.address());
        let found = poll(clock.as_ref(), self.poll_interval, &label, || {
            if self.deadline_passed() {
                return Ok(PollStatus::Expired);
            }
            if self.contract.expiry().is_relative() {
                if self.watch_from.is_none() {
                    self.watch_from = Some(self.provider.tip_height()?);
                }
                if self.lock_elapsed(None)? {
                    return Ok(PollStatus::Expired);
                }
            }
            let Some(txid) = self
                .provider
                .funding_transaction(self.contract.address(), self.confirmations)?
            else {
                return Ok(PollStatus::Pending);
            };
            // Funding whose relative lock already elapsed is too late to act on.
            if self.contract.expiry().is_relative() && self.lock_elapsed(Some(&txid))? {
                return Ok(PollStatus::Expired);
            }
            Ok(PollStatus::Ready(txid))
        })?;
        match found {
            Some(txid) => {
                self.funding_txid = Some(txid);
                self.transition(LegState::Initiated)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn redeem(&mut self, secret: &Secret, fee: Option<u64>) -> Result<Txid> {
        if self.state.is_terminal() {
            return Err(self.state_error("leg already settled"));
        }
        let funding_txid = self
            .funding_txid
            .ok_or_else(|| self.state_error("redeem before any funding was observed"))?;
        if !self.contract.secret_hash().matches(secret.as_bytes()) {
            return Err(Error::Validation(format!(
                "secret does not hash to {}",
                self.contract.secret_hash()
            )));
        }
        let funding = self.funding_output(&funding_txid)?;
        let fee = fee.unwrap_or_else(|| self.provider.min_fee());
        let path = SpendPath::Redeem {
            secret: secret.clone(),
        };
        let txid = self.spend(&funding, &path, fee)?;
        log::info!("leg: redeemed {} in {txid}", funding.outpoint);
        self.redeem_txid = Some(txid);
        self.transition(LegState::Redeemed)?;
        Ok(txid)
    }

    fn refund(&mut self) -> Result<Txid> {
        if self.state.is_terminal() {
            return Err(self.state_error("leg already settled"));
        }
        let init_txid = self
            .init_txid
            .ok_or_else(|| self.state_error("refund before initiate() completed"))?;
        if !self.lock_elapsed(Some(&init_txid))? {
            return Err(Error::PrematureRefund(format!(
                "{} locked until {:?}",
                self.contract.address(),
                self.contract.expiry()
            )));
        }
        let funding = self.funding_output(&init_txid)?;
        let txid = self.spend(&funding, &SpendPath::Refund, self.provider.min_fee())?;
        log::info!("leg: refunded {} in {txid}", funding.outpoint);
        self.refund_txid = Some(txid);
        self.transition(LegState::Refunded)?;
        Ok(txid)
    }

    fn wait_for_redeem(&mut self) -> Result<Option<Secret>> {
        if self.state.is_terminal() {
            return Err(self.state_error("leg already settled"));
        }
        let funding_txid = self
            .funding_txid
            .ok_or_else(|| self.state_error("no funding to watch for a redeem"))?;
        let clock = Arc::clone(&self.clock);
        let label = format!("redeem of {}", self.contract.address());
        let secret_hash = *self.contract.secret_hash();
        poll(clock.as_ref(), self.poll_interval, &label, || {
            let address = self.contract.address();
            if self.deadline_passed() {
                // One last lookup so a redeem mined before the deadline is not missed.
                return match self.provider.get_secret(address, &secret_hash) {
                    Ok(Some(secret)) => Ok(PollStatus::Ready(secret)),
                    Ok(None) => Ok(PollStatus::Expired),
                    Err(e) if e.is_transient() => {
                        log::warn!("leg: final secret lookup for {address} failed ({e})");
                        Ok(PollStatus::Expired)
                    }
                    Err(e) => Err(e),
                };
            }
            if let Some(secret) = self.provider.get_secret(address, &secret_hash)? {
                return Ok(PollStatus::Ready(secret));
            }
            if self.contract.expiry().is_relative() && self.lock_elapsed(Some(&funding_txid))? {
                return Ok(PollStatus::Expired);
            }
            Ok(PollStatus::Pending)
        })
    }

    fn wait_for_expiry(&mut self) -> Result<()> {
        let funding_txid = self.init_txid.or(self.funding_txid);
        if funding_txid.is_none() && self.contract.expiry().is_relative() {
            return Err(self.state_error("block expiry counts from a funding transaction"));
        }
        let clock = Arc::clone(&self.clock);
        let label = format!("expiry of {}", self.contract.address());
        poll(clock.as_ref(), self.poll_interval, &label, || {
            if self.lock_elapsed(funding_txid.as_ref())? {
                Ok(PollStatus::Ready(()))
            } else {
                Ok(PollStatus::Pending)
            }
        })?;
        Ok(())
    }

    fn state(&self) -> LegState {
        self.state
    }
}
