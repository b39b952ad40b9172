use std::collections::HashMap;

use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{Message, ecdsa::Signature};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, CompressedPublicKey, EcdsaSighashType, PublicKey, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness, absolute, ecdsa,
};

use crate::chain::{ChainBackend, ScriptHistoryEntry, Utxo};
use crate::error::{Error, Result};
use crate::fee::with_fee_retry;
use crate::network::Network;
use crate::params::{Secret, SecretHash};
use crate::signer::{KeySigner, Signer};
use crate::witness::extract_secret;

/// Default satoshi fee floor for a one-in one-out spend.
pub const DEFAULT_MIN_FEE: u64 = 300;

/// Ledger access plus a single signing capability, as consumed by a swap leg.
///
/// Implementations must tolerate concurrent reads.
pub trait Provider: Send + Sync {
    fn network(&self) -> Network;

    /// Satoshi fee floor used when a caller does not pick a fee.
    fn min_fee(&self) -> u64;

    /// Bound on fee-driven rebroadcasts per spend.
    fn max_fee_retries(&self) -> u8 {
        1
    }

    /// Unspent outputs of `address`. With `min_value`, the shortest prefix
    /// whose total covers it.
    fn get_unspent(&self, address: &Address, min_value: Option<u64>) -> Result<Vec<Utxo>>;

    fn get_balance(&self, address: &Address) -> Result<u64>;

    /// Oldest transaction paying `address` with at least `confirmations`
    /// confirmations.
    fn funding_transaction(&self, address: &Address, confirmations: u32) -> Result<Option<Txid>>;

    /// Preimage of `secret_hash` revealed by a redeem spend of an output at `address`.
    fn get_secret(&self, address: &Address, secret_hash: &SecretHash) -> Result<Option<Secret>>;

    fn get_transaction(&self, txid: &Txid) -> Result<Transaction>;

    /// Confirmations of `txid` as seen from `address`'s history.
    fn confirmations(&self, address: &Address, txid: &Txid) -> Result<u32>;

    fn tip_height(&self) -> Result<u32>;

    /// Ledger time that timestamp lock times are compared against.
    fn median_time_past(&self) -> Result<u64>;

    fn public_key(&self) -> PublicKey;

    fn sign(&self, sighash: &Message) -> Result<Signature>;

    fn broadcast(&self, tx: &Transaction) -> Result<Txid>;

    /// Pay `amount` to `address` from the provider's own wallet.
    fn fund(&self, address: &Address, amount: u64) -> Result<Txid>;
}

/// Fee and retry knobs shared by funding and spending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    pub min_fee: u64,
    pub max_retries: u8,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            min_fee: DEFAULT_MIN_FEE,
            max_retries: 1,
        }
    }
}

/// [`Provider`] backed by a [`ChainBackend`] and a single-key P2WPKH wallet.
pub struct WalletProvider<C, S = KeySigner> {
    chain: C,
    signer: S,
    network: Network,
    fees: FeePolicy,
    wallet_script: ScriptBuf,
    wallet_key: CompressedPublicKey,
}

impl<C: ChainBackend, S: Signer> WalletProvider<C, S> {
    pub fn new(chain: C, signer: S, network: Network) -> Result<Self> {
        let wallet_key = CompressedPublicKey::try_from(signer.public_key())
            .map_err(|e| Error::Signer(format!("wallet key must be compressed: {e}")))?;
        let wallet_script = ScriptBuf::new_p2wpkh(&wallet_key.wpubkey_hash());
        Ok(Self {
            chain,
            signer,
            network,
            fees: FeePolicy::default(),
            wallet_script,
            wallet_key,
        })
    }

    pub fn with_fee_policy(mut self, fees: FeePolicy) -> Self {
        self.fees = fees;
        self
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn signer(&self) -> &S {
        &self.signer
    }

    /// Where the wallet receives funds and takes change.
    pub fn wallet_address(&self) -> Address {
        Address::p2wpkh(&self.wallet_key, self.network.into_bitcoin())
    }

    /// History of `address` ordered oldest first; mempool entries last.
    fn ordered_history(&self, address: &Address) -> Result<Vec<ScriptHistoryEntry>> {
        let mut history = self.chain.get_script_history(&address.script_pubkey())?;
        history.sort_by_key(|entry| {
            if entry.height > 0 {
                entry.height
            } else {
                i32::MAX
            }
        });
        Ok(history)
    }

    /// Build and sign a wallet spend paying `amount` to `destination`.
    fn build_funding(
        &self,
        utxos: &[Utxo],
        destination: &Address,
        amount: u64,
        fee: u64,
    ) -> Result<Transaction> {
        let needed = amount
            .checked_add(fee)
            .ok_or_else(|| Error::Validation("amount plus fee overflows".into()))?;
        let selected = covering_prefix(utxos, needed)?;
        let total: u64 = selected.iter().map(|u| u.value).sum();

        let mut output = vec![TxOut {
            value: Amount::from_sat(amount),
            script_pubkey: destination.script_pubkey(),
        }];
        let change = total - needed;
        if change >= self.wallet_script.minimal_non_dust().to_sat() {
            output.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: self.wallet_script.clone(),
            });
        }

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: selected
                .iter()
                .map(|u| TxIn {
                    previous_output: u.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
                    witness: Witness::new(),
                })
                .collect(),
            output,
        };

        let sighashes = {
            let mut cache = SighashCache::new(&tx);
            selected
                .iter()
                .enumerate()
                .map(|(i, u)| {
                    cache
                        .p2wpkh_signature_hash(
                            i,
                            &self.wallet_script,
                            Amount::from_sat(u.value),
                            EcdsaSighashType::All,
                        )
                        .map(|h| Message::from_digest(h.to_byte_array()))
                        .map_err(|e| Error::Transaction(format!("p2wpkh sighash: {e}")))
                })
                .collect::<Result<Vec<_>>>()?
        };
        for (input, sighash) in tx.input.iter_mut().zip(&sighashes) {
            let sig = ecdsa::Signature {
                signature: self.signer.sign(sighash)?,
                sighash_type: EcdsaSighashType::All,
            };
            input.witness = Witness::p2wpkh(&sig, &self.wallet_key.0);
        }
        Ok(tx)
    }
}

/// Shortest prefix of `utxos` whose values sum to at least `needed`.
pub fn covering_prefix(utxos: &[Utxo], needed: u64) -> Result<&[Utxo]> {
    let mut total = 0u64;
    for (i, utxo) in utxos.iter().enumerate() {
        total = total.saturating_add(utxo.value);
        if total >= needed {
            return Ok(&utxos[..=i]);
        }
    }
    Err(Error::InsufficientFunds {
        needed,
        available: total,
    })
}

impl<C: ChainBackend, S: Signer> Provider for WalletProvider<C, S> {
    fn network(&self) -> Network {
        self.network
    }

    fn min_fee(&self) -> u64 {
        self.fees.min_fee
    }

    fn max_fee_retries(&self) -> u8 {
        self.fees.max_retries
    }

    fn get_unspent(&self, address: &Address, min_value: Option<u64>) -> Result<Vec<Utxo>> {
        let utxos = self.chain.list_unspent(&address.script_pubkey())?;
        match min_value {
            Some(min) => covering_prefix(&utxos, min).map(<[Utxo]>::to_vec),
            None => Ok(utxos),
        }
    }

    fn get_balance(&self, address: &Address) -> Result<u64> {
        Ok(self
            .chain
            .list_unspent(&address.script_pubkey())?
            .iter()
            .map(|u| u.value)
            .sum())
    }

    fn funding_transaction(&self, address: &Address, confirmations: u32) -> Result<Option<Txid>> {
        let script_pubkey = address.script_pubkey();
        let tip = self.chain.tip_height()?;
        for entry in self.ordered_history(address)? {
            if entry.confirmations(tip) < confirmations {
                continue;
            }
            let tx = self.chain.fetch_transaction(&entry.txid)?;
            if tx.output.iter().any(|out| out.script_pubkey == script_pubkey) {
                log::debug!(
                    "provider: funding {} for {address} ({} confs)",
                    entry.txid,
                    entry.confirmations(tip)
                );
                return Ok(Some(entry.txid));
            }
        }
        Ok(None)
    }

    fn get_secret(&self, address: &Address, secret_hash: &SecretHash) -> Result<Option<Secret>> {
        let script_pubkey = address.script_pubkey();
        let mut txs = HashMap::new();
        for entry in self.ordered_history(address)? {
            let tx = self.chain.fetch_transaction(&entry.txid)?;
            txs.insert(entry.txid, tx);
        }
        for tx in txs.values() {
            for input in &tx.input {
                let Some(prev) = txs.get(&input.previous_output.txid) else {
                    continue;
                };
                let spends_htlc = prev
                    .output
                    .get(input.previous_output.vout as usize)
                    .is_some_and(|out| out.script_pubkey == script_pubkey);
                if !spends_htlc {
                    continue;
                }
                if let Some(secret) = extract_secret(input, secret_hash) {
                    log::info!("provider: secret revealed in {}", tx.compute_txid());
                    return Ok(Some(secret));
                }
            }
        }
        Ok(None)
    }

    fn get_transaction(&self, txid: &Txid) -> Result<Transaction> {
        self.chain.fetch_transaction(txid)
    }

    fn confirmations(&self, address: &Address, txid: &Txid) -> Result<u32> {
        let tip = self.chain.tip_height()?;
        Ok(self
            .chain
            .get_script_history(&address.script_pubkey())?
            .iter()
            .find(|entry| entry.txid == *txid)
            .map_or(0, |entry| entry.confirmations(tip)))
    }

    fn tip_height(&self) -> Result<u32> {
        self.chain.tip_height()
    }

    fn median_time_past(&self) -> Result<u64> {
        self.chain.median_time_past()
    }

    fn public_key(&self) -> PublicKey {
        self.signer.public_key()
    }

    fn sign(&self, sighash: &Message) -> Result<Signature> {
        self.signer.sign(sighash)
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        self.chain.broadcast(tx)
    }

    fn fund(&self, address: &Address, amount: u64) -> Result<Txid> {
        if amount < address.script_pubkey().minimal_non_dust().to_sat() {
            return Err(Error::Validation(format!(
                "funding amount {amount} sat is dust for {address}"
            )));
        }
        let utxos = self.chain.list_unspent(&self.wallet_script)?;
        with_fee_retry(self.fees.min_fee, self.fees.max_retries, |fee| {
            let tx = self.build_funding(&utxos, address, amount, fee)?;
            let txid = self.chain.broadcast(&tx)?;
            log::info!("provider: funded {address} with {amount} sat (fee {fee}) in {txid}");
            Ok(txid)
        })
    }
}
