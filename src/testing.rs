//! Test utilities: an in-memory Bitcoin ledger and a clock driven by it.
//!
//! `MockChain` enforces the rules an HTLC spend is subject to on a real node
//! (hash lock, key hashes, ECDSA over the right sighash, CSV and CLTV, double
//! spends, minimum relay fee) so full swaps can run without a network.
//! Rejections reuse node wording so the provider-side classification is
//! exercised too.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bitcoin::hashes::{Hash, hash160, sha256};
use bitcoin::script::Instruction;
use bitcoin::secp256k1::{Message, Secp256k1, VerifyOnly};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, EcdsaSighashType, OutPoint, PubkeyHash, PublicKey, Script, ScriptBuf,
    Sequence, Transaction, TxOut, Txid, absolute, ecdsa,
};

use crate::chain::{ChainBackend, ScriptHistoryEntry, Utxo, median_time};
use crate::clock::Clock;
use crate::contract::decode_script;
use crate::error::{Error, Result};
use crate::fee::classify_rejection;
use crate::network::Network;
use crate::params::{Expiry, HtlcParams};
use crate::provider::{FeePolicy, WalletProvider};
use crate::signer::KeySigner;

/// Height of the first block of a new ledger.
pub const GENESIS_HEIGHT: u32 = 100;
/// Ledger time at [`GENESIS_HEIGHT`].
pub const GENESIS_TIME: u64 = 1_700_000_000;
/// Absolute minimum relay fee in satoshi.
pub const DEFAULT_MIN_RELAY_FEE: u64 = 200;

const EQUALVERIFY_FAILED: &str = "Script failed an OP_EQUALVERIFY operation";
const MISSING_OR_SPENT: &str = "bad-txns-inputs-missingorspent";
const BAD_SIGNATURE: &str =
    "mandatory-script-verify-flag-failed (Script evaluated without error but finished with a false/empty top stack element)";
const LOCKTIME_UNSATISFIED: &str = "Locktime requirement not satisfied";
const NON_FINAL: &str = "non-final";
const NON_BIP68_FINAL: &str = "non-BIP68-final";

struct Ledger {
    height: u32,
    time: u64,
    /// Timestamp of every block from genesis to the tip.
    block_times: Vec<u64>,
    min_relay_fee: u64,
    txs: HashMap<Txid, Transaction>,
    /// Confirmation height per txid; 0 while in the mempool.
    tx_heights: HashMap<Txid, u32>,
    /// Order transactions were accepted in.
    accepted: Vec<Txid>,
    utxos: HashMap<OutPoint, (TxOut, Txid)>,
    mempool: Vec<Txid>,
    /// Upcoming backend calls that fail as if the server were unreachable.
    failures: u32,
    faucet_nonce: u32,
}

impl Ledger {
    fn inject_failure(&mut self) -> Result<()> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(Error::Provider("mock: connection reset by peer".into()));
        }
        Ok(())
    }

    fn median_time_past(&self) -> u64 {
        median_time(&self.block_times).unwrap_or(GENESIS_TIME)
    }

    fn output(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.txs
            .get(&outpoint.txid)
            .and_then(|tx| tx.output.get(outpoint.vout as usize))
    }

    fn height_of(&self, txid: &Txid) -> u32 {
        self.tx_heights.get(txid).copied().unwrap_or(0)
    }

    fn accept(&mut self, tx: Transaction, height: u32) -> Txid {
        let txid = tx.compute_txid();
        for input in &tx.input {
            self.utxos.remove(&input.previous_output);
        }
        for (vout, out) in tx.output.iter().enumerate() {
            self.utxos
                .insert(OutPoint::new(txid, vout as u32), (out.clone(), txid));
        }
        self.tx_heights.insert(txid, height);
        if height == 0 {
            self.mempool.push(txid);
        }
        self.accepted.push(txid);
        self.txs.insert(txid, tx);
        txid
    }
}

/// In-memory ledger shared by every clone.
#[derive(Clone)]
pub struct MockChain {
    network: Network,
    secp: Secp256k1<VerifyOnly>,
    inner: Arc<Mutex<Ledger>>,
}

impl MockChain {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            secp: Secp256k1::verification_only(),
            inner: Arc::new(Mutex::new(Ledger {
                height: GENESIS_HEIGHT,
                time: GENESIS_TIME,
                block_times: vec![GENESIS_TIME],
                min_relay_fee: DEFAULT_MIN_RELAY_FEE,
                txs: HashMap::new(),
                tx_heights: HashMap::new(),
                accepted: Vec::new(),
                utxos: HashMap::new(),
                mempool: Vec::new(),
                failures: 0,
                faucet_nonce: 0,
            })),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn height(&self) -> u32 {
        self.ledger().height
    }

    pub fn time(&self) -> u64 {
        self.ledger().time
    }

    pub fn set_min_relay_fee(&self, fee: u64) {
        self.ledger().min_relay_fee = fee;
    }

    /// Make the next `n` backend calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.ledger().failures = n;
    }

    /// Mine `n` blocks stamped with the current ledger time, confirming the
    /// mempool in the first one.
    pub fn mine(&self, n: u32) {
        let mut ledger = self.ledger();
        for _ in 0..n {
            ledger.height += 1;
            let time = ledger.time;
            ledger.block_times.push(time);
            let height = ledger.height;
            for txid in std::mem::take(&mut ledger.mempool) {
                ledger.tx_heights.insert(txid, height);
            }
        }
    }

    pub fn advance_time(&self, secs: u64) {
        self.ledger().time += secs;
    }

    /// Pay `value` to `address` out of thin air, confirmed at the current tip.
    pub fn faucet(&self, address: &Address, value: u64) -> OutPoint {
        let mut ledger = self.ledger();
        ledger.faucet_nonce += 1;
        let tx = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::from_consensus(ledger.faucet_nonce),
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: address.script_pubkey(),
            }],
        };
        let height = ledger.height;
        let txid = ledger.accept(tx, height);
        OutPoint::new(txid, 0)
    }

    /// Sum of unspent outputs paying `address`.
    pub fn balance(&self, address: &Address) -> u64 {
        let spk = address.script_pubkey();
        self.ledger()
            .utxos
            .values()
            .filter(|(out, _)| out.script_pubkey == spk)
            .map(|(out, _)| out.value.to_sat())
            .sum()
    }

    pub fn transaction(&self, txid: &Txid) -> Option<Transaction> {
        self.ledger().txs.get(txid).cloned()
    }

    pub fn is_unspent(&self, outpoint: &OutPoint) -> bool {
        self.ledger().utxos.contains_key(outpoint)
    }

    pub fn mempool_len(&self) -> usize {
        self.ledger().mempool.len()
    }

    /// Random-key wallet on this ledger holding `sats` in one confirmed output.
    pub fn funded_wallet(&self, sats: u64) -> Arc<WalletProvider<MockChain>> {
        self.wallet_with_policy(KeySigner::random(), sats, FeePolicy::default())
    }

    pub fn wallet_with_policy(
        &self,
        signer: KeySigner,
        sats: u64,
        fees: FeePolicy,
    ) -> Arc<WalletProvider<MockChain>> {
        let address = signer.p2wpkh_address(self.network);
        if sats > 0 {
            self.faucet(&address, sats);
        }
        // Only fails for uncompressed keys, which KeySigner never produces.
        match WalletProvider::new(self.clone(), signer, self.network) {
            Ok(wallet) => Arc::new(wallet.with_fee_policy(fees)),
            Err(e) => panic!("mock wallet: {e}"),
        }
    }

    fn validate(&self, ledger: &Ledger, tx: &Transaction) -> std::result::Result<(), String> {
        if tx.input.is_empty() || tx.output.is_empty() {
            return Err("bad-txns-vin-empty".into());
        }
        let mut seen = HashSet::new();
        let mut prevouts = Vec::with_capacity(tx.input.len());
        for input in &tx.input {
            if !seen.insert(input.previous_output) {
                return Err("bad-txns-inputs-duplicate".into());
            }
            match ledger.utxos.get(&input.previous_output) {
                Some((out, _)) => prevouts.push(out.clone()),
                None => return Err(MISSING_OR_SPENT.into()),
            }
        }

        let value_in: u64 = prevouts.iter().map(|o| o.value.to_sat()).sum();
        let value_out: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        if value_out > value_in {
            return Err("bad-txns-in-belowout".into());
        }
        let fee = value_in - value_out;
        if fee < ledger.min_relay_fee {
            return Err(format!(
                "min relay fee not met, {fee} < {}",
                ledger.min_relay_fee
            ));
        }

        if !self.is_final(ledger, tx) {
            return Err(NON_FINAL.into());
        }

        for (index, prevout) in prevouts.iter().enumerate() {
            self.verify_input(ledger, tx, index, prevout)?;
        }
        Ok(())
    }

    fn is_final(&self, ledger: &Ledger, tx: &Transaction) -> bool {
        let lock = tx.lock_time.to_consensus_u32();
        if lock == 0 || tx.input.iter().all(|i| i.sequence == Sequence::MAX) {
            return true;
        }
        if tx.lock_time.is_block_height() {
            lock <= ledger.height + 1
        } else {
            u64::from(lock) < ledger.median_time_past()
        }
    }

    fn verify_input(
        &self,
        ledger: &Ledger,
        tx: &Transaction,
        index: usize,
        prevout: &TxOut,
    ) -> std::result::Result<(), String> {
        let spk = prevout.script_pubkey.as_script();
        let input = &tx.input[index];
        let bytes = spk.as_bytes();
        let mut cache = SighashCache::new(tx);

        if spk.is_p2wpkh() {
            let items: Vec<&[u8]> = input.witness.iter().collect();
            let [sig, pk] = items.as_slice() else {
                return Err("witness program mismatch".into());
            };
            let pubkey = parse_pubkey(pk)?;
            if pubkey.pubkey_hash().as_byte_array()[..] != bytes[2..22] {
                return Err("witness program hash mismatch".into());
            }
            let sighash = cache
                .p2wpkh_signature_hash(index, spk, prevout.value, EcdsaSighashType::All)
                .map_err(|e| e.to_string())?;
            return self.verify_sig(sig, &pubkey, sighash.to_byte_array());
        }

        let (stack, script, is_witness) = if spk.is_p2wsh() {
            let mut items: Vec<Vec<u8>> = input.witness.iter().map(<[u8]>::to_vec).collect();
            let script = items.pop().ok_or("witness program mismatch")?;
            if sha256::Hash::hash(&script).as_byte_array()[..] != bytes[2..34] {
                return Err("witness program hash mismatch".into());
            }
            (items, ScriptBuf::from_bytes(script), true)
        } else if spk.is_p2sh() {
            let mut items = script_sig_items(&input.script_sig)?;
            let script = items.pop().ok_or("redeem script missing")?;
            if hash160::Hash::hash(&script).as_byte_array()[..] != bytes[2..22] {
                return Err("redeem script hash mismatch".into());
            }
            (items, ScriptBuf::from_bytes(script), false)
        } else {
            return Err(format!("mock: unsupported script {spk}"));
        };

        let params = decode_script(&script).map_err(|e| format!("mock: {e}"))?;
        let pubkey = match stack.as_slice() {
            [_, pk, secret, selector] if selector.as_slice() == [1] => {
                if !params.secret_hash.matches(secret) {
                    return Err(EQUALVERIFY_FAILED.into());
                }
                check_key(pk, &params.redeemer_pkh)?
            }
            [_, pk, selector] if selector.is_empty() => {
                self.check_expiry(ledger, tx, index, &params)?;
                check_key(pk, &params.initiator_pkh)?
            }
            _ => return Err("Operation not valid with the current stack size".into()),
        };

        let digest = if is_witness {
            cache
                .p2wsh_signature_hash(index, &script, prevout.value, EcdsaSighashType::All)
                .map_err(|e| e.to_string())?
                .to_byte_array()
        } else {
            cache
                .legacy_signature_hash(index, &script, EcdsaSighashType::All.to_u32())
                .map_err(|e| e.to_string())?
                .to_byte_array()
        };
        self.verify_sig(&stack[0], &pubkey, digest)
    }

    fn check_expiry(
        &self,
        ledger: &Ledger,
        tx: &Transaction,
        index: usize,
        params: &HtlcParams,
    ) -> std::result::Result<(), String> {
        let input = &tx.input[index];
        match params.expiry {
            Expiry::Blocks(n) => {
                let sequence = input.sequence;
                let blocks = sequence.to_consensus_u32() & 0xffff;
                if tx.version.0 < 2
                    || !sequence.is_relative_lock_time()
                    || !sequence.is_height_locked()
                    || blocks < u32::from(n)
                {
                    return Err(LOCKTIME_UNSATISFIED.into());
                }
                let funded_at = ledger.height_of(&input.previous_output.txid);
                if funded_at == 0 || ledger.height + 1 < funded_at + blocks {
                    return Err(NON_BIP68_FINAL.into());
                }
                Ok(())
            }
            Expiry::Timestamp(t) => {
                let lock = tx.lock_time;
                if !lock.is_block_time()
                    || lock.to_consensus_u32() < t
                    || input.sequence == Sequence::MAX
                {
                    return Err(LOCKTIME_UNSATISFIED.into());
                }
                Ok(())
            }
        }
    }

    fn verify_sig(
        &self,
        sig: &[u8],
        pubkey: &PublicKey,
        digest: [u8; 32],
    ) -> std::result::Result<(), String> {
        let sig = ecdsa::Signature::from_slice(sig).map_err(|_| BAD_SIGNATURE.to_string())?;
        if sig.sighash_type != EcdsaSighashType::All {
            return Err(BAD_SIGNATURE.into());
        }
        self.secp
            .verify_ecdsa(&Message::from_digest(digest), &sig.signature, &pubkey.inner)
            .map_err(|_| BAD_SIGNATURE.to_string())
    }
}

fn parse_pubkey(bytes: &[u8]) -> std::result::Result<PublicKey, String> {
    PublicKey::from_slice(bytes).map_err(|e| format!("mock: bad public key: {e}"))
}

fn check_key(bytes: &[u8], expected: &PubkeyHash) -> std::result::Result<PublicKey, String> {
    let pubkey = parse_pubkey(bytes)?;
    if pubkey.pubkey_hash() != *expected {
        return Err(EQUALVERIFY_FAILED.into());
    }
    Ok(pubkey)
}

/// Data pushes of a scriptSig, with `OP_1..OP_16` read as one-byte numbers.
fn script_sig_items(script_sig: &Script) -> std::result::Result<Vec<Vec<u8>>, String> {
    script_sig
        .instructions()
        .map(|ins| match ins {
            Ok(Instruction::PushBytes(bytes)) => Ok(bytes.as_bytes().to_vec()),
            Ok(Instruction::Op(op)) if (0x51..=0x60).contains(&op.to_u8()) => {
                Ok(vec![op.to_u8() - 0x50])
            }
            Ok(Instruction::Op(op)) => Err(format!("mock: non-push opcode {op:?} in scriptSig")),
            Err(e) => Err(format!("mock: {e}")),
        })
        .collect()
}

impl ChainBackend for MockChain {
    fn list_unspent(&self, script_pubkey: &Script) -> Result<Vec<Utxo>> {
        let mut ledger = self.ledger();
        ledger.inject_failure()?;
        let mut utxos: Vec<Utxo> = ledger
            .utxos
            .iter()
            .filter(|(_, (out, _))| out.script_pubkey.as_script() == script_pubkey)
            .map(|(outpoint, (out, txid))| Utxo {
                outpoint: *outpoint,
                value: out.value.to_sat(),
                height: ledger.height_of(txid),
            })
            .collect();
        utxos.sort_by_key(|u| {
            (
                if u.height == 0 { u32::MAX } else { u.height },
                u.outpoint.txid,
                u.outpoint.vout,
            )
        });
        Ok(utxos)
    }

    fn fetch_transaction(&self, txid: &Txid) -> Result<Transaction> {
        let mut ledger = self.ledger();
        ledger.inject_failure()?;
        ledger
            .txs
            .get(txid)
            .cloned()
            .ok_or_else(|| Error::Provider(format!("mock: transaction {txid} not found")))
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let mut ledger = self.ledger();
        ledger.inject_failure()?;
        let txid = tx.compute_txid();
        if ledger.txs.contains_key(&txid) {
            return Err(Error::Broadcast("txn-already-known".into()));
        }
        if let Err(reason) = self.validate(&ledger, tx) {
            log::debug!("mock: rejected {txid}: {reason}");
            return Err(classify_rejection(&reason));
        }
        let txid = ledger.accept(tx.clone(), 0);
        log::debug!("mock: accepted {txid}");
        Ok(txid)
    }

    fn get_script_history(&self, script_pubkey: &Script) -> Result<Vec<ScriptHistoryEntry>> {
        let mut ledger = self.ledger();
        ledger.inject_failure()?;
        let ledger = &*ledger;
        let history = ledger
            .accepted
            .iter()
            .filter(|txid| {
                let Some(tx) = ledger.txs.get(*txid) else {
                    return false;
                };
                let pays = tx
                    .output
                    .iter()
                    .any(|out| out.script_pubkey.as_script() == script_pubkey);
                let spends = tx.input.iter().any(|input| {
                    ledger
                        .output(&input.previous_output)
                        .is_some_and(|out| out.script_pubkey.as_script() == script_pubkey)
                });
                pays || spends
            })
            .map(|txid| ScriptHistoryEntry {
                txid: *txid,
                height: ledger.height_of(txid) as i32,
            })
            .collect();
        Ok(history)
    }

    fn tip_height(&self) -> Result<u32> {
        let mut ledger = self.ledger();
        ledger.inject_failure()?;
        Ok(ledger.height)
    }

    fn median_time_past(&self) -> Result<u64> {
        let mut ledger = self.ledger();
        ledger.inject_failure()?;
        Ok(ledger.median_time_past())
    }
}

/// Clock reading a [`MockChain`]'s time. Every sleep advances ledger time by
/// the requested duration and mines one block.
#[derive(Clone)]
pub struct ChainClock {
    chain: MockChain,
    real_delay: Duration,
}

impl ChainClock {
    pub fn new(chain: MockChain) -> Self {
        Self {
            chain,
            real_delay: Duration::ZERO,
        }
    }

    /// Also block the calling thread for `delay` per sleep, so concurrent
    /// parties get a chance to act between blocks.
    pub fn with_real_delay(mut self, delay: Duration) -> Self {
        self.real_delay = delay;
        self
    }
}

impl Clock for ChainClock {
    fn now(&self) -> u64 {
        self.chain.time()
    }

    fn sleep(&self, duration: Duration) {
        self.chain.advance_time(duration.as_secs().max(1));
        self.chain.mine(1);
        if !self.real_delay.is_zero() {
            std::thread::sleep(self.real_delay);
        }
    }
}
