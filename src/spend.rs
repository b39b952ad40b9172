use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{Message, ecdsa::Signature as RawSignature};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, EcdsaSighashType, OutPoint, PublicKey, Script, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Witness, absolute, ecdsa,
};

use crate::contract::HtlcContract;
use crate::error::{Error, Result};
use crate::params::{Expiry, ScriptVariant};
use crate::witness::{SpendPath, satisfy_script_sig, satisfy_witness};

/// The HTLC output inside a funding transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingOutput {
    pub outpoint: OutPoint,
    pub value: u64,
}

/// Find the output of `funding_tx` paying `contract`'s script pubkey.
pub fn locate_output(contract: &HtlcContract, funding_tx: &Transaction) -> Result<FundingOutput> {
    let txid = funding_tx.compute_txid();
    funding_tx
        .output
        .iter()
        .enumerate()
        .find(|(_, out)| out.script_pubkey.as_script() == contract.script_pubkey())
        .map(|(vout, out)| FundingOutput {
            outpoint: OutPoint::new(txid, vout as u32),
            value: out.value.to_sat(),
        })
        .ok_or_else(|| {
            Error::Validation(format!(
                "transaction {txid} does not fund {}",
                contract.address()
            ))
        })
}

/// Unsigned one-in one-out transaction spending `funding` to `payout`.
///
/// Refunds carry the lock the ELSE branch checks: `nSequence = n` for block
/// expiries, `nLockTime = t` for timestamp expiries.
pub fn unsigned_spend(
    contract: &HtlcContract,
    funding: &FundingOutput,
    payout: &Script,
    fee: u64,
    path: &SpendPath,
) -> Result<Transaction> {
    let value = funding.value.checked_sub(fee).ok_or_else(|| {
        Error::Validation(format!(
            "fee {fee} exceeds the HTLC output value {}",
            funding.value
        ))
    })?;
    let dust = payout.minimal_non_dust().to_sat();
    if value < dust {
        return Err(Error::Validation(format!(
            "spend output {value} sat is below the dust threshold {dust} sat"
        )));
    }

    let (sequence, lock_time) = match (path, contract.expiry()) {
        (SpendPath::Redeem { .. }, _) => (Sequence::ENABLE_LOCKTIME_NO_RBF, absolute::LockTime::ZERO),
        (SpendPath::Refund, Expiry::Blocks(n)) => (Sequence::from_height(n), absolute::LockTime::ZERO),
        (SpendPath::Refund, Expiry::Timestamp(t)) => (
            Sequence::ENABLE_LOCKTIME_NO_RBF,
            absolute::LockTime::from_consensus(t),
        ),
    };

    Ok(Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: funding.outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: payout.to_owned(),
        }],
    })
}

/// Digest the spending key signs, per script variant.
pub fn signature_hash(
    tx: &Transaction,
    contract: &HtlcContract,
    funding: &FundingOutput,
) -> Result<Message> {
    let mut cache = SighashCache::new(tx);
    let digest = match contract.variant() {
        ScriptVariant::Witness => cache
            .p2wsh_signature_hash(
                0,
                contract.script(),
                Amount::from_sat(funding.value),
                EcdsaSighashType::All,
            )
            .map_err(|e| Error::Transaction(format!("segwit sighash: {e}")))?
            .to_byte_array(),
        ScriptVariant::Legacy => cache
            .legacy_signature_hash(0, contract.script(), EcdsaSighashType::All.to_u32())
            .map_err(|e| Error::Transaction(format!("legacy sighash: {e}")))?
            .to_byte_array(),
    };
    Ok(Message::from_digest(digest))
}

/// Attach the signature and branch selector to input 0.
pub fn finalize_spend(
    tx: &mut Transaction,
    contract: &HtlcContract,
    path: &SpendPath,
    signature: RawSignature,
    pubkey: &PublicKey,
) -> Result<()> {
    let sig = ecdsa::Signature {
        signature,
        sighash_type: EcdsaSighashType::All,
    };
    let input = tx
        .input
        .first_mut()
        .ok_or_else(|| Error::Transaction("spend has no inputs".into()))?;
    match contract.variant() {
        ScriptVariant::Witness => {
            input.witness = satisfy_witness(path, &sig, pubkey, contract.script());
        }
        ScriptVariant::Legacy => {
            input.script_sig = satisfy_script_sig(path, &sig, pubkey, contract.script())?;
        }
    }
    Ok(())
}

/// Build, sign and finalize a spend of `funding` in one step.
pub fn build_spend<F>(
    contract: &HtlcContract,
    funding: &FundingOutput,
    payout: &Script,
    fee: u64,
    path: &SpendPath,
    pubkey: &PublicKey,
    sign: F,
) -> Result<Transaction>
where
    F: FnOnce(&Message) -> Result<RawSignature>,
{
    let mut tx = unsigned_spend(contract, funding, payout, fee, path)?;
    let sighash = signature_hash(&tx, contract, funding)?;
    let signature = sign(&sighash)?;
    finalize_spend(&mut tx, contract, path, signature, pubkey)?;
    Ok(tx)
}
