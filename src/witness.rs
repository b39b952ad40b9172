use bitcoin::opcodes::all::{OP_PUSHBYTES_0, OP_PUSHNUM_1};
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{PublicKey, Script, ScriptBuf, TxIn, Witness, ecdsa};

use crate::error::{Error, Result};
use crate::params::{Secret, SecretHash};

/// Which branch of the HTLC a spending input satisfies.
#[derive(Debug, Clone)]
pub enum SpendPath {
    /// IF branch: redeemer presents the preimage.
    Redeem { secret: Secret },
    /// ELSE branch: initiator reclaims after expiry.
    Refund,
}

/// Witness stack for a P2WSH spend.
///
/// Redeem: `[sig, pubkey, secret, 0x01, script]`.
/// Refund: `[sig, pubkey, <empty>, script]`.
pub fn satisfy_witness(
    path: &SpendPath,
    signature: &ecdsa::Signature,
    pubkey: &PublicKey,
    script: &Script,
) -> Witness {
    let mut witness = Witness::new();
    witness.push(signature.to_vec());
    witness.push(pubkey.to_bytes());
    match path {
        SpendPath::Redeem { secret } => {
            witness.push(secret.as_bytes());
            witness.push([0x01]);
        }
        SpendPath::Refund => witness.push(Vec::<u8>::new()),
    }
    witness.push(script.as_bytes());
    witness
}

/// scriptSig for a P2SH spend, same element order as [`satisfy_witness`]
/// with `OP_1` / `OP_0` as the branch selector.
pub fn satisfy_script_sig(
    path: &SpendPath,
    signature: &ecdsa::Signature,
    pubkey: &PublicKey,
    script: &Script,
) -> Result<ScriptBuf> {
    let sig = PushBytesBuf::try_from(signature.to_vec())
        .map_err(|e| Error::Transaction(format!("signature push: {e}")))?;
    let redeem_script = PushBytesBuf::try_from(script.to_bytes())
        .map_err(|e| Error::Transaction(format!("redeem script push: {e}")))?;

    let builder = Builder::new().push_slice(sig).push_key(pubkey);
    let builder = match path {
        SpendPath::Redeem { secret } => builder
            .push_slice(secret.as_bytes())
            .push_opcode(OP_PUSHNUM_1),
        SpendPath::Refund => builder.push_opcode(OP_PUSHBYTES_0),
    };
    Ok(builder.push_slice(redeem_script).into_script())
}

/// Pull a revealed preimage out of an input that spent an HTLC.
///
/// Looks at witness item 2 for P2WSH spends and the third scriptSig push for
/// P2SH spends. Returns `None` for refund spends or when the candidate does
/// not hash to `secret_hash`.
pub fn extract_secret(input: &TxIn, secret_hash: &SecretHash) -> Option<Secret> {
    let candidate = if input.witness.len() == 5 {
        input.witness.nth(2).map(<[u8]>::to_vec)
    } else {
        third_push(&input.script_sig)
    }?;
    if candidate.len() != 32 || !secret_hash.matches(&candidate) {
        return None;
    }
    Secret::from_slice(&candidate).ok()
}

fn third_push(script_sig: &Script) -> Option<Vec<u8>> {
    match script_sig.instructions().nth(2)? {
        Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
    use bitcoin::{EcdsaSighashType, OutPoint, Sequence};

    fn fixtures() -> (ecdsa::Signature, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let pk = PublicKey::new(sk.public_key(&secp));
        let msg = Message::from_digest([3u8; 32]);
        let sig = ecdsa::Signature {
            signature: secp.sign_ecdsa(&msg, &sk),
            sighash_type: EcdsaSighashType::All,
        };
        (sig, pk)
    }

    fn input_with(witness: Witness, script_sig: ScriptBuf) -> TxIn {
        TxIn {
            previous_output: OutPoint::null(),
            script_sig,
            sequence: Sequence::MAX,
            witness,
        }
    }

    #[test]
    fn redeem_witness_layout() {
        let (sig, pk) = fixtures();
        let secret = Secret::new([9u8; 32]);
        let script = ScriptBuf::from_bytes(vec![0x51]);
        let w = satisfy_witness(&SpendPath::Redeem { secret: secret.clone() }, &sig, &pk, &script);
        assert_eq!(w.len(), 5);
        assert_eq!(w.nth(0).unwrap().last(), Some(&0x01)); // SIGHASH_ALL suffix
        assert_eq!(w.nth(1).unwrap(), pk.to_bytes().as_slice());
        assert_eq!(w.nth(2).unwrap(), secret.as_bytes());
        assert_eq!(w.nth(3).unwrap(), &[0x01]);
        assert_eq!(w.nth(4).unwrap(), script.as_bytes());
    }

    #[test]
    fn refund_witness_has_empty_selector() {
        let (sig, pk) = fixtures();
        let script = ScriptBuf::from_bytes(vec![0x51]);
        let w = satisfy_witness(&SpendPath::Refund, &sig, &pk, &script);
        assert_eq!(w.len(), 4);
        assert!(w.nth(2).unwrap().is_empty());
    }

    #[test]
    fn extracts_secret_from_witness_and_script_sig() {
        let (sig, pk) = fixtures();
        let secret = Secret::new([5u8; 32]);
        let hash = secret.hash();
        let script = ScriptBuf::from_bytes(vec![0x51]);
        let path = SpendPath::Redeem { secret: secret.clone() };

        let witness = satisfy_witness(&path, &sig, &pk, &script);
        let input = input_with(witness, ScriptBuf::new());
        assert_eq!(extract_secret(&input, &hash), Some(secret.clone()));

        let script_sig = satisfy_script_sig(&path, &sig, &pk, &script).unwrap();
        let input = input_with(Witness::new(), script_sig);
        assert_eq!(extract_secret(&input, &hash), Some(secret));
    }

    #[test]
    fn refund_and_wrong_hash_yield_nothing() {
        let (sig, pk) = fixtures();
        let secret = Secret::new([5u8; 32]);
        let script = ScriptBuf::from_bytes(vec![0x51]);

        let refund = satisfy_script_sig(&SpendPath::Refund, &sig, &pk, &script).unwrap();
        let input = input_with(Witness::new(), refund);
        assert_eq!(extract_secret(&input, &secret.hash()), None);

        let witness = satisfy_witness(&SpendPath::Redeem { secret }, &sig, &pk, &script);
        let input = input_with(witness, ScriptBuf::new());
        let other = SecretHash(bitcoin::hashes::sha256::Hash::hash(&[1u8]).to_byte_array());
        assert_eq!(extract_secret(&input, &other), None);
    }
}
