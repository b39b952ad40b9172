use bitcoin::hashes::Hash as _;
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CLTV, OP_CSV, OP_DROP, OP_DUP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY, OP_HASH160,
    OP_IF, OP_SHA256,
};
use bitcoin::opcodes::Opcode;
use bitcoin::script::{Builder, Instruction};
use bitcoin::{Address, PubkeyHash, Script, ScriptBuf, ScriptHash, WScriptHash};

use crate::error::{Error, Result};
use crate::network::Network;
use crate::params::{Expiry, HtlcParams, ScriptVariant, SecretHash};

/// Number of instructions in the compiled template.
const TEMPLATE_LEN: usize = 17;

/// A compiled HTLC script together with the funding output it is committed to.
///
/// Pure function of its inputs: the same parameters, variant and network
/// always produce the same script bytes and address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcContract {
    params: HtlcParams,
    variant: ScriptVariant,
    network: Network,
    script: ScriptBuf,
    script_pubkey: ScriptBuf,
    address: Address,
}

impl HtlcContract {
    /// Build the contract from raw swap terms.
    ///
    /// `redeemer_address` can claim with the secret; `initiator_address` can
    /// reclaim after `expiry`. Both must be P2PKH or P2WPKH on `network`.
    pub fn build(
        secret_hash: SecretHash,
        redeemer_address: &str,
        initiator_address: &str,
        expiry: Expiry,
        network: Network,
        variant: ScriptVariant,
    ) -> Result<Self> {
        let params = HtlcParams::new(
            secret_hash,
            redeemer_address,
            initiator_address,
            expiry,
            network,
        )?;
        Self::new(params, variant, network)
    }

    /// Compile already-decoded parameters.
    pub fn new(params: HtlcParams, variant: ScriptVariant, network: Network) -> Result<Self> {
        params.expiry.validate()?;
        let script = compile_script(&params);
        let script_pubkey = commit_script(&script, variant);
        let address = match variant {
            ScriptVariant::Legacy => Address::p2sh(&script, network.into_bitcoin())
                .map_err(|e| Error::Transaction(format!("p2sh address: {e}")))?,
            ScriptVariant::Witness => Address::p2wsh(&script, network.into_bitcoin()),
        };
        Ok(Self {
            params,
            variant,
            network,
            script,
            script_pubkey,
            address,
        })
    }

    /// Rebuild a contract from a counterpart's script, e.g. to audit the
    /// address they claim to have funded.
    pub fn from_script(script: &Script, variant: ScriptVariant, network: Network) -> Result<Self> {
        let params = decode_script(script)?;
        Self::new(params, variant, network)
    }

    pub fn params(&self) -> &HtlcParams {
        &self.params
    }

    pub fn variant(&self) -> ScriptVariant {
        self.variant
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// The redeem (P2SH) or witness (P2WSH) script.
    pub fn script(&self) -> &Script {
        &self.script
    }

    /// The script pubkey of the funding output.
    pub fn script_pubkey(&self) -> &Script {
        &self.script_pubkey
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn secret_hash(&self) -> &SecretHash {
        &self.params.secret_hash
    }

    pub fn expiry(&self) -> Expiry {
        self.params.expiry
    }
}

/// Compile the IF/ELSE template.
///
/// ```text
/// OP_IF
///     OP_SHA256 <secret_hash> OP_EQUALVERIFY OP_DUP OP_HASH160 <redeemer_pkh>
/// OP_ELSE
///     <expiry> OP_CHECKSEQUENCEVERIFY|OP_CHECKLOCKTIMEVERIFY OP_DROP
///     OP_DUP OP_HASH160 <initiator_pkh>
/// OP_ENDIF
/// OP_EQUALVERIFY OP_CHECKSIG
/// ```
pub fn compile_script(params: &HtlcParams) -> ScriptBuf {
    let lock_op = match params.expiry {
        Expiry::Blocks(_) => OP_CSV,
        Expiry::Timestamp(_) => OP_CLTV,
    };
    Builder::new()
        .push_opcode(OP_IF)
        .push_opcode(OP_SHA256)
        .push_slice(params.secret_hash.as_bytes())
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(params.redeemer_pkh.as_byte_array())
        .push_opcode(OP_ELSE)
        .push_int(params.expiry.script_value())
        .push_opcode(lock_op)
        .push_opcode(OP_DROP)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(params.initiator_pkh.as_byte_array())
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// Funding script pubkey committing to `script` under `variant`.
pub fn commit_script(script: &Script, variant: ScriptVariant) -> ScriptBuf {
    match variant {
        ScriptVariant::Legacy => ScriptBuf::new_p2sh(&ScriptHash::hash(script.as_bytes())),
        ScriptVariant::Witness => ScriptBuf::new_p2wsh(&WScriptHash::hash(script.as_bytes())),
    }
}

/// Recover swap terms from a script produced by [`compile_script`].
pub fn decode_script(script: &Script) -> Result<HtlcParams> {
    let ins = script
        .instructions()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Validation(format!("script parse error: {e}")))?;
    if ins.len() != TEMPLATE_LEN {
        return Err(Error::Validation(format!(
            "not an HTLC script: {} instructions, expected {TEMPLATE_LEN}",
            ins.len()
        )));
    }

    expect_op(&ins[0], OP_IF)?;
    expect_op(&ins[1], OP_SHA256)?;
    let secret_hash: [u8; 32] = expect_push(&ins[2])?
        .try_into()
        .map_err(|_| Error::Validation("secret hash push must be 32 bytes".into()))?;
    expect_op(&ins[3], OP_EQUALVERIFY)?;
    expect_op(&ins[4], OP_DUP)?;
    expect_op(&ins[5], OP_HASH160)?;
    let redeemer_pkh = expect_pkh(&ins[6])?;
    expect_op(&ins[7], OP_ELSE)?;
    let lock_value = read_number(&ins[8])?;
    let expiry = match ins[9] {
        Instruction::Op(op) if op == OP_CSV => Expiry::Blocks(
            u16::try_from(lock_value)
                .map_err(|_| Error::Validation(format!("CSV value {lock_value} out of range")))?,
        ),
        Instruction::Op(op) if op == OP_CLTV => Expiry::Timestamp(
            u32::try_from(lock_value)
                .map_err(|_| Error::Validation(format!("CLTV value {lock_value} out of range")))?,
        ),
        _ => return Err(Error::Validation("expected CSV or CLTV".into())),
    };
    expect_op(&ins[10], OP_DROP)?;
    expect_op(&ins[11], OP_DUP)?;
    expect_op(&ins[12], OP_HASH160)?;
    let initiator_pkh = expect_pkh(&ins[13])?;
    expect_op(&ins[14], OP_ENDIF)?;
    expect_op(&ins[15], OP_EQUALVERIFY)?;
    expect_op(&ins[16], OP_CHECKSIG)?;

    let params = HtlcParams {
        secret_hash: SecretHash(secret_hash),
        redeemer_pkh,
        initiator_pkh,
        expiry,
    };
    params.expiry.validate()?;
    Ok(params)
}

fn expect_op(ins: &Instruction<'_>, expected: Opcode) -> Result<()> {
    match ins {
        Instruction::Op(op) if *op == expected => Ok(()),
        other => Err(Error::Validation(format!(
            "expected {expected:?}, found {other:?}"
        ))),
    }
}

fn expect_push<'a>(ins: &Instruction<'a>) -> Result<&'a [u8]> {
    match ins {
        Instruction::PushBytes(bytes) => Ok(bytes.as_bytes()),
        other => Err(Error::Validation(format!("expected data push, found {other:?}"))),
    }
}

fn expect_pkh(ins: &Instruction<'_>) -> Result<PubkeyHash> {
    let arr: [u8; 20] = expect_push(ins)?
        .try_into()
        .map_err(|_| Error::Validation("key hash push must be 20 bytes".into()))?;
    Ok(PubkeyHash::from_byte_array(arr))
}

/// Read a number pushed either as `OP_1..OP_16` or as a minimal script number.
fn read_number(ins: &Instruction<'_>) -> Result<i64> {
    match ins {
        Instruction::Op(op) => {
            let code = op.to_u8();
            // OP_PUSHNUM_1 ..= OP_PUSHNUM_16
            if (0x51..=0x60).contains(&code) {
                Ok(i64::from(code - 0x50))
            } else {
                Err(Error::Validation(format!("expected number, found {op:?}")))
            }
        }
        Instruction::PushBytes(bytes) => decode_script_num(bytes.as_bytes())
            .ok_or_else(|| Error::Validation("malformed script number".into())),
    }
}

/// Little-endian sign-magnitude decoding, at most 5 bytes.
pub(crate) fn decode_script_num(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() {
        return Some(0);
    }
    if bytes.len() > 5 {
        return None;
    }
    let mut value: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= i64::from(*b) << (8 * i);
    }
    let last = bytes[bytes.len() - 1];
    if last & 0x80 != 0 {
        value &= !(0x80_i64 << (8 * (bytes.len() - 1)));
        value = -value;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REDEEMER: &str = "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH";
    const INITIATOR: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

    fn contract(expiry: Expiry, variant: ScriptVariant) -> HtlcContract {
        HtlcContract::build(
            SecretHash([0x11; 32]),
            REDEEMER,
            INITIATOR,
            expiry,
            Network::Mainnet,
            variant,
        )
        .unwrap()
    }

    #[test]
    fn script_layout() {
        let c = contract(Expiry::Blocks(10), ScriptVariant::Witness);
        let bytes = c.script().as_bytes();
        assert_eq!(bytes[0], 0x63); // OP_IF
        assert_eq!(bytes[1], 0xa8); // OP_SHA256
        assert_eq!(bytes[2], 0x20); // PUSH32
        assert_eq!(&bytes[3..35], &[0x11; 32]);
        assert!(bytes.contains(&0xb2)); // OP_CSV
        assert_eq!(&bytes[bytes.len() - 3..], &[0x68, 0x88, 0xac]);
    }

    #[test]
    fn timestamp_expiry_uses_cltv() {
        let c = contract(Expiry::Timestamp(1_700_000_000), ScriptVariant::Witness);
        let bytes = c.script().as_bytes();
        assert!(bytes.contains(&0xb1)); // OP_CLTV
        assert!(!bytes.contains(&0xb2));
    }

    #[test]
    fn decode_roundtrip_small_and_large_numbers() {
        for expiry in [
            Expiry::Blocks(1),
            Expiry::Blocks(16),
            Expiry::Blocks(144),
            Expiry::Blocks(u16::MAX),
            Expiry::Timestamp(1_700_000_000),
            Expiry::Timestamp(u32::MAX),
        ] {
            let c = contract(expiry, ScriptVariant::Witness);
            assert_eq!(decode_script(c.script()).unwrap(), *c.params());
        }
    }

    #[test]
    fn decode_rejects_foreign_scripts() {
        let p2wpkh = crate::params::parse_address(INITIATOR, Network::Mainnet)
            .unwrap()
            .script_pubkey();
        assert!(decode_script(&p2wpkh).is_err());
        assert!(decode_script(Script::new()).is_err());
    }

    #[test]
    fn script_num_decoding() {
        assert_eq!(decode_script_num(&[]), Some(0));
        assert_eq!(decode_script_num(&[0x90, 0x00]), Some(144));
        assert_eq!(decode_script_num(&[0x81]), Some(-1));
        assert_eq!(decode_script_num(&[0xff, 0xff, 0xff, 0xff, 0x00]), Some(0xffff_ffff));
        assert_eq!(decode_script_num(&[0; 6]), None);
    }

    #[test]
    fn variants_commit_differently() {
        let legacy = contract(Expiry::Blocks(10), ScriptVariant::Legacy);
        let witness = contract(Expiry::Blocks(10), ScriptVariant::Witness);
        assert_eq!(legacy.script(), witness.script());
        assert!(legacy.script_pubkey().is_p2sh());
        assert!(witness.script_pubkey().is_p2wsh());
        assert!(legacy.address().to_string().starts_with('3'));
        assert!(witness.address().to_string().starts_with("bc1q"));
        assert_eq!(legacy.address().script_pubkey().as_script(), legacy.script_pubkey());
        assert_eq!(witness.address().script_pubkey().as_script(), witness.script_pubkey());
    }
}
