use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::{Hash, sha256};
use bitcoin::{Address, PubkeyHash};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::Network;

/// Below this value `nLockTime` is a block height, at or above it a unix time.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// SHA-256 digest of a swap [`Secret`], published at swap creation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretHash(pub [u8; 32]);

impl SecretHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether `preimage` hashes to this digest.
    pub fn matches(&self, preimage: &[u8]) -> bool {
        sha256::Hash::hash(preimage).to_byte_array() == self.0
    }
}

impl fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretHash({})", self.to_hex())
    }
}

impl fmt::Display for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for SecretHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_hex32(s, "secret hash").map(SecretHash)
    }
}

/// 32-byte preimage. Revealing it on any ledger is irreversible.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; 32]);

impl Secret {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Validation(format!("secret must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hash(&self) -> SecretHash {
        SecretHash(sha256::Hash::hash(&self.0).to_byte_array())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

impl FromStr for Secret {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_hex32(s, "secret").map(Secret)
    }
}

fn parse_hex32(s: &str, what: &str) -> Result<[u8; 32]> {
    let trimmed = s.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(digits).map_err(|e| Error::Validation(format!("{what}: {e}")))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| Error::Validation(format!("{what} must be 32 bytes, got {}", b.len())))
}

/// When the refund branch of the HTLC opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expiry {
    /// Relative lock: confirmations of the funding transaction, enforced with
    /// `OP_CHECKSEQUENCEVERIFY`.
    Blocks(u16),
    /// Absolute deadline in unix seconds, enforced with
    /// `OP_CHECKLOCKTIMEVERIFY`.
    Timestamp(u32),
}

impl Expiry {
    pub fn validate(&self) -> Result<()> {
        match *self {
            Expiry::Blocks(0) => Err(Error::Validation("block expiry must be positive".into())),
            Expiry::Blocks(_) => Ok(()),
            Expiry::Timestamp(t) if t < LOCKTIME_THRESHOLD => Err(Error::Validation(format!(
                "timestamp expiry {t} is below the locktime threshold {LOCKTIME_THRESHOLD}"
            ))),
            Expiry::Timestamp(_) => Ok(()),
        }
    }

    /// The number pushed in the ELSE branch.
    pub fn script_value(&self) -> i64 {
        match *self {
            Expiry::Blocks(n) => i64::from(n),
            Expiry::Timestamp(t) => i64::from(t),
        }
    }

    pub fn is_relative(&self) -> bool {
        matches!(self, Expiry::Blocks(_))
    }
}

/// How the compiled script is committed to in the funding output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptVariant {
    /// P2SH: HASH160 commitment, scriptSig spend, legacy sighash.
    Legacy,
    /// P2WSH: SHA-256 commitment, witness spend, BIP-143 sighash.
    #[default]
    Witness,
}

/// The immutable terms an HTLC script is compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtlcParams {
    pub secret_hash: SecretHash,
    pub redeemer_pkh: PubkeyHash,
    pub initiator_pkh: PubkeyHash,
    pub expiry: Expiry,
}

impl HtlcParams {
    /// Decode both addresses and validate the expiry.
    ///
    /// Fails with [`Error::InvalidAddress`] when either address is empty, does
    /// not parse for `network`, or does not commit to a public key hash.
    pub fn new(
        secret_hash: SecretHash,
        redeemer_address: &str,
        initiator_address: &str,
        expiry: Expiry,
        network: Network,
    ) -> Result<Self> {
        let redeemer_pkh = decode_pubkey_hash(redeemer_address, network)?;
        let initiator_pkh = decode_pubkey_hash(initiator_address, network)?;
        expiry.validate()?;
        Ok(Self {
            secret_hash,
            redeemer_pkh,
            initiator_pkh,
            expiry,
        })
    }
}

/// Parse an address and check it belongs to `network`.
pub fn parse_address(address: &str, network: Network) -> Result<Address> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidAddress("address is empty".into()));
    }
    Address::from_str(trimmed)
        .map_err(|e| Error::InvalidAddress(format!("{trimmed}: {e}")))?
        .require_network(network.into_bitcoin())
        .map_err(|e| Error::InvalidAddress(format!("{trimmed}: {e}")))
}

/// Extract the 20-byte public key hash from a P2PKH or P2WPKH address.
pub fn decode_pubkey_hash(address: &str, network: Network) -> Result<PubkeyHash> {
    let parsed = parse_address(address, network)?;
    let spk = parsed.script_pubkey();
    let bytes = spk.as_bytes();
    // P2PKH: DUP HASH160 <20> EQUALVERIFY CHECKSIG; P2WPKH: 0 <20>
    let hash = if spk.is_p2pkh() {
        &bytes[3..23]
    } else if spk.is_p2wpkh() {
        &bytes[2..22]
    } else {
        return Err(Error::InvalidAddress(format!(
            "{}: not a public-key-hash address",
            address.trim()
        )));
    };
    let arr: [u8; 20] = hash
        .try_into()
        .map_err(|_| Error::InvalidAddress(format!("{}: bad key hash length", address.trim())))?;
    Ok(PubkeyHash::from_byte_array(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Key of the secp256k1 generator point (private key 1).
    const G_P2PKH_MAINNET: &str = "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH";
    const G_P2WPKH_MAINNET: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

    #[test]
    fn secret_hash_is_sha256() {
        let secret = Secret::new([0u8; 32]);
        assert_eq!(
            secret.hash().to_hex(),
            "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
        );
        assert!(secret.hash().matches(secret.as_bytes()));
        assert!(!secret.hash().matches(&[1u8; 32]));
    }

    #[test]
    fn hex_parsing_accepts_0x_prefix() {
        let hex = "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925";
        let a: SecretHash = hex.parse().unwrap();
        let b: SecretHash = format!("0x{hex}").parse().unwrap();
        assert_eq!(a, b);
        assert!("abcd".parse::<SecretHash>().is_err());
        assert!("zz".parse::<Secret>().is_err());
    }

    #[test]
    fn random_secrets_differ() {
        assert_ne!(Secret::random(), Secret::random());
    }

    #[test]
    fn expiry_validation() {
        assert!(Expiry::Blocks(0).validate().is_err());
        assert!(Expiry::Blocks(10).validate().is_ok());
        assert!(Expiry::Timestamp(1_000).validate().is_err());
        assert!(Expiry::Timestamp(1_700_000_000).validate().is_ok());
    }

    #[test]
    fn decodes_p2pkh_and_p2wpkh_to_same_hash() {
        let a = decode_pubkey_hash(G_P2PKH_MAINNET, Network::Mainnet).unwrap();
        let b = decode_pubkey_hash(G_P2WPKH_MAINNET, Network::Mainnet).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            hex::encode(a.to_byte_array()),
            "751e76e8199196d454941c45d1b3a323f1433bd6"
        );
    }

    #[test]
    fn rejects_empty_and_foreign_network_addresses() {
        assert!(matches!(
            decode_pubkey_hash("", Network::Mainnet),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            decode_pubkey_hash("not-an-address", Network::Mainnet),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            decode_pubkey_hash(G_P2PKH_MAINNET, Network::Testnet),
            Err(Error::InvalidAddress(_))
        ));
    }
}
