use std::str::FromStr;

use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey, ecdsa::Signature};
use bitcoin::{Address, CompressedPublicKey, PublicKey};
use rand::RngCore;

use crate::error::{Error, Result};
use crate::network::Network;

/// A single signing key. Callers sharing one signer across legs must
/// serialize access themselves if the backing key store requires it.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKey;

    /// ECDSA signature over a 32-byte sighash.
    fn sign(&self, sighash: &Message) -> Result<Signature>;
}

/// In-memory secp256k1 key.
#[derive(Clone)]
pub struct KeySigner {
    secp: Secp256k1<All>,
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl KeySigner {
    pub fn new(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::new(secret_key.public_key(&secp));
        Self {
            secp,
            secret_key,
            public_key,
        }
    }

    /// Fresh key from the thread RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        loop {
            rand::thread_rng().fill_bytes(&mut bytes);
            if let Ok(sk) = SecretKey::from_slice(&bytes) {
                return Self::new(sk);
            }
        }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let sk = SecretKey::from_str(hex_key.trim().trim_start_matches("0x"))
            .map_err(|e| Error::Signer(format!("invalid secret key: {e}")))?;
        Ok(Self::new(sk))
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    pub fn compressed_public_key(&self) -> CompressedPublicKey {
        CompressedPublicKey(self.public_key.inner)
    }

    /// Native segwit address of this key; also the wallet's funding and payout address.
    pub fn p2wpkh_address(&self, network: Network) -> Address {
        Address::p2wpkh(&self.compressed_public_key(), network.into_bitcoin())
    }

    pub fn p2pkh_address(&self, network: Network) -> Address {
        Address::p2pkh(self.public_key.pubkey_hash(), network.into_bitcoin())
    }
}

impl std::fmt::Debug for KeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySigner")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl Signer for KeySigner {
    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn sign(&self, sighash: &Message) -> Result<Signature> {
        Ok(self.secp.sign_ecdsa(sighash, &self.secret_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_ONE: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn generator_key_addresses() {
        let signer = KeySigner::from_hex(KEY_ONE).unwrap();
        assert_eq!(
            signer.p2pkh_address(Network::Mainnet).to_string(),
            "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH"
        );
        assert_eq!(
            signer.p2wpkh_address(Network::Mainnet).to_string(),
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"
        );
    }

    #[test]
    fn signatures_verify() {
        let signer = KeySigner::random();
        let msg = Message::from_digest([42u8; 32]);
        let sig = signer.sign(&msg).unwrap();
        Secp256k1::verification_only()
            .verify_ecdsa(&msg, &sig, &signer.public_key().inner)
            .unwrap();
    }

    #[test]
    fn hex_roundtrip_and_rejection() {
        let signer = KeySigner::random();
        let again = KeySigner::from_hex(&signer.secret_key_hex()).unwrap();
        assert_eq!(signer.public_key(), again.public_key());
        assert!(KeySigner::from_hex("00").is_err());
        assert!(matches!(
            KeySigner::from_hex(&"00".repeat(32)),
            Err(Error::Signer(_))
        ));
    }
}
