//! The signing seam: a capability trait with a software-key implementation
//! and (behind the `ledger` feature) a hardware one. The voting loop only
//! ever sees the trait.

use async_trait::async_trait;
use base64::prelude::*;
use bech32::{Bech32, Hrp};
use hmac::{Hmac, Mac};
use k256::ecdsa::{signature::Signer as _, Signature, SigningKey};
use k256::elliptic_curve::sec1::ToEncodedPoint as _;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};

/// Derivation-path label mixed into the seed. Changing it changes every
/// derived key, so it is fixed for the lifetime of the chain.
const DERIVATION_PATH: &str = "m/44'/330'/0'/0/0";

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("signing device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("signing rejected: {0}")]
    Rejected(String),
    #[error("invalid key material: {0}")]
    BadKey(String),
}

/// What the voting loop needs from a key, software or hardware.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Bech32 feeder account address.
    fn address(&self) -> &str;
    /// Compressed secp256k1 public key, base64.
    fn public_key_base64(&self) -> &str;
    /// Signs the canonical sign-doc bytes, returning a 64-byte r||s
    /// signature. Hardware keys may block here awaiting user confirmation.
    async fn sign(&self, sign_bytes: &[u8]) -> Result<Vec<u8>, SignError>;
}

/// Bech32 account address for a compressed secp256k1 public key:
/// `bech32(hrp, ripemd160(sha256(pubkey)))`.
pub fn account_address(hrp: &str, compressed_pubkey: &[u8]) -> Result<String, SignError> {
    let digest = Ripemd160::digest(Sha256::digest(compressed_pubkey));
    let hrp = Hrp::parse(hrp).map_err(|e| SignError::BadKey(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, &digest).map_err(|e| SignError::BadKey(e.to_string()))
}

/// Re-encodes a bech32 account address under the validator-operator prefix.
pub fn operator_address(account: &str) -> Result<String, SignError> {
    let (hrp, data) = bech32::decode(account).map_err(|e| SignError::BadKey(e.to_string()))?;
    let operator_hrp = format!("{}valoper", hrp.as_str());
    let operator_hrp = Hrp::parse(&operator_hrp).map_err(|e| SignError::BadKey(e.to_string()))?;
    bech32::encode::<Bech32>(operator_hrp, &data).map_err(|e| SignError::BadKey(e.to_string()))
}

pub struct SoftwareSigner {
    key: SigningKey,
    address: String,
    public_key_base64: String,
}

impl SoftwareSigner {
    /// Derives the signing key from a BIP-39 mnemonic: seed with empty
    /// passphrase, HMAC-SHA512 keyed with the derivation path, first 32
    /// bytes as the secp256k1 secret.
    pub fn from_mnemonic(mnemonic: &str, hrp: &str) -> Result<Self, SignError> {
        let mnemonic = bip39::Mnemonic::parse_normalized(mnemonic)
            .map_err(|e| SignError::BadKey(e.to_string()))?;
        let seed = mnemonic.to_seed_normalized("");

        let mut mac = Hmac::<Sha512>::new_from_slice(DERIVATION_PATH.as_bytes())
            .map_err(|e| SignError::BadKey(e.to_string()))?;
        mac.update(&seed);
        let derived = mac.finalize().into_bytes();

        let key = SigningKey::from_bytes(k256::FieldBytes::from_slice(&derived[..32]))
            .map_err(|e| SignError::BadKey(e.to_string()))?;
        Self::new(key, hrp)
    }

    pub fn new(key: SigningKey, hrp: &str) -> Result<Self, SignError> {
        let compressed = key.verifying_key().to_encoded_point(true);
        let address = account_address(hrp, compressed.as_bytes())?;
        let public_key_base64 = BASE64_STANDARD.encode(compressed.as_bytes());
        Ok(SoftwareSigner {
            key,
            address,
            public_key_base64,
        })
    }
}

#[async_trait]
impl Signer for SoftwareSigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn public_key_base64(&self) -> &str {
        &self.public_key_base64
    }

    async fn sign(&self, sign_bytes: &[u8]) -> Result<Vec<u8>, SignError> {
        // k256 hashes the message with SHA-256 internally; the chain
        // additionally requires the low-s form.
        let signature: Signature = self.key.sign(sign_bytes);
        let signature = signature.normalize_s().unwrap_or(signature);
        Ok(signature.to_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::{operator_address, Signer, SoftwareSigner};

    // A fixed, well-known test mnemonic. Never fund it.
    const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon \
         abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon \
         abandon abandon abandon abandon abandon art";

    #[test]
    fn derivation_is_deterministic() {
        let a = SoftwareSigner::from_mnemonic(MNEMONIC, "terra").unwrap();
        let b = SoftwareSigner::from_mnemonic(MNEMONIC, "terra").unwrap();
        assert_eq!(a.address(), b.address());
        assert_eq!(a.public_key_base64(), b.public_key_base64());
    }

    #[test]
    fn address_carries_prefix() {
        let signer = SoftwareSigner::from_mnemonic(MNEMONIC, "terra").unwrap();
        assert!(signer.address().starts_with("terra1"));
    }

    #[test]
    fn invalid_mnemonic_rejected() {
        assert!(SoftwareSigner::from_mnemonic("not a mnemonic", "terra").is_err());
    }

    #[test]
    fn operator_address_reencodes_prefix() {
        let signer = SoftwareSigner::from_mnemonic(MNEMONIC, "terra").unwrap();
        let operator = operator_address(signer.address()).unwrap();
        assert!(operator.starts_with("terravaloper1"));
        // Same key material, different checksum domain.
        assert_ne!(operator, signer.address());
    }

    #[tokio::test]
    async fn signature_is_compact_and_deterministic() {
        let signer = SoftwareSigner::from_mnemonic(MNEMONIC, "terra").unwrap();
        let first = signer.sign(b"canonical bytes").await.unwrap();
        let second = signer.sign(b"canonical bytes").await.unwrap();
        assert_eq!(first.len(), 64);
        // RFC 6979 nonces make ECDSA deterministic per message.
        assert_eq!(first, second);
        assert_ne!(first, signer.sign(b"other bytes").await.unwrap());
    }
}
