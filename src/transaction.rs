//! Oracle message construction and the canonical transaction encoding.
//!
//! Everything the chain is strict about lives here: the message type URLs,
//! the commitment hash construction, and the sorted-key JSON sign doc. A
//! chain upgrade that changes any of these should only touch this module.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Bytes of salt drawn per currency per prevote. Hex-encoded on the wire.
pub const SALT_BYTES: usize = 8;

/// The chain truncates the prevote commitment to this many bytes of SHA-256.
pub const VOTE_HASH_BYTES: usize = 20;

/// The on-chain asset identifier for a currency code.
pub fn denom_for(currency: &str) -> String {
    format!("u{currency}")
}

/// A fresh per-currency salt from the OS CSPRNG.
pub fn fresh_salt() -> String {
    let mut bytes = [0u8; SALT_BYTES];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    hex::encode(bytes)
}

/// The commitment a prevote publishes and the paired reveal must re-derive:
/// truncated SHA-256 over `"{salt}:{exchange_rate}:{denom}:{validator}"`.
pub fn vote_hash(salt: &str, exchange_rate: &str, denom: &str, validator: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{salt}:{exchange_rate}:{denom}:{validator}"));
    hex::encode(&hasher.finalize()[..VOTE_HASH_BYTES])
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum OracleMsg {
    #[serde(rename = "oracle/MsgExchangeRatePrevote")]
    Prevote {
        hash: String,
        denom: String,
        feeder: String,
        validator: String,
    },
    #[serde(rename = "oracle/MsgExchangeRateVote")]
    Vote {
        exchange_rate: String,
        salt: String,
        denom: String,
        feeder: String,
        validator: String,
    },
}

impl OracleMsg {
    pub fn denom(&self) -> &str {
        match self {
            OracleMsg::Prevote { denom, .. } | OracleMsg::Vote { denom, .. } => denom,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Coin {
    pub amount: String,
    pub denom: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Fee {
    pub amount: Vec<Coin>,
    pub gas: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PubKey {
    #[serde(rename = "type")]
    pub type_url: String,
    /// Compressed secp256k1 key, base64.
    pub value: String,
}

impl PubKey {
    pub fn secp256k1(value_base64: String) -> Self {
        PubKey {
            type_url: "tendermint/PubKeySecp256k1".to_owned(),
            value: value_base64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StdSignature {
    pub pub_key: PubKey,
    /// 64-byte r||s signature, base64.
    pub signature: String,
}

/// The amino-JSON transaction body POSTed to the LCD.
#[derive(Debug, Clone, Serialize)]
pub struct StdTx {
    pub msg: Vec<OracleMsg>,
    pub fee: Fee,
    pub signatures: Vec<StdSignature>,
    pub memo: String,
}

/// The document whose canonical encoding is signed.
#[derive(Debug, Serialize)]
pub struct SignDoc<'a> {
    pub account_number: String,
    pub chain_id: &'a str,
    pub fee: &'a Fee,
    pub memo: &'a str,
    pub msgs: &'a [OracleMsg],
    pub sequence: String,
}

/// Canonical bytes to sign: UTF-8 JSON with lexicographically sorted keys at
/// every level. Routing the document through `serde_json::Value` sorts keys,
/// since `serde_json`'s map is ordered by key.
pub fn sign_bytes(doc: &SignDoc<'_>) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(doc)?;
    serde_json::to_vec(&value)
}

#[cfg(test)]
mod tests {
    use super::{
        fresh_salt, sign_bytes, vote_hash, Coin, Fee, OracleMsg, SignDoc, SALT_BYTES,
        VOTE_HASH_BYTES,
    };

    const VALIDATOR: &str = "terravaloper1xx3fx8wkjkew2t2mv2hy9kq3gqdxsws2940wra";

    #[test]
    fn salt_is_hex_of_expected_length() {
        let salt = fresh_salt();
        assert_eq!(salt.len(), SALT_BYTES * 2);
        assert!(salt.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn salts_are_not_reused() {
        assert_ne!(fresh_salt(), fresh_salt());
    }

    #[test]
    fn vote_hash_known_vectors() {
        assert_eq!(
            vote_hash("0df36c1c9394fa1c", "2273.225", "ukrw", VALIDATOR),
            "04b56d3450c626ba815c7d7144f02d9a4be91227"
        );
        assert_eq!(
            vote_hash("af8429e2299aab0e", "8.85", "usdr", VALIDATOR),
            "1cd883b9ac603b3a0ead5b8e33189fe3ce068f7c"
        );
    }

    #[test]
    fn vote_hash_binds_every_field() {
        let base = vote_hash("aa", "1.5", "ukrw", VALIDATOR);
        assert_ne!(base, vote_hash("ab", "1.5", "ukrw", VALIDATOR));
        assert_ne!(base, vote_hash("aa", "1.6", "ukrw", VALIDATOR));
        assert_ne!(base, vote_hash("aa", "1.5", "uusd", VALIDATOR));
        assert_ne!(base, vote_hash("aa", "1.5", "ukrw", "terravaloper1other"));
        assert_eq!(base.len(), VOTE_HASH_BYTES * 2);
    }

    #[test]
    fn sign_bytes_sorts_keys() {
        let fee = Fee {
            amount: vec![Coin {
                amount: "758".to_owned(),
                denom: "uluna".to_owned(),
            }],
            gas: "50500".to_owned(),
        };
        let msgs = vec![OracleMsg::Vote {
            exchange_rate: "2273.225".to_owned(),
            salt: "0df36c1c9394fa1c".to_owned(),
            denom: "ukrw".to_owned(),
            feeder: "terra1feeder".to_owned(),
            validator: VALIDATOR.to_owned(),
        }];
        let doc = SignDoc {
            account_number: "11".to_owned(),
            chain_id: "columbus-3",
            fee: &fee,
            memo: "",
            msgs: &msgs,
            sequence: "7".to_owned(),
        };

        let encoded = String::from_utf8(sign_bytes(&doc).unwrap()).unwrap();
        // Top-level keys in lexicographic order.
        let order = [
            "\"account_number\"",
            "\"chain_id\"",
            "\"fee\"",
            "\"memo\"",
            "\"msgs\"",
            "\"sequence\"",
        ];
        let positions: Vec<_> = order.iter().map(|k| encoded.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{encoded}");
        // Message payload keys sorted too.
        let denom = encoded.find("\"denom\"").unwrap();
        let rate = encoded.find("\"exchange_rate\"").unwrap();
        let salt = encoded.find("\"salt\"").unwrap();
        assert!(denom < rate && rate < salt, "{encoded}");
        // No whitespace in the canonical form.
        assert!(!encoded.contains(' '));
    }

    #[test]
    fn prevote_serializes_with_type_url() {
        let msg = OracleMsg::Prevote {
            hash: "abc".to_owned(),
            denom: "ukrw".to_owned(),
            feeder: "terra1feeder".to_owned(),
            validator: VALIDATOR.to_owned(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "oracle/MsgExchangeRatePrevote");
        assert_eq!(json["value"]["denom"], "ukrw");
    }
}
