//! Hardware-key variant of the signer facade, speaking the Cosmos app's
//! APDU protocol over USB HID. Compiled only with the `ledger` feature; the
//! voting loop never sees anything below the [`Signer`] trait.

use std::sync::Mutex;

use async_trait::async_trait;
use base64::prelude::*;
use ledger_apdu::APDUCommand;
use ledger_transport_hid::{hidapi::HidApi, TransportNativeHID};

use crate::signer::{account_address, SignError, Signer};

const CLA: u8 = 0x55;
const INS_GET_ADDR_SECP256K1: u8 = 0x04;
const INS_SIGN_SECP256K1: u8 = 0x02;

const P1_INIT: u8 = 0;
const P1_ADD: u8 = 1;
const P1_LAST: u8 = 2;

const RET_OK: u16 = 0x9000;
const RET_REJECTED: u16 = 0x6986;

const CHUNK_SIZE: usize = 250;

/// BIP-44 path the Cosmos app expects, hardened where marked.
const PATH: [u32; 5] = [
    44 | 0x8000_0000,
    330 | 0x8000_0000,
    0x8000_0000,
    0,
    0,
];

fn path_bytes() -> Vec<u8> {
    PATH.iter().flat_map(|part| part.to_le_bytes()).collect()
}

pub struct LedgerSigner {
    transport: Mutex<TransportNativeHID>,
    address: String,
    public_key_base64: String,
}

impl LedgerSigner {
    /// Connects to the first Ledger with the Cosmos app open and reads the
    /// feeder key. Any failure here is a startup-fatal device error.
    pub fn connect(hrp: &str) -> Result<Self, SignError> {
        let api = HidApi::new().map_err(|e| SignError::DeviceUnavailable(e.to_string()))?;
        let transport =
            TransportNativeHID::new(&api).map_err(|e| SignError::DeviceUnavailable(e.to_string()))?;

        let mut data = vec![hrp.len() as u8];
        data.extend_from_slice(hrp.as_bytes());
        data.extend_from_slice(&path_bytes());

        let answer = transport
            .exchange(&APDUCommand {
                cla: CLA,
                ins: INS_GET_ADDR_SECP256K1,
                p1: 0,
                p2: 0,
                data,
            })
            .map_err(|e| SignError::DeviceUnavailable(e.to_string()))?;
        if answer.retcode() != RET_OK {
            return Err(SignError::DeviceUnavailable(format!(
                "device returned 0x{:04x} (is the oracle chain app open?)",
                answer.retcode()
            )));
        }

        // 33-byte compressed public key, then the device's own bech32
        // rendering of the address, which we recompute rather than trust.
        let payload = answer.apdu_data();
        if payload.len() < 33 {
            return Err(SignError::DeviceUnavailable(
                "short address response from device".to_owned(),
            ));
        }
        let public_key = &payload[..33];
        let address = account_address(hrp, public_key)?;

        Ok(LedgerSigner {
            transport: Mutex::new(transport),
            address,
            public_key_base64: BASE64_STANDARD.encode(public_key),
        })
    }
}

#[async_trait]
impl Signer for LedgerSigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn public_key_base64(&self) -> &str {
        &self.public_key_base64
    }

    async fn sign(&self, sign_bytes: &[u8]) -> Result<Vec<u8>, SignError> {
        // The HID exchange blocks until the user confirms on-device; the
        // loop owns the device exclusively, so blocking in place is fine.
        let der = tokio::task::block_in_place(|| {
            let transport = self.transport.lock().expect("ledger transport poisoned");

            let mut answer = transport
                .exchange(&APDUCommand {
                    cla: CLA,
                    ins: INS_SIGN_SECP256K1,
                    p1: P1_INIT,
                    p2: 0,
                    data: path_bytes(),
                })
                .map_err(|e| SignError::DeviceUnavailable(e.to_string()))?;

            let chunks: Vec<&[u8]> = sign_bytes.chunks(CHUNK_SIZE).collect();
            for (i, chunk) in chunks.iter().enumerate() {
                let p1 = if i + 1 == chunks.len() { P1_LAST } else { P1_ADD };
                answer = transport
                    .exchange(&APDUCommand {
                        cla: CLA,
                        ins: INS_SIGN_SECP256K1,
                        p1,
                        p2: 0,
                        data: chunk.to_vec(),
                    })
                    .map_err(|e| SignError::DeviceUnavailable(e.to_string()))?;
            }

            match answer.retcode() {
                RET_OK => Ok(answer.apdu_data().to_vec()),
                RET_REJECTED => Err(SignError::Rejected("rejected on device".to_owned())),
                code => Err(SignError::Rejected(format!("device returned 0x{code:04x}"))),
            }
        })?;

        // The device answers in DER; the chain wants compact low-s r||s.
        let signature = k256::ecdsa::Signature::from_der(&der)
            .map_err(|e| SignError::Rejected(format!("undecodable device signature: {e}")))?;
        let signature = signature.normalize_s().unwrap_or(signature);
        Ok(signature.to_bytes().to_vec())
    }
}
