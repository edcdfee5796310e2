//! Encrypted keystore: an Argon2id-derived key seals the mnemonic with
//! ChaCha20-Poly1305. The file holds only public KDF parameters, the salt,
//! the nonce, and the ciphertext.

use std::{fs, path::Path};

use anyhow::{anyhow, bail, Context, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const KDF_SALT_BYTES: usize = 16;
const NONCE_BYTES: usize = 12;
const KEY_BYTES: usize = 32;

/// Argon2id work factors stored in (and read back from) the keystore file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // 64 MiB, 3 passes, single lane.
        KdfParams {
            m_cost: 65_536,
            t_cost: 3,
            p_cost: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeystoreFile {
    version: u32,
    kdf: KdfParams,
    salt: String,
    nonce: String,
    ciphertext: String,
}

fn derive_key(passphrase: &str, salt: &[u8], kdf: &KdfParams) -> Result<Zeroizing<[u8; KEY_BYTES]>> {
    let params = Params::new(kdf.m_cost, kdf.t_cost, kdf.p_cost, Some(KEY_BYTES))
        .map_err(|e| anyhow!("bad KDF parameters: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_BYTES]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut *key)
        .map_err(|e| anyhow!("key derivation failed: {e}"))?;
    Ok(key)
}

/// Encrypts `mnemonic` under `passphrase` and writes the keystore to `path`,
/// replacing any existing file atomically.
pub fn write(path: &Path, passphrase: &str, mnemonic: &str) -> Result<()> {
    write_with_params(path, passphrase, mnemonic, KdfParams::default())
}

pub fn write_with_params(
    path: &Path,
    passphrase: &str,
    mnemonic: &str,
    kdf: KdfParams,
) -> Result<()> {
    let mut salt = [0u8; KDF_SALT_BYTES];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut salt);
    let mut nonce = [0u8; NONCE_BYTES];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce);

    let key = derive_key(passphrase, &salt, &kdf)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&*key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), mnemonic.as_bytes())
        .map_err(|_| anyhow!("encryption failed"))?;

    let file = KeystoreFile {
        version: 1,
        kdf,
        salt: hex::encode(salt),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
    };

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(&file)?)
        .with_context(|| format!("writing {}", tmp.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Decrypts the keystore at `path` and returns the mnemonic.
pub fn read(path: &Path, passphrase: &str) -> Result<Zeroizing<String>> {
    let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let file: KeystoreFile =
        serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))?;
    if file.version != 1 {
        bail!("unsupported keystore version {}", file.version);
    }

    let salt = hex::decode(&file.salt).context("keystore salt is not hex")?;
    let nonce = hex::decode(&file.nonce).context("keystore nonce is not hex")?;
    let ciphertext = hex::decode(&file.ciphertext).context("keystore ciphertext is not hex")?;
    if nonce.len() != NONCE_BYTES {
        bail!("keystore nonce has wrong length");
    }

    let key = derive_key(passphrase, &salt, &file.kdf)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&*key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| anyhow!("wrong passphrase or corrupted keystore"))?;

    String::from_utf8(plaintext)
        .map(Zeroizing::new)
        .map_err(|_| anyhow!("keystore plaintext is not UTF-8"))
}
