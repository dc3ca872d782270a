//! # strata-crypto
//!
//! Passphrase encryption of remote files.
//!
//! Each envelope is self-describing:
//!
//! ```text
//! "STRC" | version u8 | m_cost u32 | t_cost u32 | p_cost u32 | salt [16] | nonce [12] | ciphertext+tag
//! ```
//!
//! The key is derived with Argon2id from the passphrase and the envelope's
//! salt, then the payload is sealed with ChaCha20-Poly1305. Everything up to
//! and including the salt is bound as associated data, so a swapped KDF
//! parameter fails authentication just like a wrong passphrase does.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use dashmap::DashMap;
use rand::RngCore;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

pub const ENVELOPE_MAGIC: &[u8; 4] = b"STRC";
pub const ENVELOPE_VERSION: u8 = 1;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 4 + 1 + 4 + 4 + 4 + SALT_LEN;

/// Bounds on the KDF cost accepted from an envelope header. Anything
/// outside them is treated as tampering.
const MAX_MEMORY_KIB: u32 = 1024 * 1024;
const MAX_TIME_COST: u32 = 16;
const MAX_PARALLELISM: u32 = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Authentication failed: wrong passphrase or tampered data")]
    AuthenticationFailure,

    #[error("Passphrase must not be empty")]
    EmptyPassphrase,

    #[error("Not an encrypted envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encrypt(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// Cheap parameters for tests and low-power machines.
    pub const fn light() -> Self {
        Self {
            memory_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// True when Argon2 accepts these costs and they stay within the
    /// bounds a reader is willing to pay.
    pub fn is_within_bounds(&self) -> bool {
        (1..=MAX_TIME_COST).contains(&self.time_cost)
            && (1..=MAX_PARALLELISM).contains(&self.parallelism)
            && self.memory_kib >= 8 * self.parallelism
            && self.memory_kib <= MAX_MEMORY_KIB
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

/// Encrypts and decrypts with one passphrase.
///
/// All envelopes written by one cipher share a random salt, so the KDF runs
/// once per instance for writing. Keys for foreign salts are derived on
/// demand and cached.
pub struct PassphraseCipher {
    passphrase: Zeroizing<String>,
    params: KdfParams,
    salt: [u8; SALT_LEN],
    keys: DashMap<([u8; SALT_LEN], KdfParams), Zeroizing<[u8; 32]>>,
}

impl std::fmt::Debug for PassphraseCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseCipher")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl PassphraseCipher {
    pub fn new(passphrase: &str) -> Result<Self> {
        Self::with_params(passphrase, KdfParams::default())
    }

    pub fn with_params(passphrase: &str, params: KdfParams) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(CryptoError::EmptyPassphrase);
        }
        if !params.is_within_bounds() {
            return Err(CryptoError::KeyDerivation(format!(
                "unsupported argon2 parameters {params:?}"
            )));
        }
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Ok(Self {
            passphrase: Zeroizing::new(passphrase.to_string()),
            params,
            salt,
            keys: DashMap::new(),
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let header = encode_header(&self.params, &self.salt);
        let key = self.key_for(&self.salt, &self.params)?;
        let cipher = ChaCha20Poly1305::new_from_slice(key.as_ref())
            .map_err(|e| CryptoError::Encrypt(format!("cipher init: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|e| CryptoError::Encrypt(format!("ChaCha20-Poly1305 encrypt: {e}")))?;

        let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let (params, salt) = decode_header(data)?;
        if data.len() < HEADER_LEN + NONCE_LEN + TAG_LEN || !params.is_within_bounds() {
            return Err(CryptoError::AuthenticationFailure);
        }
        let (header, rest) = data.split_at(HEADER_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let key = self
            .key_for(&salt, &params)
            .map_err(|_| CryptoError::AuthenticationFailure)?;
        let cipher = ChaCha20Poly1305::new_from_slice(key.as_ref())
            .map_err(|_| CryptoError::AuthenticationFailure)?;
        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailure)
    }

    fn key_for(&self, salt: &[u8; SALT_LEN], params: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
        if let Some(key) = self.keys.get(&(*salt, *params)) {
            return Ok(key.clone());
        }
        debug!(memory_kib = params.memory_kib, "deriving envelope key");
        let key = derive_key(&self.passphrase, salt, params)?;
        self.keys.insert((*salt, *params), key.clone());
        Ok(key)
    }
}

/// True when `data` starts with the envelope magic.
pub fn is_envelope(data: &[u8]) -> bool {
    data.len() >= ENVELOPE_MAGIC.len() && &data[..ENVELOPE_MAGIC.len()] == ENVELOPE_MAGIC
}

fn encode_header(params: &KdfParams, salt: &[u8; SALT_LEN]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(ENVELOPE_MAGIC);
    header[4] = ENVELOPE_VERSION;
    header[5..9].copy_from_slice(&params.memory_kib.to_le_bytes());
    header[9..13].copy_from_slice(&params.time_cost.to_le_bytes());
    header[13..17].copy_from_slice(&params.parallelism.to_le_bytes());
    header[17..].copy_from_slice(salt);
    header
}

fn decode_header(data: &[u8]) -> Result<(KdfParams, [u8; SALT_LEN])> {
    if !is_envelope(data) {
        return Err(CryptoError::InvalidEnvelope("bad magic".into()));
    }
    if data.len() < HEADER_LEN {
        return Err(CryptoError::InvalidEnvelope("truncated header".into()));
    }
    if data[4] != ENVELOPE_VERSION {
        return Err(CryptoError::InvalidEnvelope(format!(
            "unsupported version {}",
            data[4]
        )));
    }
    let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
    let params = KdfParams {
        memory_kib: word(5),
        time_cost: word(9),
        parallelism: word(13),
    };
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&data[17..HEADER_LEN]);
    Ok((params, salt))
}

fn derive_key(passphrase: &str, salt: &[u8], params: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let argon_params = argon2::Params::new(
        params.memory_kib,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| CryptoError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon2 = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon_params,
    );

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, output.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(format!("argon2 hash: {e}")))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(pass: &str) -> PassphraseCipher {
        PassphraseCipher::with_params(pass, KdfParams::light()).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let c = cipher("correct horse");
        for data in [&b""[..], b"x", &[7u8; 10_000][..]] {
            let sealed = c.encrypt(data).unwrap();
            assert!(is_envelope(&sealed));
            assert_eq!(c.decrypt(&sealed).unwrap(), data);
        }
    }

    #[test]
    fn test_other_instance_same_passphrase_decrypts() {
        let sealed = cipher("shared").encrypt(b"volume bytes").unwrap();
        assert_eq!(cipher("shared").decrypt(&sealed).unwrap(), b"volume bytes");
    }

    #[test]
    fn test_wrong_passphrase() {
        let sealed = cipher("right").encrypt(b"secret").unwrap();
        assert!(matches!(
            cipher("wrong").decrypt(&sealed),
            Err(CryptoError::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_tampered_ciphertext() {
        let c = cipher("pass");
        let mut sealed = c.encrypt(b"do not touch").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            c.decrypt(&sealed),
            Err(CryptoError::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_tampered_salt_fails_authentication() {
        let c = cipher("pass");
        let mut sealed = c.encrypt(b"payload").unwrap();
        sealed[20] ^= 0xff;
        assert!(matches!(
            c.decrypt(&sealed),
            Err(CryptoError::AuthenticationFailure)
        ));
    }

    fn with_param_word(sealed: &[u8], at: usize, value: u32) -> Vec<u8> {
        let mut out = sealed.to_vec();
        out[at..at + 4].copy_from_slice(&value.to_le_bytes());
        out
    }

    #[test]
    fn test_out_of_range_kdf_params_fail_authentication() {
        let c = cipher("pass");
        let sealed = c.encrypt(b"payload").unwrap();
        let cases = [
            (5, 0),
            (5, 4),
            (5, u32::MAX),
            (9, 0),
            (9, 3000),
            (9, u32::MAX),
            (13, 0),
            (13, 1000),
            (13, u32::MAX),
        ];
        for (at, value) in cases {
            let tampered = with_param_word(&sealed, at, value);
            assert!(
                matches!(c.decrypt(&tampered), Err(CryptoError::AuthenticationFailure)),
                "offset {at} value {value}"
            );
        }
    }

    #[test]
    fn test_in_range_kdf_param_swap_fails_authentication() {
        let c = cipher("pass");
        let sealed = c.encrypt(b"payload").unwrap();
        let tampered = with_param_word(&sealed, 9, 2);
        assert!(matches!(
            c.decrypt(&tampered),
            Err(CryptoError::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_cipher_rejects_unbounded_params() {
        let params = KdfParams {
            memory_kib: 1024,
            time_cost: 100,
            parallelism: 1,
        };
        assert!(matches!(
            PassphraseCipher::with_params("pass", params),
            Err(CryptoError::KeyDerivation(_))
        ));
        assert!(KdfParams::default().is_within_bounds());
        assert!(KdfParams::light().is_within_bounds());
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(matches!(
            PassphraseCipher::new(""),
            Err(CryptoError::EmptyPassphrase)
        ));
    }

    #[test]
    fn test_plain_data_is_not_an_envelope() {
        let c = cipher("pass");
        assert!(matches!(
            c.decrypt(b"STRATAVL plain volume"),
            Err(CryptoError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_nonces_differ() {
        let c = cipher("pass");
        assert_ne!(c.encrypt(b"same").unwrap(), c.encrypt(b"same").unwrap());
    }
}
