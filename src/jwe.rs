//! Compact JWE with `ECDH-ES` direct key agreement and `A256GCM` content
//! encryption, the only combination sectoral identity providers use for
//! ID tokens.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdh::EphemeralSecret;
use p256::{PublicKey, SecretKey};
use rand::Rng;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::jwk::Jwk;

pub const ALG_ECDH_ES: &str = "ECDH-ES";
pub const ENC_A256GCM: &str = "A256GCM";

const CEK_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum JweError {
    #[error("malformed JWE: {0}")]
    Malformed(String),

    #[error("unsupported JWE algorithm {alg}/{enc}")]
    UnsupportedAlgorithm { alg: String, enc: String },

    #[error("invalid EC public key")]
    InvalidKey,

    #[error("decryption failed")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JweHeader {
    pub alg: String,
    pub enc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epk: Option<Jwk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cty: Option<String>,
}

/// Parsed compact JWE (`header.encrypted_key.iv.ciphertext.tag`).
#[derive(Debug, Clone)]
pub struct CompactJwe {
    header_b64: String,
    header: JweHeader,
    encrypted_key: Vec<u8>,
    iv: Vec<u8>,
    ciphertext: Vec<u8>,
    tag: Vec<u8>,
}

impl CompactJwe {
    /// # Errors
    ///
    /// Returns [`JweError::Malformed`] unless `raw` has five base64url
    /// segments and a JSON header with `alg` and `enc`.
    pub fn parse(raw: &str) -> Result<Self, JweError> {
        let parts: Vec<&str> = raw.split('.').collect();
        let [header_b64, encrypted_key, iv, ciphertext, tag] = parts.as_slice() else {
            return Err(JweError::Malformed(format!(
                "expected 5 segments, got {}",
                parts.len()
            )));
        };

        let header: JweHeader = serde_json::from_slice(&decode(header_b64, "header")?)
            .map_err(|e| JweError::Malformed(format!("header: {e}")))?;

        Ok(Self {
            header_b64: (*header_b64).to_owned(),
            header,
            encrypted_key: decode(encrypted_key, "encrypted key")?,
            iv: decode(iv, "iv")?,
            ciphertext: decode(ciphertext, "ciphertext")?,
            tag: decode(tag, "tag")?,
        })
    }

    #[must_use]
    pub fn header(&self) -> &JweHeader {
        &self.header
    }

    /// Key ID of the recipient key the issuer encrypted to.
    #[must_use]
    pub fn kid(&self) -> Option<&str> {
        self.header.kid.as_deref()
    }

    /// Decrypt with the recipient's private key. Never returns partial plaintext.
    ///
    /// # Errors
    ///
    /// - [`JweError::UnsupportedAlgorithm`] for anything but `ECDH-ES`/`A256GCM`.
    /// - [`JweError::Malformed`] / [`JweError::InvalidKey`] for structural problems.
    /// - [`JweError::Decrypt`] if authentication fails (wrong key, tampering).
    pub fn decrypt(&self, key: &SecretKey) -> Result<Vec<u8>, JweError> {
        if self.header.alg != ALG_ECDH_ES || self.header.enc != ENC_A256GCM {
            return Err(JweError::UnsupportedAlgorithm {
                alg: self.header.alg.clone(),
                enc: self.header.enc.clone(),
            });
        }
        if !self.encrypted_key.is_empty() {
            return Err(JweError::Malformed(
                "direct key agreement requires an empty encrypted key".into(),
            ));
        }
        if self.iv.len() != IV_LEN || self.tag.len() != TAG_LEN {
            return Err(JweError::Malformed("bad iv or tag length".into()));
        }

        let epk = self
            .header
            .epk
            .as_ref()
            .ok_or_else(|| JweError::Malformed("missing epk".into()))?
            .public_key()
            .ok_or(JweError::InvalidKey)?;
        let apu = optional_param(self.header.apu.as_deref(), "apu")?;
        let apv = optional_param(self.header.apv.as_deref(), "apv")?;

        let shared = p256::ecdh::diffie_hellman(key.to_nonzero_scalar(), epk.as_affine());
        let cek = concat_kdf(
            shared.raw_secret_bytes(),
            &self.header.enc,
            &apu,
            &apv,
            CEK_LEN,
        );

        let cipher = Aes256Gcm::new_from_slice(&cek).map_err(|_| JweError::Decrypt)?;
        let mut sealed = Vec::with_capacity(self.ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&self.ciphertext);
        sealed.extend_from_slice(&self.tag);

        cipher
            .decrypt(
                Nonce::from_slice(&self.iv),
                Payload {
                    msg: &sealed,
                    aad: self.header_b64.as_bytes(),
                },
            )
            .map_err(|_| JweError::Decrypt)
    }
}

/// Encrypt `plaintext` to `recipient` (its `kid` goes into the header).
///
/// # Errors
///
/// Returns [`JweError::InvalidKey`] if `recipient` is not a P-256 key.
pub fn encrypt(plaintext: &[u8], recipient: &Jwk, cty: Option<&str>) -> Result<String, JweError> {
    let recipient_key: PublicKey = recipient.public_key().ok_or(JweError::InvalidKey)?;
    let ephemeral = EphemeralSecret::random(&mut OsRng);

    let header = JweHeader {
        alg: ALG_ECDH_ES.into(),
        enc: ENC_A256GCM.into(),
        kid: recipient.kid.clone(),
        epk: Some(Jwk::bare(&ephemeral.public_key())),
        apu: None,
        apv: None,
        cty: cty.map(str::to_owned),
    };
    let header_json = serde_json::to_vec(&header).map_err(|_| JweError::Encrypt)?;
    let header_b64 = URL_SAFE_NO_PAD.encode(header_json);

    let shared = ephemeral.diffie_hellman(&recipient_key);
    let cek = concat_kdf(shared.raw_secret_bytes(), ENC_A256GCM, &[], &[], CEK_LEN);
    let cipher = Aes256Gcm::new_from_slice(&cek).map_err(|_| JweError::Encrypt)?;

    let iv: [u8; IV_LEN] = rand::rng().random();
    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: header_b64.as_bytes(),
            },
        )
        .map_err(|_| JweError::Encrypt)?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(format!(
        "{header_b64}..{}.{}.{}",
        URL_SAFE_NO_PAD.encode(iv),
        URL_SAFE_NO_PAD.encode(&sealed),
        URL_SAFE_NO_PAD.encode(tag)
    ))
}

fn decode(b64: &str, what: &str) -> Result<Vec<u8>, JweError> {
    URL_SAFE_NO_PAD
        .decode(b64)
        .map_err(|e| JweError::Malformed(format!("{what}: {e}")))
}

fn optional_param(b64: Option<&str>, what: &str) -> Result<Vec<u8>, JweError> {
    b64.map_or_else(|| Ok(Vec::new()), |v| decode(v, what))
}

/// Concat KDF (NIST SP 800-56A) with SHA-256, as profiled by RFC 7518 §4.6
/// for direct key agreement: `AlgorithmID` is the `enc` value.
fn concat_kdf(z: &[u8], algorithm: &str, apu: &[u8], apv: &[u8], key_len: usize) -> Vec<u8> {
    let key_bits = u32::try_from(key_len * 8).unwrap_or(u32::MAX);
    let mut derived = Vec::with_capacity(key_len);
    let mut counter: u32 = 1;
    while derived.len() < key_len {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(z);
        for field in [algorithm.as_bytes(), apu, apv] {
            hasher.update(u32::try_from(field.len()).unwrap_or(u32::MAX).to_be_bytes());
            hasher.update(field);
        }
        hasher.update(key_bits.to_be_bytes());
        derived.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    derived.truncate(key_len);
    derived
}
