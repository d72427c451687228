//! Compact JWS: parsing, ES256 signing and signed-statement verification.
//!
//! Only `ES256` is accepted. A statement carrying any other `alg` fails
//! verification with [`Error::UnsupportedAlgorithm`]; a merely invalid
//! signature, an unknown `kid`, a key published for encryption or an empty
//! key set yields `Ok(false)`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdsa::Signature;
use p256::ecdsa::signature::{Signer, Verifier};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::jwk::{EcKeyPair, KeySet};

/// The one signature algorithm the federation mandates.
pub const ES256: &str = "ES256";

pub const TYP_ENTITY_STATEMENT: &str = "entity-statement+jwt";
pub const TYP_IDP_LIST: &str = "idp-list+jwt";
pub const TYP_JWT: &str = "JWT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

/// Compact JWS whose signature has not been checked.
#[derive(Debug, Clone)]
pub struct CompactJws {
    raw: String,
    header: JwsHeader,
    payload: Vec<u8>,
    signature: Vec<u8>,
    signing_input_len: usize,
}

impl CompactJws {
    /// Split and decode `header.payload.signature`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedStatement`] if the serialization is not three
    /// base64url segments or the header is not a JSON object with `alg`.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let mut parts = raw.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::MalformedStatement(
                "compact JWS must have three segments".into(),
            ));
        };

        let header_json = decode_segment(header_b64, "header")?;
        let header: JwsHeader = serde_json::from_slice(&header_json)
            .map_err(|e| Error::MalformedStatement(format!("JWS header: {e}")))?;
        let payload = decode_segment(payload_b64, "payload")?;
        let signature = decode_segment(signature_b64, "signature")?;

        Ok(Self {
            raw: raw.to_owned(),
            header,
            payload,
            signature,
            signing_input_len: header_b64.len() + 1 + payload_b64.len(),
        })
    }

    #[must_use]
    pub fn header(&self) -> &JwsHeader {
        &self.header
    }

    #[must_use]
    pub fn kid(&self) -> Option<&str> {
        self.header.kid.as_deref()
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Check the signature against `keys`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedAlgorithm`] if the header `alg` is not `ES256`
    /// and `keys` is non-empty.
    pub fn verify(&self, keys: &KeySet) -> Result<bool, Error> {
        if keys.is_empty() {
            return Ok(false);
        }
        if self.header.alg != ES256 {
            return Err(Error::UnsupportedAlgorithm(self.header.alg.clone()));
        }
        let Some(kid) = self.kid() else {
            tracing::debug!("JWS without kid");
            return Ok(false);
        };
        let Some(jwk) = keys.find(kid) else {
            tracing::debug!(kid, "JWS kid not in key set");
            return Ok(false);
        };
        if !jwk.is_signing_key() {
            tracing::warn!(kid, key_use = ?jwk.use_, "JWS kid names a non-signing key");
            return Ok(false);
        }
        let Some(verifying_key) = jwk.verifying_key() else {
            tracing::warn!(kid, kty = %jwk.kty, "Key set entry is not a P-256 key");
            return Ok(false);
        };
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return Ok(false);
        };

        let signing_input = &self.raw.as_bytes()[..self.signing_input_len];
        Ok(verifying_key.verify(signing_input, &signature).is_ok())
    }

    /// Deserialize the payload. Does not check the signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedStatement`] if the payload does not match `T`.
    pub fn into_statement<T: DeserializeOwned>(self) -> Result<SignedStatement<T>, Error> {
        let body = serde_json::from_slice(&self.payload)
            .map_err(|e| Error::MalformedStatement(format!("JWS payload: {e}")))?;
        Ok(SignedStatement { jws: self, body })
    }
}

fn decode_segment(b64: &str, what: &str) -> Result<Vec<u8>, Error> {
    URL_SAFE_NO_PAD
        .decode(b64)
        .map_err(|e| Error::MalformedStatement(format!("JWS {what}: {e}")))
}

/// Compact signature plus its parsed body. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct SignedStatement<T> {
    jws: CompactJws,
    body: T,
}

impl<T: DeserializeOwned> SignedStatement<T> {
    /// Parse a compact JWS and its JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedStatement`] on any structural problem.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        CompactJws::parse(raw)?.into_statement()
    }
}

impl<T> SignedStatement<T> {
    #[must_use]
    pub fn body(&self) -> &T {
        &self.body
    }

    #[must_use]
    pub fn into_body(self) -> T {
        self.body
    }

    #[must_use]
    pub fn header(&self) -> &JwsHeader {
        self.jws.header()
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        self.jws.raw()
    }

    /// See [`CompactJws::verify`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedAlgorithm`] for a non-`ES256` header.
    pub fn verify(&self, keys: &KeySet) -> Result<bool, Error> {
        self.jws.verify(keys)
    }
}

/// Verify `statement` against `keys`.
///
/// # Errors
///
/// - [`Error::InvalidArgument`] if no key set is supplied.
/// - [`Error::UnsupportedAlgorithm`] if the statement is not `ES256`.
pub fn verify<T>(keys: Option<&KeySet>, statement: &SignedStatement<T>) -> Result<bool, Error> {
    let keys = keys.ok_or_else(|| Error::InvalidArgument("key set is required".into()))?;
    statement.verify(keys)
}

/// Sign `body` with ES256 under `key`'s key ID.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `body` cannot be serialized to JSON.
pub fn sign<T: Serialize>(body: &T, key: &EcKeyPair, typ: &str) -> Result<String, Error> {
    let header = JwsHeader {
        alg: ES256.into(),
        kid: Some(key.kid().to_string()),
        typ: Some(typ.into()),
    };
    let header_json =
        serde_json::to_vec(&header).map_err(|e| Error::InvalidArgument(e.to_string()))?;
    let body_json = serde_json::to_vec(body).map_err(|e| Error::InvalidArgument(e.to_string()))?;

    let mut jws = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(body_json)
    );
    let signature: Signature = key.signing_key().sign(jws.as_bytes());
    jws.push('.');
    jws.push_str(&URL_SAFE_NO_PAD.encode(signature.to_bytes()));
    Ok(jws)
}
