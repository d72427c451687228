//! EC P-256 JSON Web Keys, key sets and the decryption-key capability.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, FieldBytes, PublicKey, SecretKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::KeyId;

pub const KEY_USE_SIG: &str = "sig";
pub const KEY_USE_ENC: &str = "enc";

const COORDINATE_LEN: usize = 32;

/// Public JSON Web Key. Only `EC`/`P-256` keys are usable; anything else is
/// carried through serialization but never matches during verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
}

impl Jwk {
    /// JWK for a P-256 public key. `alg` follows `key_use`: `ES256` for
    /// signing keys, `ECDH-ES` for encryption keys.
    #[must_use]
    pub fn from_public_key(kid: impl Into<String>, key: &PublicKey, key_use: &str) -> Self {
        let alg = if key_use == KEY_USE_ENC {
            crate::jwe::ALG_ECDH_ES
        } else {
            crate::jws::ES256
        };
        Self {
            kid: Some(kid.into()),
            use_: Some(key_use.into()),
            alg: Some(alg.into()),
            ..Self::bare(key)
        }
    }

    /// Only `kty`, `crv`, `x` and `y`, as used for a JWE `epk`.
    pub(crate) fn bare(key: &PublicKey) -> Self {
        let point = key.to_encoded_point(false);
        Self {
            kty: "EC".into(),
            crv: Some("P-256".into()),
            x: point.x().map(|x| URL_SAFE_NO_PAD.encode(x)),
            y: point.y().map(|y| URL_SAFE_NO_PAD.encode(y)),
            kid: None,
            use_: None,
            alg: None,
        }
    }

    /// The P-256 point, or `None` if this is not a well-formed P-256 key.
    #[must_use]
    pub fn public_key(&self) -> Option<PublicKey> {
        if self.kty != "EC" || self.crv.as_deref() != Some("P-256") {
            return None;
        }
        let x = decode_coordinate(self.x.as_deref()?)?;
        let y = decode_coordinate(self.y.as_deref()?)?;
        let point = EncodedPoint::from_affine_coordinates(
            FieldBytes::from_slice(&x),
            FieldBytes::from_slice(&y),
            false,
        );
        Option::from(PublicKey::from_encoded_point(&point))
    }

    #[must_use]
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_affine(*self.public_key()?.as_affine()).ok()
    }

    #[must_use]
    pub fn is_signing_key(&self) -> bool {
        self.use_.as_deref().is_none_or(|u| u == KEY_USE_SIG)
    }
}

fn decode_coordinate(b64: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(b64)
        .ok()
        .filter(|bytes| bytes.len() == COORDINATE_LEN)
}

/// Public key set, serialized as a JWKS document (`{"keys": [...]}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    #[serde(default)]
    pub keys: Vec<Jwk>,
}

impl KeySet {
    #[must_use]
    pub fn new(keys: Vec<Jwk>) -> Self {
        Self { keys }
    }

    /// Find a key by its key ID. A missing key is a normal outcome.
    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

impl FromIterator<Jwk> for KeySet {
    fn from_iter<I: IntoIterator<Item = Jwk>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}

/// Private JWK as stored on disk: the public members plus `d`.
#[derive(Clone, Serialize, Deserialize)]
pub struct PrivateJwk {
    #[serde(flatten)]
    pub public: Jwk,
    pub d: String,
}

impl fmt::Debug for PrivateJwk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateJwk")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// P-256 key pair identified by a key ID.
#[derive(Clone)]
pub struct EcKeyPair {
    kid: KeyId,
    secret: SecretKey,
}

impl EcKeyPair {
    /// Generate a fresh key pair from the OS RNG.
    #[must_use]
    pub fn generate(kid: impl Into<KeyId>) -> Self {
        Self {
            kid: kid.into(),
            secret: SecretKey::random(&mut OsRng),
        }
    }

    #[must_use]
    pub fn from_secret(kid: impl Into<KeyId>, secret: SecretKey) -> Self {
        Self {
            kid: kid.into(),
            secret,
        }
    }

    /// Load from a private JWK.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JWK has no `kid`, is not a P-256 key,
    /// or its `d` does not belong to its public coordinates.
    pub fn from_jwk(jwk: &PrivateJwk) -> Result<Self, Error> {
        let kid = jwk
            .public
            .kid
            .clone()
            .ok_or_else(|| Error::Config("private JWK without kid".into()))?;
        let public = jwk
            .public
            .public_key()
            .ok_or_else(|| Error::Config(format!("JWK {kid} is not a P-256 key")))?;
        let d = URL_SAFE_NO_PAD
            .decode(&jwk.d)
            .map_err(|e| Error::Config(format!("JWK {kid}: invalid d: {e}")))?;
        let secret = SecretKey::from_slice(&d)
            .map_err(|_| Error::Config(format!("JWK {kid}: invalid P-256 scalar")))?;
        if secret.public_key() != public {
            return Err(Error::Config(format!(
                "JWK {kid}: private key does not match x/y"
            )));
        }
        Ok(Self::from_secret(kid, secret))
    }

    #[must_use]
    pub fn kid(&self) -> &KeyId {
        &self.kid
    }

    #[must_use]
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    #[must_use]
    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from(&self.secret)
    }

    #[must_use]
    pub fn public_jwk(&self, key_use: &str) -> Jwk {
        Jwk::from_public_key(self.kid.as_str(), &self.public_key(), key_use)
    }

    #[must_use]
    pub fn to_private_jwk(&self, key_use: &str) -> PrivateJwk {
        PrivateJwk {
            public: self.public_jwk(key_use),
            d: URL_SAFE_NO_PAD.encode(self.secret.to_bytes()),
        }
    }
}

impl fmt::Debug for EcKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcKeyPair")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

/// The relying party's private keys, looked up by key ID.
#[derive(Debug, Clone, Default)]
pub struct PrivateKeySet {
    keys: Vec<EcKeyPair>,
}

impl PrivateKeySet {
    #[must_use]
    pub fn new(keys: Vec<EcKeyPair>) -> Self {
        Self { keys }
    }

    /// Parse a private JWKS document (`{"keys": [{..., "d": ...}]}`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the document or any key in it is invalid.
    pub fn from_jwks_json(json: &str) -> Result<Self, Error> {
        #[derive(Deserialize)]
        struct Document {
            keys: Vec<PrivateJwk>,
        }

        let doc: Document =
            serde_json::from_str(json).map_err(|e| Error::Config(format!("private JWKS: {e}")))?;
        let keys = doc
            .keys
            .iter()
            .map(EcKeyPair::from_jwk)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { keys })
    }

    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&EcKeyPair> {
        self.keys.iter().find(|k| k.kid.as_str() == kid)
    }

    /// Public half of every key, tagged with `key_use`.
    #[must_use]
    pub fn public_key_set(&self, key_use: &str) -> KeySet {
        self.keys.iter().map(|k| k.public_jwk(key_use)).collect()
    }
}

/// Decryption-key lookup capability: `kid -> private key | not found`.
///
/// Implemented for [`PrivateKeySet`] and for any `Fn(&str) -> Option<SecretKey>`.
pub trait DecryptionKeys: Send + Sync + 'static {
    fn find(&self, kid: &str) -> Option<SecretKey>;
}

impl DecryptionKeys for PrivateKeySet {
    fn find(&self, kid: &str) -> Option<SecretKey> {
        self.get(kid).map(|k| k.secret.clone())
    }
}

impl<F> DecryptionKeys for F
where
    F: Fn(&str) -> Option<SecretKey> + Send + Sync + 'static,
{
    fn find(&self, kid: &str) -> Option<SecretKey> {
        self(kid)
    }
}
