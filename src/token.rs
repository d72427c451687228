//! Code exchange and ID token validation.
//!
//! The identity provider returns the ID token as a JWE addressed to one of our
//! encryption keys. Inside is a JWS that must verify against the keys the
//! trust anchor vouches for, and only then are its claims looked at.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use url::Url;

use crate::error::Error;
use crate::federation::TrustResolver;
use crate::http::{self, HttpClient, HttpRequest, HttpResponse};
use crate::jwe::{CompactJwe, JweError};
use crate::jwk::DecryptionKeys;
use crate::jws::{CompactJws, SignedStatement};
use crate::statement::EntityStatement;
use crate::types::entity_id;

/// `cty` of a JWE whose plaintext is `{"njwt": "<jws>"}`.
const CTY_NESTED_JWT: &str = "NJWT";

/// Successful token endpoint response.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    pub id_token: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// OAuth error body (`{"error": ..., "error_description": ...}`).
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// `aud` is either one string or an array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    #[must_use]
    pub fn contains(&self, client_id: &str) -> bool {
        match self {
            Self::One(aud) => aud == client_id,
            Self::Many(auds) => auds.iter().any(|a| a == client_id),
        }
    }
}

/// Claims of a validated ID token.
///
/// Only obtainable through the exchange, i.e. after decryption, signature
/// verification and the claim checks have all passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct IdTokenClaims {
    pub sub: String,
    pub iss: String,
    pub aud: Audience,
    #[serde(rename = "iat", with = "time::serde::timestamp")]
    pub issued_at: OffsetDateTime,
    #[serde(rename = "exp", with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Health insurance number (KVNR).
    #[serde(
        rename = "urn:telematik:claims:id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub telematik_id: Option<String>,
    #[serde(
        rename = "urn:telematik:claims:email",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub email: Option<String>,
    #[serde(
        rename = "urn:telematik:claims:given_name",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub given_name: Option<String>,
    /// Insurer's institution code (IK number).
    #[serde(
        rename = "urn:telematik:claims:organization",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub organization: Option<String>,
    #[serde(flatten)]
    pub additional: HashMap<String, serde_json::Value>,
}

impl IdTokenClaims {
    /// Claims with only the registered members set. For issuers and fixtures.
    #[must_use]
    pub fn new(
        iss: impl Into<String>,
        sub: impl Into<String>,
        aud: impl Into<String>,
        issued_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Self {
        Self {
            sub: sub.into(),
            iss: iss.into(),
            aud: Audience::One(aud.into()),
            issued_at,
            expires_at,
            nonce: None,
            telematik_id: None,
            email: None,
            given_name: None,
            organization: None,
            additional: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    #[must_use]
    pub fn with_telematik_id(mut self, kvnr: impl Into<String>) -> Self {
        self.telematik_id = Some(kvnr.into());
        self
    }
}

/// A verified ID token together with its signed form.
#[derive(Debug, Clone)]
pub struct IdToken {
    statement: SignedStatement<IdTokenClaims>,
}

impl IdToken {
    #[must_use]
    pub fn claims(&self) -> &IdTokenClaims {
        self.statement.body()
    }

    #[must_use]
    pub fn into_claims(self) -> IdTokenClaims {
        self.statement.into_body()
    }

    /// The inner compact JWS as signed by the identity provider.
    #[must_use]
    pub fn raw(&self) -> &str {
        self.statement.raw()
    }
}

/// What the ID token must say to be accepted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Expected<'a> {
    pub issuer: &'a str,
    pub client_id: &'a str,
    pub nonce: Option<&'a str>,
    pub now: OffsetDateTime,
}

impl Expected<'_> {
    fn check(&self, claims: &IdTokenClaims) -> Result<(), Error> {
        if entity_id(&claims.iss) != entity_id(self.issuer) {
            return Err(Error::IdTokenClaims(format!(
                "iss {} does not match {}",
                claims.iss, self.issuer
            )));
        }
        if !claims.aud.contains(self.client_id) {
            return Err(Error::IdTokenClaims(format!(
                "aud does not contain {}",
                self.client_id
            )));
        }
        if self.now >= claims.expires_at {
            return Err(Error::IdTokenClaims(format!(
                "expired at {}",
                claims.expires_at
            )));
        }
        if self.nonce.is_some() && claims.nonce.as_deref() != self.nonce {
            return Err(Error::IdTokenClaims("nonce mismatch".into()));
        }
        Ok(())
    }
}

/// Code-for-token exchange against one identity provider.
pub(crate) struct TokenExchange<'a, H, K> {
    pub resolver: &'a TrustResolver<H>,
    pub keys: &'a K,
    pub client_id: &'a str,
    pub redirect_uri: &'a Url,
}

impl<H: HttpClient, K: DecryptionKeys> TokenExchange<'_, H, K> {
    /// Runs every step in order and stops at the first failure.
    #[instrument(skip_all, fields(issuer = %idp.iss))]
    pub async fn run(
        &self,
        idp: &EntityStatement,
        code: &str,
        verifier: &str,
        nonce: Option<&str>,
    ) -> Result<IdToken, Error> {
        let provider = idp.metadata.openid_provider.as_ref().ok_or_else(|| {
            Error::MalformedStatement(format!("{} publishes no openid_provider metadata", idp.iss))
        })?;

        let response = self
            .request_token(&provider.token_endpoint, code, verifier)
            .await?;
        let inner = self.decrypt(&response.id_token)?;

        let signing_keys = self.resolver.resolve_signing_keys(idp).await?;
        let jws = CompactJws::parse(&inner)
            .map_err(|e| JweError::Malformed(format!("decrypted payload: {e}")))?;
        match jws.verify(&signing_keys) {
            Ok(true) => {}
            Ok(false) => {
                warn!(kid = ?jws.kid(), "ID token signature does not verify");
                return Err(Error::BadIdTokenSignature {
                    issuer: idp.iss.clone(),
                    reason: "signature does not verify against the issuer's vouched keys".into(),
                });
            }
            Err(Error::UnsupportedAlgorithm(alg)) => {
                warn!(alg = %alg, "ID token signed with unsupported algorithm");
                return Err(Error::BadIdTokenSignature {
                    issuer: idp.iss.clone(),
                    reason: format!("unsupported algorithm {alg}"),
                });
            }
            Err(e) => return Err(e),
        }

        let statement = jws.into_statement::<IdTokenClaims>()?;
        Expected {
            issuer: &idp.iss,
            client_id: self.client_id,
            nonce,
            now: self.resolver.clock().now(),
        }
        .check(statement.body())?;

        info!(sub = %statement.body().sub, "ID token accepted");
        Ok(IdToken { statement })
    }

    async fn request_token(
        &self,
        token_endpoint: &Url,
        code: &str,
        verifier: &str,
    ) -> Result<TokenResponse, Error> {
        let request = HttpRequest::post_form(
            token_endpoint.clone(),
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("client_id", self.client_id),
                ("code_verifier", verifier),
            ],
        )
        .with_header("accept", "application/json");

        let response = http::execute(
            self.resolver.http(),
            request,
            self.resolver.timeout(),
            "token exchange",
        )
        .await?;
        if !response.is_success() {
            return Err(token_endpoint_error(&response));
        }
        serde_json::from_slice(&response.body)
            .map_err(|e| Error::MalformedStatement(format!("token response: {e}")))
    }

    /// Returns the compact JWS inside the encrypted ID token.
    fn decrypt(&self, id_token: &str) -> Result<String, Error> {
        let jwe = CompactJwe::parse(id_token)?;
        let kid = jwe
            .kid()
            .ok_or_else(|| JweError::Malformed("JWE header has no kid".into()))?;
        let Some(key) = self.keys.find(kid) else {
            warn!(kid, "ID token encrypted to an unknown key");
            return Err(Error::MissingDecryptionKey(kid.to_owned()));
        };

        let plaintext = jwe.decrypt(&key)?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| JweError::Malformed("plaintext is not UTF-8".into()))?;

        let nested = jwe
            .header()
            .cty
            .as_deref()
            .is_some_and(|cty| cty.eq_ignore_ascii_case(CTY_NESTED_JWT));
        if !nested {
            return Ok(plaintext.trim().to_owned());
        }

        #[derive(Deserialize)]
        struct Nested {
            njwt: String,
        }
        let nested: Nested = serde_json::from_str(&plaintext)
            .map_err(|e| JweError::Malformed(format!("NJWT payload: {e}")))?;
        Ok(nested.njwt)
    }
}

fn token_endpoint_error(response: &HttpResponse) -> Error {
    let detail = match serde_json::from_slice::<ErrorResponse>(&response.body) {
        Ok(ErrorResponse {
            error,
            error_description: Some(description),
        }) => format!("{error}: {description}"),
        Ok(ErrorResponse { error, .. }) => error,
        Err(_) => response.text(),
    };
    warn!(status = response.status, detail = %detail, "Token endpoint rejected the code");
    Error::TokenEndpoint {
        status: response.status,
        detail,
    }
}
