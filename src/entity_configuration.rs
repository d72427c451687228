//! The relying party's own entity configuration, served at
//! `{issuer}/.well-known/openid-federation`.

use tracing::debug;

use crate::clock::Clock;
use crate::config::RelyingPartyConfig;
use crate::error::Error;
use crate::jwe::{ALG_ECDH_ES, ENC_A256GCM};
use crate::jwk::{EcKeyPair, KEY_USE_ENC, KEY_USE_SIG, KeySet, PrivateKeySet};
use crate::jws::{self, TYP_ENTITY_STATEMENT};
use crate::statement::{EntityStatement, Metadata, OpenIdRelyingParty};
use crate::types::entity_id;

/// `Content-Type` to serve the signed configuration with.
pub const CONTENT_TYPE: &str = "application/entity-statement+jwt";

const DEFAULT_LIFETIME: time::Duration = time::Duration::days(1);

/// Builds and signs the relying party's self-issued statement.
#[derive(Debug, Clone)]
pub struct EntityConfiguration {
    issuer: String,
    trust_anchor: String,
    relying_party: OpenIdRelyingParty,
    signing_key: EcKeyPair,
    lifetime: time::Duration,
}

impl EntityConfiguration {
    /// `signing_key` signs the configuration itself; the public halves of
    /// `encryption_keys` are what identity providers encrypt ID tokens to.
    #[must_use]
    pub fn new(
        config: &RelyingPartyConfig,
        signing_key: EcKeyPair,
        encryption_keys: &PrivateKeySet,
    ) -> Self {
        let relying_party = OpenIdRelyingParty {
            client_name: config.client_name().to_owned(),
            redirect_uris: vec![config.redirect_uri().clone()],
            response_types: vec!["code".into()],
            grant_types: vec!["authorization_code".into()],
            scope: config.scopes().join(" "),
            token_endpoint_auth_method: "self_signed_tls_client_auth".into(),
            id_token_encrypted_response_alg: ALG_ECDH_ES.into(),
            id_token_encrypted_response_enc: ENC_A256GCM.into(),
            jwks: encryption_keys.public_key_set(KEY_USE_ENC),
        };
        Self {
            issuer: config.client_id(),
            trust_anchor: entity_id(config.federation_master().as_str()),
            relying_party,
            signing_key,
            lifetime: DEFAULT_LIFETIME,
        }
    }

    /// How long a signed configuration stays valid (default one day).
    #[must_use]
    pub fn with_lifetime(mut self, lifetime: time::Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// The unsigned statement as of `clock.now()`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the lifetime reaches past the representable
    /// date range.
    pub fn statement(&self, clock: &dyn Clock) -> Result<EntityStatement, Error> {
        let now = clock.now();
        let expires_at = now.checked_add(self.lifetime).ok_or_else(|| {
            Error::Config(format!("entity configuration lifetime {} out of range", self.lifetime))
        })?;
        let jwks: KeySet = [self.signing_key.public_jwk(KEY_USE_SIG)].into_iter().collect();
        Ok(
            EntityStatement::new(&self.issuer, &self.issuer, now, expires_at, jwks)
                .with_authority_hints(vec![self.trust_anchor.clone()])
                .with_metadata(Metadata {
                    openid_relying_party: Some(self.relying_party.clone()),
                    ..Metadata::default()
                }),
        )
    }

    /// Compact JWS ready to serve with [`CONTENT_TYPE`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an out-of-range lifetime and
    /// [`Error::InvalidArgument`] if the statement cannot be serialized.
    pub fn sign(&self, clock: &dyn Clock) -> Result<String, Error> {
        let statement = self.statement(clock)?;
        debug!(issuer = %self.issuer, exp = %statement.expires_at, "Signing entity configuration");
        jws::sign(&statement, &self.signing_key, TYP_ENTITY_STATEMENT)
    }
}
