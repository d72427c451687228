//! Federation documents: entity statements and the identity-provider list.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;

use crate::jwk::KeySet;

/// Signed JSON document a federation participant publishes about itself, or
/// an authority publishes about a subordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct EntityStatement {
    pub iss: String,
    pub sub: String,
    #[serde(rename = "iat", with = "time::serde::timestamp")]
    pub issued_at: OffsetDateTime,
    #[serde(rename = "exp", with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
    #[serde(default)]
    pub jwks: KeySet,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authority_hints: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl EntityStatement {
    #[must_use]
    pub fn new(
        iss: impl Into<String>,
        sub: impl Into<String>,
        issued_at: OffsetDateTime,
        expires_at: OffsetDateTime,
        jwks: KeySet,
    ) -> Self {
        Self {
            iss: iss.into(),
            sub: sub.into(),
            issued_at,
            expires_at,
            jwks,
            authority_hints: Vec::new(),
            metadata: Metadata::default(),
        }
    }

    #[must_use]
    pub fn with_authority_hints(mut self, hints: Vec<String>) -> Self {
        self.authority_hints = hints;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn is_self_signed(&self) -> bool {
        self.iss == self.sub
    }

    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openid_provider: Option<OpenIdProvider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federation_entity: Option<FederationEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openid_relying_party: Option<OpenIdRelyingParty>,
}

/// `metadata.openid_provider` of a sectoral identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenIdProvider {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushed_authorization_request_endpoint: Option<Url>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub id_token_encryption_alg_values_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub id_token_encryption_enc_values_supported: Vec<String>,
}

/// `metadata.federation_entity`, present on the federation master and on
/// participants that want to be shown with a name and logo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FederationEntity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federation_fetch_endpoint: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idp_list_endpoint: Option<Url>,
}

/// `metadata.openid_relying_party` the relying party publishes about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenIdRelyingParty {
    pub client_name: String,
    pub redirect_uris: Vec<Url>,
    pub response_types: Vec<String>,
    pub grant_types: Vec<String>,
    pub scope: String,
    pub token_endpoint_auth_method: String,
    pub id_token_encrypted_response_alg: String,
    pub id_token_encrypted_response_enc: String,
    pub jwks: KeySet,
}

/// Anchor-signed list of identity providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct IdpList {
    pub iss: String,
    #[serde(rename = "iat", with = "time::serde::timestamp")]
    pub issued_at: OffsetDateTime,
    #[serde(rename = "exp", with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
    #[serde(rename = "idp_entities", default)]
    pub entries: Vec<IdpEntry>,
}

impl IdpList {
    #[must_use]
    pub fn new(
        iss: impl Into<String>,
        issued_at: OffsetDateTime,
        expires_at: OffsetDateTime,
        entries: Vec<IdpEntry>,
    ) -> Self {
        Self {
            iss: iss.into(),
            issued_at,
            expires_at,
            entries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdpEntry {
    pub iss: String,
    #[serde(rename = "organization_name")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_uri: Option<String>,
    #[serde(default)]
    pub is_pinned: bool,
}

impl IdpEntry {
    #[must_use]
    pub fn new(iss: impl Into<String>, display_name: impl Into<String>, is_pinned: bool) -> Self {
        Self {
            iss: iss.into(),
            display_name: display_name.into(),
            logo_uri: None,
            is_pinned,
        }
    }
}

/// An identity provider the user may choose, in presentation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdpOption {
    pub iss: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_uri: Option<String>,
}

impl From<IdpEntry> for IdpOption {
    fn from(entry: IdpEntry) -> Self {
        Self {
            iss: entry.iss,
            display_name: entry.display_name,
            logo_uri: entry.logo_uri,
        }
    }
}
