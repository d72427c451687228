//! Mock federation served by two wiremock servers: the federation master and
//! one identity provider.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use healthid_federation::clock::FixedClock;
use healthid_federation::jwk::{KEY_USE_ENC, KEY_USE_SIG};
use healthid_federation::jws::{self, TYP_ENTITY_STATEMENT, TYP_IDP_LIST, TYP_JWT};
use healthid_federation::statement::{FederationEntity, IdpEntry, Metadata, OpenIdProvider};
use healthid_federation::{
    AuthenticationFlow, EcKeyPair, EntityStatement, IdTokenClaims, IdpList, PrivateKeySet,
    RelyingPartyConfig, ReqwestHttpClient, TrustResolver, jwe,
};
use serde_json::json;
use time::OffsetDateTime;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const RP: &str = "https://rp.example";
pub const KVNR: &str = "X110411675";

pub struct TestFederation {
    pub anchor: MockServer,
    pub idp: MockServer,
    pub anchor_key: EcKeyPair,
    pub idp_key: EcKeyPair,
    pub rp_encryption_key: EcKeyPair,
    pub clock: Arc<FixedClock>,
}

impl TestFederation {
    pub async fn start() -> Self {
        Self {
            anchor: MockServer::start().await,
            idp: MockServer::start().await,
            anchor_key: EcKeyPair::generate("fedmaster-sig"),
            idp_key: EcKeyPair::generate("idp-sig"),
            rp_encryption_key: EcKeyPair::generate("rp-enc"),
            clock: Arc::new(FixedClock::new(OffsetDateTime::now_utc())),
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        use healthid_federation::Clock;
        self.clock.now()
    }

    pub fn anchor_id(&self) -> String {
        self.anchor.uri()
    }

    pub fn idp_id(&self) -> String {
        self.idp.uri()
    }

    pub fn anchor_statement(&self) -> String {
        let body = EntityStatement::new(
            self.anchor_id(),
            self.anchor_id(),
            self.now(),
            self.now() + time::Duration::days(1),
            [self.anchor_key.public_jwk(KEY_USE_SIG)].into_iter().collect(),
        )
        .with_metadata(Metadata {
            federation_entity: Some(FederationEntity {
                federation_fetch_endpoint: Some(
                    format!("{}/federation/fetch", self.anchor_id()).parse().unwrap(),
                ),
                idp_list_endpoint: Some(
                    format!("{}/federation/listidps", self.anchor_id()).parse().unwrap(),
                ),
                ..FederationEntity::default()
            }),
            ..Metadata::default()
        });
        jws::sign(&body, &self.anchor_key, TYP_ENTITY_STATEMENT).unwrap()
    }

    /// Mounts the anchor's entity statement and everything in [`mount_members`](Self::mount_members).
    pub async fn mount_federation(&self) {
        self.mount_anchor(ResponseTemplate::new(200).set_body_string(self.anchor_statement()))
            .await;
        self.mount_members().await;
    }

    /// IdP list (the mock IdP as "AOK Testfalen" plus "AOK Nordheim"), the
    /// fetch endpoint vouching for `idp_key` and the IdP's own configuration.
    pub async fn mount_members(&self) {
        self.mount_idp_list(vec![
            IdpEntry::new(self.idp_id(), "AOK Testfalen", true),
            IdpEntry::new("https://nordheim.example", "AOK Nordheim", true),
            IdpEntry::new("https://unpinned.example", "AOK Unpinned", false),
        ])
        .await;
        self.mount_fetch_endpoint().await;
        self.mount_idp_configuration().await;
    }

    pub async fn mount_anchor(&self, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-federation"))
            .respond_with(response)
            .mount(&self.anchor)
            .await;
    }

    pub async fn mount_idp_list(&self, entries: Vec<IdpEntry>) {
        let list = IdpList::new(
            self.anchor_id(),
            self.now(),
            self.now() + time::Duration::hours(1),
            entries,
        );
        Mock::given(method("GET"))
            .and(path("/federation/listidps"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(jws::sign(&list, &self.anchor_key, TYP_IDP_LIST).unwrap()),
            )
            .mount(&self.anchor)
            .await;
    }

    pub async fn mount_fetch_endpoint(&self) {
        let statement = EntityStatement::new(
            self.anchor_id(),
            self.idp_id(),
            self.now(),
            self.now() + time::Duration::hours(2),
            [self.idp_key.public_jwk(KEY_USE_SIG)].into_iter().collect(),
        );
        Mock::given(method("GET"))
            .and(path("/federation/fetch"))
            .and(query_param("iss", self.anchor_id()))
            .and(query_param("sub", self.idp_id()))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                jws::sign(&statement, &self.anchor_key, TYP_ENTITY_STATEMENT).unwrap(),
            ))
            .mount(&self.anchor)
            .await;
    }

    pub async fn mount_idp_configuration(&self) {
        let statement = EntityStatement::new(
            self.idp_id(),
            self.idp_id(),
            self.now(),
            self.now() + time::Duration::hours(2),
            [self.idp_key.public_jwk(KEY_USE_SIG)].into_iter().collect(),
        )
        .with_authority_hints(vec![self.anchor_id()])
        .with_metadata(Metadata {
            openid_provider: Some(OpenIdProvider {
                issuer: Some(self.idp_id()),
                authorization_endpoint: format!("{}/auth", self.idp_id()).parse().unwrap(),
                token_endpoint: format!("{}/token", self.idp_id()).parse().unwrap(),
                pushed_authorization_request_endpoint: None,
                scopes_supported: vec!["openid".into(), "urn:telematik:versicherter".into()],
                id_token_encryption_alg_values_supported: vec![jwe::ALG_ECDH_ES.into()],
                id_token_encryption_enc_values_supported: vec![jwe::ENC_A256GCM.into()],
            }),
            ..Metadata::default()
        });
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-federation"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                jws::sign(&statement, &self.idp_key, TYP_ENTITY_STATEMENT).unwrap(),
            ))
            .mount(&self.idp)
            .await;
    }

    /// Encrypted ID token for `nonce`, signed by `signer`.
    pub fn id_token(&self, nonce: &str, signer: &EcKeyPair) -> String {
        let claims = IdTokenClaims::new(
            self.idp_id(),
            KVNR,
            RP,
            self.now(),
            self.now() + time::Duration::minutes(5),
        )
        .with_nonce(nonce)
        .with_telematik_id(KVNR);
        let inner = jws::sign(&claims, signer, TYP_JWT).unwrap();
        jwe::encrypt(
            inner.as_bytes(),
            &self.rp_encryption_key.public_jwk(KEY_USE_ENC),
            None,
        )
        .unwrap()
    }

    pub async fn mount_token_endpoint(&self, id_token: &str) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id_token": id_token,
                "token_type": "Bearer",
                "expires_in": 300
            })))
            .expect(1)
            .mount(&self.idp)
            .await;
    }

    pub fn config(&self) -> RelyingPartyConfig {
        RelyingPartyConfig::new(
            RP.parse().unwrap(),
            format!("{RP}/auth/callback").parse().unwrap(),
            self.anchor_id().parse().unwrap(),
        )
        .with_http_timeout(Duration::from_secs(2))
    }

    pub fn resolver(&self) -> TrustResolver<ReqwestHttpClient> {
        let config = self.config();
        TrustResolver::new(
            ReqwestHttpClient::new(config.http_timeout()).unwrap(),
            config.federation_master(),
        )
        .with_clock(self.clock.clone())
        .with_timeout(config.http_timeout())
    }

    pub fn flow(&self, keys: PrivateKeySet) -> AuthenticationFlow<ReqwestHttpClient, PrivateKeySet> {
        AuthenticationFlow::new(self.config(), Arc::new(self.resolver()), keys).unwrap()
    }

    pub fn rp_keys(&self) -> PrivateKeySet {
        PrivateKeySet::new(vec![self.rp_encryption_key.clone()])
    }
}
