//! In-memory federation for unit tests: a trust anchor, one identity
//! provider and a routing table answering the resolver's requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use time::{Duration, OffsetDateTime};
use url::Url;

use crate::clock::FixedClock;
use crate::federation::TrustResolver;
use crate::http::{HttpClient, HttpRequest, HttpResponse, Method, TransportError};
use crate::jwe;
use crate::jwk::{EcKeyPair, KEY_USE_ENC, KEY_USE_SIG};
use crate::jws::{self, TYP_ENTITY_STATEMENT, TYP_IDP_LIST, TYP_JWT};
use crate::statement::{
    EntityStatement, FederationEntity, IdpEntry, IdpList, Metadata, OpenIdProvider,
};
use crate::token::IdTokenClaims;

pub(crate) const ANCHOR: &str = "https://fedmaster.example";
pub(crate) const IDP: &str = "https://mydiga.example.com";
pub(crate) const RP: &str = "https://rp.example";
pub(crate) const WELL_KNOWN: &str = ".well-known/openid-federation";

pub(crate) fn now() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
}

pub(crate) fn fetch_uri(subject: &str) -> String {
    let mut uri: Url = format!("{ANCHOR}/federation/fetch").parse().unwrap();
    uri.query_pairs_mut()
        .append_pair("iss", ANCHOR)
        .append_pair("sub", subject);
    uri.to_string()
}

type Routes = Arc<Mutex<HashMap<(Method, String), (u16, String)>>>;

pub(crate) struct Federation {
    pub anchor_key: EcKeyPair,
    pub idp_key: EcKeyPair,
    pub rp_encryption_key: EcKeyPair,
    pub routes: Routes,
    pub requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl Federation {
    pub fn new() -> Self {
        let fed = Self {
            anchor_key: EcKeyPair::generate("anchor-1"),
            idp_key: EcKeyPair::generate("idp-1"),
            rp_encryption_key: EcKeyPair::generate("rp-enc-1"),
            routes: Arc::default(),
            requests: Arc::default(),
        };
        fed.publish_anchor(&fed.anchor_key);
        fed.publish_idp_list(vec![
            IdpEntry::new(IDP, "AOK Testfalen", true),
            IdpEntry::new("https://nordheim.example", "AOK Nordheim", true),
        ]);
        fed.vouch_for(IDP, &fed.idp_key);
        fed.publish_idp_configuration(IDP, &fed.idp_key);
        fed
    }

    pub fn respond(&self, method: Method, uri: impl Into<String>, status: u16, body: impl Into<String>) {
        self.routes
            .lock()
            .unwrap()
            .insert((method, uri.into()), (status, body.into()));
    }

    pub fn get(&self, uri: impl Into<String>, body: impl Into<String>) {
        self.respond(Method::Get, uri, 200, body);
    }

    pub fn anchor_body(&self) -> EntityStatement {
        EntityStatement::new(
            ANCHOR,
            ANCHOR,
            now(),
            now() + Duration::days(1),
            [self.anchor_key.public_jwk(KEY_USE_SIG)].into_iter().collect(),
        )
        .with_metadata(Metadata {
            federation_entity: Some(FederationEntity {
                federation_fetch_endpoint: Some(format!("{ANCHOR}/federation/fetch").parse().unwrap()),
                idp_list_endpoint: Some(format!("{ANCHOR}/federation/listidps").parse().unwrap()),
                ..FederationEntity::default()
            }),
            ..Metadata::default()
        })
    }

    pub fn publish_anchor(&self, signer: &EcKeyPair) {
        let raw = jws::sign(&self.anchor_body(), signer, TYP_ENTITY_STATEMENT).unwrap();
        self.get(format!("{ANCHOR}/{WELL_KNOWN}"), raw);
    }

    pub fn publish_idp_list(&self, entries: Vec<IdpEntry>) {
        let list = IdpList::new(ANCHOR, now(), now() + Duration::hours(1), entries);
        let raw = jws::sign(&list, &self.anchor_key, TYP_IDP_LIST).unwrap();
        self.get(format!("{ANCHOR}/federation/listidps"), raw);
    }

    pub fn vouch_for(&self, subject: &str, key: &EcKeyPair) {
        let statement = EntityStatement::new(
            ANCHOR,
            subject,
            now(),
            now() + Duration::hours(2),
            [key.public_jwk(KEY_USE_SIG)].into_iter().collect(),
        );
        let raw = jws::sign(&statement, &self.anchor_key, TYP_ENTITY_STATEMENT).unwrap();
        self.get(fetch_uri(subject), raw);
    }

    pub fn publish_idp_configuration(&self, issuer: &str, signer: &EcKeyPair) {
        let statement = EntityStatement::new(
            issuer,
            issuer,
            now(),
            now() + Duration::hours(2),
            [signer.public_jwk(KEY_USE_SIG)].into_iter().collect(),
        )
        .with_authority_hints(vec![ANCHOR.into()])
        .with_metadata(Metadata {
            openid_provider: Some(OpenIdProvider {
                issuer: Some(issuer.into()),
                authorization_endpoint: format!("{issuer}/auth").parse().unwrap(),
                token_endpoint: format!("{issuer}/token").parse().unwrap(),
                pushed_authorization_request_endpoint: None,
                scopes_supported: vec!["openid".into()],
                id_token_encryption_alg_values_supported: vec![jwe::ALG_ECDH_ES.into()],
                id_token_encryption_enc_values_supported: vec![jwe::ENC_A256GCM.into()],
            }),
            ..Metadata::default()
        });
        let raw = jws::sign(&statement, signer, TYP_ENTITY_STATEMENT).unwrap();
        self.get(format!("{issuer}/{WELL_KNOWN}"), raw);
    }

    /// Claims the identity provider would issue for `nonce`.
    pub fn claims(&self, nonce: &str) -> IdTokenClaims {
        IdTokenClaims::new(IDP, "X110411675", RP, now(), now() + Duration::minutes(5))
            .with_nonce(nonce)
            .with_telematik_id("X110411675")
    }

    /// Sign `claims` with `signer`, encrypt to the relying party and serve it
    /// from the token endpoint.
    pub fn issue_id_token(&self, claims: &IdTokenClaims, signer: &EcKeyPair) {
        let inner = jws::sign(claims, signer, TYP_JWT).unwrap();
        let jwe = jwe::encrypt(
            inner.as_bytes(),
            &self.rp_encryption_key.public_jwk(KEY_USE_ENC),
            None,
        )
        .unwrap();
        self.respond(
            Method::Post,
            format!("{IDP}/token"),
            200,
            serde_json::json!({"id_token": jwe, "token_type": "Bearer"}).to_string(),
        );
    }

    pub fn http(&self) -> impl HttpClient + use<> {
        let routes = self.routes.clone();
        let requests = self.requests.clone();
        move |req: HttpRequest| {
            let routes = routes.clone();
            let requests = requests.clone();
            async move {
                let key = (req.method, req.uri.to_string());
                requests.lock().unwrap().push(req);
                let route = routes.lock().unwrap().get(&key).cloned();
                Ok::<_, TransportError>(match route {
                    Some((status, body)) => HttpResponse::new(status, body),
                    None => HttpResponse::new(404, "not found"),
                })
            }
        }
    }

    pub fn resolver(&self) -> (TrustResolver<impl HttpClient + use<>>, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(now()));
        let resolver =
            TrustResolver::new(self.http(), &ANCHOR.parse().unwrap()).with_clock(clock.clone());
        (resolver, clock)
    }

    /// URIs requested so far, in order.
    pub fn requested(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.uri.to_string())
            .collect()
    }
}
