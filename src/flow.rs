//! Login flow: pick an identity provider, then exchange the code it returns.
//!
//! ```rust,ignore
//! // First request: show the IdP picker.
//! let step = flow.start(Session::new(&SystemClock))?;
//! let options = step.fetch_idp_options().await?;
//!
//! // Second request: the user picked one.
//! let step = step.select_idp(&picked_iss).await?;
//! store.save(step.session()).await?;
//! redirect_to(step.authorization_url());
//!
//! // Callback.
//! let FlowState::AwaitingCodeExchange(step) = flow.resume(stored_session).await? else { .. };
//! step.check_state(&params.state)?;
//! let verifier = stored_verifier(&params.state)?;
//! let id_token = step.exchange_code(&params.code, &verifier).await?;
//! store.delete(&session_id).await?;
//! ```

use std::sync::Arc;

use tracing::{info, instrument, warn};
use url::Url;

use crate::config::RelyingPartyConfig;
use crate::error::Error;
use crate::federation::TrustResolver;
use crate::http::HttpClient;
use crate::jwk::DecryptionKeys;
use crate::jws::SignedStatement;
use crate::pkce::{CHALLENGE_METHOD_S256, Pkce};
use crate::session::Session;
use crate::statement::{EntityStatement, IdpOption};
use crate::token::{IdToken, TokenExchange};
use crate::types::entity_id;

/// Entry point of the login flow. One per process, shared across requests.
pub struct AuthenticationFlow<H, K> {
    config: RelyingPartyConfig,
    resolver: Arc<TrustResolver<H>>,
    keys: Arc<K>,
}

/// Where a resumed session stands.
pub enum FlowState<'a, H, K> {
    AwaitingIdpSelection(SelectIdpStep<'a, H, K>),
    AwaitingCodeExchange(CodeExchangeStep<'a, H, K>),
}

impl<H: HttpClient, K: DecryptionKeys> AuthenticationFlow<H, K> {
    /// `resolver` must trust the federation master named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the resolver's trust anchor differs from
    /// `config.federation_master()`.
    pub fn new(
        config: RelyingPartyConfig,
        resolver: Arc<TrustResolver<H>>,
        keys: K,
    ) -> Result<Self, Error> {
        let configured = entity_id(config.federation_master().as_str());
        if resolver.trust_anchor() != configured {
            return Err(Error::Config(format!(
                "resolver trusts {} but the relying party is configured for {configured}",
                resolver.trust_anchor()
            )));
        }
        Ok(Self {
            config,
            resolver,
            keys: Arc::new(keys),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RelyingPartyConfig {
        &self.config
    }

    #[must_use]
    pub fn resolver(&self) -> &Arc<TrustResolver<H>> {
        &self.resolver
    }

    /// Begin (or restart) a login: fills in nonce and PKCE pair if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionExpired`] if the session is older than the
    /// configured TTL.
    pub fn start(&self, session: Session) -> Result<SelectIdpStep<'_, H, K>, Error> {
        self.ensure_live(&session)?;
        Ok(SelectIdpStep {
            flow: self,
            session: session.initialized(),
        })
    }

    /// Rebuild the flow state of a session persisted across the redirect.
    ///
    /// A session with a chosen identity provider re-resolves that provider
    /// (normally from cache) so the exchange is bound to a verified statement.
    ///
    /// # Errors
    ///
    /// [`Error::SessionExpired`], or any error of
    /// [`TrustResolver::resolve_openid_provider`].
    #[instrument(skip_all, fields(session = %session.id))]
    pub async fn resume(&self, session: Session) -> Result<FlowState<'_, H, K>, Error> {
        self.ensure_live(&session)?;
        let session = session.initialized();
        match session.chosen_idp_iss.clone() {
            None => Ok(FlowState::AwaitingIdpSelection(SelectIdpStep {
                flow: self,
                session,
            })),
            Some(iss) => {
                let idp = self.resolver.resolve_openid_provider(&iss).await?;
                Ok(FlowState::AwaitingCodeExchange(CodeExchangeStep::new(
                    self, session, idp,
                )?))
            }
        }
    }

    fn ensure_live(&self, session: &Session) -> Result<(), Error> {
        if session.is_expired_at(self.resolver.clock().now(), self.config.session_ttl) {
            warn!(session = %session.id, "Login session expired");
            return Err(Error::SessionExpired);
        }
        Ok(())
    }
}

/// First step: the user has not chosen an identity provider yet.
pub struct SelectIdpStep<'a, H, K> {
    flow: &'a AuthenticationFlow<H, K>,
    session: Session,
}

impl<'a, H: HttpClient, K: DecryptionKeys> SelectIdpStep<'a, H, K> {
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Pinned identity providers, sorted for display. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// See [`TrustResolver::list_available_idps`].
    pub async fn fetch_idp_options(&self) -> Result<Vec<IdpOption>, Error> {
        let anchor = self.flow.resolver.fetch_trust_anchor_statement().await?;
        self.flow.resolver.list_available_idps(anchor.body()).await
    }

    /// Choose `iss` from [`fetch_idp_options`](Self::fetch_idp_options).
    ///
    /// The returned step carries the updated session; persist it before
    /// redirecting. `self` is left untouched, so a failed selection can be retried.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownIdp`] if `iss` is not among the offered providers.
    /// - Any error of [`TrustResolver::resolve_openid_provider`].
    #[instrument(skip(self), fields(session = %self.session.id))]
    pub async fn select_idp(&self, iss: &str) -> Result<CodeExchangeStep<'a, H, K>, Error> {
        let wanted = entity_id(iss);
        let options = self.fetch_idp_options().await?;
        let Some(option) = options.into_iter().find(|o| entity_id(&o.iss) == wanted) else {
            warn!(iss, "Selected identity provider is not offered");
            return Err(Error::UnknownIdp(iss.to_owned()));
        };

        let idp = self.flow.resolver.resolve_openid_provider(&option.iss).await?;
        info!(idp = %option.iss, "Identity provider selected");
        CodeExchangeStep::new(
            self.flow,
            self.session.clone().with_chosen_idp(option.iss),
            idp,
        )
    }
}

/// Second step: bound to a verified identity provider, waiting for the code.
pub struct CodeExchangeStep<'a, H, K> {
    flow: &'a AuthenticationFlow<H, K>,
    session: Session,
    idp: Arc<SignedStatement<EntityStatement>>,
    authorization_endpoint: Url,
    nonce: String,
    pkce: Pkce,
}

impl<'a, H: HttpClient, K: DecryptionKeys> CodeExchangeStep<'a, H, K> {
    fn new(
        flow: &'a AuthenticationFlow<H, K>,
        session: Session,
        idp: Arc<SignedStatement<EntityStatement>>,
    ) -> Result<Self, Error> {
        let authorization_endpoint = idp
            .body()
            .metadata
            .openid_provider
            .as_ref()
            .map(|op| op.authorization_endpoint.clone())
            .ok_or_else(|| {
                Error::MalformedStatement(format!(
                    "{} publishes no openid_provider metadata",
                    idp.body().iss
                ))
            })?;
        let (Some(nonce), Some(pkce)) = (session.nonce.clone(), session.pkce.clone()) else {
            return Err(Error::InvalidArgument("session was not started".into()));
        };
        Ok(Self {
            flow,
            session,
            idp,
            authorization_endpoint,
            nonce,
            pkce,
        })
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The chosen identity provider's verified entity configuration.
    #[must_use]
    pub fn idp(&self) -> &EntityStatement {
        self.idp.body()
    }

    /// Where to send the browser.
    #[must_use]
    pub fn authorization_url(&self) -> Url {
        let config = &self.flow.config;
        let mut url = self.authorization_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &config.client_id())
            .append_pair("redirect_uri", config.redirect_uri.as_str())
            .append_pair("state", &self.session.state)
            .append_pair("nonce", &self.nonce)
            .append_pair("code_challenge", self.pkce.challenge())
            .append_pair("code_challenge_method", CHALLENGE_METHOD_S256)
            .append_pair("scope", &config.scopes.join(" "));
        url
    }

    /// Compare the `state` echoed on the callback with the session's.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on mismatch.
    pub fn check_state(&self, returned: &str) -> Result<(), Error> {
        if returned != self.session.state {
            warn!(session = %self.session.id, "Callback state does not match session");
            return Err(Error::InvalidArgument("state mismatch".into()));
        }
        Ok(())
    }

    /// Exchange `code` for a verified ID token. Terminal: whatever the outcome,
    /// the session must not be used again.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionExpired`] if the session outlived its TTL.
    /// - [`Error::InvalidArgument`] if `verifier` is not this session's PKCE verifier.
    /// - [`Error::FederationUnavailable`] / [`Error::TokenEndpoint`] if the exchange fails.
    /// - [`Error::MissingDecryptionKey`], [`Error::BadIdToken`],
    ///   [`Error::BadIdTokenSignature`], [`Error::MalformedStatement`],
    ///   [`Error::IdTokenClaims`] from the token checks, in that order.
    #[instrument(skip_all, fields(session = %self.session.id, idp = %self.idp.body().iss))]
    pub async fn exchange_code(self, code: &str, verifier: &str) -> Result<IdToken, Error> {
        self.flow.ensure_live(&self.session)?;
        if !self.pkce.matches(verifier) {
            return Err(Error::InvalidArgument(
                "code verifier does not belong to this session".into(),
            ));
        }

        let client_id = self.flow.config.client_id();
        TokenExchange {
            resolver: &self.flow.resolver,
            keys: &*self.flow.keys,
            client_id: &client_id,
            redirect_uri: &self.flow.config.redirect_uri,
        }
        .run(self.idp.body(), code, verifier, Some(&self.nonce))
        .await
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::fixtures::{Federation, IDP, RP, now};
    use crate::http::Method;
    use crate::jwe::{self, JweError};
    use crate::jwk::{EcKeyPair, KEY_USE_ENC, PrivateKeySet};
    use crate::jws::{self as jws_mod, TYP_JWT};

    fn config() -> RelyingPartyConfig {
        RelyingPartyConfig::new(
            RP.parse().unwrap(),
            format!("{RP}/auth/callback").parse().unwrap(),
            crate::fixtures::ANCHOR.parse().unwrap(),
        )
    }

    fn flow(fed: &Federation) -> AuthenticationFlow<impl HttpClient + use<>, PrivateKeySet> {
        let (resolver, _) = fed.resolver();
        AuthenticationFlow::new(
            config(),
            Arc::new(resolver),
            PrivateKeySet::new(vec![fed.rp_encryption_key.clone()]),
        )
        .unwrap()
    }

    fn session() -> Session {
        Session::new(&crate::clock::FixedClock::new(now()))
    }

    #[tokio::test]
    async fn start_initializes_session() {
        let fed = Federation::new();
        let flow = flow(&fed);
        let step = flow.start(session()).unwrap();
        assert!(step.session().nonce.is_some());
        assert!(step.session().pkce.is_some());

        let names: Vec<_> = step
            .fetch_idp_options()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.display_name)
            .collect();
        assert_eq!(names, ["AOK Nordheim", "AOK Testfalen"]);
    }

    #[tokio::test]
    async fn unknown_idp_is_rejected() {
        let fed = Federation::new();
        let flow = flow(&fed);
        let step = flow.start(session()).unwrap();

        let err = step.select_idp("https://not-listed.example").await.err().unwrap();
        assert!(matches!(err, Error::UnknownIdp(ref iss) if iss == "https://not-listed.example"));
        assert!(step.session().chosen_idp_iss.is_none());
    }

    #[tokio::test]
    async fn authorization_url_carries_session_values() {
        let fed = Federation::new();
        let flow = flow(&fed);
        let step = flow.start(session()).unwrap().select_idp(IDP).await.unwrap();
        let session = step.session();
        assert_eq!(session.chosen_idp_iss.as_deref(), Some(IDP));

        let url = step.authorization_url();
        assert_eq!(url.as_str().split('?').next(), Some("https://mydiga.example.com/auth"));
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], RP);
        assert_eq!(params["redirect_uri"], format!("{RP}/auth/callback"));
        assert_eq!(params["state"], session.state);
        assert_eq!(Some(&params["nonce"]), session.nonce.as_ref());
        assert_eq!(params["code_challenge"], session.pkce.as_ref().unwrap().challenge());
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["scope"], "openid urn:telematik:email urn:telematik:versicherter");
    }

    #[tokio::test]
    async fn resume_restores_the_right_step() {
        let fed = Federation::new();
        let flow = flow(&fed);

        let fresh = flow.start(session()).unwrap().session().clone();
        assert!(matches!(
            flow.resume(fresh.clone()).await,
            Ok(FlowState::AwaitingIdpSelection(_))
        ));

        let chosen = flow
            .start(fresh)
            .unwrap()
            .select_idp(IDP)
            .await
            .unwrap()
            .session()
            .clone();
        let json = serde_json::to_string(&chosen).unwrap();
        let restored: Session = serde_json::from_str(&json).unwrap();
        match flow.resume(restored).await {
            Ok(FlowState::AwaitingCodeExchange(step)) => assert_eq!(step.idp().iss, IDP),
            _ => panic!("expected code exchange step"),
        }
    }

    #[tokio::test]
    async fn expired_session_is_refused() {
        let fed = Federation::new();
        let (resolver, clock) = fed.resolver();
        let flow =
            AuthenticationFlow::new(config(), Arc::new(resolver), PrivateKeySet::default()).unwrap();

        let session = session();
        clock.advance(Duration::minutes(10));
        assert!(matches!(flow.start(session.clone()), Err(Error::SessionExpired)));
        assert!(matches!(flow.resume(session).await, Err(Error::SessionExpired)));
    }

    #[tokio::test]
    async fn unbounded_session_ttl_never_expires() {
        let fed = Federation::new();
        let (resolver, clock) = fed.resolver();
        let config = config().with_session_ttl(Duration::seconds(i64::MAX));
        let flow =
            AuthenticationFlow::new(config, Arc::new(resolver), PrivateKeySet::default()).unwrap();

        let session = session();
        clock.advance(Duration::days(365));
        assert!(flow.start(session).is_ok());
    }

    #[test]
    fn resolver_for_another_anchor_is_a_config_error() {
        let fed = Federation::new();
        let http = fed.http();
        let resolver = TrustResolver::new(http, &"https://other-master.example".parse().unwrap());

        let err = AuthenticationFlow::new(config(), Arc::new(resolver), PrivateKeySet::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("other-master")), "{err}");

        let (resolver, _) = fed.resolver();
        let slash = RelyingPartyConfig::new(
            RP.parse().unwrap(),
            format!("{RP}/auth/callback").parse().unwrap(),
            format!("{}/", crate::fixtures::ANCHOR).parse().unwrap(),
        );
        assert!(AuthenticationFlow::new(slash, Arc::new(resolver), PrivateKeySet::default()).is_ok());
    }

    #[tokio::test]
    async fn state_mismatch_is_detected() {
        let fed = Federation::new();
        let flow = flow(&fed);
        let step = flow.start(session()).unwrap().select_idp(IDP).await.unwrap();
        let state = step.session().state.clone();
        assert!(step.check_state(&state).is_ok());
        assert!(step.check_state("forged").is_err());
    }

    async fn exchange(
        fed: &Federation,
        flow: &AuthenticationFlow<impl HttpClient, PrivateKeySet>,
    ) -> Result<IdToken, Error> {
        let step = flow.start(session()).unwrap().select_idp(IDP).await.unwrap();
        let nonce = step.session().nonce.clone().unwrap();
        let verifier = step.session().pkce.as_ref().unwrap().verifier().to_owned();
        fed.issue_id_token(&fed.claims(&nonce), &fed.idp_key);
        step.exchange_code("auth-code-1", &verifier).await
    }

    #[tokio::test]
    async fn exchange_returns_verified_claims() {
        let fed = Federation::new();
        let flow = flow(&fed);

        let token = exchange(&fed, &flow).await.unwrap();
        assert_eq!(token.claims().sub, "X110411675");
        assert_eq!(token.claims().telematik_id.as_deref(), Some("X110411675"));

        let requests = fed.requests.lock().unwrap();
        let token_request = requests.iter().find(|r| r.method == Method::Post).unwrap();
        let form: std::collections::HashMap<_, _> = token_request.form_params().into_iter().collect();
        assert_eq!(form["grant_type"], "authorization_code");
        assert_eq!(form["code"], "auth-code-1");
        assert_eq!(form["client_id"], RP);
        assert_eq!(form["redirect_uri"], format!("{RP}/auth/callback"));
        assert!(form.contains_key("code_verifier"));
    }

    #[tokio::test]
    async fn wrong_verifier_is_refused_before_any_request() {
        let fed = Federation::new();
        let flow = flow(&fed);
        let step = flow.start(session()).unwrap().select_idp(IDP).await.unwrap();

        let err = step.exchange_code("code", "not-the-verifier").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(fed.requested().iter().all(|u| !u.ends_with("/token")));
    }

    #[tokio::test]
    async fn unknown_encryption_key_fails_before_signature_check() {
        let fed = Federation::new();
        let (resolver, _) = fed.resolver();
        let flow = AuthenticationFlow::new(
            config(),
            Arc::new(resolver),
            PrivateKeySet::new(vec![EcKeyPair::generate("some-other-kid")]),
        )
        .unwrap();

        let step = flow.start(session()).unwrap().select_idp(IDP).await.unwrap();
        let nonce = step.session().nonce.clone().unwrap();
        let verifier = step.session().pkce.as_ref().unwrap().verifier().to_owned();
        fed.issue_id_token(&fed.claims(&nonce), &fed.idp_key);

        // With the IdP's keys evicted, any signature check would have to fetch them again.
        flow.resolver().invalidate(IDP).await;
        let before = fed.requested().len();
        let fetches_before = flow.resolver().stats().await.subordinates.fetches;

        let err = step.exchange_code("auth-code-1", &verifier).await.unwrap_err();
        assert!(matches!(err, Error::MissingDecryptionKey(ref kid) if kid == "rp-enc-1"), "{err}");

        assert_eq!(fed.requested()[before..], [format!("{IDP}/token")]);
        assert_eq!(flow.resolver().stats().await.subordinates.fetches, fetches_before);
    }

    #[tokio::test]
    async fn wrong_decryption_key_is_bad_id_token() {
        let fed = Federation::new();
        let (resolver, _) = fed.resolver();
        let impostor = EcKeyPair::generate("rp-enc-1");
        let flow =
            AuthenticationFlow::new(config(), Arc::new(resolver), PrivateKeySet::new(vec![impostor]))
                .unwrap();

        let err = exchange(&fed, &flow).await.unwrap_err();
        assert!(matches!(err, Error::BadIdToken(JweError::Decrypt)), "{err}");
    }

    #[tokio::test]
    async fn token_signed_by_unvouched_key_is_bad_signature() {
        let fed = Federation::new();
        let flow = flow(&fed);
        let step = flow.start(session()).unwrap().select_idp(IDP).await.unwrap();
        let nonce = step.session().nonce.clone().unwrap();
        let verifier = step.session().pkce.as_ref().unwrap().verifier().to_owned();
        fed.issue_id_token(&fed.claims(&nonce), &EcKeyPair::generate("idp-1"));

        let err = step.exchange_code("code", &verifier).await.unwrap_err();
        assert!(matches!(err, Error::BadIdTokenSignature { ref issuer, .. } if issuer == IDP));
    }

    #[tokio::test]
    async fn nested_jwt_payload_is_unwrapped() {
        let fed = Federation::new();
        let flow = flow(&fed);
        let step = flow.start(session()).unwrap().select_idp(IDP).await.unwrap();
        let nonce = step.session().nonce.clone().unwrap();
        let verifier = step.session().pkce.as_ref().unwrap().verifier().to_owned();

        let inner = jws_mod::sign(&fed.claims(&nonce), &fed.idp_key, TYP_JWT).unwrap();
        let plaintext = serde_json::json!({ "njwt": inner }).to_string();
        let id_token = jwe::encrypt(
            plaintext.as_bytes(),
            &fed.rp_encryption_key.public_jwk(KEY_USE_ENC),
            Some("NJWT"),
        )
        .unwrap();
        fed.respond(
            Method::Post,
            format!("{IDP}/token"),
            200,
            serde_json::json!({ "id_token": id_token }).to_string(),
        );

        let token = step.exchange_code("code", &verifier).await.unwrap();
        assert_eq!(token.raw(), inner);
    }

    #[tokio::test]
    async fn replayed_nonce_is_rejected() {
        let fed = Federation::new();
        let flow = flow(&fed);
        let step = flow.start(session()).unwrap().select_idp(IDP).await.unwrap();
        let verifier = step.session().pkce.as_ref().unwrap().verifier().to_owned();
        fed.issue_id_token(&fed.claims("nonce-from-another-login"), &fed.idp_key);

        let err = step.exchange_code("code", &verifier).await.unwrap_err();
        assert!(matches!(err, Error::IdTokenClaims(_)));
    }

    #[tokio::test]
    async fn token_endpoint_rejection_is_reported() {
        let fed = Federation::new();
        let flow = flow(&fed);
        let step = flow.start(session()).unwrap().select_idp(IDP).await.unwrap();
        let verifier = step.session().pkce.as_ref().unwrap().verifier().to_owned();
        fed.respond(
            Method::Post,
            format!("{IDP}/token"),
            400,
            r#"{"error":"invalid_grant"}"#,
        );

        let err = step.exchange_code("code", &verifier).await.unwrap_err();
        assert!(matches!(err, Error::TokenEndpoint { status: 400, .. }));
    }
}
