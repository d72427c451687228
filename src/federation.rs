//! Federation master client.
//!
//! Trust is single-hop: the trust anchor vouches for every participant through
//! its fetch endpoint, and a participant's keys are whatever the anchor's
//! statement about it says they are.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{info, instrument, warn};
use url::Url;

use crate::cache::{CacheStats, StatementCache};
use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::http::{self, HttpClient, HttpRequest};
use crate::jwk::KeySet;
use crate::jws::SignedStatement;
use crate::statement::{EntityStatement, IdpList, IdpOption};
use crate::types::entity_id;

const WELL_KNOWN_PATH: &str = ".well-known/openid-federation";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves and caches trust in federation participants.
///
/// Construct one per process and share it (it is `Send + Sync`); the caches
/// inside are what make repeated logins cheap.
pub struct TrustResolver<H> {
    http: Arc<H>,
    trust_anchor: String,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    /// Self-published entity configurations, keyed by issuer.
    configurations: StatementCache<EntityStatement>,
    /// Anchor-issued statements about subordinates, keyed by subject.
    subordinates: StatementCache<EntityStatement>,
    idp_lists: StatementCache<IdpList>,
}

/// Fetch counters of the resolver's caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub configurations: CacheStats,
    pub subordinates: CacheStats,
    pub idp_lists: CacheStats,
}

impl<H: HttpClient> TrustResolver<H> {
    #[must_use]
    pub fn new(http: H, trust_anchor: &Url) -> Self {
        Self::with_shared_client(Arc::new(http), trust_anchor)
    }

    /// Like [`new`](Self::new) for a client already shared elsewhere.
    #[must_use]
    pub fn with_shared_client(http: Arc<H>, trust_anchor: &Url) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            http,
            trust_anchor: entity_id(trust_anchor.as_str()),
            configurations: StatementCache::new(clock.clone()),
            subordinates: StatementCache::new(clock.clone()),
            idp_lists: StatementCache::new(clock.clone()),
            clock,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Use `clock` for every expiry decision. Resets the caches.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.configurations = StatementCache::new(clock.clone());
        self.subordinates = StatementCache::new(clock.clone());
        self.idp_lists = StatementCache::new(clock.clone());
        self.clock = clock;
        self
    }

    /// Bound for every outbound call (default 10 s).
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn trust_anchor(&self) -> &str {
        &self.trust_anchor
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn http(&self) -> &H {
        &self.http
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn stats(&self) -> ResolverStats {
        ResolverStats {
            configurations: self.configurations.stats().await,
            subordinates: self.subordinates.stats().await,
            idp_lists: self.idp_lists.stats().await,
        }
    }

    /// Forget everything cached about `issuer`: its entity configuration and the
    /// anchor's statement about it. The next resolution fetches both again.
    pub async fn invalidate(&self, issuer: &str) {
        let issuer = entity_id(issuer);
        self.configurations.invalidate(&issuer).await;
        self.subordinates.invalidate(&issuer).await;
    }

    /// The trust anchor's self-signed statement, verified against its own keys.
    ///
    /// # Errors
    ///
    /// - [`Error::FederationUnavailable`] if the anchor cannot be reached or answers
    ///   with a server error.
    /// - [`Error::UntrustedEntity`] if the anchor refuses the request (4xx).
    /// - [`Error::MalformedStatement`] if the statement does not parse or is not self-issued.
    /// - [`Error::UntrustedEntity`] if it names another issuer, has expired or its
    ///   self-signature does not verify.
    #[instrument(skip(self), fields(anchor = %self.trust_anchor))]
    pub async fn fetch_trust_anchor_statement(
        &self,
    ) -> Result<Arc<SignedStatement<EntityStatement>>, Error> {
        self.configurations
            .get_or_fetch(&self.trust_anchor, || async {
                let uri = well_known_uri(&self.trust_anchor)?;
                let statement: SignedStatement<EntityStatement> =
                    self.fetch_signed(uri, "trust anchor fetch", &self.trust_anchor)
                        .await?;
                let body = statement.body();

                if !body.is_self_signed() {
                    return Err(Error::MalformedStatement(format!(
                        "trust anchor statement has iss {} but sub {}",
                        body.iss, body.sub
                    )));
                }
                if entity_id(&body.iss) != self.trust_anchor {
                    return Err(Error::untrusted(
                        &body.iss,
                        format!("expected trust anchor {}", self.trust_anchor),
                    ));
                }
                self.ensure_fresh(body)?;
                if !statement.verify(&body.jwks)? {
                    warn!(kid = ?statement.header().kid, "Trust anchor self-signature invalid");
                    return Err(Error::untrusted(&body.iss, "self-signature does not verify"));
                }

                info!(keys = body.jwks.len(), "Trust anchor statement verified");
                Ok(statement)
            })
            .await
    }

    /// Pinned identity providers from the anchor's IdP list, deduplicated by
    /// issuer and sorted by display name (ties broken by issuer).
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedStatement`] if the anchor advertises no IdP list endpoint
    ///   or the list does not parse.
    /// - [`Error::UntrustedEntity`] if the list is not signed by the anchor or has expired.
    /// - [`Error::FederationUnavailable`] if the list cannot be fetched.
    #[instrument(skip_all, fields(anchor = %trust_anchor.iss))]
    pub async fn list_available_idps(
        &self,
        trust_anchor: &EntityStatement,
    ) -> Result<Vec<IdpOption>, Error> {
        let endpoint = trust_anchor
            .metadata
            .federation_entity
            .as_ref()
            .and_then(|f| f.idp_list_endpoint.clone())
            .ok_or_else(|| {
                Error::MalformedStatement("trust anchor advertises no idp_list_endpoint".into())
            })?;

        let list = self
            .idp_lists
            .get_or_fetch(endpoint.as_str(), || async {
                let list: SignedStatement<IdpList> =
                    self
                    .fetch_signed(endpoint.clone(), "idp list fetch", &trust_anchor.iss)
                    .await?;
                let body = list.body();

                if entity_id(&body.iss) != entity_id(&trust_anchor.iss) {
                    return Err(Error::untrusted(
                        &body.iss,
                        "IdP list not issued by the trust anchor",
                    ));
                }
                if body.expires_at <= self.clock.now() {
                    return Err(Error::untrusted(&body.iss, "IdP list expired"));
                }
                if !list.verify(&trust_anchor.jwks)? {
                    warn!(kid = ?list.header().kid, "IdP list signature invalid");
                    return Err(Error::untrusted(
                        &body.iss,
                        "IdP list signature does not verify against the trust anchor keys",
                    ));
                }
                Ok(list)
            })
            .await?;

        let mut seen = HashSet::new();
        let mut options: Vec<IdpOption> = list
            .body()
            .entries
            .iter()
            .filter(|entry| entry.is_pinned && seen.insert(entity_id(&entry.iss)))
            .cloned()
            .map(IdpOption::from)
            .collect();
        options.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.iss.cmp(&b.iss))
        });
        Ok(options)
    }

    /// Current signing keys of `candidate.iss`, as vouched for by the anchor.
    ///
    /// The candidate's own embedded keys are ignored.
    ///
    /// # Errors
    ///
    /// - [`Error::UntrustedEntity`] if the anchor's statement about the issuer does not
    ///   verify, is about someone else or has expired.
    /// - [`Error::MalformedStatement`] if the anchor has no fetch endpoint or the
    ///   response does not parse.
    /// - [`Error::UntrustedEntity`] if the fetch endpoint refuses to answer about the
    ///   issuer (4xx).
    /// - [`Error::FederationUnavailable`] on network failure or a server error.
    pub async fn resolve_signing_keys(&self, candidate: &EntityStatement) -> Result<KeySet, Error> {
        let statement = self.subordinate_statement(&candidate.iss).await?;
        Ok(statement.body().jwks.clone())
    }

    /// The identity provider's entity configuration, verified with the keys the
    /// anchor vouches for. Guaranteed to carry `metadata.openid_provider`.
    ///
    /// # Errors
    ///
    /// As [`resolve_signing_keys`](Self::resolve_signing_keys), plus
    /// [`Error::UntrustedEntity`] if the configuration is not self-issued or not
    /// signed with a vouched key, and [`Error::MalformedStatement`] if it carries no
    /// OpenID provider metadata.
    #[instrument(skip(self))]
    pub async fn resolve_openid_provider(
        &self,
        issuer: &str,
    ) -> Result<Arc<SignedStatement<EntityStatement>>, Error> {
        let issuer = entity_id(issuer);
        if issuer == self.trust_anchor {
            return Err(Error::untrusted(issuer, "the trust anchor is not an identity provider"));
        }

        self.configurations
            .get_or_fetch(&issuer, || async {
                let uri = well_known_uri(&issuer)?;
                let statement: SignedStatement<EntityStatement> =
                    self.fetch_signed(uri, "entity statement fetch", &issuer).await?;
                let body = statement.body();

                if !body.is_self_signed() || entity_id(&body.iss) != issuer {
                    return Err(Error::untrusted(
                        &issuer,
                        format!("entity configuration issued by {} about {}", body.iss, body.sub),
                    ));
                }
                self.ensure_fresh(body)?;

                let keys = self.resolve_signing_keys(body).await?;
                if !statement.verify(&keys)? {
                    warn!(kid = ?statement.header().kid, "Entity configuration signed with a key the anchor does not vouch for");
                    return Err(Error::untrusted(
                        &issuer,
                        "entity configuration not signed with an anchor-vouched key",
                    ));
                }
                if body.metadata.openid_provider.is_none() {
                    return Err(Error::MalformedStatement(format!(
                        "{issuer} publishes no openid_provider metadata"
                    )));
                }

                info!(issuer = %issuer, "Identity provider trusted");
                Ok(statement)
            })
            .await
    }

    /// The anchor's statement about `subject`, obtained from its fetch endpoint.
    #[instrument(skip(self))]
    async fn subordinate_statement(
        &self,
        subject: &str,
    ) -> Result<Arc<SignedStatement<EntityStatement>>, Error> {
        let subject = entity_id(subject);
        self.subordinates
            .get_or_fetch(&subject, || async {
                let anchor = self.fetch_trust_anchor_statement().await?;
                let anchor = anchor.body();
                let mut uri = anchor
                    .metadata
                    .federation_entity
                    .as_ref()
                    .and_then(|f| f.federation_fetch_endpoint.clone())
                    .ok_or_else(|| {
                        Error::MalformedStatement(
                            "trust anchor advertises no federation_fetch_endpoint".into(),
                        )
                    })?;
                uri.query_pairs_mut()
                    .append_pair("iss", &anchor.iss)
                    .append_pair("sub", &subject);

                let statement: SignedStatement<EntityStatement> =
                    self.fetch_signed(uri, "fetch endpoint query", &subject).await?;
                let body = statement.body();

                if entity_id(&body.iss) != self.trust_anchor {
                    return Err(Error::untrusted(
                        &subject,
                        format!("statement issued by {} instead of the trust anchor", body.iss),
                    ));
                }
                if entity_id(&body.sub) != subject {
                    return Err(Error::untrusted(
                        &subject,
                        format!("fetch endpoint answered about {}", body.sub),
                    ));
                }
                self.ensure_fresh(body)?;
                if !statement.verify(&anchor.jwks)? {
                    warn!(kid = ?statement.header().kid, "Subordinate statement not signed by the trust anchor");
                    return Err(Error::untrusted(
                        &subject,
                        "statement does not verify against the trust anchor keys",
                    ));
                }

                info!(keys = body.jwks.len(), "Signing keys resolved via trust anchor");
                Ok(statement)
            })
            .await
    }

    async fn fetch_signed<T: DeserializeOwned>(
        &self,
        uri: Url,
        operation: &'static str,
        entity: &str,
    ) -> Result<SignedStatement<T>, Error> {
        let response = http::fetch(
            &*self.http,
            HttpRequest::get(uri),
            self.timeout,
            operation,
            entity,
        )
        .await?;
        let raw = std::str::from_utf8(&response.body)
            .map_err(|e| Error::MalformedStatement(format!("{operation}: {e}")))?;
        SignedStatement::parse(raw.trim())
    }

    fn ensure_fresh(&self, statement: &EntityStatement) -> Result<(), Error> {
        if statement.is_expired_at(self.clock.now()) {
            return Err(Error::untrusted(
                &statement.sub,
                format!("statement expired at {}", statement.expires_at),
            ));
        }
        Ok(())
    }
}

impl<H> std::fmt::Debug for TrustResolver<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustResolver")
            .field("trust_anchor", &self.trust_anchor)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn well_known_uri(entity: &str) -> Result<Url, Error> {
    format!("{}/{WELL_KNOWN_PATH}", entity_id(entity))
        .parse()
        .map_err(|e| Error::MalformedStatement(format!("entity identifier {entity}: {e}")))
}
