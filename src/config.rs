use std::time::Duration;

use url::Url;

use crate::error::Error;
use crate::types::entity_id;

const DEFAULT_SCOPES: [&str; 3] = ["openid", "urn:telematik:email", "urn:telematik:versicherter"];
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SESSION_TTL: time::Duration = time::Duration::minutes(10);

/// Relying-party configuration.
///
/// Required fields are constructor parameters. Everything else has a default
/// and a `with_*` override.
///
/// ```rust,ignore
/// use healthid_federation::RelyingPartyConfig;
///
/// let config = RelyingPartyConfig::new(
///     "https://rp.example".parse()?,
///     "https://rp.example/auth/callback".parse()?,
///     "https://app-test.federationmaster.de".parse()?,
/// )
/// .with_scopes(vec!["openid".into(), "urn:telematik:versicherter".into()]);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RelyingPartyConfig {
    pub(crate) issuer: Url,
    pub(crate) redirect_uri: Url,
    pub(crate) federation_master: Url,
    pub(crate) scopes: Vec<String>,
    pub(crate) http_timeout: Duration,
    pub(crate) session_ttl: time::Duration,
    pub(crate) client_name: String,
}

impl RelyingPartyConfig {
    #[must_use]
    pub fn new(issuer: Url, redirect_uri: Url, federation_master: Url) -> Self {
        let client_name = issuer.host_str().unwrap_or_default().to_owned();
        Self {
            issuer,
            redirect_uri,
            federation_master,
            scopes: DEFAULT_SCOPES.iter().map(|s| (*s).to_owned()).collect(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            session_ttl: DEFAULT_SESSION_TTL,
            client_name,
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `RP_ISSUER`: the relying party's entity identifier, also its OAuth client ID
    /// - `RP_REDIRECT_URI`: the callback registered with the federation
    /// - `RP_FEDERATION_MASTER`: entity identifier of the trust anchor
    ///
    /// # Optional env vars
    /// - `RP_SCOPES`: comma-separated scopes
    /// - `RP_HTTP_TIMEOUT_SECS`: bound for every outbound call
    /// - `RP_SESSION_TTL_SECS`: lifetime of a login session
    /// - `RP_CLIENT_NAME`: display name in the entity configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a required variable is missing, any value
    /// does not parse or a duration is zero.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let url = |name: &str| -> Result<Url, Error> {
            var(name)
                .ok_or_else(|| Error::Config(format!("{name} is required")))?
                .parse()
                .map_err(|e| Error::Config(format!("{name}: {e}")))
        };
        let seconds = |name: &str| -> Result<Option<u64>, Error> {
            var(name)
                .map(|raw| {
                    match raw.trim().parse::<u64>() {
                        Ok(0) => Err(Error::Config(format!("{name} must be positive"))),
                        Ok(secs) => Ok(secs),
                        Err(e) => Err(Error::Config(format!("{name}: {e}"))),
                    }
                })
                .transpose()
        };

        let mut config = Self::new(
            url("RP_ISSUER")?,
            url("RP_REDIRECT_URI")?,
            url("RP_FEDERATION_MASTER")?,
        );

        if let Some(scopes) = var("RP_SCOPES") {
            config = config.with_scopes(
                scopes
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect(),
            );
        }
        if let Some(secs) = seconds("RP_HTTP_TIMEOUT_SECS")? {
            config = config.with_http_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = seconds("RP_SESSION_TTL_SECS")? {
            let secs = i64::try_from(secs)
                .map_err(|e| Error::Config(format!("RP_SESSION_TTL_SECS: {e}")))?;
            config = config.with_session_ttl(time::Duration::seconds(secs));
        }
        if let Some(name) = var("RP_CLIENT_NAME") {
            config = config.with_client_name(name);
        }
        Ok(config)
    }

    /// Override the requested scopes.
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    #[must_use]
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_session_ttl(mut self, ttl: time::Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &Url {
        &self.issuer
    }

    /// The OAuth client ID: the issuer without a trailing slash.
    #[must_use]
    pub fn client_id(&self) -> String {
        entity_id(self.issuer.as_str())
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    #[must_use]
    pub fn federation_master(&self) -> &Url {
        &self.federation_master
    }

    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        self.http_timeout
    }

    #[must_use]
    pub fn session_ttl(&self) -> time::Duration {
        self.session_ttl
    }

    #[must_use]
    pub fn client_name(&self) -> &str {
        &self.client_name
    }
}
