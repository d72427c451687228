#![doc = include_str!("../README.md")]

pub mod cache;
pub mod clock;
pub mod config;
pub mod entity_configuration;
pub mod error;
pub mod federation;
pub mod flow;
pub mod http;
pub mod jwe;
pub mod jwk;
pub mod jws;
pub mod pkce;
pub mod session;
pub mod statement;
pub mod token;
pub mod types;

#[cfg(test)]
mod fixtures;

// Re-exports for convenient access
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::RelyingPartyConfig;
pub use entity_configuration::EntityConfiguration;
pub use error::Error;
pub use federation::TrustResolver;
pub use flow::{AuthenticationFlow, CodeExchangeStep, FlowState, SelectIdpStep};
#[cfg(feature = "reqwest")]
pub use http::ReqwestHttpClient;
pub use http::{HttpClient, HttpRequest, HttpResponse, TransportError};
pub use jwk::{DecryptionKeys, EcKeyPair, Jwk, KeySet, PrivateKeySet};
pub use jws::{SignedStatement, verify};
pub use session::{MemorySessionStore, Session, SessionStore};
pub use statement::{EntityStatement, IdpList, IdpOption};
pub use token::{IdToken, IdTokenClaims};
pub use types::{KeyId, SessionId};
