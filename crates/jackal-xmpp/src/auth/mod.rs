//! SASL authentication mechanisms.
//!
//! Implements SASL authentication for client streams:
//! - SASL PLAIN (RFC 4616), verified against the stored SCRAM-SHA-256 keys
//! - SASL SCRAM-SHA-1, SCRAM-SHA-256 and SCRAM-SHA-512 (RFC 5802, RFC 7677)

pub mod scram;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

pub use scram::{PasswordMaterial, ScramCredentials, ScramHash, ScramServer, ScramState, DEFAULT_ITERATIONS};

use crate::jid::Jid;
use crate::storage::{Storage, User};
use crate::types::SaslMechanism;
use crate::xml::{ns, XElement};

/// SASL failure conditions (RFC 6120 Section 6.5).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SaslError {
    #[error("authentication aborted")]
    Aborted,

    #[error("incorrect encoding")]
    IncorrectEncoding,

    #[error("invalid authorization identity")]
    InvalidAuthzid,

    #[error("unsupported mechanism")]
    InvalidMechanism,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("not authorized")]
    NotAuthorized,

    #[error("temporary authentication failure: {0}")]
    TemporaryAuthFailure(String),
}

impl SaslError {
    /// Wire name of the `<failure/>` child.
    pub fn condition(&self) -> &'static str {
        match self {
            SaslError::Aborted => "aborted",
            SaslError::IncorrectEncoding => "incorrect-encoding",
            SaslError::InvalidAuthzid => "invalid-authzid",
            SaslError::InvalidMechanism => "invalid-mechanism",
            SaslError::MalformedRequest(_) => "malformed-request",
            SaslError::NotAuthorized => "not-authorized",
            SaslError::TemporaryAuthFailure(_) => "temporary-auth-failure",
        }
    }

    pub fn to_failure_element(&self) -> XElement {
        XElement::builder("failure")
            .attr("xmlns", ns::SASL)
            .child(XElement::new(self.condition()))
            .build()
    }
}

/// Result of feeding one client message to an authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send `<challenge/>` with this payload and wait for a `<response/>`.
    Challenge(Vec<u8>),
    /// Authentication finished; `<success/>` carries the optional data.
    Success {
        username: String,
        additional_data: Option<Vec<u8>>,
    },
}

/// Server side of one SASL mechanism exchange.
#[async_trait]
pub trait Authenticator: Send {
    fn mechanism(&self) -> SaslMechanism;

    /// Process the decoded payload of an `<auth/>` or `<response/>`.
    async fn process(&mut self, input: &[u8]) -> Result<AuthStep, SaslError>;
}

/// Create the authenticator for `mechanism`, serving users of `domain`.
pub fn authenticator(
    mechanism: SaslMechanism,
    domain: &str,
    storage: Arc<dyn Storage>,
) -> Box<dyn Authenticator> {
    match mechanism {
        SaslMechanism::Plain => Box::new(PlainAuthenticator {
            domain: domain.to_string(),
            storage,
        }),
        SaslMechanism::ScramSha1 => Box::new(ScramAuthenticator::new(mechanism, ScramHash::Sha1, domain, storage)),
        SaslMechanism::ScramSha256 => {
            Box::new(ScramAuthenticator::new(mechanism, ScramHash::Sha256, domain, storage))
        }
        SaslMechanism::ScramSha512 => {
            Box::new(ScramAuthenticator::new(mechanism, ScramHash::Sha512, domain, storage))
        }
    }
}

/// Parsed SASL PLAIN credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslCredentials {
    pub authzid: Option<String>,
    pub authcid: String,
    pub password: String,
}

/// Parse SASL PLAIN credentials.
///
/// SASL PLAIN format: `authzid \0 authcid \0 password`
pub fn parse_plain(data: &[u8]) -> Result<SaslCredentials, SaslError> {
    let parts: Vec<&[u8]> = data.split(|&b| b == 0).collect();
    if parts.len() != 3 {
        return Err(SaslError::MalformedRequest("invalid SASL PLAIN format".into()));
    }
    let text = |bytes: &[u8]| String::from_utf8(bytes.to_vec()).map_err(|_| SaslError::IncorrectEncoding);

    let authzid = text(parts[0])?;
    let authcid = text(parts[1])?;
    let password = text(parts[2])?;
    if authcid.is_empty() || password.is_empty() {
        return Err(SaslError::MalformedRequest("empty credentials".into()));
    }
    Ok(SaslCredentials {
        authzid: (!authzid.is_empty()).then_some(authzid),
        authcid,
        password,
    })
}

/// Prepare an authentication identity into a local username.
fn prepare_username(username: &str, domain: &str) -> Result<String, SaslError> {
    let jid = Jid::new(username, domain, "", false).map_err(|_| SaslError::NotAuthorized)?;
    Ok(jid.node().to_string())
}

/// An authzid must name the authenticated account itself.
fn check_authzid(authzid: Option<&str>, username: &str, domain: &str) -> Result<(), SaslError> {
    match authzid {
        None => Ok(()),
        Some(authzid) => {
            let jid = Jid::parse(authzid).map_err(|_| SaslError::InvalidAuthzid)?;
            if jid.node() == username && jid.domain() == domain && jid.is_bare() {
                Ok(())
            } else {
                Err(SaslError::InvalidAuthzid)
            }
        }
    }
}

async fn fetch_user(storage: &Arc<dyn Storage>, username: &str) -> Result<User, SaslError> {
    storage
        .fetch_user(username)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to fetch user during authentication");
            SaslError::TemporaryAuthFailure(e.to_string())
        })?
        .ok_or(SaslError::NotAuthorized)
}

struct PlainAuthenticator {
    domain: String,
    storage: Arc<dyn Storage>,
}

#[async_trait]
impl Authenticator for PlainAuthenticator {
    fn mechanism(&self) -> SaslMechanism {
        SaslMechanism::Plain
    }

    async fn process(&mut self, input: &[u8]) -> Result<AuthStep, SaslError> {
        let credentials = parse_plain(input)?;
        let username = prepare_username(&credentials.authcid, &self.domain)?;
        check_authzid(credentials.authzid.as_deref(), &username, &self.domain)?;

        let user = fetch_user(&self.storage, &username).await?;
        if !user.password.sha256.verify_password(ScramHash::Sha256, &credentials.password)? {
            debug!(username = %username, "PLAIN authentication failed");
            return Err(SaslError::NotAuthorized);
        }
        Ok(AuthStep::Success {
            username,
            additional_data: None,
        })
    }
}

struct ScramAuthenticator {
    mechanism: SaslMechanism,
    hash: ScramHash,
    domain: String,
    storage: Arc<dyn Storage>,
    server: ScramServer,
}

impl ScramAuthenticator {
    fn new(mechanism: SaslMechanism, hash: ScramHash, domain: &str, storage: Arc<dyn Storage>) -> Self {
        Self {
            mechanism,
            hash,
            domain: domain.to_string(),
            storage,
            server: ScramServer::new(hash),
        }
    }
}

#[async_trait]
impl Authenticator for ScramAuthenticator {
    fn mechanism(&self) -> SaslMechanism {
        self.mechanism
    }

    async fn process(&mut self, input: &[u8]) -> Result<AuthStep, SaslError> {
        let message = std::str::from_utf8(input).map_err(|_| SaslError::IncorrectEncoding)?;
        match self.server.state() {
            ScramState::Initial => {
                let username = prepare_username(&self.server.process_client_first(message)?, &self.domain)?;
                let user = fetch_user(&self.storage, &username).await?;
                let server_first = self
                    .server
                    .server_first(user.password.for_hash(self.hash).clone())?;
                Ok(AuthStep::Challenge(server_first.into_bytes()))
            }
            ScramState::WaitingForClientFinal => {
                let server_final = self.server.process_client_final(message)?;
                let username = prepare_username(self.server.username(), &self.domain)?;
                Ok(AuthStep::Success {
                    username,
                    additional_data: Some(server_final.into_bytes()),
                })
            }
            ScramState::ClientFirstReceived | ScramState::Complete => {
                Err(SaslError::MalformedRequest("unexpected SCRAM message".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, UserRepository};

    async fn storage_with_user() -> Arc<dyn Storage> {
        let storage = MemoryStorage::new();
        storage
            .upsert_user(&User::new("ortuman", PasswordMaterial::derive("pencil", 64).unwrap()))
            .await
            .unwrap();
        Arc::new(storage)
    }

    #[test]
    fn test_parse_plain() {
        let creds = parse_plain(b"\0ortuman\0pencil").unwrap();
        assert_eq!(creds.authzid, None);
        assert_eq!(creds.authcid, "ortuman");
        assert_eq!(creds.password, "pencil");

        assert!(matches!(parse_plain(b"ortuman"), Err(SaslError::MalformedRequest(_))));
        assert_eq!(parse_plain(b"\0\xff\0pencil"), Err(SaslError::IncorrectEncoding));
    }

    #[test]
    fn test_failure_element() {
        let el = SaslError::NotAuthorized.to_failure_element();
        assert_eq!(el.to_string(), format!("<failure xmlns=\"{}\"><not-authorized/></failure>", ns::SASL));
    }

    #[tokio::test]
    async fn test_plain_success_and_failure() {
        let storage = storage_with_user().await;

        let mut auth = authenticator(SaslMechanism::Plain, "jackal.im", storage.clone());
        let step = auth.process(b"\0ortuman\0pencil").await.unwrap();
        assert_eq!(
            step,
            AuthStep::Success {
                username: "ortuman".into(),
                additional_data: None
            }
        );

        let mut auth = authenticator(SaslMechanism::Plain, "jackal.im", storage.clone());
        assert_eq!(auth.process(b"\0ortuman\0crayon").await, Err(SaslError::NotAuthorized));

        let mut auth = authenticator(SaslMechanism::Plain, "jackal.im", storage.clone());
        assert_eq!(auth.process(b"\0hamlet\0pencil").await, Err(SaslError::NotAuthorized));

        let mut auth = authenticator(SaslMechanism::Plain, "jackal.im", storage);
        assert_eq!(
            auth.process(b"hamlet@jackal.im\0ortuman\0pencil").await,
            Err(SaslError::InvalidAuthzid)
        );
    }

    #[tokio::test]
    async fn test_scram_exchange() {
        let storage = storage_with_user().await;
        let mut auth = authenticator(SaslMechanism::ScramSha256, "jackal.im", storage);

        let client_first_bare = "n=ortuman,r=rOprNGfwEbeRWgbNEkqO";
        let server_first = match auth.process(format!("n,,{client_first_bare}").as_bytes()).await.unwrap() {
            AuthStep::Challenge(data) => String::from_utf8(data).unwrap(),
            other => panic!("unexpected step {other:?}"),
        };
        let (client_final, signature) =
            scram::tests::client_final(ScramHash::Sha256, "pencil", client_first_bare, &server_first);

        match auth.process(client_final.as_bytes()).await.unwrap() {
            AuthStep::Success {
                username,
                additional_data,
            } => {
                assert_eq!(username, "ortuman");
                use base64::prelude::*;
                assert_eq!(
                    additional_data.unwrap(),
                    format!("v={}", BASE64_STANDARD.encode(signature)).into_bytes()
                );
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scram_unknown_user() {
        let storage = storage_with_user().await;
        let mut auth = authenticator(SaslMechanism::ScramSha1, "jackal.im", storage);
        assert_eq!(
            auth.process(b"n,,n=hamlet,r=abc").await,
            Err(SaslError::NotAuthorized)
        );
    }
}
