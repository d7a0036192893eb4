//! Credential providers
//!
//! The executor asks its provider for credentials once per attempt, so a
//! provider that rotates keys is picked up by the next retry.

use crate::error::{Result, StratusError};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

/// Access key pair plus optional session token
#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: SecretString,
    pub session_token: Option<SecretString>,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        let secret_key: String = secret_key.into();
        Self {
            access_key: access_key.into(),
            secret_key: SecretString::new(secret_key.into_boxed_str()),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        let token: String = token.into();
        self.session_token = Some(SecretString::new(token.into_boxed_str()));
        self
    }

    pub fn secret(&self) -> &str {
        self.secret_key.expose_secret()
    }

    pub fn token(&self) -> Option<&str> {
        self.session_token.as_ref().map(|t| t.expose_secret())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"[REDACTED]")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Source of credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    async fn current_credentials(&self) -> Result<Credentials>;
}

/// Fixed credentials
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    credentials: Credentials,
}

impl StaticCredentialProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn current_credentials(&self) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// Reads `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and
/// `AWS_SESSION_TOKEN` on every call
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialProvider;

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn current_credentials(&self) -> Result<Credentials> {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| StratusError::Credentials("AWS_ACCESS_KEY_ID is not set".to_string()))?;
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            StratusError::Credentials("AWS_SECRET_ACCESS_KEY is not set".to_string())
        })?;

        let credentials = Credentials::new(access_key, secret_key);
        Ok(match std::env::var("AWS_SESSION_TOKEN") {
            Ok(token) if !token.is_empty() => credentials.with_session_token(token),
            _ => credentials,
        })
    }
}
