//! Credential providers
//!
//! The access layer only replays what it is given; obtaining or refreshing
//! tokens is the caller's business.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::CredentialSettings;
use crate::error::Result;

/// Yields the headers attached to every outbound request
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn headers(&self) -> Result<Vec<(String, String)>>;
}

/// Anonymous access
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn headers(&self) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }
}

/// `Authorization: Bearer <token>`
#[derive(Clone)]
pub struct BearerToken {
    token: String,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerToken").field("token", &"<redacted>").finish()
    }
}

#[async_trait]
impl CredentialProvider for BearerToken {
    async fn headers(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![(
            "Authorization".to_string(),
            format!("Bearer {}", self.token),
        )])
    }
}

/// Fixed set of headers (e.g. a marketplace session)
#[derive(Clone, Default)]
pub struct StaticHeaders {
    headers: BTreeMap<String, String>,
}

impl StaticHeaders {
    pub fn new(headers: BTreeMap<String, String>) -> Self {
        Self { headers }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl std::fmt::Debug for StaticHeaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticHeaders")
            .field("names", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticHeaders {
    async fn headers(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Build the provider described by `settings`
pub fn from_settings(settings: &CredentialSettings) -> Arc<dyn CredentialProvider> {
    match settings {
        CredentialSettings::None => Arc::new(NoCredentials),
        CredentialSettings::Bearer { token } => Arc::new(BearerToken::new(token.clone())),
        CredentialSettings::Headers { headers } => Arc::new(StaticHeaders::new(headers.clone())),
    }
}
