//! Token credentials for the storage service.
//!
//! Methods are selected by name, with per-method options given as key/value
//! pairs that take precedence over the usual Azure environment variables.

use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod credentials;

pub use credentials::{
    AzureCliCredential, AzureDeveloperCliCredential, AzurePowerShellCredential,
    ChainedCredential, ClientSecretCredential, ManagedIdentityCredential, StaticTokenCredential,
    WorkloadIdentityCredential,
};

/// OAuth scope for the storage data plane.
pub const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    /// Whether the token expires within `margin` from now.
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_on - margin <= Utc::now()
    }
}

#[async_trait]
pub trait TokenCredential: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_token(&self, scope: &str) -> Result<AccessToken, AuthError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    Default,
    Environment,
    Workload,
    ManagedIdentity,
    AzureCli,
    AzurePowerShell,
    AzureDeveloperCli,
    Token,
}

impl AuthMethod {
    pub const ALL: [AuthMethod; 8] = [
        AuthMethod::Default,
        AuthMethod::Environment,
        AuthMethod::Workload,
        AuthMethod::ManagedIdentity,
        AuthMethod::AzureCli,
        AuthMethod::AzurePowerShell,
        AuthMethod::AzureDeveloperCli,
        AuthMethod::Token,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Default => "default",
            AuthMethod::Environment => "environment",
            AuthMethod::Workload => "workload",
            AuthMethod::ManagedIdentity => "managedid",
            AuthMethod::AzureCli => "azurecli",
            AuthMethod::AzurePowerShell => "azureps",
            AuthMethod::AzureDeveloperCli => "azuredevcli",
            AuthMethod::Token => "token",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AuthError> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| AuthError::UnknownMethod(s.to_string()))
    }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential options: explicit values first, then environment variables.
#[derive(Clone, Debug)]
pub struct AuthOptions {
    values: BTreeMap<String, String>,
    use_env: bool,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
            use_env: true,
        }
    }
}

impl AuthOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options that never consult the process environment.
    pub fn isolated() -> Self {
        Self {
            values: BTreeMap::new(),
            use_env: false,
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Look up `key`, falling back to the environment variable `env`.
    pub fn get(&self, key: &str, env: &str) -> Option<String> {
        if let Some(value) = self.values.get(key) {
            return Some(value.clone());
        }
        if self.use_env {
            return std::env::var(env).ok().filter(|v| !v.is_empty());
        }
        None
    }

    pub fn require(
        &self,
        method: &'static str,
        key: &'static str,
        env: &str,
    ) -> Result<String, AuthError> {
        self.get(key, env).ok_or(AuthError::MissingOption {
            method,
            option: key,
        })
    }

    pub fn authority_host(&self) -> String {
        self.get("authority_host", "AZURE_AUTHORITY_HOST")
            .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string())
            .trim_end_matches('/')
            .to_string()
    }
}

/// Build the credential for `method`.
pub fn credential_for(
    method: AuthMethod,
    options: &AuthOptions,
) -> Result<Arc<dyn TokenCredential>, AuthError> {
    let http = reqwest::Client::new();
    let credential: Arc<dyn TokenCredential> = match method {
        AuthMethod::Default => Arc::new(ChainedCredential::default_chain(options, http)),
        AuthMethod::Environment => Arc::new(ClientSecretCredential::from_options(options, http)?),
        AuthMethod::Workload => Arc::new(WorkloadIdentityCredential::from_options(options, http)?),
        AuthMethod::ManagedIdentity => {
            Arc::new(ManagedIdentityCredential::from_options(options, http))
        }
        AuthMethod::AzureCli => Arc::new(AzureCliCredential::from_options(options)),
        AuthMethod::AzurePowerShell => Arc::new(AzurePowerShellCredential::from_options(options)),
        AuthMethod::AzureDeveloperCli => {
            Arc::new(AzureDeveloperCliCredential::from_options(options))
        }
        AuthMethod::Token => Arc::new(StaticTokenCredential::from_options(options)?),
    };
    Ok(credential)
}
