use super::{AccessToken, AuthOptions, TokenCredential};
use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const JWT_BEARER: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Lifetime assumed when a token response carries no expiry.
const FALLBACK_LIFETIME_SECS: i64 = 3600;

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(i64),
    Text(String),
}

impl NumberOrString {
    fn as_i64(&self) -> Option<i64> {
        match self {
            NumberOrString::Number(n) => Some(*n),
            NumberOrString::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<NumberOrString>,
    #[serde(default)]
    expires_on: Option<NumberOrString>,
}

impl TokenResponse {
    fn into_token(self) -> AccessToken {
        let expires_on = self
            .expires_on
            .and_then(|v| v.as_i64())
            .and_then(from_epoch)
            .or_else(|| {
                self.expires_in
                    .and_then(|v| v.as_i64())
                    .map(|secs| Utc::now() + Duration::seconds(secs))
            })
            .unwrap_or_else(fallback_expiry);
        AccessToken {
            token: self.access_token,
            expires_on,
        }
    }
}

fn from_epoch(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

fn fallback_expiry() -> DateTime<Utc> {
    Utc::now() + Duration::seconds(FALLBACK_LIFETIME_SECS)
}

/// The resource form of a `.default` scope, as the identity endpoints want it.
fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

async fn read_token_response(
    method: &'static str,
    response: reqwest::Response,
) -> Result<AccessToken, AuthError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(AuthError::Failed {
            method,
            message: format!("{}: {}", status, describe_error_body(&body)),
        });
    }
    let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| AuthError::Failed {
        method,
        message: format!("unexpected token response: {}", e),
    })?;
    Ok(parsed.into_token())
}

fn describe_error_body(body: &str) -> String {
    #[derive(Deserialize)]
    struct OAuthError {
        error: Option<String>,
        error_description: Option<String>,
    }
    match serde_json::from_str::<OAuthError>(body) {
        Ok(OAuthError {
            error_description: Some(description),
            ..
        }) => description,
        Ok(OAuthError {
            error: Some(error), ..
        }) => error,
        _ => body.trim().to_string(),
    }
}

/// Run a developer tool and return its stdout.
async fn run_tool(
    method: &'static str,
    program: &str,
    args: &[&str],
) -> Result<Vec<u8>, AuthError> {
    debug!("requesting token with `{}`", program);
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AuthError::Failed {
                method,
                message: format!("`{}` is not installed or not on PATH", program),
            },
            _ => AuthError::Io(e),
        })?;
    if !output.status.success() {
        return Err(AuthError::Failed {
            method,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

fn parse_tool_output<T: for<'de> Deserialize<'de>>(
    method: &'static str,
    stdout: &[u8],
) -> Result<T, AuthError> {
    serde_json::from_slice(stdout).map_err(|e| AuthError::Failed {
        method,
        message: format!("unexpected output: {}", e),
    })
}

/// Service principal with a client secret (`environment`).
pub struct ClientSecretCredential {
    http: reqwest::Client,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

impl ClientSecretCredential {
    const NAME: &'static str = "environment";

    pub fn from_options(options: &AuthOptions, http: reqwest::Client) -> Result<Self, AuthError> {
        Ok(Self {
            http,
            authority_host: options.authority_host(),
            tenant_id: options.require(Self::NAME, "tenant_id", "AZURE_TENANT_ID")?,
            client_id: options.require(Self::NAME, "client_id", "AZURE_CLIENT_ID")?,
            client_secret: options.require(Self::NAME, "client_secret", "AZURE_CLIENT_SECRET")?,
        })
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, AuthError> {
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host, self.tenant_id
        );
        let response = self
            .http
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope),
            ])
            .send()
            .await?;
        read_token_response(Self::NAME, response).await
    }
}

/// Federated credential read from a projected token file (`workload`).
pub struct WorkloadIdentityCredential {
    http: reqwest::Client,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    token_file: String,
}

impl WorkloadIdentityCredential {
    const NAME: &'static str = "workload";

    pub fn from_options(options: &AuthOptions, http: reqwest::Client) -> Result<Self, AuthError> {
        Ok(Self {
            http,
            authority_host: options.authority_host(),
            tenant_id: options.require(Self::NAME, "tenant_id", "AZURE_TENANT_ID")?,
            client_id: options.require(Self::NAME, "client_id", "AZURE_CLIENT_ID")?,
            token_file: options.require(Self::NAME, "token_file", "AZURE_FEDERATED_TOKEN_FILE")?,
        })
    }
}

#[async_trait]
impl TokenCredential for WorkloadIdentityCredential {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, AuthError> {
        // The file is rotated by the platform, so read it on every request.
        let assertion = tokio::fs::read_to_string(&self.token_file).await?;
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host, self.tenant_id
        );
        let response = self
            .http
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_assertion_type", JWT_BEARER),
                ("client_assertion", assertion.trim()),
                ("scope", scope),
            ])
            .send()
            .await?;
        read_token_response(Self::NAME, response).await
    }
}

enum IdentityEndpoint {
    Imds,
    AppService { endpoint: String, header: String },
}

/// Managed identity via IMDS, or the App Service identity endpoint when the
/// hosting environment advertises one (`managedid`).
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    client_id: Option<String>,
    endpoint: IdentityEndpoint,
}

impl ManagedIdentityCredential {
    const NAME: &'static str = "managedid";

    pub fn from_options(options: &AuthOptions, http: reqwest::Client) -> Self {
        let endpoint = match (
            options.get("identity_endpoint", "IDENTITY_ENDPOINT"),
            options.get("identity_header", "IDENTITY_HEADER"),
        ) {
            (Some(endpoint), Some(header)) => IdentityEndpoint::AppService { endpoint, header },
            _ => IdentityEndpoint::Imds,
        };
        Self {
            http,
            client_id: options.get("client_id", "AZURE_CLIENT_ID"),
            endpoint,
        }
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, AuthError> {
        let resource = scope_to_resource(scope);
        let mut query = vec![("resource", resource)];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }
        let request = match &self.endpoint {
            IdentityEndpoint::Imds => {
                query.push(("api-version", "2018-02-01"));
                self.http
                    .get(IMDS_ENDPOINT)
                    .header("Metadata", "true")
                    .timeout(std::time::Duration::from_secs(5))
            }
            IdentityEndpoint::AppService { endpoint, header } => {
                query.push(("api-version", "2019-08-01"));
                self.http
                    .get(endpoint.as_str())
                    .header("X-IDENTITY-HEADER", header.as_str())
            }
        };
        let response = request.query(&query).send().await?;
        read_token_response(Self::NAME, response).await
    }
}

/// `az account get-access-token` (`azurecli`).
pub struct AzureCliCredential {
    tenant_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureCliToken {
    access_token: String,
    /// Local time, `2024-01-01 12:00:00.000000`.
    expires_on: Option<String>,
    /// Epoch seconds, only printed by newer CLI releases.
    #[serde(rename = "expires_on")]
    expires_on_epoch: Option<i64>,
}

impl AzureCliCredential {
    const NAME: &'static str = "azurecli";

    pub fn from_options(options: &AuthOptions) -> Self {
        Self {
            tenant_id: options.get("tenant_id", "AZURE_TENANT_ID"),
        }
    }

    fn parse_output(stdout: &[u8]) -> Result<AccessToken, AuthError> {
        let parsed: AzureCliToken = parse_tool_output(Self::NAME, stdout)?;
        let expires_on = parsed
            .expires_on_epoch
            .and_then(from_epoch)
            .or_else(|| parsed.expires_on.as_deref().and_then(parse_local_time))
            .unwrap_or_else(fallback_expiry);
        Ok(AccessToken {
            token: parsed.access_token,
            expires_on,
        })
    }
}

fn parse_local_time(s: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl TokenCredential for AzureCliCredential {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, AuthError> {
        let program = if cfg!(windows) { "az.cmd" } else { "az" };
        let mut args = vec![
            "account",
            "get-access-token",
            "--output",
            "json",
            "--resource",
            scope_to_resource(scope),
        ];
        if let Some(tenant) = &self.tenant_id {
            args.extend(["--tenant", tenant.as_str()]);
        }
        let stdout = run_tool(Self::NAME, program, &args).await?;
        Self::parse_output(&stdout)
    }
}

/// `Get-AzAccessToken` through PowerShell (`azureps`).
pub struct AzurePowerShellCredential {
    tenant_id: Option<String>,
}

#[derive(Deserialize)]
struct PowerShellToken {
    token: String,
    expires_on: i64,
}

impl AzurePowerShellCredential {
    const NAME: &'static str = "azureps";

    pub fn from_options(options: &AuthOptions) -> Self {
        Self {
            tenant_id: options.get("tenant_id", "AZURE_TENANT_ID"),
        }
    }

    fn script(resource: &str, tenant_id: Option<&str>) -> String {
        let tenant = tenant_id
            .map(|t| format!(" -TenantId '{}'", t))
            .unwrap_or_default();
        format!(
            "$ErrorActionPreference = 'Stop'; \
             $t = Get-AzAccessToken -ResourceUrl '{}'{}; \
             $v = $t.Token; \
             if ($v -is [System.Security.SecureString]) {{ $v = [System.Net.NetworkCredential]::new('', $v).Password }}; \
             ConvertTo-Json -Compress @{{ token = $v; expires_on = $t.ExpiresOn.ToUnixTimeSeconds() }}",
            resource, tenant
        )
    }
}

#[async_trait]
impl TokenCredential for AzurePowerShellCredential {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, AuthError> {
        let script = Self::script(scope_to_resource(scope), self.tenant_id.as_deref());
        let stdout = run_tool(
            Self::NAME,
            "pwsh",
            &["-NoProfile", "-NonInteractive", "-Command", script.as_str()],
        )
        .await?;
        let parsed: PowerShellToken = parse_tool_output(Self::NAME, &stdout)?;
        Ok(AccessToken {
            token: parsed.token,
            expires_on: from_epoch(parsed.expires_on).unwrap_or_else(fallback_expiry),
        })
    }
}

/// `azd auth token` (`azuredevcli`).
pub struct AzureDeveloperCliCredential {
    tenant_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeveloperCliToken {
    token: String,
    expires_on: String,
}

impl AzureDeveloperCliCredential {
    const NAME: &'static str = "azuredevcli";

    pub fn from_options(options: &AuthOptions) -> Self {
        Self {
            tenant_id: options.get("tenant_id", "AZURE_TENANT_ID"),
        }
    }

    fn parse_output(stdout: &[u8]) -> Result<AccessToken, AuthError> {
        let parsed: DeveloperCliToken = parse_tool_output(Self::NAME, stdout)?;
        let expires_on = DateTime::parse_from_rfc3339(&parsed.expires_on)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| fallback_expiry());
        Ok(AccessToken {
            token: parsed.token,
            expires_on,
        })
    }
}

#[async_trait]
impl TokenCredential for AzureDeveloperCliCredential {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, AuthError> {
        let mut args = vec!["auth", "token", "--output", "json", "--scope", scope];
        if let Some(tenant) = &self.tenant_id {
            args.extend(["--tenant-id", tenant.as_str()]);
        }
        let stdout = run_tool(Self::NAME, "azd", &args).await?;
        Self::parse_output(&stdout)
    }
}

/// A bearer token supplied by the caller (`token`).
pub struct StaticTokenCredential {
    token: AccessToken,
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: i64,
}

impl StaticTokenCredential {
    const NAME: &'static str = "token";

    pub fn from_options(options: &AuthOptions) -> Result<Self, AuthError> {
        let token = options.require(Self::NAME, "token", "LAKE_ACL_TOKEN")?;
        Ok(Self::new(token))
    }

    /// The expiry comes from the token's `exp` claim. The signature is not
    /// checked; the service does that.
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let expires_on = read_expiry(&token).unwrap_or_else(fallback_expiry);
        Self {
            token: AccessToken { token, expires_on },
        }
    }
}

fn read_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let data = decode::<ExpiryClaim>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    from_epoch(data.claims.exp)
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn get_token(&self, _scope: &str) -> Result<AccessToken, AuthError> {
        Ok(self.token.clone())
    }
}

/// Tries each credential in turn and returns the first token obtained
/// (`default`).
pub struct ChainedCredential {
    sources: Vec<Arc<dyn TokenCredential>>,
}

impl ChainedCredential {
    const NAME: &'static str = "default";

    pub fn new(sources: Vec<Arc<dyn TokenCredential>>) -> Self {
        Self { sources }
    }

    /// Environment, workload identity, managed identity, then the developer
    /// tools. Sources whose options are incomplete are left out.
    pub fn default_chain(options: &AuthOptions, http: reqwest::Client) -> Self {
        let mut sources: Vec<Arc<dyn TokenCredential>> = Vec::new();
        match ClientSecretCredential::from_options(options, http.clone()) {
            Ok(c) => sources.push(Arc::new(c)),
            Err(e) => debug!("skipping credential: {}", e),
        }
        match WorkloadIdentityCredential::from_options(options, http.clone()) {
            Ok(c) => sources.push(Arc::new(c)),
            Err(e) => debug!("skipping credential: {}", e),
        }
        sources.push(Arc::new(ManagedIdentityCredential::from_options(
            options, http,
        )));
        sources.push(Arc::new(AzureCliCredential::from_options(options)));
        sources.push(Arc::new(AzurePowerShellCredential::from_options(options)));
        sources.push(Arc::new(AzureDeveloperCliCredential::from_options(options)));
        Self::new(sources)
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl TokenCredential for ChainedCredential {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, AuthError> {
        let mut failures = Vec::new();
        for source in &self.sources {
            match source.get_token(scope).await {
                Ok(token) => {
                    debug!("authenticated with `{}`", source.name());
                    return Ok(token);
                }
                Err(e) => {
                    debug!("credential `{}` unavailable: {}", source.name(), e);
                    failures.push(format!("{}: {}", source.name(), e));
                }
            }
        }
        Err(AuthError::ChainExhausted(failures.join("; ")))
    }
}
