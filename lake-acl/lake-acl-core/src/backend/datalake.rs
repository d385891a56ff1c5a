//! ADLS Gen2 REST backend.

use super::{
    AclBackend, BackendResult, ContainerHandle, DirectoryHandle, PathItem, RecursiveUpdate,
};
use crate::acl::{AclEntry, AclSet};
use crate::auth::{AccessToken, TokenCredential, STORAGE_SCOPE};
use crate::error::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, IF_NONE_MATCH};
use reqwest::{Method, Response, Url};
use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_DFS_SUFFIX: &str = "dfs.core.windows.net";
pub const DEFAULT_API_VERSION: &str = "2021-06-08";

/// Error codes the service uses for "already exists" conflicts.
const ALREADY_EXISTS_CODES: [&str; 3] = [
    "PathAlreadyExists",
    "FilesystemAlreadyExists",
    "ContainerAlreadyExists",
];

/// Refresh the cached token this long before it expires.
const TOKEN_REFRESH_MARGIN_MINUTES: i64 = 5;

#[derive(Clone, Debug)]
pub struct DataLakeConfig {
    pub account: String,
    pub dfs_suffix: String,
    pub api_version: String,
}

impl DataLakeConfig {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            dfs_suffix: DEFAULT_DFS_SUFFIX.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }

    pub fn account_url(&self) -> String {
        format!("https://{}.{}", self.account, self.dfs_suffix)
    }
}

pub struct DataLakeBackend {
    http: reqwest::Client,
    base: Url,
    api_version: String,
    credential: Arc<dyn TokenCredential>,
    token: Mutex<Option<AccessToken>>,
}

impl DataLakeBackend {
    pub fn new(config: DataLakeConfig, credential: Arc<dyn TokenCredential>) -> BackendResult<Self> {
        let url = config.account_url();
        let base = Url::parse(&url)
            .map_err(|e| BackendError::Decode(format!("invalid account url `{}`: {}", url, e)))?;
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base,
            api_version: config.api_version,
            credential,
            token: Mutex::new(None),
        })
    }

    pub fn account_url(&self) -> &Url {
        &self.base
    }

    async fn bearer(&self) -> BackendResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if !token.expires_within(chrono::Duration::minutes(TOKEN_REFRESH_MARGIN_MINUTES)) {
                return Ok(token.token.clone());
            }
        }
        debug!("acquiring storage token via `{}`", self.credential.name());
        let token = self.credential.get_token(STORAGE_SCOPE).await?;
        let bearer = token.token.clone();
        *cached = Some(token);
        Ok(bearer)
    }

    fn container_url(&self, container: &str) -> Url {
        resource_url(&self.base, container, None)
    }

    fn directory_url(&self, dir: &DirectoryHandle) -> Url {
        resource_url(&self.base, &dir.container, Some(&dir.path))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
    ) -> BackendResult<Response> {
        let bearer = self.bearer().await?;
        debug!("{} {}", method, url);
        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(bearer)
            .header("x-ms-version", self.api_version.as_str())
            .header("x-ms-date", rfc1123(Utc::now()))
            .headers(headers);
        if method == Method::PUT || method == Method::PATCH {
            request = request.header(CONTENT_LENGTH, "0");
        }
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response).await)
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: Url,
    ) -> BackendResult<(T, Option<String>)> {
        let response = self.send(Method::GET, url, HeaderMap::new()).await?;
        let continuation = continuation_header(&response);
        let body = response.text().await?;
        let parsed = serde_json::from_str(&body).map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok((parsed, continuation))
    }
}

/// `base/container[/path]`. The container root gets a trailing slash.
fn resource_url(base: &Url, container: &str, path: Option<&str>) -> Url {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(container);
        match path {
            Some("") => {
                segments.push("");
            }
            Some(path) => {
                segments.extend(path.split('/'));
            }
            None => {}
        }
    }
    url
}

fn with_query(mut url: Url, pairs: &[(&str, &str)]) -> Url {
    url.query_pairs_mut().extend_pairs(pairs);
    url
}

fn rfc1123(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn acl_header(list: &str) -> BackendResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    let value = list
        .parse()
        .map_err(|_| BackendError::Decode(format!("entry list `{}` is not a valid header", list)))?;
    headers.insert("x-ms-acl", value);
    Ok(headers)
}

fn continuation_header(response: &Response) -> Option<String> {
    response
        .headers()
        .get("x-ms-continuation")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

async fn error_from_response(response: Response) -> BackendError {
    let status = response.status().as_u16();
    let header_code = response
        .headers()
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    let (body_code, message) = parse_error_body(&body);
    classify(status, header_code.or(body_code).unwrap_or_default(), message)
}

fn parse_error_body(body: &str) -> (Option<String>, String) {
    #[derive(Deserialize)]
    struct Envelope {
        error: ErrorBody,
    }
    #[derive(Deserialize)]
    struct ErrorBody {
        code: Option<String>,
        message: Option<String>,
    }
    match serde_json::from_str::<Envelope>(body) {
        Ok(envelope) => (
            envelope.error.code,
            envelope
                .error
                .message
                .map(|m| m.lines().next().unwrap_or_default().to_string())
                .unwrap_or_default(),
        ),
        Err(_) => (None, body.trim().to_string()),
    }
}

fn classify(status: u16, code: String, message: String) -> BackendError {
    let describe = |code: &str, message: &str| {
        if message.is_empty() {
            code.to_string()
        } else {
            format!("{}: {}", code, message)
        }
    };
    match status {
        409 if ALREADY_EXISTS_CODES.contains(&code.as_str()) => {
            BackendError::AlreadyExists(describe(&code, &message))
        }
        404 => BackendError::NotFound(describe(&code, &message)),
        408 | 429 | 500..=599 => BackendError::Transient {
            status,
            message: describe(&code, &message),
        },
        _ => BackendError::Rejected {
            status,
            code,
            message,
        },
    }
}

fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }
    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(b)) => b,
        Some(Flag::Text(s)) => s.eq_ignore_ascii_case("true"),
        None => false,
    })
}

#[derive(Deserialize)]
struct PathPage {
    #[serde(default)]
    paths: Vec<PathRecord>,
}

#[derive(Deserialize)]
struct PathRecord {
    name: String,
    #[serde(default, rename = "isDirectory", deserialize_with = "flag")]
    is_directory: bool,
}

#[derive(Deserialize)]
struct FilesystemPage {
    #[serde(default)]
    filesystems: Vec<FilesystemRecord>,
}

#[derive(Deserialize)]
struct FilesystemRecord {
    name: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RecursiveResponse {
    #[serde(default)]
    directories_successful: u64,
    #[serde(default)]
    files_successful: u64,
    #[serde(default)]
    failure_count: u64,
    #[serde(default)]
    failed_entries: Vec<FailedEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailedEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    error_message: String,
}

fn parse_recursive_response(body: &str) -> BackendResult<RecursiveResponse> {
    if body.trim().is_empty() {
        return Ok(RecursiveResponse::default());
    }
    serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))
}

#[async_trait]
impl AclBackend for DataLakeBackend {
    async fn create_container_if_absent(&self, name: &str) -> BackendResult<ContainerHandle> {
        let url = with_query(self.container_url(name), &[("resource", "filesystem")]);
        match self.send(Method::PUT, url, HeaderMap::new()).await {
            Ok(_) => debug!("created container {}", name),
            Err(BackendError::AlreadyExists(_)) => debug!("container {} already exists", name),
            Err(e) => return Err(e),
        }
        Ok(ContainerHandle::new(name))
    }

    async fn create_directory_if_absent(
        &self,
        container: &ContainerHandle,
        path: &str,
    ) -> BackendResult<DirectoryHandle> {
        let dir = DirectoryHandle {
            container: container.name.clone(),
            path: path.to_string(),
        };
        let url = with_query(self.directory_url(&dir), &[("resource", "directory")]);
        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("*"));
        match self.send(Method::PUT, url, headers).await {
            Ok(_) => debug!("created directory {}", dir),
            Err(BackendError::AlreadyExists(_)) => debug!("directory {} already exists", dir),
            Err(e) => return Err(e),
        }
        Ok(dir)
    }

    async fn get_entries(&self, dir: &DirectoryHandle) -> BackendResult<String> {
        let url = with_query(
            self.directory_url(dir),
            &[("action", "getAccessControl"), ("upn", "false")],
        );
        let response = self.send(Method::HEAD, url, HeaderMap::new()).await?;
        let acl = response
            .headers()
            .get("x-ms-acl")
            .ok_or_else(|| BackendError::Decode(format!("{}: response has no x-ms-acl", dir)))?
            .to_str()
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(acl.to_string())
    }

    async fn set_entry(&self, dir: &DirectoryHandle, entry: &AclEntry) -> BackendResult<()> {
        let current = self.get_entries(dir).await?;
        let mut entries =
            AclSet::parse_wire(&current).map_err(|e| BackendError::Decode(e.to_string()))?;
        entries.insert(entry.clone());
        let url = with_query(self.directory_url(dir), &[("action", "setAccessControl")]);
        self.send(Method::PATCH, url, acl_header(&entries.render_wire())?)
            .await?;
        Ok(())
    }

    async fn update_entries_recursive(
        &self,
        dir: &DirectoryHandle,
        entry: &AclEntry,
        continuation: Option<&str>,
    ) -> BackendResult<RecursiveUpdate> {
        let mut query = vec![
            ("action", "setAccessControlRecursive"),
            ("mode", "modify"),
            ("forceFlag", "true"),
        ];
        if let Some(token) = continuation {
            query.push(("continuation", token));
        }
        let url = with_query(self.directory_url(dir), &query);
        let response = self
            .send(Method::PATCH, url, acl_header(&entry.render_wire())?)
            .await?;
        let continuation = continuation_header(&response);
        let body = response.text().await?;
        let parsed = parse_recursive_response(&body)?;
        for failed in &parsed.failed_entries {
            warn!(
                "failed to update {} at {}/{}: {}",
                entry, dir.container, failed.name, failed.error_message
            );
        }
        Ok(RecursiveUpdate {
            continuation,
            directories_successful: parsed.directories_successful,
            files_successful: parsed.files_successful,
            failure_count: parsed.failure_count,
        })
    }

    async fn list_paths(&self, container: &ContainerHandle) -> BackendResult<Vec<PathItem>> {
        let mut items = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut query = vec![("resource", "filesystem"), ("recursive", "true")];
            if let Some(token) = continuation.as_deref() {
                query.push(("continuation", token));
            }
            let url = with_query(self.container_url(&container.name), &query);
            let (page, next): (PathPage, _) = self.get_json(url).await?;
            items.extend(page.paths.into_iter().map(|p| PathItem {
                name: p.name,
                is_directory: p.is_directory,
            }));
            match next {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(items)
    }

    async fn list_containers(&self) -> BackendResult<Vec<ContainerHandle>> {
        let mut containers = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut query = vec![("resource", "account")];
            if let Some(token) = continuation.as_deref() {
                query.push(("continuation", token));
            }
            let url = with_query(self.base.clone(), &query);
            let (page, next): (FilesystemPage, _) = self.get_json(url).await?;
            containers.extend(page.filesystems.into_iter().map(|f| ContainerHandle::new(f.name)));
            match next {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(containers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenCredential;
    use chrono::TimeZone;

    fn backend() -> DataLakeBackend {
        let mut config = DataLakeConfig::new("acct");
        config.dfs_suffix = "dfs.example.net".to_string();
        DataLakeBackend::new(config, Arc::new(StaticTokenCredential::new("t"))).unwrap()
    }

    fn dir(path: &str) -> DirectoryHandle {
        DirectoryHandle {
            container: "data".to_string(),
            path: path.to_string(),
        }
    }

    #[test]
    fn urls() {
        let backend = backend();
        assert_eq!(backend.account_url().as_str(), "https://acct.dfs.example.net/");
        assert_eq!(
            backend.container_url("data").as_str(),
            "https://acct.dfs.example.net/data"
        );
        assert_eq!(
            backend.directory_url(&dir("")).as_str(),
            "https://acct.dfs.example.net/data/"
        );
        assert_eq!(
            backend.directory_url(&dir("raw/2024 q1")).as_str(),
            "https://acct.dfs.example.net/data/raw/2024%20q1"
        );
        let url = with_query(
            backend.directory_url(&dir("raw")),
            &[("action", "setAccessControlRecursive"), ("continuation", "a+b/c=")],
        );
        assert_eq!(
            url.query(),
            Some("action=setAccessControlRecursive&continuation=a%2Bb%2Fc%3D")
        );
    }

    #[test]
    fn date_header_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(rfc1123(at), "Tue, 05 Mar 2024 07:08:09 GMT");
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify(409, "PathAlreadyExists".into(), String::new()),
            BackendError::AlreadyExists(_)
        ));
        assert!(matches!(
            classify(409, "LeaseIdMissing".into(), String::new()),
            BackendError::Rejected { status: 409, .. }
        ));
        assert!(matches!(
            classify(404, "PathNotFound".into(), String::new()),
            BackendError::NotFound(_)
        ));
        for status in [408, 429, 500, 503] {
            let err = classify(status, "ServerBusy".into(), "busy".into());
            assert!(err.is_transient(), "status {}", status);
        }
        let err = classify(403, "AuthorizationPermissionMismatch".into(), "denied".into());
        assert!(!err.is_transient());
    }

    #[test]
    fn error_body_first_line_only() {
        let (code, message) = parse_error_body(
            r#"{"error":{"code":"PathAlreadyExists","message":"The specified path already exists.\nRequestId:1"}}"#,
        );
        assert_eq!(code.as_deref(), Some("PathAlreadyExists"));
        assert_eq!(message, "The specified path already exists.");

        let (code, message) = parse_error_body("upstream timeout");
        assert_eq!(code, None);
        assert_eq!(message, "upstream timeout");
    }

    #[test]
    fn path_listing_accepts_string_and_bool_flags() {
        let page: PathPage = serde_json::from_str(
            r#"{"paths":[
                {"name":"raw","isDirectory":"true"},
                {"name":"raw/a.csv","contentLength":"10"},
                {"name":"curated","isDirectory":true}
            ]}"#,
        )
        .unwrap();
        let dirs: Vec<_> = page
            .paths
            .iter()
            .filter(|p| p.is_directory)
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(dirs, vec!["raw", "curated"]);
    }

    #[test]
    fn recursive_response() {
        let parsed = parse_recursive_response(
            r#"{"directoriesSuccessful":2,"filesSuccessful":5,"failureCount":1,
                "failedEntries":[{"errorMessage":"denied","name":"raw/x","type":"FILE"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.directories_successful, 2);
        assert_eq!(parsed.files_successful, 5);
        assert_eq!(parsed.failure_count, 1);
        assert_eq!(parsed.failed_entries[0].name, "raw/x");
        assert_eq!(parse_recursive_response("").unwrap().failure_count, 0);
    }

    #[test]
    fn entry_list_header() {
        let headers = acl_header("user::rwx,default:user:abc:r-x").unwrap();
        assert_eq!(
            headers.get("x-ms-acl").unwrap(),
            "user::rwx,default:user:abc:r-x"
        );
    }

    #[tokio::test]
    async fn token_is_cached() {
        let backend = backend();
        assert_eq!(backend.bearer().await.unwrap(), "t");
        assert!(backend.token.lock().await.is_some());
        assert_eq!(backend.bearer().await.unwrap(), "t");
    }
}
