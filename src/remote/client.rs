//! Remote Store - WebDAV-style HTTP file store
//!
//! Each station gets one collection `<endpoint>/<user_id>/`; snapshot files
//! are uploaded into it under their local file name.

use crate::config::RemoteConfig;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Remote store errors
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("server returned status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("local file missing: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid remote configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        RemoteError::Connection(e.to_string())
    }
}

/// Where replicated snapshots go.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Establish (or re-establish) the session, creating the station directory.
    async fn connect(&self) -> Result<(), RemoteError>;

    /// Upload one local file into the station directory.
    async fn upload(&self, local: &Path) -> Result<(), RemoteError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// HTTP client for a WebDAV collection.
#[derive(Clone)]
pub struct WebDavStore {
    http: reqwest::Client,
    base_url: String,
    user_dir: String,
    user_name: String,
    password: String,
}

impl WebDavStore {
    pub fn new(config: &RemoteConfig, user_dir: &str) -> Result<Self, RemoteError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| RemoteError::Config("remote.endpoint is not set".to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RemoteError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url: endpoint.trim_end_matches('/').to_string(),
            user_dir: user_dir.to_string(),
            user_name: config.user_name.clone(),
            password: config.password.clone(),
        })
    }

    fn dir_url(&self) -> String {
        format!("{}/{}/", self.base_url, self.user_dir)
    }

    fn file_url(&self, file_name: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.user_dir, file_name)
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.user_name.is_empty() {
            req
        } else {
            req.basic_auth(&self.user_name, Some(&self.password))
        }
    }
}

#[async_trait]
impl RemoteStore for WebDavStore {
    async fn connect(&self) -> Result<(), RemoteError> {
        let method = Method::from_bytes(b"MKCOL").map_err(|e| RemoteError::Config(e.to_string()))?;
        let url = self.dir_url();
        let resp = self.with_auth(self.http.request(method, &url)).send().await?;

        match resp.status() {
            // 405: collection already exists
            StatusCode::CREATED | StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            s if s.is_success() => Ok(()),
            s => Err(RemoteError::Status { status: s.as_u16(), url }),
        }
    }

    async fn upload(&self, local: &Path) -> Result<(), RemoteError> {
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RemoteError::MissingFile(local.to_path_buf()))?;

        let body = match tokio::fs::read(local).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RemoteError::MissingFile(local.to_path_buf()))
            }
            Err(e) => return Err(RemoteError::Io { path: local.to_path_buf(), source: e }),
        };

        let digest = md5::compute(&body);
        let mime = mime_guess::from_path(local).first_or_octet_stream();
        let url = self.file_url(file_name);

        let resp = self
            .with_auth(self.http.put(&url))
            .header(reqwest::header::CONTENT_TYPE, mime.as_ref())
            .header("OC-Checksum", format!("MD5:{digest:x}"))
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RemoteError::Status { status: status.as_u16(), url })
        }
    }

    fn describe(&self) -> String {
        self.dir_url()
    }
}
