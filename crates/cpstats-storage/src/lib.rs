//! HTTP fetch utilities + durable configuration storage for cpstats.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cpstats_core::{ConfigRecord, InvalidUsername, PlatformConfig};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpstats-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|source| HttpError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::HttpStatus { status, .. } => Some(*status),
            HttpError::Request(err) => err.status().map(|s| s.as_u16()),
            HttpError::Decode { .. } => None,
        }
    }
}

/// Shared reqwest client with a global in-flight request limit. One attempt per call.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    /// GET without judging the status code; callers that need to read error bodies use this.
    pub async fn get_raw(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        self.send(self.client.get(url), "GET", url).await
    }

    pub async fn get(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        ensure_success(self.get_raw(url).await?)
    }

    pub async fn get_text(&self, url: &str) -> Result<String, HttpError> {
        Ok(self.get(url).await?.text())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, HttpError> {
        self.get(url).await?.json()
    }

    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, HttpError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self.send(self.client.post(url).json(body), "POST", url).await?;
        ensure_success(resp)?.json()
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        method: &'static str,
        url: &str,
    ) -> Result<FetchedResponse, HttpError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let span = info_span!("http_fetch", method, url);
        async move {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "upstream responded");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

fn ensure_success(resp: FetchedResponse) -> Result<FetchedResponse, HttpError> {
    if resp.status.is_success() {
        Ok(resp)
    } else {
        Err(HttpError::HttpStatus {
            status: resp.status.as_u16(),
            url: resp.final_url,
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading configuration {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing configuration {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Invalid(#[from] InvalidUsername),
    #[error("serializing configuration: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("writing configuration {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Durable home of the four usernames. `set` always replaces the whole record.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self) -> Result<PlatformConfig, ConfigError>;
    async fn set(&self, config: &PlatformConfig) -> Result<(), ConfigError>;
}

/// Pretty JSON file holding a [`ConfigRecord`]; missing file reads as the empty configuration.
#[derive(Debug, Clone)]
pub struct JsonFileConfigStore {
    path: PathBuf,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_atomically(&self, bytes: &[u8]) -> Result<(), ConfigError> {
        let write_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ConfigError::Write { path, source }
        };

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(write_err(&parent))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config.json".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(source) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(ConfigError::Write {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonFileConfigStore {
    async fn get(&self) -> Result<PlatformConfig, ConfigError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no stored configuration; using empty");
                return Ok(PlatformConfig::empty());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let record: ConfigRecord =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?;
        Ok(PlatformConfig::from_record(&record)?)
    }

    async fn set(&self, config: &PlatformConfig) -> Result<(), ConfigError> {
        let bytes =
            serde_json::to_vec_pretty(&config.to_record()).map_err(ConfigError::Serialize)?;
        self.write_atomically(&bytes).await?;
        debug!(path = %self.path.display(), "configuration persisted");
        Ok(())
    }
}

/// Process-local store for one-shot runs that must not touch the persisted configuration.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    current: Mutex<PlatformConfig>,
}

impl MemoryConfigStore {
    pub fn new(initial: PlatformConfig) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self) -> Result<PlatformConfig, ConfigError> {
        Ok(self.current.lock().await.clone())
    }

    async fn set(&self, config: &PlatformConfig) -> Result<(), ConfigError> {
        *self.current.lock().await = config.clone();
        Ok(())
    }
}
