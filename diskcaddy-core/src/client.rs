use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::crc32;

const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("device returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

impl DeviceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::Request(err) if err.is_timeout())
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DeviceError::Api { status, .. } => Some(*status),
            DeviceError::Request(err) => err.status(),
            DeviceError::Url(_) => None,
        }
    }
}

/// Liveness payload of `GET /hello`; absent fields read as zero.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Hello {
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub modified_id: u64,
    #[serde(default)]
    pub modified_count: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DiskRef {
    pub i: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DiskList {
    #[serde(default)]
    pub files: Vec<DiskRef>,
}

#[derive(Clone)]
pub struct DeviceClient {
    http: Client,
    base_url: Url,
    hello_timeout: Duration,
}

impl DeviceClient {
    pub fn new(base_url: &str) -> Result<Self, DeviceError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
        })
    }

    pub fn with_hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    /// Liveness check; bounded by the hello timeout, after which the request is dropped.
    pub async fn hello(&self) -> Result<Hello, DeviceError> {
        let url = self.endpoint("/hello")?;
        let response = self
            .http
            .get(url)
            .header("Cache-Control", "no-store")
            .timeout(self.hello_timeout)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Stages one disk image in the device-side transaction scoped by `nonce`.
    pub async fn add_image(&self, nonce: u64, name: &str, data: Vec<u8>) -> Result<(), DeviceError> {
        let url = self.endpoint("/upload/active/add")?;
        let size = data.len();
        let crc = crc32::checksum(&data);
        let response = self
            .http
            .put(url)
            .header("Content-Type", "application/octet-stream")
            .header("X-Nonce", nonce.to_string())
            .header("X-Image-Size", size.to_string())
            .header("X-CRC32", crc32::header_value(crc))
            .header("X-Image-Name", name)
            .body(data)
            .send()
            .await?;
        Self::expect_success(response).await
    }

    pub async fn commit(&self, nonce: u64) -> Result<(), DeviceError> {
        let url = self.endpoint("/upload/active/commit")?;
        let response = self
            .http
            .post(url)
            .header("X-Nonce", nonce.to_string())
            .send()
            .await?;
        Self::expect_success(response).await
    }

    pub async fn list_active(&self) -> Result<DiskList, DeviceError> {
        self.get_json("/active/list").await
    }

    pub async fn download_active(&self, index: u32) -> Result<Vec<u8>, DeviceError> {
        let url = self.endpoint(&format!("/active/download/{index}"))?;
        self.get_bytes(url).await
    }

    pub async fn list_modified(&self) -> Result<DiskList, DeviceError> {
        self.get_json("/modified/list").await
    }

    pub async fn download_modified(&self, index: u32, name: &str) -> Result<Vec<u8>, DeviceError> {
        let mut url = self.endpoint(&format!("/modified/download/{index}"))?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .push(name);
        self.get_bytes(url).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, DeviceError> {
        Ok(self.base_url.join(path)?)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, DeviceError> {
        let url = self.endpoint(path)?;
        let response = self
            .http
            .get(url)
            .header("Cache-Control", "no-store")
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn get_bytes(&self, url: Url) -> Result<Vec<u8>, DeviceError> {
        let response = self
            .http
            .get(url)
            .header("Cache-Control", "no-store")
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.bytes().await?.to_vec())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn expect_success(response: reqwest::Response) -> Result<(), DeviceError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DeviceError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> DeviceError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        DeviceError::Api { status, body }
    }
}
