use anyhow::{Context, Result, anyhow};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Public endpoint of the Cloud Storage JSON API
pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

const TOKEN_VARS: [&str; 2] = ["GCS_OAUTH_TOKEN", "GOOGLE_OAUTH_ACCESS_TOKEN"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectItem {
    name: String,
}

/// Minimal blocking client for the Cloud Storage JSON API.
///
/// Requests are async `reqwest` calls driven by an owned tokio runtime, so the
/// client must not be used from inside another runtime.
pub struct GcsClient {
    client: Client,
    runtime: tokio::runtime::Runtime,
    endpoint: String,
    token: Option<String>,
}

impl GcsClient {
    /// Create a client from the environment.
    ///
    /// `STORAGE_EMULATOR_HOST` overrides the endpoint; the bearer token is read
    /// from `GCS_OAUTH_TOKEN` or `GOOGLE_OAUTH_ACCESS_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var("STORAGE_EMULATOR_HOST")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|host| normalize_endpoint(&host))
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let token = TOKEN_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|s| !s.is_empty()));
        if token.is_none() {
            log::warn!("No Cloud Storage token found in {:?}; sending unauthenticated requests", TOKEN_VARS);
        }
        Self::new(endpoint, token)
    }

    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
        Ok(Self {
            client,
            runtime,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/storage/v1/b/{}/o", self.endpoint, bucket))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("endpoint {} cannot be a base URL", self.endpoint))?
            .push(key);
        Ok(url)
    }

    /// Upload a local file to `gs://bucket/key`
    pub fn upload_file(&self, bucket: &str, key: &str, src: &Path) -> Result<()> {
        let url = format!("{}/upload/storage/v1/b/{}/o", self.endpoint, bucket);
        self.runtime.block_on(async {
            let body = tokio::fs::read(src)
                .await
                .with_context(|| format!("Failed to read {}", src.display()))?;
            let response = self
                .authorize(self.client.post(&url))
                .query(&[("uploadType", "media"), ("name", key)])
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body)
                .send()
                .await?;
            check_status(response.status(), &format!("upload gs://{}/{}", bucket, key))?;
            log::debug!("Uploaded {} to gs://{}/{}", src.display(), bucket, key);
            Ok::<(), anyhow::Error>(())
        })
    }

    /// Contents of `gs://bucket/key`
    pub fn read_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let url = self.object_url(bucket, key)?;
        self.runtime.block_on(async {
            let response = self
                .authorize(self.client.get(url))
                .query(&[("alt", "media")])
                .send()
                .await?;
            check_status(response.status(), &format!("download gs://{}/{}", bucket, key))?;
            let bytes = response.bytes().await?;
            Ok::<Vec<u8>, anyhow::Error>(bytes.to_vec())
        })
    }

    /// Download `gs://bucket/key` into `dest`, creating parent directories
    pub fn download_object(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        let bytes = self.read_object(bucket, key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, &bytes).with_context(|| format!("Failed to write {}", dest.display()))?;
        log::debug!("Downloaded gs://{}/{} ({} bytes)", bucket, key, bytes.len());
        Ok(())
    }

    /// Names of every object whose key starts with `prefix`
    pub fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let url = format!("{}/storage/v1/b/{}/o", self.endpoint, bucket);
        self.runtime.block_on(async {
            let mut names = Vec::new();
            let mut page_token: Option<String> = None;
            loop {
                let mut request = self
                    .authorize(self.client.get(&url))
                    .query(&[("prefix", prefix), ("fields", "items(name),nextPageToken")]);
                if let Some(token) = &page_token {
                    request = request.query(&[("pageToken", token.as_str())]);
                }
                let response = request.send().await?;
                check_status(response.status(), &format!("list gs://{}/{}", bucket, prefix))?;
                let page: ObjectList = response.json().await?;
                names.extend(page.items.into_iter().map(|item| item.name));
                match page.next_page_token {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }
            Ok::<Vec<String>, anyhow::Error>(names)
        })
    }
}

/// Emulator hosts are often given as `host:port`; those are plain HTTP
fn normalize_endpoint(host: &str) -> String {
    if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

fn check_status(status: StatusCode, action: &str) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(crate::SentimentError::Storage(format!("failed to {}: HTTP {}", action, status)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::testing::FakeGcs;

    #[test]
    fn test_object_url_escapes_slashes() {
        let client = GcsClient::new("http://localhost:4443/", None).unwrap();
        let url = client.object_url("bucket", "runs/CNN/model.safetensors").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:4443/storage/v1/b/bucket/o/runs%2FCNN%2Fmodel.safetensors"
        );
    }

    #[test]
    fn test_check_status() {
        assert!(check_status(StatusCode::OK, "x").is_ok());
        let err = check_status(StatusCode::FORBIDDEN, "upload gs://b/k").unwrap_err();
        assert!(err.to_string().contains("403"));
    }

    #[test]
    fn test_emulator_host_without_scheme() {
        assert_eq!(normalize_endpoint("localhost:4443"), "http://localhost:4443");
        assert_eq!(normalize_endpoint("https://gcs.internal"), "https://gcs.internal");
        let client = GcsClient::new(normalize_endpoint("localhost:4443"), None).unwrap();
        assert!(client.object_url("b", "k").is_ok());
    }

    #[test]
    fn test_upload_then_download() {
        let server = FakeGcs::start();
        let client = server.client();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("model.safetensors");
        fs::write(&src, b"weights").unwrap();

        client.upload_file("reviews", "runs/CNN 1/model.safetensors", &src).unwrap();
        assert_eq!(server.object("reviews", "runs/CNN 1/model.safetensors").unwrap(), b"weights");

        let dest = dir.path().join("fresh").join("model.safetensors");
        client.download_object("reviews", "runs/CNN 1/model.safetensors", &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"weights");

        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path(), "/upload/storage/v1/b/reviews/o");
        assert_eq!(requests[0].query("uploadType").as_deref(), Some("media"));
        assert_eq!(requests[0].query("name").as_deref(), Some("runs/CNN 1/model.safetensors"));
        assert_eq!(requests[1].method, "GET");
        assert_eq!(requests[1].path(), "/storage/v1/b/reviews/o/runs%2FCNN%201%2Fmodel.safetensors");
        assert_eq!(requests[1].query("alt").as_deref(), Some("media"));
    }

    #[test]
    fn test_list_objects_follows_page_tokens() {
        let server = FakeGcs::start();
        for i in 0..5 {
            server.insert("reviews", &format!("checkpoints/w.{:02}.safetensors", i), b"w");
        }
        server.insert("reviews", "logs/train_logs.csv", b"l");
        let client = server.client();

        let names = client.list_objects("reviews", "checkpoints/").unwrap();
        assert_eq!(names.len(), 5);
        assert_eq!(names[0], "checkpoints/w.00.safetensors");
        assert_eq!(names[4], "checkpoints/w.04.safetensors");

        let requests = server.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.path() == "/storage/v1/b/reviews/o"));
        assert!(requests.iter().all(|r| r.query("prefix").as_deref() == Some("checkpoints/")));
        let tokens: Vec<Option<String>> = requests.iter().map(|r| r.query("pageToken")).collect();
        assert_eq!(tokens, vec![None, Some("2".to_string()), Some("4".to_string())]);
    }

    #[test]
    fn test_missing_object_is_storage_error() {
        let server = FakeGcs::start();
        let client = server.client();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing.bin");
        let err = client.download_object("reviews", "nope", &dest).unwrap_err();
        assert!(err.to_string().contains("404"));
        assert!(!dest.exists());
    }
}
