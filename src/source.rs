use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Invalid location '{location}': {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("HTTP {status} fetching {location}")]
    Status { location: String, status: u16 },

    #[error("Network error fetching {location}: {message}")]
    Transport { location: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to read {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
}

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>, FetchError>> + Send + 'a>>;

/// Where catalog manifests and patch payloads come from.
/// Relative locations resolve against the source's base. Fetches are never retried.
pub trait PatchSource: Send + Sync {
    fn describe(&self, location: &str) -> String;

    fn fetch<'a>(&'a self, location: &'a str) -> FetchFuture<'a>;
}

pub struct HttpSource {
    base: reqwest::Url,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(base: &str) -> Result<Self, FetchError> {
        let base = reqwest::Url::parse(base).map_err(|e| FetchError::InvalidLocation {
            location: base.to_string(),
            reason: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("romhack/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport {
                location: base.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { base, client })
    }

    fn resolve(&self, location: &str) -> Result<reqwest::Url, FetchError> {
        self.base
            .join(location)
            .map_err(|e| FetchError::InvalidLocation {
                location: location.to_string(),
                reason: e.to_string(),
            })
    }
}

impl PatchSource for HttpSource {
    fn describe(&self, location: &str) -> String {
        self.resolve(location)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| location.to_string())
    }

    fn fetch<'a>(&'a self, location: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let url = self.resolve(location)?;
            debug!("GET {}", url);
            let transport = |e: reqwest::Error| FetchError::Transport {
                location: url.to_string(),
                message: e.to_string(),
            };
            let response = self.client.get(url.clone()).send().await.map_err(transport)?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    location: url.to_string(),
                    status: status.as_u16(),
                });
            }
            let body = response.bytes().await.map_err(transport)?;
            Ok(body.to_vec())
        })
    }
}

pub struct LocalSource {
    base: PathBuf,
}

impl LocalSource {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn resolve(&self, location: &str) -> PathBuf {
        let path = Path::new(location);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base.join(path)
        }
    }
}

impl PatchSource for LocalSource {
    fn describe(&self, location: &str) -> String {
        self.resolve(location).display().to_string()
    }

    fn fetch<'a>(&'a self, location: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let path = self.resolve(location);
            debug!("Reading {}", path.display());
            tokio::fs::read(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    FetchError::NotFound(path.display().to_string())
                } else {
                    FetchError::Io {
                        location: path.display().to_string(),
                        source: e,
                    }
                }
            })
        })
    }
}

/// Build the source for a catalog location and return the location of the
/// manifest relative to it.
///
/// URLs resolve patch paths against the manifest URL. Local paths may name
/// the manifest file or the directory holding `manifest.json`.
pub fn open_catalog(location: &str) -> Result<(Arc<dyn PatchSource>, String), FetchError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        let source = HttpSource::new(location)?;
        return Ok((Arc::new(source), location.to_string()));
    }

    let path = Path::new(location);
    if path.is_dir() {
        return Ok((
            Arc::new(LocalSource::new(path)),
            crate::config::DEFAULT_MANIFEST_NAME.to_string(),
        ));
    }
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FetchError::InvalidLocation {
            location: location.to_string(),
            reason: "not a file path".into(),
        })?;
    Ok((Arc::new(LocalSource::new(base)), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_fetch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("patches")).unwrap();
        std::fs::write(dir.path().join("patches/a.ips"), b"PATCHEOF").unwrap();

        let source = LocalSource::new(dir.path());
        assert_eq!(source.fetch("patches/a.ips").await.unwrap(), b"PATCHEOF");
        assert!(matches!(
            source.fetch("patches/missing.ips").await,
            Err(FetchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_open_local_catalog() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.json"), b"[]").unwrap();

        let (source, manifest) = open_catalog(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(manifest, "manifest.json");
        assert_eq!(source.fetch(&manifest).await.unwrap(), b"[]");

        let file = dir.path().join("manifest.json");
        let (source, manifest) = open_catalog(file.to_str().unwrap()).unwrap();
        assert_eq!(manifest, "manifest.json");
        assert_eq!(source.fetch(&manifest).await.unwrap(), b"[]");
    }

    #[test]
    fn test_http_resolution() {
        let source = HttpSource::new("https://example.org/docs/manifest.json").unwrap();
        assert_eq!(
            source.describe("patches/crystal.bps"),
            "https://example.org/docs/patches/crystal.bps"
        );
        assert_eq!(
            source.describe("https://example.org/docs/manifest.json"),
            "https://example.org/docs/manifest.json"
        );
        assert!(HttpSource::new("not a url").is_err());
    }
}
