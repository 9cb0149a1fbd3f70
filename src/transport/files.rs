//! File transports for task attachments that are too large to inline.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};

use crate::config::WebDavConfig;
use crate::error::TransportError;

/// Remote storage addressed by slash-separated relative paths.
#[async_trait]
pub trait FileTransport: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, TransportError>;

    async fn put(&self, path: &str, data: &[u8]) -> Result<(), TransportError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, TransportError>;

    async fn delete(&self, path: &str, ignore_missing: bool) -> Result<(), TransportError>;

    async fn mkdir(&self, path: &str, ignore_existing: bool) -> Result<(), TransportError>;

    /// Copy a remote file to `local`.
    async fn download(&self, path: &str, local: &Path) -> Result<(), TransportError> {
        let data = self.get(path).await?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, data).await?;
        Ok(())
    }
}

/// A directory on a shared filesystem.
#[derive(Debug, Clone)]
pub struct LocalDirTransport {
    root: PathBuf,
}

impl LocalDirTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, TransportError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("path escapes transport root: {path}"),
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl FileTransport for LocalDirTransport {
    async fn exists(&self, path: &str) -> Result<bool, TransportError> {
        Ok(tokio::fs::try_exists(self.resolve(path)?).await?)
    }

    async fn put(&self, path: &str, data: &[u8]) -> Result<(), TransportError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, data).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        match tokio::fs::read(self.resolve(path)?).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TransportError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &str, ignore_missing: bool) -> Result<(), TransportError> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if ignore_missing {
                    Ok(())
                } else {
                    Err(TransportError::NotFound(path.to_string()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mkdir(&self, path: &str, ignore_existing: bool) -> Result<(), TransportError> {
        match tokio::fs::create_dir(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if ignore_existing {
                    Ok(())
                } else {
                    Err(TransportError::AlreadyExists(path.to_string()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// A WebDAV collection, authenticated with HTTP basic auth.
pub struct WebDavTransport {
    base_url: String,
    username: String,
    password: SecretString,
    client: reqwest::Client,
}

impl WebDavTransport {
    pub fn new(config: &WebDavConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, TransportError> {
        let mut req = self
            .client
            .request(method, self.url(path))
            .basic_auth(&self.username, Some(self.password.expose_secret()));
        if let Some(body) = body {
            req = req.body(body);
        }
        Ok(req.send().await?)
    }

    fn status_error(method: &str, url: String, status: StatusCode) -> TransportError {
        TransportError::Status {
            method: method.to_string(),
            url,
            status: status.as_u16(),
        }
    }
}

#[async_trait]
impl FileTransport for WebDavTransport {
    async fn exists(&self, path: &str) -> Result<bool, TransportError> {
        let resp = self.send(Method::HEAD, path, None).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Self::status_error("HEAD", self.url(path), s)),
        }
    }

    async fn put(&self, path: &str, data: &[u8]) -> Result<(), TransportError> {
        let resp = self.send(Method::PUT, path, Some(data.to_vec())).await?;
        if !resp.status().is_success() {
            return Err(Self::status_error("PUT", self.url(path), resp.status()));
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        let resp = self.send(Method::GET, path, None).await?;
        match resp.status() {
            s if s.is_success() => Ok(resp.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(TransportError::NotFound(path.to_string())),
            s => Err(Self::status_error("GET", self.url(path), s)),
        }
    }

    async fn delete(&self, path: &str, ignore_missing: bool) -> Result<(), TransportError> {
        let resp = self.send(Method::DELETE, path, None).await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND if ignore_missing => Ok(()),
            StatusCode::NOT_FOUND => Err(TransportError::NotFound(path.to_string())),
            s => Err(Self::status_error("DELETE", self.url(path), s)),
        }
    }

    async fn mkdir(&self, path: &str, ignore_existing: bool) -> Result<(), TransportError> {
        let mkcol = Method::from_bytes(b"MKCOL").map_err(|e| TransportError::Http(e.to_string()))?;
        let resp = self.send(mkcol, path, None).await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            // RFC 4918: MKCOL on an existing resource is 405.
            StatusCode::METHOD_NOT_ALLOWED if ignore_existing => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED => Err(TransportError::AlreadyExists(path.to_string())),
            s => Err(Self::status_error("MKCOL", self.url(path), s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalDirTransport::new(dir.path());

        assert!(!transport.exists("tasks/t1/a.txt").await.unwrap());
        transport.put("tasks/t1/a.txt", b"abc").await.unwrap();
        assert!(transport.exists("tasks/t1/a.txt").await.unwrap());
        assert_eq!(transport.get("tasks/t1/a.txt").await.unwrap(), b"abc");

        transport.delete("tasks/t1/a.txt", false).await.unwrap();
        assert!(matches!(
            transport.delete("tasks/t1/a.txt", false).await,
            Err(TransportError::NotFound(_))
        ));
        transport.delete("tasks/t1/a.txt", true).await.unwrap();
    }

    #[tokio::test]
    async fn local_mkdir_respects_ignore_existing() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalDirTransport::new(dir.path());
        transport.mkdir("batch", false).await.unwrap();
        transport.mkdir("batch", true).await.unwrap();
        assert!(matches!(
            transport.mkdir("batch", false).await,
            Err(TransportError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn local_download_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalDirTransport::new(dir.path().join("remote"));
        transport.put("x.bin", &[1, 2, 3]).await.unwrap();

        let target = dir.path().join("local/copy.bin");
        transport.download("x.bin", &target).await.unwrap();
        assert_eq!(std::fs::read(target).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn local_rejects_parent_components() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalDirTransport::new(dir.path());
        assert!(transport.get("../etc/passwd").await.is_err());
    }

    #[test]
    fn webdav_urls_join_cleanly() {
        let transport = WebDavTransport::new(&WebDavConfig {
            url: "https://dav.example/pool/".into(),
            username: "u".into(),
            password: SecretString::from("p".to_string()),
        });
        assert_eq!(transport.url("/tasks/a"), "https://dav.example/pool/tasks/a");
    }
}
