//! Reference image retrieval by URI.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use rollcall_core::{BackendError, ImageFetcher};

use crate::StoreError;

/// Fetches `http(s)://` URIs over HTTP and `file://` URIs or bare paths
/// from the local filesystem.
pub struct UriImageFetcher {
    timeout: Duration,
    // Built on first use so construction is safe inside an async runtime.
    client: OnceLock<reqwest::blocking::Client>,
}

impl UriImageFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, StoreError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        Ok(self.client.get_or_init(|| client))
    }

    fn fetch_http(&self, uri: &str) -> Result<Vec<u8>, StoreError> {
        let response = self.client()?.get(uri).send()?.error_for_status()?;
        Ok(response.bytes()?.to_vec())
    }
}

impl ImageFetcher for UriImageFetcher {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>, BackendError> {
        let result = match classify(uri) {
            UriKind::Http => self.fetch_http(uri),
            UriKind::File(path) => std::fs::read(path).map_err(StoreError::from),
        };
        result.map_err(|e| BackendError::Fetch {
            uri: uri.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum UriKind<'a> {
    Http,
    File(&'a Path),
}

fn classify(uri: &str) -> UriKind<'_> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        UriKind::Http
    } else if let Some(path) = uri.strip_prefix("file://") {
        UriKind::File(Path::new(path))
    } else {
        UriKind::File(Path::new(uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("https://cdn/x.jpg"), UriKind::Http);
        assert_eq!(classify("http://cdn/x.jpg"), UriKind::Http);
        assert_eq!(classify("file:///srv/x.jpg"), UriKind::File(Path::new("/srv/x.jpg")));
        assert_eq!(classify("refs/x.jpg"), UriKind::File(Path::new("refs/x.jpg")));
    }

    #[test]
    fn test_fetch_file_uri() {
        let path = std::env::temp_dir().join(format!("rollcall-fetch-{}.bin", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"jpeg-bytes").unwrap();

        let fetcher = UriImageFetcher::new(Duration::from_secs(1));
        let bytes = fetcher.fetch(&format!("file://{}", path.display())).unwrap();
        assert_eq!(bytes, b"jpeg-bytes");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_fetch_missing_file_reports_uri() {
        let fetcher = UriImageFetcher::new(Duration::from_secs(1));
        let err = fetcher.fetch("/definitely/not/here.jpg").unwrap_err();
        match err {
            BackendError::Fetch { uri, .. } => assert_eq!(uri, "/definitely/not/here.jpg"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
