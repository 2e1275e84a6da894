//! Document store client
//!
//! Fetches report PDFs with `GET {base}/api/reports/{id}/pdf`. Transport
//! errors and 500/502/503/504 are retried with exponential backoff; any other
//! non-success status fails immediately.

use crate::error::AttachmentError;
use async_trait::async_trait;
use reqwest::{header, Client};
use std::time::Duration;
use studylink_common::config::DocumentStoreSettings;
use tracing::{debug, warn};

/// Source of report PDFs
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// PDF bytes for a report, `Ok(None)` when the store has none
    async fn fetch_report(&self, report_id: i64) -> Result<Option<Vec<u8>>, AttachmentError>;
}

/// Statuses worth retrying
pub fn is_transient(status: u16) -> bool {
    matches!(status, 500 | 502 | 503 | 504)
}

/// HTTP document store
pub struct HttpDocumentStore {
    http_client: Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: u32,
    base_backoff: Duration,
}

impl HttpDocumentStore {
    /// Build from settings; `Ok(None)` when no base URL is configured
    pub fn from_settings(settings: &DocumentStoreSettings) -> Result<Option<Self>, AttachmentError> {
        let Some(base_url) = settings
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return Ok(None);
        };

        let http_client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(|e| AttachmentError::Transport(format!("HTTP client: {}", e)))?;

        Ok(Some(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone().filter(|k| !k.trim().is_empty()),
            max_retries: settings.max_retries,
            base_backoff: Duration::from_millis(settings.backoff_base_ms),
        }))
    }

    fn report_url(&self, report_id: i64) -> String {
        format!("{}/api/reports/{}/pdf", self.base_url, report_id)
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, AttachmentError> {
        let mut request = self
            .http_client
            .get(url)
            .header(header::ACCEPT, "application/pdf");
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key.trim());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttachmentError::Status(status.as_u16()));
        }
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn fetch_report(&self, report_id: i64) -> Result<Option<Vec<u8>>, AttachmentError> {
        let url = self.report_url(report_id);
        let mut last = AttachmentError::Transport("no attempt made".to_string());

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_backoff.saturating_mul(2u32.saturating_pow(attempt - 1));
                tokio::time::sleep(delay).await;
            }

            match self.fetch_once(&url).await {
                Ok(bytes) if bytes.is_empty() => {
                    debug!(report_id, "Document store returned an empty body");
                    return Ok(None);
                }
                Ok(bytes) => {
                    debug!(report_id, size = bytes.len(), "Fetched report PDF");
                    return Ok(Some(bytes));
                }
                Err(AttachmentError::Status(status)) if !is_transient(status) => {
                    warn!(report_id, status, attempt = attempt + 1, "Report PDF fetch rejected");
                    return Err(AttachmentError::Status(status));
                }
                Err(e) => {
                    warn!(
                        report_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Report PDF fetch failed, will retry if attempts remain"
                    );
                    last = e;
                }
            }
        }

        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve canned (status, body) replies in order, one per connection
    async fn serve(replies: Vec<(u16, &'static [u8])>) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            for (status, body) in replies {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                counter.fetch_add(1, Ordering::SeqCst);
                let head = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/pdf\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), hits)
    }

    fn settings(base_url: String) -> DocumentStoreSettings {
        DocumentStoreSettings {
            base_url: Some(base_url),
            api_key: Some("secret".into()),
            timeout_secs: 5,
            max_retries: 2,
            backoff_base_ms: 0,
        }
    }

    #[test]
    fn test_transient_statuses() {
        for status in [500, 502, 503, 504] {
            assert!(is_transient(status));
        }
        for status in [400, 401, 404, 501] {
            assert!(!is_transient(status));
        }
    }

    #[test]
    fn test_unconfigured_store_is_none() {
        let store = HttpDocumentStore::from_settings(&DocumentStoreSettings::default()).unwrap();
        assert!(store.is_none());
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let (base, hits) = serve(vec![(503, &b""[..]), (200, &b"%PDF-1.4"[..])]).await;
        let store = HttpDocumentStore::from_settings(&settings(base)).unwrap().unwrap();

        let bytes = store.fetch_report(42).await.unwrap();
        assert_eq!(bytes.as_deref(), Some(&b"%PDF-1.4"[..]));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_transient_status_is_not_retried() {
        let (base, hits) = serve(vec![(404, &b""[..]), (200, &b"%PDF"[..])]).await;
        let store = HttpDocumentStore::from_settings(&settings(base)).unwrap().unwrap();

        let err = store.fetch_report(42).await.unwrap_err();
        assert!(matches!(err, AttachmentError::Status(404)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
