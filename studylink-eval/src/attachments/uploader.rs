//! File upload to the classifier provider's file service

use crate::error::AttachmentError;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use studylink_common::config::ClassifierSettings;
use tracing::debug;

/// Uploads attachment bytes and returns a reusable file id
#[async_trait]
pub trait FileUploader: Send + Sync {
    async fn upload(&self, bytes: &[u8], filename: &str, mime_type: &str) -> Result<String, AttachmentError>;
}

/// `POST {base}/files` multipart uploader (purpose `assistants`)
pub struct HttpFileUploader {
    http_client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    id: String,
}

impl HttpFileUploader {
    /// Shares endpoint and key with the classifier; `Ok(None)` without a key
    pub fn from_settings(settings: &ClassifierSettings) -> Result<Option<Self>, AttachmentError> {
        let Some(api_key) = settings
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
        else {
            return Ok(None);
        };

        let http_client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(|e| AttachmentError::Upload(format!("HTTP client: {}", e)))?;

        Ok(Some(Self {
            http_client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }))
    }
}

#[async_trait]
impl FileUploader for HttpFileUploader {
    async fn upload(&self, bytes: &[u8], filename: &str, mime_type: &str) -> Result<String, AttachmentError> {
        let part = Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime_type)
            .map_err(|e| AttachmentError::Upload(format!("Invalid MIME type {}: {}", mime_type, e)))?;
        let form = Form::new().text("purpose", "assistants").part("file", part);

        let response = self
            .http_client
            .post(format!("{}/files", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AttachmentError::Upload(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttachmentError::Upload(format!("status {}: {}", status.as_u16(), body)));
        }

        let file: UploadedFile = response
            .json()
            .await
            .map_err(|e| AttachmentError::Upload(format!("Upload response: {}", e)))?;
        debug!(filename, file_id = %file.id, "Uploaded attachment");
        Ok(file.id)
    }
}
