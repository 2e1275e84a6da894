//! Report attachments
//!
//! [`AttachmentProvider::get_or_create`] turns a report id into something the
//! classifier can read:
//! 1. cached file reference, if any
//! 2. fetch the PDF from the document store (nothing there → no attachment)
//! 3. upload it; on success cache and return the file reference
//! 4. otherwise send the bytes inline as base64
//!
//! Every failure degrades to the next option. Nothing here aborts a run.

pub mod document_store;
pub mod uploader;

pub use document_store::{DocumentStore, HttpDocumentStore};
pub use uploader::{FileUploader, HttpFileUploader};

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

pub const PDF_MIME_TYPE: &str = "application/pdf";

/// Attachment as sent to the classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttachmentHandle {
    /// Previously uploaded file
    FileRef { file_id: String },
    /// Bytes sent with every request
    Inline {
        base64: String,
        mime_type: String,
        filename: String,
    },
}

impl AttachmentHandle {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileRef { .. } => "file_ref",
            Self::Inline { .. } => "inline",
        }
    }
}

/// Cache of uploaded attachments keyed by report id
///
/// Shared across runs; implementations must tolerate concurrent access.
pub trait AttachmentCache: Send + Sync {
    fn get(&self, report_id: i64) -> Option<AttachmentHandle>;

    /// Insert unless an entry exists; returns the entry that is now cached
    fn put(&self, report_id: i64, handle: AttachmentHandle) -> AttachmentHandle;
}

/// Process-local [`AttachmentCache`]
#[derive(Debug, Default)]
pub struct InMemoryAttachmentCache {
    entries: RwLock<HashMap<i64, AttachmentHandle>>,
}

impl InMemoryAttachmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttachmentCache for InMemoryAttachmentCache {
    fn get(&self, report_id: i64) -> Option<AttachmentHandle> {
        let entries = match self.entries.read() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(&report_id).cloned()
    }

    fn put(&self, report_id: i64, handle: AttachmentHandle) -> AttachmentHandle {
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.entry(report_id).or_insert(handle).clone()
    }
}

/// Resolves report ids to classifier attachments
pub struct AttachmentProvider {
    store: Arc<dyn DocumentStore>,
    uploader: Option<Arc<dyn FileUploader>>,
    cache: Arc<dyn AttachmentCache>,
}

impl AttachmentProvider {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        uploader: Option<Arc<dyn FileUploader>>,
        cache: Arc<dyn AttachmentCache>,
    ) -> Self {
        Self {
            store,
            uploader,
            cache,
        }
    }

    /// Attachment for a report, or None when the document store has none
    pub async fn get_or_create(&self, report_id: i64) -> Option<AttachmentHandle> {
        if let Some(cached) = self.cache.get(report_id) {
            debug!(report_id, "Using cached report attachment");
            return Some(cached);
        }

        let bytes = match self.store.fetch_report(report_id).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                info!(report_id, "Document store has no PDF for report");
                return None;
            }
            Err(e) => {
                warn!(report_id, error = %e, "Report PDF fetch failed");
                return None;
            }
        };

        let filename = format!("report_{}.pdf", report_id);

        if let Some(uploader) = &self.uploader {
            match uploader.upload(&bytes, &filename, PDF_MIME_TYPE).await {
                Ok(file_id) => {
                    let handle = self.cache.put(report_id, AttachmentHandle::FileRef { file_id });
                    info!(report_id, kind = handle.kind(), "Report PDF uploaded");
                    return Some(handle);
                }
                Err(e) => {
                    warn!(report_id, error = %e, "Report PDF upload failed, sending inline");
                }
            }
        }

        Some(AttachmentHandle::Inline {
            base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
            mime_type: PDF_MIME_TYPE.to_string(),
            filename,
        })
    }
}
