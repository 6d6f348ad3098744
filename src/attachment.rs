/// Evidence-file attachments.
///
/// Raw attachment bytes (photos, scans, documents) go through the same
/// storage tiers as record payloads, but are never canonicalized. Each
/// upload yields an [`AttachmentRef`] carrying the locator and the SHA-256
/// of the bytes. The refs are written into the record's `attachments`
/// field before submission, so the record's commitment covers them and
/// verification can check every file transitively.
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::hash;
use crate::error::{AnchorError, Result};
use crate::record::{ContentLocator, Fingerprint, Record, Value};
use crate::storage::TieredStorage;

/// Record field that lists attachment refs.
pub const ATTACHMENTS_FIELD: &str = "attachments";

/// An evidence file waiting to be uploaded.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: None,
            data,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// What a record keeps about one uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub locator: ContentLocator,
    /// SHA-256 of the raw bytes.
    pub fingerprint: Fingerprint,
    pub size: u64,
}

/// Result of one upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadedAttachment {
    #[serde(flatten)]
    pub reference: AttachmentRef,
    pub tier: String,
    pub pinned_on: Option<String>,
}

/// Store one attachment and pin it (best effort).
pub async fn upload(
    storage: &TieredStorage,
    attachment: &Attachment,
) -> Result<UploadedAttachment> {
    if attachment.name.trim().is_empty() {
        return Err(AnchorError::Encoding("attachment name is empty".into()));
    }

    let placement = storage.put(&attachment.data).await?;
    let pinned_on = match storage.pin(&placement.locator).await {
        Ok(tier) => Some(tier),
        Err(e) => {
            warn!(locator = %placement.locator, error = %e, "Attachment pin failed");
            None
        }
    };

    info!(
        name = %attachment.name,
        locator = %placement.locator,
        tier = %placement.tier,
        size = attachment.data.len(),
        "Attachment stored"
    );

    Ok(UploadedAttachment {
        reference: AttachmentRef {
            name: attachment.name.clone(),
            content_type: attachment.content_type.clone(),
            locator: placement.locator,
            fingerprint: hash::fingerprint(&attachment.data),
            size: attachment.data.len() as u64,
        },
        tier: placement.tier,
        pinned_on,
    })
}

/// Upload several attachments concurrently. Fails on the first error;
/// files already stored stay in storage but are not referenced anywhere.
pub async fn upload_all(
    storage: &TieredStorage,
    attachments: &[Attachment],
) -> Result<Vec<UploadedAttachment>> {
    try_join_all(attachments.iter().map(|a| upload(storage, a))).await
}

impl TryFrom<&AttachmentRef> for Value {
    type Error = AnchorError;

    fn try_from(reference: &AttachmentRef) -> Result<Self> {
        serde_json::to_value(reference)
            .and_then(serde_json::from_value)
            .map_err(|e| AnchorError::Encoding(e.to_string()))
    }
}

/// Append refs to the record's `attachments` list, creating it if absent.
pub fn attach(record: &mut Record, refs: &[AttachmentRef]) -> Result<()> {
    if refs.is_empty() {
        return Ok(());
    }
    let mut list = match record.get(ATTACHMENTS_FIELD) {
        None => Vec::new(),
        Some(Value::List(items)) => items.clone(),
        Some(_) => {
            return Err(AnchorError::Encoding(format!(
                "field '{ATTACHMENTS_FIELD}' is not a list"
            )))
        }
    };
    for reference in refs {
        list.push(Value::try_from(reference)?);
    }
    record.insert(ATTACHMENTS_FIELD, Value::List(list));
    Ok(())
}

/// Refs listed in a record. Empty when the record has none.
pub fn attachments_of(record: &Record) -> Result<Vec<AttachmentRef>> {
    let Some(value) = record.get(ATTACHMENTS_FIELD) else {
        return Ok(Vec::new());
    };
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(|e| AnchorError::Encoding(format!("field '{ATTACHMENTS_FIELD}': {e}")))
}
