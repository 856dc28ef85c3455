use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::errors::{Result, TransferError};
use crate::local::{LocalSink, LocalSource};

/// Identity of a queued transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ItemId(Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of whoever fired an event (a worker or a queue)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(Uuid);

impl SenderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SenderId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SenderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file the server already knows about
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteFileRef {
    pub id: String,
    pub name: String,
}

impl RemoteFileRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Server metadata returned after an upload
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteFile {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub encryption: Option<String>,
    #[serde(default)]
    pub uploaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseEnvelope<T> {
    pub data: T,
}

impl RemoteFile {
    /// Decodes the `{"data": {...}}` body the server answers uploads with.
    pub fn from_response(body: &[u8]) -> crate::errors::Result<Self> {
        let envelope: ResponseEnvelope<RemoteFile> = serde_json::from_slice(body)?;
        Ok(envelope.data)
    }
}

#[derive(Debug, Clone)]
pub struct UploadItem {
    pub source: LocalSource,
    /// Remote folder or path; filled from the queue default when absent
    pub target: Option<String>,
    /// Upload as new content of this file instead of creating one
    pub existing: Option<RemoteFileRef>,
    pub public: bool,
    pub create_version: bool,
    pub encryption: Option<String>,
}

impl UploadItem {
    pub fn new(source: LocalSource) -> Self {
        Self {
            source,
            target: None,
            existing: None,
            public: false,
            create_version: false,
            encryption: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn replacing(mut self, existing: RemoteFileRef, create_version: bool) -> Self {
        self.existing = Some(existing);
        self.create_version = create_version;
        self
    }

    pub fn public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    pub fn encrypted(mut self, algorithm: impl Into<String>) -> Self {
        self.encryption = normalize_algorithm(algorithm.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct DownloadItem {
    pub file: RemoteFileRef,
    pub version: Option<String>,
    /// Local destination; filled from the queue default folder when absent
    pub target: Option<LocalSink>,
    pub encryption: Option<String>,
}

impl DownloadItem {
    pub fn new(file: RemoteFileRef) -> Self {
        Self {
            file,
            version: None,
            target: None,
            encryption: None,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn to(mut self, target: LocalSink) -> Self {
        self.target = Some(target);
        self
    }

    pub fn encrypted(mut self, algorithm: impl Into<String>) -> Self {
        self.encryption = normalize_algorithm(algorithm.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum TransferKind {
    Upload(UploadItem),
    Download(DownloadItem),
}

/// One requested upload or download
#[derive(Debug, Clone)]
pub struct TransferItem {
    pub id: ItemId,
    pub kind: TransferKind,
}

impl TransferItem {
    pub fn upload(item: UploadItem) -> Self {
        Self {
            id: ItemId::new(),
            kind: TransferKind::Upload(item),
        }
    }

    pub fn download(item: DownloadItem) -> Self {
        Self {
            id: ItemId::new(),
            kind: TransferKind::Download(item),
        }
    }

    pub fn encryption(&self) -> Option<&str> {
        match &self.kind {
            TransferKind::Upload(item) => item.encryption.as_deref(),
            TransferKind::Download(item) => item.encryption.as_deref(),
        }
    }

    /// Human readable destination, as reported in progress events.
    pub fn target_label(&self) -> Option<String> {
        match &self.kind {
            TransferKind::Upload(item) => item.target.clone(),
            TransferKind::Download(item) => item.target.as_ref().map(|sink| sink.to_string()),
        }
    }

    /// Human readable origin, as reported in progress events.
    pub fn source_label(&self) -> String {
        match &self.kind {
            TransferKind::Upload(item) => item.source.to_string(),
            TransferKind::Download(item) => item.file.id.clone(),
        }
    }

    /// Fills in a missing destination, using `folder` both as the remote
    /// upload folder and as the local download folder.
    pub fn apply_default_target(&mut self, folder: &str) -> Result<()> {
        self.apply_default_targets(folder, Some(Path::new(folder)))
    }

    /// Fills in a missing destination.
    ///
    /// Uploads replacing an existing remote file keep their destination.
    /// Downloads land in `local_folder` under the base name of the remote
    /// file, and are left alone when there is no local folder.
    pub fn apply_default_targets(&mut self, remote_folder: &str, local_folder: Option<&Path>) -> Result<()> {
        match &mut self.kind {
            TransferKind::Upload(item) => {
                if item.existing.is_none() && item.target.is_none() {
                    item.target = Some(remote_folder.to_string());
                }
            }
            TransferKind::Download(item) => {
                let Some(folder) = local_folder else {
                    return Ok(());
                };
                if item.target.is_none() {
                    // Server supplied; never let it leave the folder
                    let name = Path::new(&item.file.name)
                        .file_name()
                        .ok_or_else(|| TransferError::InvalidItem(format!("unusable file name: {:?}", item.file.name)))?;
                    item.target = Some(LocalSink::File(folder.join(name)));
                }
            }
        }

        Ok(())
    }
}

fn normalize_algorithm(algorithm: String) -> Option<String> {
    let trimmed = algorithm.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
