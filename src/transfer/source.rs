//! Where upload parts come from

use crate::error::{Result, StratusError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Persistable description of a transfer's local side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceDescriptor {
    /// Local file: the upload source or the download destination
    File { path: PathBuf, size: u64 },
    /// Caller-managed data; the caller must supply it again on resume
    Opaque { size: u64 },
}

impl SourceDescriptor {
    pub fn size(&self) -> u64 {
        match self {
            SourceDescriptor::File { size, .. } | SourceDescriptor::Opaque { size } => *size,
        }
    }

    /// Reopen the source for a resumed upload
    pub async fn open(&self) -> Result<Arc<dyn PartSource>> {
        match self {
            SourceDescriptor::File { path, size } => {
                let source = FileSource::open(path).await?;
                if source.size() != *size {
                    return Err(StratusError::InvalidTransferState(format!(
                        "{} changed size since the transfer began ({} -> {} bytes)",
                        path.display(),
                        size,
                        source.size()
                    )));
                }
                Ok(Arc::new(source))
            }
            SourceDescriptor::Opaque { .. } => Err(StratusError::InvalidTransferState(
                "transfer source is caller-managed and cannot be reopened".to_string(),
            )),
        }
    }
}

/// Random-access source of upload data
#[async_trait]
pub trait PartSource: Send + Sync + fmt::Debug {
    /// Total size in bytes
    fn size(&self) -> u64;

    fn descriptor(&self) -> SourceDescriptor;

    /// Read exactly `length` bytes starting at `offset`
    async fn read_part(&self, offset: u64, length: u64) -> Result<Bytes>;
}

/// In-memory source
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Bytes,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl PartSource for BytesSource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor::Opaque { size: self.size() }
    }

    async fn read_part(&self, offset: u64, length: u64) -> Result<Bytes> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= self.size())
            .ok_or_else(|| {
                StratusError::Io(format!(
                    "range {}+{} is outside a {} byte source",
                    offset,
                    length,
                    self.size()
                ))
            })?;
        Ok(self.data.slice(offset as usize..end as usize))
    }
}

/// Local file; every read opens its own handle so parts can be read
/// concurrently
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let size = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PartSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor::File {
            path: self.path.clone(),
            size: self.size,
        }
    }

    async fn read_part(&self, offset: u64, length: u64) -> Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; length as usize];
        file.read_exact(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }
}
